use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::{
    capture_pane, debug_log, edit_message, load_config, send_message, send_message_get_id,
    session_name, tmux_session_exists, truncate, Config,
};

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const CAPTURE_HISTORY: i64 = 500;
/// Consecutive unchanged polls required (together with an idle pane)
/// before a turn counts as complete. Two proved premature.
const STABLE_POLLS_FOR_COMPLETION: u32 = 3;
/// Cached block shown before a restart; never re-sent.
const SENTINEL_MSG_ID: i64 = -1;

// Transient spinner glyphs. Upstream renames these between releases;
// extend the table, don't special-case call sites. `✻` is only a status
// glyph when no space follows (with a space it is a bullet).
const STATUS_PREFIXES: [&str; 5] = ["✱", "✢", "✽", "+", "*"];

// Short blocks containing any of these words are spinner text that got
// captured mid-draw, not content.
const STATUS_WORDS: [&str; 12] = [
    "thinking",
    "transfiguring",
    "spinning",
    "sautéed",
    "sauteed",
    "hashing",
    "computing",
    "processing",
    "loading",
    "churned",
    "working",
    "concocting",
];

/// Per-session polling state.
#[allow(dead_code)]
pub(crate) struct SessionMonitor {
    pub(crate) last_blocks: Option<Vec<String>>,
    pub(crate) stable_count: u32,
    pub(crate) completed: bool,
    pub(crate) last_user_message: Instant,
    pub(crate) last_activity: Instant,
}

impl SessionMonitor {
    fn new() -> Self {
        let now = Instant::now();
        SessionMonitor {
            last_blocks: None,
            stable_count: 0,
            completed: false,
            last_user_message: now,
            last_activity: now,
        }
    }
}

static MONITORS: Lazy<Mutex<HashMap<String, SessionMonitor>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn monitors() -> std::sync::MutexGuard<'static, HashMap<String, SessionMonitor>> {
    MONITORS.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Block cache ─────────────────────────────────────────────────────────
//
// Maps terminal blocks to Telegram messages. Content hashes, not
// positions: block insertions would misalign a positional mapping.

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct BlockCache {
    #[serde(default)]
    pub(crate) blocks: Vec<CachedBlock>,
    #[serde(default)]
    pub(crate) hashes: HashMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CachedBlock {
    pub(crate) text: String,
    pub(crate) msg_id: i64,
    #[serde(default)]
    pub(crate) hash: String,
}

fn cache_file(session_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ccc-blocks-{session_name}.json"))
}

/// Hash of the trimmed first 100 bytes of a block, for deduplication.
pub(crate) fn block_hash(text: &str) -> String {
    let normalized = text.trim();
    if normalized.len() <= 100 {
        return normalized.to_string();
    }
    let mut end = 100;
    while !normalized.is_char_boundary(end) {
        end -= 1;
    }
    normalized[..end].to_string()
}

pub(crate) fn load_block_cache(session_name: &str) -> BlockCache {
    let Ok(data) = fs::read(cache_file(session_name)) else {
        return BlockCache::default();
    };
    serde_json::from_slice(&data).unwrap_or_default()
}

pub(crate) fn save_block_cache(session_name: &str, cache: &BlockCache) {
    if let Ok(data) = serde_json::to_vec(cache) {
        let _ = fs::write(cache_file(session_name), data);
    }
}

pub(crate) fn clear_block_cache(session_name: &str) {
    let _ = fs::remove_file(cache_file(session_name));
}

// ── Pane parsing ────────────────────────────────────────────────────────

pub(crate) fn is_bullet_line(trimmed: &str) -> bool {
    trimmed.starts_with('⏺') || trimmed.starts_with("● ") || trimmed.starts_with("✻ ")
}

pub(crate) fn is_status_line(trimmed: &str) -> bool {
    if STATUS_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
        return true;
    }
    // Bare `✻` spinner; `✻ ` opens a block instead.
    trimmed.starts_with('✻') && !trimmed.starts_with("✻ ")
}

/// A short block whose content is a spinner word is transient status, not
/// output.
pub(crate) fn is_status_block(text: &str) -> bool {
    if text.len() >= 50 {
        return false;
    }
    let lower = text.to_lowercase();
    STATUS_WORDS.iter().any(|word| lower.contains(word))
}

pub(crate) fn remove_bullet_prefix(s: &str) -> String {
    // Longer prefixes first so the double-space form wins.
    for prefix in ["⏺  ", "⏺ ", "● ", "✻ ", "⏺"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            return rest.to_string();
        }
    }
    s.to_string()
}

fn prompt_content(trimmed: &str) -> String {
    // Claude Code pads the prompt with non-breaking spaces.
    let content = trimmed.trim_start_matches('❯');
    content.replace('\u{a0}', " ").trim().to_string()
}

/// Capture the pane and extract assistant blocks for the current turn:
/// the most recent user prompt that has at least one block after it.
pub(crate) fn get_last_blocks(tmux_session: &str) -> Vec<String> {
    let Some(output) = capture_pane(tmux_session, CAPTURE_HISTORY) else {
        return Vec::new();
    };
    extract_turn_blocks(&output)
}

pub(crate) fn extract_turn_blocks(pane: &str) -> Vec<String> {
    let lines: Vec<&str> = pane.split('\n').collect();

    // Index the user prompts (❯ with content) and input-box separators.
    // A ❯ directly under a ─── is the live prompt inside the input box,
    // not a turn marker.
    let mut prompts: Vec<usize> = Vec::new();
    let mut input_boxes: Vec<usize> = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("───") {
            input_boxes.push(i);
        } else if trimmed.starts_with('❯') {
            let inside_input_box = i > 0 && input_boxes.contains(&(i - 1));
            if !prompt_content(trimmed).is_empty() && !inside_input_box {
                prompts.push(i);
            }
        }
    }

    if prompts.is_empty() {
        return Vec::new();
    }

    debug_log(
        "parser",
        format!(
            "{} prompts, {} input boxes, {} total lines",
            prompts.len(),
            input_boxes.len(),
            lines.len()
        ),
    );

    // Newest prompt first; fall back to older ones until a range yields
    // blocks.
    for p in (0..prompts.len()).rev() {
        let prompt_idx = prompts[p];
        let end_idx = prompts.get(p + 1).copied().unwrap_or(lines.len());

        debug_log(
            "parser",
            format!(
                "trying prompt {p} at line {prompt_idx} (end {end_idx}): {}",
                truncate(lines[prompt_idx].trim(), 40)
            ),
        );
        let blocks = extract_blocks(&lines, prompt_idx + 1, end_idx);
        debug_log("parser", format!("found {} blocks", blocks.len()));
        if !blocks.is_empty() {
            return blocks;
        }
    }

    Vec::new()
}

/// Extract bullet blocks from `lines[start..end]`. Status lines are
/// skipped without closing the current block; a separator closes the
/// block, and ends extraction entirely when the final input box follows.
pub(crate) fn extract_blocks(lines: &[&str], start: usize, end: usize) -> Vec<String> {
    let mut blocks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_block = false;

    let flush = |current: &mut String, in_block: &mut bool, blocks: &mut Vec<String>| {
        if *in_block && !current.is_empty() {
            blocks.push(current.trim().to_string());
        }
        current.clear();
        *in_block = false;
    };

    for i in start..end.min(lines.len()) {
        let trimmed = lines[i].trim();

        if trimmed.starts_with("───") {
            // Final input box iff an (empty) prompt follows within a few
            // lines. Otherwise this is an intermediate separator (diff
            // boxes draw them); close the block and keep scanning.
            let mut is_final_input_box = false;
            for next in lines.iter().take(end.min(lines.len())).skip(i + 1).take(3) {
                let next_trimmed = next.trim();
                if next_trimmed.is_empty() {
                    continue;
                }
                if next_trimmed.starts_with('❯') {
                    is_final_input_box = true;
                }
                break;
            }
            if is_final_input_box {
                break;
            }
            flush(&mut current, &mut in_block, &mut blocks);
            continue;
        }

        if is_bullet_line(trimmed) {
            flush(&mut current, &mut in_block, &mut blocks);
            current.push_str(&remove_bullet_prefix(trimmed));
            in_block = true;
            continue;
        }

        // Spinners appear during work, interleaved with content; skip
        // without breaking the block.
        if is_status_line(trimmed) {
            continue;
        }

        // Bottom status bar and stray prompts.
        if trimmed.starts_with("⏵⏵") || trimmed.starts_with('❯') {
            continue;
        }

        if in_block {
            if trimmed.is_empty() {
                current.push('\n');
            } else {
                current.push('\n');
                current.push_str(trimmed);
            }
        }
    }

    flush(&mut current, &mut in_block, &mut blocks);
    blocks
}

/// Claude is idle when the tail shows no spinner and an empty `❯` sits
/// after the final input-box separator.
pub(crate) fn is_claude_idle(tmux_session: &str) -> bool {
    let Some(output) = capture_pane(tmux_session, 15) else {
        return false;
    };
    pane_is_idle(&output)
}

pub(crate) fn pane_is_idle(pane: &str) -> bool {
    let lines: Vec<&str> = pane.split('\n').collect();

    let tail_start = lines.len().saturating_sub(10);
    if lines[tail_start..].iter().any(|line| is_status_line(line.trim())) {
        return false;
    }

    let mut found_input_box = false;
    for line in lines.iter().rev() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('❯') && found_input_box {
            return prompt_content(trimmed).is_empty();
        }
        if trimmed.starts_with("───") {
            found_input_box = true;
            continue;
        }
        if found_input_box {
            return false;
        }
    }
    false
}

// ── Sync ────────────────────────────────────────────────────────────────

/// Parse the pane and sync blocks to the session's topic. Returns the
/// number of blocks seen (including status blocks that were dropped).
pub(crate) fn sync_blocks_to_telegram(
    config: &Config,
    sess_name: &str,
    topic_id: i64,
    is_final: bool,
) -> usize {
    let tmux_name = session_name(sess_name);
    let blocks = get_last_blocks(&tmux_name);
    debug_log(
        "sync",
        format!("session={sess_name} blocks={} is_final={is_final}", blocks.len()),
    );
    if blocks.is_empty() {
        return 0;
    }

    let mut cache = load_block_cache(sess_name);
    debug_log(
        "sync",
        format!(
            "session={sess_name} cache_blocks={} hashes={}",
            cache.blocks.len(),
            cache.hashes.len()
        ),
    );

    let mut new_blocks: Vec<CachedBlock> = Vec::with_capacity(blocks.len());

    for (i, block) in blocks.iter().enumerate() {
        if is_status_block(block) {
            debug_log(
                "sync",
                format!("session={sess_name} skipping status block: {}", truncate(block, 30)),
            );
            continue;
        }

        let hash = block_hash(block);
        let display_text = if is_final && i == blocks.len() - 1 {
            format!("✅ {sess_name}\n\n{block}")
        } else {
            block.clone()
        };

        match cache.hashes.get(&hash).copied() {
            Some(SENTINEL_MSG_ID) => {
                // Shown before restart: track, never resend.
                new_blocks.push(CachedBlock {
                    text: block.clone(),
                    msg_id: SENTINEL_MSG_ID,
                    hash,
                });
            }
            Some(existing_msg_id) if existing_msg_id > 0 => {
                // Already sent; edit when the text grew or to apply the
                // completion prefix.
                if let Some(cached) = cache.blocks.iter_mut().find(|b| b.hash == hash) {
                    if cached.text.trim() != block.trim() {
                        cached.text = block.clone();
                        let _ = edit_message(
                            config,
                            config.group_id,
                            existing_msg_id,
                            topic_id,
                            &display_text,
                        );
                    } else if is_final && i == blocks.len() - 1 {
                        let _ = edit_message(
                            config,
                            config.group_id,
                            existing_msg_id,
                            topic_id,
                            &display_text,
                        );
                    }
                }
                new_blocks.push(CachedBlock {
                    text: block.clone(),
                    msg_id: existing_msg_id,
                    hash,
                });
            }
            _ => {
                debug_log(
                    "sync",
                    format!("session={sess_name} sending NEW block {i} hash={}", truncate(&hash, 30)),
                );
                match send_message_get_id(config, config.group_id, topic_id, &display_text) {
                    Ok(msg_id) if msg_id > 0 => {
                        cache.hashes.insert(hash.clone(), msg_id);
                        new_blocks.push(CachedBlock {
                            text: block.clone(),
                            msg_id,
                            hash,
                        });
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug_log(
                            "sync",
                            format!("session={sess_name} ERROR sending block {i}: {err}"),
                        );
                        new_blocks.push(CachedBlock {
                            text: block.clone(),
                            msg_id: 0,
                            hash,
                        });
                    }
                }
            }
        }
    }

    cache.blocks = new_blocks;
    save_block_cache(sess_name, &cache);
    blocks.len()
}

// ── Monitor loop ────────────────────────────────────────────────────────

/// Prepare all live sessions after a restart: seed the cache with the
/// currently visible blocks (sentinel ids) so nothing is re-sent but
/// future changes still diff.
pub(crate) fn initialize_monitors(config: &Config) {
    let mut map = monitors();

    for (sess_name, info) in &config.sessions {
        if info.topic_id == 0 {
            continue;
        }
        let tmux_name = session_name(sess_name);
        if !tmux_session_exists(&tmux_name) {
            continue;
        }

        let current_blocks = get_last_blocks(&tmux_name);
        let idle = is_claude_idle(&tmux_name);

        let mut mon = SessionMonitor::new();
        mon.completed = idle;
        mon.last_blocks = Some(current_blocks.clone());

        let mut cache = load_block_cache(sess_name);
        for block in &current_blocks {
            let hash = block_hash(block);
            if !cache.hashes.contains_key(&hash) {
                cache.hashes.insert(hash.clone(), SENTINEL_MSG_ID);
                cache.blocks.push(CachedBlock {
                    text: block.clone(),
                    msg_id: SENTINEL_MSG_ID,
                    hash,
                });
            }
        }
        save_block_cache(sess_name, &cache);
        debug_log(
            "monitor",
            format!(
                "initialized session={sess_name} blocks={} idle={idle} cache={}",
                current_blocks.len(),
                cache.hashes.len()
            ),
        );

        map.insert(sess_name.clone(), mon);
    }
}

/// Background thread: poll every active tmux session, parse its pane and
/// sync blocks to Telegram. Fixed 3s cadence: adaptive slow-polling
/// demonstrably missed messages.
pub(crate) fn start_session_monitor(config: Config) {
    thread::spawn(move || {
        initialize_monitors(&config);
        loop {
            thread::sleep(POLL_INTERVAL);
            monitor_tick();
        }
    });
}

fn monitor_tick() {
    // Reload to pick up sessions created since the last tick.
    let Ok(config) = load_config() else {
        return;
    };

    for (sess_name, info) in &config.sessions {
        if info.topic_id == 0 || config.group_id == 0 {
            continue;
        }
        let tmux_name = session_name(sess_name);
        if !tmux_session_exists(&tmux_name) {
            continue;
        }

        let first_poll = {
            let mut map = monitors();
            if map.contains_key(sess_name) {
                false
            } else {
                map.insert(sess_name.clone(), SessionMonitor::new());
                true
            }
        };

        let blocks = get_last_blocks(&tmux_name);
        debug_log(
            "monitor",
            format!("session={sess_name} blocks={} first_poll={first_poll}", blocks.len()),
        );

        // A session discovered mid-run with content already on screen:
        // seed without sending, like the restart path.
        if first_poll && !blocks.is_empty() {
            let idle = is_claude_idle(&tmux_name);
            {
                let mut map = monitors();
                if let Some(mon) = map.get_mut(sess_name) {
                    mon.last_blocks = Some(blocks.clone());
                    mon.stable_count = 0;
                    mon.completed = idle;
                }
            }
            let mut cache = load_block_cache(sess_name);
            if cache.blocks.is_empty() {
                for block in &blocks {
                    let hash = block_hash(block);
                    cache.hashes.insert(hash.clone(), SENTINEL_MSG_ID);
                    cache.blocks.push(CachedBlock {
                        text: block.clone(),
                        msg_id: SENTINEL_MSG_ID,
                        hash,
                    });
                }
                save_block_cache(sess_name, &cache);
            }
            debug_log(
                "monitor",
                format!("seeded session={sess_name} with {} existing blocks (idle={idle})", blocks.len()),
            );
            continue;
        }

        if blocks.is_empty() {
            let mut map = monitors();
            if let Some(mon) = map.get_mut(sess_name) {
                if mon.completed {
                    continue;
                }
                mon.last_blocks = None;
                mon.stable_count = 0;
            }
            continue;
        }

        let (changed, should_complete) = {
            let mut map = monitors();
            let Some(mon) = map.get_mut(sess_name) else {
                continue;
            };
            let changed = !blocks_equal(Some(&blocks), mon.last_blocks.as_ref());
            debug_log(
                "monitor",
                format!(
                    "session={sess_name} changed={changed} blocks={} last_blocks={}",
                    blocks.len(),
                    mon.last_blocks.as_ref().map(|b| b.len()).unwrap_or(0)
                ),
            );
            if changed {
                mon.last_blocks = Some(blocks.clone());
                mon.stable_count = 0;
                mon.completed = false;
                mon.last_activity = Instant::now();
            } else {
                mon.stable_count += 1;
            }
            let should_complete = !mon.completed && mon.stable_count >= STABLE_POLLS_FOR_COMPLETION;
            (changed, should_complete)
        };

        if changed {
            sync_blocks_to_telegram(&config, sess_name, info.topic_id, false);
        }

        // Stable long enough AND truly idle: finalize. No wall-clock
        // forcing; the pane is the source of truth.
        if should_complete {
            let idle = is_claude_idle(&tmux_name);
            debug_log(
                "monitor",
                format!("session={sess_name} stable completion check idle={idle}"),
            );
            if idle {
                let n = sync_blocks_to_telegram(&config, sess_name, info.topic_id, true);
                if n == 0 {
                    let _ = send_message(
                        &config,
                        config.group_id,
                        info.topic_id,
                        &format!("✅ {sess_name}"),
                    );
                }
                let mut map = monitors();
                if let Some(mon) = map.get_mut(sess_name) {
                    mon.completed = true;
                }
            }
        }
    }
}

/// A new user message arrived: the session awaits fresh output. Keeps the
/// cache; hash dedup prevents re-sends.
pub(crate) fn reset_session_monitor(sess_name: &str) {
    let mut map = monitors();
    let mon = map.entry(sess_name.to_string()).or_insert_with(SessionMonitor::new);
    mon.completed = false;
    mon.stable_count = 0;
    mon.last_blocks = None;
    mon.last_user_message = Instant::now();
    mon.last_activity = Instant::now();
}

/// Full reset for /new, /continue, /delete: drop monitor state and cache;
/// the next turn starts blank.
pub(crate) fn clear_session_monitor(sess_name: &str) {
    let mut map = monitors();
    map.remove(sess_name);
    drop(map);
    clear_block_cache(sess_name);
}

pub(crate) fn blocks_equal(a: Option<&Vec<String>>, b: Option<&Vec<String>>) -> bool {
    let empty: Vec<String> = Vec::new();
    let a = a.unwrap_or(&empty);
    let b = b.unwrap_or(&empty);
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).all(|(x, y)| x.trim() == y.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_temp_cache_dir<T>(f: impl FnOnce() -> T) -> T {
        // Cache files land in the process temp dir; point it somewhere
        // private for the duration of the test.
        let dir = tempfile::tempdir().unwrap();
        let original = std::env::var_os("TMPDIR");
        std::env::set_var("TMPDIR", dir.path());
        let result = f();
        match original {
            Some(v) => std::env::set_var("TMPDIR", v),
            None => std::env::remove_var("TMPDIR"),
        }
        result
    }

    // ── line classification ─────────────────────────────────────────

    #[test]
    fn test_is_bullet_line() {
        assert!(is_bullet_line("⏺ This is a block"));
        assert!(is_bullet_line("● Another block"));
        assert!(is_bullet_line("✻ Special block"));
        assert!(is_bullet_line("⏺"));
        assert!(is_bullet_line("⏺  Double space"));
        assert!(!is_bullet_line("Normal text"));
        assert!(!is_bullet_line(""));
        assert!(!is_bullet_line("  ⏺ With leading space"));
    }

    #[test]
    fn test_is_status_line() {
        assert!(is_status_line("✱ Hashing..."));
        assert!(is_status_line("✢ Thinking..."));
        assert!(is_status_line("✽ Other status"));
        assert!(is_status_line("✽ Spinning… (32s · ↓ 1.6k tokens · thinking)"));
        assert!(is_status_line("+ Progress"));
        assert!(is_status_line("* Alternative"));
        assert!(is_status_line("✻Spinning"));
        assert!(!is_status_line("✻ bullet form"));
        assert!(!is_status_line("Normal text"));
        assert!(!is_status_line("⏺ Block not status"));
        assert!(!is_status_line(""));
    }

    #[test]
    fn test_is_status_block() {
        assert!(is_status_block("Thinking…"));
        assert!(is_status_block("Sautéed for 3s"));
        assert!(is_status_block("Churned (2s)"));
        assert!(!is_status_block("The fix is loading the config lazily which avoids the race"));
        assert!(!is_status_block("Done."));
    }

    #[test]
    fn test_remove_bullet_prefix() {
        assert_eq!(remove_bullet_prefix("⏺ Text"), "Text");
        assert_eq!(remove_bullet_prefix("⏺  Double space"), "Double space");
        assert_eq!(remove_bullet_prefix("● Text"), "Text");
        assert_eq!(remove_bullet_prefix("✻ Text"), "Text");
        assert_eq!(remove_bullet_prefix("No bullet"), "No bullet");
        assert_eq!(remove_bullet_prefix(""), "");
    }

    #[test]
    fn test_block_hash() {
        assert_eq!(block_hash("hello"), "hello");
        assert_eq!(block_hash("  hello  "), "hello");
        assert_eq!(block_hash(&"a".repeat(100)), "a".repeat(100));
        assert_eq!(block_hash(&"a".repeat(150)), "a".repeat(100));
        assert_eq!(block_hash(""), "");
    }

    #[test]
    fn test_block_hash_multibyte_boundary() {
        // 3-byte chars: truncation must land on a char boundary.
        let text = "⏺".repeat(50);
        let hash = block_hash(&text);
        assert!(hash.len() <= 100);
        assert!(hash.chars().all(|c| c == '⏺'));
    }

    #[test]
    fn test_blocks_equal() {
        let a = vec!["a".to_string(), "b".to_string()];
        let b = vec!["a".to_string(), "b".to_string()];
        assert!(blocks_equal(Some(&a), Some(&b)));
        assert!(blocks_equal(None, None));
        assert!(blocks_equal(None, Some(&Vec::new())));
        let c = vec!["a".to_string(), "c".to_string()];
        assert!(!blocks_equal(Some(&a), Some(&c)));
        let short = vec!["a".to_string()];
        assert!(!blocks_equal(Some(&a), Some(&short)));
        let padded = vec!["  a  ".to_string()];
        assert!(blocks_equal(Some(&padded), Some(&short)));
    }

    // ── extract_blocks ──────────────────────────────────────────────

    #[test]
    fn test_extract_single_block_with_continuation() {
        let lines = vec!["❯ user input", "⏺ Response block", "  continued line"];
        let result = extract_blocks(&lines, 1, 3);
        assert_eq!(result, vec!["Response block\ncontinued line"]);
    }

    #[test]
    fn test_extract_multiple_blocks() {
        let lines = vec!["❯ input", "⏺ First block", "⏺ Second block"];
        let result = extract_blocks(&lines, 1, 3);
        assert_eq!(result, vec!["First block", "Second block"]);
    }

    #[test]
    fn test_extract_skips_status_and_continues() {
        let lines = vec!["❯ input", "⏺ Block before", "✱ Thinking...", "⏺ Block after status"];
        let result = extract_blocks(&lines, 1, 4);
        assert_eq!(result, vec!["Block before", "Block after status"]);
    }

    #[test]
    fn test_extract_stops_at_final_input_box() {
        let lines = vec!["❯ input", "⏺ Block", "────────────────", "❯", "────────────────"];
        let result = extract_blocks(&lines, 1, 5);
        assert_eq!(result, vec!["Block"]);
    }

    #[test]
    fn test_extract_intermediate_separator_closes_block_and_continues() {
        let lines = vec![
            "❯ input",
            "⏺ Block start",
            "────────────────",
            "  continuation",
            "⏺ Next block",
        ];
        let result = extract_blocks(&lines, 1, 5);
        assert_eq!(result, vec!["Block start", "Next block"]);
    }

    #[test]
    fn test_extract_empty_range() {
        let lines = vec!["❯ input"];
        let result = extract_blocks(&lines, 1, 1);
        assert!(result.is_empty());
    }

    #[test]
    fn test_extract_ignores_text_before_first_bullet() {
        let lines = vec!["❯ input", "Some random text", "⏺ Actual block"];
        let result = extract_blocks(&lines, 1, 3);
        assert_eq!(result, vec!["Actual block"]);
    }

    #[test]
    fn test_extract_multiline_block_with_paragraph_break() {
        let lines = vec!["❯ input", "⏺ Block start", "  middle line", "", "  after empty"];
        let result = extract_blocks(&lines, 1, 5);
        assert_eq!(result, vec!["Block start\nmiddle line\n\nafter empty"]);
    }

    #[test]
    fn test_extract_skips_bottom_status_line() {
        let lines = vec!["❯ input", "⏺ Block", "⏵⏵ bypass permissions on"];
        let result = extract_blocks(&lines, 1, 3);
        assert_eq!(result, vec!["Block"]);
    }

    #[test]
    fn test_extract_real_claude_output() {
        let lines = vec![
            "❯ fix the bug",
            "⏺ Looking at the code...",
            "",
            "  I see the issue.",
            "⏺ Read 2 files (ctrl+o to expand)",
            "⏺ The problem is in line 42.",
            "✽ Spinning… (5s)",
            "────────────────",
            "❯",
            "────────────────",
        ];
        let result = extract_blocks(&lines, 1, 10);
        assert_eq!(
            result,
            vec![
                "Looking at the code...\n\nI see the issue.",
                "Read 2 files (ctrl+o to expand)",
                "The problem is in line 42.",
            ]
        );
    }

    #[test]
    fn test_extract_consecutive_bullets() {
        let lines = vec!["❯ input", "⏺ A", "⏺ B", "⏺ C"];
        assert_eq!(extract_blocks(&lines, 1, 4).len(), 3);
    }

    #[test]
    fn test_extract_status_line_at_start() {
        let lines = vec!["❯ input", "✱ Loading...", "⏺ Block"];
        assert_eq!(extract_blocks(&lines, 1, 3), vec!["Block"]);
    }

    #[test]
    fn test_extract_realistic_working_session() {
        let lines = vec![
            "❯ help me refactor this code",
            "",
            "⏺ I'll help you refactor this code. Let me first understand what we're working",
            "  with.",
            "",
            "⏺ Read 3 files (ctrl+o to expand)",
            "",
            "⏺ I can see the code structure. Here's my plan:",
            "",
            "  1. Extract the validation logic",
            "  2. Create a new helper function",
            "  3. Update the tests",
            "",
            "⏺ Let me start with the first change:",
            "",
            "⏺ Edit(main.go)",
            "  ⎿  Updated main.go",
            "",
            "✽ Spinning… (10s · thinking)",
            "",
            "───────────────────────────────────────────",
            "❯",
            "───────────────────────────────────────────",
            "  ⏵⏵ bypass permissions",
        ];

        let result = extract_blocks(&lines, 1, lines.len());
        let expected = vec![
            "I'll help you refactor this code. Let me first understand what we're working\nwith.",
            "Read 3 files (ctrl+o to expand)",
            "I can see the code structure. Here's my plan:\n\n1. Extract the validation logic\n2. Create a new helper function\n3. Update the tests",
            "Let me start with the first change:",
            "Edit(main.go)\n⎿  Updated main.go",
        ];
        assert_eq!(result.len(), expected.len(), "got: {result:?}");
        for (got, want) in result.iter().zip(expected.iter()) {
            assert_eq!(got.trim(), want.trim());
        }
    }

    // ── turn selection ──────────────────────────────────────────────

    #[test]
    fn test_turn_selection_picks_latest_prompt_with_blocks() {
        let pane = [
            "❯ old question",
            "⏺ Old answer",
            "❯ new question",
            "⏺ New answer",
            "────",
            "❯",
            "────",
        ]
        .join("\n");
        assert_eq!(extract_turn_blocks(&pane), vec!["New answer"]);
    }

    #[test]
    fn test_turn_selection_falls_back_to_older_prompt() {
        // The newest prompt has no blocks yet; the previous turn still
        // shows.
        let pane = ["❯ old question", "⏺ Old answer", "❯ new question"].join("\n");
        assert_eq!(extract_turn_blocks(&pane), vec!["Old answer"]);
    }

    #[test]
    fn test_turn_selection_skips_prompt_inside_input_box() {
        // `❯ draft text` sits directly under a separator: that's the
        // live input box, not a submitted turn.
        let pane = ["❯ real question", "⏺ Answer", "────", "❯ draft text", "────"].join("\n");
        assert_eq!(extract_turn_blocks(&pane), vec!["Answer"]);
    }

    #[test]
    fn test_turn_selection_normalizes_nbsp_prompt() {
        // A prompt holding only non-breaking spaces is empty, so it is
        // not a turn marker.
        let pane = ["❯ ask", "⏺ Reply", "❯\u{a0}\u{a0}"].join("\n");
        assert_eq!(extract_turn_blocks(&pane), vec!["Reply"]);
    }

    #[test]
    fn test_turn_selection_no_prompts() {
        let pane = ["⏺ Block without prompt", "still no prompt"].join("\n");
        assert!(extract_turn_blocks(&pane).is_empty());
    }

    // ── idle detection ──────────────────────────────────────────────

    #[test]
    fn test_idle_empty_prompt_after_input_box() {
        let pane = ["⏺ Done with the task.", "────", "❯", "────"].join("\n");
        assert!(pane_is_idle(&pane));
    }

    #[test]
    fn test_not_idle_with_spinner_in_tail() {
        let pane = ["⏺ Working", "✽ Spinning… (3s)", "────", "❯", "────"].join("\n");
        assert!(!pane_is_idle(&pane));
    }

    #[test]
    fn test_not_idle_with_text_in_prompt() {
        let pane = ["⏺ Done", "────", "❯ half-typed message", "────"].join("\n");
        assert!(!pane_is_idle(&pane));
    }

    #[test]
    fn test_idle_nbsp_only_prompt_counts_as_empty() {
        let pane = ["⏺ Done", "────", "❯\u{a0}", "────"].join("\n");
        assert!(pane_is_idle(&pane));
    }

    #[test]
    fn test_not_idle_without_input_box() {
        let pane = ["⏺ Working on it", "more output"].join("\n");
        assert!(!pane_is_idle(&pane));
    }

    // ── cache ───────────────────────────────────────────────────────

    #[test]
    fn test_block_cache_round_trip() {
        with_temp_cache_dir(|| {
            let session = "cache-round-trip";

            let cache = load_block_cache(session);
            assert!(cache.blocks.is_empty());

            let mut cache = BlockCache::default();
            cache.blocks.push(CachedBlock {
                text: "block1".to_string(),
                msg_id: 100,
                hash: "block1".to_string(),
            });
            cache.blocks.push(CachedBlock {
                text: "block2".to_string(),
                msg_id: 200,
                hash: "block2".to_string(),
            });
            cache.hashes.insert("block1".to_string(), 100);
            cache.hashes.insert("block2".to_string(), 200);
            save_block_cache(session, &cache);

            let loaded = load_block_cache(session);
            assert_eq!(loaded.blocks.len(), 2);
            assert_eq!(loaded.blocks[0].text, "block1");
            assert_eq!(loaded.blocks[0].msg_id, 100);
            assert_eq!(loaded.hashes.get("block1"), Some(&100));

            clear_block_cache(session);
            let cleared = load_block_cache(session);
            assert!(cleared.blocks.is_empty());
        });
    }

    #[test]
    fn test_block_cache_invalid_json_returns_empty() {
        with_temp_cache_dir(|| {
            let session = "cache-invalid";
            std::fs::write(cache_file(session), b"not valid json{{{").unwrap();
            let cache = load_block_cache(session);
            assert!(cache.blocks.is_empty());
            clear_block_cache(session);
        });
    }

    #[test]
    fn test_sentinel_invariant() {
        // For every cached block with a real msg_id, hashes must agree.
        let mut cache = BlockCache::default();
        cache.blocks.push(CachedBlock {
            text: "sent".to_string(),
            msg_id: 100,
            hash: block_hash("sent"),
        });
        cache.blocks.push(CachedBlock {
            text: "pre-restart".to_string(),
            msg_id: SENTINEL_MSG_ID,
            hash: block_hash("pre-restart"),
        });
        cache.hashes.insert(block_hash("sent"), 100);
        cache.hashes.insert(block_hash("pre-restart"), SENTINEL_MSG_ID);

        for block in &cache.blocks {
            if block.msg_id > 0 {
                assert_eq!(cache.hashes.get(&block.hash), Some(&block.msg_id));
            }
        }
    }

    // ── monitor state ───────────────────────────────────────────────

    #[test]
    fn test_reset_creates_and_clears_state() {
        let session = "reset-state-test";
        clear_session_monitor(session);

        reset_session_monitor(session);
        {
            let map = monitors();
            let mon = map.get(session).expect("reset should create the monitor");
            assert!(!mon.completed);
            assert!(mon.last_blocks.is_none());
            assert_eq!(mon.stable_count, 0);
        }

        {
            let mut map = monitors();
            let mon = map.get_mut(session).unwrap();
            mon.completed = true;
            mon.stable_count = 10;
            mon.last_blocks = Some(vec!["old".to_string(), "blocks".to_string()]);
        }

        reset_session_monitor(session);
        {
            let map = monitors();
            let mon = map.get(session).unwrap();
            assert!(!mon.completed);
            assert_eq!(mon.stable_count, 0);
            assert!(mon.last_blocks.is_none());
        }
        clear_session_monitor(session);
    }

    #[test]
    fn test_clear_removes_monitor() {
        let session = "clear-state-test";
        reset_session_monitor(session);
        clear_session_monitor(session);
        let map = monitors();
        assert!(!map.contains_key(session));
    }

    #[test]
    fn test_concurrent_reset_and_clear() {
        let mut handles = Vec::new();
        for _ in 0..10 {
            handles.push(std::thread::spawn(|| reset_session_monitor("concurrent-test")));
            handles.push(std::thread::spawn(|| clear_session_monitor("concurrent-test")));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        clear_session_monitor("concurrent-test");
    }
}
