use std::collections::HashSet;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::{
    acquire_instance_lock, answer_callback_query, claude_path, create_forum_topic,
    edit_message_remove_keyboard, execute_command, get_session_by_topic, home_dir,
    load_config, panic_message, parse_callback_data, poll_updates_raw, resolve_project_path,
    save_config, send_message, send_typing_action, set_bot_commands, strip_bot_mention,
    transcribe_audio, update_ccc, Config, Message, SessionInfo, Update, UpdateResponse,
};

const CLAUDE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

// At-most-one agent run per session. Lock-or-store latch: losers get the
// busy acknowledgement and their message is discarded.
static BUSY_SESSIONS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn busy_sessions() -> std::sync::MutexGuard<'static, HashSet<String>> {
    BUSY_SESSIONS.lock().unwrap_or_else(|e| e.into_inner())
}

struct BusyGuard {
    name: String,
}

impl BusyGuard {
    /// Claim the session; None when a run is already in flight.
    fn try_claim(name: &str) -> Option<BusyGuard> {
        if busy_sessions().insert(name.to_string()) {
            Some(BusyGuard {
                name: name.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        busy_sessions().remove(&self.name);
    }
}

/// Run claude non-interactively, resuming the session's conversation.
/// Mints and records a session id on the first run.
fn run_claude_headless(
    config: &Config,
    prompt: &str,
    session_info: &mut SessionInfo,
    work_dir: &str,
) -> (String, bool) {
    let Some(claude) = claude_path() else {
        return ("Error: claude binary not found".to_string(), false);
    };

    let mut args: Vec<String> = vec![
        "--dangerously-skip-permissions".to_string(),
        "-p".to_string(),
        prompt.to_string(),
    ];
    match &session_info.claude_session_id {
        Some(session_id) if !session_id.is_empty() => {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }
        _ => {
            let session_id = uuid::Uuid::new_v4().to_string();
            session_info.claude_session_id = Some(session_id.clone());
            args.push("--session-id".to_string());
            args.push(session_id);
        }
    }

    let mut cmd = Command::new(claude);
    cmd.args(&args).current_dir(work_dir);

    let oauth_token = if config.oauth_token.is_empty() {
        std::env::var("CLAUDE_CODE_OAUTH_TOKEN").unwrap_or_default()
    } else {
        config.oauth_token.clone()
    };
    if !oauth_token.is_empty() {
        cmd.env("CLAUDE_CODE_OAUTH_TOKEN", oauth_token);
    }

    run_claude_with_timeout(cmd)
}

fn run_claude_with_timeout(mut cmd: Command) -> (String, bool) {
    use std::process::Stdio;
    use std::time::Instant;

    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => return (format!("Error: {err}"), false),
    };

    let start = Instant::now();
    let mut timed_out = false;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {
                if start.elapsed() > CLAUDE_TIMEOUT {
                    let _ = child.kill();
                    timed_out = true;
                    break;
                }
                thread::sleep(Duration::from_millis(200));
            }
            Err(err) => return (format!("Error: {err}"), false),
        }
    }

    let output = match child.wait_with_output() {
        Ok(output) => output,
        Err(err) => return (format!("Error: {err}"), false),
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }
    let combined = combined.trim().to_string();

    if timed_out {
        return (format!("⏱️ Timeout (10min)\n\n{combined}"), false);
    }
    if combined.is_empty() {
        if output.status.success() {
            return ("(no output)".to_string(), true);
        }
        return ("❌ Error: claude exited with error".to_string(), false);
    }
    (combined, output.status.success())
}

/// Run one prompt for a session, guarded by the busy latch, and post the
/// result to its topic.
pub(crate) fn handle_headless_prompt(
    config: &Config,
    sess_name: &str,
    session_info: &SessionInfo,
    prompt: &str,
) {
    let Some(_guard) = BusyGuard::try_claim(sess_name) else {
        if config.group_id != 0 && session_info.topic_id != 0 {
            let _ = send_message(
                config,
                config.group_id,
                session_info.topic_id,
                "⏳ Session busy, wait for current task to finish...",
            );
        }
        return;
    };

    let mut session_info = session_info.clone();

    let work_dir = if session_info.path.is_empty() {
        resolve_project_path(config, sess_name)
    } else {
        session_info.path.clone()
    };
    if !Path::new(&work_dir).exists() {
        let _ = fs::create_dir_all(&work_dir);
    }

    if config.group_id != 0 && session_info.topic_id != 0 {
        send_typing_action(config, config.group_id, session_info.topic_id);
    }

    let had_session_id = session_info
        .claude_session_id
        .as_deref()
        .map(|s| !s.is_empty())
        .unwrap_or(false);

    println!(
        "[headless] Running claude for session '{sess_name}' (resume={})",
        session_info.claude_session_id.as_deref().unwrap_or("")
    );

    let (output, _success) = run_claude_headless(config, prompt, &mut session_info, &work_dir);

    // Persist a freshly minted session id. Reload first: another session
    // may have written config since we loaded ours, and this writer only
    // owns one field.
    if !had_session_id && session_info.claude_session_id.is_some() {
        if let Ok(mut fresh_config) = load_config() {
            if let Some(si) = fresh_config.sessions.get_mut(sess_name) {
                si.claude_session_id = session_info.claude_session_id.clone();
                let _ = save_config(&fresh_config);
            }
        }
    }

    if config.group_id != 0 && session_info.topic_id != 0 {
        let _ = send_message(
            config,
            config.group_id,
            session_info.topic_id,
            &format!("✅ Done\n\n{output}"),
        );
    }
}

/// `ccc headless-start <name> <path> <prompt>`: create the session and
/// run one prompt synchronously.
pub(crate) fn headless_start(name: &str, path: &str, prompt: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config().map_err(|_| "not configured. Run: ccc setup <bot_token>")?;
    if config.group_id == 0 {
        return Err("no group configured".into());
    }

    let session_info = match config.sessions.get_mut(name) {
        Some(info) => {
            info.path = path.to_string();
            let info = info.clone();
            save_config(&config)?;
            info
        }
        None => {
            let topic_id = create_forum_topic(&config, name)?;
            let info = SessionInfo {
                topic_id,
                path: path.to_string(),
                claude_session_id: None,
            };
            config.sessions.insert(name.to_string(), info.clone());
            save_config(&config)?;
            println!("Created session '{name}' with topic");
            info
        }
    };

    let _ = send_message(
        &config,
        config.group_id,
        session_info.topic_id,
        &format!("🚀 Session '{name}' started (headless-start)\n\n💬 {prompt}"),
    );

    println!("Running prompt in session '{name}'...");
    handle_headless_prompt(&config, name, &session_info, prompt);
    println!("Prompt completed for session '{name}'. Continue via Telegram.");
    Ok(())
}

fn spawn_headless_prompt(config: &Config, sess_name: String, session_info: SessionInfo, prompt: String) {
    let config = config.clone();
    thread::spawn(move || {
        let result = catch_unwind(AssertUnwindSafe(|| {
            handle_headless_prompt(&config, &sess_name, &session_info, &prompt);
        }));
        if let Err(panic_info) = result {
            eprintln!("[headless] panic: {}", panic_message(panic_info));
        }
    });
}

/// The non-interactive dispatch loop: same long poll as `listen`, but
/// every message becomes a `claude -p` run instead of tmux keystrokes.
pub(crate) fn run_headless() -> Result<(), Box<dyn std::error::Error>> {
    let _lock_file = acquire_instance_lock(".ccc-headless.lock")?;

    let mut config = load_config().map_err(|_| "not configured. Run: ccc setup <bot_token>")?;

    println!(
        "Headless bot listening... (chat: {}, group: {})",
        config.chat_id, config.group_id
    );
    println!("Active sessions: {}", config.sessions.len());
    if !config.oauth_token.is_empty() {
        println!("OAuth token: configured");
    } else if std::env::var("CLAUDE_CODE_OAUTH_TOKEN").is_ok() {
        println!("OAuth token: from environment");
    } else {
        println!("OAuth token: NOT SET (claude may fail to authenticate)");
    }
    println!("Press Ctrl+C to stop");

    set_bot_commands(&config.bot_token);

    let mut offset = 0i64;
    loop {
        let body = match poll_updates_raw(&config.bot_token, offset) {
            Ok(body) => body,
            Err(err) => {
                eprintln!("Network error: {err} (retrying...)");
                thread::sleep(Duration::from_secs(5));
                continue;
            }
        };
        let updates: UpdateResponse = match serde_json::from_str(&body) {
            Ok(u) => u,
            Err(err) => {
                eprintln!("Parse error: {err}");
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };
        if !updates.ok {
            eprintln!("Telegram API error: {}", updates.description);
            thread::sleep(Duration::from_secs(5));
            continue;
        }

        for update in updates.result {
            offset = update.update_id + 1;

            let origin = update
                .message
                .as_ref()
                .map(|m| (m.chat.id, m.message_thread_id));
            let result = catch_unwind(AssertUnwindSafe(|| {
                handle_headless_update(&mut config, update, offset);
            }));
            if let Err(panic_info) = result {
                let detail = panic_message(panic_info);
                eprintln!("panic in headless update handler: {detail}");
                if let Some((chat_id, thread_id)) = origin {
                    let _ = send_message(&config, chat_id, thread_id, &format!("💥 Panic: {detail}"));
                }
            }
        }
    }
}

fn handle_headless_update(config: &mut Config, update: Update, offset: i64) {
    if let Some(cb) = update.callback_query {
        if cb.from.id != config.chat_id {
            return;
        }
        answer_callback_query(config, &cb.id);

        // No tmux menus here: the selection goes to claude as text.
        let Some((sess_name, _q_idx, _total, opt_idx)) = parse_callback_data(&cb.data) else {
            return;
        };
        if let Some(cb_msg) = &cb.message {
            let new_text = format!("{}\n\n✓ Selected option {}", cb_msg.text, opt_idx + 1);
            edit_message_remove_keyboard(config, cb_msg.chat.id, cb_msg.message_id, &new_text);
        }
        if let Some(session_info) = config.sessions.get(&sess_name) {
            let option_text = format!("I select option {}", opt_idx + 1);
            spawn_headless_prompt(config, sess_name, session_info.clone(), option_text);
        }
        return;
    }

    let Some(msg) = update.message else {
        return;
    };
    if msg.from.id != config.chat_id {
        return;
    }

    let chat_id = msg.chat.id;
    let thread_id = msg.message_thread_id;
    let is_group = msg.chat.kind == "supergroup";

    if msg.voice.is_some() && is_group && thread_id > 0 {
        handle_headless_voice(config, &msg, chat_id, thread_id);
        return;
    }
    if !msg.photo.is_empty() && is_group && thread_id > 0 {
        handle_headless_photo(config, &msg, chat_id, thread_id);
        return;
    }

    let text = strip_bot_mention(msg.text.trim());
    if text.is_empty() {
        return;
    }

    println!("[headless][{}] @{}: {text}", msg.chat.kind, msg.from.username);

    if let Some(cmd_str) = text.strip_prefix("/c ") {
        let (output, err) = execute_command(cmd_str);
        let reply = match err {
            Some(err) => format!("⚠️ {output}\n\nExit: {err}"),
            None => output,
        };
        let _ = send_message(config, chat_id, thread_id, &reply);
        return;
    }
    if text == "/update" {
        update_ccc(config, chat_id, thread_id, offset);
        return;
    }

    if text.starts_with("/new") && is_group {
        handle_headless_new(config, chat_id, thread_id, text.strip_prefix("/new").unwrap_or("").trim());
        return;
    }

    // Message in a topic runs claude for that session.
    if is_group && thread_id > 0 {
        if let Ok(fresh) = load_config() {
            *config = fresh;
        }
        let Some(sess_name) = get_session_by_topic(config, thread_id) else {
            let _ = send_message(
                config,
                chat_id,
                thread_id,
                "⚠️ No session linked to this topic. Use /new <name> to create one.",
            );
            return;
        };
        if let Some(session_info) = config.sessions.get(&sess_name) {
            spawn_headless_prompt(config, sess_name, session_info.clone(), text);
        }
        return;
    }

    // Private chat: one-shot.
    if !is_group {
        let _ = send_message(config, chat_id, 0, "🤖 Running Claude (headless)...");

        let mut prompt = text.clone();
        if let Some(reply) = &msg.reply_to_message {
            if !reply.text.is_empty() {
                if let Some(first_word) = reply.text.split_whitespace().next() {
                    if home_dir().join(first_word).is_dir() {
                        prompt = format!("{first_word} {text}");
                    }
                }
                prompt = format!("Original message:\n{}\n\nReply:\n{prompt}", reply.text);
            }
        }

        let config = config.clone();
        thread::spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(|| {
                let (output, _) = crate::run_claude_oneshot(&prompt);
                let _ = send_message(&config, chat_id, 0, &output);
            }));
            if let Err(panic_info) = result {
                let _ = send_message(&config, chat_id, 0, &format!("💥 Panic: {}", panic_message(panic_info)));
            }
        });
    }
}

fn handle_headless_new(config: &mut Config, chat_id: i64, thread_id: i64, arg: &str) {
    if let Ok(fresh) = load_config() {
        *config = fresh;
    }

    if !arg.is_empty() {
        if config.sessions.contains_key(arg) {
            let _ = send_message(
                config,
                chat_id,
                thread_id,
                &format!("⚠️ Session '{arg}' already exists. Use /new without args in that topic to restart."),
            );
            return;
        }
        let topic_id = match create_forum_topic(config, arg) {
            Ok(id) => id,
            Err(err) => {
                let _ = send_message(config, chat_id, thread_id, &format!("❌ Failed to create topic: {err}"));
                return;
            }
        };
        let work_dir = resolve_project_path(config, arg);
        if !Path::new(&work_dir).exists() {
            let _ = fs::create_dir_all(&work_dir);
        }
        config.sessions.insert(
            arg.to_string(),
            SessionInfo {
                topic_id,
                path: work_dir,
                claude_session_id: None,
            },
        );
        let _ = save_config(config);
        let _ = send_message(
            config,
            config.group_id,
            topic_id,
            &format!("🚀 Session '{arg}' created (headless)\n\nSend messages here to interact with Claude."),
        );
        return;
    }

    // /new without args: forget the conversation, keep the session.
    if thread_id <= 0 {
        let _ = send_message(config, chat_id, thread_id, "Usage: /new <name> to create a new session");
        return;
    }
    let Some(sess_name) = get_session_by_topic(config, thread_id) else {
        let _ = send_message(
            config,
            chat_id,
            thread_id,
            "❌ No session mapped to this topic. Use /new <name> to create one.",
        );
        return;
    };
    if let Some(info) = config.sessions.get_mut(&sess_name) {
        info.claude_session_id = None;
    }
    let _ = save_config(config);
    let _ = send_message(
        config,
        chat_id,
        thread_id,
        &format!("🚀 Session '{sess_name}' reset (new conversation)"),
    );
}

fn handle_headless_voice(config: &mut Config, msg: &Message, chat_id: i64, thread_id: i64) {
    if let Ok(fresh) = load_config() {
        *config = fresh;
    }
    let Some(sess_name) = get_session_by_topic(config, thread_id) else {
        return;
    };
    let Some(session_info) = config.sessions.get(&sess_name).cloned() else {
        return;
    };
    let Some(voice) = &msg.voice else { return };

    let _ = send_message(config, chat_id, thread_id, "🎤 Transcribing...");
    let audio_path = listen_temp_path("voice", "ogg");
    if let Err(err) = crate::download_telegram_file(config, &voice.file_id, &audio_path) {
        let _ = send_message(config, chat_id, thread_id, &format!("❌ Download failed: {err}"));
        return;
    }
    let transcription = transcribe_audio(config, &audio_path);
    let _ = fs::remove_file(&audio_path);
    match transcription {
        Err(err) => {
            let _ = send_message(config, chat_id, thread_id, &format!("❌ Transcription failed: {err}"));
        }
        Ok(text) if !text.is_empty() => {
            println!("[voice] @{}: {text}", msg.from.username);
            let _ = send_message(config, chat_id, thread_id, &format!("📝 {text}"));
            spawn_headless_prompt(
                config,
                sess_name,
                session_info,
                format!("[Audio transcription, may contain errors]: {text}"),
            );
        }
        Ok(_) => {}
    }
}

fn handle_headless_photo(config: &mut Config, msg: &Message, chat_id: i64, thread_id: i64) {
    if let Ok(fresh) = load_config() {
        *config = fresh;
    }
    let Some(sess_name) = get_session_by_topic(config, thread_id) else {
        return;
    };
    let Some(session_info) = config.sessions.get(&sess_name).cloned() else {
        return;
    };
    let Some(photo) = msg.photo.iter().max_by_key(|p| p.file_size) else {
        return;
    };

    let img_path = listen_temp_path("telegram", "jpg");
    if let Err(err) = crate::download_telegram_file(config, &photo.file_id, &img_path) {
        let _ = send_message(config, chat_id, thread_id, &format!("❌ Download failed: {err}"));
        return;
    }

    let caption = if msg.caption.is_empty() {
        "Analyze this image:"
    } else {
        &msg.caption
    };
    let prompt = format!("{caption} {}", img_path.display());
    let _ = send_message(config, chat_id, thread_id, "📷 Image saved, sending to Claude...");
    spawn_headless_prompt(config, sess_name, session_info, prompt);
}

fn listen_temp_path(prefix: &str, ext: &str) -> std::path::PathBuf {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("{prefix}_{nanos}.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_busy_guard_claim_and_release() {
        let name = "busy-claim-test";
        let guard = BusyGuard::try_claim(name);
        assert!(guard.is_some());
        // Second claim while held fails.
        assert!(BusyGuard::try_claim(name).is_none());
        drop(guard);
        // Released on drop.
        let again = BusyGuard::try_claim(name);
        assert!(again.is_some());
    }

    #[test]
    fn test_busy_guard_independent_sessions() {
        let a = BusyGuard::try_claim("busy-independent-a");
        let b = BusyGuard::try_claim("busy-independent-b");
        assert!(a.is_some());
        assert!(b.is_some());
    }

    #[test]
    fn test_busy_guard_at_most_one_concurrent_winner() {
        let winners = Arc::new(AtomicUsize::new(0));
        let losers = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let winners = winners.clone();
            let losers = losers.clone();
            handles.push(thread::spawn(move || {
                match BusyGuard::try_claim("busy-concurrent-test") {
                    Some(_guard) => {
                        winners.fetch_add(1, Ordering::SeqCst);
                        // Hold the latch long enough for every other
                        // thread to observe it.
                        thread::sleep(Duration::from_millis(200));
                    }
                    None => {
                        losers.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
            thread::sleep(Duration::from_millis(10));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(losers.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_busy_guard_released_on_panic() {
        let name = "busy-panic-test";
        let result = catch_unwind(|| {
            let _guard = BusyGuard::try_claim(name).unwrap();
            panic!("worker died");
        });
        assert!(result.is_err());
        // Drop ran during unwind; the latch is free again.
        assert!(BusyGuard::try_claim(name).is_some());
    }
}
