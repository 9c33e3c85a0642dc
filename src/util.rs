use std::env;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use once_cell::sync::Lazy;

pub(crate) fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

// ── Binary discovery ────────────────────────────────────────────────────
//
// PATH first, then the short list of known install locations. Resolved
// once; the daemon never re-resolves mid-run.

pub(crate) fn search_path(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn find_binary(name: &str, fallbacks: &[PathBuf]) -> Option<PathBuf> {
    if let Some(found) = search_path(name) {
        return Some(found);
    }
    fallbacks.iter().find(|p| p.is_file()).cloned()
}

static TMUX_PATH: Lazy<Option<PathBuf>> = Lazy::new(|| {
    find_binary(
        "tmux",
        &[
            PathBuf::from("/opt/homebrew/bin/tmux"),
            PathBuf::from("/usr/local/bin/tmux"),
            PathBuf::from("/usr/bin/tmux"),
        ],
    )
});

static CCC_PATH: Lazy<PathBuf> = Lazy::new(|| {
    // Prefer ~/bin/ccc (canonical install path), then PATH, then the
    // current executable as last resort.
    let bin_ccc = home_dir().join("bin").join("ccc");
    if bin_ccc.is_file() {
        return bin_ccc;
    }
    if let Some(found) = search_path("ccc") {
        return found;
    }
    env::current_exe().unwrap_or(bin_ccc)
});

static CLAUDE_PATH: Lazy<Option<PathBuf>> = Lazy::new(|| {
    find_binary(
        "claude",
        &[
            home_dir().join(".local").join("bin").join("claude"),
            PathBuf::from("/usr/local/bin/claude"),
        ],
    )
});

pub(crate) fn tmux_path() -> Option<&'static Path> {
    TMUX_PATH.as_deref()
}

pub(crate) fn ccc_path() -> &'static Path {
    &CCC_PATH
}

pub(crate) fn claude_path() -> Option<&'static Path> {
    CLAUDE_PATH.as_deref()
}

/// Whisper-style CLI transcriber from PATH, for when config carries no
/// `transcription_cmd`.
pub(crate) fn search_transcriber() -> Option<String> {
    ["whisper-cli", "whisper-cpp", "whisper"]
        .iter()
        .find_map(|name| search_path(name))
        .map(|p| p.to_string_lossy().into_owned())
}

// ── Debug log ───────────────────────────────────────────────────────────
//
// Append-only JSONL under ~/.ccc/logs, one dated file per day. Best
// effort: logging must never fail a caller.

pub(crate) fn debug_log(area: &str, message: String) {
    let log_dir = home_dir().join(".ccc").join("logs");
    if std::fs::create_dir_all(&log_dir).is_err() {
        return;
    }
    let now = Utc::now();
    let path = log_dir.join(format!("ccc-{}.jsonl", now.format("%Y-%m-%d")));
    let entry = serde_json::json!({
        "ts": now.to_rfc3339(),
        "area": area,
        "message": message,
    });
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(file, "{entry}");
    }
}

pub(crate) fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_len).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exactly10!", 10), "exactly10!");
        assert_eq!(truncate("longer than ten", 10), "longer tha...");
        assert_eq!(truncate("", 10), "");
        assert_eq!(truncate("test", 0), "...");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate("❯❯❯❯❯", 3), "❯❯❯...");
        assert_eq!(truncate("❯❯", 3), "❯❯");
    }

    #[test]
    fn test_ccc_path_always_resolves() {
        // Falls back to the current executable even on a bare system.
        assert!(!ccc_path().as_os_str().is_empty());
    }
}
