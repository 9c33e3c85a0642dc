use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::{ccc_path, claude_path, debug_log, load_config, tmux_path};

// Timing for submitting a paste to Claude Code. The double carriage
// return and its pacing track upstream TUI behavior; tune here, not
// inline.
const ENTER_RETRIES: usize = 3;
const ENTER_GAP: Duration = Duration::from_millis(50);
const ENTER_RECHECK: Duration = Duration::from_millis(300);
const READY_INDICATOR: &str = "↵ send";
const SESSION_PREFIX: &str = "claude-";

fn tmux_bin() -> Result<&'static Path, Box<dyn std::error::Error>> {
    tmux_path().ok_or_else(|| "tmux binary not found".into())
}

pub(crate) fn tmux_session_exists(name: &str) -> bool {
    let Some(tmux) = tmux_path() else {
        return false;
    };
    // `=` forces exact matching; a bare target would prefix-match and
    // make `foo` shadow `foo.bar`.
    Command::new(tmux)
        .args(["has-session", "-t", &format!("={name}")])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub(crate) fn create_tmux_session(
    name: &str,
    work_dir: &str,
    continue_session: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let tmux = tmux_bin()?;

    let mut ccc_cmd = format!("{} run", ccc_path().display());
    if continue_session {
        ccc_cmd.push_str(" -c");
    }

    // Start a login shell, not the agent itself: Claude degrades to
    // non-interactive mode without a real TTY, and the session dies with
    // its main process.
    let status = Command::new(tmux)
        .args(["new-session", "-d", "-s", name, "-c", work_dir])
        .status()?;
    if !status.success() {
        return Err(format!("tmux new-session failed for '{name}'").into());
    }

    // Mouse mode allows scrolling the pane from an attached client.
    let _ = Command::new(tmux)
        .args(["set-option", "-t", name, "mouse", "on"])
        .status();

    thread::sleep(Duration::from_millis(200));
    let _ = Command::new(tmux)
        .args(["send-keys", "-t", name, &ccc_cmd, "C-m"])
        .status();

    Ok(())
}

/// Run claude directly with inherited stdio (used inside tmux sessions).
pub(crate) fn run_claude_raw(continue_session: bool) -> Result<(), Box<dyn std::error::Error>> {
    let claude = claude_path().ok_or("claude binary not found")?;

    let mut cmd = Command::new(claude);
    cmd.arg("--dangerously-skip-permissions");
    if continue_session {
        cmd.arg("-c");
    }

    // Make the OAuth token available from config if not already exported.
    if std::env::var("CLAUDE_CODE_OAUTH_TOKEN").is_err() {
        if let Ok(config) = load_config() {
            if !config.oauth_token.is_empty() {
                cmd.env("CLAUDE_CODE_OAUTH_TOKEN", &config.oauth_token);
            }
        }
    }

    let status = cmd.status()?;
    if !status.success() {
        return Err("claude exited with error".into());
    }
    Ok(())
}

/// Plain-text pane contents; `history_lines > 0` reaches that far into
/// scrollback.
pub(crate) fn capture_pane(session: &str, history_lines: i64) -> Option<String> {
    let tmux = tmux_path()?;
    let mut cmd = Command::new(tmux);
    cmd.args(["capture-pane", "-t", session, "-p"]);
    if history_lines > 0 {
        cmd.args(["-S", &format!("-{history_lines}")]);
    }
    let output = cmd.output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Poll the pane until Claude Code's input prompt appears.
pub(crate) fn wait_for_claude(session: &str, timeout: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(content) = capture_pane(session, 0) {
            if content.contains('❯') {
                return Ok(());
            }
        }
        thread::sleep(Duration::from_millis(500));
    }
    Err("timeout waiting for Claude to start".into())
}

/// Settle delay for a paste: 50ms base + 0.5ms per character, capped at 5s.
pub(crate) fn paste_settle_delay(text_len: usize) -> Duration {
    let delay = Duration::from_millis(50) + Duration::from_micros(text_len as u64 * 500);
    delay.min(Duration::from_secs(5))
}

pub(crate) fn send_to_tmux(session: &str, text: &str) -> Result<(), Box<dyn std::error::Error>> {
    send_to_tmux_with_delay(session, text, paste_settle_delay(text.len()))
}

pub(crate) fn send_to_tmux_with_delay(
    session: &str,
    text: &str,
    delay: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let tmux = tmux_bin()?;

    // Send the text literally.
    let status = Command::new(tmux)
        .args(["send-keys", "-t", session, "-l", text])
        .status()?;
    if !status.success() {
        return Err(format!("tmux send-keys failed for '{session}'").into());
    }

    // Let the paste settle (large pastes, image paths).
    thread::sleep(delay);

    // Wait for the "↵ send" indicator: Claude is ready for Enter.
    for _ in 0..50 {
        if pane_tail_contains(session, READY_INDICATOR) {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    // Claude consumes the first Enter to dismiss an auxiliary affordance
    // and the second to submit. Retry until the indicator clears.
    for attempt in 0..ENTER_RETRIES {
        let _ = Command::new(tmux)
            .args(["send-keys", "-t", session, "C-m"])
            .status();
        thread::sleep(ENTER_GAP);
        let _ = Command::new(tmux)
            .args(["send-keys", "-t", session, "C-m"])
            .status();

        thread::sleep(ENTER_RECHECK);
        if !pane_tail_contains(session, READY_INDICATOR) {
            return Ok(());
        }
        debug_log(
            "tmux",
            format!("send_to_tmux: attempt {} - Enter not processed, retrying", attempt + 1),
        );
    }

    debug_log(
        "tmux",
        format!("send_to_tmux: Enter still not processed after {ENTER_RETRIES} attempts"),
    );
    Ok(())
}

fn pane_tail_contains(session: &str, needle: &str) -> bool {
    capture_pane(session, 3)
        .map(|out| out.contains(needle))
        .unwrap_or(false)
}

pub(crate) fn send_key(session: &str, key: &str) {
    if let Some(tmux) = tmux_path() {
        let _ = Command::new(tmux)
            .args(["send-keys", "-t", session, key])
            .status();
    }
}

pub(crate) fn kill_tmux_session(name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let tmux = tmux_bin()?;
    let status = Command::new(tmux).args(["kill-session", "-t", name]).status()?;
    if !status.success() {
        return Err(format!("tmux kill-session failed for '{name}'").into());
    }
    Ok(())
}

/// List managed sessions, with the `claude-` prefix stripped.
pub(crate) fn list_tmux_sessions() -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let tmux = tmux_bin()?;
    let output = Command::new(tmux)
        .args(["list-sessions", "-F", "#{session_name}"])
        .output()?;
    if !output.status.success() {
        return Err("tmux list-sessions failed".into());
    }

    let sessions = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|name| name.strip_prefix(SESSION_PREFIX).map(str::to_string))
        .collect();
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paste_settle_delay_scales_with_length() {
        assert_eq!(paste_settle_delay(0), Duration::from_millis(50));
        assert_eq!(paste_settle_delay(100), Duration::from_millis(100));
        assert_eq!(paste_settle_delay(1000), Duration::from_millis(550));
    }

    #[test]
    fn test_paste_settle_delay_capped() {
        assert_eq!(paste_settle_delay(100_000), Duration::from_secs(5));
        assert_eq!(paste_settle_delay(usize::MAX / 1000), Duration::from_secs(5));
    }
}
