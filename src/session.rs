use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::{
    create_forum_topic, create_tmux_session, home_dir, kill_tmux_session, load_config,
    resolve_project_path, run_claude_raw, save_config, search_transcriber, send_message,
    send_to_tmux, tmux_path, tmux_session_exists, wait_for_claude, Config, SessionInfo,
};

/// tmux identifier for a logical session. Dots are window/pane separators
/// in tmux targets, so they become underscores; the registry keeps the
/// original name.
pub(crate) fn session_name(name: &str) -> String {
    format!("claude-{}", name.replace('.', "_"))
}

pub(crate) fn create_session(config: &mut Config, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    if config.sessions.contains_key(name) {
        return Err(format!("session '{name}' already exists").into());
    }

    let topic_id = create_forum_topic(config, name).map_err(|e| format!("failed to create topic: {e}"))?;

    let work_dir = resolve_project_path(config, name);
    if !Path::new(&work_dir).exists() {
        fs::create_dir_all(&work_dir)?;
    }

    create_tmux_session(&session_name(name), &work_dir, false)
        .map_err(|e| format!("failed to create tmux session: {e}"))?;

    config.sessions.insert(
        name.to_string(),
        SessionInfo {
            topic_id,
            path: work_dir,
            claude_session_id: None,
        },
    );
    save_config(config).map_err(|e| format!("failed to save config: {e}"))?;
    Ok(())
}

pub(crate) fn kill_session(config: &mut Config, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !config.sessions.contains_key(name) {
        return Err(format!("session '{name}' not found").into());
    }

    let _ = kill_tmux_session(&session_name(name));
    config.sessions.remove(name);
    let _ = save_config(config);
    Ok(())
}

pub(crate) fn get_session_by_topic(config: &Config, topic_id: i64) -> Option<String> {
    config
        .sessions
        .iter()
        .find(|(_, info)| info.topic_id == topic_id)
        .map(|(name, _)| name.clone())
}

/// Resolve a session from a working directory: exact path, a
/// subdirectory of it, or a `/<name>` suffix as fallback.
pub(crate) fn get_session_by_cwd(config: &Config, cwd: &str) -> Option<(String, i64)> {
    config
        .sessions
        .iter()
        .find(|(name, info)| {
            cwd == info.path
                || (!info.path.is_empty() && cwd.starts_with(&format!("{}/", info.path)))
                || cwd.ends_with(&format!("/{name}"))
        })
        .map(|(name, info)| (name.clone(), info.topic_id))
}

/// Start or attach the tmux session for the current directory, creating
/// its Telegram topic on first use.
pub(crate) fn start_session(continue_session: bool) -> Result<(), Box<dyn std::error::Error>> {
    let cwd = std::env::current_dir()?;
    let name = cwd
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "session".to_string());
    let tmux_name = session_name(&name);

    let Ok(mut config) = load_config() else {
        // Not configured yet; just run claude directly.
        return run_claude_raw(continue_session);
    };

    if config.group_id != 0 && !config.sessions.contains_key(&name) {
        if let Ok(topic_id) = create_forum_topic(&config, &name) {
            config.sessions.insert(
                name.clone(),
                SessionInfo {
                    topic_id,
                    path: cwd.to_string_lossy().into_owned(),
                    claude_session_id: None,
                },
            );
            let _ = save_config(&config);
            println!("📱 Created Telegram topic: {name}");
        }
    }

    if !tmux_session_exists(&tmux_name) {
        create_tmux_session(&tmux_name, &cwd.to_string_lossy(), continue_session)?;
    }
    attach_tmux_session(&tmux_name)
}

fn attach_tmux_session(tmux_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let tmux = tmux_path().ok_or("tmux binary not found")?;
    // Inside tmux, switch the client; a nested attach is refused.
    let verb = if std::env::var("TMUX").is_ok() {
        "switch-client"
    } else {
        "attach-session"
    };
    let status = Command::new(tmux).args([verb, "-t", tmux_name]).status()?;
    if !status.success() {
        return Err(format!("tmux {verb} failed").into());
    }
    Ok(())
}

/// `ccc start <name> <work-dir> <prompt>`: create topic + session and
/// submit one prompt via send-keys, without attaching.
pub(crate) fn start_detached(name: &str, work_dir: &str, prompt: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config().map_err(|_| "not configured. Run: ccc setup <bot_token>")?;
    if config.group_id == 0 {
        return Err("no group configured".into());
    }

    let work_dir = if work_dir.is_empty() {
        resolve_project_path(&config, name)
    } else {
        crate::expand_path(work_dir)
    };
    if !Path::new(&work_dir).exists() {
        fs::create_dir_all(&work_dir)?;
    }

    let topic_id = match config.sessions.get_mut(name) {
        Some(info) => {
            info.path = work_dir.clone();
            let topic_id = info.topic_id;
            let _ = save_config(&config);
            topic_id
        }
        None => {
            let topic_id = create_forum_topic(&config, name)?;
            config.sessions.insert(
                name.to_string(),
                SessionInfo {
                    topic_id,
                    path: work_dir.clone(),
                    claude_session_id: None,
                },
            );
            save_config(&config)?;
            println!("Created session '{name}' with topic");
            topic_id
        }
    };

    let tmux_name = session_name(name);
    if !tmux_session_exists(&tmux_name) {
        create_tmux_session(&tmux_name, &work_dir, false)?;
    }

    let _ = send_message(
        &config,
        config.group_id,
        topic_id,
        &format!("🚀 Session '{name}' started\n\n💬 {prompt}"),
    );

    println!("Waiting for Claude in session '{name}'...");
    wait_for_claude(&tmux_name, Duration::from_secs(30))?;
    send_to_tmux(&tmux_name, prompt)?;
    println!("Prompt sent. Continue via Telegram.");
    Ok(())
}

// ── Transcription ───────────────────────────────────────────────────────
//
// Pluggable subprocess: `transcription_cmd` from config, or a whisper CLI
// found on PATH. Contract: audio file in, transcript on stdout.

pub(crate) fn transcribe_audio(config: &Config, audio_path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    let (program, mut args) = if !config.transcription_cmd.is_empty() {
        let mut parts = config.transcription_cmd.split_whitespace();
        let program = parts.next().ok_or("empty transcription_cmd")?.to_string();
        (program, parts.map(str::to_string).collect::<Vec<_>>())
    } else {
        let program = search_transcriber().ok_or(
            "no transcriber found: set transcription_cmd or install whisper-cli",
        )?;
        let mut args = Vec::new();
        if !config.transcription_lang.is_empty() {
            args.push("-l".to_string());
            args.push(config.transcription_lang.clone());
        }
        (program, args)
    };

    args.push(audio_path.to_string_lossy().into_owned());

    let output = Command::new(&program)
        .args(&args)
        .current_dir(home_dir())
        .stdin(Stdio::null())
        .output()
        .map_err(|e| format!("transcriber '{program}' failed to start: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("transcription failed: {}", stderr.trim()).into());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_name_sanitizes_dots() {
        assert_eq!(session_name("myproj"), "claude-myproj");
        assert_eq!(session_name("name.with.dots"), "claude-name_with_dots");
        assert_eq!(session_name("v1.2.3"), "claude-v1_2_3");
    }

    #[test]
    fn test_get_session_by_topic() {
        let mut config = Config::default();
        config.sessions.insert(
            "alpha".to_string(),
            SessionInfo {
                topic_id: 10,
                path: "/tmp/alpha".to_string(),
                claude_session_id: None,
            },
        );
        config.sessions.insert(
            "beta".to_string(),
            SessionInfo {
                topic_id: 20,
                path: "/tmp/beta".to_string(),
                claude_session_id: None,
            },
        );

        assert_eq!(get_session_by_topic(&config, 10), Some("alpha".to_string()));
        assert_eq!(get_session_by_topic(&config, 20), Some("beta".to_string()));
        assert_eq!(get_session_by_topic(&config, 99), None);
    }

    #[test]
    fn test_get_session_by_cwd() {
        let mut config = Config::default();
        config.sessions.insert(
            "proj".to_string(),
            SessionInfo {
                topic_id: 5,
                path: "/home/u/proj".to_string(),
                claude_session_id: None,
            },
        );

        // Exact match and subdirectory match.
        assert_eq!(
            get_session_by_cwd(&config, "/home/u/proj"),
            Some(("proj".to_string(), 5))
        );
        assert_eq!(
            get_session_by_cwd(&config, "/home/u/proj/sub/dir"),
            Some(("proj".to_string(), 5))
        );
        // Sibling with a shared prefix is not a match.
        assert_eq!(get_session_by_cwd(&config, "/home/u/proj2"), None);
        // Suffix fallback on the session name.
        assert_eq!(
            get_session_by_cwd(&config, "/elsewhere/proj"),
            Some(("proj".to_string(), 5))
        );
    }
}
