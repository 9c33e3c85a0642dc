use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::{
    edit_message, get_session_by_cwd, home_dir, load_config, send_message, send_message_get_id,
    send_message_with_keyboard, send_typing_action, Config, HookData, InlineKeyboardButton,
};

// Hooks run inside Claude Code's tool loop. They must never crash the
// agent and never block it: every failure path is a silent exit 0.

fn read_hook_data() -> Option<HookData> {
    let mut raw = Vec::new();
    std::io::stdin().read_to_end(&mut raw).ok()?;
    if raw.is_empty() {
        return None;
    }
    serde_json::from_slice(&raw).ok()
}

fn session_for_cwd(config: &Config, cwd: &str) -> Option<(String, i64)> {
    let found = get_session_by_cwd(config, cwd)?;
    if found.1 == 0 || config.group_id == 0 {
        return None;
    }
    Some(found)
}

fn hook_cache_file(session: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ccc-cache-{session}"))
}

fn hook_msgid_file(session: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ccc-msgid-{session}"))
}

/// Stop hook: the turn ended; send the final assistant message.
pub(crate) fn handle_hook() -> Result<(), Box<dyn std::error::Error>> {
    let Ok(config) = load_config() else {
        eprintln!("hook: no config");
        return Ok(());
    };
    let Some(hook_data) = read_hook_data() else {
        eprintln!("hook: decode error");
        return Ok(());
    };

    eprintln!(
        "hook: cwd={} transcript={}",
        hook_data.cwd, hook_data.transcript_path
    );

    let Some((session_name, topic_id)) = session_for_cwd(&config, &hook_data.cwd) else {
        eprintln!("hook: no session found for cwd={}", hook_data.cwd);
        return Ok(());
    };

    let mut last_message = "Session ended".to_string();
    if !hook_data.transcript_path.is_empty() {
        if let Some(msg) = get_last_assistant_message(&hook_data.transcript_path) {
            last_message = msg;
        }
    }

    // Drop the dedup cache so the next turn's PostToolUse hooks start
    // fresh.
    let _ = fs::remove_file(hook_cache_file(&session_name));
    let _ = fs::remove_file(hook_msgid_file(&session_name));

    let _ = send_message(
        &config,
        config.group_id,
        topic_id,
        &format!("✅ {session_name}\n\n{last_message}"),
    );
    Ok(())
}

/// PermissionRequest hook: AskUserQuestion becomes inline keyboards;
/// anything else becomes a one-line notice.
pub(crate) fn handle_permission_hook() -> Result<(), Box<dyn std::error::Error>> {
    // Claude may invoke this without piping anything; don't hang on a
    // stdin that never closes.
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut raw = Vec::new();
        let _ = std::io::stdin().read_to_end(&mut raw);
        let _ = tx.send(raw);
    });
    let raw = match rx.recv_timeout(Duration::from_secs(2)) {
        Ok(raw) if !raw.is_empty() => raw,
        _ => return Ok(()),
    };

    let Ok(hook_data) = serde_json::from_slice::<HookData>(&raw) else {
        return Ok(());
    };
    let Ok(config) = load_config() else {
        return Ok(());
    };
    let Some((session_name, topic_id)) = session_for_cwd(&config, &hook_data.cwd) else {
        return Ok(());
    };

    eprintln!(
        "hook-permission: tool={} questions={}",
        hook_data.tool_name,
        hook_data.tool_input.questions.len()
    );

    if hook_data.tool_name == "AskUserQuestion" && !hook_data.tool_input.questions.is_empty() {
        send_question_keyboards(&config, &session_name, topic_id, &hook_data);
        return Ok(());
    }

    if !hook_data.tool_name.is_empty() {
        let _ = send_message(
            &config,
            config.group_id,
            topic_id,
            &format!("🔐 Permission requested: {}", hook_data.tool_name),
        );
    }
    Ok(())
}

fn send_question_keyboards(config: &Config, session_name: &str, topic_id: i64, hook_data: &HookData) {
    let total = hook_data.tool_input.questions.len();
    for (q_idx, q) in hook_data.tool_input.questions.iter().enumerate() {
        if q.question.is_empty() {
            continue;
        }
        let msg = format!("❓ {}\n\n{}", q.header, q.question);

        let mut buttons: Vec<Vec<InlineKeyboardButton>> = Vec::new();
        for (i, opt) in q.options.iter().enumerate() {
            if opt.label.is_empty() {
                continue;
            }
            // Telegram caps callback_data at 64 bytes.
            let mut callback_data = format!("{session_name}:{q_idx}:{total}:{i}");
            while callback_data.len() > 64 {
                callback_data.pop();
            }
            buttons.push(vec![InlineKeyboardButton {
                text: opt.label.clone(),
                callback_data,
            }]);
        }

        if buttons.is_empty() {
            let _ = send_message(config, config.group_id, topic_id, &msg);
        } else {
            let _ = send_message_with_keyboard(config, config.group_id, topic_id, &msg, &buttons);
        }
    }
}

/// PreToolUse hook matched on AskUserQuestion.
pub(crate) fn handle_question_hook() -> Result<(), Box<dyn std::error::Error>> {
    let Ok(config) = load_config() else {
        return Ok(());
    };
    let Some(hook_data) = read_hook_data() else {
        return Ok(());
    };
    let Some((session_name, topic_id)) = session_for_cwd(&config, &hook_data.cwd) else {
        return Ok(());
    };

    send_question_keyboards(&config, &session_name, topic_id, &hook_data);
    Ok(())
}

/// UserPromptSubmit hook: echo the prompt into the topic and snapshot the
/// transcript so stale assistant text is not re-sent later.
pub(crate) fn handle_prompt_hook() -> Result<(), Box<dyn std::error::Error>> {
    let Ok(config) = load_config() else {
        eprintln!("hook-prompt: no config");
        return Ok(());
    };
    let Some(hook_data) = read_hook_data() else {
        eprintln!("hook-prompt: decode error");
        return Ok(());
    };
    if hook_data.prompt.is_empty() {
        eprintln!("hook-prompt: empty prompt");
        return Ok(());
    }

    let Some((session_name, topic_id)) = session_for_cwd(&config, &hook_data.cwd) else {
        eprintln!("hook-prompt: no topic found for cwd={}", hook_data.cwd);
        return Ok(());
    };

    if !hook_data.transcript_path.is_empty() {
        if let Some(msg) = get_last_assistant_message(&hook_data.transcript_path) {
            let _ = fs::write(hook_cache_file(&session_name), msg);
        }
    }

    send_typing_action(&config, config.group_id, topic_id);

    eprintln!("hook-prompt: sending to topic {topic_id}");
    let _ = send_message(
        &config,
        config.group_id,
        topic_id,
        &format!("💬 {}", hook_data.prompt),
    );
    Ok(())
}

/// Pre/PostToolUse hook: mirror the latest assistant message, editing in
/// place while the same turn keeps growing.
pub(crate) fn handle_output_hook() -> Result<(), Box<dyn std::error::Error>> {
    let Ok(config) = load_config() else {
        return Ok(());
    };
    let Some(hook_data) = read_hook_data() else {
        return Ok(());
    };
    let Some((session_name, topic_id)) = session_for_cwd(&config, &hook_data.cwd) else {
        return Ok(());
    };
    if hook_data.transcript_path.is_empty() {
        return Ok(());
    }
    let Some(msg) = get_last_assistant_message(&hook_data.transcript_path) else {
        return Ok(());
    };

    let cache_file = hook_cache_file(&session_name);
    let msgid_file = hook_msgid_file(&session_name);
    let last_sent = fs::read_to_string(&cache_file).unwrap_or_default();

    if hook_data.hook_event_name == "PostToolUse" {
        if let Some(msg_id) = fs::read_to_string(&msgid_file)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
        {
            if last_sent != msg {
                let _ = fs::write(&cache_file, &msg);
                let _ = edit_message(&config, config.group_id, msg_id, topic_id, &msg);
            }
            return Ok(());
        }
    }

    if last_sent == msg {
        return Ok(());
    }
    let _ = fs::write(&cache_file, &msg);

    if let Ok(msg_id) = send_message_get_id(&config, config.group_id, topic_id, &msg) {
        if msg_id > 0 {
            let _ = fs::write(&msgid_file, msg_id.to_string());
        }
    }
    Ok(())
}

pub(crate) fn handle_notification_hook() -> Result<(), Box<dyn std::error::Error>> {
    let Ok(config) = load_config() else {
        return Ok(());
    };
    let Some(hook_data) = read_hook_data() else {
        return Ok(());
    };
    if hook_data.notification.is_empty() {
        return Ok(());
    }
    let Some((_, topic_id)) = session_for_cwd(&config, &hook_data.cwd) else {
        return Ok(());
    };

    let _ = send_message(
        &config,
        config.group_id,
        topic_id,
        &format!("🔔 {}", hook_data.notification),
    );
    Ok(())
}

/// Last assistant text block in a Claude Code transcript (JSONL).
pub(crate) fn get_last_assistant_message(transcript_path: &str) -> Option<String> {
    let file = fs::File::open(transcript_path).ok()?;
    let reader = BufReader::new(file);

    let mut last_message: Option<String> = None;
    for line in reader.lines() {
        let Ok(line) = line else { continue };
        let Ok(entry) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };
        if entry["type"] != "assistant" {
            continue;
        }
        let Some(content) = entry["message"]["content"].as_array() else {
            continue;
        };
        for block in content {
            if block["type"] == "text" {
                if let Some(text) = block["text"].as_str() {
                    last_message = Some(text.to_string());
                }
            }
        }
    }
    last_message
}

// ── settings.json install ───────────────────────────────────────────────

fn claude_settings_path() -> PathBuf {
    home_dir().join(".claude").join("settings.json")
}

fn is_ccc_hook(entry: &serde_json::Value) -> bool {
    if let Some(cmd) = entry.get("command").and_then(|c| c.as_str()) {
        return cmd.contains("ccc hook");
    }
    if let Some(hooks) = entry.get("hooks").and_then(|h| h.as_array()) {
        return hooks.iter().any(|h| {
            h.get("command")
                .and_then(|c| c.as_str())
                .map(|cmd| cmd.contains("ccc hook"))
                .unwrap_or(false)
        });
    }
    false
}

fn remove_ccc_hooks(hook_array: &[serde_json::Value]) -> Vec<serde_json::Value> {
    hook_array
        .iter()
        .filter(|entry| !is_ccc_hook(entry))
        .cloned()
        .collect()
}

fn hook_entry(command: String, matcher: &str) -> serde_json::Value {
    serde_json::json!({
        "hooks": [{"command": command, "type": "command"}],
        "matcher": matcher,
    })
}

/// Install our hook entries into ~/.claude/settings.json, replacing any
/// previous ccc entries but leaving everything else untouched.
pub(crate) fn install_hook() -> Result<(), Box<dyn std::error::Error>> {
    let settings_path = claude_settings_path();
    let ccc = home_dir().join("bin").join("ccc").display().to_string();

    let data = fs::read(&settings_path).map_err(|e| format!("failed to read settings.json: {e}"))?;
    let mut settings: serde_json::Value =
        serde_json::from_slice(&data).map_err(|e| format!("failed to parse settings.json: {e}"))?;

    let hooks = settings
        .as_object_mut()
        .ok_or("settings.json is not an object")?
        .entry("hooks")
        .or_insert_with(|| serde_json::json!({}));
    let hooks = hooks.as_object_mut().ok_or("hooks is not an object")?;

    let ccc_hooks: Vec<(&str, Vec<serde_json::Value>)> = vec![
        ("Stop", vec![hook_entry(format!("{ccc} hook"), "")]),
        (
            "Notification",
            vec![hook_entry(format!("{ccc} hook-notification"), "")],
        ),
        (
            "PermissionRequest",
            vec![hook_entry(format!("{ccc} hook-permission"), "")],
        ),
        (
            "PostToolUse",
            vec![hook_entry(format!("{ccc} hook-output"), "")],
        ),
        (
            "PreToolUse",
            vec![
                hook_entry(format!("{ccc} hook-question"), "AskUserQuestion"),
                hook_entry(format!("{ccc} hook-output"), ""),
            ],
        ),
        (
            "UserPromptSubmit",
            vec![hook_entry(format!("{ccc} hook-prompt"), "")],
        ),
    ];

    for (hook_type, new_hooks) in ccc_hooks {
        let existing = hooks
            .get(hook_type)
            .and_then(|v| v.as_array())
            .map(|arr| remove_ccc_hooks(arr))
            .unwrap_or_default();
        let mut merged = new_hooks;
        merged.extend(existing);
        hooks.insert(hook_type.to_string(), serde_json::Value::Array(merged));
    }

    let new_data = serde_json::to_vec_pretty(&settings)?;
    fs::write(&settings_path, new_data).map_err(|e| format!("failed to write settings.json: {e}"))?;

    println!("✅ Claude hooks installed!");
    Ok(())
}

pub(crate) fn uninstall_hook() -> Result<(), Box<dyn std::error::Error>> {
    let settings_path = claude_settings_path();

    let data = fs::read(&settings_path).map_err(|e| format!("failed to read settings.json: {e}"))?;
    let mut settings: serde_json::Value =
        serde_json::from_slice(&data).map_err(|e| format!("failed to parse settings.json: {e}"))?;

    let Some(hooks) = settings.get_mut("hooks").and_then(|h| h.as_object_mut()) else {
        println!("No hooks found");
        return Ok(());
    };

    for hook_type in [
        "Stop",
        "Notification",
        "PermissionRequest",
        "PostToolUse",
        "PreToolUse",
        "UserPromptSubmit",
    ] {
        if let Some(existing) = hooks.get(hook_type).and_then(|v| v.as_array()) {
            let filtered = remove_ccc_hooks(existing);
            if filtered.is_empty() {
                hooks.remove(hook_type);
            } else {
                hooks.insert(hook_type.to_string(), serde_json::Value::Array(filtered));
            }
        }
    }

    let new_data = serde_json::to_vec_pretty(&settings)?;
    fs::write(&settings_path, new_data).map_err(|e| format!("failed to write settings.json: {e}"))?;

    println!("✅ Claude hooks uninstalled!");
    Ok(())
}

// ── skill manifest ──────────────────────────────────────────────────────

const SKILL_CONTENT: &str = r#"# CCC Send - File Transfer Skill

## Description
Send files to the user via Telegram using the ccc send command.

## Usage
When the user asks you to send them a file, or when you have generated/built a file that the user needs (like an APK, binary, or any other file), use this command:

```bash
ccc send <file_path>
```

## How it works
- **Small files (< 50MB)**: Sent directly via Telegram
- **Large files (≥ 50MB)**: Streamed via relay server with a one-time download link

## Examples

### Send a built APK
```bash
ccc send ./build/app.apk
```

### Send a generated file
```bash
ccc send ./output/report.pdf
```

### Send from subdirectory
```bash
ccc send ~/Downloads/large-file.zip
```

## Important Notes
- The command detects the current session from your working directory
- For large files, the command will wait up to 10 minutes for the user to download
- Each download link is one-time use only
- Use this proactively when you've created files the user needs!
"#;

pub(crate) fn install_skill() -> Result<(), Box<dyn std::error::Error>> {
    let skill_dir = home_dir().join(".claude").join("skills");
    fs::create_dir_all(&skill_dir).map_err(|e| format!("failed to create skills directory: {e}"))?;
    fs::write(skill_dir.join("ccc-send.md"), SKILL_CONTENT)
        .map_err(|e| format!("failed to write skill file: {e}"))?;
    println!("✅ CCC send skill installed!");
    Ok(())
}

pub(crate) fn uninstall_skill() {
    let _ = fs::remove_file(home_dir().join(".claude").join("skills").join("ccc-send.md"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ccc_hook_direct_and_wrapped() {
        let direct = serde_json::json!({"command": "/home/u/bin/ccc hook", "type": "command"});
        assert!(is_ccc_hook(&direct));

        let wrapped = serde_json::json!({
            "hooks": [{"command": "/home/u/bin/ccc hook-output", "type": "command"}],
            "matcher": "",
        });
        assert!(is_ccc_hook(&wrapped));

        let other = serde_json::json!({
            "hooks": [{"command": "notify-send done", "type": "command"}],
            "matcher": "",
        });
        assert!(!is_ccc_hook(&other));
    }

    #[test]
    fn test_remove_ccc_hooks_keeps_foreign_entries() {
        let entries = vec![
            serde_json::json!({"command": "ccc hook", "type": "command"}),
            serde_json::json!({"command": "other-tool run", "type": "command"}),
        ];
        let filtered = remove_ccc_hooks(&entries);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["command"], "other-tool run");
    }

    #[test]
    fn test_get_last_assistant_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"type":"user","message":{"content":[{"type":"text","text":"hi"}]}}"#,
                "\n",
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"first"}]}}"#,
                "\n",
                "not json at all\n",
                r#"{"type":"assistant","message":{"content":[{"type":"tool_use"},{"type":"text","text":"final answer"}]}}"#,
                "\n",
            ),
        )
        .unwrap();

        let msg = get_last_assistant_message(path.to_str().unwrap());
        assert_eq!(msg.as_deref(), Some("final answer"));
    }

    #[test]
    fn test_get_last_assistant_message_missing_file() {
        assert!(get_last_assistant_message("/nonexistent/transcript.jsonl").is_none());
    }

    #[test]
    fn test_callback_data_length_cap() {
        let session = "a-session-name-that-is-really-quite-long-for-a-callback";
        let mut callback_data = format!("{session}:2:4:1");
        while callback_data.len() > 64 {
            callback_data.pop();
        }
        assert!(callback_data.len() <= 64);
        assert!(callback_data.starts_with("a-session"));
    }
}
