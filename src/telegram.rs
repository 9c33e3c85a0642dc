use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::{Config, InlineKeyboardButton, TelegramResponse, TopicResult};

const MAX_MESSAGE_LEN: usize = 4000;
const MAX_RESPONSE_SIZE: u64 = 10 * 1024 * 1024;
const SPLIT_THROTTLE: Duration = Duration::from_millis(100);

// One agent for all Bot API traffic. The read timeout must outlast the
// 30s long poll.
static HTTP: Lazy<ureq::Agent> = Lazy::new(|| {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(10))
        .timeout_read(Duration::from_secs(35))
        .build()
});

pub(crate) fn http_agent() -> &'static ureq::Agent {
    &HTTP
}

fn api_url(token: &str, method: &str) -> String {
    format!("https://api.telegram.org/bot{token}/{method}")
}

/// The bot token must never reach the user; ureq errors embed the URL.
pub(crate) fn redact_token(message: &str, token: &str) -> String {
    if token.is_empty() {
        return message.to_string();
    }
    message.replace(token, "***")
}

pub(crate) fn telegram_api(
    config: &Config,
    method: &str,
    params: &[(&str, String)],
) -> Result<TelegramResponse, Box<dyn std::error::Error>> {
    let form: Vec<(&str, &str)> = params.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let response = HTTP
        .post(&api_url(&config.bot_token, method))
        .send_form(&form)
        .map_err(|e| redact_token(&e.to_string(), &config.bot_token))?;

    let mut body = String::new();
    response
        .into_reader()
        .take(MAX_RESPONSE_SIZE)
        .read_to_string(&mut body)
        .map_err(|e| redact_token(&e.to_string(), &config.bot_token))?;
    let result: TelegramResponse = serde_json::from_str(&body)?;
    Ok(result)
}

pub(crate) fn send_message(
    config: &Config,
    chat_id: i64,
    thread_id: i64,
    text: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    send_message_get_id(config, chat_id, thread_id, text).map(|_| ())
}

/// Send a message and return its id for later editing. Long texts are
/// split; the id of the last part is returned.
pub(crate) fn send_message_get_id(
    config: &Config,
    chat_id: i64,
    thread_id: i64,
    text: &str,
) -> Result<i64, Box<dyn std::error::Error>> {
    let messages = split_message(text, MAX_MESSAGE_LEN);
    let mut last_msg_id = 0i64;

    for (i, msg) in messages.iter().enumerate() {
        let mut params = vec![
            ("chat_id", chat_id.to_string()),
            ("text", msg.clone()),
        ];
        if thread_id > 0 {
            params.push(("message_thread_id", thread_id.to_string()));
        }

        let result = telegram_api(config, "sendMessage", &params)?;
        if !result.ok {
            return Err(format!("telegram error: {}", result.description).into());
        }
        if let Some(id) = result.result.get("message_id").and_then(|v| v.as_i64()) {
            last_msg_id = id;
        }

        // Keep parts in order.
        if messages.len() > 1 && i < messages.len() - 1 {
            thread::sleep(SPLIT_THROTTLE);
        }
    }
    Ok(last_msg_id)
}

/// Edit an existing message; overflow beyond the length limit is sent as
/// new messages after it.
pub(crate) fn edit_message(
    config: &Config,
    chat_id: i64,
    message_id: i64,
    thread_id: i64,
    text: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let messages = split_message(text, MAX_MESSAGE_LEN);

    let params = vec![
        ("chat_id", chat_id.to_string()),
        ("message_id", message_id.to_string()),
        ("text", messages[0].clone()),
    ];
    let result = telegram_api(config, "editMessageText", &params)?;
    if !result.ok {
        // "message is not modified" and friends are not worth surfacing.
        return Ok(());
    }

    for part in &messages[1..] {
        thread::sleep(SPLIT_THROTTLE);
        let _ = send_message(config, chat_id, thread_id, part);
    }
    Ok(())
}

pub(crate) fn send_message_with_keyboard(
    config: &Config,
    chat_id: i64,
    thread_id: i64,
    text: &str,
    buttons: &[Vec<InlineKeyboardButton>],
) -> Result<(), Box<dyn std::error::Error>> {
    let messages = split_message(text, MAX_MESSAGE_LEN);

    // All but the last part go out plain; the keyboard rides the last one.
    for part in &messages[..messages.len() - 1] {
        let _ = send_message(config, chat_id, thread_id, part);
        thread::sleep(SPLIT_THROTTLE);
    }

    let keyboard = serde_json::json!({ "inline_keyboard": buttons });
    let mut params = vec![
        ("chat_id", chat_id.to_string()),
        ("text", messages[messages.len() - 1].clone()),
        ("reply_markup", keyboard.to_string()),
    ];
    if thread_id > 0 {
        params.push(("message_thread_id", thread_id.to_string()));
    }

    let result = telegram_api(config, "sendMessage", &params)?;
    if !result.ok {
        return Err(format!("telegram error: {}", result.description).into());
    }
    Ok(())
}

pub(crate) fn answer_callback_query(config: &Config, callback_id: &str) {
    let params = vec![("callback_query_id", callback_id.to_string())];
    let _ = telegram_api(config, "answerCallbackQuery", &params);
}

pub(crate) fn edit_message_remove_keyboard(
    config: &Config,
    chat_id: i64,
    message_id: i64,
    new_text: &str,
) {
    let mut text = new_text.to_string();
    if text.len() > MAX_MESSAGE_LEN {
        let mut end = MAX_MESSAGE_LEN - 3;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("...");
    }

    let params = vec![
        ("chat_id", chat_id.to_string()),
        ("message_id", message_id.to_string()),
        ("text", text),
    ];
    let _ = telegram_api(config, "editMessageText", &params);
}

pub(crate) fn send_typing_action(config: &Config, chat_id: i64, thread_id: i64) {
    let mut params = vec![
        ("chat_id", chat_id.to_string()),
        ("action", "typing".to_string()),
    ];
    if thread_id > 0 {
        params.push(("message_thread_id", thread_id.to_string()));
    }
    let _ = telegram_api(config, "sendChatAction", &params);
}

/// Split at the length limit, preferring the last newline (then space)
/// past the halfway point so words and lines survive.
pub(crate) fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut messages = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            messages.push(remaining.to_string());
            break;
        }

        let mut window_end = max_len;
        while !remaining.is_char_boundary(window_end) {
            window_end -= 1;
        }
        let window = &remaining[..window_end];

        let mut split_at = window_end;
        if let Some(idx) = window.rfind('\n').filter(|&idx| idx > max_len / 2) {
            split_at = idx + 1;
        } else if let Some(idx) = window.rfind(' ').filter(|&idx| idx > max_len / 2) {
            split_at = idx + 1;
        }

        messages.push(remaining[..split_at].trim_end_matches(&[' ', '\n'][..]).to_string());
        remaining = &remaining[split_at..];
    }

    messages
}

/// Upload a file as a document (Telegram caps direct uploads at 50MB).
pub(crate) fn send_file(
    config: &Config,
    chat_id: i64,
    thread_id: i64,
    file_path: &Path,
    caption: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut form = reqwest::blocking::multipart::Form::new()
        .text("chat_id", chat_id.to_string())
        .file("document", file_path)?;
    if thread_id > 0 {
        form = form.text("message_thread_id", thread_id.to_string());
    }
    if !caption.is_empty() {
        form = form.text("caption", caption.to_string());
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()?;
    let response = client
        .post(api_url(&config.bot_token, "sendDocument"))
        .multipart(form)
        .send()
        .map_err(|e| redact_token(&e.to_string(), &config.bot_token))?;

    let result: TelegramResponse = response
        .json()
        .map_err(|e| redact_token(&e.to_string(), &config.bot_token))?;
    if !result.ok {
        return Err(format!("telegram error: {}", result.description).into());
    }
    Ok(())
}

pub(crate) fn download_telegram_file(
    config: &Config,
    file_id: &str,
    dest_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let params = vec![("file_id", file_id.to_string())];
    let result = telegram_api(config, "getFile", &params)?;
    if !result.ok {
        return Err("failed to get file path".into());
    }
    let file_path = result
        .result
        .get("file_path")
        .and_then(|v| v.as_str())
        .ok_or("failed to get file path")?;

    let url = format!(
        "https://api.telegram.org/file/bot{}/{}",
        config.bot_token, file_path
    );
    let response = HTTP
        .get(&url)
        .call()
        .map_err(|e| redact_token(&e.to_string(), &config.bot_token))?;

    let mut out = File::create(dest_path)?;
    std::io::copy(&mut response.into_reader(), &mut out)?;
    Ok(())
}

pub(crate) fn create_forum_topic(config: &Config, name: &str) -> Result<i64, Box<dyn std::error::Error>> {
    if config.group_id == 0 {
        return Err(
            "no group configured. Add bot to a group with topics enabled and run: ccc setgroup"
                .into(),
        );
    }

    let params = vec![
        ("chat_id", config.group_id.to_string()),
        ("name", name.to_string()),
    ];
    let result = telegram_api(config, "createForumTopic", &params)?;
    if !result.ok {
        return Err(format!("failed to create topic: {}", result.description).into());
    }

    let topic: TopicResult = serde_json::from_value(result.result)?;
    Ok(topic.message_thread_id)
}

pub(crate) fn delete_forum_topic(config: &Config, topic_id: i64) -> Result<(), Box<dyn std::error::Error>> {
    if config.group_id == 0 {
        return Err("no group configured".into());
    }

    let params = vec![
        ("chat_id", config.group_id.to_string()),
        ("message_thread_id", topic_id.to_string()),
    ];
    let result = telegram_api(config, "deleteForumTopic", &params)?;
    if !result.ok {
        return Err(format!("failed to delete topic: {}", result.description).into());
    }
    Ok(())
}

/// Advertise the slash commands once at dispatch-loop startup.
pub(crate) fn set_bot_commands(bot_token: &str) {
    let commands = serde_json::json!([
        {"command": "new", "description": "Create/restart session: /new <name>"},
        {"command": "delete", "description": "Delete current session and thread"},
        {"command": "c", "description": "Execute shell command: /c <cmd>"},
        {"command": "continue", "description": "Restart session with history"},
        {"command": "update", "description": "Update ccc binary from GitHub"},
        {"command": "version", "description": "Show ccc version"},
        {"command": "stats", "description": "Show system stats (RAM, disk, etc)"},
        {"command": "auth", "description": "Re-authenticate Claude OAuth"},
    ]);

    // Default scope, then all group chats so the / button shows up there.
    let _ = HTTP
        .post(&api_url(bot_token, "setMyCommands"))
        .send_json(serde_json::json!({ "commands": commands }));
    let _ = HTTP.post(&api_url(bot_token, "setMyCommands")).send_json(serde_json::json!({
        "commands": commands,
        "scope": {"type": "all_group_chats"},
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_token() {
        let msg = "request to https://api.telegram.org/bot123:SECRET/getUpdates failed";
        let redacted = redact_token(msg, "123:SECRET");
        assert!(!redacted.contains("SECRET"));
        assert!(redacted.contains("bot***/getUpdates"));
    }

    #[test]
    fn test_redact_token_empty_token() {
        assert_eq!(redact_token("boom", ""), "boom");
    }

    #[test]
    fn test_split_message_short_untouched() {
        assert_eq!(split_message("hello", 4000), vec!["hello".to_string()]);
    }

    #[test]
    fn test_split_message_prefers_newline() {
        let text = format!("{}\n{}", "a".repeat(60), "b".repeat(60));
        let parts = split_message(&text, 100);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "a".repeat(60));
        assert_eq!(parts[1], "b".repeat(60));
    }

    #[test]
    fn test_split_message_falls_back_to_space() {
        let text = format!("{} {}", "a".repeat(60), "b".repeat(60));
        let parts = split_message(&text, 100);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "a".repeat(60));
        assert_eq!(parts[1], "b".repeat(60));
    }

    #[test]
    fn test_split_message_hard_cut_without_separator() {
        let text = "a".repeat(250);
        let parts = split_message(&text, 100);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 100);
        assert_eq!(parts[1].len(), 100);
        assert_eq!(parts[2].len(), 50);
    }

    #[test]
    fn test_split_message_early_separator_ignored() {
        // A newline before the halfway point should not trigger a tiny
        // first chunk.
        let text = format!("ab\n{}", "c".repeat(200));
        let parts = split_message(&text, 100);
        assert_eq!(parts[0].len(), 100);
    }

    #[test]
    fn test_split_message_multibyte_safe() {
        let text = "❯".repeat(100); // 3 bytes each
        let parts = split_message(&text, 100);
        assert!(parts.len() >= 3);
        for part in &parts {
            assert!(part.len() <= 100);
            assert!(part.chars().all(|c| c == '❯'));
        }
    }

    #[test]
    fn test_split_message_reassembles_content() {
        let text = format!("{}\n{} tail", "x".repeat(80), "y".repeat(90));
        let parts = split_message(&text, 100);
        let glued: String = parts.join("");
        // Trimmed separators aside, no content is lost.
        assert!(glued.contains(&"x".repeat(80)));
        assert!(glued.contains(&"y".repeat(90)));
        assert!(glued.contains("tail"));
    }
}
