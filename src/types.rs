use serde::{Deserialize, Serialize};

/// One managed session: a Telegram forum topic paired with a project
/// directory and, in headless mode, a Claude conversation to resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SessionInfo {
    pub(crate) topic_id: i64,
    #[serde(default)]
    pub(crate) path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) claude_session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Config {
    #[serde(default)]
    pub(crate) bot_token: String,
    /// Private chat of the authorized user; doubles as the auth filter.
    #[serde(default)]
    pub(crate) chat_id: i64,
    /// Group with topics enabled; sessions live in its forum threads.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub(crate) group_id: i64,
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub(crate) sessions: std::collections::HashMap<String, SessionInfo>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) projects_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) transcription_lang: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) transcription_cmd: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) relay_url: String,
    #[serde(default)]
    pub(crate) away: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) oauth_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) openrouter_key: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

// ── Telegram wire types ─────────────────────────────────────────────────
//
// The Bot API is loosely typed JSON with optional bodies; which optional
// field is present decides how an update is classified.

#[derive(Debug, Deserialize)]
pub(crate) struct UpdateResponse {
    pub(crate) ok: bool,
    #[serde(default)]
    pub(crate) description: String,
    #[serde(default)]
    pub(crate) result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Update {
    pub(crate) update_id: i64,
    #[serde(default)]
    pub(crate) message: Option<Message>,
    #[serde(default)]
    pub(crate) callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Message {
    #[serde(default)]
    pub(crate) message_id: i64,
    /// Topic id inside a forum supergroup.
    #[serde(default)]
    pub(crate) message_thread_id: i64,
    #[serde(default)]
    pub(crate) chat: Chat,
    #[serde(default)]
    pub(crate) from: User,
    #[serde(default)]
    pub(crate) text: String,
    #[serde(default)]
    pub(crate) caption: String,
    #[serde(default)]
    pub(crate) reply_to_message: Option<Box<Message>>,
    #[serde(default)]
    pub(crate) voice: Option<Voice>,
    #[serde(default)]
    pub(crate) photo: Vec<PhotoSize>,
    #[serde(default)]
    pub(crate) document: Option<Document>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Chat {
    #[serde(default)]
    pub(crate) id: i64,
    /// "private", "group" or "supergroup".
    #[serde(default, rename = "type")]
    pub(crate) kind: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct User {
    #[serde(default)]
    pub(crate) id: i64,
    #[serde(default)]
    pub(crate) username: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Voice {
    pub(crate) file_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PhotoSize {
    pub(crate) file_id: String,
    #[serde(default)]
    pub(crate) file_size: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Document {
    pub(crate) file_id: String,
    #[serde(default)]
    pub(crate) file_name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CallbackQuery {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) from: User,
    #[serde(default)]
    pub(crate) message: Option<Box<Message>>,
    #[serde(default)]
    pub(crate) data: String,
}

/// Generic `{ok, description, result}` envelope for Bot API method calls.
#[derive(Debug, Deserialize)]
pub(crate) struct TelegramResponse {
    pub(crate) ok: bool,
    #[serde(default)]
    pub(crate) description: String,
    #[serde(default)]
    pub(crate) result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TopicResult {
    pub(crate) message_thread_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct InlineKeyboardButton {
    pub(crate) text: String,
    pub(crate) callback_data: String,
}

// ── Claude hook payloads ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HookData {
    #[serde(default)]
    pub(crate) cwd: String,
    #[serde(default)]
    pub(crate) transcript_path: String,
    #[serde(default)]
    pub(crate) hook_event_name: String,
    #[serde(default)]
    pub(crate) tool_name: String,
    /// Set by the UserPromptSubmit hook.
    #[serde(default)]
    pub(crate) prompt: String,
    /// Set by the Notification hook.
    #[serde(default)]
    pub(crate) notification: String,
    #[serde(default)]
    pub(crate) tool_input: HookToolInput,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HookToolInput {
    #[serde(default)]
    pub(crate) questions: Vec<HookQuestion>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HookQuestion {
    #[serde(default)]
    pub(crate) question: String,
    #[serde(default)]
    pub(crate) header: String,
    #[serde(default)]
    pub(crate) options: Vec<HookQuestionOption>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HookQuestionOption {
    #[serde(default)]
    pub(crate) label: String,
}
