use std::fs;
use std::thread;
use std::time::Duration;

use crate::{
    clear_session_monitor, create_forum_topic, create_tmux_session, debug_log, get_last_blocks,
    is_claude_idle, kill_tmux_session, resolve_project_path, save_config, send_message,
    send_to_tmux, session_name, tmux_session_exists, truncate, wait_for_claude, Config,
    SessionInfo,
};

/// Classified intent for a free-form group message outside any topic.
#[derive(Debug, PartialEq)]
pub(crate) struct RouterIntent {
    pub(crate) action: String,
    pub(crate) name: String,
    pub(crate) message: String,
}

impl RouterIntent {
    fn passthrough(text: &str) -> Self {
        RouterIntent {
            action: "passthrough".to_string(),
            name: String::new(),
            message: text.to_string(),
        }
    }
}

const ROUTER_SYSTEM_PROMPT: &str = r#"You are a command router for a Claude Code session manager. Classify the user's message into one of these intents:

INTENTS:
- new_session:<name>:<prompt> — User wants to create a new session. Extract a short kebab-case name and the task prompt.
- send:<message> — User wants to send a message to the active session. Extract the message.
- switch:<name> — User wants to switch to a different session.
- status — User wants to see all sessions and their status.
- peek:<name> — User wants to see the latest output from a specific session.
- kill:<name> — User wants to stop/kill a session.
- list — User wants to list all sessions.
- passthrough — The message should be forwarded as-is to the active session (default for most messages).

RULES:
1. If the message is clearly a task/question/instruction with no session management intent, classify as "passthrough".
2. For "new_session", generate a short descriptive name (2-3 words, kebab-case) from the task.
3. If the user says "start", "begin", "create", "new session", "new task" → new_session.
4. If the user says "what's happening", "status", "how are things", "progress" → status.
5. If the user says "show me", "peek", "check on", "look at" + session name → peek.
6. If the user says "stop", "kill", "end", "cancel" + session name → kill.
7. If the user says "switch to", "go to", "open" + session name → switch.
8. If the user says "list sessions", "show sessions", "what sessions" → list.
9. Most messages that look like instructions, questions, or code should be "passthrough".

Respond with ONLY the intent string, nothing else."#;

const DEFAULT_ROUTER_MODEL: &str = "google/gemini-2.0-flash-lite-001";

/// Ask OpenRouter to classify the message. Without a key, everything is
/// passthrough.
pub(crate) fn classify_intent(config: &Config, text: &str) -> Result<RouterIntent, Box<dyn std::error::Error>> {
    if config.openrouter_key.is_empty() {
        return Ok(RouterIntent::passthrough(text));
    }

    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(10))
        .timeout_read(Duration::from_secs(10))
        .build();
    let response = agent
        .post("https://openrouter.ai/api/v1/chat/completions")
        .set("Authorization", &format!("Bearer {}", config.openrouter_key))
        .send_json(serde_json::json!({
            "model": DEFAULT_ROUTER_MODEL,
            "messages": [
                {"role": "system", "content": ROUTER_SYSTEM_PROMPT},
                {"role": "user", "content": text},
            ],
            "max_tokens": 100,
            "temperature": 0.0,
        }))
        .map_err(|e| format!("router API call failed: {e}"))?;

    let data: serde_json::Value = response.into_json()?;
    let Some(content) = data["choices"][0]["message"]["content"].as_str() else {
        return Ok(RouterIntent::passthrough(text));
    };

    Ok(parse_intent(content, text))
}

/// Parse the model's intent string; anything unparseable is passthrough.
pub(crate) fn parse_intent(response: &str, original_text: &str) -> RouterIntent {
    let response = response.trim();

    if let Some(rest) = response.strip_prefix("new_session:") {
        let mut parts = rest.splitn(2, ':');
        let mut name = parts.next().unwrap_or("").trim().to_string();
        let prompt = parts
            .next()
            .map(|p| p.trim().to_string())
            .unwrap_or_else(|| original_text.to_string());
        if name.is_empty() {
            name = "session".to_string();
        }
        return RouterIntent {
            action: "new_session".to_string(),
            name,
            message: prompt,
        };
    }
    if let Some(msg) = response.strip_prefix("send:") {
        return RouterIntent {
            action: "send".to_string(),
            name: String::new(),
            message: msg.trim().to_string(),
        };
    }
    for (prefix, action) in [("switch:", "switch"), ("peek:", "peek"), ("kill:", "kill")] {
        if let Some(name) = response.strip_prefix(prefix) {
            return RouterIntent {
                action: action.to_string(),
                name: name.trim().to_string(),
                message: String::new(),
            };
        }
    }

    match response {
        "status" | "list" => RouterIntent {
            action: response.to_string(),
            name: String::new(),
            message: String::new(),
        },
        _ => RouterIntent::passthrough(original_text),
    }
}

/// Route a group message that arrived outside any topic. Returns true
/// when the router handled it; passthrough falls back to the caller.
pub(crate) fn route_message(config: &mut Config, chat_id: i64, thread_id: i64, text: &str) -> bool {
    let intent = match classify_intent(config, text) {
        Ok(intent) => intent,
        Err(err) => {
            debug_log("router", format!("classification failed: {err}, falling through"));
            return false;
        }
    };

    debug_log(
        "router",
        format!(
            "classified {:?} as {} (name={})",
            truncate(text, 50),
            intent.action,
            intent.name
        ),
    );

    match intent.action.as_str() {
        "new_session" => handle_router_new_session(config, chat_id, thread_id, &intent),
        "status" | "list" => handle_router_status(config, chat_id, thread_id),
        "peek" => handle_router_peek(config, chat_id, thread_id, &intent),
        "kill" => handle_router_kill(config, chat_id, thread_id, &intent),
        "switch" => handle_router_switch(config, chat_id, thread_id, &intent),
        _ => false,
    }
}

fn handle_router_new_session(
    config: &mut Config,
    chat_id: i64,
    thread_id: i64,
    intent: &RouterIntent,
) -> bool {
    let name = intent.name.clone();
    let prompt = intent.message.clone();

    if config.group_id == 0 {
        let _ = send_message(config, chat_id, thread_id, "No group configured. Run: ccc setgroup");
        return true;
    }
    if config.sessions.contains_key(&name) {
        let _ = send_message(
            config,
            chat_id,
            thread_id,
            &format!("Session '{name}' already exists. Use a different name."),
        );
        return true;
    }

    let topic_id = match create_forum_topic(config, &name) {
        Ok(id) => id,
        Err(err) => {
            let _ = send_message(config, chat_id, thread_id, &format!("Failed to create topic: {err}"));
            return true;
        }
    };

    let work_dir = resolve_project_path(config, &name);
    config.sessions.insert(
        name.clone(),
        SessionInfo {
            topic_id,
            path: work_dir.clone(),
            claude_session_id: None,
        },
    );
    let _ = save_config(config);
    let _ = fs::create_dir_all(&work_dir);

    let tmux_name = session_name(&name);
    if let Err(err) = create_tmux_session(&tmux_name, &work_dir, false) {
        let _ = send_message(config, config.group_id, topic_id, &format!("Failed to start tmux: {err}"));
        return true;
    }

    // Submit the initial prompt once Claude is up, off the dispatch path.
    {
        let config = config.clone();
        let prompt = prompt.clone();
        let tmux_name = tmux_name.clone();
        thread::spawn(move || {
            if let Err(err) = wait_for_claude(&tmux_name, Duration::from_secs(30)) {
                let _ = send_message(
                    &config,
                    config.group_id,
                    topic_id,
                    &format!("Claude didn't start in time: {err}"),
                );
                return;
            }
            if !prompt.is_empty() {
                let _ = send_to_tmux(&tmux_name, &prompt);
            }
        });
    }

    let _ = send_message(
        config,
        chat_id,
        thread_id,
        &format!("Session '{name}' created! Check the new topic."),
    );
    let _ = send_message(
        config,
        config.group_id,
        topic_id,
        &format!("Session '{name}' started.\n\nPrompt: {prompt}"),
    );
    true
}

fn handle_router_status(config: &Config, chat_id: i64, thread_id: i64) -> bool {
    if config.sessions.is_empty() {
        let _ = send_message(config, chat_id, thread_id, "No active sessions.");
        return true;
    }

    let mut out = String::from("Sessions:\n\n");
    for (name, info) in &config.sessions {
        let tmux_name = session_name(name);
        let status = if tmux_session_exists(&tmux_name) {
            if is_claude_idle(&tmux_name) {
                "idle (waiting for input)"
            } else {
                "working..."
            }
        } else {
            "stopped"
        };
        out.push_str(&format!("- {name} [{status}]\n  Path: {}\n", info.path));
    }
    let _ = send_message(config, chat_id, thread_id, &out);
    true
}

fn handle_router_peek(config: &Config, chat_id: i64, thread_id: i64, intent: &RouterIntent) -> bool {
    let Some(name) = find_session_by_fuzzy_name(config, &intent.name) else {
        let _ = send_message(config, chat_id, thread_id, &format!("Session '{}' not found.", intent.name));
        return true;
    };

    let tmux_name = session_name(&name);
    if !tmux_session_exists(&tmux_name) {
        let _ = send_message(config, chat_id, thread_id, &format!("Session '{name}' is not running."));
        return true;
    }

    let blocks = get_last_blocks(&tmux_name);
    if blocks.is_empty() {
        let _ = send_message(config, chat_id, thread_id, &format!("Session '{name}': no output yet."));
        return true;
    }

    let start = blocks.len().saturating_sub(2);
    let mut out = format!("Peek at '{name}':\n\n");
    for block in &blocks[start..] {
        out.push_str(block);
        out.push_str("\n\n");
    }
    let _ = send_message(config, chat_id, thread_id, &out);
    true
}

fn handle_router_kill(config: &Config, chat_id: i64, thread_id: i64, intent: &RouterIntent) -> bool {
    let Some(name) = find_session_by_fuzzy_name(config, &intent.name) else {
        let _ = send_message(config, chat_id, thread_id, &format!("Session '{}' not found.", intent.name));
        return true;
    };

    let tmux_name = session_name(&name);
    if tmux_session_exists(&tmux_name) {
        let _ = kill_tmux_session(&tmux_name);
    }
    clear_session_monitor(&name);
    let _ = send_message(config, chat_id, thread_id, &format!("Session '{name}' killed."));
    true
}

fn handle_router_switch(config: &Config, chat_id: i64, thread_id: i64, intent: &RouterIntent) -> bool {
    let Some(name) = find_session_by_fuzzy_name(config, &intent.name) else {
        let _ = send_message(config, chat_id, thread_id, &format!("Session '{}' not found.", intent.name));
        return true;
    };

    let Some(info) = config.sessions.get(&name) else {
        let _ = send_message(config, chat_id, thread_id, &format!("Session '{name}' has no topic."));
        return true;
    };
    let _ = send_message(
        config,
        chat_id,
        thread_id,
        &format!(
            "Session '{name}' is in topic {}. Send messages there to interact.",
            info.topic_id
        ),
    );
    true
}

/// Exact name first, then prefix, then substring, all case-insensitive.
pub(crate) fn find_session_by_fuzzy_name(config: &Config, query: &str) -> Option<String> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return None;
    }

    if let Some(name) = config.sessions.keys().find(|n| n.to_lowercase() == query) {
        return Some(name.clone());
    }
    if let Some(name) = config.sessions.keys().find(|n| n.to_lowercase().starts_with(&query)) {
        return Some(name.clone());
    }
    config
        .sessions
        .keys()
        .find(|n| n.to_lowercase().contains(&query))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_sessions(names: &[&str]) -> Config {
        let mut config = Config::default();
        for (i, name) in names.iter().enumerate() {
            config.sessions.insert(
                name.to_string(),
                SessionInfo {
                    topic_id: i as i64 + 1,
                    path: format!("/tmp/{name}"),
                    claude_session_id: None,
                },
            );
        }
        config
    }

    #[test]
    fn test_parse_intent_new_session_full() {
        let intent = parse_intent(
            "new_session:quantum-research:research quantum computing",
            "start a new session to research quantum computing",
        );
        assert_eq!(intent.action, "new_session");
        assert_eq!(intent.name, "quantum-research");
        assert_eq!(intent.message, "research quantum computing");
    }

    #[test]
    fn test_parse_intent_new_session_name_only() {
        let intent = parse_intent("new_session:my-project", "create a session called my-project");
        assert_eq!(intent.action, "new_session");
        assert_eq!(intent.name, "my-project");
        assert_eq!(intent.message, "create a session called my-project");
    }

    #[test]
    fn test_parse_intent_new_session_empty_name() {
        let intent = parse_intent("new_session:", "make me a session");
        assert_eq!(intent.action, "new_session");
        assert_eq!(intent.name, "session");
    }

    #[test]
    fn test_parse_intent_simple_actions() {
        assert_eq!(parse_intent("status", "what's the status").action, "status");
        assert_eq!(parse_intent("list", "list all sessions").action, "list");
    }

    #[test]
    fn test_parse_intent_named_actions() {
        let peek = parse_intent("peek:research", "check on the research session");
        assert_eq!(peek.action, "peek");
        assert_eq!(peek.name, "research");

        let kill = parse_intent("kill:quantum-research", "stop the quantum session");
        assert_eq!(kill.action, "kill");
        assert_eq!(kill.name, "quantum-research");

        let switch = parse_intent("switch:my-project", "switch to my-project");
        assert_eq!(switch.action, "switch");
        assert_eq!(switch.name, "my-project");
    }

    #[test]
    fn test_parse_intent_send() {
        let intent = parse_intent("send: run the tests", "run the tests please");
        assert_eq!(intent.action, "send");
        assert_eq!(intent.message, "run the tests");
    }

    #[test]
    fn test_parse_intent_passthrough_and_garbage() {
        let intent = parse_intent("passthrough", "implement the login form");
        assert_eq!(intent.action, "passthrough");
        assert_eq!(intent.message, "implement the login form");

        let garbage = parse_intent("blah blah unknown", "original text");
        assert_eq!(garbage.action, "passthrough");
        assert_eq!(garbage.message, "original text");
    }

    #[test]
    fn test_parse_intent_whitespace_tolerant() {
        let intent = parse_intent("  status  ", "x");
        assert_eq!(intent.action, "status");
    }

    #[test]
    fn test_classify_without_key_is_passthrough() {
        let config = Config::default();
        let intent = classify_intent(&config, "hello world").unwrap();
        assert_eq!(intent.action, "passthrough");
        assert_eq!(intent.message, "hello world");
    }

    #[test]
    fn test_fuzzy_exact_beats_prefix() {
        let config = config_with_sessions(&["research", "research-v2"]);
        assert_eq!(
            find_session_by_fuzzy_name(&config, "research"),
            Some("research".to_string())
        );
    }

    #[test]
    fn test_fuzzy_prefix_and_substring() {
        let config = config_with_sessions(&["quantum-research"]);
        assert_eq!(
            find_session_by_fuzzy_name(&config, "quantum"),
            Some("quantum-research".to_string())
        );
        assert_eq!(
            find_session_by_fuzzy_name(&config, "research"),
            Some("quantum-research".to_string())
        );
    }

    #[test]
    fn test_fuzzy_case_insensitive() {
        let config = config_with_sessions(&["MyProject"]);
        assert_eq!(
            find_session_by_fuzzy_name(&config, "myproject"),
            Some("MyProject".to_string())
        );
    }

    #[test]
    fn test_fuzzy_no_match_or_empty() {
        let config = config_with_sessions(&["alpha"]);
        assert_eq!(find_session_by_fuzzy_name(&config, "zzz"), None);
        assert_eq!(find_session_by_fuzzy_name(&config, "   "), None);
    }
}
