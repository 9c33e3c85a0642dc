use std::fs;
use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;

use crate::{
    auth_waiting_code, clear_session_monitor, create_session, create_tmux_session,
    delete_forum_topic, execute_command, get_session_by_topic, get_system_stats, handle_auth,
    handle_auth_code, home_dir, http_agent, kill_session, kill_tmux_session, load_config,
    redact_token, reset_session_monitor, resolve_project_path, route_message,
    run_claude_oneshot, save_config, send_key, send_message, send_to_tmux,
    send_to_tmux_with_delay, session_name, set_bot_commands, start_session_monitor,
    tmux_session_exists, transcribe_audio, update_ccc, Config, Message, Update,
    MAX_RESPONSE_SIZE,
};

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);
const PARSE_ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// Settle time after auto-starting a session before keys go in.
const AUTO_START_SETTLE: Duration = Duration::from_secs(3);

/// Acquire the single-instance lock, exiting 0 when another instance
/// already holds it (so a service manager does not restart-loop us).
pub(crate) fn acquire_instance_lock(lock_name: &str) -> Result<fs::File, Box<dyn std::error::Error>> {
    // Small pid-derived jitter so simultaneously started instances do not
    // race the lock in lockstep.
    thread::sleep(Duration::from_millis(u64::from(std::process::id() % 500)));

    let lock_path = home_dir().join(lock_name);
    let mut lock_file = fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| format!("failed to open lock file: {e}"))?;

    if lock_file.try_lock_exclusive().is_err() {
        println!("Another ccc instance is already running, exiting quietly");
        std::process::exit(0);
    }

    lock_file.set_len(0)?;
    let _ = writeln!(lock_file, "{}", std::process::id());
    Ok(lock_file)
}

pub(crate) fn poll_updates_raw(bot_token: &str, offset: i64) -> Result<String, String> {
    let url = format!(
        "https://api.telegram.org/bot{bot_token}/getUpdates?offset={offset}&timeout=30"
    );
    let response = http_agent()
        .get(&url)
        .call()
        .map_err(|e| redact_token(&e.to_string(), bot_token))?;
    let mut body = String::new();
    response
        .into_reader()
        .take(MAX_RESPONSE_SIZE)
        .read_to_string(&mut body)
        .map_err(|e| redact_token(&e.to_string(), bot_token))?;
    Ok(body)
}

/// The interactive dispatch loop: long-poll Telegram, classify updates,
/// route them into tmux sessions.
pub(crate) fn listen() -> Result<(), Box<dyn std::error::Error>> {
    // Held for the process lifetime; dropping it would release the flock.
    let _lock_file = acquire_instance_lock(".ccc.lock")?;

    let config = load_config().map_err(|_| "not configured. Run: ccc setup <bot_token>")?;

    println!("Bot listening... (chat: {}, group: {})", config.chat_id, config.group_id);
    println!("Active sessions: {}", config.sessions.len());
    println!("Press Ctrl+C to stop");

    set_bot_commands(&config.bot_token);

    // Output mirror: polls tmux panes and syncs blocks to Telegram.
    start_session_monitor(config.clone());

    let mut config = config;
    let mut offset = 0i64;

    loop {
        let body = match poll_updates_raw(&config.bot_token, offset) {
            Ok(body) => body,
            Err(err) => {
                eprintln!("Network error: {err} (retrying...)");
                thread::sleep(POLL_ERROR_BACKOFF);
                continue;
            }
        };

        let updates: crate::UpdateResponse = match serde_json::from_str(&body) {
            Ok(u) => u,
            Err(err) => {
                eprintln!("Parse error: {err}");
                thread::sleep(PARSE_ERROR_BACKOFF);
                continue;
            }
        };
        if !updates.ok {
            eprintln!("Telegram API error: {}", updates.description);
            thread::sleep(POLL_ERROR_BACKOFF);
            continue;
        }

        for update in updates.result {
            // Advance exactly when the update is taken from the batch:
            // at-least-once across restarts, deduped downstream.
            offset = update.update_id + 1;

            let origin = update_origin(&update);
            let result = catch_unwind(AssertUnwindSafe(|| {
                handle_update(&mut config, update, offset);
            }));
            if let Err(panic_info) = result {
                let detail = panic_message(panic_info);
                eprintln!("panic in update handler: {detail}");
                if let Some((chat_id, thread_id)) = origin {
                    let _ = send_message(&config, chat_id, thread_id, &format!("💥 Panic: {detail}"));
                }
            }
        }
    }
}

fn update_origin(update: &Update) -> Option<(i64, i64)> {
    if let Some(msg) = &update.message {
        return Some((msg.chat.id, msg.message_thread_id));
    }
    update
        .callback_query
        .as_ref()
        .and_then(|cb| cb.message.as_ref())
        .map(|m| (m.chat.id, m.message_thread_id))
}

pub(crate) fn panic_message(panic_info: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn handle_update(config: &mut Config, update: Update, offset: i64) {
    if let Some(cb) = update.callback_query {
        if cb.from.id != config.chat_id {
            return;
        }
        handle_callback(config, &cb);
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
        handle_voice_message(config, &msg, chat_id, thread_id);
        return;
    }
    if !msg.photo.is_empty() && is_group && thread_id > 0 {
        handle_photo_message(config, &msg, chat_id, thread_id);
        return;
    }
    if msg.document.is_some() && is_group && thread_id > 0 {
        handle_document_message(config, &msg, chat_id, thread_id);
        return;
    }

    let text = strip_bot_mention(msg.text.trim());
    if text.is_empty() {
        return;
    }

    println!("[{}] @{}: {text}", msg.chat.kind, msg.from.username);

    if let Some(cmd_str) = text.strip_prefix("/c ") {
        let (output, err) = execute_command(cmd_str);
        let reply = match err {
            Some(err) => format!("⚠️ {output}\n\nExit: {err}"),
            None => output,
        };
        let _ = send_message(config, chat_id, thread_id, &reply);
        return;
    }

    match text.as_str() {
        "/update" => {
            update_ccc(config, chat_id, thread_id, offset);
            return;
        }
        "/restart" => {
            let _ = send_message(config, chat_id, thread_id, "🔄 Restarting ccc service...");
            thread::spawn(|| {
                thread::sleep(Duration::from_millis(500));
                if let Ok(exe) = std::env::current_exe() {
                    let _ = std::process::Command::new(exe).arg("listen").spawn();
                }
                std::process::exit(0);
            });
            return;
        }
        "/stats" => {
            let _ = send_message(config, chat_id, thread_id, &get_system_stats());
            return;
        }
        "/version" => {
            let _ = send_message(
                config,
                chat_id,
                thread_id,
                &format!("ccc {}", env!("CARGO_PKG_VERSION")),
            );
            return;
        }
        "/auth" => {
            let config = config.clone();
            thread::spawn(move || handle_auth(&config, chat_id, thread_id));
            return;
        }
        _ => {}
    }

    // The OAuth dance is waiting for the pasted code.
    if auth_waiting_code() && !text.starts_with('/') {
        let config = config.clone();
        let code = text.clone();
        thread::spawn(move || handle_auth_code(&config, chat_id, thread_id, &code));
        return;
    }

    if text == "/continue" && is_group && thread_id > 0 {
        handle_continue(config, chat_id, thread_id);
        return;
    }
    if text == "/delete" && is_group && thread_id > 0 {
        handle_delete(config, chat_id, thread_id);
        return;
    }
    if text == "/cleanup" {
        handle_cleanup(config, chat_id, thread_id);
        return;
    }
    if text.starts_with("/new") && is_group {
        let arg = text.strip_prefix("/new").unwrap_or("").trim().to_string();
        handle_new(config, chat_id, thread_id, &arg);
        return;
    }

    if is_group && thread_id > 0 {
        handle_topic_text(config, chat_id, thread_id, &text);
        return;
    }

    if is_group {
        // General chat area: offer the message to the intent router.
        let _ = route_message(config, chat_id, thread_id, &text);
        return;
    }

    handle_private_text(config, &msg, chat_id, &text);
}

// ── Callbacks ───────────────────────────────────────────────────────────

/// Payload format `<session>:<qIdx>:<total>:<optIdx>`; the legacy 3-field
/// form carries no total.
pub(crate) fn parse_callback_data(data: &str) -> Option<(String, usize, usize, usize)> {
    let parts: Vec<&str> = data.split(':').collect();
    match parts.len() {
        4 => {
            let q_idx = parts[1].parse().ok()?;
            let total = parts[2].parse().ok()?;
            let opt_idx = parts[3].parse().ok()?;
            Some((parts[0].to_string(), q_idx, total, opt_idx))
        }
        3 => {
            let q_idx = parts[1].parse().ok()?;
            let opt_idx = parts[2].parse().ok()?;
            Some((parts[0].to_string(), q_idx, 0, opt_idx))
        }
        _ => None,
    }
}

fn handle_callback(config: &Config, cb: &crate::CallbackQuery) {
    // Always answer: this clears the spinner on the user's side.
    crate::answer_callback_query(config, &cb.id);

    let Some((sess_name, q_idx, total, opt_idx)) = parse_callback_data(&cb.data) else {
        return;
    };

    if let Some(cb_msg) = &cb.message {
        let new_text = format!("{}\n\n✓ Selected option {}", cb_msg.text, opt_idx + 1);
        crate::edit_message_remove_keyboard(config, cb_msg.chat.id, cb_msg.message_id, &new_text);
    }

    let tmux_name = session_name(&sess_name);
    if !tmux_session_exists(&tmux_name) {
        return;
    }

    // Walk the menu to the chosen option, then confirm.
    for _ in 0..opt_idx {
        send_key(&tmux_name, "Down");
        thread::sleep(Duration::from_millis(50));
    }
    send_key(&tmux_name, "Enter");
    println!("[callback] Selected option {opt_idx} for {sess_name} (question {}/{total})", q_idx + 1);

    // The last question of a batch needs one more Enter for "Submit
    // answers".
    if total > 0 && q_idx == total - 1 {
        thread::sleep(Duration::from_millis(300));
        send_key(&tmux_name, "Enter");
        println!("[callback] Auto-submitted answers for {sess_name}");
    }
}

// ── Media ───────────────────────────────────────────────────────────────

fn unique_temp_path(prefix: &str, ext: &str) -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("{prefix}_{nanos}.{ext}"))
}

fn handle_voice_message(config: &mut Config, msg: &Message, chat_id: i64, thread_id: i64) {
    if let Ok(fresh) = load_config() {
        *config = fresh;
    }
    let Some(sess_name) = get_session_by_topic(config, thread_id) else {
        return;
    };
    let tmux_name = session_name(&sess_name);
    if !tmux_session_exists(&tmux_name) {
        return;
    }
    let Some(voice) = &msg.voice else { return };

    let _ = send_message(config, chat_id, thread_id, "🎤 Transcribing...");
    let audio_path = unique_temp_path("voice", "ogg");
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
            reset_session_monitor(&sess_name);
            let _ = send_to_tmux(
                &tmux_name,
                &format!("[Audio transcription, may contain errors]: {text}"),
            );
        }
        Ok(_) => {}
    }
}

fn handle_photo_message(config: &mut Config, msg: &Message, chat_id: i64, thread_id: i64) {
    if let Ok(fresh) = load_config() {
        *config = fresh;
    }
    let Some(sess_name) = get_session_by_topic(config, thread_id) else {
        return;
    };
    let tmux_name = session_name(&sess_name);
    if !tmux_session_exists(&tmux_name) {
        return;
    }
    // Telegram sends several sizes; take the largest.
    let Some(photo) = msg.photo.iter().max_by_key(|p| p.file_size) else {
        return;
    };

    let img_path = unique_temp_path("telegram", "jpg");
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
    reset_session_monitor(&sess_name);
    // Images take a moment to load into the TUI.
    let _ = send_to_tmux_with_delay(&tmux_name, &prompt, Duration::from_secs(2));
}

fn handle_document_message(config: &mut Config, msg: &Message, chat_id: i64, thread_id: i64) {
    if let Ok(fresh) = load_config() {
        *config = fresh;
    }
    let Some(sess_name) = get_session_by_topic(config, thread_id) else {
        return;
    };
    let tmux_name = session_name(&sess_name);
    if !tmux_session_exists(&tmux_name) {
        return;
    }
    let Some(document) = &msg.document else { return };

    // Documents land in the session's working directory, where the agent
    // can reach them.
    let dest_dir = config
        .sessions
        .get(&sess_name)
        .map(|info| info.path.clone())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| resolve_project_path(config, &sess_name));
    let dest_path = Path::new(&dest_dir).join(&document.file_name);

    if let Err(err) = crate::download_telegram_file(config, &document.file_id, &dest_path) {
        let _ = send_message(config, chat_id, thread_id, &format!("❌ Download failed: {err}"));
        return;
    }

    let caption = if msg.caption.is_empty() {
        format!("I sent you this file: {}", dest_path.display())
    } else {
        format!("{}\n\nFile: {}", msg.caption, dest_path.display())
    };
    let _ = send_message(
        config,
        chat_id,
        thread_id,
        &format!("📎 File saved: {}", dest_path.display()),
    );
    reset_session_monitor(&sess_name);
    let _ = send_to_tmux(&tmux_name, &caption);
}

// ── Session commands ────────────────────────────────────────────────────

fn stored_work_dir(config: &Config, sess_name: &str) -> String {
    config
        .sessions
        .get(sess_name)
        .map(|info| info.path.clone())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| resolve_project_path(config, sess_name))
}

fn ensure_work_dir(work_dir: &str) {
    if !Path::new(work_dir).exists() {
        let _ = fs::create_dir_all(work_dir);
    }
}

/// Recreate the session with `-c` so Claude resumes the conversation.
fn handle_continue(config: &mut Config, chat_id: i64, thread_id: i64) {
    if let Ok(fresh) = load_config() {
        *config = fresh;
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

    let tmux_name = session_name(&sess_name);
    if tmux_session_exists(&tmux_name) {
        let _ = kill_tmux_session(&tmux_name);
        thread::sleep(Duration::from_millis(300));
    }
    clear_session_monitor(&sess_name);

    let work_dir = stored_work_dir(config, &sess_name);
    ensure_work_dir(&work_dir);

    match create_tmux_session(&tmux_name, &work_dir, true) {
        Err(err) => {
            let _ = send_message(config, chat_id, thread_id, &format!("❌ Failed to start: {err}"));
        }
        Ok(()) => {
            thread::sleep(Duration::from_millis(500));
            if tmux_session_exists(&tmux_name) {
                let _ = send_message(
                    config,
                    chat_id,
                    thread_id,
                    &format!("🔄 Session '{sess_name}' restarted with conversation history"),
                );
            } else {
                let _ = send_message(config, chat_id, thread_id, "⚠️ Session died immediately");
            }
        }
    }
}

fn handle_delete(config: &mut Config, chat_id: i64, thread_id: i64) {
    if let Ok(fresh) = load_config() {
        *config = fresh;
    }
    let Some(sess_name) = get_session_by_topic(config, thread_id) else {
        let _ = send_message(config, chat_id, thread_id, "❌ No session mapped to this topic.");
        return;
    };

    let topic_id = config
        .sessions
        .get(&sess_name)
        .map(|info| info.topic_id)
        .unwrap_or(0);
    let _ = kill_session(config, &sess_name);
    clear_session_monitor(&sess_name);

    // The thread disappears with the topic; no success message needed.
    if let Err(err) = delete_forum_topic(config, topic_id) {
        let _ = send_message(
            config,
            chat_id,
            thread_id,
            &format!("⚠️ Session deleted but failed to delete thread: {err}"),
        );
    }
}

/// Tear down every session's tmux and topic. Project directories are
/// never touched.
fn handle_cleanup(config: &mut Config, chat_id: i64, thread_id: i64) {
    if let Ok(fresh) = load_config() {
        *config = fresh;
    }
    if config.sessions.is_empty() {
        let _ = send_message(config, chat_id, thread_id, "No sessions to clean up.");
        return;
    }

    let mut cleaned = Vec::new();
    let mut errors = Vec::new();

    let sessions: Vec<(String, i64)> = config
        .sessions
        .iter()
        .map(|(name, info)| (name.clone(), info.topic_id))
        .collect();
    for (sess_name, topic_id) in sessions {
        let tmux_name = session_name(&sess_name);
        if tmux_session_exists(&tmux_name) {
            let _ = kill_tmux_session(&tmux_name);
        }
        clear_session_monitor(&sess_name);

        if topic_id > 0 && config.group_id > 0 {
            if let Err(err) = delete_forum_topic(config, topic_id) {
                errors.push(format!("{sess_name}: {err}"));
            }
        }
        cleaned.push(sess_name);
    }

    config.sessions.clear();
    let _ = save_config(config);

    let mut msg = format!("🧹 Cleaned {} sessions: {}", cleaned.len(), cleaned.join(", "));
    if !errors.is_empty() {
        msg.push_str(&format!("\n\n⚠️ Errors:\n{}", errors.join("\n")));
    }
    let _ = send_message(config, chat_id, thread_id, &msg);
}

fn handle_new(config: &mut Config, chat_id: i64, thread_id: i64, arg: &str) {
    if let Ok(fresh) = load_config() {
        *config = fresh;
    }

    // /new <name>: brand new session and topic.
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
        clear_session_monitor(arg);
        match create_session(config, arg) {
            Err(err) => {
                let _ = send_message(config, chat_id, thread_id, &format!("❌ {err}"));
            }
            Ok(()) => {
                let topic_id = config
                    .sessions
                    .get(arg)
                    .map(|info| info.topic_id)
                    .unwrap_or(0);
                thread::sleep(Duration::from_millis(500));
                if tmux_session_exists(&session_name(arg)) {
                    let _ = send_message(
                        config,
                        config.group_id,
                        topic_id,
                        &format!("🚀 Session '{arg}' started!\n\nSend messages here to interact with Claude."),
                    );
                } else {
                    let _ = send_message(
                        config,
                        config.group_id,
                        topic_id,
                        &format!("⚠️ Session '{arg}' created but died immediately. Check if ~/bin/ccc works."),
                    );
                }
            }
        }
        return;
    }

    // /new without args: restart the session of the current topic.
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

    let tmux_name = session_name(&sess_name);
    if tmux_session_exists(&tmux_name) {
        let _ = kill_tmux_session(&tmux_name);
        thread::sleep(Duration::from_millis(300));
    }
    clear_session_monitor(&sess_name);

    let work_dir = stored_work_dir(config, &sess_name);
    ensure_work_dir(&work_dir);

    match create_tmux_session(&tmux_name, &work_dir, false) {
        Err(err) => {
            let _ = send_message(config, chat_id, thread_id, &format!("❌ Failed to start: {err}"));
        }
        Ok(()) => {
            thread::sleep(Duration::from_millis(500));
            if tmux_session_exists(&tmux_name) {
                let _ = send_message(config, chat_id, thread_id, &format!("🚀 Session '{sess_name}' restarted"));
            } else {
                let _ = send_message(config, chat_id, thread_id, "⚠️ Session died immediately");
            }
        }
    }
}

/// Plain text in a session topic: make sure the session lives, then type
/// the message into it.
fn handle_topic_text(config: &mut Config, chat_id: i64, thread_id: i64, text: &str) {
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

    let tmux_name = session_name(&sess_name);
    if !tmux_session_exists(&tmux_name) {
        let work_dir = stored_work_dir(config, &sess_name);
        ensure_work_dir(&work_dir);
        if let Err(err) = create_tmux_session(&tmux_name, &work_dir, false) {
            let _ = send_message(config, chat_id, thread_id, &format!("❌ Failed to start session: {err}"));
            return;
        }
        let _ = send_message(
            config,
            chat_id,
            thread_id,
            &format!("🚀 Session '{sess_name}' auto-started"),
        );
        thread::sleep(AUTO_START_SETTLE);
    }

    reset_session_monitor(&sess_name);
    if let Err(err) = send_to_tmux(&tmux_name, text) {
        let _ = send_message(config, chat_id, thread_id, &format!("❌ Failed to send: {err}"));
    }
}

/// Private chat: one-shot Claude run, replying with its output.
fn handle_private_text(config: &Config, msg: &Message, chat_id: i64, text: &str) {
    let _ = send_message(config, chat_id, 0, "🤖 Running Claude...");

    let mut prompt = text.to_string();
    if let Some(reply) = &msg.reply_to_message {
        if !reply.text.is_empty() {
            // Replying to a message that starts with a project dir keeps
            // the one-shot in that directory.
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
            let (output, _) = run_claude_oneshot(&prompt);
            let _ = send_message(&config, chat_id, 0, &output);
        }));
        if let Err(panic_info) = result {
            let _ = send_message(
                &config,
                chat_id,
                0,
                &format!("💥 Panic: {}", panic_message(panic_info)),
            );
        }
    });
}

/// Strip an `@botname` suffix from a command, e.g. `/ping@bot` → `/ping`.
pub(crate) fn strip_bot_mention(text: &str) -> String {
    if !text.starts_with('/') {
        return text.trim().to_string();
    }
    if let Some(at) = text.find('@') {
        let space = text.find(' ').unwrap_or(text.len());
        if at < space {
            return format!("{}{}", &text[..at], &text[space..]).trim().to_string();
        }
    }
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_bot_mention() {
        assert_eq!(strip_bot_mention("/ping@mybot"), "/ping");
        assert_eq!(strip_bot_mention("/c@mybot ls -la"), "/c ls -la");
        assert_eq!(strip_bot_mention("/plain arg"), "/plain arg");
        assert_eq!(strip_bot_mention("not a command @user"), "not a command @user");
        assert_eq!(strip_bot_mention("/cmd has@later"), "/cmd has@later");
    }

    #[test]
    fn test_parse_callback_data_four_fields() {
        let (session, q_idx, total, opt_idx) = parse_callback_data("proj:1:3:2").unwrap();
        assert_eq!(session, "proj");
        assert_eq!(q_idx, 1);
        assert_eq!(total, 3);
        assert_eq!(opt_idx, 2);
    }

    #[test]
    fn test_parse_callback_data_legacy_three_fields() {
        let (session, q_idx, total, opt_idx) = parse_callback_data("proj:0:1").unwrap();
        assert_eq!(session, "proj");
        assert_eq!(q_idx, 0);
        assert_eq!(total, 0);
        assert_eq!(opt_idx, 1);
    }

    #[test]
    fn test_parse_callback_data_rejects_malformed() {
        assert!(parse_callback_data("").is_none());
        assert!(parse_callback_data("justone").is_none());
        assert!(parse_callback_data("a:b").is_none());
        assert!(parse_callback_data("s:x:y:z").is_none());
        assert!(parse_callback_data("a:1:2:3:4").is_none());
    }

    #[test]
    fn test_panic_message_variants() {
        let from_str = catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(from_str), "boom");

        let from_string = catch_unwind(|| panic!("{}", String::from("dynamic"))).unwrap_err();
        assert_eq!(panic_message(from_string), "dynamic");
    }

    #[test]
    fn test_update_origin_prefers_message() {
        let update = Update {
            update_id: 1,
            message: Some(Message {
                chat: crate::Chat {
                    id: 77,
                    kind: "supergroup".to_string(),
                },
                message_thread_id: 5,
                ..Message::default()
            }),
            callback_query: None,
        };
        assert_eq!(update_origin(&update), Some((77, 5)));
    }
}
