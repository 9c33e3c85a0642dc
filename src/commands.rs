use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::{
    capture_pane, claude_path, home_dir, http_agent, install_hook, install_service,
    install_skill, kill_tmux_session, load_config, redact_token, save_config, search_path,
    send_key, send_message, tmux_path, Config, UpdateResponse,
};

pub(crate) const MAX_RESPONSE_SIZE: u64 = 10 * 1024 * 1024;
const SHELL_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const CLAUDE_ONESHOT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

// /auth drives a nested tmux session; only one dance at a time, and the
// next non-command message is the pasted OAuth code.
static AUTH_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static AUTH_WAITING_CODE: AtomicBool = AtomicBool::new(false);
const AUTH_TMUX_SESSION: &str = "claude-auth";

pub(crate) fn auth_waiting_code() -> bool {
    AUTH_WAITING_CODE.load(Ordering::SeqCst)
}

// ── Subprocess helpers ──────────────────────────────────────────────────

/// Run a command to completion with a hard deadline, killing it on
/// overrun. Returns (combined output, timed_out, success).
fn run_with_deadline(mut cmd: Command, timeout: Duration) -> Result<(String, bool, bool), Box<dyn std::error::Error>> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| format!("spawn failed: {e}"))?;

    let start = Instant::now();
    let mut timed_out = false;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    timed_out = true;
                    break;
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(format!("wait failed: {e}").into()),
        }
    }

    let output = child.wait_with_output().map_err(|e| format!("output failed: {e}"))?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }
    Ok((combined.trim().to_string(), timed_out, output.status.success()))
}

/// Execute a shell command for /c: login shell, 2-minute deadline, runs
/// from home.
pub(crate) fn execute_command(cmd_str: &str) -> (String, Option<String>) {
    let shell = if search_path("zsh").is_some() { "zsh" } else { "bash" };
    let mut cmd = Command::new(shell);
    cmd.args(["-l", "-c", cmd_str]).current_dir(home_dir());

    match run_with_deadline(cmd, SHELL_TIMEOUT) {
        Ok((output, timed_out, success)) => {
            let output = if output.is_empty() {
                "(no output)".to_string()
            } else {
                output
            };
            if timed_out {
                (output, Some("timeout".to_string()))
            } else if !success {
                (output, Some("non-zero exit".to_string()))
            } else {
                (output, None)
            }
        }
        Err(err) => (format!("Error: {err}"), Some(err.to_string())),
    }
}

/// One-shot Claude run for private-chat messages. A leading word naming a
/// directory under home selects the working dir.
pub(crate) fn run_claude_oneshot(prompt: &str) -> (String, bool) {
    let mut work_dir = home_dir();
    let mut prompt = prompt.to_string();

    if let Some(first_word) = prompt.split_whitespace().next().map(str::to_string) {
        let potential_dir = home_dir().join(&first_word);
        if potential_dir.is_dir() {
            prompt = prompt.trim_start_matches(&first_word).trim().to_string();
            if prompt.is_empty() {
                return ("Error: no prompt provided after directory name".to_string(), false);
            }
            work_dir = potential_dir;
        }
    }

    let Some(claude) = claude_path() else {
        return ("Error: claude binary not found".to_string(), false);
    };

    let mut cmd = Command::new(claude);
    cmd.args(["--dangerously-skip-permissions", "-p", &prompt])
        .current_dir(&work_dir);

    match run_with_deadline(cmd, CLAUDE_ONESHOT_TIMEOUT) {
        Ok((output, timed_out, success)) => {
            let output = if output.is_empty() {
                if success {
                    "(no output)".to_string()
                } else {
                    "Error: claude exited with error".to_string()
                }
            } else {
                output
            };
            if timed_out {
                (format!("⏱️ Timeout (10min)\n\n{output}"), false)
            } else if !success {
                (format!("⚠️ {output}\n\nExit: error"), false)
            } else {
                (output, true)
            }
        }
        Err(err) => (format!("Error: {err}"), false),
    }
}

// ── Self-update ─────────────────────────────────────────────────────────

/// Replace our binary with the latest GitHub release and exit so the
/// service manager restarts us.
pub(crate) fn update_ccc(config: &Config, chat_id: i64, thread_id: i64, offset: i64) {
    let _ = send_message(config, chat_id, thread_id, "🔄 Updating ccc...");

    let binary_name = format!("ccc-{}-{}", std::env::consts::OS, std::env::consts::ARCH);
    let download_url =
        format!("https://github.com/kidandcat/ccc/releases/latest/download/{binary_name}");

    let response = match http_agent().get(&download_url).call() {
        Ok(r) => r,
        Err(err) => {
            let _ = send_message(config, chat_id, thread_id, &format!("❌ Download failed: {err}"));
            return;
        }
    };
    if response.status() != 200 {
        let _ = send_message(
            config,
            chat_id,
            thread_id,
            &format!(
                "❌ Download failed: HTTP {} (no release for {binary_name}?)",
                response.status()
            ),
        );
        return;
    }

    let ccc = crate::ccc_path();
    let tmp_path = ccc.with_extension("new");
    let written = fs::File::create(&tmp_path)
        .map_err(|e| e.to_string())
        .and_then(|mut f| {
            std::io::copy(&mut response.into_reader(), &mut f).map_err(|e| e.to_string())
        });
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        let _ = send_message(config, chat_id, thread_id, &format!("❌ Failed to write binary: {err}"));
        return;
    }

    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o755));

    if let Err(err) = fs::rename(&tmp_path, ccc) {
        let _ = fs::remove_file(&tmp_path);
        let _ = send_message(config, chat_id, thread_id, &format!("❌ Failed to replace binary: {err}"));
        return;
    }

    if std::env::consts::OS == "macos" {
        let _ = execute_command(&format!("codesign -s - {}", ccc.display()));
    }

    let _ = send_message(config, chat_id, thread_id, "✅ Updated. Restarting...");
    // Confirm the offset so the /update message is not reprocessed after
    // restart.
    let _ = http_agent()
        .get(&format!(
            "https://api.telegram.org/bot{}/getUpdates?offset={offset}&timeout=1",
            config.bot_token
        ))
        .call();
    std::process::exit(0);
}

// ── System stats ────────────────────────────────────────────────────────

fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Machine stats for /stats (works on Linux and macOS).
pub(crate) fn get_system_stats() -> String {
    let mut out = String::new();

    let hostname = command_stdout("hostname", &[]).unwrap_or_else(|| "unknown".to_string());
    out.push_str(&format!("🖥 {hostname}\n\n"));

    if let Some(uptime) = command_stdout("uptime", &[]) {
        out.push_str(&format!("⏱ {uptime}\n"));
    }

    if let Some(arch) = command_stdout("uname", &["-m"]) {
        let cores = command_stdout("nproc", &[])
            .or_else(|| command_stdout("sysctl", &["-n", "hw.ncpu"]))
            .unwrap_or_default();
        out.push_str(&format!("🧠 CPU: {cores} cores ({arch})\n"));
    }

    if let Some(free) = command_stdout("free", &["-h"]) {
        for line in free.lines() {
            if let Some(rest) = line.strip_prefix("Mem:") {
                let fields: Vec<&str> = rest.split_whitespace().collect();
                if fields.len() >= 6 {
                    out.push_str(&format!(
                        "💾 RAM: {} used / {} total (available: {})\n",
                        fields[1], fields[0], fields[5]
                    ));
                }
                break;
            }
        }
    } else if let Some(total) = command_stdout("sysctl", &["-n", "hw.memsize"]) {
        if let Ok(total_bytes) = total.parse::<u64>() {
            let total_gb = total_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
            out.push_str(&format!("💾 RAM: {total_gb:.1} GB total\n"));
        }
    }

    for mount in ["/", "/home"] {
        if let Some(df) = command_stdout("df", &["-h", mount]) {
            if let Some(line) = df.lines().nth(1) {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() >= 5 {
                    out.push_str(&format!(
                        "💿 Disk {mount}: {} used / {} ({})\n",
                        fields[2], fields[1], fields[4]
                    ));
                }
            }
        }
    }

    if let Some(tmux) = tmux_path() {
        if let Some(sessions) = command_stdout(&tmux.to_string_lossy(), &["list-sessions"]) {
            if !sessions.is_empty() {
                out.push_str(&format!("\n📟 Tmux sessions: {}\n", sessions.lines().count()));
                out.push_str(&sessions);
            }
        }
    }

    out
}

// ── Setup wizard ────────────────────────────────────────────────────────

fn poll_updates(bot_token: &str, offset: i64, timeout_secs: u32) -> Result<UpdateResponse, Box<dyn std::error::Error>> {
    let url = format!(
        "https://api.telegram.org/bot{bot_token}/getUpdates?offset={offset}&timeout={timeout_secs}"
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
    Ok(serde_json::from_str(&body)?)
}

/// Interactive bootstrap: bot token → authorized user → optional group →
/// hook + skill + service install.
pub(crate) fn setup(bot_token: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("🚀 Claude Code Companion Setup");
    println!("==============================");
    println!();

    let mut config = Config {
        bot_token: bot_token.to_string(),
        ..Config::default()
    };

    // Step 1: learn the authorized user's chat id from their first
    // message.
    println!("Step 1/4: Connecting to Telegram...");
    println!("📱 Send any message to your bot in Telegram");
    println!("   Waiting...");

    let mut offset = 0i64;
    'connected: loop {
        let updates = poll_updates(bot_token, offset, 30).map_err(|e| format!("failed to get updates: {e}"))?;
        if !updates.ok {
            return Err("telegram API error - check your bot token".into());
        }
        for update in updates.result {
            offset = update.update_id + 1;
            if let Some(msg) = &update.message {
                if msg.chat.id != 0 {
                    config.chat_id = msg.chat.id;
                    save_config(&config).map_err(|e| format!("failed to save config: {e}"))?;
                    println!("✅ Connected! (User: @{})\n", msg.from.username);
                    break 'connected;
                }
            }
        }
        thread::sleep(Duration::from_secs(1));
    }

    // Step 2: optional group for session topics.
    println!("Step 2/4: Group setup (optional)");
    println!("   For session topics, create a Telegram group with Topics enabled,");
    println!("   add your bot as admin, and send a message there.");
    println!("   Waiting 30 seconds for group message...");

    let deadline = Instant::now() + Duration::from_secs(30);
    'group: while Instant::now() < deadline {
        let Ok(updates) = poll_updates(bot_token, offset, 5) else {
            continue;
        };
        for update in updates.result {
            offset = update.update_id + 1;
            if let Some(msg) = &update.message {
                if msg.chat.kind == "supergroup" {
                    config.group_id = msg.chat.id;
                    let _ = save_config(&config);
                    println!("✅ Group configured!\n");
                    break 'group;
                }
            }
        }
    }
    if config.group_id == 0 {
        println!("⏭️  Skipped (you can run 'ccc setgroup' later)");
    }

    // Step 3: Claude hook and skill.
    println!("Step 3/4: Installing Claude hook and skill...");
    if let Err(err) = install_hook() {
        println!("⚠️  Hook installation failed: {err}");
        println!("   You can install it later with: ccc install");
    }
    if let Err(err) = install_skill() {
        println!("⚠️  Skill installation failed: {err}");
    } else {
        println!();
    }

    // Step 4: background service.
    println!("Step 4/4: Installing background service...");
    if let Err(err) = install_service() {
        println!("⚠️  Service installation failed: {err}");
        println!("   You can start manually with: ccc listen");
    } else {
        println!();
    }

    println!("==============================");
    println!("✅ Setup complete!");
    println!();
    println!("Usage:");
    println!("  ccc           Start Claude Code in current directory");
    println!("  ccc -c        Continue previous session");
    println!();
    if config.group_id != 0 {
        println!("Telegram commands (in your group):");
        println!("  /new <name>   Create new session");
    } else {
        println!("To enable Telegram session topics:");
        println!("  1. Create a group with Topics enabled");
        println!("  2. Add bot as admin");
        println!("  3. Run: ccc setgroup");
    }

    Ok(())
}

/// Capture the next supergroup message from the authorized user as the
/// session-topic group.
pub(crate) fn set_group(config: &mut Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("Send a message in the group where you want to use topics...");
    println!("(Make sure Topics are enabled in group settings)");

    let mut offset = 0i64;
    loop {
        let updates = match poll_updates(&config.bot_token, offset, 30) {
            Ok(u) => u,
            Err(_) => continue,
        };
        for update in updates.result {
            offset = update.update_id + 1;
            if let Some(msg) = &update.message {
                if msg.chat.kind == "supergroup" && msg.from.id == config.chat_id {
                    config.group_id = msg.chat.id;
                    save_config(config)?;
                    println!("Group set: {}", msg.chat.id);
                    println!("You can now create sessions with: /new <name>");
                    return Ok(());
                }
            }
        }
    }
}

// ── Doctor ──────────────────────────────────────────────────────────────

pub(crate) fn doctor() {
    println!("🩺 ccc doctor");
    println!("=============");
    println!();

    let mut all_good = true;

    print!("tmux.............. ");
    match tmux_path() {
        Some(path) => println!("✅ {}", path.display()),
        None => {
            println!("❌ not found");
            println!("   Install: brew install tmux (macOS) or apt install tmux (Linux)");
            all_good = false;
        }
    }

    print!("claude............ ");
    match claude_path() {
        Some(path) => println!("✅ {}", path.display()),
        None => {
            println!("❌ not found");
            println!("   Install: npm install -g @anthropic-ai/claude-code");
            all_good = false;
        }
    }

    print!("ccc in PATH....... ");
    let bin_ccc = home_dir().join("bin").join("ccc");
    if bin_ccc.is_file() {
        println!("✅ {}", bin_ccc.display());
    } else {
        println!("❌ not found");
        println!("   Run: cargo install --path . (from ccc repo) or cp ccc ~/bin/");
        all_good = false;
    }

    print!("config............ ");
    let config = match load_config() {
        Ok(config) => {
            println!("✅ {}", crate::config_path().display());

            print!("  bot_token....... ");
            if !config.bot_token.is_empty() {
                println!("✅ configured");
            } else {
                println!("❌ missing");
                all_good = false;
            }

            print!("  chat_id......... ");
            if config.chat_id != 0 {
                println!("✅ {}", config.chat_id);
            } else {
                println!("❌ missing");
                all_good = false;
            }

            print!("  group_id........ ");
            if config.group_id != 0 {
                println!("✅ {}", config.group_id);
            } else {
                println!("⚠️  not set (optional, run: ccc setgroup)");
            }
            Some(config)
        }
        Err(_) => {
            println!("❌ not found");
            println!("   Run: ccc setup <bot_token>");
            all_good = false;
            None
        }
    };

    print!("claude hook....... ");
    let settings_path = home_dir().join(".claude").join("settings.json");
    match fs::read(&settings_path) {
        Ok(data) => match serde_json::from_slice::<serde_json::Value>(&data) {
            Ok(settings) => {
                let has_pre = settings["hooks"]["PreToolUse"]
                    .as_array()
                    .map(|arr| !arr.is_empty())
                    .unwrap_or(false);
                if has_pre {
                    println!("✅ installed (AskUserQuestion)");
                } else {
                    println!("⚠️  optional (run: ccc install for AskUserQuestion hook)");
                }
            }
            Err(_) => println!("⚠️  settings.json parse error"),
        },
        Err(_) => println!("⚠️  ~/.claude/settings.json not found"),
    }

    print!("service........... ");
    if Path::new("/Library").exists() {
        let plist_path = home_dir().join("Library").join("LaunchAgents").join("com.ccc.plist");
        if plist_path.exists() {
            let loaded = Command::new("launchctl")
                .args(["list", "com.ccc"])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false);
            if loaded {
                println!("✅ running (launchd)");
            } else {
                println!("⚠️  installed but not running");
                println!("   Run: launchctl load ~/Library/LaunchAgents/com.ccc.plist");
            }
        } else {
            println!("❌ not installed");
            println!("   Run: ccc setup <token> (or manually create plist)");
            all_good = false;
        }
    } else {
        let active = command_stdout("systemctl", &["--user", "is-active", "ccc"])
            .map(|s| s == "active")
            .unwrap_or(false);
        if active {
            println!("✅ running (systemd)");
        } else {
            let service_path = home_dir()
                .join(".config")
                .join("systemd")
                .join("user")
                .join("ccc.service");
            if service_path.exists() {
                println!("⚠️  installed but not running");
                println!("   Run: systemctl --user start ccc");
            } else {
                println!("❌ not installed");
                println!("   Run: ccc setup <token> (or manually create service)");
                all_good = false;
            }
        }
    }

    print!("transcriber....... ");
    if let Some(config) = config.as_ref().filter(|c| !c.transcription_cmd.is_empty()) {
        println!("✅ {}", config.transcription_cmd);
    } else if let Some(found) = crate::search_transcriber() {
        println!("✅ {found}");
    } else {
        println!("⚠️  not found (set transcription_cmd or install whisper-cli)");
    }

    print!("oauth token....... ");
    if config.as_ref().map(|c| !c.oauth_token.is_empty()).unwrap_or(false) {
        println!("✅ configured (in config)");
    } else if std::env::var("CLAUDE_CODE_OAUTH_TOKEN").is_ok() {
        println!("✅ configured (from environment)");
    } else {
        println!("⚠️  not set (optional)");
    }

    println!();
    if all_good {
        println!("✅ All checks passed!");
    } else {
        println!("❌ Some issues found. Fix them and run 'ccc doctor' again.");
    }
}

// ── Away-mode notification ──────────────────────────────────────────────

/// `ccc <message>`: forward a note to the cwd session's topic (or the
/// private chat) when away mode is on.
pub(crate) fn send_notification(message: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config().map_err(|_| "not configured. Run: ccc setup <bot_token>")?;

    if !config.away {
        println!("Away mode off, skipping notification.");
        return Ok(());
    }

    if config.group_id != 0 {
        let cwd = std::env::current_dir()?.to_string_lossy().into_owned();
        if let Some((_, topic_id)) = crate::get_session_by_cwd(&config, &cwd) {
            return send_message(&config, config.group_id, topic_id, message);
        }
    }

    send_message(&config, config.chat_id, 0, message)
}

// ── OAuth dance ─────────────────────────────────────────────────────────

/// Drive `claude` through its OAuth login inside a scratch tmux session,
/// relaying the URL to the user and waiting for the pasted code.
pub(crate) fn handle_auth(config: &Config, chat_id: i64, thread_id: i64) {
    if AUTH_IN_PROGRESS.swap(true, Ordering::SeqCst) {
        let _ = send_message(config, chat_id, thread_id, "⚠️ Auth already in progress");
        return;
    }

    let _ = send_message(config, chat_id, thread_id, "🔐 Starting Claude auth...");

    let _ = kill_tmux_session(AUTH_TMUX_SESSION);
    thread::sleep(Duration::from_millis(500));

    let Some(tmux) = tmux_path() else {
        let _ = send_message(config, chat_id, thread_id, "❌ tmux binary not found");
        AUTH_IN_PROGRESS.store(false, Ordering::SeqCst);
        return;
    };
    let home = home_dir();
    let created = Command::new(tmux)
        .args(["new-session", "-d", "-s", AUTH_TMUX_SESSION, "-c"])
        .arg(&home)
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !created {
        let _ = send_message(config, chat_id, thread_id, "❌ Failed to create tmux session");
        AUTH_IN_PROGRESS.store(false, Ordering::SeqCst);
        return;
    }

    thread::sleep(Duration::from_millis(500));
    let claude_cmd = claude_path()
        .map(|p| format!("{} --dangerously-skip-permissions", p.display()))
        .unwrap_or_else(|| "claude --dangerously-skip-permissions".to_string());
    let _ = Command::new(tmux)
        .args(["send-keys", "-t", AUTH_TMUX_SESSION, &claude_cmd, "C-m"])
        .status();

    let mut oauth_url = String::new();
    for _ in 0..30 {
        thread::sleep(Duration::from_millis(500));
        let Some(pane) = capture_pane(AUTH_TMUX_SESSION, 30) else {
            continue;
        };

        if pane.contains("Dark mode") || pane.contains('❯') || pane.contains("Welcome back") {
            let _ = send_message(config, chat_id, thread_id, "✅ Claude is already authenticated!");
            let _ = kill_tmux_session(AUTH_TMUX_SESSION);
            AUTH_IN_PROGRESS.store(false, Ordering::SeqCst);
            return;
        }

        if pane.contains("claude.ai/oauth/authorize") {
            // The URL wraps across pane lines; stitch it back together.
            let mut capturing = false;
            for line in pane.lines() {
                let line = line.trim();
                if line.starts_with("https://claude.ai/oauth/") {
                    oauth_url = line.to_string();
                    capturing = true;
                } else if capturing
                    && !line.is_empty()
                    && !line.contains("Paste code")
                    && !line.contains("Browser")
                {
                    oauth_url.push_str(line);
                } else if capturing {
                    capturing = false;
                }
            }
            break;
        }
    }

    if oauth_url.is_empty() {
        let _ = send_message(config, chat_id, thread_id, "❌ Could not find OAuth URL. Try again.");
        let _ = kill_tmux_session(AUTH_TMUX_SESSION);
        AUTH_IN_PROGRESS.store(false, Ordering::SeqCst);
        return;
    }

    AUTH_WAITING_CODE.store(true, Ordering::SeqCst);
    let _ = send_message(
        config,
        chat_id,
        thread_id,
        &format!("🔗 Open this URL and authorize:\n\n{oauth_url}\n\nThen paste the code here."),
    );
}

pub(crate) fn handle_auth_code(config: &Config, chat_id: i64, thread_id: i64, code: &str) {
    AUTH_WAITING_CODE.store(false, Ordering::SeqCst);
    let code = code.trim();

    let _ = send_message(config, chat_id, thread_id, "🔄 Sending code to Claude...");

    let _ = send_to_tmux_raw(AUTH_TMUX_SESSION, code);

    for _ in 0..10 {
        thread::sleep(Duration::from_secs(2));
        let pane = capture_pane(AUTH_TMUX_SESSION, 0).unwrap_or_default();

        if pane.contains("Yes, I accept") {
            send_key(AUTH_TMUX_SESSION, "Down");
            thread::sleep(Duration::from_millis(200));
            send_key(AUTH_TMUX_SESSION, "C-m");
            continue;
        }
        if pane.contains("Press Enter") || pane.contains("Enter to confirm") {
            send_key(AUTH_TMUX_SESSION, "C-m");
            continue;
        }
        if pane.contains('❯') {
            let _ = send_message(config, chat_id, thread_id, "✅ Auth successful! Claude is ready.");
            let _ = kill_tmux_session(AUTH_TMUX_SESSION);
            AUTH_IN_PROGRESS.store(false, Ordering::SeqCst);
            return;
        }
    }

    let pane = capture_pane(AUTH_TMUX_SESSION, 0).unwrap_or_default();
    if pane.contains("Login successful") || pane.contains('❯') {
        let _ = send_message(config, chat_id, thread_id, "✅ Auth successful!");
    } else {
        let _ = send_message(config, chat_id, thread_id, "⚠️ Auth may have failed. Check the host manually.");
    }

    let _ = kill_tmux_session(AUTH_TMUX_SESSION);
    AUTH_IN_PROGRESS.store(false, Ordering::SeqCst);
}

fn send_to_tmux_raw(session: &str, text: &str) -> Result<(), Box<dyn std::error::Error>> {
    let tmux = tmux_path().ok_or("tmux binary not found")?;
    Command::new(tmux)
        .args(["send-keys", "-t", session, "-l", text])
        .status()?;
    thread::sleep(Duration::from_millis(200));
    Command::new(tmux)
        .args(["send-keys", "-t", session, "C-m"])
        .status()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_command_captures_output() {
        let (output, err) = execute_command("echo hello");
        assert_eq!(output, "hello");
        assert!(err.is_none());
    }

    #[test]
    fn test_execute_command_combines_stderr() {
        let (output, err) = execute_command("echo out; echo err >&2");
        assert!(output.contains("out"));
        assert!(output.contains("err"));
        assert!(err.is_none());
    }

    #[test]
    fn test_execute_command_nonzero_exit() {
        let (output, err) = execute_command("echo boom; exit 3");
        assert!(output.contains("boom"));
        assert!(err.is_some());
    }

    #[test]
    fn test_execute_command_empty_output() {
        let (output, err) = execute_command("true");
        assert_eq!(output, "(no output)");
        assert!(err.is_none());
    }

    #[test]
    fn test_run_with_deadline_kills_on_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let start = Instant::now();
        let (_, timed_out, _) = run_with_deadline(cmd, Duration::from_millis(300)).unwrap();
        assert!(timed_out);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_get_system_stats_has_hostname_header() {
        let stats = get_system_stats();
        assert!(stats.starts_with("🖥 "));
    }
}
