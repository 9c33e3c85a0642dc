mod cli;
mod commands;
mod config;
mod headless;
mod hooks;
mod listen;
mod monitor;
mod relay;
mod router;
mod service;
mod session;
mod telegram;
mod tmux;
mod types;
mod util;

// Everything is re-exported at the crate root: the modules form one
// program, not a library surface, and cross-module references stay flat.
#[allow(unused_imports)]
pub(crate) use cli::*;
#[allow(unused_imports)]
pub(crate) use commands::*;
#[allow(unused_imports)]
pub(crate) use config::*;
#[allow(unused_imports)]
pub(crate) use headless::*;
#[allow(unused_imports)]
pub(crate) use hooks::*;
#[allow(unused_imports)]
pub(crate) use listen::*;
#[allow(unused_imports)]
pub(crate) use monitor::*;
#[allow(unused_imports)]
pub(crate) use relay::*;
#[allow(unused_imports)]
pub(crate) use router::*;
#[allow(unused_imports)]
pub(crate) use service::*;
#[allow(unused_imports)]
pub(crate) use session::*;
#[allow(unused_imports)]
pub(crate) use telegram::*;
#[allow(unused_imports)]
pub(crate) use tmux::*;
#[allow(unused_imports)]
pub(crate) use types::*;
#[allow(unused_imports)]
pub(crate) use util::*;

use clap::Parser;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        // No subcommand: start/attach the tmux session for the current
        // directory.
        return start_session(cli.continue_session);
    };

    match command {
        Command::Run { continue_session } => run_claude_raw(continue_session),

        Command::Setup { bot_token } => setup(&bot_token),

        Command::Setgroup => {
            let mut config = load_config()?;
            set_group(&mut config)
        }

        Command::Listen => listen::listen(),

        Command::Headless => run_headless(),

        Command::HeadlessStart { name, path, prompt } => headless_start(&name, &path, &prompt),

        Command::Start { name, work_dir, prompt } => start_detached(&name, &work_dir, &prompt),

        Command::Send { file } => handle_send_file(&file),

        Command::Relay { port } => run_relay_server(port),

        Command::Install => {
            install_hook()?;
            install_skill()?;
            install_service()
        }

        Command::Uninstall => {
            if let Err(err) = uninstall_hook() {
                eprintln!("Warning: Could not uninstall hooks: {err}");
            }
            uninstall_skill();
            println!("✅ CCC uninstalled");
            Ok(())
        }

        Command::Config { key, value } => handle_config_command(key.as_deref(), value.as_deref()),

        Command::Doctor => {
            doctor();
            Ok(())
        }

        Command::Hook => handle_hook(),
        Command::HookPrompt => handle_prompt_hook(),
        Command::HookQuestion => handle_question_hook(),
        Command::HookOutput => handle_output_hook(),
        Command::HookNotification => handle_notification_hook(),
        Command::HookPermission => handle_permission_hook(),

        Command::Notify(words) => send_notification(&words.join(" ")),
    }
}

fn handle_config_command(key: Option<&str>, value: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config()?;

    let Some(key) = key else {
        println!("projects_dir: {}", get_projects_dir(&config));
        if !config.oauth_token.is_empty() {
            println!("oauth_token: configured");
        } else {
            println!("oauth_token: not set");
        }
        if !config.transcription_lang.is_empty() {
            println!("transcription_lang: {}", config.transcription_lang);
        } else {
            println!("transcription_lang: not set (auto-detect)");
        }
        println!();
        println!("Usage: ccc config <key> <value>");
        println!("  ccc config projects-dir ~/Projects");
        println!("  ccc config oauth-token <token>");
        println!("  ccc config transcription-lang es");
        return Ok(());
    };

    let Some(value) = value else {
        match key {
            "projects-dir" => println!("{}", get_projects_dir(&config)),
            "oauth-token" => println!("{}", configured_or_not(&config.oauth_token)),
            "bot-token" => println!("{}", configured_or_not(&config.bot_token)),
            "transcription-lang" => {
                if config.transcription_lang.is_empty() {
                    println!("not set (auto-detect)");
                } else {
                    println!("{}", config.transcription_lang);
                }
            }
            _ => return Err(format!("Unknown config key: {key}").into()),
        }
        return Ok(());
    };

    match key {
        "projects-dir" => {
            config.projects_dir = value.to_string();
            save_config(&config).map_err(|e| format!("Error saving config: {e}"))?;
            println!("✅ projects_dir set to: {}", get_projects_dir(&config));
        }
        "oauth-token" => {
            config.oauth_token = value.to_string();
            save_config(&config).map_err(|e| format!("Error saving config: {e}"))?;
            println!("✅ OAuth token saved");
        }
        "bot-token" => {
            config.bot_token = value.to_string();
            save_config(&config).map_err(|e| format!("Error saving config: {e}"))?;
            println!("✅ Bot token saved");
        }
        "transcription-lang" => {
            config.transcription_lang = value.to_string();
            save_config(&config).map_err(|e| format!("Error saving config: {e}"))?;
            println!("✅ Transcription language set to: {value}");
        }
        _ => return Err(format!("Unknown config key: {key}").into()),
    }
    Ok(())
}

fn configured_or_not(value: &str) -> &'static str {
    if value.is_empty() {
        "not set"
    } else {
        "configured"
    }
}
