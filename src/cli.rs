use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ccc")]
#[command(about = "Claude Code Companion - control Claude Code sessions remotely via Telegram and tmux")]
#[command(version, disable_version_flag = true)]
pub(crate) struct Cli {
    /// Continue the previous Claude conversation when starting.
    #[arg(short = 'c')]
    pub(crate) continue_session: bool,

    /// Print version.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    pub(crate) version: Option<bool>,

    #[command(subcommand)]
    pub(crate) command: Option<Command>,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run claude directly (used inside tmux sessions).
    Run {
        /// Continue the previous conversation.
        #[arg(short = 'c')]
        continue_session: bool,
    },

    /// Complete setup: bot, authorized user, group, hook, service.
    Setup { bot_token: String },

    /// Configure the Telegram group used for session topics.
    Setgroup,

    /// Start the Telegram bot listener (interactive sessions via tmux).
    Listen,

    /// Start the Telegram bot listener in headless mode (no tmux).
    Headless,

    /// Create a session and submit one prompt non-interactively.
    HeadlessStart {
        name: String,
        path: String,
        prompt: String,
    },

    /// Create an interactive session and submit one prompt via tmux.
    Start {
        name: String,
        work_dir: String,
        prompt: String,
    },

    /// Send a file to the current session's Telegram topic.
    Send { file: PathBuf },

    /// Run the streaming relay server for large files.
    Relay {
        #[arg(default_value_t = 8080)]
        port: u16,
    },

    /// Install the Claude hooks, send skill and background service.
    Install,

    /// Remove the Claude hooks and send skill.
    Uninstall,

    /// Show or set configuration values.
    Config {
        /// projects-dir, oauth-token, bot-token or transcription-lang.
        key: Option<String>,
        value: Option<String>,
    },

    /// Check all dependencies and configuration.
    Doctor,

    // Internal entry points invoked by the installed Claude hooks.
    #[command(hide = true)]
    Hook,
    #[command(hide = true)]
    HookPrompt,
    #[command(hide = true)]
    HookQuestion,
    #[command(hide = true)]
    HookOutput,
    #[command(hide = true)]
    HookNotification,
    #[command(hide = true)]
    HookPermission,

    /// Anything else is an away-mode notification.
    #[command(external_subcommand)]
    Notify(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_args_is_start() {
        let cli = Cli::try_parse_from(["ccc"]).unwrap();
        assert!(!cli.continue_session);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_continue_flag() {
        let cli = Cli::try_parse_from(["ccc", "-c"]).unwrap();
        assert!(cli.continue_session);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_run_with_continue() {
        let cli = Cli::try_parse_from(["ccc", "run", "-c"]).unwrap();
        match cli.command {
            Some(Command::Run { continue_session }) => assert!(continue_session),
            _ => panic!("expected run subcommand"),
        }
    }

    #[test]
    fn test_relay_default_port() {
        let cli = Cli::try_parse_from(["ccc", "relay"]).unwrap();
        match cli.command {
            Some(Command::Relay { port }) => assert_eq!(port, 8080),
            _ => panic!("expected relay subcommand"),
        }
        let cli = Cli::try_parse_from(["ccc", "relay", "9000"]).unwrap();
        match cli.command {
            Some(Command::Relay { port }) => assert_eq!(port, 9000),
            _ => panic!("expected relay subcommand"),
        }
    }

    #[test]
    fn test_headless_start_args() {
        let cli =
            Cli::try_parse_from(["ccc", "headless-start", "proj", "/tmp/proj", "do things"]).unwrap();
        match cli.command {
            Some(Command::HeadlessStart { name, path, prompt }) => {
                assert_eq!(name, "proj");
                assert_eq!(path, "/tmp/proj");
                assert_eq!(prompt, "do things");
            }
            _ => panic!("expected headless-start subcommand"),
        }
    }

    #[test]
    fn test_free_text_becomes_notification() {
        let cli = Cli::try_parse_from(["ccc", "build", "finished"]).unwrap();
        match cli.command {
            Some(Command::Notify(words)) => assert_eq!(words, vec!["build", "finished"]),
            _ => panic!("expected notify fallback"),
        }
    }

    #[test]
    fn test_config_key_value() {
        let cli = Cli::try_parse_from(["ccc", "config", "projects-dir", "~/Projects"]).unwrap();
        match cli.command {
            Some(Command::Config { key, value }) => {
                assert_eq!(key.as_deref(), Some("projects-dir"));
                assert_eq!(value.as_deref(), Some("~/Projects"));
            }
            _ => panic!("expected config subcommand"),
        }
    }
}
