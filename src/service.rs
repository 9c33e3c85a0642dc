use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;

use crate::{ccc_path, home_dir, load_config};

/// Install the listener as a user service: launchd on macOS, systemd
/// elsewhere.
pub(crate) fn install_service() -> Result<(), Box<dyn std::error::Error>> {
    if Path::new("/Library").exists() {
        install_launchd_service()
    } else {
        install_systemd_service()
    }
}

fn install_launchd_service() -> Result<(), Box<dyn std::error::Error>> {
    let plist_dir = home_dir().join("Library").join("LaunchAgents");
    fs::create_dir_all(&plist_dir).map_err(|e| format!("failed to create LaunchAgents dir: {e}"))?;

    let plist_path = plist_dir.join("com.ccc.plist");
    let log_path = home_dir().join(".ccc.log");

    let plist = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>com.ccc</string>
    <key>ProgramArguments</key>
    <array>
        <string>{ccc}</string>
        <string>listen</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
    <key>StandardOutPath</key>
    <string>{log}</string>
    <key>StandardErrorPath</key>
    <string>{log}</string>
</dict>
</plist>
"#,
        ccc = ccc_path().display(),
        log = log_path.display(),
    );

    fs::write(&plist_path, plist).map_err(|e| format!("failed to write plist: {e}"))?;

    // Unload a previous copy before loading, or launchctl refuses.
    let _ = Command::new("launchctl").args(["unload"]).arg(&plist_path).status();
    let status = Command::new("launchctl").args(["load"]).arg(&plist_path).status()?;
    if !status.success() {
        return Err("failed to load service".into());
    }

    println!("✅ Service installed and started (launchd)");
    Ok(())
}

fn systemd_user_dir() -> Result<std::path::PathBuf, Box<dyn std::error::Error>> {
    let dir = home_dir().join(".config").join("systemd").join("user");
    fs::create_dir_all(&dir).map_err(|e| format!("failed to create systemd dir: {e}"))?;
    Ok(dir)
}

fn install_systemd_service() -> Result<(), Box<dyn std::error::Error>> {
    let service_path = systemd_user_dir()?.join("ccc.service");
    let service = format!(
        r#"[Unit]
Description=Claude Code Companion
After=network.target

[Service]
ExecStart={ccc} listen
Restart=always
RestartSec=10

[Install]
WantedBy=default.target
"#,
        ccc = ccc_path().display(),
    );

    fs::write(&service_path, service).map_err(|e| format!("failed to write service file: {e}"))?;

    let _ = Command::new("systemctl").args(["--user", "daemon-reload"]).status();
    let _ = Command::new("systemctl").args(["--user", "enable", "ccc"]).status();
    let status = Command::new("systemctl").args(["--user", "start", "ccc"]).status()?;
    if !status.success() {
        return Err("failed to start service".into());
    }

    println!("✅ Service installed and started (systemd)");
    Ok(())
}

/// Headless variant of the systemd service; carries the OAuth token in
/// the unit environment since there is no login shell in the chain.
pub(crate) fn install_headless_service() -> Result<(), Box<dyn std::error::Error>> {
    let service_path = systemd_user_dir()?.join("ccc-headless.service");

    let mut env_line = String::new();
    if let Ok(config) = load_config() {
        if !config.oauth_token.is_empty() {
            env_line = format!("Environment=CLAUDE_CODE_OAUTH_TOKEN={}", config.oauth_token);
        }
    }

    let service = format!(
        r#"[Unit]
Description=Claude Code Companion (Headless)
After=network.target

[Service]
ExecStart={ccc} headless
Restart=always
RestartSec=10
{env_line}

[Install]
WantedBy=default.target
"#,
        ccc = ccc_path().display(),
    );

    fs::write(&service_path, &service).map_err(|e| format!("failed to write service file: {e}"))?;
    fs::set_permissions(&service_path, fs::Permissions::from_mode(0o600))?;

    let _ = Command::new("systemctl").args(["--user", "daemon-reload"]).status();
    let _ = Command::new("systemctl").args(["--user", "enable", "ccc-headless"]).status();
    let status = Command::new("systemctl")
        .args(["--user", "start", "ccc-headless"])
        .status()?;
    if !status.success() {
        return Err("failed to start headless service".into());
    }

    println!("✅ Headless service installed and started (systemd)");
    Ok(())
}
