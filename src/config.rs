use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::{home_dir, Config, SessionInfo};

pub(crate) fn config_path() -> PathBuf {
    home_dir().join(".ccc.json")
}

pub(crate) fn load_config() -> Result<Config, Box<dyn std::error::Error>> {
    load_config_from(&config_path())
}

pub(crate) fn load_config_from(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    let data = fs::read(path)?;
    let raw: serde_json::Value = serde_json::from_slice(&data)?;

    // Older versions stored sessions as {name: topic_id}. Detect the
    // integer-valued map and migrate in place.
    let legacy_sessions = raw
        .get("sessions")
        .and_then(|s| s.as_object())
        .filter(|map| !map.is_empty() && map.values().all(|v| v.is_i64()))
        .map(|map| {
            map.iter()
                .filter_map(|(name, v)| v.as_i64().map(|id| (name.clone(), id)))
                .collect::<HashMap<String, i64>>()
        });

    let config: Config = if let Some(old) = legacy_sessions {
        let mut partial = raw;
        if let Some(obj) = partial.as_object_mut() {
            obj.remove("sessions");
        }
        let mut config: Config = serde_json::from_value(partial)?;
        for (name, topic_id) in old {
            let path = resolve_project_path(&config, &name);
            config.sessions.insert(
                name,
                SessionInfo {
                    topic_id,
                    path,
                    claude_session_id: None,
                },
            );
        }
        save_config_to(path, &config)?;
        config
    } else {
        serde_json::from_slice(&data)?
    };

    Ok(config)
}

pub(crate) fn save_config(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    save_config_to(&config_path(), config)
}

pub(crate) fn save_config_to(path: &Path, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let data = serde_json::to_vec_pretty(config)?;
    fs::write(path, data)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

/// Base directory for new projects. Defaults to the home directory.
pub(crate) fn get_projects_dir(config: &Config) -> String {
    if !config.projects_dir.is_empty() {
        return expand_path(&config.projects_dir);
    }
    home_dir().to_string_lossy().into_owned()
}

/// Resolve the full path for a project. A leading `/` is taken verbatim,
/// `~`/`~/` expands to home, anything else lands under the projects dir.
pub(crate) fn resolve_project_path(config: &Config, name: &str) -> String {
    if name.starts_with('/') {
        return name.to_string();
    }
    if name == "~" {
        return home_dir().to_string_lossy().into_owned();
    }
    if let Some(rest) = name.strip_prefix("~/") {
        return home_dir().join(rest).to_string_lossy().into_owned();
    }
    Path::new(&get_projects_dir(config))
        .join(name)
        .to_string_lossy()
        .into_owned()
}

pub(crate) fn expand_path(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        return home_dir().join(rest).to_string_lossy().into_owned();
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("ccc_test_config");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("{}_{name}.json", std::process::id()))
    }

    #[test]
    fn test_round_trip() {
        let path = temp_config_file("round_trip");
        let mut config = Config {
            bot_token: "123:abc".to_string(),
            chat_id: 42,
            group_id: -100,
            ..Config::default()
        };
        config.sessions.insert(
            "proj".to_string(),
            SessionInfo {
                topic_id: 7,
                path: "/tmp/proj".to_string(),
                claude_session_id: Some("sid-1".to_string()),
            },
        );
        save_config_to(&path, &config).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.bot_token, "123:abc");
        assert_eq!(loaded.chat_id, 42);
        assert_eq!(loaded.group_id, -100);
        let sess = loaded.sessions.get("proj").unwrap();
        assert_eq!(sess.topic_id, 7);
        assert_eq!(sess.path, "/tmp/proj");
        assert_eq!(sess.claude_session_id.as_deref(), Some("sid-1"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_legacy_sessions_migrate() {
        let path = temp_config_file("legacy");
        std::fs::write(
            &path,
            r#"{"bot_token":"t","chat_id":1,"group_id":2,"projects_dir":"/srv/projects","sessions":{"foo":42}}"#,
        )
        .unwrap();

        let loaded = load_config_from(&path).unwrap();
        let sess = loaded.sessions.get("foo").unwrap();
        assert_eq!(sess.topic_id, 42);
        assert_eq!(sess.path, "/srv/projects/foo");
        assert!(sess.claude_session_id.is_none());

        // Migration rewrites the file in the new record form.
        let rewritten = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rewritten).unwrap();
        assert!(value["sessions"]["foo"]["topic_id"].is_i64());

        // A second load sees the new format and leaves it alone.
        let again = load_config_from(&path).unwrap();
        assert_eq!(again.sessions.get("foo").unwrap().topic_id, 42);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_legacy_absolute_and_home_names() {
        let path = temp_config_file("legacy_paths");
        std::fs::write(
            &path,
            r#"{"bot_token":"t","chat_id":1,"sessions":{"/opt/thing":5,"~/code/x":6}}"#,
        )
        .unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.sessions.get("/opt/thing").unwrap().path, "/opt/thing");
        let home_path = &loaded.sessions.get("~/code/x").unwrap().path;
        assert!(home_path.ends_with("/code/x"));
        assert!(!home_path.starts_with('~'));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_resolve_project_path() {
        let config = Config {
            projects_dir: "/srv/projects".to_string(),
            ..Config::default()
        };
        assert_eq!(resolve_project_path(&config, "/abs/path"), "/abs/path");
        assert_eq!(resolve_project_path(&config, "myproj"), "/srv/projects/myproj");
        let home = resolve_project_path(&config, "~/work");
        assert!(home.ends_with("/work"));
        assert!(!home.starts_with('~'));
    }

    #[test]
    fn test_projects_dir_defaults_to_home() {
        let config = Config::default();
        assert_eq!(get_projects_dir(&config), home_dir().to_string_lossy());
    }

    #[test]
    fn test_config_file_mode() {
        let path = temp_config_file("mode");
        save_config_to(&path, &Config::default()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let _ = std::fs::remove_file(&path);
    }
}
