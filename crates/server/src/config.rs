use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub upload_dir: PathBuf,
    pub upload_public_prefix: String,
    pub max_upload_bytes: usize,
    /// Cap on lines replayed to a fresh socket; `None` replays everything.
    pub history_replay_limit: Option<u32>,
    pub end_session_on_disconnect: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8000".into(),
            database_url: "sqlite://./data/chat.db".into(),
            upload_dir: PathBuf::from("./data/uploads"),
            upload_public_prefix: "/static/uploads".into(),
            max_upload_bytes: 5 * 1024 * 1024,
            history_replay_limit: None,
            end_session_on_disconnect: true,
        }
    }
}

/// Optional overrides read from `server.toml`.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    upload_dir: Option<String>,
    max_upload_bytes: Option<usize>,
    history_replay_limit: Option<u32>,
    end_session_on_disconnect: Option<bool>,
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Err(error) = apply_file_settings(&mut settings, &raw) {
            tracing::warn!(%error, "ignoring malformed server.toml");
        }
    }

    apply_env_settings(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file_settings(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw).context("failed to parse server.toml")?;

    if let Some(v) = file_cfg.bind_addr {
        settings.server_bind = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.upload_dir {
        settings.upload_dir = PathBuf::from(v);
    }
    if let Some(v) = file_cfg.max_upload_bytes {
        settings.max_upload_bytes = v;
    }
    if let Some(v) = file_cfg.history_replay_limit {
        settings.history_replay_limit = Some(v);
    }
    if let Some(v) = file_cfg.end_session_on_disconnect {
        settings.end_session_on_disconnect = v;
    }
    Ok(())
}

fn apply_env_settings(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = lookup("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = lookup("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = lookup("APP__UPLOAD_DIR") {
        settings.upload_dir = PathBuf::from(v);
    }

    if let Some(v) = lookup("APP__MAX_UPLOAD_BYTES") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.max_upload_bytes = parsed;
        }
    }

    if let Some(v) = lookup("APP__HISTORY_REPLAY_LIMIT") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.history_replay_limit = Some(parsed);
        }
    }

    if let Some(v) = lookup("APP__END_SESSION_ON_DISCONNECT") {
        if let Ok(parsed) = v.parse::<bool>() {
            settings.end_session_on_disconnect = parsed;
        }
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
