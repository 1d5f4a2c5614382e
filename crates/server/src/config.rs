use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub change_feed_poll_ms: u64,
    pub change_feed_batch: u32,
    pub event_buffer: usize,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/server.db".into(),
            change_feed_poll_ms: 250,
            change_feed_batch: 256,
            event_buffer: 1024,
            max_body_bytes: 64 * 1024,
        }
    }
}

impl Settings {
    pub fn change_feed_interval(&self) -> Duration {
        Duration::from_millis(self.change_feed_poll_ms.max(10))
    }
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string("server.toml").ok();
    settings_from_sources(file.as_deref(), |key| std::env::var(key).ok())
}

/// Defaults, then `server.toml`, then environment. Later sources win.
pub(crate) fn settings_from_sources(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        match toml::from_str::<HashMap<String, toml::Value>>(raw) {
            Ok(file_cfg) => {
                let text = |key: &str| file_cfg.get(key).map(value_text);
                if let Some(v) = text("bind_addr") {
                    settings.server_bind = v;
                }
                if let Some(v) = text("database_url") {
                    settings.database_url = v;
                }
                apply_numeric(&mut settings.change_feed_poll_ms, text("change_feed_poll_ms"));
                apply_numeric(&mut settings.change_feed_batch, text("change_feed_batch"));
                apply_numeric(&mut settings.event_buffer, text("event_buffer"));
                apply_numeric(&mut settings.max_body_bytes, text("max_body_bytes"));
            }
            Err(error) => warn!(%error, "ignoring unreadable server.toml"),
        }
    }

    if let Some(v) = env("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    apply_numeric(&mut settings.change_feed_poll_ms, env("APP__CHANGE_FEED_POLL_MS"));
    apply_numeric(&mut settings.change_feed_batch, env("APP__CHANGE_FEED_BATCH"));
    apply_numeric(&mut settings.event_buffer, env("APP__EVENT_BUFFER"));
    apply_numeric(&mut settings.max_body_bytes, env("APP__MAX_BODY_BYTES"));

    settings.change_feed_batch = settings.change_feed_batch.max(1);
    settings.event_buffer = settings.event_buffer.max(16);
    settings
}

fn value_text(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn apply_numeric<T: std::str::FromStr>(slot: &mut T, raw: Option<String>) {
    if let Some(raw) = raw {
        match raw.trim().parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!(value = %raw, "ignoring non-numeric setting"),
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
        return format!("sqlite:{path}");
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
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
