use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_JWT_SECRET: &str = "dev-insecure-secret";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
    pub handshake_timeout_seconds: u64,
    pub outbound_queue_capacity: usize,
    pub history_page_limit: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8000".into(),
            database_url: "sqlite://./data/server.db".into(),
            jwt_secret: DEFAULT_JWT_SECRET.into(),
            token_ttl_seconds: 60 * 60 * 24,
            handshake_timeout_seconds: 10,
            outbound_queue_capacity: 256,
            history_page_limit: 50,
        }
    }
}

impl Settings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    fn apply_file(&mut self, file_cfg: &HashMap<String, String>) {
        if let Some(v) = file_cfg.get("bind_addr") {
            self.server_bind = v.clone();
        }
        if let Some(v) = file_cfg.get("database_url") {
            self.database_url = v.clone();
        }
        if let Some(v) = file_cfg.get("jwt_secret") {
            self.jwt_secret = v.clone();
        }
        if let Some(v) = file_cfg.get("token_ttl_seconds") {
            parse_into(&mut self.token_ttl_seconds, "token_ttl_seconds", v);
        }
        if let Some(v) = file_cfg.get("handshake_timeout_seconds") {
            parse_into(
                &mut self.handshake_timeout_seconds,
                "handshake_timeout_seconds",
                v,
            );
        }
        if let Some(v) = file_cfg.get("outbound_queue_capacity") {
            parse_into(
                &mut self.outbound_queue_capacity,
                "outbound_queue_capacity",
                v,
            );
        }
        if let Some(v) = file_cfg.get("history_page_limit") {
            parse_into(&mut self.history_page_limit, "history_page_limit", v);
        }
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("SERVER_BIND") {
            self.server_bind = v;
        }
        if let Some(v) = env("APP__BIND_ADDR") {
            self.server_bind = v;
        }

        if let Some(v) = env("DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = env("APP__DATABASE_URL") {
            self.database_url = v;
        }

        if let Some(v) = env("APP__JWT_SECRET") {
            self.jwt_secret = v;
        }
        if let Some(v) = env("APP__TOKEN_TTL_SECONDS") {
            parse_into(&mut self.token_ttl_seconds, "APP__TOKEN_TTL_SECONDS", &v);
        }
        if let Some(v) = env("APP__HANDSHAKE_TIMEOUT_SECONDS") {
            parse_into(
                &mut self.handshake_timeout_seconds,
                "APP__HANDSHAKE_TIMEOUT_SECONDS",
                &v,
            );
        }
        if let Some(v) = env("APP__OUTBOUND_QUEUE_CAPACITY") {
            parse_into(
                &mut self.outbound_queue_capacity,
                "APP__OUTBOUND_QUEUE_CAPACITY",
                &v,
            );
        }
        if let Some(v) = env("APP__HISTORY_PAGE_LIMIT") {
            parse_into(&mut self.history_page_limit, "APP__HISTORY_PAGE_LIMIT", &v);
        }

        self.outbound_queue_capacity = self.outbound_queue_capacity.max(1);
    }
}

/// Defaults, then `server.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => settings.apply_file(&file_cfg),
            Err(error) => warn!(%error, "ignoring unreadable server.toml"),
        }
    }

    settings.apply_env(|key| std::env::var(key).ok());
    settings
}

fn parse_into<T: FromStr>(target: &mut T, key: &str, raw: &str) {
    match raw.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(key, value = raw, "ignoring invalid setting"),
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
