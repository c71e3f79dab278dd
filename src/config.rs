use std::env;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use tracing::warn;
use url::Url;

pub const DEFAULT_NOVITA_BASE_URL: &str = "https://api.novita.ai";
pub const DEFAULT_WEBHOOK_TASK_PREFIX: &str = "webhook_";
pub const DEFAULT_API_KEY_SETTING: &str = "novita_api_key";

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub bind_address: String,
    pub database_url: String,
    pub database_max_connections: u32,
    pub novita_api_key: String,
    pub novita_base_url: String,
    pub vendor_request_timeout_seconds: u64,
    pub webhook_task_prefix: String,
    pub api_key_setting_name: String,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn normalize_database_url(value: String) -> String {
    if value.starts_with("sqlite+aiosqlite://") {
        return value.replacen("sqlite+aiosqlite://", "sqlite://", 1);
    }
    value
}

fn normalize_base_url(value: &str) -> Result<String> {
    let trimmed = value.trim().trim_end_matches('/');
    let parsed =
        Url::parse(trimmed).map_err(|err| anyhow!("Invalid NOVITA_BASE_URL '{value}': {err}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(anyhow!(
            "NOVITA_BASE_URL must use http or https, got '{}'",
            parsed.scheme()
        ));
    }
    Ok(trimmed.to_string())
}

fn normalize_prefix(value: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        warn!(
            "WEBHOOK_TASK_PREFIX is empty; defaulting to '{}'.",
            DEFAULT_WEBHOOK_TASK_PREFIX
        );
        return DEFAULT_WEBHOOK_TASK_PREFIX.to_string();
    }
    trimmed.to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        let novita_base_url =
            normalize_base_url(&env_string("NOVITA_BASE_URL", DEFAULT_NOVITA_BASE_URL))?;

        Ok(Config {
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            bind_address: env_string("BIND_ADDRESS", "0.0.0.0:8080"),
            database_url: normalize_database_url(env_string(
                "DATABASE_URL",
                "sqlite://generation.db?mode=rwc",
            )),
            database_max_connections: env_u32("DATABASE_MAX_CONNECTIONS", 5).max(1),
            novita_api_key: env_string("NOVITA_API_KEY", "").trim().to_string(),
            novita_base_url,
            vendor_request_timeout_seconds: env_u64("VENDOR_REQUEST_TIMEOUT_SECONDS", 30),
            webhook_task_prefix: normalize_prefix(env_string(
                "WEBHOOK_TASK_PREFIX",
                DEFAULT_WEBHOOK_TASK_PREFIX,
            )),
            api_key_setting_name: env_string("API_KEY_SETTING_NAME", DEFAULT_API_KEY_SETTING),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_python_style_sqlite_urls() {
        assert_eq!(
            normalize_database_url("sqlite+aiosqlite:///bot.db".to_string()),
            "sqlite:///bot.db"
        );
        assert_eq!(
            normalize_database_url("sqlite://generation.db".to_string()),
            "sqlite://generation.db"
        );
    }

    #[test]
    fn base_url_loses_trailing_slash() {
        assert_eq!(
            normalize_base_url("https://api.novita.ai/").unwrap(),
            "https://api.novita.ai"
        );
    }

    #[test]
    fn rejects_non_http_base_url() {
        assert!(normalize_base_url("ftp://api.novita.ai").is_err());
        assert!(normalize_base_url("not a url").is_err());
    }

    #[test]
    fn blank_prefix_falls_back_to_default() {
        assert_eq!(normalize_prefix("   ".to_string()), DEFAULT_WEBHOOK_TASK_PREFIX);
        assert_eq!(normalize_prefix(" sd_ ".to_string()), "sd_");
    }
}
