use anyhow::Result;
use reqwest::Client;
use tracing::warn;

use crate::config::Config;
use crate::db::database::Database;

#[derive(Debug, Clone)]
pub struct VendorSettings {
    pub base_url: String,
    pub env_api_key: String,
    pub api_key_setting: String,
    pub webhook_prefix: String,
}

impl VendorSettings {
    pub fn from_config(config: &Config) -> Self {
        VendorSettings {
            base_url: config.novita_base_url.clone(),
            env_api_key: config.novita_api_key.clone(),
            api_key_setting: config.api_key_setting_name.clone(),
            webhook_prefix: config.webhook_task_prefix.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub http: Client,
    pub vendor: VendorSettings,
}

impl AppState {
    pub fn new(db: Database, http: Client, vendor: VendorSettings) -> Self {
        AppState { db, http, vendor }
    }

    /// Vendor key from the dashboard settings table, falling back to the
    /// environment. `None` when neither has one.
    pub async fn resolve_api_key(&self) -> Result<Option<String>> {
        let env_key = Some(self.vendor.env_api_key.trim())
            .filter(|key| !key.is_empty())
            .map(str::to_string);

        match self.db.get_setting(&self.vendor.api_key_setting).await {
            Ok(Some(value)) if !value.trim().is_empty() => Ok(Some(value.trim().to_string())),
            Ok(_) => Ok(env_key),
            Err(err) if env_key.is_some() => {
                warn!("Failed to read API key from settings, using environment: {err}");
                Ok(env_key)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
pub fn test_state(db: Database, base_url: &str, env_api_key: &str) -> AppState {
    AppState::new(
        db,
        Client::new(),
        VendorSettings {
            base_url: base_url.to_string(),
            env_api_key: env_api_key.to_string(),
            api_key_setting: crate::config::DEFAULT_API_KEY_SETTING.to_string(),
            webhook_prefix: crate::config::DEFAULT_WEBHOOK_TASK_PREFIX.to_string(),
        },
    )
}
