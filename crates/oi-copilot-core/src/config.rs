use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Result, anyhow};

use crate::ai::{DEFAULT_ENDPOINT, DEFAULT_MODEL};
use crate::store::{self, keys, KeyValueStore, StoreError};

/// Process-level settings. Credentials are not kept here; they live in the
/// synced store so every context reads the same values.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub endpoint: String,
    pub default_model: String,
    pub data_dir: Option<PathBuf>,
    /// Characters of page text embedded in an ask session's system prompt.
    pub page_context_chars: usize,
    /// Unresolved rewrites older than this are evicted on reapplication.
    pub rewrite_retention_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            data_dir: None,
            page_context_chars: 4000,
            rewrite_retention_days: 30,
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::get_config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::new());
        }

        let config_content = fs::read_to_string(config_path)?;
        let config: Config = serde_json::from_str(&config_content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config_content = serde_json::to_string_pretty(self)?;
        fs::write(config_path, config_content)?;
        Ok(())
    }

    /// Where the synced and local store files live.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow!("Could not determine data directory"))?;
        Ok(data_dir.join("oi-copilot"))
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("oi-copilot").join("config.json"))
    }
}

/// Completion credentials as stored in the synced scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub model_id: Option<String>,
}

impl Credentials {
    pub async fn load(synced: &dyn KeyValueStore) -> Result<Self, StoreError> {
        let api_key: Option<String> = store::load(synced, keys::API_KEY).await?;
        let model_id: Option<String> = store::load(synced, keys::MODEL_ID).await?;
        Ok(Self {
            api_key: api_key.filter(|k| !k.is_empty()),
            model_id: model_id.filter(|m| !m.is_empty()),
        })
    }

    /// Both values must be present; rejects empty strings like the settings form.
    pub async fn save(
        synced: &dyn KeyValueStore,
        api_key: &str,
        model_id: &str,
    ) -> Result<(), CredentialsError> {
        if api_key.is_empty() || model_id.is_empty() {
            return Err(CredentialsError::Incomplete);
        }
        store::save(synced, keys::API_KEY, api_key).await?;
        store::save(synced, keys::MODEL_ID, model_id).await?;
        Ok(())
    }

    /// Streaming calls need both the key and an explicit model.
    pub fn for_stream(&self) -> Option<(&str, &str)> {
        Some((self.api_key.as_deref()?, self.model_id.as_deref()?))
    }

    /// One-shot calls only need the key; the model falls back to `default_model`.
    pub fn for_call<'a>(&'a self, default_model: &'a str) -> Option<(&'a str, &'a str)> {
        let api_key = self.api_key.as_deref()?;
        Some((api_key, self.model_id.as_deref().unwrap_or(default_model)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("API key and model must not be empty")]
    Incomplete,
    #[error(transparent)]
    Store(#[from] StoreError),
}
