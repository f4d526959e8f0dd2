use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::dsl::cluster::Strategy;
use crate::storage::{read_json, write_json, StorageError};

// ── LLM provider types ──────────────────────────────────────────

/// Which LLM provider regenerates drafts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, clap::ValueEnum)]
pub enum LlmProvider {
    Anthropic,
    OpenAiCompatible,
}

/// Full configuration for the chosen LLM provider.
///
/// The `api_key` field is never written to `settings.json`. It is stored in a
/// separate credentials file and loaded/saved via [`load_api_key`]/[`save_api_key`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LlmProviderConfig {
    pub provider: LlmProvider,
    #[serde(default, skip_serializing)]
    #[schemars(skip)]
    pub api_key: Option<String>,
    /// Base URL for OpenAI-compatible providers (ignored for Anthropic).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model override. None = use provider default.
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            api_key: None,
            base_url: None,
            model: None,
        }
    }
}

/// Redacted view of the LLM config for display (no raw API key).
#[derive(Debug, Clone, Serialize)]
pub struct LlmConfigInfo {
    pub provider: LlmProvider,
    pub has_api_key: bool,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

impl LlmConfigInfo {
    #[must_use]
    pub fn from_config(config: &LlmProviderConfig) -> Self {
        Self {
            provider: config.provider,
            has_api_key: config.api_key.as_ref().is_some_and(|k| !k.is_empty()),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
        }
    }
}

// ── Transpiler settings ──────────────────────────────────────────

/// Bounds for the self-correction loop.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CorrectionSettings {
    /// Attempts per session, the first draft included.
    pub max_attempts: u32,
    /// Timeout for one generation call, in seconds.
    pub generation_timeout_secs: u64,
    /// Repair rounds tried before a draft is sent back for regeneration.
    pub max_repair_rounds: u32,
    pub max_nesting_depth: usize,
    pub strategy: Strategy,
    /// Write a JSONL attempt log per session under the config directory.
    pub persist_attempt_logs: bool,
}

impl Default for CorrectionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            generation_timeout_secs: 60,
            max_repair_rounds: 4,
            max_nesting_depth: 5,
            strategy: Strategy::Hybrid,
            persist_attempt_logs: true,
        }
    }
}

/// Settings stored in the config directory.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TranspilerSettings {
    pub version: u32,
    #[serde(default)]
    pub llm: LlmProviderConfig,
    #[serde(default)]
    pub correction: CorrectionSettings,
}

const SETTINGS_VERSION: u32 = 1;

impl Default for TranspilerSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            llm: LlmProviderConfig::default(),
            correction: CorrectionSettings::default(),
        }
    }
}

/// JSON schema of the settings file.
pub fn settings_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(TranspilerSettings)
}

/// Load the API key from the separate credentials file.
pub fn load_api_key(config_dir: &Path) -> Option<String> {
    let path = crate::paths::credentials_path(config_dir);
    std::fs::read_to_string(path)
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
}

/// Save the API key to the separate credentials file (atomic write).
pub fn save_api_key(config_dir: &Path, key: &str) -> Result<(), StorageError> {
    std::fs::create_dir_all(config_dir)?;
    let path = crate::paths::credentials_path(config_dir);
    if key.is_empty() {
        let _ = std::fs::remove_file(&path);
    } else {
        crate::storage::atomic_write(&path, key.as_bytes())?;
    }
    Ok(())
}

/// Load settings from the config directory. Returns None if no settings file exists.
pub fn load_settings(config_dir: &Path) -> Result<Option<TranspilerSettings>, StorageError> {
    let path = crate::paths::settings_path(config_dir);
    if !path.exists() {
        return Ok(None);
    }
    let mut settings = read_json::<TranspilerSettings>(&path)?;
    if settings.version > SETTINGS_VERSION {
        return Err(StorageError::Invalid(format!(
            "settings version {} is newer than supported version {SETTINGS_VERSION}",
            settings.version
        )));
    }
    if settings.llm.api_key.is_none() {
        settings.llm.api_key = load_api_key(config_dir);
    }
    Ok(Some(settings))
}

/// Load settings, falling back to defaults (plus any stored key) when absent.
pub fn load_or_default(config_dir: &Path) -> Result<TranspilerSettings, StorageError> {
    Ok(load_settings(config_dir)?.unwrap_or_else(|| {
        let mut settings = TranspilerSettings::default();
        settings.llm.api_key = load_api_key(config_dir);
        settings
    }))
}

/// Save settings to the config directory.
pub fn save_settings(config_dir: &Path, settings: &TranspilerSettings) -> Result<(), StorageError> {
    std::fs::create_dir_all(config_dir)?;
    write_json(&crate::paths::settings_path(config_dir), settings)
}
