use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub languages: LanguagesConfig,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub content: ContentConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// `disabled` or `http`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Display name recorded in the `used_api` column of every
    /// simplification this deployment produces.
    #[serde(default = "default_api_name")]
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the bearer token, if the API needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// External rate limit: how many texts one synchronous run may submit.
    #[serde(default = "default_max_requests")]
    pub max_requests_per_interval: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            name: default_api_name(),
            url: None,
            api_key_env: None,
            max_requests_per_interval: default_max_requests(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_api_name() -> String {
    "simplification-api".to_string()
}
fn default_max_requests() -> u64 {
    25
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LanguagesConfig {
    /// Source language assumed for texts whose object carries none.
    #[serde(default = "default_source_language")]
    pub default_source: String,
    /// Source language → target languages this deployment simplifies into.
    pub mappings: BTreeMap<String, Vec<String>>,
}

fn default_source_language() -> String {
    "de".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BehaviorConfig {
    /// Delete an original (and its simplifications) once its last usage
    /// link is removed. Off by default so paid results are kept for reuse.
    #[serde(default)]
    pub delete_unused_texts: bool,
    /// Tenant recorded on usage links. Multi-site deployments share one
    /// store rooted at the primary tenant.
    #[serde(default)]
    pub tenant_id: i64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            delete_unused_texts: false,
            tenant_id: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ContentConfig {
    /// Path of the JSON content file the CLI commands operate on.
    /// Real deployments wire their own [`ContentStore`](crate::objects::ContentStore)
    /// implementation instead.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate languages
    if config.languages.mappings.is_empty() {
        anyhow::bail!("languages.mappings must contain at least one source language");
    }
    for (source, targets) in &config.languages.mappings {
        if targets.is_empty() {
            anyhow::bail!("languages.mappings.{} must list at least one target", source);
        }
        if targets.iter().any(|t| t == source) {
            anyhow::bail!(
                "languages.mappings.{} maps a language onto itself",
                source
            );
        }
    }

    // Validate API
    if config.api.max_requests_per_interval == 0 {
        anyhow::bail!("api.max_requests_per_interval must be > 0");
    }

    match config.api.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.api.url.is_none() {
                anyhow::bail!("api.url must be set when provider is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown api provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    Ok(config)
}
