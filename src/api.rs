//! Simplification API client abstraction and implementations.
//!
//! Defines the [`SimplificationApi`] trait and concrete implementations:
//! - **[`DisabledApi`]** — returns errors; used when no API is configured.
//! - **[`HttpApi`]** — calls a JSON simplification endpoint with retry and
//!   backoff.
//!
//! # Retry Strategy
//!
//! The HTTP client uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::ApiConfig;

/// A successful simplification response for one text and language pair.
#[derive(Debug, Clone)]
pub struct SimplifiedText {
    pub text: String,
    /// External job/request id, recorded for audit.
    pub job_id: i64,
}

/// Contract the orchestrator consumes. One call simplifies one text from
/// `source_lang` into `target_lang`; the quota the precheck compares
/// against comes from [`max_requests_per_interval`](SimplificationApi::max_requests_per_interval).
#[async_trait]
pub trait SimplificationApi: Send + Sync {
    /// Name recorded in the `used_api` column of produced simplifications.
    fn name(&self) -> &str;

    /// How many texts a single synchronous run may submit before the run
    /// is deferred to the background.
    fn max_requests_per_interval(&self) -> u64;

    /// Simplify one text. Calls are synchronous from the orchestrator's
    /// point of view; the configured timeout is enforced inside the client.
    async fn call(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<SimplifiedText>;
}

/// Build the API client configured in `[api]`.
pub fn create_api(config: &ApiConfig) -> Result<Box<dyn SimplificationApi>> {
    match config.provider.as_str() {
        "http" => Ok(Box::new(HttpApi::new(config)?)),
        "disabled" => Ok(Box::new(DisabledApi)),
        other => bail!("Unknown api provider: {}", other),
    }
}

// ============ Disabled API ============

/// A no-op API client that always returns errors.
///
/// Used when `api.provider = "disabled"`. Local reuse of existing
/// simplifications still works; anything needing a fresh API call fails
/// with a descriptive message.
pub struct DisabledApi;

#[async_trait]
impl SimplificationApi for DisabledApi {
    fn name(&self) -> &str {
        "disabled"
    }

    fn max_requests_per_interval(&self) -> u64 {
        0
    }

    async fn call(
        &self,
        _text: &str,
        _source_lang: &str,
        _target_lang: &str,
    ) -> Result<SimplifiedText> {
        bail!("Simplification API is disabled. Set [api] provider in config.")
    }
}

// ============ HTTP API ============

/// JSON response shape of the simplification endpoint.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    simplified_text: String,
    #[serde(default)]
    job_id: i64,
}

/// Client for a JSON-over-HTTP simplification endpoint.
///
/// Sends `POST {url}` with `{text, source_language, target_language}` and
/// expects `{simplified_text, job_id}` back. An optional bearer token is
/// read from the environment variable named in `api.api_key_env`.
pub struct HttpApi {
    name: String,
    url: String,
    api_key: Option<String>,
    max_requests_per_interval: u64,
    max_retries: u32,
    timeout: Duration,
}

impl HttpApi {
    /// Create a new HTTP client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `api.url` is missing, or if `api.api_key_env`
    /// names a variable that is not set.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("api.url required for http provider"))?;

        let api_key = match &config.api_key_env {
            Some(var) => match std::env::var(var) {
                Ok(key) => Some(key),
                Err(_) => bail!("{} environment variable not set", var),
            },
            None => None,
        };

        Ok(Self {
            name: config.name.clone(),
            url,
            api_key,
            max_requests_per_interval: config.max_requests_per_interval,
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl SimplificationApi for HttpApi {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_requests_per_interval(&self) -> u64 {
        self.max_requests_per_interval
    }

    async fn call(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<SimplifiedText> {
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;

        let body = serde_json::json!({
            "text": text,
            "source_language": source_lang,
            "target_language": target_lang,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = client.post(&self.url).json(&body);
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: ApiResponse = response.json().await?;
                        if parsed.simplified_text.is_empty() {
                            bail!("Simplification API returned an empty text");
                        }
                        return Ok(SimplifiedText {
                            text: parsed.simplified_text,
                            job_id: parsed.job_id,
                        });
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Simplification API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Simplification API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!("Simplification API request failed: {}", e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Simplification API retries exhausted")))
    }
}
