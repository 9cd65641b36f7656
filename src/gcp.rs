//! Shared plumbing for the Google Cloud REST adapters.
//!
//! - [`TokenSource`]: OAuth2 access tokens from an environment variable or
//!   a token command (e.g. `gcloud auth application-default print-access-token`).
//! - [`GcpClient`]: bearer-authenticated `reqwest` client with optional
//!   retry/backoff and uniform mapping of HTTP failures onto
//!   [`StageError`].
//! - [`wait_for_operation`]: bounded polling of long-running operations.
//!
//! # Retry Strategy
//!
//! With `engines.max_retries = 0` (the default) every request is sent once.
//! Otherwise:
//! - HTTP 429 and 5xx → retry with exponential backoff
//! - other HTTP 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, ... capped at 32s

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use casefile_core::error::StageError;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Config;

const TOKEN_TTL: Duration = Duration::from_secs(45 * 60);

/// Base URLs of every Google API the pipeline calls.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub storage: String,
    pub vision: String,
    pub translate: String,
    pub dlp: String,
    pub bigquery: String,
    pub datastore: String,
    pub pubsub: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            storage: "https://storage.googleapis.com".to_string(),
            vision: "https://vision.googleapis.com".to_string(),
            translate: "https://translation.googleapis.com".to_string(),
            dlp: "https://dlp.googleapis.com".to_string(),
            bigquery: "https://bigquery.googleapis.com".to_string(),
            datastore: "https://datastore.googleapis.com".to_string(),
            pubsub: "https://pubsub.googleapis.com".to_string(),
        }
    }
}

impl Endpoints {
    pub fn from_config(config: &Config) -> Self {
        let o = &config.engines.endpoints;
        let d = Endpoints::default();
        let pick = |over: &Option<String>, default: String| {
            over.as_ref()
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(default)
        };
        Self {
            storage: pick(&o.storage, d.storage),
            vision: pick(&o.vision, d.vision),
            translate: pick(&o.translate, d.translate),
            dlp: pick(&o.dlp, d.dlp),
            bigquery: pick(&o.bigquery, d.bigquery),
            datastore: pick(&o.datastore, d.datastore),
            pubsub: pick(&o.pubsub, d.pubsub),
        }
    }

    /// Every endpoint pointing at one base URL. Used with local fakes.
    pub fn all(base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self {
            storage: base.clone(),
            vision: base.clone(),
            translate: base.clone(),
            dlp: base.clone(),
            bigquery: base.clone(),
            datastore: base.clone(),
            pubsub: base,
        }
    }
}

/// Source of OAuth2 access tokens.
pub struct TokenSource {
    env_var: Option<String>,
    command: Option<String>,
    credentials: Option<PathBuf>,
    fixed: Option<String>,
    cached: Mutex<Option<(String, Instant)>>,
}

impl TokenSource {
    pub fn from_config(config: &Config) -> Self {
        Self {
            env_var: Some(config.auth.token_env.clone()),
            command: config.auth.token_command.clone(),
            credentials: config.project.credentials.clone(),
            fixed: None,
            cached: Mutex::new(None),
        }
    }

    /// Always return `token`.
    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            env_var: None,
            command: None,
            credentials: None,
            fixed: Some(token.into()),
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<String> {
        if let Some(token) = &self.fixed {
            return Ok(token.clone());
        }
        if let Some(var) = &self.env_var {
            if let Ok(token) = std::env::var(var) {
                if !token.trim().is_empty() {
                    return Ok(token.trim().to_string());
                }
            }
        }

        let mut cached = self.cached.lock().await;
        if let Some((token, fetched)) = cached.as_ref() {
            if fetched.elapsed() < TOKEN_TTL {
                return Ok(token.clone());
            }
        }

        let token = self.run_command().await?;
        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }

    async fn run_command(&self) -> Result<String> {
        let Some(command) = &self.command else {
            return Err(StageError::Configuration(
                "no access token: set auth.token_env or auth.token_command".into(),
            )
            .into());
        };
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return Err(StageError::Configuration("auth.token_command is empty".into()).into());
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(parts);
        if let Some(path) = &self.credentials {
            cmd.env("GOOGLE_APPLICATION_CREDENTIALS", path);
        }
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run token command: {}", command))?;
        if !output.status.success() {
            return Err(StageError::Configuration(format!(
                "token command failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            bail!("token command printed no token");
        }
        Ok(token)
    }
}

/// Authenticated HTTP client shared by every adapter of one run.
#[derive(Clone)]
pub struct GcpClient {
    http: reqwest::Client,
    tokens: Arc<TokenSource>,
    max_retries: u32,
}

impl GcpClient {
    pub fn new(tokens: Arc<TokenSource>, timeout: Duration, max_retries: u32) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            tokens,
            max_retries,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            Arc::new(TokenSource::from_config(config)),
            Duration::from_secs(config.engines.request_timeout_secs),
            config.engines.max_retries,
        )
    }

    /// Send the request built by `build`, retrying per the retry strategy.
    /// Returns the final response whatever its status.
    pub async fn execute<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let token = self.tokens.token().await?;
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match build(&self.http).bearer_auth(&token).send().await {
                Ok(response) => {
                    let status = response.status();
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if retryable && attempt < self.max_retries {
                        tracing::warn!(status = status.as_u16(), attempt, "retrying request");
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "request failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow::anyhow!("request failed after retries")))
    }

    /// Like [`execute`](Self::execute) but any non-2xx status becomes an error.
    pub async fn send<F>(&self, service: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let response = self.execute(build).await?;
        check(service, response).await
    }

    pub async fn json<T, F>(&self, service: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let response = self.send(service, build).await?;
        response
            .json()
            .await
            .with_context(|| format!("Invalid JSON from {}", service))
    }

    /// `None` on 404, otherwise as [`json`](Self::json).
    pub async fn json_opt<T, F>(&self, service: &str, build: F) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let response = self.execute(build).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(service, response).await?;
        let value = response
            .json()
            .await
            .with_context(|| format!("Invalid JSON from {}", service))?;
        Ok(Some(value))
    }
}

/// Map a non-success response onto the error taxonomy.
pub async fn check(service: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::PAYLOAD_TOO_LARGE {
        return Err(StageError::PayloadTooLarge {
            service: service.to_string(),
        }
        .into());
    }
    let payload = response.text().await.unwrap_or_default();
    Err(StageError::engine(service, status.as_u16(), payload).into())
}

/// Poll the long-running operation at `url` until it is done.
///
/// Returns the operation's `response` object. Fails with
/// [`StageError::StageTimeout`] once `timeout` has elapsed, and with
/// [`StageError::Engine`] when the operation finished with an error.
pub async fn wait_for_operation(
    client: &GcpClient,
    service: &str,
    url: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<serde_json::Value> {
    let started = Instant::now();
    loop {
        let op: serde_json::Value = client.json(service, |http| http.get(url)).await?;

        if op.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
            if let Some(error) = op.get("error") {
                let code = error.get("code").and_then(|c| c.as_u64()).unwrap_or(0);
                return Err(StageError::engine(service, code as u16, error.to_string()).into());
            }
            return Ok(op.get("response").cloned().unwrap_or(serde_json::Value::Null));
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(StageError::StageTimeout {
                stage: service.to_string(),
                waited_secs: timeout.as_secs(),
            }
            .into());
        }
        tokio::time::sleep(poll_interval.min(timeout - elapsed)).await;
    }
}
