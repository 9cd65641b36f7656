//! Translation API v3 adapter.
//!
//! Synchronous requests go to the `global` location. Batch jobs need a
//! regional location and write their output under a storage prefix.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use casefile_core::error::StageError;
use casefile_core::services::Translator;
use serde::Deserialize;

use crate::gcp::{wait_for_operation, GcpClient};

const SERVICE: &str = "translate";

/// Request size limit of `translateText`, in codepoints.
pub const MAX_SYNC_CODEPOINTS: usize = 30_000;

pub struct CloudTranslator {
    client: GcpClient,
    base: String,
    project: String,
    location: String,
    timeout: Duration,
    poll_interval: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslateResponse {
    #[serde(default)]
    translations: Vec<Translation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Translation {
    translated_text: String,
}

#[derive(Deserialize)]
struct OperationHandle {
    name: String,
}

impl CloudTranslator {
    pub fn new(
        client: GcpClient,
        base: &str,
        project: impl Into<String>,
        location: impl Into<String>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            project: project.into(),
            location: location.into(),
            timeout,
            poll_interval,
        }
    }
}

#[async_trait]
impl Translator for CloudTranslator {
    async fn translate_text(&self, text: &str, source: &str, target: &str) -> Result<String> {
        check_sync_size(text)?;
        let url = format!(
            "{}/v3/projects/{}/locations/global:translateText",
            self.base, self.project
        );
        let body = serde_json::json!({
            "contents": [text],
            "mimeType": "text/plain",
            "sourceLanguageCode": source,
            "targetLanguageCode": target,
        });
        let response: TranslateResponse = self
            .client
            .json(SERVICE, |http| http.post(&url).json(&body))
            .await?;

        response
            .translations
            .into_iter()
            .last()
            .map(|t| t.translated_text)
            .ok_or_else(|| anyhow::anyhow!("translate returned no translations"))
    }

    async fn batch_translate(
        &self,
        input_uri: &str,
        output_prefix_uri: &str,
        source: &str,
        target: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/v3/projects/{}/locations/{}:batchTranslateText",
            self.base, self.project, self.location
        );
        let body = serde_json::json!({
            "sourceLanguageCode": source,
            "targetLanguageCodes": [target],
            "inputConfigs": [{
                "gcsSource": { "inputUri": input_uri },
                "mimeType": "text/plain"
            }],
            "outputConfig": {
                "gcsDestination": { "outputUriPrefix": output_prefix_uri }
            }
        });
        let op: OperationHandle = self
            .client
            .json(SERVICE, |http| http.post(&url).json(&body))
            .await
            .with_context(|| format!("Batch translation of {} failed", input_uri))?;

        tracing::debug!(operation = %op.name, input = input_uri, "waiting for batch translation");
        let op_url = format!("{}/v3/{}", self.base, op.name);
        wait_for_operation(&self.client, SERVICE, &op_url, self.timeout, self.poll_interval)
            .await?;
        Ok(())
    }
}

/// Input is never chunked; oversize text fails before the request.
pub fn check_sync_size(text: &str) -> Result<()> {
    if text.chars().count() > MAX_SYNC_CODEPOINTS {
        return Err(StageError::PayloadTooLarge {
            service: SERVICE.to_string(),
        }
        .into());
    }
    Ok(())
}
