//! OCR through the Vision API's asynchronous file annotation.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use casefile_core::services::OcrEngine;
use serde::Deserialize;

use crate::gcp::{wait_for_operation, GcpClient};

const SERVICE: &str = "vision";

pub struct VisionOcr {
    client: GcpClient,
    base: String,
    timeout: Duration,
    poll_interval: Duration,
}

#[derive(Deserialize)]
struct OperationHandle {
    name: String,
}

impl VisionOcr {
    pub fn new(client: GcpClient, base: &str, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            timeout,
            poll_interval,
        }
    }
}

/// Request body for `files:asyncBatchAnnotate` on one PDF.
pub fn annotate_request(
    source_uri: &str,
    dest_prefix_uri: &str,
    batch_size: u32,
) -> serde_json::Value {
    serde_json::json!({
        "requests": [{
            "inputConfig": {
                "gcsSource": { "uri": source_uri },
                "mimeType": "application/pdf"
            },
            "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
            "outputConfig": {
                "gcsDestination": { "uri": dest_prefix_uri },
                "batchSize": batch_size
            }
        }]
    })
}

#[async_trait]
impl OcrEngine for VisionOcr {
    async fn annotate_pdf(
        &self,
        source_uri: &str,
        dest_prefix_uri: &str,
        batch_size: u32,
    ) -> Result<()> {
        let url = format!("{}/v1/files:asyncBatchAnnotate", self.base);
        let body = annotate_request(source_uri, dest_prefix_uri, batch_size);
        let op: OperationHandle = self
            .client
            .json(SERVICE, |http| http.post(&url).json(&body))
            .await
            .with_context(|| format!("OCR request for {} failed", source_uri))?;

        tracing::debug!(operation = %op.name, source = source_uri, "waiting for OCR");
        let op_url = format!("{}/v1/{}", self.base, op.name);
        wait_for_operation(&self.client, SERVICE, &op_url, self.timeout, self.poll_interval)
            .await?;
        Ok(())
    }
}
