//! Bus messages between the OCR trigger and the translation trigger.
//!
//! The payload is the JSON object `{"text": ..., "doc_title": ...}`. On the
//! wire it travels base64-encoded inside the bus envelope's `data` field.

use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMessage {
    pub text: String,
    pub doc_title: String,
}

impl PipelineMessage {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize pipeline message")
    }

    /// Base64 of the JSON payload, as carried in an envelope `data` field.
    pub fn encode(&self) -> Result<String> {
        Ok(base64::engine::general_purpose::STANDARD.encode(self.to_json()?))
    }

    pub fn decode(data: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .context("Message data is not valid base64")?;
        serde_json::from_slice(&bytes).context("Message data is not a {text, doc_title} object")
    }
}

/// Publish side of the message bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `message` to `topic`, returning the bus-assigned message id.
    async fn publish(&self, topic: &str, message: &PipelineMessage) -> Result<String>;
}

/// Records published messages. Used by tests and local runs without a bus.
#[derive(Default)]
pub struct InMemoryBus {
    published: RwLock<Vec<(String, PipelineMessage)>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, PipelineMessage)> {
        self.published.read().unwrap().clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, message: &PipelineMessage) -> Result<String> {
        let mut published = self.published.write().unwrap();
        published.push((topic.to_string(), message.clone()));
        Ok(published.len().to_string())
    }
}
