//! Pub/Sub publisher.

use anyhow::Result;
use async_trait::async_trait;
use casefile_core::message::{MessageBus, PipelineMessage};
use serde::Deserialize;

use crate::gcp::GcpClient;

const SERVICE: &str = "pubsub";

pub struct PubSubBus {
    client: GcpClient,
    base: String,
    project: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

impl PubSubBus {
    pub fn new(client: GcpClient, base: &str, project: impl Into<String>) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            project: project.into(),
        }
    }
}

#[async_trait]
impl MessageBus for PubSubBus {
    async fn publish(&self, topic: &str, message: &PipelineMessage) -> Result<String> {
        let url = format!(
            "{}/v1/projects/{}/topics/{}:publish",
            self.base, self.project, topic
        );
        let body = serde_json::json!({ "messages": [{ "data": message.encode()? }] });
        let response: PublishResponse = self
            .client
            .json(SERVICE, |http| http.post(&url).json(&body))
            .await?;
        let id = response
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("publish to {} returned no message id", topic))?;
        tracing::info!(message_id = %id, topic, doc_title = %message.doc_title, "published");
        Ok(id)
    }
}
