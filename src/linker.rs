//! Client for the biomedical entity-linking service.
//!
//! The service hosts the recognition models and the concept linker. It
//! takes `POST /link` with `{model, text, resolve_abbreviations}` and
//! answers `{entities: [{text, candidates: [concept, ...]}]}`, candidates
//! ordered best first. Only the first candidate is kept.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use casefile_core::entities::{LinkedSpan, SciModel};
use casefile_core::services::EntityLinker;
use serde::Deserialize;

use crate::gcp::check;

const SERVICE: &str = "linker";

pub struct HttpEntityLinker {
    http: reqwest::Client,
    endpoint: String,
    model: SciModel,
    resolve_abbreviations: bool,
}

#[derive(Deserialize)]
struct LinkResponse {
    #[serde(default)]
    entities: Vec<LinkedEntity>,
}

#[derive(Deserialize)]
struct LinkedEntity {
    text: String,
    #[serde(default)]
    candidates: Vec<serde_json::Value>,
    #[serde(default)]
    concept: Option<serde_json::Value>,
}

impl HttpEntityLinker {
    pub fn new(
        endpoint: &str,
        model: SciModel,
        resolve_abbreviations: bool,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model,
            resolve_abbreviations,
        })
    }
}

#[async_trait]
impl EntityLinker for HttpEntityLinker {
    fn model(&self) -> SciModel {
        self.model
    }

    async fn link(&self, text: &str) -> Result<Vec<LinkedSpan>> {
        let body = serde_json::json!({
            "model": self.model.as_str(),
            "text": text,
            "resolve_abbreviations": self.resolve_abbreviations,
        });
        let response = self
            .http
            .post(format!("{}/link", self.endpoint))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Entity linker unreachable at {}", self.endpoint))?;
        let response: LinkResponse = check(SERVICE, response).await?.json().await?;

        Ok(response
            .entities
            .into_iter()
            .map(|e| LinkedSpan {
                concept: e.concept.or_else(|| e.candidates.into_iter().next()),
                text: e.text,
            })
            .collect())
    }
}
