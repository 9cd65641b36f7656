//! Cloud Storage object store over the JSON API.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | list | `GET /storage/v1/b/{bucket}/o?prefix=…&pageToken=…` |
//! | read | `GET /storage/v1/b/{bucket}/o/{name}?alt=media` |
//! | write | `POST /upload/storage/v1/b/{bucket}/o?uploadType=media&name=…` |
//! | delete | `DELETE /storage/v1/b/{bucket}/o/{name}` |

use anyhow::{Context, Result};
use async_trait::async_trait;
use casefile_core::models::BlobMeta;
use casefile_core::store::ObjectStore;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;

use crate::gcp::{check, GcpClient};

const SERVICE: &str = "storage";

pub struct GcsObjectStore {
    client: GcpClient,
    base: String,
    bucket: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    md5_hash: Option<String>,
    #[serde(default)]
    generation: Option<String>,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
}

impl GcsObjectStore {
    pub fn new(client: GcpClient, base: &str, bucket: impl Into<String>) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            bucket: bucket.into(),
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base)
            .with_context(|| format!("Bad storage endpoint: {}", self.base))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("storage endpoint cannot be a base URL"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        let url = self.url(&["storage", "v1", "b", self.bucket.as_str(), "o"])?;
        let mut blobs = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page: ListResponse = self
                .client
                .json(SERVICE, |http| {
                    let mut req = http.get(url.clone()).query(&[("prefix", prefix)]);
                    if let Some(token) = &page_token {
                        req = req.query(&[("pageToken", token.as_str())]);
                    }
                    req
                })
                .await?;

            for item in page.items {
                blobs.push(BlobMeta {
                    size: item.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
                    fingerprint: item
                        .md5_hash
                        .or(item.generation)
                        .unwrap_or_default(),
                    updated_at: item.updated,
                    name: item.name,
                });
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        blobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(blobs)
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let url = self.url(&["storage", "v1", "b", self.bucket.as_str(), "o", name])?;
        let response = self
            .client
            .execute(|http| http.get(url.clone()).query(&[("alt", "media")]))
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(SERVICE, response).await?;
        Ok(Some(response.bytes().await?.to_vec()))
    }

    async fn write(&self, name: &str, content: &[u8], content_type: &str) -> Result<()> {
        let url = self.url(&["upload", "storage", "v1", "b", self.bucket.as_str(), "o"])?;
        self.client
            .send(SERVICE, |http| {
                http.post(url.clone())
                    .query(&[("uploadType", "media"), ("name", name)])
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(content.to_vec())
            })
            .await
            .with_context(|| format!("Failed to upload {}", name))?;
        tracing::debug!(blob = name, bytes = content.len(), "uploaded");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let url = self.url(&["storage", "v1", "b", self.bucket.as_str(), "o", name])?;
        let response = self.client.execute(|http| http.delete(url.clone())).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(SERVICE, response)
            .await
            .with_context(|| format!("Failed to delete {}", name))?;
        tracing::debug!(blob = name, "deleted");
        Ok(true)
    }
}
