//! Redaction through the DLP API with deterministic encryption.
//!
//! Findings of the configured info types are replaced by
//! `SURROGATE(len):ciphertext` tokens. The same key and surrogate reverse
//! the transform via `content:reidentify`.

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use casefile_core::error::StageError;
use casefile_core::services::Redactor;
use serde::Deserialize;

use crate::gcp::GcpClient;

const SERVICE: &str = "dlp";

/// Key material for `cryptoDeterministicConfig`.
#[derive(Clone)]
pub enum CryptoKey {
    /// Raw AES key: 16, 24, or 32 bytes.
    Unwrapped(Vec<u8>),
    /// Key encrypted by the named KMS key.
    KmsWrapped { wrapped: Vec<u8>, key_name: String },
}

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoKey::Unwrapped(k) => write!(f, "Unwrapped({} bytes)", k.len()),
            CryptoKey::KmsWrapped { key_name, .. } => write!(f, "KmsWrapped({})", key_name),
        }
    }
}

impl CryptoKey {
    /// Decode a base64 key. Without `kms_key_name` the decoded key must be
    /// a valid AES length.
    pub fn from_base64(encoded: &str, kms_key_name: Option<&str>) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| StageError::Configuration(format!("redaction key is not base64: {}", e)))?;
        Self::from_bytes(bytes, kms_key_name)
    }

    pub fn from_bytes(bytes: Vec<u8>, kms_key_name: Option<&str>) -> Result<Self> {
        match kms_key_name {
            Some(name) => Ok(CryptoKey::KmsWrapped {
                wrapped: bytes,
                key_name: name.to_string(),
            }),
            None => {
                if ![16, 24, 32].contains(&bytes.len()) {
                    return Err(StageError::Configuration(format!(
                        "redaction key must be 16, 24, or 32 bytes, got {}",
                        bytes.len()
                    ))
                    .into());
                }
                Ok(CryptoKey::Unwrapped(bytes))
            }
        }
    }

    fn to_json(&self) -> serde_json::Value {
        let b64 = |b: &[u8]| base64::engine::general_purpose::STANDARD.encode(b);
        match self {
            CryptoKey::Unwrapped(key) => serde_json::json!({ "unwrapped": { "key": b64(key) } }),
            CryptoKey::KmsWrapped { wrapped, key_name } => serde_json::json!({
                "kmsWrapped": { "wrappedKey": b64(wrapped), "cryptoKeyName": key_name }
            }),
        }
    }
}

pub struct DlpRedactor {
    client: GcpClient,
    base: String,
    project: String,
    info_types: Vec<String>,
    surrogate: String,
    key: CryptoKey,
}

#[derive(Deserialize)]
struct ContentResponse {
    item: ContentItem,
}

#[derive(Deserialize)]
struct ContentItem {
    #[serde(default)]
    value: String,
}

impl DlpRedactor {
    pub fn new(
        client: GcpClient,
        base: &str,
        project: impl Into<String>,
        info_types: Vec<String>,
        surrogate: impl Into<String>,
        key: CryptoKey,
    ) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            project: project.into(),
            info_types,
            surrogate: surrogate.into(),
            key,
        }
    }

    fn transformation(&self) -> serde_json::Value {
        serde_json::json!({
            "infoTypeTransformations": {
                "transformations": [{
                    "primitiveTransformation": {
                        "cryptoDeterministicConfig": {
                            "cryptoKey": self.key.to_json(),
                            "surrogateInfoType": { "name": self.surrogate }
                        }
                    }
                }]
            }
        })
    }

    pub fn deidentify_body(&self, text: &str) -> serde_json::Value {
        let info_types: Vec<_> = self
            .info_types
            .iter()
            .map(|name| serde_json::json!({ "name": name }))
            .collect();
        serde_json::json!({
            "inspectConfig": { "infoTypes": info_types },
            "deidentifyConfig": self.transformation(),
            "item": { "value": text }
        })
    }

    pub fn reidentify_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "inspectConfig": {
                "customInfoTypes": [{
                    "infoType": { "name": self.surrogate },
                    "surrogateType": {}
                }]
            },
            "reidentifyConfig": self.transformation(),
            "item": { "value": text }
        })
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<String> {
        let url = format!(
            "{}/v2/projects/{}/locations/global/content:{}",
            self.base, self.project, method
        );
        let response: ContentResponse = self
            .client
            .json(SERVICE, |http| http.post(&url).json(&body))
            .await?;
        Ok(response.item.value)
    }
}

#[async_trait]
impl Redactor for DlpRedactor {
    async fn deidentify(&self, text: &str) -> Result<String> {
        self.call("deidentify", self.deidentify_body(text)).await
    }

    async fn reidentify(&self, text: &str) -> Result<String> {
        self.call("reidentify", self.reidentify_body(text)).await
    }
}
