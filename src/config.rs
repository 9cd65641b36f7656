//! Configuration parsing and validation.
//!
//! casefile is configured by a TOML file (default: `config/casefile.toml`)
//! plus environment variables, which take precedence over the file. A
//! `.env` file in the working directory is loaded first.
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `PROJECT_ID` | `project.id` |
//! | `BUCKET_NAME` | `storage.bucket` |
//! | `LOCATION` | `project.location` |
//! | `SA_KEY_PATH` | `project.credentials` |
//! | `BQ_DATASET_NAME` | `warehouse.dataset` |
//! | `BQ_TABLE_NAME` | `warehouse.table` |
//! | `TEST_CASE` | `pipeline.test_case` |
//! | `RESULT_TOPIC` | `pubsub.topic` |
//!
//! # Example
//!
//! ```toml
//! [project]
//! id = "covid19-reports"
//! location = "us-central1"
//!
//! [storage]
//! backend = "gcs"
//! bucket = "covid19-case-reports"
//!
//! [engines]
//! translation_mode = "batch"
//!
//! [redaction]
//! key_blob = "secrets/aes.key"
//!
//! [warehouse]
//! dataset = "covid19"
//! table = "cases"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use casefile_core::error::StageError;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engines: EnginesConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
    #[serde(default)]
    pub ner: NerConfig,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub docstore: DocstoreConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub pubsub: PubSubConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    #[serde(default)]
    pub id: Option<String>,
    /// Regional location for batch translation jobs.
    #[serde(default = "default_location")]
    pub location: String,
    /// Service-account key file. Exported as
    /// `GOOGLE_APPLICATION_CREDENTIALS` to the token command.
    #[serde(default)]
    pub credentials: Option<PathBuf>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            id: None,
            location: default_location(),
            credentials: None,
        }
    }
}

fn default_location() -> String {
    "us-central1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Environment variable holding a ready OAuth2 access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Command printing an access token on stdout, used when `token_env`
    /// is unset.
    #[serde(default = "default_token_command")]
    pub token_command: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            token_command: default_token_command(),
        }
    }
}

fn default_token_env() -> String {
    "GOOGLE_OAUTH_ACCESS_TOKEN".to_string()
}

fn default_token_command() -> Option<String> {
    Some("gcloud auth application-default print-access-token".to_string())
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Gcs,
    Filesystem,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub bucket: Option<String>,
    /// Parent directory of bucket directories for the filesystem backend.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            bucket: None,
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/buckets")
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TranslationMode {
    Sync,
    #[default]
    Batch,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnginesConfig {
    #[serde(default = "default_ocr_batch_size")]
    pub ocr_batch_size: u32,
    #[serde(default = "default_operation_timeout")]
    pub ocr_timeout_secs: u64,
    #[serde(default = "default_operation_timeout")]
    pub translation_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub translation_mode: TranslationMode,
    #[serde(default = "default_source_language")]
    pub source_language: String,
    #[serde(default = "default_target_language")]
    pub target_language: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Retries on HTTP 429/5xx. Zero keeps the fail-fast behaviour.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            ocr_batch_size: default_ocr_batch_size(),
            ocr_timeout_secs: default_operation_timeout(),
            translation_timeout_secs: default_operation_timeout(),
            poll_interval_secs: default_poll_interval(),
            translation_mode: TranslationMode::default(),
            source_language: default_source_language(),
            target_language: default_target_language(),
            request_timeout_secs: default_request_timeout(),
            max_retries: 0,
            endpoints: EndpointsConfig::default(),
        }
    }
}

fn default_ocr_batch_size() -> u32 {
    20
}
fn default_operation_timeout() -> u64 {
    180
}
fn default_poll_interval() -> u64 {
    5
}
fn default_source_language() -> String {
    "it".to_string()
}
fn default_target_language() -> String {
    "en".to_string()
}
fn default_request_timeout() -> u64 {
    60
}

/// Base URL overrides, for emulators and tests.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EndpointsConfig {
    pub storage: Option<String>,
    pub vision: Option<String>,
    pub translate: Option<String>,
    pub dlp: Option<String>,
    pub bigquery: Option<String>,
    pub datastore: Option<String>,
    pub pubsub: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_info_types")]
    pub info_types: Vec<String>,
    #[serde(default = "default_surrogate")]
    pub surrogate: String,
    /// Environment variable holding the base64-encoded key.
    #[serde(default = "default_key_env")]
    pub key_env: String,
    /// Blob in the bucket holding the raw key bytes. Takes precedence over
    /// `key_env`.
    #[serde(default)]
    pub key_blob: Option<String>,
    /// When set, the key is a KMS-wrapped key and this names the KMS key.
    #[serde(default)]
    pub kms_key_name: Option<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            info_types: default_info_types(),
            surrogate: default_surrogate(),
            key_env: default_key_env(),
            key_blob: None,
            kms_key_name: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_info_types() -> Vec<String> {
    [
        "FIRST_NAME",
        "LAST_NAME",
        "FEMALE_NAME",
        "MALE_NAME",
        "PERSON_NAME",
        "STREET_ADDRESS",
        "ITALY_FISCAL_CODE",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_surrogate() -> String {
    "REDACTED".to_string()
}

fn default_key_env() -> String {
    "DLP_KEY_B64".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct NerConfig {
    /// Base URL of the entity-linking service.
    #[serde(default = "default_ner_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_reference_table")]
    pub reference_table: PathBuf,
    #[serde(default = "default_true")]
    pub resolve_abbreviations: bool,
    /// Keep each surface string once per category.
    #[serde(default = "default_true")]
    pub dedup_entities: bool,
}

impl Default for NerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_ner_endpoint(),
            reference_table: default_reference_table(),
            resolve_abbreviations: true,
            dedup_entities: true,
        }
    }
}

fn default_ner_endpoint() -> String {
    "http://127.0.0.1:8081".to_string()
}

fn default_reference_table() -> PathBuf {
    PathBuf::from("./data/UMLS_tuis.csv")
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseBackend {
    #[default]
    Bigquery,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub backend: WarehouseBackend,
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default = "default_table")]
    pub table: String,
    /// How long a row lookup may run before BigQuery gives up on it.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            backend: WarehouseBackend::default(),
            dataset: default_dataset(),
            table: default_table(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

fn default_dataset() -> String {
    "covid19".to_string()
}
fn default_table() -> String {
    "cases".to_string()
}
fn default_query_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DocstoreBackend {
    #[default]
    Datastore,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocstoreConfig {
    #[serde(default)]
    pub backend: DocstoreBackend,
    #[serde(default = "default_kind")]
    pub kind: String,
}

impl Default for DocstoreConfig {
    fn default() -> Self {
        Self {
            backend: DocstoreBackend::default(),
            kind: default_kind(),
        }
    }
}

fn default_kind() -> String {
    "case".to_string()
}

/// SQLite database for processing state and the local sinks.
#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/casefile.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Stop words for the cleaning filter. Defaults to the curated list for
    /// the case-report corpus.
    #[serde(default)]
    pub stop_words: Option<Vec<String>>,
    /// Skip stages recorded as complete in the processing state.
    #[serde(default = "default_true")]
    pub resume: bool,
    #[serde(default)]
    pub test_case: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stop_words: None,
            resume: true,
            test_case: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PubSubConfig {
    /// Topic receiving `{text, doc_title}` messages after OCR.
    #[serde(default = "default_topic")]
    pub topic: String,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
        }
    }
}

fn default_topic() -> String {
    "case-text".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Config {
    /// Fully local configuration: filesystem bucket, SQLite sinks, no
    /// redaction. Used when no config file exists and for scaffolding.
    pub fn minimal() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::Filesystem,
                bucket: Some("casefile".to_string()),
                root: default_storage_root(),
            },
            redaction: RedactionConfig {
                enabled: false,
                ..RedactionConfig::default()
            },
            warehouse: WarehouseConfig {
                backend: WarehouseBackend::Sqlite,
                ..WarehouseConfig::default()
            },
            docstore: DocstoreConfig {
                backend: DocstoreBackend::Sqlite,
                ..DocstoreConfig::default()
            },
            ..Config::default()
        }
    }

    pub fn bucket(&self) -> Result<&str> {
        self.storage.bucket.as_deref().ok_or_else(|| {
            StageError::Configuration("storage.bucket (or BUCKET_NAME) is not set".into()).into()
        })
    }

    pub fn project_id(&self) -> Result<&str> {
        self.project.id.as_deref().ok_or_else(|| {
            StageError::Configuration("project.id (or PROJECT_ID) is not set".into()).into()
        })
    }
}

/// Apply environment overrides through `lookup`.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("PROJECT_ID") {
        config.project.id = Some(v);
    }
    if let Some(v) = get("BUCKET_NAME") {
        config.storage.bucket = Some(v);
    }
    if let Some(v) = get("LOCATION") {
        config.project.location = v;
    }
    if let Some(v) = get("SA_KEY_PATH") {
        config.project.credentials = Some(PathBuf::from(v));
    }
    if let Some(v) = get("BQ_DATASET_NAME") {
        config.warehouse.dataset = v;
    }
    if let Some(v) = get("BQ_TABLE_NAME") {
        config.warehouse.table = v;
    }
    if let Some(v) = get("TEST_CASE") {
        config.pipeline.test_case = Some(v);
    }
    if let Some(v) = get("RESULT_TOPIC") {
        config.pubsub.topic = v;
    }
}

/// Read, override from the process environment, and validate.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut config = parse_config(&content)?;
    apply_env_overrides(&mut config, |k| std::env::var(k).ok());
    validate(&config)?;
    Ok(config)
}

/// Configuration from the environment alone, on top of [`Config::default`].
pub fn config_from_env() -> Result<Config> {
    let mut config = Config::default();
    apply_env_overrides(&mut config, |k| std::env::var(k).ok());
    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    Ok(config)
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    StageError::Configuration(message.into()).into()
}

pub fn validate(config: &Config) -> Result<()> {
    let engines = &config.engines;
    if !(1..=100).contains(&engines.ocr_batch_size) {
        return Err(invalid("engines.ocr_batch_size must be in [1, 100]"));
    }
    if engines.ocr_timeout_secs == 0 || engines.translation_timeout_secs == 0 {
        return Err(invalid("engine timeouts must be > 0"));
    }
    if engines.poll_interval_secs == 0 {
        return Err(invalid("engines.poll_interval_secs must be > 0"));
    }
    if engines.source_language.is_empty() || engines.target_language.is_empty() {
        return Err(invalid("engines.source_language and target_language must be set"));
    }
    if engines.translation_mode == TranslationMode::Batch && config.project.location == "global" {
        return Err(invalid(
            "batch translation needs a regional project.location (e.g. us-central1), not 'global'",
        ));
    }

    if config.storage.backend == StorageBackend::Filesystem && config.storage.bucket.is_none() {
        return Err(invalid("storage.bucket must be set for the filesystem backend"));
    }

    if config.redaction.enabled {
        if config.redaction.info_types.is_empty() {
            return Err(invalid("redaction.info_types must not be empty"));
        }
        if config.redaction.surrogate.trim().is_empty() {
            return Err(invalid("redaction.surrogate must not be empty"));
        }
    }

    if config.warehouse.dataset.is_empty() || config.warehouse.table.is_empty() {
        return Err(invalid("warehouse.dataset and warehouse.table must be set"));
    }
    if config.warehouse.query_timeout_secs == 0 {
        return Err(invalid("warehouse.query_timeout_secs must be > 0"));
    }
    if config.docstore.kind.is_empty() {
        return Err(invalid("docstore.kind must not be empty"));
    }

    Ok(())
}
