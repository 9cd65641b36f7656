//! Run context: every external handle a pipeline run needs, built once
//! from configuration.
//!
//! Stages take `&PipelineContext` and never construct clients themselves,
//! so tests swap any collaborator for an in-memory fake by filling the
//! fields directly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use casefile_core::clean::{default_stop_words, stop_words_from, StopWords};
use casefile_core::entities::{ReferenceTable, SciModel};
use casefile_core::error::StageError;
use casefile_core::message::MessageBus;
use casefile_core::services::{EntityLinker, OcrEngine, Redactor, Translator};
use casefile_core::store::{DocumentStore, ObjectStore, StateStore, Warehouse};

use crate::bigquery::BigQueryWarehouse;
use crate::blob_fs::FsObjectStore;
use crate::blob_gcs::GcsObjectStore;
use crate::config::{Config, DocstoreBackend, StorageBackend, WarehouseBackend};
use crate::datastore::DatastoreDocumentStore;
use crate::dlp::{CryptoKey, DlpRedactor};
use crate::gcp::{Endpoints, GcpClient};
use crate::linker::HttpEntityLinker;
use crate::pubsub::PubSubBus;
use crate::sqlite_store::SqliteStore;
use crate::translate::CloudTranslator;
use crate::vision::VisionOcr;
use crate::{db, migrate};

pub struct PipelineContext {
    pub config: Arc<Config>,
    pub objects: Arc<dyn ObjectStore>,
    pub ocr: Arc<dyn OcrEngine>,
    pub translator: Arc<dyn Translator>,
    /// `None` when redaction is disabled.
    pub redactor: Option<Arc<dyn Redactor>>,
    /// `None` unless a recognition model was selected.
    pub linker: Option<Arc<dyn EntityLinker>>,
    pub warehouse: Arc<dyn Warehouse>,
    pub docstore: Arc<dyn DocumentStore>,
    pub state: Arc<dyn StateStore>,
    pub bus: Option<Arc<dyn MessageBus>>,
    pub reference: Arc<ReferenceTable>,
    pub stop_words: Arc<StopWords>,
}

impl PipelineContext {
    /// Wire the production adapters selected by `config`.
    pub async fn from_config(config: &Config, model: Option<SciModel>) -> Result<Self> {
        let project = config.project_id()?.to_string();
        let client = GcpClient::from_config(config)?;
        let endpoints = Endpoints::from_config(config);
        let engines = &config.engines;
        let poll = Duration::from_secs(engines.poll_interval_secs);

        let sqlite = Arc::new(open_sqlite(config).await?);
        let objects = build_object_store(config, &client, &endpoints)?;

        let ocr: Arc<dyn OcrEngine> = Arc::new(VisionOcr::new(
            client.clone(),
            &endpoints.vision,
            Duration::from_secs(engines.ocr_timeout_secs),
            poll,
        ));
        let translator: Arc<dyn Translator> = Arc::new(CloudTranslator::new(
            client.clone(),
            &endpoints.translate,
            project.clone(),
            config.project.location.clone(),
            Duration::from_secs(engines.translation_timeout_secs),
            poll,
        ));

        let redactor: Option<Arc<dyn Redactor>> = if config.redaction.enabled {
            let key = load_redaction_key(config, objects.as_ref()).await?;
            Some(Arc::new(DlpRedactor::new(
                client.clone(),
                &endpoints.dlp,
                project.clone(),
                config.redaction.info_types.clone(),
                config.redaction.surrogate.clone(),
                key,
            )))
        } else {
            None
        };

        let (linker, reference) = match model {
            Some(model) => {
                let linker: Arc<dyn EntityLinker> = Arc::new(HttpEntityLinker::new(
                    &config.ner.endpoint,
                    model,
                    config.ner.resolve_abbreviations,
                    Duration::from_secs(engines.request_timeout_secs),
                )?);
                (Some(linker), load_reference_table(config)?)
            }
            None => (None, ReferenceTable::default()),
        };

        let warehouse = build_warehouse(config, &client, &endpoints, &sqlite)?;
        let docstore = build_docstore(config, &client, &endpoints, &sqlite)?;
        let bus: Arc<dyn MessageBus> = Arc::new(PubSubBus::new(client, &endpoints.pubsub, project));

        Ok(Self {
            config: Arc::new(config.clone()),
            objects,
            ocr,
            translator,
            redactor,
            linker,
            warehouse,
            docstore,
            state: sqlite,
            bus: Some(bus),
            reference: Arc::new(reference),
            stop_words: Arc::new(stop_words(config)),
        })
    }

    pub fn redaction_enabled(&self) -> bool {
        self.config.redaction.enabled && self.redactor.is_some()
    }
}

pub fn stop_words(config: &Config) -> StopWords {
    match &config.pipeline.stop_words {
        Some(words) => stop_words_from(words.iter().cloned()),
        None => default_stop_words(),
    }
}

/// Open the SQLite database and bring its schema up to date.
pub async fn open_sqlite(config: &Config) -> Result<SqliteStore> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    Ok(SqliteStore::new(pool, config.docstore.kind.clone()))
}

pub fn build_object_store(
    config: &Config,
    client: &GcpClient,
    endpoints: &Endpoints,
) -> Result<Arc<dyn ObjectStore>> {
    let bucket = config.bucket()?.to_string();
    let store: Arc<dyn ObjectStore> = match config.storage.backend {
        StorageBackend::Gcs => Arc::new(GcsObjectStore::new(client.clone(), &endpoints.storage, bucket)),
        StorageBackend::Filesystem => Arc::new(FsObjectStore::new(&config.storage.root, bucket)),
    };
    Ok(store)
}

pub fn build_warehouse(
    config: &Config,
    client: &GcpClient,
    endpoints: &Endpoints,
    sqlite: &Arc<SqliteStore>,
) -> Result<Arc<dyn Warehouse>> {
    let warehouse: Arc<dyn Warehouse> = match config.warehouse.backend {
        WarehouseBackend::Bigquery => Arc::new(BigQueryWarehouse::new(
            client.clone(),
            &endpoints.bigquery,
            config.project_id()?,
            Duration::from_secs(config.warehouse.query_timeout_secs),
        )),
        WarehouseBackend::Sqlite => sqlite.clone(),
    };
    Ok(warehouse)
}

pub fn build_docstore(
    config: &Config,
    client: &GcpClient,
    endpoints: &Endpoints,
    sqlite: &Arc<SqliteStore>,
) -> Result<Arc<dyn DocumentStore>> {
    let docstore: Arc<dyn DocumentStore> = match config.docstore.backend {
        DocstoreBackend::Datastore => Arc::new(DatastoreDocumentStore::new(
            client.clone(),
            &endpoints.datastore,
            config.project_id()?,
            config.docstore.kind.clone(),
        )),
        DocstoreBackend::Sqlite => sqlite.clone(),
    };
    Ok(docstore)
}

pub fn load_reference_table(config: &Config) -> Result<ReferenceTable> {
    let path = &config.ner.reference_table;
    let file = std::fs::File::open(path).map_err(|e| {
        StageError::Configuration(format!(
            "cannot open reference table {}: {}",
            path.display(),
            e
        ))
    })?;
    let table = ReferenceTable::from_csv(file)
        .with_context(|| format!("Failed to load reference table {}", path.display()))?;
    if table.is_empty() {
        return Err(StageError::Configuration(format!(
            "reference table {} has no rows",
            path.display()
        ))
        .into());
    }
    Ok(table)
}

/// Key from `redaction.key_blob` (raw bytes in the bucket) or from the
/// base64 value of the `redaction.key_env` variable.
async fn load_redaction_key(config: &Config, objects: &dyn ObjectStore) -> Result<CryptoKey> {
    let kms = config.redaction.kms_key_name.as_deref();
    if let Some(blob) = &config.redaction.key_blob {
        let mut bytes = objects
            .read(blob)
            .await?
            .ok_or_else(|| StageError::MissingBlob(blob.clone()))?;
        while matches!(bytes.last(), Some(b'\n') | Some(b'\r')) {
            bytes.pop();
        }
        return CryptoKey::from_bytes(bytes, kms);
    }

    let encoded = std::env::var(&config.redaction.key_env).map_err(|_| {
        StageError::Configuration(format!(
            "redaction is enabled but neither redaction.key_blob nor {} is set",
            config.redaction.key_env
        ))
    })?;
    CryptoKey::from_base64(&encoded, kms)
}

/// Warehouse and document store alone, for read-only commands.
pub async fn open_sinks(config: &Config) -> Result<(Arc<dyn Warehouse>, Arc<dyn DocumentStore>)> {
    let client = GcpClient::from_config(config)?;
    let endpoints = Endpoints::from_config(config);
    let sqlite = Arc::new(open_sqlite(config).await?);
    let warehouse = build_warehouse(config, &client, &endpoints, &sqlite)?;
    let docstore = build_docstore(config, &client, &endpoints, &sqlite)?;
    Ok((warehouse, docstore))
}
