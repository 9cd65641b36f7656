//! SQLite implementations of the warehouse, document-store, and
//! processing-state traits.
//!
//! Used for local runs (`backend = "sqlite"`) and always for processing
//! state. All three share one pool; tables are created by
//! [`crate::migrate`].

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use casefile_core::error::StageError;
use casefile_core::models::{CaseFilter, CaseRecord, CategoryMap, Ensured, WarehouseRow};
use casefile_core::state::{ProcessingState, Step};
use casefile_core::store::{DocumentStore, StateStore, Warehouse};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

pub struct SqliteStore {
    pool: SqlitePool,
    kind: String,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, kind: impl Into<String>) -> Self {
        Self {
            pool,
            kind: kind.into(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn table_exists(&self, dataset: &str, table: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM warehouse_tables WHERE dataset = ? AND name = ?",
        )
        .bind(dataset)
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

#[async_trait]
impl Warehouse for SqliteStore {
    async fn ensure_dataset(&self, dataset: &str) -> Result<Ensured> {
        let result = sqlx::query(
            "INSERT INTO warehouse_datasets (name, created_at) VALUES (?, ?) ON CONFLICT(name) DO NOTHING",
        )
        .bind(dataset)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(Ensured {
            id: dataset.to_string(),
            created: result.rows_affected() == 1,
        })
    }

    async fn ensure_table(&self, dataset: &str, table: &str) -> Result<Ensured> {
        let dataset_exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM warehouse_datasets WHERE name = ?")
                .bind(dataset)
                .fetch_one(&self.pool)
                .await?;
        if !dataset_exists {
            return Err(StageError::engine(
                "warehouse",
                404,
                format!("dataset {} not found", dataset),
            )
            .into());
        }

        let result = sqlx::query(
            r#"
            INSERT INTO warehouse_tables (dataset, name, created_at) VALUES (?, ?, ?)
            ON CONFLICT(dataset, name) DO NOTHING
            "#,
        )
        .bind(dataset)
        .bind(table)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(Ensured {
            id: format!("{}.{}", dataset, table),
            created: result.rows_affected() == 1,
        })
    }

    async fn insert_row(&self, dataset: &str, table: &str, row: &WarehouseRow) -> Result<()> {
        if !self.table_exists(dataset, table).await? {
            return Err(StageError::engine(
                "warehouse",
                404,
                format!("table {}.{} not found", dataset, table),
            )
            .into());
        }
        sqlx::query(
            r#"
            INSERT INTO warehouse_rows
                (dataset, table_name, "case", it_raw_txt, eng_raw_txt, eng_txt, inserted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(dataset)
        .bind(table)
        .bind(&row.case)
        .bind(&row.it_raw_txt)
        .bind(&row.eng_raw_txt)
        .bind(&row.eng_txt)
        .bind(now_ts())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert row for {}", row.case))?;
        Ok(())
    }

    async fn find_case(
        &self,
        dataset: &str,
        table: &str,
        case: &str,
    ) -> Result<Option<WarehouseRow>> {
        let row = sqlx::query(
            r#"
            SELECT "case", it_raw_txt, eng_raw_txt, eng_txt FROM warehouse_rows
            WHERE dataset = ? AND table_name = ? AND "case" = ?
            ORDER BY id LIMIT 1
            "#,
        )
        .bind(dataset)
        .bind(table)
        .bind(case)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| WarehouseRow {
            case: row.get("case"),
            it_raw_txt: row.get("it_raw_txt"),
            eng_raw_txt: row.get("eng_raw_txt"),
            eng_txt: row.get("eng_txt"),
        }))
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn upsert_entities(&self, doc_title: &str, entities: &CategoryMap) -> Result<()> {
        let properties = serde_json::to_string(entities)?;
        // seq is assigned on first insert only, so query order is stable
        sqlx::query(
            r#"
            INSERT INTO docstore_entities (kind, name, properties_json, seq, updated_at)
            VALUES (?, ?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM docstore_entities WHERE kind = ?), ?)
            ON CONFLICT(kind, name) DO UPDATE SET
                properties_json = excluded.properties_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.kind)
        .bind(doc_title)
        .bind(&properties)
        .bind(&self.kind)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, doc_title: &str) -> Result<Option<CaseRecord>> {
        let row = sqlx::query(
            "SELECT name, properties_json FROM docstore_entities WHERE kind = ? AND name = ?",
        )
        .bind(&self.kind)
        .bind(doc_title)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(record_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn query(&self, filter: &CaseFilter, limit: usize) -> Result<Vec<CaseRecord>> {
        let rows = sqlx::query(
            "SELECT name, properties_json FROM docstore_entities WHERE kind = ? ORDER BY seq",
        )
        .bind(&self.kind)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::new();
        for row in rows {
            if results.len() >= limit {
                break;
            }
            let record = record_from_row(&row)?;
            if record.matches(filter) {
                results.push(record);
            }
        }
        Ok(results)
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CaseRecord> {
    let name: String = row.get("name");
    let properties: String = row.get("properties_json");
    let entities: CategoryMap = serde_json::from_str(&properties)
        .with_context(|| format!("Corrupt entity record for {}", name))?;
    Ok(CaseRecord {
        doc_title: name,
        entities,
    })
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load(&self, doc_title: &str) -> Result<Option<ProcessingState>> {
        let row = sqlx::query(
            r#"
            SELECT doc_title, content_hash, completed_json, last_error, updated_at
            FROM processing_state WHERE doc_title = ?
            "#,
        )
        .bind(doc_title)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(state_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, state: &ProcessingState) -> Result<()> {
        let completed = serde_json::to_string(&state.completed)?;
        sqlx::query(
            r#"
            INSERT INTO processing_state
                (doc_title, stage, content_hash, completed_json, last_error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(doc_title) DO UPDATE SET
                stage = excluded.stage,
                content_hash = excluded.content_hash,
                completed_json = excluded.completed_json,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.doc_title)
        .bind(state.stage().as_str())
        .bind(&state.content_hash)
        .bind(&completed)
        .bind(&state.last_error)
        .bind(state.updated_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProcessingState>> {
        let rows = sqlx::query(
            r#"
            SELECT doc_title, content_hash, completed_json, last_error, updated_at
            FROM processing_state ORDER BY doc_title
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(state_from_row).collect()
    }
}

fn state_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ProcessingState> {
    let doc_title: String = row.get("doc_title");
    let completed_json: String = row.get("completed_json");
    let completed: BTreeSet<Step> = serde_json::from_str(&completed_json)
        .with_context(|| format!("Corrupt processing state for {}", doc_title))?;
    let updated_at: i64 = row.get("updated_at");
    Ok(ProcessingState {
        doc_title,
        content_hash: row.get("content_hash"),
        completed,
        updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_else(Utc::now),
        last_error: row.get("last_error"),
    })
}
