use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Local warehouse: datasets, tables, and append-only rows
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS warehouse_datasets (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS warehouse_tables (
            dataset TEXT NOT NULL,
            name TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (dataset, name),
            FOREIGN KEY (dataset) REFERENCES warehouse_datasets(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS warehouse_rows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dataset TEXT NOT NULL,
            table_name TEXT NOT NULL,
            "case" TEXT NOT NULL,
            it_raw_txt TEXT NOT NULL,
            eng_raw_txt TEXT NOT NULL,
            eng_txt TEXT NOT NULL,
            inserted_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Local document store: one JSON record per (kind, name)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS docstore_entities (
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            properties_json TEXT NOT NULL,
            seq INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (kind, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-document processing state
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_state (
            doc_title TEXT PRIMARY KEY,
            stage TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            completed_json TEXT NOT NULL DEFAULT '[]',
            last_error TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_warehouse_rows_case ON warehouse_rows(dataset, table_name, "case")"#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_docstore_seq ON docstore_entities(kind, seq)")
        .execute(pool)
        .await?;

    Ok(())
}
