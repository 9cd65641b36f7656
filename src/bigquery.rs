//! BigQuery warehouse over the v2 REST API.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use casefile_core::error::StageError;
use casefile_core::models::{Ensured, WarehouseRow, WAREHOUSE_COLUMNS};
use casefile_core::store::Warehouse;
use serde::Deserialize;
use tokio::time::Instant;

use crate::gcp::{check, GcpClient};

const SERVICE: &str = "bigquery";

pub struct BigQueryWarehouse {
    client: GcpClient,
    base: String,
    project: String,
    query_timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Deserialize)]
struct TableSchema {
    fields: Vec<FieldSchema>,
}

#[derive(Deserialize)]
struct FieldSchema {
    name: String,
}

#[derive(Deserialize)]
struct TableRow {
    f: Vec<TableCell>,
}

#[derive(Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Option<serde_json::Value>,
}

/// Table schema: every column a required string.
pub fn table_schema() -> serde_json::Value {
    let fields: Vec<_> = WAREHOUSE_COLUMNS
        .iter()
        .map(|name| serde_json::json!({ "name": name, "type": "STRING", "mode": "REQUIRED" }))
        .collect();
    serde_json::json!({ "fields": fields })
}

impl BigQueryWarehouse {
    pub fn new(
        client: GcpClient,
        base: &str,
        project: impl Into<String>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            project: project.into(),
            query_timeout,
        }
    }

    fn project_url(&self) -> String {
        format!("{}/bigquery/v2/projects/{}", self.base, self.project)
    }

    /// POST a create request; 409 means someone else created it first.
    async fn create(&self, url: &str, body: &serde_json::Value) -> Result<bool> {
        let response = self.client.execute(|http| http.post(url).json(body)).await?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(false);
        }
        check(SERVICE, response).await?;
        Ok(true)
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn ensure_dataset(&self, dataset: &str) -> Result<Ensured> {
        let url = format!("{}/datasets/{}", self.project_url(), dataset);
        let existing: Option<serde_json::Value> =
            self.client.json_opt(SERVICE, |http| http.get(&url)).await?;

        let created = match existing {
            Some(_) => false,
            None => {
                let body = serde_json::json!({
                    "datasetReference": { "projectId": self.project, "datasetId": dataset }
                });
                self.create(&format!("{}/datasets", self.project_url()), &body)
                    .await
                    .with_context(|| format!("Failed to create dataset {}", dataset))?
            }
        };
        Ok(Ensured {
            id: format!("{}.{}", self.project, dataset),
            created,
        })
    }

    async fn ensure_table(&self, dataset: &str, table: &str) -> Result<Ensured> {
        let url = format!("{}/datasets/{}/tables/{}", self.project_url(), dataset, table);
        let existing: Option<serde_json::Value> =
            self.client.json_opt(SERVICE, |http| http.get(&url)).await?;

        let created = match existing {
            Some(_) => false,
            None => {
                let body = serde_json::json!({
                    "tableReference": {
                        "projectId": self.project,
                        "datasetId": dataset,
                        "tableId": table
                    },
                    "schema": table_schema()
                });
                let url = format!("{}/datasets/{}/tables", self.project_url(), dataset);
                self.create(&url, &body)
                    .await
                    .with_context(|| format!("Failed to create table {}.{}", dataset, table))?
            }
        };
        Ok(Ensured {
            id: format!("{}.{}.{}", self.project, dataset, table),
            created,
        })
    }

    async fn insert_row(&self, dataset: &str, table: &str, row: &WarehouseRow) -> Result<()> {
        let url = format!(
            "{}/datasets/{}/tables/{}/insertAll",
            self.project_url(),
            dataset,
            table
        );
        let body = serde_json::json!({
            "rows": [{ "insertId": uuid::Uuid::new_v4().to_string(), "json": row }]
        });
        let response: InsertAllResponse = self
            .client
            .json(SERVICE, |http| http.post(&url).json(&body))
            .await?;

        if !response.insert_errors.is_empty() {
            return Err(StageError::AssertionFailure(format!(
                "insert of {} into {}.{} reported errors: {}",
                row.case,
                dataset,
                table,
                serde_json::Value::Array(response.insert_errors)
            ))
            .into());
        }
        Ok(())
    }

    async fn find_case(
        &self,
        dataset: &str,
        table: &str,
        case: &str,
    ) -> Result<Option<WarehouseRow>> {
        let url = format!("{}/queries", self.project_url());
        let body = serde_json::json!({
            "query": format!(
                "SELECT * FROM `{}.{}.{}` WHERE `case` = @case LIMIT 1",
                self.project, dataset, table
            ),
            "useLegacySql": false,
            "parameterMode": "NAMED",
            "queryParameters": [{
                "name": "case",
                "parameterType": { "type": "STRING" },
                "parameterValue": { "value": case }
            }],
            "timeoutMs": 10000
        });
        let mut response: QueryResponse = self
            .client
            .json(SERVICE, |http| http.post(&url).json(&body))
            .await?;

        let started = Instant::now();
        while !response.job_complete {
            if started.elapsed() >= self.query_timeout {
                return Err(StageError::StageTimeout {
                    stage: "bigquery query".to_string(),
                    waited_secs: self.query_timeout.as_secs(),
                }
                .into());
            }
            let job = response
                .job_reference
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("incomplete query without a job reference"))?;
            let poll_url = format!("{}/queries/{}", self.project_url(), job.job_id);
            let location = job.location.clone();
            response = self
                .client
                .json(SERVICE, |http| {
                    let mut req = http.get(&poll_url).query(&[("timeoutMs", "10000")]);
                    if let Some(loc) = &location {
                        req = req.query(&[("location", loc.as_str())]);
                    }
                    req
                })
                .await?;
        }

        decode_first_row(&response)
    }
}

fn decode_first_row(response: &QueryResponse) -> Result<Option<WarehouseRow>> {
    let Some(row) = response.rows.first() else {
        return Ok(None);
    };
    let schema = response
        .schema
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("query result has rows but no schema"))?;

    let mut values = serde_json::Map::new();
    for (field, cell) in schema.fields.iter().zip(&row.f) {
        let value = cell.v.clone().unwrap_or(serde_json::Value::Null);
        values.insert(field.name.clone(), value);
    }
    let row: WarehouseRow = serde_json::from_value(serde_json::Value::Object(values))
        .context("query row does not match the case table schema")?;
    Ok(Some(row))
}
