//! Cloud Datastore document store over the v1 REST API.
//!
//! Each case is an entity of the configured kind (default `case`) keyed by
//! document title. Every category becomes an array-valued string property,
//! so an equality filter on a category matches when any element equals the
//! value.

use anyhow::{Context, Result};
use async_trait::async_trait;
use casefile_core::models::{CaseFilter, CaseRecord, CategoryMap};
use casefile_core::store::DocumentStore;
use serde_json::{json, Value};

use crate::gcp::GcpClient;

const SERVICE: &str = "datastore";

pub struct DatastoreDocumentStore {
    client: GcpClient,
    base: String,
    project: String,
    kind: String,
}

impl DatastoreDocumentStore {
    pub fn new(
        client: GcpClient,
        base: &str,
        project: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            project: project.into(),
            kind: kind.into(),
        }
    }

    fn key(&self, name: &str) -> Value {
        json!({
            "partitionId": { "projectId": self.project },
            "path": [{ "kind": self.kind, "name": name }]
        })
    }

    async fn call(&self, method: &str, body: &Value) -> Result<Value> {
        let url = format!("{}/v1/projects/{}:{}", self.base, self.project, method);
        self.client
            .json(SERVICE, |http| http.post(&url).json(body))
            .await
    }
}

/// Entity properties for a category map.
pub fn to_properties(entities: &CategoryMap) -> Value {
    let mut properties = serde_json::Map::new();
    for (category, values) in entities {
        let values: Vec<_> = values.iter().map(|v| json!({ "stringValue": v })).collect();
        properties.insert(
            category.clone(),
            json!({ "arrayValue": { "values": values } }),
        );
    }
    Value::Object(properties)
}

/// Query filter: nothing, one property filter, or an AND of several.
pub fn to_filter(filter: &CaseFilter) -> Option<Value> {
    let mut filters: Vec<Value> = filter
        .iter()
        .flat_map(|(field, values)| {
            values.iter().map(move |value| {
                json!({
                    "propertyFilter": {
                        "property": { "name": field },
                        "op": "EQUAL",
                        "value": { "stringValue": value }
                    }
                })
            })
        })
        .collect();

    match filters.len() {
        0 => None,
        1 => filters.pop(),
        _ => Some(json!({ "compositeFilter": { "op": "AND", "filters": filters } })),
    }
}

/// Decode an entity back into a record. Non-string values are skipped.
pub fn from_entity(entity: &Value) -> Option<CaseRecord> {
    let doc_title = entity
        .pointer("/key/path")
        .and_then(|p| p.as_array())
        .and_then(|p| p.last())
        .and_then(|e| e.get("name"))
        .and_then(|n| n.as_str())?
        .to_string();

    let mut entities = CategoryMap::new();
    if let Some(properties) = entity.get("properties").and_then(|p| p.as_object()) {
        for (category, value) in properties {
            let strings: Vec<String> = match value.pointer("/arrayValue/values") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.get("stringValue").and_then(|s| s.as_str()))
                    .map(str::to_string)
                    .collect(),
                _ => value
                    .get("stringValue")
                    .and_then(|s| s.as_str())
                    .map(|s| vec![s.to_string()])
                    .unwrap_or_default(),
            };
            entities.insert(category.clone(), strings);
        }
    }
    Some(CaseRecord {
        doc_title,
        entities,
    })
}

#[async_trait]
impl DocumentStore for DatastoreDocumentStore {
    async fn upsert_entities(&self, doc_title: &str, entities: &CategoryMap) -> Result<()> {
        let body = json!({
            "mode": "NON_TRANSACTIONAL",
            "mutations": [{
                "upsert": {
                    "key": self.key(doc_title),
                    "properties": to_properties(entities)
                }
            }]
        });
        self.call("commit", &body)
            .await
            .with_context(|| format!("Failed to upsert entities for {}", doc_title))?;
        Ok(())
    }

    async fn get(&self, doc_title: &str) -> Result<Option<CaseRecord>> {
        let body = json!({ "keys": [self.key(doc_title)] });
        let response = self.call("lookup", &body).await?;
        Ok(response
            .get("found")
            .and_then(|f| f.as_array())
            .and_then(|found| found.first())
            .and_then(|r| r.get("entity"))
            .and_then(from_entity))
    }

    async fn query(&self, filter: &CaseFilter, limit: usize) -> Result<Vec<CaseRecord>> {
        let mut query = json!({
            "kind": [{ "name": self.kind }],
            "limit": limit
        });
        if let Some(f) = to_filter(filter) {
            query["filter"] = f;
        }
        let body = json!({
            "partitionId": { "projectId": self.project },
            "query": query
        });
        let response = self.call("runQuery", &body).await?;

        let results: Vec<CaseRecord> = response
            .pointer("/batch/entityResults")
            .and_then(|r| r.as_array())
            .map(|results| {
                results
                    .iter()
                    .filter_map(|r| r.get("entity"))
                    .filter_map(from_entity)
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default();
        Ok(results)
    }
}
