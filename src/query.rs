//! Read-side commands over the two sinks.
//!
//! `casefile query case [ID]` prints the warehouse row of one case and
//! `casefile query entities --filter k=v` prints matching entity records,
//! both as JSON on stdout.

use anyhow::Result;
use casefile_core::error::StageError;
use casefile_core::models::CaseFilter;

use crate::config::Config;
use crate::context::open_sinks;

/// Default result cap for entity queries.
pub const DEFAULT_QUERY_LIMIT: usize = 10;

/// Parse `field=value` arguments into a conjunctive filter. Repeating a
/// field requires every listed value.
pub fn parse_filters(args: &[String]) -> Result<CaseFilter> {
    let mut filter = CaseFilter::new();
    for arg in args {
        let Some((field, value)) = arg.split_once('=') else {
            return Err(StageError::Configuration(format!(
                "filter '{}' is not of the form field=value",
                arg
            ))
            .into());
        };
        let field = field.trim();
        if field.is_empty() {
            return Err(
                StageError::Configuration(format!("filter '{}' has an empty field", arg)).into(),
            );
        }
        filter
            .entry(field.to_string())
            .or_default()
            .push(value.trim().to_string());
    }
    Ok(filter)
}

pub async fn run_case_lookup(config: &Config, case: Option<&str>) -> Result<()> {
    let case = case
        .or(config.pipeline.test_case.as_deref())
        .ok_or_else(|| {
            StageError::Configuration("no case given and TEST_CASE is not set".into())
        })?;
    let (warehouse, _) = open_sinks(config).await?;
    let wh = &config.warehouse;

    match warehouse.find_case(&wh.dataset, &wh.table, case).await? {
        Some(row) => println!("{}", serde_json::to_string_pretty(&row)?),
        None => println!("No row for case '{}' in {}.{}", case, wh.dataset, wh.table),
    }
    Ok(())
}

pub async fn run_entity_query(config: &Config, filters: &[String], limit: usize) -> Result<()> {
    let filter = parse_filters(filters)?;
    let (_, docstore) = open_sinks(config).await?;
    let records = docstore.query(&filter, limit).await?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
