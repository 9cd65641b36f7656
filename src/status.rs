//! Processing-state overview.
//!
//! `casefile status` shows how far each document has come, when it last
//! moved, and why it stopped if a step failed.

use std::collections::BTreeMap;

use anyhow::Result;
use casefile_core::state::{ProcessingState, Stage};
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::context::open_sqlite;
use casefile_core::store::StateStore;

pub async fn run_status(config: &Config) -> Result<()> {
    let store = open_sqlite(config).await?;
    let states = store.list().await?;

    println!("casefile — Processing Status");
    println!("============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Documents:   {}", states.len());

    let failed = states.iter().filter(|s| s.last_error.is_some()).count();
    println!("  Failing:     {}", failed);

    let mut by_stage: BTreeMap<Stage, usize> = BTreeMap::new();
    for state in &states {
        *by_stage.entry(state.stage()).or_default() += 1;
    }
    if !by_stage.is_empty() {
        println!();
        println!("  By stage:");
        for (stage, count) in &by_stage {
            println!("    {:<20} {:>6}", stage.as_str(), count);
        }
    }

    if !states.is_empty() {
        println!();
        print!("{}", format_table(&states, Utc::now()));
    }
    println!();

    store.pool().close().await;
    Ok(())
}

/// Per-document rows, one line each.
pub fn format_table(states: &[ProcessingState], now: DateTime<Utc>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "  {:<20} {:<20} {:<12}   {}\n",
        "DOCUMENT", "STAGE", "UPDATED", "LAST ERROR"
    ));
    out.push_str(&format!("  {}\n", "-".repeat(76)));
    for state in states {
        let error = state.last_error.as_deref().unwrap_or("-");
        out.push_str(&format!(
            "  {:<20} {:<20} {:<12}   {}\n",
            state.doc_title,
            state.stage().as_str(),
            format_relative(state.updated_at, now),
            truncate(error, 60)
        ));
    }
    out
}

fn format_relative(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - ts).num_seconds().max(0);
    if secs < 60 {
        "just now".to_string()
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86_400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86_400)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
