//! # casefile CLI
//!
//! Ingestion pipeline for scanned COVID-19 case reports.
//!
//! ## Usage
//!
//! ```bash
//! casefile --config ./config/casefile.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `casefile init` | Create the local database (and bucket directory for filesystem storage) |
//! | `casefile run` | Process every scan under `pdf/` into the selected sinks |
//! | `casefile step <step>` | Run one step for every document that has its input |
//! | `casefile query case [ID]` | Print a case's warehouse row |
//! | `casefile query entities --filter k=v` | Print entity records matching every filter |
//! | `casefile status` | Show per-document processing state |
//! | `casefile serve` | Serve the Pub/Sub push and storage-event endpoints |
//! | `casefile clean` | Clean text from a file or stdin |
//!
//! ## Examples
//!
//! ```bash
//! casefile run --store-bigquery
//! casefile run --store-bigquery --store-datastore --model en_core_sci_lg
//! casefile step translate --doc case14
//! casefile query entities --filter "Sign or Symptom=chills" --limit 10
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use casefile::config::{self, Config, StorageBackend};
use casefile::context::{self, PipelineContext};
use casefile::pipeline::{self, RunOptions};
use casefile::progress::ProgressMode;
use casefile::{migrate, query, server, status};
use casefile_core::clean::{clean_text, StopWords};
use casefile_core::entities::SciModel;
use casefile_core::layout;
use casefile_core::state::{SinkSelection, Step};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "./config/casefile.toml";

/// casefile: OCR, translate, redact and index scanned case reports.
#[derive(Parser)]
#[command(name = "casefile", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/casefile.toml` when it exists; otherwise the
    /// configuration comes from environment variables alone.
    #[arg(long, global = true, env = "CASEFILE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the local database schema.
    ///
    /// With filesystem storage, also creates the bucket directory and its
    /// `pdf/` prefix. Safe to run repeatedly.
    Init,

    /// Process every scan under `pdf/`.
    ///
    /// Documents are handled one at a time. Completed steps are remembered,
    /// so a second run only does outstanding work. A failing document is
    /// logged and skipped.
    Run {
        /// Append one row per document to the warehouse.
        #[arg(long, alias = "store-bigquery")]
        store_warehouse: bool,

        /// Extract entities and upsert them into the document store.
        /// Requires `--model`.
        #[arg(long, alias = "store-datastore")]
        store_docstore: bool,

        /// Recognition model: en_core_sci_sm, en_core_sci_lg or
        /// en_ner_bc5cdr_md.
        #[arg(long)]
        model: Option<SciModel>,

        /// Redo every step, ignoring recorded progress.
        #[arg(long)]
        force: bool,

        /// Process at most this many documents.
        #[arg(long)]
        limit: Option<usize>,

        /// Process only this document title.
        #[arg(long = "doc")]
        doc: Option<String>,

        /// Progress on stderr. Defaults to human on a terminal, else off.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Run a single step for every document that has its input.
    Step {
        /// ocr, extract-text, translate, curate, redact, entities,
        /// store-warehouse or store-docstore.
        step: Step,

        /// Only this document title.
        #[arg(long = "doc")]
        doc: Option<String>,

        /// Recognition model, required by the entities step.
        #[arg(long)]
        model: Option<SciModel>,

        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Read results back from the sinks.
    Query {
        #[command(subcommand)]
        target: QueryTarget,
    },

    /// Show per-document processing state.
    Status,

    /// Serve the event endpoints for Pub/Sub push and storage notifications.
    Serve,

    /// Clean text the way the curate step does and print it.
    Clean {
        /// Input file. Reads stdin when omitted.
        #[arg(long)]
        input: Option<PathBuf>,

        /// Keep every token.
        #[arg(long)]
        no_stop_words: bool,
    },
}

#[derive(Subcommand)]
enum QueryTarget {
    /// Warehouse row for a case. Defaults to `TEST_CASE`.
    Case { id: Option<String> },

    /// Entity records containing every `field=value`.
    Entities {
        /// Repeatable. Values for the same field must all be present.
        #[arg(long = "filter", value_name = "FIELD=VALUE")]
        filters: Vec<String>,

        #[arg(long, default_value_t = query::DEFAULT_QUERY_LIMIT)]
        limit: usize,
    },
}

fn resolve_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_config(Path::new(DEFAULT_CONFIG)),
        None => config::config_from_env(),
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("casefile=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_clean(cfg: &Config, input: Option<&Path>, no_stop_words: bool) -> Result<()> {
    let text = match input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };
    let stop_words = if no_stop_words {
        StopWords::new()
    } else {
        context::stop_words(cfg)
    };
    println!("{}", clean_text(&text, &stop_words));
    Ok(())
}

async fn run_init(cfg: &Config) -> Result<()> {
    migrate::run_migrations(cfg).await?;
    println!("Database initialized at {}", cfg.db.path.display());
    if cfg.storage.backend == StorageBackend::Filesystem {
        let dir = cfg.storage.root.join(cfg.bucket()?).join(layout::PDF_PREFIX);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        println!("Bucket directory ready at {}", dir.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing();

    // Needs no services; falls back to local defaults without a config.
    if let Commands::Clean {
        input,
        no_stop_words,
    } = &cli.command
    {
        let cfg = resolve_config(cli.config.as_deref()).unwrap_or_else(|_| Config::minimal());
        return run_clean(&cfg, input.as_deref(), *no_stop_words);
    }

    let cfg = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Run {
            store_warehouse,
            store_docstore,
            model,
            force,
            limit,
            doc,
            progress,
        } => {
            let opts = RunOptions {
                sinks: SinkSelection {
                    warehouse: store_warehouse,
                    docstore: store_docstore,
                },
                model,
                force,
                limit,
                only: doc,
            };
            opts.validate()?;
            if !store_warehouse && !store_docstore {
                tracing::warn!("no sink selected; documents are processed up to curation only");
            }
            let ctx = PipelineContext::from_config(&cfg, model).await?;
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let summary = pipeline::run_pipeline(&ctx, &opts, reporter.as_ref()).await?;
            summary.print("casefile run");
        }
        Commands::Step {
            step,
            doc,
            model,
            progress,
        } => {
            let ctx = PipelineContext::from_config(&cfg, model).await?;
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let summary =
                pipeline::run_step_for_all(&ctx, step, doc.as_deref(), reporter.as_ref()).await?;
            summary.print(&format!("casefile step {}", step));
        }
        Commands::Query { target } => match target {
            QueryTarget::Case { id } => query::run_case_lookup(&cfg, id.as_deref()).await?,
            QueryTarget::Entities { filters, limit } => {
                query::run_entity_query(&cfg, &filters, limit).await?
            }
        },
        Commands::Status => status::run_status(&cfg).await?,
        Commands::Serve => {
            let ctx = PipelineContext::from_config(&cfg, None).await?;
            server::run_server(Arc::new(ctx)).await?;
        }
        Commands::Clean { .. } => unreachable!("handled before config loading"),
    }

    Ok(())
}
