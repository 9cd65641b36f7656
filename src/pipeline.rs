//! Batch driver.
//!
//! `run_pipeline` walks every scan under `pdf/` in listing order and moves
//! each document through the steps its sinks need, one document at a
//! time. Completed steps are recorded in the state store, so an
//! interrupted run resumes where it stopped and a replaced scan starts
//! over. A failing step is logged with its error kind and ends work on
//! that document only; the run itself fails only on configuration or
//! state-store errors.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use casefile_core::entities::SciModel;
use casefile_core::error::{classify, ErrorKind, StageError};
use casefile_core::layout;
use casefile_core::models::{BlobMeta, DocTitle};
use casefile_core::state::{content_hash, ProcessingState, SinkSelection, Step};

use crate::context::PipelineContext;
use crate::progress::{PipelineProgressEvent, PipelineProgressReporter};
use crate::stages;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub sinks: SinkSelection,
    pub model: Option<SciModel>,
    /// Ignore recorded progress and redo every step.
    pub force: bool,
    pub limit: Option<usize>,
    /// Process only this document title.
    pub only: Option<String>,
}

impl RunOptions {
    /// Reject option combinations before any stage runs.
    pub fn validate(&self) -> Result<()> {
        if self.sinks.docstore && self.model.is_none() {
            let allowed: Vec<&str> = SciModel::ALL.iter().map(|m| m.as_str()).collect();
            return Err(StageError::Configuration(format!(
                "storing to the document store requires --model (one of: {})",
                allowed.join(", ")
            ))
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DocumentFailure {
    pub doc_title: String,
    pub step: Step,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub discovered: usize,
    pub processed: usize,
    pub up_to_date: usize,
    pub failures: Vec<DocumentFailure>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn print(&self, heading: &str) {
        println!("{}", heading);
        println!("{}", "=".repeat(heading.chars().count()));
        println!();
        println!("  Documents:    {}", self.discovered);
        println!("  Processed:    {}", self.processed);
        println!("  Up to date:   {}", self.up_to_date);
        println!("  Failed:       {}", self.failed());
        println!("  Elapsed:      {:.1}s", self.elapsed.as_secs_f64());
        if !self.failures.is_empty() {
            println!();
            for f in &self.failures {
                println!(
                    "  {:<16} {:<16} {:<18} {}",
                    f.doc_title,
                    f.step.as_str(),
                    f.kind.as_str(),
                    f.message
                );
            }
        }
    }
}

/// Source scans under `pdf/` grouped by the title they derive. Titles
/// claimed by more than one scan are reported as failures and left out,
/// since every output blob of a document is keyed by its title.
pub fn group_scans(
    metas: impl IntoIterator<Item = BlobMeta>,
) -> (Vec<(DocTitle, BlobMeta)>, Vec<DocumentFailure>) {
    let mut groups: Vec<(DocTitle, Vec<BlobMeta>)> = Vec::new();
    for meta in metas {
        if !layout::is_source_pdf(&meta.name) {
            continue;
        }
        let title = match DocTitle::from_blob_name(&meta.name) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(blob = %meta.name, error = %e, "skipping unrecognised scan");
                continue;
            }
        };
        match groups.iter_mut().find(|(t, _)| *t == title) {
            Some((_, scans)) => scans.push(meta),
            None => groups.push((title, vec![meta])),
        }
    }

    let mut scans = Vec::with_capacity(groups.len());
    let mut conflicts = Vec::new();
    for (title, mut metas) in groups {
        if metas.len() == 1 {
            if let Some(meta) = metas.pop() {
                scans.push((title, meta));
            }
            continue;
        }
        let names: Vec<&str> = metas.iter().map(|m| m.name.as_str()).collect();
        tracing::warn!(doc_title = %title, scans = ?names, "scans share a document title");
        conflicts.push(DocumentFailure {
            doc_title: title.to_string(),
            step: Step::Ocr,
            kind: ErrorKind::Configuration,
            message: format!(
                "scans {} share document title '{}'; rename all but one",
                names.join(", "),
                title
            ),
        });
    }
    (scans, conflicts)
}

/// Scans to process, filtered and limited per `opts`, plus the titles
/// that cannot be processed because several scans claim them.
async fn discover(
    ctx: &PipelineContext,
    opts: &RunOptions,
) -> Result<(Vec<(DocTitle, BlobMeta)>, Vec<DocumentFailure>)> {
    let listed = ctx.objects.list(layout::PDF_PREFIX).await?;
    let (mut documents, mut conflicts) = group_scans(listed);
    if let Some(only) = opts.only.as_deref() {
        documents.retain(|(title, _)| title.as_str() == only);
        conflicts.retain(|f| f.doc_title == only);
    }
    if let Some(limit) = opts.limit {
        documents.truncate(limit);
    }
    Ok((documents, conflicts))
}

/// Loaded or fresh state for `title`, reset when the scan changed.
async fn prepare_state(
    ctx: &PipelineContext,
    title: &DocTitle,
    hash: &str,
    force: bool,
) -> Result<ProcessingState> {
    let state = match ctx.state.load(title.as_str()).await? {
        Some(mut state) => {
            if state.reset_if_changed(hash) {
                tracing::info!(doc_title = %title, "source scan changed, reprocessing");
            }
            if force || !ctx.config.pipeline.resume {
                state.completed.clear();
            }
            state
        }
        None => ProcessingState::new(title.as_str(), hash),
    };
    Ok(state)
}

pub async fn run_pipeline(
    ctx: &PipelineContext,
    opts: &RunOptions,
    progress: &dyn PipelineProgressReporter,
) -> Result<RunSummary> {
    opts.validate()?;
    let started = Instant::now();

    if opts.sinks.warehouse {
        stages::ensure_warehouse(ctx).await?;
    }

    let (documents, conflicts) = discover(ctx, opts).await?;
    let total = documents.len() as u64;
    progress.report(PipelineProgressEvent::Discovered { total });
    tracing::info!(documents = total, conflicts = conflicts.len(), "pipeline started");

    let mut summary = RunSummary {
        discovered: documents.len() + conflicts.len(),
        ..RunSummary::default()
    };
    for conflict in conflicts {
        progress.report(PipelineProgressEvent::Failed {
            doc_title: conflict.doc_title.clone(),
            step: conflict.step,
            kind: conflict.kind,
        });
        summary.failures.push(conflict);
    }

    for (i, (title, meta)) in documents.iter().enumerate() {
        let n = i as u64 + 1;
        let doc_started = Instant::now();
        let hash = content_hash(&meta.name, &meta.fingerprint);
        let mut state = prepare_state(ctx, title, &hash, opts.force).await?;

        let plan = state.plan(opts.sinks, ctx.redaction_enabled());
        if plan.is_empty() {
            tracing::debug!(doc_title = %title, "up to date");
            progress.report(PipelineProgressEvent::UpToDate {
                doc_title: title.to_string(),
                n,
                total,
            });
            summary.up_to_date += 1;
            continue;
        }

        let mut failed = false;
        for step in plan {
            progress.report(PipelineProgressEvent::Step {
                doc_title: title.to_string(),
                step,
                n,
                total,
            });
            match stages::execute_step(ctx, step, title, &meta.name).await {
                Ok(()) => {
                    state.complete(step);
                    ctx.state.save(&state).await?;
                }
                Err(e) => {
                    let kind = classify(&e);
                    let message = format!("{:#}", e);
                    tracing::error!(
                        doc_title = %title,
                        step = %step,
                        kind = kind.as_str(),
                        error = %message,
                        "document failed"
                    );
                    progress.report(PipelineProgressEvent::Failed {
                        doc_title: title.to_string(),
                        step,
                        kind,
                    });
                    state.fail(format!("{}: {}", step, message));
                    ctx.state.save(&state).await?;
                    summary.failures.push(DocumentFailure {
                        doc_title: title.to_string(),
                        step,
                        kind,
                        message,
                    });
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            summary.processed += 1;
            tracing::info!(
                doc_title = %title,
                stage = %state.stage(),
                elapsed_ms = doc_started.elapsed().as_millis() as u64,
                "document processed"
            );
        }
    }

    summary.elapsed = started.elapsed();
    tracing::info!(
        processed = summary.processed,
        up_to_date = summary.up_to_date,
        failed = summary.failed(),
        elapsed_secs = summary.elapsed.as_secs_f64(),
        "pipeline finished"
    );
    Ok(summary)
}

/// Prefix whose blobs are the input of `step`.
pub fn step_input_prefix(step: Step) -> &'static str {
    match step {
        Step::Ocr => layout::PDF_PREFIX,
        Step::ExtractText => layout::OCR_PREFIX,
        Step::Translate => layout::RAW_TEXT_PREFIX,
        Step::Curate => layout::ENGLISH_PREFIX,
        Step::Redact | Step::ExtractEntities | Step::StoreWarehouse => layout::CURATED_PREFIX,
        Step::StoreDocstore => layout::ENTITIES_PREFIX,
    }
}

/// Title of the document an input blob belongs to. Batch translation
/// output sits in a per-title directory, so the first segment after the
/// prefix decides.
pub fn input_title(prefix: &str, name: &str) -> Option<DocTitle> {
    let rest = name.strip_prefix(prefix)?;
    let first = rest.split('/').next().filter(|s| !s.is_empty())?;
    DocTitle::from_blob_name(first).ok()
}

/// Run a single step for every document that has its input, in title
/// order. Recorded state is updated for documents that already have one;
/// OCR also starts tracking new scans.
pub async fn run_step_for_all(
    ctx: &PipelineContext,
    step: Step,
    only: Option<&str>,
    progress: &dyn PipelineProgressReporter,
) -> Result<RunSummary> {
    if step == Step::ExtractEntities && ctx.linker.is_none() {
        return Err(StageError::Configuration(
            "the entities step requires --model".into(),
        )
        .into());
    }
    let started = Instant::now();
    if step == Step::StoreWarehouse {
        stages::ensure_warehouse(ctx).await?;
    }

    let prefix = step_input_prefix(step);
    let listed = ctx.objects.list(prefix).await?;
    let mut inputs: BTreeMap<DocTitle, BlobMeta> = BTreeMap::new();
    let mut conflicts = Vec::new();
    if step == Step::Ocr {
        let (scans, duplicates) = group_scans(listed);
        inputs.extend(scans);
        conflicts = duplicates;
    } else {
        for meta in listed {
            if let Some(title) = input_title(prefix, &meta.name) {
                inputs.entry(title).or_insert(meta);
            }
        }
    }
    if let Some(only) = only {
        inputs.retain(|title, _| title.as_str() == only);
        conflicts.retain(|f: &DocumentFailure| f.doc_title == only);
    }

    let total = inputs.len() as u64;
    progress.report(PipelineProgressEvent::Discovered { total });
    let mut summary = RunSummary {
        discovered: inputs.len() + conflicts.len(),
        ..RunSummary::default()
    };
    for conflict in conflicts {
        progress.report(PipelineProgressEvent::Failed {
            doc_title: conflict.doc_title.clone(),
            step: conflict.step,
            kind: conflict.kind,
        });
        summary.failures.push(conflict);
    }

    for (i, (title, meta)) in inputs.iter().enumerate() {
        progress.report(PipelineProgressEvent::Step {
            doc_title: title.to_string(),
            step,
            n: i as u64 + 1,
            total,
        });
        let mut state = ctx.state.load(title.as_str()).await?;
        if step == Step::Ocr {
            let hash = content_hash(&meta.name, &meta.fingerprint);
            let mut s = state.unwrap_or_else(|| ProcessingState::new(title.as_str(), &hash));
            s.reset_if_changed(&hash);
            state = Some(s);
        }

        match stages::execute_step(ctx, step, title, &meta.name).await {
            Ok(()) => {
                summary.processed += 1;
                if let Some(state) = state.as_mut() {
                    state.complete(step);
                    ctx.state.save(state).await?;
                }
                tracing::info!(doc_title = %title, step = %step, "step completed");
            }
            Err(e) => {
                let kind = classify(&e);
                let message = format!("{:#}", e);
                tracing::error!(
                    doc_title = %title,
                    step = %step,
                    kind = kind.as_str(),
                    error = %message,
                    "document failed"
                );
                progress.report(PipelineProgressEvent::Failed {
                    doc_title: title.to_string(),
                    step,
                    kind,
                });
                if let Some(state) = state.as_mut() {
                    state.fail(format!("{}: {}", step, message));
                    ctx.state.save(state).await?;
                }
                summary.failures.push(DocumentFailure {
                    doc_title: title.to_string(),
                    step,
                    kind,
                    message,
                });
            }
        }
    }

    summary.elapsed = started.elapsed();
    Ok(summary)
}
