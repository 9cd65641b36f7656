//! Run progress reporting.
//!
//! Reports which document and step `casefile run` is on so users can follow
//! a long batch. Progress goes to **stderr** so stdout stays parseable.

use std::io::Write;

use casefile_core::error::ErrorKind;
use casefile_core::state::Step;

/// A single progress event for a pipeline run.
#[derive(Clone, Debug)]
pub enum PipelineProgressEvent {
    /// Source scans found under `pdf/`.
    Discovered { total: u64 },
    /// Document `n` of `total` is starting `step`.
    Step {
        doc_title: String,
        step: Step,
        n: u64,
        total: u64,
    },
    /// Every required step was already complete.
    UpToDate { doc_title: String, n: u64, total: u64 },
    /// `step` failed; the run moves on to the next document.
    Failed {
        doc_title: String,
        step: Step,
        kind: ErrorKind,
    },
}

pub trait PipelineProgressReporter: Send + Sync {
    fn report(&self, event: PipelineProgressEvent);
}

/// Human-friendly progress on stderr: "run [3/12] case3  translate".
pub struct StderrProgress;

impl PipelineProgressReporter for StderrProgress {
    fn report(&self, event: PipelineProgressEvent) {
        let line = match &event {
            PipelineProgressEvent::Discovered { total } => {
                format!("run  discovered {} documents\n", format_number(*total))
            }
            PipelineProgressEvent::Step {
                doc_title,
                step,
                n,
                total,
            } => format!("run [{}/{}] {}  {}\n", n, total, doc_title, step),
            PipelineProgressEvent::UpToDate {
                doc_title,
                n,
                total,
            } => format!("run [{}/{}] {}  up to date\n", n, total, doc_title),
            PipelineProgressEvent::Failed {
                doc_title,
                step,
                kind,
            } => format!("run  {}  {} failed ({})\n", doc_title, step, kind.as_str()),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &PipelineProgressEvent) -> serde_json::Value {
        match event {
            PipelineProgressEvent::Discovered { total } => serde_json::json!({
                "event": "discovered",
                "total": total
            }),
            PipelineProgressEvent::Step {
                doc_title,
                step,
                n,
                total,
            } => serde_json::json!({
                "event": "step",
                "doc_title": doc_title,
                "step": step.as_str(),
                "n": n,
                "total": total
            }),
            PipelineProgressEvent::UpToDate {
                doc_title,
                n,
                total,
            } => serde_json::json!({
                "event": "up_to_date",
                "doc_title": doc_title,
                "n": n,
                "total": total
            }),
            PipelineProgressEvent::Failed {
                doc_title,
                step,
                kind,
            } => serde_json::json!({
                "event": "failed",
                "doc_title": doc_title,
                "step": step.as_str(),
                "kind": kind.as_str()
            }),
        }
    }
}

impl PipelineProgressReporter for JsonProgress {
    fn report(&self, event: PipelineProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl PipelineProgressReporter for NoProgress {
    fn report(&self, _event: PipelineProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn PipelineProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
