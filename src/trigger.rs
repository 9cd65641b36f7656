//! Event-driven mode.
//!
//! Two handlers replace the batch driver when the pipeline runs behind
//! storage notifications and the message bus:
//!
//! 1. A scan lands under `pdf/`: OCR it, extract the text, publish
//!    `{text, doc_title}` and upload `raw_txt/{title}.txt`.
//! 2. A message arrives: translate the text synchronously, clean it, redact
//!    it, and upload the English, curated and redacted blobs.
//!
//! Handlers for different events are independent. Two of them touching the
//! same document race on blob writes and state; the last write wins.

use anyhow::Result;
use casefile_core::clean::clean_text;
use casefile_core::error::{classify, StageError};
use casefile_core::layout;
use casefile_core::message::PipelineMessage;
use casefile_core::models::DocTitle;
use casefile_core::state::{content_hash, ProcessingState, Step};

use crate::context::PipelineContext;
use crate::{pipeline, stages};

async fn load_state(ctx: &PipelineContext, title: &DocTitle, hash: &str) -> Result<ProcessingState> {
    Ok(match ctx.state.load(title.as_str()).await? {
        Some(mut state) => {
            state.reset_if_changed(hash);
            state
        }
        None => ProcessingState::new(title.as_str(), hash),
    })
}

/// Content hash of the scan `title` came from, or an empty string when the
/// scan is not in the bucket.
async fn source_hash(ctx: &PipelineContext, title: &DocTitle) -> Result<String> {
    let prefix = format!("{}{}", layout::PDF_PREFIX, title);
    let hash = ctx
        .objects
        .list(&prefix)
        .await?
        .into_iter()
        .filter(|meta| layout::is_source_pdf(&meta.name))
        .find(|meta| {
            DocTitle::from_blob_name(&meta.name)
                .map(|t| &t == title)
                .unwrap_or(false)
        })
        .map(|meta| content_hash(&meta.name, &meta.fingerprint))
        .unwrap_or_default();
    Ok(hash)
}

async fn record_failure(
    ctx: &PipelineContext,
    state: &mut ProcessingState,
    step: Step,
    err: &anyhow::Error,
) -> Result<()> {
    tracing::error!(
        doc_title = %state.doc_title,
        step = %step,
        kind = classify(err).as_str(),
        error = %format!("{:#}", err),
        "trigger failed"
    );
    state.fail(format!("{}: {:#}", step, err));
    ctx.state.save(state).await
}

/// Handle a finalized object. Returns the document title, or `None` when
/// the object is not a source scan.
pub async fn handle_pdf_uploaded(ctx: &PipelineContext, name: &str) -> Result<Option<DocTitle>> {
    if !layout::is_source_pdf(name) {
        tracing::debug!(blob = name, "ignoring object outside pdf/");
        return Ok(None);
    }
    let title = DocTitle::from_blob_name(name)?;
    let meta = ctx
        .objects
        .list(name)
        .await?
        .into_iter()
        .find(|meta| meta.name == name)
        .ok_or_else(|| StageError::MissingBlob(name.to_string()))?;
    let mut state = load_state(ctx, &title, &content_hash(&meta.name, &meta.fingerprint)).await?;

    let siblings = ctx
        .objects
        .list(&format!("{}{}", layout::PDF_PREFIX, title))
        .await?;
    let (_, conflicts) = pipeline::group_scans(siblings);
    if let Some(conflict) = conflicts.into_iter().find(|f| f.doc_title == title.as_str()) {
        let e: anyhow::Error = StageError::Configuration(conflict.message).into();
        record_failure(ctx, &mut state, Step::Ocr, &e).await?;
        return Err(e);
    }

    if let Err(e) = stages::run_ocr(ctx, &title, name).await {
        record_failure(ctx, &mut state, Step::Ocr, &e).await?;
        return Err(e);
    }
    state.complete(Step::Ocr);
    ctx.state.save(&state).await?;

    let text = match stages::collect_ocr_text(ctx, &title).await {
        Ok(text) => text,
        Err(e) => {
            record_failure(ctx, &mut state, Step::ExtractText, &e).await?;
            return Err(e);
        }
    };

    if let Some(bus) = &ctx.bus {
        let message = PipelineMessage {
            text: text.clone(),
            doc_title: title.to_string(),
        };
        bus.publish(&ctx.config.pubsub.topic, &message).await?;
    }
    ctx.objects
        .write_text(&layout::raw_text(&title), &text)
        .await?;
    state.complete(Step::ExtractText);
    ctx.state.save(&state).await?;

    tracing::info!(doc_title = %title, chars = text.len(), "scan processed");
    Ok(Some(title))
}

/// Handle one bus message carrying extracted text. `data` is the base64
/// payload from the envelope.
pub async fn handle_translation_message(ctx: &PipelineContext, data: &str) -> Result<DocTitle> {
    let message = PipelineMessage::decode(data)?;
    let title = DocTitle::new(message.doc_title.as_str())?;
    let hash = source_hash(ctx, &title).await?;
    let mut state = load_state(ctx, &title, &hash).await?;
    let engines = &ctx.config.engines;

    let english = match ctx
        .translator
        .translate_text(&message.text, &engines.source_language, &engines.target_language)
        .await
    {
        Ok(english) => english,
        Err(e) => {
            record_failure(ctx, &mut state, Step::Translate, &e).await?;
            return Err(e);
        }
    };
    ctx.objects
        .write_text(&layout::english_text(&title), &english)
        .await?;
    state.complete(Step::Translate);

    let curated = clean_text(&english, &ctx.stop_words);
    ctx.objects
        .write_text(&layout::curated_text(&title), &curated)
        .await?;
    state.complete(Step::Curate);
    ctx.state.save(&state).await?;

    if let Some(redactor) = &ctx.redactor {
        let redacted = match redactor.deidentify(&curated).await {
            Ok(redacted) => redacted,
            Err(e) => {
                record_failure(ctx, &mut state, Step::Redact, &e).await?;
                return Err(e);
            }
        };
        ctx.objects
            .write_text(&layout::redacted_text(&title), &redacted)
            .await?;
        state.complete(Step::Redact);
        ctx.state.save(&state).await?;
    }

    tracing::info!(doc_title = %title, "translation message processed");
    Ok(title)
}
