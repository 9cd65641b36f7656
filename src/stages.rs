//! Pipeline stages.
//!
//! Every stage reads its input blobs and writes a new blob under its own
//! prefix (see [`casefile_core::layout`]); nothing is modified in place.
//! The sinks run only after every upstream blob exists, and read their
//! inputs from the object store right before writing.

use std::time::Instant;

use anyhow::{Context, Result};
use casefile_core::clean::clean_text;
use casefile_core::entities::group_by_category;
use casefile_core::error::StageError;
use casefile_core::layout;
use casefile_core::models::{CategoryMap, DocTitle, Ensured, WarehouseRow};
use casefile_core::ocr::{concatenate_pages, order_shards};
use casefile_core::state::Step;

use crate::config::TranslationMode;
use crate::context::PipelineContext;

/// Remove earlier output under `prefix` so a rerun only sees its own shards.
async fn clear_prefix(ctx: &PipelineContext, title: &DocTitle, prefix: &str) -> Result<()> {
    let removed = ctx
        .objects
        .delete_prefix(prefix)
        .await
        .with_context(|| format!("Failed to clear {}", prefix))?;
    if removed > 0 {
        tracing::info!(doc_title = %title, prefix, removed, "cleared stale output");
    }
    Ok(())
}

/// Start document text detection on `source` and wait for the shards.
pub async fn run_ocr(ctx: &PipelineContext, title: &DocTitle, source: &str) -> Result<()> {
    let prefix = layout::ocr_prefix(title);
    clear_prefix(ctx, title, &prefix).await?;

    let source_uri = ctx.objects.uri(source);
    let dest_uri = ctx.objects.uri(&prefix);
    tracing::debug!(doc_title = %title, source = %source_uri, "ocr started");
    ctx.ocr
        .annotate_pdf(&source_uri, &dest_uri, ctx.config.engines.ocr_batch_size)
        .await
        .with_context(|| format!("OCR of {} failed", source))?;
    Ok(())
}

/// Concatenated page text of every OCR shard for `title`, in page order.
pub async fn collect_ocr_text(ctx: &PipelineContext, title: &DocTitle) -> Result<String> {
    let prefix = layout::ocr_prefix(title);
    let mut names: Vec<String> = ctx
        .objects
        .list(&prefix)
        .await?
        .into_iter()
        .map(|meta| meta.name)
        .filter(|name| name.ends_with(".json"))
        .collect();
    if names.is_empty() {
        return Err(StageError::MissingBlob(format!("{}*", prefix)).into());
    }
    order_shards(&mut names);

    let mut shards = Vec::with_capacity(names.len());
    for name in &names {
        let bytes = ctx
            .objects
            .read(name)
            .await?
            .ok_or_else(|| StageError::MissingBlob(name.clone()))?;
        shards.push(bytes);
    }
    concatenate_pages(shards.iter().map(Vec::as_slice))
        .with_context(|| format!("Failed to extract text for {}", title))
}

/// Write `raw_txt/{title}.txt` from the OCR shards.
pub async fn json_to_text(ctx: &PipelineContext, title: &DocTitle) -> Result<String> {
    let text = collect_ocr_text(ctx, title).await?;
    ctx.objects
        .write_text(&layout::raw_text(title), &text)
        .await?;
    Ok(text)
}

/// Translate the raw text into English. Returns the name of the blob
/// holding the translation.
pub async fn translate_document(ctx: &PipelineContext, title: &DocTitle) -> Result<String> {
    let engines = &ctx.config.engines;
    let raw_name = layout::raw_text(title);
    // batch output wins in locate_english_text, so stale shards must go in both modes
    let batch_prefix = layout::english_batch_prefix(title);
    clear_prefix(ctx, title, &batch_prefix).await?;

    match engines.translation_mode {
        TranslationMode::Sync => {
            let raw = ctx.objects.read_text(&raw_name).await?;
            let english = ctx
                .translator
                .translate_text(&raw, &engines.source_language, &engines.target_language)
                .await
                .with_context(|| format!("Translation of {} failed", title))?;
            let name = layout::english_text(title);
            ctx.objects.write_text(&name, &english).await?;
            Ok(name)
        }
        TranslationMode::Batch => {
            if ctx.objects.read(&raw_name).await?.is_none() {
                return Err(StageError::MissingBlob(raw_name).into());
            }
            ctx.translator
                .batch_translate(
                    &ctx.objects.uri(&raw_name),
                    &ctx.objects.uri(&batch_prefix),
                    &engines.source_language,
                    &engines.target_language,
                )
                .await
                .with_context(|| format!("Batch translation of {} failed", title))?;
            locate_english_text(ctx, title).await
        }
    }
}

/// Name of the English translation of `title`: the batch output shard if
/// one exists, otherwise the synchronous translation.
pub async fn locate_english_text(ctx: &PipelineContext, title: &DocTitle) -> Result<String> {
    let batch = ctx
        .objects
        .list(&layout::english_batch_prefix(title))
        .await?
        .into_iter()
        .map(|meta| meta.name)
        .find(|name| layout::is_batch_translation(name));
    if let Some(name) = batch {
        return Ok(name);
    }

    let single = layout::english_text(title);
    let found = ctx
        .objects
        .list(&single)
        .await?
        .into_iter()
        .any(|meta| meta.name == single);
    if found {
        Ok(single)
    } else {
        Err(StageError::MissingBlob(single).into())
    }
}

/// Clean the English text into `curated_eng_txt/{title}.txt`.
pub async fn curate_document(ctx: &PipelineContext, title: &DocTitle) -> Result<String> {
    let english_name = locate_english_text(ctx, title).await?;
    let english = ctx.objects.read_text(&english_name).await?;
    let curated = clean_text(&english, &ctx.stop_words);
    ctx.objects
        .write_text(&layout::curated_text(title), &curated)
        .await?;
    Ok(curated)
}

/// De-identify the curated text into `redacted_raw_eng_txt/{title}.txt`.
pub async fn redact_document(ctx: &PipelineContext, title: &DocTitle) -> Result<String> {
    let redactor = ctx
        .redactor
        .as_ref()
        .ok_or_else(|| StageError::Configuration("redaction is disabled".into()))?;
    let curated = ctx.objects.read_text(&layout::curated_text(title)).await?;
    let redacted = redactor
        .deidentify(&curated)
        .await
        .with_context(|| format!("Redaction of {} failed", title))?;
    ctx.objects
        .write_text(&layout::redacted_text(title), &redacted)
        .await?;
    Ok(redacted)
}

/// Recognise and link entities in the curated text, then group them by
/// category into `entities/{title}.json`.
pub async fn extract_entities(ctx: &PipelineContext, title: &DocTitle) -> Result<CategoryMap> {
    let linker = ctx.linker.as_ref().ok_or_else(|| {
        StageError::Configuration("entity extraction needs a recognition model".into())
    })?;
    let curated = ctx.objects.read_text(&layout::curated_text(title)).await?;
    let spans = linker
        .link(&curated)
        .await
        .with_context(|| format!("Entity linking of {} failed", title))?;
    let grouped = group_by_category(&spans, &ctx.reference, ctx.config.ner.dedup_entities);
    tracing::debug!(
        doc_title = %title,
        model = %linker.model(),
        spans = spans.len(),
        categories = grouped.len(),
        "entities extracted"
    );

    let json = serde_json::to_vec_pretty(&grouped)?;
    ctx.objects
        .write(&layout::entities(title), &json, "application/json")
        .await?;
    Ok(grouped)
}

/// Create the configured dataset and table if needed.
pub async fn ensure_warehouse(ctx: &PipelineContext) -> Result<(Ensured, Ensured)> {
    let wh = &ctx.config.warehouse;
    let dataset = ctx
        .warehouse
        .ensure_dataset(&wh.dataset)
        .await
        .with_context(|| format!("Failed to ensure dataset {}", wh.dataset))?;
    let table = ctx
        .warehouse
        .ensure_table(&wh.dataset, &wh.table)
        .await
        .with_context(|| format!("Failed to ensure table {}.{}", wh.dataset, wh.table))?;
    if dataset.created {
        tracing::info!(dataset = %dataset.id, "created dataset");
    }
    if table.created {
        tracing::info!(table = %table.id, "created table");
    }
    Ok((dataset, table))
}

/// Append one warehouse row for `title`. Every column is read from the
/// object store here; any missing blob fails with `MissingBlob`.
pub async fn insert_document(ctx: &PipelineContext, title: &DocTitle) -> Result<WarehouseRow> {
    let it_raw_txt = ctx.objects.read_text(&layout::raw_text(title)).await?;
    let english_name = locate_english_text(ctx, title).await?;
    let eng_raw_txt = ctx.objects.read_text(&english_name).await?;
    let eng_txt = ctx.objects.read_text(&layout::curated_text(title)).await?;

    let row = WarehouseRow {
        case: title.to_string(),
        it_raw_txt,
        eng_raw_txt,
        eng_txt,
    };
    let wh = &ctx.config.warehouse;
    ctx.warehouse
        .insert_row(&wh.dataset, &wh.table, &row)
        .await
        .with_context(|| format!("Failed to insert {} into {}.{}", title, wh.dataset, wh.table))?;
    Ok(row)
}

/// Upsert the extracted category map into the document store.
pub async fn store_entities(ctx: &PipelineContext, title: &DocTitle) -> Result<CategoryMap> {
    let name = layout::entities(title);
    let bytes = ctx
        .objects
        .read(&name)
        .await?
        .ok_or_else(|| StageError::MissingBlob(name.clone()))?;
    let entities: CategoryMap =
        serde_json::from_slice(&bytes).with_context(|| format!("Malformed entity map {}", name))?;
    ctx.docstore
        .upsert_entities(title.as_str(), &entities)
        .await
        .with_context(|| format!("Failed to store entities for {}", title))?;
    Ok(entities)
}

/// Run one step for one document. `source` is the PDF blob name.
pub async fn execute_step(
    ctx: &PipelineContext,
    step: Step,
    title: &DocTitle,
    source: &str,
) -> Result<()> {
    let started = Instant::now();
    tracing::debug!(doc_title = %title, step = %step, "step started");
    match step {
        Step::Ocr => run_ocr(ctx, title, source).await?,
        Step::ExtractText => {
            json_to_text(ctx, title).await?;
        }
        Step::Translate => {
            translate_document(ctx, title).await?;
        }
        Step::Curate => {
            curate_document(ctx, title).await?;
        }
        Step::Redact => {
            redact_document(ctx, title).await?;
        }
        Step::ExtractEntities => {
            extract_entities(ctx, title).await?;
        }
        Step::StoreWarehouse => {
            insert_document(ctx, title).await?;
        }
        Step::StoreDocstore => {
            store_entities(ctx, title).await?;
        }
    }
    tracing::debug!(
        doc_title = %title,
        step = %step,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "step finished"
    );
    Ok(())
}
