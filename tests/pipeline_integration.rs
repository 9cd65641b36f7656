//! End-to-end pipeline runs over in-memory stores and fake engines.

mod common;

use std::sync::Arc;

use casefile::config::TranslationMode;
use casefile::pipeline::{run_pipeline, run_step_for_all, RunOptions};
use casefile::progress::NoProgress;
use casefile::{stages, trigger};
use casefile_core::entities::SciModel;
use casefile_core::error::{classify, ErrorKind};
use casefile_core::layout;
use casefile_core::message::PipelineMessage;
use casefile_core::models::{CaseFilter, DocTitle};
use casefile_core::services::{OcrEngine, Redactor};
use casefile_core::state::{SinkSelection, Stage, Step};
use casefile_core::store::{DocumentStore, ObjectStore, StateStore, Warehouse};
use common::{FakeOcr, FakeRedactor, Harness, HarnessOptions};

const WAREHOUSE_ONLY: SinkSelection = SinkSelection {
    warehouse: true,
    docstore: false,
};

const BOTH: SinkSelection = SinkSelection {
    warehouse: true,
    docstore: true,
};

fn title(s: &str) -> DocTitle {
    DocTitle::new(s).unwrap()
}

fn warehouse_run() -> RunOptions {
    RunOptions {
        sinks: WAREHOUSE_ONLY,
        ..RunOptions::default()
    }
}

fn full_run() -> RunOptions {
    RunOptions {
        sinks: BOTH,
        model: Some(SciModel::CoreSciSm),
        ..RunOptions::default()
    }
}

#[tokio::test]
async fn test_batch_run_writes_every_stage_blob() {
    let h = Harness::new(HarnessOptions::default());
    let summary = run_pipeline(&h.ctx, &warehouse_run(), &NoProgress)
        .await
        .unwrap();

    assert_eq!(summary.discovered, 3);
    assert_eq!(summary.processed, 3);
    assert!(summary.failures.is_empty());

    let names = h.objects.names();
    assert!(names.contains(&"json/case1-output-1-to-2.json".to_string()));
    assert!(names.contains(&"json/case1-output-3-to-3.json".to_string()));
    assert!(names.contains(&"raw_txt/case1.txt".to_string()));
    assert!(names.contains(&"eng_txt/case1/casefile_raw_txt_case1_en_translations.txt".to_string()));
    assert!(names.contains(&"curated_eng_txt/case1.txt".to_string()));

    let raw = h.objects.read_text("raw_txt/case1.txt").await.unwrap();
    assert_eq!(raw, "Paziente Rossi visitato il 3/4/2020. Figure 1 lesione. febbre brividi. ");
    let curated = h.objects.read_text("curated_eng_txt/case1.txt").await.unwrap();
    assert_eq!(curated, " Patient Rossi visited lesion fever chills");

    let rows = h.warehouse.rows();
    assert_eq!(rows.len(), 3);
    let row = rows.iter().find(|r| r.case == "case1").unwrap();
    assert_eq!(row.it_raw_txt, raw);
    assert_eq!(row.eng_raw_txt, "Patient Rossi visited on 3/4/2020. Figure 1 lesion. fever chills. ");
    assert_eq!(row.eng_txt, curated);
    assert_eq!(h.warehouse.creations(), 2);
}

#[tokio::test]
async fn test_sync_translation_writes_single_blob() {
    let h = Harness::new(HarnessOptions {
        mode: TranslationMode::Sync,
        ..HarnessOptions::default()
    });
    run_pipeline(&h.ctx, &warehouse_run(), &NoProgress)
        .await
        .unwrap();

    assert!(h.objects.contains("eng_txt/case2.txt"));
    let english = stages::locate_english_text(&h.ctx, &title("case2")).await.unwrap();
    assert_eq!(english, "eng_txt/case2.txt");
    let row = h
        .warehouse
        .find_case("covid19", "cases", "case2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.eng_txt, " fever chills fever");
}

#[tokio::test]
async fn test_second_run_skips_completed_documents() {
    let h = Harness::new(HarnessOptions::default());
    run_pipeline(&h.ctx, &warehouse_run(), &NoProgress)
        .await
        .unwrap();
    let calls = h.translator.calls();

    let again = run_pipeline(&h.ctx, &warehouse_run(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(again.up_to_date, 3);
    assert_eq!(again.processed, 0);
    assert_eq!(h.translator.calls(), calls);
    assert_eq!(h.warehouse.rows().len(), 3);
    assert_eq!(h.warehouse.creations(), 2);

    let state = h.state.load("case1").await.unwrap().unwrap();
    assert_eq!(state.stage(), Stage::Stored);
}

#[tokio::test]
async fn test_replaced_scan_is_reprocessed() {
    let h = Harness::new(HarnessOptions::default());
    run_pipeline(&h.ctx, &warehouse_run(), &NoProgress)
        .await
        .unwrap();

    h.objects.put("pdf/case3.pdf", "%PDF-1.4 second scan");
    let again = run_pipeline(&h.ctx, &warehouse_run(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(again.processed, 1);
    assert_eq!(again.up_to_date, 2);
    let case3_rows = h.warehouse.rows().into_iter().filter(|r| r.case == "case3").count();
    assert_eq!(case3_rows, 2);
}

#[tokio::test]
async fn test_replaced_scan_drops_earlier_ocr_shards() {
    let mut h = Harness::new(HarnessOptions::default());
    run_pipeline(&h.ctx, &warehouse_run(), &NoProgress)
        .await
        .unwrap();
    assert!(h.objects.contains("json/case1-output-3-to-3.json"));

    let mut pages = common::sample_pages();
    pages.insert("pdf/case1.pdf".to_string(), vec!["nuovo".to_string()]);
    h.ctx.ocr = Arc::new(FakeOcr::new(h.objects.clone(), pages)) as Arc<dyn OcrEngine>;
    h.objects.put("pdf/case1.pdf", "%PDF-1.4 one page rescan");
    h.objects.put("eng_txt/case1/index.csv", "stale");

    let again = run_pipeline(&h.ctx, &warehouse_run(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(again.processed, 1);
    assert!(again.failures.is_empty());

    let shards: Vec<String> = h
        .objects
        .names()
        .into_iter()
        .filter(|n| n.starts_with("json/case1-"))
        .collect();
    assert_eq!(shards, vec!["json/case1-output-1-to-1.json"]);
    assert_eq!(h.objects.read_text("raw_txt/case1.txt").await.unwrap(), "nuovo ");

    let translations: Vec<String> = h
        .objects
        .names()
        .into_iter()
        .filter(|n| n.starts_with("eng_txt/case1/"))
        .collect();
    assert_eq!(
        translations,
        vec!["eng_txt/case1/casefile_raw_txt_case1_en_translations.txt"]
    );
    let row = h
        .warehouse
        .rows()
        .into_iter()
        .filter(|r| r.case == "case1")
        .last()
        .unwrap();
    assert_eq!(row.it_raw_txt, "nuovo ");
}

#[tokio::test]
async fn test_scans_sharing_a_title_are_reported_not_processed() {
    let h = Harness::new(HarnessOptions::default());
    h.objects.put("pdf/case1-rev.pdf", "%PDF-1.4 revised scan");

    let first = run_pipeline(&h.ctx, &warehouse_run(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(first.discovered, 3);
    assert_eq!(first.processed, 2);
    assert_eq!(first.failures.len(), 1);
    let failure = &first.failures[0];
    assert_eq!(failure.doc_title, "case1");
    assert_eq!(failure.step, Step::Ocr);
    assert_eq!(failure.kind, ErrorKind::Configuration);
    assert!(failure.message.contains("pdf/case1-rev.pdf"));
    assert!(!h.objects.contains("raw_txt/case1.txt"));

    let second = run_pipeline(&h.ctx, &warehouse_run(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(second.processed, 0);
    assert_eq!(second.up_to_date, 2);
    assert_eq!(second.failures.len(), 1);
    assert_eq!(h.warehouse.rows().len(), 2);

    let err = trigger::handle_pdf_uploaded(&h.ctx, "pdf/case1-rev.pdf")
        .await
        .unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Configuration);
    assert!(h.bus.published().is_empty());
}

#[tokio::test]
async fn test_force_redoes_everything() {
    let h = Harness::new(HarnessOptions::default());
    run_pipeline(&h.ctx, &warehouse_run(), &NoProgress)
        .await
        .unwrap();
    let opts = RunOptions {
        force: true,
        ..warehouse_run()
    };
    let again = run_pipeline(&h.ctx, &opts, &NoProgress).await.unwrap();
    assert_eq!(again.processed, 3);
    assert_eq!(h.warehouse.rows().len(), 6);
}

#[tokio::test]
async fn test_missing_curated_blob_skips_document() {
    let h = Harness::new(HarnessOptions::default());
    run_pipeline(&h.ctx, &RunOptions::default(), &NoProgress)
        .await
        .unwrap();
    assert!(h.objects.remove("curated_eng_txt/case1.txt"));

    let summary = run_pipeline(&h.ctx, &warehouse_run(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(summary.failures.len(), 1);
    let failure = &summary.failures[0];
    assert_eq!(failure.doc_title, "case1");
    assert_eq!(failure.step, Step::StoreWarehouse);
    assert_eq!(failure.kind, ErrorKind::MissingBlob);
    assert!(failure.message.contains("curated_eng_txt/case1.txt"));

    let cases: Vec<String> = h.warehouse.rows().into_iter().map(|r| r.case).collect();
    assert_eq!(cases, vec!["case2", "case3"]);

    let state = h.state.load("case1").await.unwrap().unwrap();
    assert!(state.last_error.unwrap().starts_with("store-warehouse"));
}

#[tokio::test]
async fn test_ocr_timeout_does_not_abort_batch() {
    let mut pages = common::sample_pages();
    pages.remove("pdf/case2.pdf");
    let h = Harness::with_pages(HarnessOptions::default(), pages);
    h.objects.put("pdf/case2.pdf", "%PDF-1.4 unreadable");

    let summary = run_pipeline(&h.ctx, &warehouse_run(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].kind, ErrorKind::StageTimeout);
    assert_eq!(summary.failures[0].step, Step::Ocr);
    assert!(!h.objects.contains("raw_txt/case2.txt"));
}

#[tokio::test]
async fn test_no_ocr_shards_is_missing_blob() {
    let h = Harness::new(HarnessOptions::default());
    let err = stages::json_to_text(&h.ctx, &title("case9")).await.unwrap_err();
    assert_eq!(classify(&err), ErrorKind::MissingBlob);
}

#[tokio::test]
async fn test_docstore_run_and_query() {
    let h = Harness::new(HarnessOptions {
        linker: true,
        ..HarnessOptions::default()
    });
    let summary = run_pipeline(&h.ctx, &full_run(), &NoProgress).await.unwrap();
    assert_eq!(summary.processed, 3);

    let case1 = h.docstore.get("case1").await.unwrap().unwrap();
    assert_eq!(case1.entities["Sign or Symptom"], vec!["fever", "chills"]);
    assert_eq!(case1.entities["Finding"], vec!["lesion"]);
    assert!(!case1.entities.contains_key("Patient"));

    let case2 = h.docstore.get("case2").await.unwrap().unwrap();
    assert_eq!(case2.entities["Sign or Symptom"], vec!["fever", "chills"]);

    let json = h.objects.read_text("entities/case3.json").await.unwrap();
    assert!(json.contains("cough"));

    let mut filter = CaseFilter::new();
    filter.insert("Sign or Symptom".to_string(), vec!["chills".to_string()]);
    let found = h.docstore.query(&filter, 10).await.unwrap();
    assert_eq!(found.len(), 2);
    for record in &found {
        assert!(record.entities["Sign or Symptom"].contains(&"chills".to_string()));
    }
    assert_eq!(h.docstore.query(&filter, 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_docstore_upsert_keeps_one_record() {
    let h = Harness::new(HarnessOptions {
        linker: true,
        ..HarnessOptions::default()
    });
    run_pipeline(&h.ctx, &full_run(), &NoProgress).await.unwrap();
    let opts = RunOptions {
        force: true,
        ..full_run()
    };
    run_pipeline(&h.ctx, &opts, &NoProgress).await.unwrap();
    assert_eq!(h.docstore.len(), 3);
}

#[tokio::test]
async fn test_docstore_without_model_rejected_before_work() {
    let h = Harness::new(HarnessOptions::default());
    let opts = RunOptions {
        sinks: BOTH,
        ..RunOptions::default()
    };
    let err = run_pipeline(&h.ctx, &opts, &NoProgress).await.unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Configuration);
    assert_eq!(h.translator.calls(), 0);
    assert!(!h.objects.contains("raw_txt/case1.txt"));
    assert_eq!(h.warehouse.creations(), 0);
}

#[tokio::test]
async fn test_redaction_round_trip() {
    let h = Harness::new(HarnessOptions {
        redaction: true,
        ..HarnessOptions::default()
    });
    run_pipeline(&h.ctx, &warehouse_run(), &NoProgress)
        .await
        .unwrap();

    let curated = h.objects.read_text("curated_eng_txt/case1.txt").await.unwrap();
    let redacted = h
        .objects
        .read_text("redacted_raw_eng_txt/case1.txt")
        .await
        .unwrap();
    assert!(!redacted.contains("Rossi"));
    assert!(redacted.contains("REDACTED(5):"));
    assert_eq!(FakeRedactor.reidentify(&redacted).await.unwrap(), curated);

    // Deterministic: the same input redacts the same way.
    assert_eq!(FakeRedactor.deidentify(&curated).await.unwrap(), redacted);
}

#[tokio::test]
async fn test_limit_and_only() {
    let h = Harness::new(HarnessOptions::default());
    let opts = RunOptions {
        only: Some("case2".to_string()),
        ..warehouse_run()
    };
    let summary = run_pipeline(&h.ctx, &opts, &NoProgress).await.unwrap();
    assert_eq!(summary.discovered, 1);
    assert_eq!(h.warehouse.rows()[0].case, "case2");

    let opts = RunOptions {
        limit: Some(2),
        ..warehouse_run()
    };
    let summary = run_pipeline(&h.ctx, &opts, &NoProgress).await.unwrap();
    assert_eq!(summary.discovered, 2);
}

#[tokio::test]
async fn test_single_step_mode() {
    let h = Harness::new(HarnessOptions::default());
    let ocr = run_step_for_all(&h.ctx, Step::Ocr, None, &NoProgress)
        .await
        .unwrap();
    assert_eq!(ocr.processed, 3);
    let text = run_step_for_all(&h.ctx, Step::ExtractText, Some("case1"), &NoProgress)
        .await
        .unwrap();
    assert_eq!(text.discovered, 1);
    assert!(h.objects.contains("raw_txt/case1.txt"));
    assert!(!h.objects.contains("raw_txt/case2.txt"));

    let state = h.state.load("case1").await.unwrap().unwrap();
    assert_eq!(state.stage(), Stage::TextExtracted);

    let err = run_step_for_all(&h.ctx, Step::ExtractEntities, None, &NoProgress)
        .await
        .unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Configuration);
}

#[tokio::test]
async fn test_trigger_flow() {
    let h = Harness::new(HarnessOptions {
        redaction: true,
        ..HarnessOptions::default()
    });

    let handled = trigger::handle_pdf_uploaded(&h.ctx, "pdf/case1.pdf")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handled.as_str(), "case1");
    assert!(h.objects.contains(&layout::raw_text(&handled)));

    let published = h.bus.published();
    assert_eq!(published.len(), 1);
    let (topic, message) = &published[0];
    assert_eq!(topic, "case-text");
    assert_eq!(message.doc_title, "case1");
    assert!(message.text.starts_with("Paziente Rossi"));

    let data = message.encode().unwrap();
    let title = trigger::handle_translation_message(&h.ctx, &data)
        .await
        .unwrap();
    assert_eq!(title.as_str(), "case1");
    let english = h.objects.read_text("eng_txt/case1.txt").await.unwrap();
    assert!(english.starts_with("Patient Rossi visited"));
    let curated = h.objects.read_text("curated_eng_txt/case1.txt").await.unwrap();
    let redacted = h
        .objects
        .read_text("redacted_raw_eng_txt/case1.txt")
        .await
        .unwrap();
    assert_eq!(FakeRedactor.reidentify(&redacted).await.unwrap(), curated);

    let state = h.state.load("case1").await.unwrap().unwrap();
    assert_eq!(state.stage(), Stage::Redacted);

    // The batch driver picks up where the triggers stopped.
    let summary = run_pipeline(&h.ctx, &warehouse_run(), &NoProgress)
        .await
        .unwrap();
    assert!(summary.failures.is_empty());
    assert_eq!(h.translator.calls(), 3);
    assert_eq!(h.warehouse.rows().len(), 3);
}

#[tokio::test]
async fn test_trigger_ignores_other_prefixes() {
    let h = Harness::new(HarnessOptions::default());
    let handled = trigger::handle_pdf_uploaded(&h.ctx, "raw_txt/case1.txt")
        .await
        .unwrap();
    assert!(handled.is_none());
    assert!(h.bus.published().is_empty());
}

#[tokio::test]
async fn test_translation_message_rejects_garbage() {
    let h = Harness::new(HarnessOptions::default());
    assert!(trigger::handle_translation_message(&h.ctx, "not base64!")
        .await
        .is_err());
    let bad_title = PipelineMessage {
        text: "febbre".to_string(),
        doc_title: String::new(),
    };
    let err = trigger::handle_translation_message(&h.ctx, &bad_title.encode().unwrap())
        .await
        .unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Configuration);
}
