//! End-to-end tests against the real pdfium library and tesseract binary.
//!
//! These use documents in `./test_cases/` and download recognition models on
//! first run. They are gated behind the `E2E_ENABLED` environment variable so
//! they do not run in CI unless explicitly requested.
//!
//! Run with:
//!   E2E_ENABLED=1 PDFIUM_LIB_PATH=/path/to/libpdfium.so cargo test --test e2e -- --nocapture
//!
//! Expected fixtures:
//!   test_cases/text_layer.pdf   born-digital PDF with selectable text
//!   test_cases/scanned.pdf      image-only PDF (2+ pages)
//!   test_cases/scan.png         photographed or scanned page

use docnorm::{ConversionRequest, Converter, FormatTag, PipelineConfig, ProgressMarker, ProgressSink};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

// ── Test helpers ─────────────────────────────────────────────────────────────

fn test_cases_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases")
}

/// Skip this test if E2E_ENABLED is not set *or* the fixture is missing.
macro_rules! e2e_skip_unless_ready {
    ($path:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        let p: PathBuf = $path;
        if !p.exists() {
            println!("SKIP: test file not found: {}", p.display());
            return;
        }
        p
    }};
}

/// Converter using the environment's configuration with a private cache.
fn converter(cache: &tempfile::TempDir) -> Converter {
    let config = PipelineConfig::builder()
        .apply_env(|key| std::env::var(key).ok())
        .cache_dir(cache.path())
        .build()
        .expect("valid configuration");
    Converter::new(config).expect("converter")
}

/// Assert the output passes basic normalisation checks.
fn assert_text_quality(text: &str, context: &str) {
    assert!(!text.trim().is_empty(), "[{context}] output is empty");
    assert!(text.ends_with('\n'), "[{context}] output must end with a newline");
    assert!(
        !text.contains("\n\n\n"),
        "[{context}] output has more than one consecutive blank line"
    );
    assert!(!text.contains('\r'), "[{context}] output contains carriage returns");
    for ch in ['\u{200B}', '\u{FEFF}', '\u{00AD}'] {
        assert!(
            !text.contains(ch),
            "[{context}] output contains invisible char U+{:04X}",
            ch as u32
        );
    }
    for line in text.lines() {
        assert!(
            !docnorm::pipeline::postprocess::is_page_marker(line),
            "[{context}] page marker survived: {line:?}"
        );
    }
}

fn recorder() -> (ProgressSink, Arc<Mutex<Vec<ProgressMarker>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);
    let sink: ProgressSink = Arc::new(move |m: &ProgressMarker| {
        sink_seen.lock().unwrap().push(m.clone());
    });
    (sink, seen)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_text_layer_pdf() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("text_layer.pdf"));
    let cache = tempfile::tempdir().unwrap();
    let converter = converter(&cache);

    let (sink, seen) = recorder();
    let result = converter
        .convert(ConversionRequest::new(&path).with_progress(sink))
        .await
        .expect("conversion");

    println!("{} pages, {} chars", result.page_count, result.content.len());
    assert_eq!(result.format, FormatTag::Pdf);
    assert!(!result.ocr, "text layer should have been used");
    assert!(result.content.starts_with("## Page 1"));
    assert_text_quality(&result.content, "text_layer.pdf");
    assert!(seen.lock().unwrap().contains(&ProgressMarker::TextLayer));
    assert_eq!(converter.engine().acquire_count(), 0);
}

#[tokio::test]
async fn test_scanned_pdf() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("scanned.pdf"));
    let cache = tempfile::tempdir().unwrap();
    let converter = converter(&cache);

    let (sink, seen) = recorder();
    let result = converter
        .convert(ConversionRequest::new(&path).with_progress(sink))
        .await
        .expect("conversion");

    println!("--- scanned.pdf ---\n{}", result.content);
    for failure in &result.failures {
        println!("page failure: {failure}");
    }
    assert!(result.ocr);
    assert!(result.page_count >= 2);
    assert_text_quality(&result.content, "scanned.pdf");

    let pages = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|m| matches!(m, ProgressMarker::Page { .. }))
        .count();
    assert_eq!(pages, result.page_count);
}

#[tokio::test]
async fn test_image_then_cache_hit() {
    let path = e2e_skip_unless_ready!(test_cases_dir().join("scan.png"));
    let cache = tempfile::tempdir().unwrap();
    let converter = converter(&cache);

    let first = converter
        .convert(ConversionRequest::new(&path))
        .await
        .expect("conversion");
    assert_eq!(first.format, FormatTag::Image);
    assert!(first.ocr);
    assert_text_quality(&first.content, "scan.png");

    let acquired = converter.engine().acquire_count();
    let second = converter
        .convert(ConversionRequest::new(&path))
        .await
        .expect("cached conversion");
    assert!(second.from_cache);
    assert_eq!(second.content, first.content);
    assert_eq!(converter.engine().acquire_count(), acquired);
}

#[tokio::test]
async fn test_models_and_probe() {
    if std::env::var("E2E_ENABLED").is_err() {
        println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
        return;
    }
    let cache = tempfile::tempdir().unwrap();
    let converter = converter(&cache);

    let available = converter.device_probe().is_available(true).await;
    println!("accelerator available: {available}");
    // A second non-forced call within the TTL must not re-probe.
    converter.device_probe().is_available(false).await;
    assert_eq!(converter.device_probe().probe_count(), 1);

    let id = converter.config().model_id();
    let set = converter
        .models()
        .ensure_ready(&id, &|id: &str| println!("downloading {id}"))
        .await
        .expect("model provisioned");
    assert!(set.files.iter().all(|f| f.exists()));
    assert!(converter.models().status(&id).unwrap().ready);
}
