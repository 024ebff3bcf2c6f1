//! # docnorm
//!
//! Normalise heterogeneous documents (Markdown, plain text, Word, PowerPoint,
//! PDFs with or without a text layer, page images) into one Markdown-flavoured
//! text representation.
//!
//! ## Why this crate?
//!
//! Downstream consumers want text, not formats. Most inputs already carry
//! text and only need decoding; scanned documents need optical recognition,
//! which is slow, needs model files on disk, and may crash on hosts whose CPU
//! or accelerator does not support the optimized code path. This crate keeps
//! the fast paths fast and makes the slow path survivable:
//!
//! - identical bytes are converted once (content-addressed cache)
//! - PDFs with a real text layer never touch OCR
//! - one bad page never costs the whole document
//! - the first engine incompatibility downgrades to a compatible mode and
//!   retries instead of failing
//!
//! ## Pipeline Overview
//!
//! ```text
//! file
//!  │
//!  ├─ 1. Digest   SHA-256 of the bytes → cache lookup
//!  ├─ 2. Detect   magic bytes first, extension second
//!  ├─ 3. Leaf     md / txt / docx / pptx → text (pure, parallel)
//!  ├─ 4. PDF      text layer if usable, else lazily rendered pages
//!  ├─ 5. OCR      singleton engine: probe → models → build → recognise
//!  ├─ 6. Polish   page-marker removal, whitespace, `## Page N` assembly
//!  └─ 7. Cache    store under the same digest
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docnorm::{ConversionRequest, Converter, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Defaults overlaid with DOCNORM_* environment variables
//!     let converter = Converter::new(PipelineConfig::from_env()?)?;
//!     let result = converter
//!         .convert(ConversionRequest::new("report.docx"))
//!         .await?;
//!     println!("{}", result.content);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docnorm` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! docnorm = { version = "0.1", default-features = false }
//! ```
//!
//! ## Runtime requirements
//!
//! | Path | Needs |
//! |------|-------|
//! | PDF  | pdfium shared library (`PDFIUM_LIB_PATH` or system install) |
//! | OCR  | `tesseract` 4+ on `PATH` (or `DOCNORM_TESSERACT`); models are downloaded on first use |
//! | Cloud OCR | `OcrMode::Cloud` and a MinerU API key; no local engine or models |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod config;
pub mod convert;
pub mod error;
pub mod ocr;
pub mod output;
pub mod pipeline;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{CacheStats, ContentDigest, ConversionCache};
pub use config::{
    CloudSettings, DevicePreference, ModelSource, ModelTier, OcrMode, PageSeparator,
    PipelineConfig, PipelineConfigBuilder, TextLayerPolicy,
};
pub use convert::{Converter, ConverterBuilder, CorrectionHook};
pub use error::{
    CloudError, ConversionError, ErrorKind, PageFailure, PageFailureKind, Stage,
};
pub use output::{CancelToken, ConversionRequest, ConversionResult};
pub use pipeline::detect::FormatTag;
pub use ocr::cloud::{DocumentRecognizer, MineruClient};
pub use progress::{CloudPhase, ProgressListener, ProgressMarker, ProgressSink};
