//! Pipeline stages for document normalisation.
//!
//! Each submodule implements one transformation step and is testable on its
//! own. The orchestrator in [`crate::convert`] strings them together.
//!
//! ## Data Flow
//!
//! ```text
//!            ┌──▶ leaf ─────────────────────────────────┐
//! detect ────┤                                          ├──▶ postprocess
//! (magic/ext)├──▶ pdf ──▶ text layer ───────────────────┤     (cleanup,
//!            │      └───▶ page images ──▶ OCR engine ───┤      assembly)
//!            └──▶ image ───────────────────▲────────────┘
//! ```
//!
//! 1. [`detect`]: classify a file from its header bytes, falling back to
//!    the extension
//! 2. [`leaf`]:   pure converters for Markdown, text, DOCX and PPTX
//! 3. [`pdf`]:    pdfium-backed page source; runs on a dedicated blocking
//!    worker because pdfium is not async-safe, and renders pages lazily
//! 4. [`image`]:  decoded page rasters shared with the recognition engine
//! 5. [`postprocess`]: deterministic cleanup rules and `## Page N` assembly

pub mod detect;
pub mod image;
pub mod leaf;
pub mod pdf;
pub mod postprocess;
