//! Leaf converters for formats that already carry text.
//!
//! Each converter is a pure, blocking `&[u8] → String` function with no
//! shared state, so the orchestrator can run any number of them in parallel
//! on the blocking pool.

pub mod docx;
pub mod markdown;
pub mod pptx;
pub mod text;
mod xml;

use crate::error::LeafError;
use crate::pipeline::detect::FormatTag;

/// Dispatch `bytes` to the converter for `format`.
///
/// Returns `None` for formats that are not leaf-convertible.
pub fn convert(format: FormatTag, bytes: &[u8]) -> Option<Result<String, LeafError>> {
    let out = match format {
        FormatTag::Markdown => markdown::convert(bytes),
        FormatTag::Text => text::convert(bytes),
        FormatTag::Docx => docx::convert(bytes),
        FormatTag::Pptx => pptx::convert(bytes),
        FormatTag::Pdf | FormatTag::Image | FormatTag::Unsupported => return None,
    };
    Some(out)
}
