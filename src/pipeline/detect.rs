//! Format detection: classify a file by content signature, then extension.
//!
//! ## Why signature first?
//!
//! Files arrive mislabeled all the time: a scanner saves `scan.pdf` as a
//! JPEG, a mail client strips `.docx` to `.bin`. Reading a bounded header
//! prefix catches these before the wrong decoder produces garbage. The
//! extension only decides between formats whose signatures are ambiguous
//! (plain text vs. markdown) or absent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Bytes read from the head of a file for signature checks.
pub const HEADER_PREFIX_LEN: usize = 8192;

/// Detected source format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatTag {
    Markdown,
    Text,
    Docx,
    Pptx,
    Pdf,
    Image,
    Unsupported,
}

impl FormatTag {
    /// Formats already carrying text, handled by a leaf converter.
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            FormatTag::Markdown | FormatTag::Text | FormatTag::Docx | FormatTag::Pptx
        )
    }

    fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "md" | "markdown" => FormatTag::Markdown,
            "txt" => FormatTag::Text,
            "docx" => FormatTag::Docx,
            "pptx" => FormatTag::Pptx,
            "pdf" => FormatTag::Pdf,
            "png" | "jpg" | "jpeg" | "bmp" | "tif" | "tiff" | "webp" => FormatTag::Image,
            _ => FormatTag::Unsupported,
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FormatTag::Markdown => "markdown",
            FormatTag::Text => "text",
            FormatTag::Docx => "docx",
            FormatTag::Pptx => "pptx",
            FormatTag::Pdf => "pdf",
            FormatTag::Image => "image",
            FormatTag::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

/// Classify `path`.
///
/// Reads at most [`HEADER_PREFIX_LEN`] bytes. An unreadable file yields
/// `Err`; an unrecognised one yields [`FormatTag::Unsupported`].
pub fn detect(path: &Path) -> std::io::Result<FormatTag> {
    let mut file = std::fs::File::open(path)?;
    let mut header = Vec::with_capacity(HEADER_PREFIX_LEN);
    (&mut file)
        .take(HEADER_PREFIX_LEN as u64)
        .read_to_end(&mut header)?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let tag = classify(&header, ext);
    debug!(path = %path.display(), %tag, "detected format");
    Ok(tag)
}

/// Pure classification over a header prefix and an extension.
pub fn classify(header: &[u8], extension: &str) -> FormatTag {
    let by_ext = FormatTag::from_extension(extension);

    if let Some(kind) = infer::get(header) {
        match kind.mime_type() {
            "application/pdf" => return FormatTag::Pdf,
            "image/png" | "image/jpeg" | "image/bmp" | "image/tiff" | "image/webp" => {
                return FormatTag::Image
            }
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                return FormatTag::Docx
            }
            "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
                return FormatTag::Pptx
            }
            // OOXML containers are plain zips; infer only recognises them when
            // the content-types entry is first. Trust a matching extension.
            "application/zip" if matches!(by_ext, FormatTag::Docx | FormatTag::Pptx) => {
                return by_ext
            }
            mime => {
                if !mime.starts_with("text/") {
                    debug!(mime, "signature does not map to a supported format");
                    return FormatTag::Unsupported;
                }
            }
        }
    }

    match by_ext {
        // A .pdf or image extension without the matching signature is not
        // something pdfium or the image decoder can open.
        FormatTag::Pdf | FormatTag::Image => FormatTag::Unsupported,
        FormatTag::Docx | FormatTag::Pptx if !header.starts_with(b"PK\x03\x04") => {
            FormatTag::Unsupported
        }
        FormatTag::Unsupported if looks_textual(header) && extension.is_empty() => {
            FormatTag::Text
        }
        other => other,
    }
}

/// Heuristic for extensionless files: no NULs in the header.
fn looks_textual(header: &[u8]) -> bool {
    !header.is_empty() && !header.contains(&0)
}
