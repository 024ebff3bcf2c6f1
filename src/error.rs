//! Error types for the docnorm library.
//!
//! Two tiers reflect two failure modes:
//!
//! * [`ConversionError`]: **Fatal**: the conversion cannot produce a result
//!   (missing file, unsupported format, every page failed). It always carries
//!   the [`Stage`] that failed and the caller's trace id so the UI layer can
//!   render a specific message and correlate it with other logs.
//!
//! * [`PageFailure`]: **Non-fatal**: one page could not be rendered or
//!   recognised. Stored in [`crate::output::ConversionResult::failures`] so a
//!   single bad scan never costs the whole document.
//!
//! Component-level errors ([`DownloadError`], [`EngineError`], [`PdfError`],
//! [`LeafError`], [`CloudError`]) are mapped onto an [`ErrorKind`] at the orchestrator
//! boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ── Fatal conversion errors ──────────────────────────────────────────────

/// Pipeline stage at which a conversion failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Digest,
    Detect,
    Convert,
    TextLayer,
    EngineAcquire,
    Recognition,
    Assemble,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Digest => "digest",
            Stage::Detect => "detect",
            Stage::Convert => "convert",
            Stage::TextLayer => "text-layer",
            Stage::EngineAcquire => "engine-acquire",
            Stage::Recognition => "recognition",
            Stage::Assemble => "assemble",
        };
        f.write_str(s)
    }
}

/// What went wrong, independent of where.
#[derive(Debug, Error)]
pub enum ErrorKind {
    // ── Input errors ──────────────────────────────────────────────────────
    #[error("file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    #[error("permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported file type: '{path}'\nSupported: .md .txt .docx .pptx .pdf .png .jpg .jpeg .bmp .tiff .webp")]
    UnsupportedFormat { path: PathBuf },

    // ── Conversion errors ─────────────────────────────────────────────────
    #[error("conversion failed: {0}")]
    ConvertFailed(#[from] LeafError),

    #[error("could not open document: {0}")]
    PdfOpen(#[from] PdfError),

    // ── OCR errors ────────────────────────────────────────────────────────
    #[error("model download failed: {source}")]
    ModelDownload {
        retryable: bool,
        #[source]
        source: DownloadError,
    },

    #[error("recognition engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error(transparent)]
    CloudOcr(#[from] CloudError),

    /// Every page failed; the full per-page detail is attached.
    #[error("all {} pages failed; first error: {}", failures.len(), first_failure(failures))]
    AllPagesFailed { failures: Vec<PageFailure> },

    #[error("conversion cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

fn first_failure(failures: &[PageFailure]) -> String {
    failures
        .first()
        .map(|f| f.to_string())
        .unwrap_or_else(|| "no pages".to_string())
}

impl ErrorKind {
    /// Stable machine-readable code for UI layers and logs.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::FileNotFound { .. } | ErrorKind::PermissionDenied { .. } => {
                "E_FILE_NOT_FOUND"
            }
            ErrorKind::UnsupportedFormat { .. } => "E_FILE_TYPE_UNSUPPORTED",
            ErrorKind::Io { .. } | ErrorKind::ConvertFailed(_) | ErrorKind::PdfOpen(_) => {
                "E_CONVERT_FAILED"
            }
            ErrorKind::EngineUnavailable(_) | ErrorKind::AllPagesFailed { .. } => "E_OCR_FAILED",
            ErrorKind::ModelDownload { .. } => "E_MODEL_DOWNLOAD",
            ErrorKind::CloudOcr(e) if e.is_config() => "E_CONFIG_INVALID",
            ErrorKind::CloudOcr(_) => "E_OCR_FAILED",
            ErrorKind::Cancelled => "E_CANCELLED",
            ErrorKind::Internal(_) => "E_INTERNAL",
        }
    }
}

/// A fatal conversion error: kind, failing stage and trace id.
#[derive(Debug, Error)]
#[error("[{stage}] {kind} (trace {trace_id})")]
pub struct ConversionError {
    #[source]
    pub kind: ErrorKind,
    pub stage: Stage,
    pub trace_id: String,
}

impl ConversionError {
    pub fn new(kind: ErrorKind, stage: Stage, trace_id: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            trace_id: trace_id.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Whether retrying the same request later could succeed.
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            ErrorKind::ModelDownload { retryable, .. } => *retryable,
            ErrorKind::CloudOcr(e) => e.is_retryable(),
            _ => false,
        }
    }
}

// ── Non-fatal page failures ──────────────────────────────────────────────

/// Why a single page produced no text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageFailureKind {
    /// The page could not be rasterised or the image could not be decoded.
    Render,
    /// The engine ran but failed on this page.
    Recognition,
    /// The engine signalled an incompatibility after the downgrade was spent.
    Incompatible,
}

/// A non-fatal failure for one page (1-indexed).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("page {page}: {kind:?}: {detail}")]
pub struct PageFailure {
    pub page: usize,
    pub kind: PageFailureKind,
    pub detail: String,
}

// ── Component errors ─────────────────────────────────────────────────────

/// Leaf format converter failure.
#[derive(Debug, Error)]
pub enum LeafError {
    #[error("malformed {format} container: {detail}")]
    Malformed { format: &'static str, detail: String },

    #[error("could not decode text: {0}")]
    Decode(String),
}

/// Page-oriented document failure.
#[derive(Debug, Error)]
pub enum PdfError {
    #[error("document '{path}' is corrupt or unreadable: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("document '{path}' is encrypted and requires a password")]
    PasswordRequired { path: PathBuf },

    #[error("page {page} failed: {detail}")]
    Page { page: usize, detail: String },

    #[error(
        "failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    Binding(String),

    #[error("document worker exited unexpectedly")]
    WorkerGone,
}

/// Model artifact provisioning failure.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("network error fetching '{url}': {reason}")]
    Network { url: String, reason: String },

    #[error("download of '{url}' timed out after {secs}s")]
    Timeout { url: String, secs: u64 },

    #[error("model '{model}' failed validation after re-download: {detail}")]
    Corrupt { model: String, detail: String },

    #[error("I/O error in model directory '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    /// Network failures are left to the caller's retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::Network { .. } | DownloadError::Timeout { .. })
    }
}

/// Signal raised by a recognition backend for one page.
#[derive(Debug, Clone, Error)]
pub enum RecognitionFault {
    /// The execution mode is not supported by this host (illegal instruction,
    /// missing accelerator kernel, device allocation failure).
    #[error("engine incompatibility: {0}")]
    Incompatible(String),

    /// The page itself could not be recognised.
    #[error("recognition failed: {0}")]
    Failed(String),
}

/// Recognition engine lifecycle failure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Models(#[from] DownloadError),

    #[error("engine construction failed: {0}")]
    Build(String),

    #[error("engine worker panicked: {0}")]
    Panicked(String),
}

/// Cloud document recognition failure.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("cloud OCR is misconfigured: {0}")]
    Config(String),

    #[error("cloud OCR authentication failed (HTTP {status}); check the API key")]
    Auth { status: u16 },

    #[error("cloud OCR request rate limited; retry later")]
    RateLimited,

    #[error("cloud OCR HTTP {status} during {context}: {detail}")]
    Http {
        status: u16,
        context: &'static str,
        detail: String,
    },

    #[error("cloud OCR request failed during {context}: {reason}")]
    Network { context: &'static str, reason: String },

    #[error("cloud OCR returned an invalid response during {context}: {detail}")]
    Protocol { context: &'static str, detail: String },

    #[error("cloud OCR task failed: {0}")]
    TaskFailed(String),

    #[error("cloud OCR result polling timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("cloud OCR result URL rejected: {0}")]
    UnsafeUrl(String),

    #[error("cloud OCR result exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

impl CloudError {
    /// Failures the user fixes in settings rather than by retrying.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            CloudError::Config(_) | CloudError::Auth { .. } | CloudError::UnsafeUrl(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CloudError::Network { .. } | CloudError::RateLimited | CloudError::Timeout { .. }
        )
    }
}

/// Builder validation failure.
#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_error_display_carries_stage_and_trace() {
        let e = ConversionError::new(
            ErrorKind::UnsupportedFormat {
                path: "a.xyz".into(),
            },
            Stage::Detect,
            "trace-42",
        );
        let msg = e.to_string();
        assert!(msg.contains("[detect]"), "got: {msg}");
        assert!(msg.contains("trace-42"), "got: {msg}");
        assert_eq!(e.code(), "E_FILE_TYPE_UNSUPPORTED");
    }

    #[test]
    fn all_pages_failed_reports_first_failure() {
        let kind = ErrorKind::AllPagesFailed {
            failures: vec![
                PageFailure {
                    page: 1,
                    kind: PageFailureKind::Render,
                    detail: "bad raster".into(),
                },
                PageFailure {
                    page: 2,
                    kind: PageFailureKind::Recognition,
                    detail: "empty".into(),
                },
            ],
        };
        let msg = kind.to_string();
        assert!(msg.contains("all 2 pages"), "got: {msg}");
        assert!(msg.contains("bad raster"), "got: {msg}");
        assert_eq!(kind.code(), "E_OCR_FAILED");
    }

    #[test]
    fn only_network_download_errors_are_retryable() {
        let net = DownloadError::Network {
            url: "https://x".into(),
            reason: "reset".into(),
        };
        let corrupt = DownloadError::Corrupt {
            model: "m".into(),
            detail: "size".into(),
        };
        assert!(net.is_retryable());
        assert!(!corrupt.is_retryable());

        let e = ConversionError::new(
            ErrorKind::ModelDownload {
                retryable: net.is_retryable(),
                source: net,
            },
            Stage::EngineAcquire,
            "t",
        );
        assert!(e.is_retryable());
    }

    #[test]
    fn page_failure_roundtrips_through_json() {
        let f = PageFailure {
            page: 3,
            kind: PageFailureKind::Incompatible,
            detail: "sigill".into(),
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"incompatible\""));
        let back: PageFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn cloud_errors_split_between_config_and_ocr_codes() {
        let auth = ErrorKind::CloudOcr(CloudError::Auth { status: 401 });
        assert_eq!(auth.code(), "E_CONFIG_INVALID");
        let failed = ErrorKind::CloudOcr(CloudError::TaskFailed("bad scan".into()));
        assert_eq!(failed.code(), "E_OCR_FAILED");

        let limited = ConversionError::new(
            ErrorKind::CloudOcr(CloudError::RateLimited),
            Stage::Recognition,
            "t",
        );
        assert!(limited.is_retryable());
        assert!(limited.to_string().contains("rate limited"));
    }
}
