//! Request and result types exchanged with callers.

use crate::error::PageFailure;
use crate::pipeline::detect::FormatTag;
use crate::progress::ProgressSink;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One conversion request. Immutable once submitted.
#[derive(Clone)]
pub struct ConversionRequest {
    pub path: PathBuf,
    /// Opaque id propagated unchanged into the result, errors and log lines.
    pub trace_id: String,
    pub progress: Option<ProgressSink>,
    pub cancel: CancelToken,
}

impl ConversionRequest {
    /// Request with a freshly generated trace id.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            trace_id: new_trace_id(),
            progress: None,
            cancel: CancelToken::default(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }
}

impl fmt::Debug for ConversionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionRequest")
            .field("path", &self.path)
            .field("trace_id", &self.trace_id)
            .field("progress", &self.progress.as_ref().map(|_| "<dyn ProgressListener>"))
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Generate a short random trace id.
pub fn new_trace_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

/// Cooperative cancellation flag, checked between pages.
///
/// Clones share the same flag. Dropping the conversion future is the other
/// way to abandon work; the token exists for callers that keep the future
/// alive (e.g. a UI worker waiting on the result).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The normalized output of one conversion.
///
/// Owned exclusively by the caller; the pipeline keeps no reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    /// Normalized text (markdown-flavoured).
    pub content: String,
    /// Detected source format.
    pub format: FormatTag,
    pub source_path: PathBuf,
    pub trace_id: String,
    /// Pages or sections that failed without aborting the document.
    #[serde(default)]
    pub failures: Vec<PageFailure>,
    /// Number of pages processed (1 for leaf formats).
    #[serde(default)]
    pub page_count: usize,
    /// Whether OCR produced the content.
    #[serde(default)]
    pub ocr: bool,
    /// Whether this result was served from the conversion cache.
    #[serde(default, skip_serializing)]
    pub from_cache: bool,
}

impl ConversionResult {
    /// Some pages failed but the document still produced text.
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}
