//! Progress reporting for a single conversion.
//!
//! Attach a [`ProgressSink`] to a [`crate::ConversionRequest`] to receive
//! stage markers as the pipeline advances: `cache-hit`, `page 2/7`,
//! `downloading model tessdata_fast-eng`, and so on. Markers are opaque,
//! human-readable values; render them directly or match on
//! [`ProgressMarker`] for structured handling.
//!
//! # Why a trait object?
//!
//! The sink usually lives in a different layer (a terminal progress bar, a UI
//! thread, a job table). An `Arc<dyn ProgressListener>` lets the pipeline
//! notify it without knowing how the host application communicates.
//!
//! A sink must not block. If it panics, the pipeline logs the panic and keeps
//! converting; progress delivery is never allowed to fail a conversion.
//!
//! # Example
//!
//! ```rust
//! use docnorm::{ConversionRequest, ProgressMarker, ProgressSink};
//! use std::sync::Arc;
//!
//! let sink: ProgressSink = Arc::new(|m: &ProgressMarker| eprintln!("{m}"));
//! let request = ConversionRequest::new("scan.pdf").with_progress(sink);
//! ```

use crate::pipeline::detect::FormatTag;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// A stage or page marker emitted during conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressMarker {
    /// Result served from the conversion cache; no further markers follow.
    CacheHit,
    /// Source format identified.
    Detected(FormatTag),
    /// The document's embedded text layer is being used instead of OCR.
    TextLayer,
    /// A recognition model is being provisioned.
    DownloadingModel(String),
    /// Page `current` of `total` (1-indexed) is about to be recognised.
    Page { current: usize, total: usize },
    /// A hosted recognition job advanced.
    Cloud(CloudPhase),
    /// Conversion finished.
    Done,
}

/// Steps of a hosted recognition job, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudPhase {
    Submitting,
    Uploading,
    Waiting,
    Finished,
}

impl CloudPhase {
    /// 0-based position out of [`CloudPhase::TOTAL`] steps.
    pub fn step(&self) -> usize {
        match self {
            CloudPhase::Submitting => 0,
            CloudPhase::Uploading => 1,
            CloudPhase::Waiting => 2,
            CloudPhase::Finished => 3,
        }
    }

    pub const TOTAL: usize = 3;
}

impl fmt::Display for CloudPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloudPhase::Submitting => "creating upload task",
            CloudPhase::Uploading => "uploading",
            CloudPhase::Waiting => "waiting for result",
            CloudPhase::Finished => "finished",
        })
    }
}

impl fmt::Display for ProgressMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressMarker::CacheHit => f.write_str("cache-hit"),
            ProgressMarker::Detected(tag) => write!(f, "detected {tag}"),
            ProgressMarker::TextLayer => f.write_str("text-layer"),
            ProgressMarker::DownloadingModel(id) => write!(f, "downloading model {id}"),
            ProgressMarker::Page { current, total } => write!(f, "page {current}/{total}"),
            ProgressMarker::Cloud(phase) => {
                write!(f, "cloud {}/{}: {phase}", phase.step(), CloudPhase::TOTAL)
            }
            ProgressMarker::Done => f.write_str("done"),
        }
    }
}

/// Receives progress markers. Must be `Send + Sync`: conversions for
/// different files may run on different worker threads.
pub trait ProgressListener: Send + Sync {
    fn on_marker(&self, marker: &ProgressMarker);
}

impl<F> ProgressListener for F
where
    F: Fn(&ProgressMarker) + Send + Sync,
{
    fn on_marker(&self, marker: &ProgressMarker) {
        self(marker)
    }
}

/// A listener that ignores every marker.
pub struct NoopProgress;

impl ProgressListener for NoopProgress {
    fn on_marker(&self, _marker: &ProgressMarker) {}
}

/// Shared handle stored in a [`crate::ConversionRequest`].
pub type ProgressSink = Arc<dyn ProgressListener>;

/// Delivers markers to an optional sink, containing any panic it raises.
#[derive(Clone, Copy)]
pub(crate) struct Reporter<'a> {
    sink: Option<&'a ProgressSink>,
    trace_id: &'a str,
}

impl<'a> Reporter<'a> {
    pub(crate) fn new(sink: Option<&'a ProgressSink>, trace_id: &'a str) -> Self {
        Self { sink, trace_id }
    }

    pub(crate) fn emit(&self, marker: ProgressMarker) {
        let Some(sink) = self.sink else {
            return;
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| sink.on_marker(&marker)));
        if outcome.is_err() {
            warn!(
                trace_id = self.trace_id,
                marker = %marker,
                "progress sink panicked; marker dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn markers_render_as_plain_text() {
        assert_eq!(ProgressMarker::CacheHit.to_string(), "cache-hit");
        assert_eq!(
            ProgressMarker::Page {
                current: 2,
                total: 5
            }
            .to_string(),
            "page 2/5"
        );
        assert_eq!(
            ProgressMarker::DownloadingModel("tessdata_fast-eng".into()).to_string(),
            "downloading model tessdata_fast-eng"
        );
        assert_eq!(
            ProgressMarker::Cloud(CloudPhase::Uploading).to_string(),
            "cloud 1/3: uploading"
        );
    }

    #[test]
    fn closure_sink_receives_markers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let sink: ProgressSink = Arc::new(move |m: &ProgressMarker| {
            seen2.lock().unwrap().push(m.to_string());
        });
        let reporter = Reporter::new(Some(&sink), "t");
        reporter.emit(ProgressMarker::TextLayer);
        reporter.emit(ProgressMarker::Done);
        assert_eq!(*seen.lock().unwrap(), vec!["text-layer", "done"]);
    }

    #[test]
    fn panicking_sink_is_contained() {
        let sink: ProgressSink = Arc::new(|_: &ProgressMarker| panic!("ui gone"));
        let reporter = Reporter::new(Some(&sink), "t");
        reporter.emit(ProgressMarker::CacheHit);
        reporter.emit(ProgressMarker::Done);
    }

    #[test]
    fn missing_sink_is_a_noop() {
        Reporter::new(None, "t").emit(ProgressMarker::Done);
        let sink: ProgressSink = Arc::new(NoopProgress);
        Reporter::new(Some(&sink), "t").emit(ProgressMarker::Done);
    }
}
