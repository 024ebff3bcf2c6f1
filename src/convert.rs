//! Conversion orchestration: the single entry point callers use.
//!
//! ## Flow
//!
//! ```text
//! digest ─▶ cache? ──hit──▶ return (cache-hit)
//!   │
//!   ▼
//! detect ─▶ md / txt / docx / pptx ─▶ leaf converter ───────────────┐
//!   │                                                                │
//!   ├────▶ pdf ─▶ usable text layer? ─yes─▶ clean + assemble ────────┤
//!   │                   │ no                                         ├─▶ cache ─▶ result
//!   │                   ▼                                            │
//!   └────▶ image ─▶ page images ─▶ engine lease ─▶ clean + assemble ─┘
//! ```
//!
//! In cloud mode PDFs and images skip both the text layer and the local
//! engine: the whole file goes to the configured [`DocumentRecognizer`].
//!
//! Leaf and text-layer paths never touch the recognition engine, so they run
//! fully in parallel across requests. The OCR path takes the engine lease one
//! page at a time; concurrent OCR conversions interleave at page granularity.

use crate::cache::{ContentDigest, ConversionCache};
use crate::config::{OcrMode, PipelineConfig};
use crate::error::{
    CloudError, ConfigError, ConversionError, EngineError, ErrorKind, PageFailure, PageFailureKind, PdfError,
    Stage,
};
use crate::ocr::cloud::{DocumentRecognizer, MineruClient};
use crate::ocr::device::{Clock, DeviceProbe, HardwareProbe, SystemClock, SystemProbe};
use crate::ocr::engine::{EngineFactory, EngineSettings, RecognitionEngineManager};
use crate::ocr::models::{ArtifactFetcher, HttpFetcher, ModelRepository};
use crate::ocr::tesseract::TesseractFactory;
use crate::output::{ConversionRequest, ConversionResult};
use crate::pipeline::detect::{self, FormatTag};
use crate::pipeline::image::{self, PageImage};
use crate::pipeline::leaf;
use crate::pipeline::pdf::{PdfBackend, PdfPageSource, PdfiumBackend, RenderSettings};
use crate::pipeline::postprocess;
use crate::progress::{CloudPhase, ProgressMarker, Reporter};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Post-OCR text correction applied to the assembled document.
pub type CorrectionHook = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Document converter. Cheap to share behind an `Arc`; every method takes
/// `&self`.
///
/// # Example
/// ```rust,no_run
/// use docnorm::{ConversionRequest, Converter, PipelineConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let converter = Converter::new(PipelineConfig::from_env()?)?;
///     let result = converter.convert(ConversionRequest::new("scan.pdf")).await?;
///     println!("{}", result.content);
///     for failure in &result.failures {
///         eprintln!("warning: {failure}");
///     }
///     Ok(())
/// }
/// ```
pub struct Converter {
    config: PipelineConfig,
    cache: Option<ConversionCache>,
    pdf: PdfPageSource,
    probe: Arc<DeviceProbe>,
    models: Arc<ModelRepository>,
    engine: Arc<RecognitionEngineManager>,
    cloud: Option<Arc<dyn DocumentRecognizer>>,
    correction: Option<CorrectionHook>,
}

/// Assembles a [`Converter`], with optional replacements for every external
/// collaborator.
pub struct ConverterBuilder {
    config: PipelineConfig,
    pdf_backend: Option<Arc<dyn PdfBackend>>,
    engine_factory: Option<Arc<dyn EngineFactory>>,
    hardware_probe: Option<Arc<dyn HardwareProbe>>,
    fetcher: Option<Arc<dyn ArtifactFetcher>>,
    clock: Option<Arc<dyn Clock>>,
    recognizer: Option<Arc<dyn DocumentRecognizer>>,
    correction: Option<CorrectionHook>,
}

impl ConverterBuilder {
    pub fn with_pdf_backend(mut self, backend: Arc<dyn PdfBackend>) -> Self {
        self.pdf_backend = Some(backend);
        self
    }

    pub fn with_engine_factory(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.engine_factory = Some(factory);
        self
    }

    pub fn with_hardware_probe(mut self, probe: Arc<dyn HardwareProbe>) -> Self {
        self.hardware_probe = Some(probe);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Whole-document recognizer used in [`OcrMode::Cloud`]; defaults to
    /// [`MineruClient`] over the configured cloud settings.
    pub fn with_document_recognizer(mut self, recognizer: Arc<dyn DocumentRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    /// Apply `hook` to OCR output before it is cached and returned.
    pub fn with_correction<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.correction = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<Converter, ConfigError> {
        let config = self.config;

        let fetcher: Arc<dyn ArtifactFetcher> = match self.fetcher {
            Some(f) => f,
            None => Arc::new(
                HttpFetcher::new(config.download_timeout)
                    .map_err(|e| ConfigError(format!("HTTP client: {e}")))?,
            ),
        };
        let models = Arc::new(
            ModelRepository::new(&config.model_root, fetcher)
                .with_tessdata_catalog(config.model_source, &config.languages),
        );

        let probe = Arc::new(DeviceProbe::new(
            self.hardware_probe.unwrap_or_else(|| Arc::new(SystemProbe)),
            self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config.probe_ttl,
            config.probe_timeout,
        ));

        let factory = self
            .engine_factory
            .unwrap_or_else(|| Arc::new(TesseractFactory::new(config.tesseract_binary.clone())));
        let engine = Arc::new(RecognitionEngineManager::new(
            EngineSettings::from_config(&config),
            Arc::clone(&probe),
            Arc::clone(&models),
            factory,
        ));

        let backend = self
            .pdf_backend
            .unwrap_or_else(|| Arc::new(PdfiumBackend::new(config.pdfium_library.clone())));
        let pdf = PdfPageSource::new(
            backend,
            RenderSettings {
                dpi: config.render_dpi,
                max_pixels: config.max_rendered_pixels,
            },
        );

        let cloud = match (self.recognizer, config.ocr_mode) {
            (Some(recognizer), _) => Some(recognizer),
            (None, OcrMode::Cloud) => Some(Arc::new(
                MineruClient::new(config.cloud.clone()).map_err(|e| ConfigError(e.to_string()))?,
            ) as Arc<dyn DocumentRecognizer>),
            (None, OcrMode::Local) => None,
        };

        let cache = config.cache_dir.as_ref().map(ConversionCache::new);

        Ok(Converter {
            config,
            cache,
            pdf,
            probe,
            models,
            engine,
            cloud,
            correction: self.correction,
        })
    }
}

/// Per-page outcomes of a page-oriented conversion.
#[derive(Default)]
struct PageOutcomes {
    texts: Vec<(usize, String)>,
    failures: Vec<PageFailure>,
}

/// Content plus metadata from one conversion path.
struct Produced {
    content: String,
    failures: Vec<PageFailure>,
    page_count: usize,
    ocr: bool,
}

impl Converter {
    pub fn builder(config: PipelineConfig) -> ConverterBuilder {
        ConverterBuilder {
            config,
            pdf_backend: None,
            engine_factory: None,
            hardware_probe: None,
            fetcher: None,
            clock: None,
            recognizer: None,
            correction: None,
        }
    }

    /// Converter with the default pdfium, tesseract and HTTP collaborators.
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&ConversionCache> {
        self.cache.as_ref()
    }

    pub fn engine(&self) -> &RecognitionEngineManager {
        &self.engine
    }

    pub fn models(&self) -> &ModelRepository {
        &self.models
    }

    pub fn device_probe(&self) -> &DeviceProbe {
        &self.probe
    }

    /// Convert one file.
    ///
    /// # Errors
    /// Returns `Err(ConversionError)` only for fatal conditions:
    /// - file missing or unreadable
    /// - unsupported format
    /// - corrupt container / unopenable PDF
    /// - model download or engine construction failure
    /// - every page failed
    /// - cancellation
    ///
    /// Individual page failures are reported in `result.failures`.
    pub async fn convert(
        &self,
        request: ConversionRequest,
    ) -> Result<ConversionResult, ConversionError> {
        let span = info_span!(
            "convert",
            trace_id = %request.trace_id,
            path = %request.path.display()
        );
        self.run(&request).instrument(span).await
    }

    /// Convert many files with at most `concurrency` in flight. Results are
    /// returned in input order.
    pub async fn convert_many(
        &self,
        requests: Vec<ConversionRequest>,
        concurrency: usize,
    ) -> Vec<Result<ConversionResult, ConversionError>> {
        let mut indexed: Vec<(usize, Result<ConversionResult, ConversionError>)> =
            stream::iter(requests.into_iter().enumerate())
                .map(|(i, req)| async move { (i, self.convert(req).await) })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;
        indexed.sort_by_key(|(i, _)| *i);
        indexed.into_iter().map(|(_, r)| r).collect()
    }

    /// Blocking wrapper around [`convert`](Self::convert).
    ///
    /// Creates a new Tokio runtime internally. Do not call from inside an
    /// existing async runtime.
    pub fn convert_sync(
        &self,
        request: ConversionRequest,
    ) -> Result<ConversionResult, ConversionError> {
        let trace_id = request.trace_id.clone();
        tokio::runtime::Runtime::new()
            .map_err(|e| {
                ConversionError::new(
                    ErrorKind::Internal(format!("failed to create tokio runtime: {e}")),
                    Stage::Digest,
                    trace_id,
                )
            })?
            .block_on(self.convert(request))
    }

    async fn run(&self, request: &ConversionRequest) -> Result<ConversionResult, ConversionError> {
        let start = Instant::now();
        let trace_id = request.trace_id.as_str();
        let path = request.path.as_path();
        let reporter = Reporter::new(request.progress.as_ref(), trace_id);
        let fail = |kind: ErrorKind, stage: Stage| ConversionError::new(kind, stage, trace_id);

        // ── Step 1: Digest and cache lookup ──────────────────────────────
        let digest = digest_file(path).await.map_err(|k| fail(k, Stage::Digest))?;
        if let Some(cache) = &self.cache {
            let (cache, key) = (cache.clone(), digest.clone());
            let hit = match tokio::task::spawn_blocking(move || cache.lookup(&key)).await {
                Ok(hit) => hit,
                Err(e) => {
                    warn!(error = %e, "cache lookup task failed; treating as a miss");
                    None
                }
            };
            if let Some(mut result) = hit {
                info!(digest = %digest, "cache hit");
                reporter.emit(ProgressMarker::CacheHit);
                result.trace_id = trace_id.to_string();
                result.source_path = request.path.clone();
                result.from_cache = true;
                return Ok(result);
            }
            debug!(digest = %digest, "cache miss");
        }

        // ── Step 2: Detect format ────────────────────────────────────────
        let format = detect_format(path).await.map_err(|k| fail(k, Stage::Detect))?;
        if format == FormatTag::Unsupported {
            return Err(fail(
                ErrorKind::UnsupportedFormat {
                    path: request.path.clone(),
                },
                Stage::Detect,
            ));
        }
        info!(%format, "format detected");
        reporter.emit(ProgressMarker::Detected(format));

        // ── Step 3–5: Produce content ────────────────────────────────────
        let produced = match format {
            FormatTag::Pdf | FormatTag::Image if self.config.ocr_mode == OcrMode::Cloud => {
                self.convert_cloud(request, format, &reporter).await?
            }
            FormatTag::Pdf => self.convert_pdf(request, &reporter).await?,
            FormatTag::Image => self.convert_image(request, &reporter).await?,
            _ => self.convert_leaf(path, format).await.map_err(|k| fail(k, Stage::Convert))?,
        };

        // ── Step 6: Assemble result ──────────────────────────────────────
        let mut content = produced.content;
        if produced.ocr {
            if let Some(hook) = &self.correction {
                content = postprocess::finish(&hook(&content));
            }
        }
        let result = ConversionResult {
            content,
            format,
            source_path: request.path.clone(),
            trace_id: trace_id.to_string(),
            failures: produced.failures,
            page_count: produced.page_count,
            ocr: produced.ocr,
            from_cache: false,
        };

        // ── Step 7: Cache ────────────────────────────────────────────────
        if let Some(cache) = &self.cache {
            match digest_file(path).await {
                Ok(after) if after == digest => {
                    let (cache, stored) = (cache.clone(), result.clone());
                    if let Err(e) =
                        tokio::task::spawn_blocking(move || cache.store(&digest, &stored)).await
                    {
                        warn!(error = %e, "cache store task failed; result not cached");
                    }
                }
                Ok(_) => warn!("source changed during conversion; result not cached"),
                Err(e) => warn!(error = %e, "source unreadable after conversion; result not cached"),
            }
        }

        info!(
            format = %result.format,
            pages = result.page_count,
            failed = result.failures.len(),
            ocr = result.ocr,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "conversion complete"
        );
        reporter.emit(ProgressMarker::Done);
        Ok(result)
    }

    async fn convert_leaf(&self, path: &Path, format: FormatTag) -> Result<Produced, ErrorKind> {
        let bytes = tokio::fs::read(path).await.map_err(|e| io_kind(path, e))?;
        let content = tokio::task::spawn_blocking(move || leaf::convert(format, &bytes))
            .await
            .map_err(|e| ErrorKind::Internal(format!("leaf converter panicked: {e}")))?
            .ok_or_else(|| ErrorKind::Internal(format!("no leaf converter for {format}")))??;
        Ok(Produced {
            content,
            failures: Vec::new(),
            page_count: 1,
            ocr: false,
        })
    }

    async fn convert_pdf(
        &self,
        request: &ConversionRequest,
        reporter: &Reporter<'_>,
    ) -> Result<Produced, ConversionError> {
        let trace_id = request.trace_id.as_str();
        let handle = self
            .pdf
            .open(&request.path)
            .await
            .map_err(|e| ConversionError::new(ErrorKind::PdfOpen(e), Stage::Convert, trace_id))?;
        let page_count = handle.page_count();
        info!(pages = page_count, "document opened");

        match handle.usable_text_layer(&self.config.text_layer).await {
            Ok(Some(layer)) => {
                reporter.emit(ProgressMarker::TextLayer);
                handle.close().await;
                let pages: Vec<(usize, String)> = layer
                    .pages
                    .iter()
                    .enumerate()
                    .map(|(i, text)| (i + 1, postprocess::clean_page_text(text)))
                    .collect();
                info!("using embedded text layer");
                return Ok(Produced {
                    content: postprocess::assemble_pages(&pages, &self.config.page_separator),
                    failures: Vec::new(),
                    page_count,
                    ocr: false,
                });
            }
            Ok(None) => debug!("no usable text layer; recognising pages"),
            Err(e) => warn!(error = %e, "text layer extraction failed; recognising pages"),
        }

        let mut pages = handle.pages();
        let mut outcomes = PageOutcomes::default();
        let mut current = 0;
        loop {
            if request.cancel.is_cancelled() {
                pages.close().await;
                return Err(ConversionError::new(ErrorKind::Cancelled, Stage::Recognition, trace_id));
            }
            let Some(rendered) = pages.next().await else {
                break;
            };
            current += 1;
            if let Err(e) = self
                .recognize_page(current, page_count, rendered, reporter, &mut outcomes)
                .await
            {
                pages.close().await;
                return Err(ConversionError::new(e, Stage::EngineAcquire, trace_id));
            }
        }
        pages.close().await;

        self.finish_ocr(outcomes, page_count, trace_id)
    }

    async fn convert_image(
        &self,
        request: &ConversionRequest,
        reporter: &Reporter<'_>,
    ) -> Result<Produced, ConversionError> {
        let trace_id = request.trace_id.as_str();
        if request.cancel.is_cancelled() {
            return Err(ConversionError::new(ErrorKind::Cancelled, Stage::Recognition, trace_id));
        }
        let path = request.path.clone();
        let decoded = tokio::task::spawn_blocking(move || image::load_image(&path))
            .await
            .unwrap_or_else(|e| {
                Err(PdfError::Page {
                    page: 1,
                    detail: format!("decoder panicked: {e}"),
                })
            });

        let mut outcomes = PageOutcomes::default();
        self.recognize_page(1, 1, decoded, reporter, &mut outcomes)
            .await
            .map_err(|e| ConversionError::new(e, Stage::EngineAcquire, trace_id))?;
        self.finish_ocr(outcomes, 1, trace_id)
    }

    /// Send the whole file to the hosted recognizer.
    async fn convert_cloud(
        &self,
        request: &ConversionRequest,
        format: FormatTag,
        reporter: &Reporter<'_>,
    ) -> Result<Produced, ConversionError> {
        let trace_id = request.trace_id.as_str();
        let fail = |kind: ErrorKind, stage: Stage| ConversionError::new(kind, stage, trace_id);
        if request.cancel.is_cancelled() {
            return Err(fail(ErrorKind::Cancelled, Stage::Recognition));
        }
        let Some(recognizer) = &self.cloud else {
            return Err(fail(
                ErrorKind::Internal("cloud mode without a document recognizer".into()),
                Stage::EngineAcquire,
            ));
        };

        let page_count = if format == FormatTag::Pdf {
            let handle = self
                .pdf
                .open(&request.path)
                .await
                .map_err(|e| fail(ErrorKind::PdfOpen(e), Stage::Convert))?;
            let pages = handle.page_count();
            handle.close().await;
            let limit = self.config.cloud.max_pdf_pages;
            if pages > limit {
                return Err(fail(
                    CloudError::Config(format!("PDF has {pages} pages; the limit is {limit}")).into(),
                    Stage::Convert,
                ));
            }
            pages
        } else {
            1
        };

        info!(pages = page_count, provider = %self.config.cloud.provider, "sending document to cloud OCR");
        let on_phase = |phase: CloudPhase| reporter.emit(ProgressMarker::Cloud(phase));
        let markdown = recognizer
            .recognize(&request.path, &on_phase)
            .await
            .map_err(|e| fail(e.into(), Stage::Recognition))?;
        let content = postprocess::finish(&postprocess::clean_page_text(&markdown));
        if content.trim().is_empty() {
            return Err(fail(
                CloudError::Protocol {
                    context: "clean markdown result",
                    detail: "no text left after cleanup".into(),
                }
                .into(),
                Stage::Recognition,
            ));
        }
        Ok(Produced {
            content,
            failures: Vec::new(),
            page_count,
            ocr: true,
        })
    }

    /// Recognise one page into `outcomes`. Only engine acquisition failures
    /// are returned; everything page-specific is recorded as a failure.
    async fn recognize_page(
        &self,
        current: usize,
        total: usize,
        rendered: Result<PageImage, PdfError>,
        reporter: &Reporter<'_>,
        outcomes: &mut PageOutcomes,
    ) -> Result<(), ErrorKind> {
        reporter.emit(ProgressMarker::Page { current, total });
        let page = match rendered {
            Ok(page) => page,
            Err(e) => {
                warn!(page = current, error = %e, "page could not be rendered");
                outcomes.failures.push(PageFailure {
                    page: current,
                    kind: PageFailureKind::Render,
                    detail: e.to_string(),
                });
                return Ok(());
            }
        };

        let on_download =
            |id: &str| reporter.emit(ProgressMarker::DownloadingModel(id.to_string()));
        let mut lease = self.engine.acquire(&on_download).await.map_err(engine_kind)?;
        match lease.recognize(&page).await {
            Ok(text) => {
                let text = postprocess::clean_page_text(&text);
                if text.is_empty() {
                    warn!(page = current, "page recognised with no text");
                }
                outcomes.texts.push((current, text));
            }
            Err(failure) => {
                warn!(page = current, kind = ?failure.kind, detail = %failure.detail, "page recognition failed");
                outcomes.failures.push(failure);
            }
        }
        Ok(())
    }

    fn finish_ocr(
        &self,
        outcomes: PageOutcomes,
        page_count: usize,
        trace_id: &str,
    ) -> Result<Produced, ConversionError> {
        if outcomes.texts.is_empty() {
            return Err(ConversionError::new(
                ErrorKind::AllPagesFailed {
                    failures: outcomes.failures,
                },
                Stage::Recognition,
                trace_id,
            ));
        }
        Ok(Produced {
            content: postprocess::assemble_pages(&outcomes.texts, &self.config.page_separator),
            failures: outcomes.failures,
            page_count,
            ocr: true,
        })
    }
}

async fn digest_file(path: &Path) -> Result<ContentDigest, ErrorKind> {
    let owned = path.to_path_buf();
    match tokio::task::spawn_blocking(move || ContentDigest::of_file(&owned)).await {
        Ok(Ok(digest)) => Ok(digest),
        Ok(Err(e)) => Err(io_kind(path, e)),
        Err(e) => Err(ErrorKind::Internal(format!("digest task failed: {e}"))),
    }
}

async fn detect_format(path: &Path) -> Result<FormatTag, ErrorKind> {
    let owned = path.to_path_buf();
    match tokio::task::spawn_blocking(move || detect::detect(&owned)).await {
        Ok(Ok(tag)) => Ok(tag),
        Ok(Err(e)) => Err(io_kind(path, e)),
        Err(e) => Err(ErrorKind::Internal(format!("detect task failed: {e}"))),
    }
}

fn io_kind(path: &Path, e: std::io::Error) -> ErrorKind {
    let path: PathBuf = path.to_path_buf();
    match e.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::FileNotFound { path },
        std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied { path },
        _ => ErrorKind::Io { path, source: e },
    }
}

fn engine_kind(e: EngineError) -> ErrorKind {
    match e {
        EngineError::Models(source) => ErrorKind::ModelDownload {
            retryable: source.is_retryable(),
            source,
        },
        other => ErrorKind::EngineUnavailable(other.to_string()),
    }
}
