//! Page-oriented documents: text-layer probing and lazy page rasterisation.
//!
//! ## Why a dedicated worker per document?
//!
//! pdfium is a C++ library with thread-affine state, and its document type
//! borrows the library binding. Rather than smuggle those borrows across
//! `.await` points, each [`PdfPageSource::open`] moves the whole document onto
//! one `spawn_blocking` thread that owns it for its entire life. The async
//! side talks to that thread over a channel:
//!
//! ```text
//! PdfHandle ──Command──▶ worker (binding + document)
//!     ▲                     │
//!     └──── oneshot reply ──┘
//! ```
//!
//! Pages are rendered only when the consumer asks for the next one, so at
//! most one page raster exists at a time. When the handle (or the
//! [`PageSequence`] that consumed it) is dropped, for any reason, the command
//! channel closes, the worker falls out of its loop, and the document and
//! binding are released. There is no code path that keeps the document open
//! without a live handle.

use crate::config::TextLayerPolicy;
use crate::error::PdfError;
use crate::pipeline::image::PageImage;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Rasterisation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSettings {
    pub dpi: u32,
    pub max_pixels: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_pixels: 4000,
        }
    }
}

/// An open document, confined to its worker thread. Page indices are 0-based.
pub trait PageDocument {
    fn page_count(&self) -> usize;
    fn page_text(&mut self, index: usize) -> Result<String, PdfError>;
    fn render_page(&mut self, index: usize, settings: &RenderSettings)
        -> Result<DynamicImage, PdfError>;
}

/// Opens documents with scoped lifetime.
///
/// `with_document` must release everything it opened before returning,
/// whether `visit` returns normally or not.
pub trait PdfBackend: Send + Sync + 'static {
    fn with_document(
        &self,
        path: &Path,
        visit: &mut dyn FnMut(&mut dyn PageDocument),
    ) -> Result<(), PdfError>;
}

// ── pdfium backend ───────────────────────────────────────────────────────

/// [`PdfBackend`] over pdfium-render.
#[derive(Debug, Clone, Default)]
pub struct PdfiumBackend {
    library: Option<PathBuf>,
}

impl PdfiumBackend {
    /// Bind `library` explicitly, or the system pdfium when `None`.
    pub fn new(library: Option<PathBuf>) -> Self {
        Self { library }
    }

    fn bind(&self) -> Result<Pdfium, PdfError> {
        let bindings = match &self.library {
            Some(path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| PdfError::Binding(e.to_string()))?;
        Ok(Pdfium::new(bindings))
    }
}

struct PdfiumDocument<'a> {
    document: PdfDocument<'a>,
}

impl PageDocument for PdfiumDocument<'_> {
    fn page_count(&self) -> usize {
        self.document.pages().len() as usize
    }

    fn page_text(&mut self, index: usize) -> Result<String, PdfError> {
        let page = self.page(index)?;
        let text = page.text().map_err(|e| PdfError::Page {
            page: index + 1,
            detail: format!("{e:?}"),
        })?;
        Ok(text.all())
    }

    fn render_page(
        &mut self,
        index: usize,
        settings: &RenderSettings,
    ) -> Result<DynamicImage, PdfError> {
        let page = self.page(index)?;
        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(settings.dpi as f32 / 72.0)
            .set_maximum_width(settings.max_pixels as i32)
            .set_maximum_height(settings.max_pixels as i32);
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| PdfError::Page {
                page: index + 1,
                detail: format!("{e:?}"),
            })?;
        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            index + 1,
            image.width(),
            image.height()
        );
        Ok(image)
    }
}

impl<'a> PdfiumDocument<'a> {
    fn page(&self, index: usize) -> Result<PdfPage<'a>, PdfError> {
        let idx = u16::try_from(index).map_err(|_| PdfError::Page {
            page: index + 1,
            detail: "page index exceeds pdfium limit".into(),
        })?;
        self.document.pages().get(idx).map_err(|e| PdfError::Page {
            page: index + 1,
            detail: format!("{e:?}"),
        })
    }
}

impl PdfBackend for PdfiumBackend {
    fn with_document(
        &self,
        path: &Path,
        visit: &mut dyn FnMut(&mut dyn PageDocument),
    ) -> Result<(), PdfError> {
        let pdfium = self.bind()?;
        let document = pdfium.load_pdf_from_file(path, None).map_err(|e| {
            let detail = format!("{e:?}");
            if detail.to_ascii_lowercase().contains("password") {
                PdfError::PasswordRequired {
                    path: path.to_path_buf(),
                }
            } else {
                PdfError::Corrupt {
                    path: path.to_path_buf(),
                    detail,
                }
            }
        })?;
        let mut doc = PdfiumDocument { document };
        visit(&mut doc);
        Ok(())
    }
}

// ── Page source ──────────────────────────────────────────────────────────

enum Command {
    TextLayer {
        reply: oneshot::Sender<Vec<Result<String, PdfError>>>,
    },
    Render {
        index: usize,
        reply: oneshot::Sender<Result<PageImage, PdfError>>,
    },
}

/// Opens page-oriented documents through a [`PdfBackend`].
#[derive(Clone)]
pub struct PdfPageSource {
    backend: Arc<dyn PdfBackend>,
    settings: RenderSettings,
}

impl PdfPageSource {
    pub fn new(backend: Arc<dyn PdfBackend>, settings: RenderSettings) -> Self {
        Self { backend, settings }
    }

    /// Open `path` on a dedicated worker. The document stays open until the
    /// returned handle is dropped or closed.
    pub async fn open(&self, path: &Path) -> Result<PdfHandle, PdfError> {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(1);
        let (opened_tx, opened_rx) = oneshot::channel::<Result<usize, PdfError>>();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let backend = Arc::clone(&self.backend);
        let settings = self.settings;
        let worker_path = path.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let mut opened_tx = Some(opened_tx);
            let outcome = backend.with_document(&worker_path, &mut |doc: &mut dyn PageDocument| {
                if let Some(tx) = opened_tx.take() {
                    if tx.send(Ok(doc.page_count())).is_err() {
                        return;
                    }
                }
                serve(doc, &mut cmd_rx, &settings);
            });
            if let Err(e) = outcome {
                match opened_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(e));
                    }
                    None => warn!(path = %worker_path.display(), error = %e, "document close failed"),
                }
            }
            let _ = done_tx.send(());
        });

        let page_count = opened_rx.await.map_err(|_| PdfError::WorkerGone)??;
        info!(path = %path.display(), page_count, "document opened");
        Ok(PdfHandle {
            path: path.to_path_buf(),
            page_count,
            commands: cmd_tx,
            done: done_rx,
        })
    }
}

fn serve(doc: &mut dyn PageDocument, commands: &mut mpsc::Receiver<Command>, settings: &RenderSettings) {
    while let Some(cmd) = commands.blocking_recv() {
        match cmd {
            Command::TextLayer { reply } => {
                let texts = (0..doc.page_count()).map(|i| doc.page_text(i)).collect();
                let _ = reply.send(texts);
            }
            Command::Render { index, reply } => {
                let page = doc
                    .render_page(index, settings)
                    .map(|img| PageImage::new(index + 1, img));
                let _ = reply.send(page);
            }
        }
    }
}

/// Per-page embedded text, in page order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextLayer {
    pub pages: Vec<String>,
}

impl TextLayer {
    pub fn joined(&self) -> String {
        self.pages.join("\n")
    }
}

/// An open document. Dropping it releases the document.
pub struct PdfHandle {
    path: PathBuf,
    page_count: usize,
    commands: mpsc::Sender<Command>,
    done: oneshot::Receiver<()>,
}

impl PdfHandle {
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Extract every page's embedded text. Pages whose text cannot be read
    /// contribute an empty string.
    pub async fn text_layer(&self) -> Result<TextLayer, PdfError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::TextLayer { reply })
            .await
            .map_err(|_| PdfError::WorkerGone)?;
        let results = rx.await.map_err(|_| PdfError::WorkerGone)?;
        let pages = results
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                r.unwrap_or_else(|e| {
                    warn!(page = i + 1, error = %e, "text extraction failed");
                    String::new()
                })
            })
            .collect();
        Ok(TextLayer { pages })
    }

    /// The text layer, if it passes `policy`.
    pub async fn usable_text_layer(
        &self,
        policy: &TextLayerPolicy,
    ) -> Result<Option<TextLayer>, PdfError> {
        let layer = self.text_layer().await?;
        Ok(policy.is_usable(&layer.joined()).then_some(layer))
    }

    pub async fn has_usable_text_layer(&self, policy: &TextLayerPolicy) -> bool {
        match self.usable_text_layer(policy).await {
            Ok(layer) => layer.is_some(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "text layer probe failed");
                false
            }
        }
    }

    /// Consume the handle into a one-pass page sequence.
    pub fn pages(self) -> PageSequence {
        PageSequence {
            handle: self,
            next: 0,
        }
    }

    /// Release the document and wait until the worker has let go of it.
    pub async fn close(self) {
        let PdfHandle { commands, done, .. } = self;
        drop(commands);
        let _ = done.await;
    }
}

/// Lazy, finite, non-restartable sequence of page images.
///
/// Each call to [`next`](Self::next) renders exactly one page. Reopen the
/// document to iterate again.
pub struct PageSequence {
    handle: PdfHandle,
    next: usize,
}

impl PageSequence {
    pub fn total(&self) -> usize {
        self.handle.page_count
    }

    /// Render the next page, or `None` when exhausted.
    pub async fn next(&mut self) -> Option<Result<PageImage, PdfError>> {
        if self.next >= self.handle.page_count {
            return None;
        }
        let index = self.next;
        self.next += 1;

        let (reply, rx) = oneshot::channel();
        if self
            .handle
            .commands
            .send(Command::Render { index, reply })
            .await
            .is_err()
        {
            self.next = self.handle.page_count;
            return Some(Err(PdfError::WorkerGone));
        }
        match rx.await {
            Ok(page) => Some(page),
            Err(_) => {
                self.next = self.handle.page_count;
                Some(Err(PdfError::WorkerGone))
            }
        }
    }

    pub async fn close(self) {
        self.handle.close().await
    }
}
