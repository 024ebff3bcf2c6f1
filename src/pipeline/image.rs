//! Page images handed to the recognition engine.

use crate::error::PdfError;
use image::DynamicImage;
use std::path::Path;
use std::sync::Arc;

/// A rendered or decoded page, 1-indexed.
///
/// The pixel buffer is reference-counted so a downgrade retry can reuse it
/// without re-rendering; it is freed when the last holder drops it.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub page: usize,
    pub image: Arc<DynamicImage>,
}

impl PageImage {
    pub fn new(page: usize, image: DynamicImage) -> Self {
        Self {
            page,
            image: Arc::new(image),
        }
    }
}

/// Decode a bare image file as a single page. Blocking.
pub fn load_image(path: &Path) -> Result<PageImage, PdfError> {
    let decoded = image::ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| PdfError::Page {
            page: 1,
            detail: e.to_string(),
        })?
        .decode()
        .map_err(|e| PdfError::Page {
            page: 1,
            detail: e.to_string(),
        })?;
    Ok(PageImage::new(1, decoded))
}
