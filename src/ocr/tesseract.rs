//! Tesseract command-line backend.
//!
//! Each page is written to a temporary PNG and recognised by one `tesseract`
//! process reading the provisioned tessdata directory. Thread use is bounded
//! with `OMP_THREAD_LIMIT`; compatible mode additionally pins the generic
//! dot-product kernel so no AVX/NEON code path is taken.

use crate::error::{EngineError, RecognitionFault};
use crate::ocr::engine::{DeviceMode, EngineFactory, EngineParams, RecognitionEngine};
use crate::ocr::models::ModelArtifactSet;
use image::{DynamicImage, ImageFormat};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// stderr fragments that mean "this execution mode does not work on this
/// host" rather than "this page could not be read".
const INCOMPATIBILITY_MARKERS: &[&str] = &[
    "illegal instruction",
    "sigill",
    "dotproduct",
    "opencl",
    "cuda",
    "out of memory",
    "cannot allocate memory",
];

#[derive(Debug, Clone)]
pub struct TesseractFactory {
    binary: PathBuf,
}

impl TesseractFactory {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// `tesseract --version` output, if the binary runs.
    pub fn version(&self) -> Result<String, EngineError> {
        let out = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                EngineError::Build(format!(
                    "cannot run '{}': {e}\nInstall tesseract or set DOCNORM_TESSERACT.",
                    self.binary.display()
                ))
            })?;
        if !out.status.success() {
            return Err(EngineError::Build(format!(
                "'{} --version' exited with {}",
                self.binary.display(),
                out.status
            )));
        }
        // Older releases print the banner on stderr.
        let banner = if out.stdout.is_empty() {
            out.stderr
        } else {
            out.stdout
        };
        Ok(String::from_utf8_lossy(&banner)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

impl EngineFactory for TesseractFactory {
    fn build(
        &self,
        params: &EngineParams,
        artifacts: &ModelArtifactSet,
    ) -> Result<Box<dyn RecognitionEngine>, EngineError> {
        let version = self.version()?;
        debug!(%version, device = ?params.device, optimized = params.optimized, "tesseract engine built");
        if params.device == DeviceMode::Accelerated {
            debug!("accelerated mode relies on an OpenCL-enabled tesseract build");
        }
        Ok(Box::new(TesseractEngine {
            binary: self.binary.clone(),
            params: params.clone(),
            tessdata: artifacts.dir.clone(),
        }))
    }
}

struct TesseractEngine {
    binary: PathBuf,
    params: EngineParams,
    tessdata: PathBuf,
}

impl TesseractEngine {
    fn command(&self, input: &std::path::Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(input)
            .arg("stdout")
            .arg("-l")
            .arg(self.params.languages.join("+"))
            .args(["--oem", "1", "--psm", "3"])
            .arg("--tessdata-dir")
            .arg(&self.tessdata)
            .env("OMP_THREAD_LIMIT", self.params.threads.max(1).to_string())
            .stdin(Stdio::null());
        if !self.params.optimized {
            cmd.args(["-c", "dotproduct=generic"]);
        }
        cmd
    }
}

impl RecognitionEngine for TesseractEngine {
    fn recognize(&mut self, image: &DynamicImage) -> Result<String, RecognitionFault> {
        let input = tempfile::Builder::new()
            .prefix("docnorm-page-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| RecognitionFault::Failed(format!("temp file: {e}")))?;
        image
            .save_with_format(input.path(), ImageFormat::Png)
            .map_err(|e| RecognitionFault::Failed(format!("encode page: {e}")))?;

        let out = self
            .command(input.path())
            .output()
            .map_err(|e| RecognitionFault::Failed(format!("spawn tesseract: {e}")))?;

        let stderr = String::from_utf8_lossy(&out.stderr);
        classify(
            out.status.success(),
            out.status.code(),
            &String::from_utf8_lossy(&out.stdout),
            &stderr,
        )
    }
}

/// Map a finished tesseract run onto text or a fault.
///
/// Death by signal (no exit code) is treated as an incompatibility: an
/// illegal-instruction crash in a SIMD kernel looks exactly like that.
fn classify(
    success: bool,
    code: Option<i32>,
    stdout: &str,
    stderr: &str,
) -> Result<String, RecognitionFault> {
    if success {
        if stdout.trim().is_empty() {
            warn!("tesseract returned no text for page");
        }
        return Ok(stdout.to_string());
    }
    let detail = stderr.trim().lines().last().unwrap_or("no diagnostics").to_string();
    let lowered = stderr.to_ascii_lowercase();
    if code.is_none() || INCOMPATIBILITY_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Err(RecognitionFault::Incompatible(match code {
            Some(c) => format!("exit {c}: {detail}"),
            None => format!("terminated by signal: {detail}"),
        }));
    }
    Err(RecognitionFault::Failed(format!(
        "exit {}: {detail}",
        code.unwrap_or(-1)
    )))
}
