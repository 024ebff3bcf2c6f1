//! Configuration types for the conversion pipeline.
//!
//! All behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`] or loaded from `DOCNORM_*` environment variables
//! with [`PipelineConfig::from_env`]. Keeping every knob in one struct makes
//! it trivial to share a config across worker tasks and to log it.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Configuration for a [`crate::Converter`].
///
/// # Example
/// ```rust
/// use docnorm::{PipelineConfig, DevicePreference};
///
/// let config = PipelineConfig::builder()
///     .device(DevicePreference::Cpu)
///     .render_dpi(200)
///     .languages(["eng", "deu"])
///     .build()
///     .unwrap();
/// assert_eq!(config.render_dpi, 200);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Directory holding conversion cache entries. `None` disables caching.
    ///
    /// Entries are keyed by content digest, so the directory is safe to
    /// share between processes and users of the same machine.
    pub cache_dir: Option<PathBuf>,

    /// Root under which each model's artifact directory is provisioned.
    pub model_root: PathBuf,

    /// Which execution device the recognition engine should use. Default: auto.
    pub device: DevicePreference,

    /// Model size/accuracy trade-off. Default: [`ModelTier::Lite`].
    pub model_tier: ModelTier,

    /// Where model artifacts are downloaded from. Default: official.
    pub model_source: ModelSource,

    /// Recognition languages (tessdata codes, e.g. `eng`, `chi_sim`).
    pub languages: Vec<String>,

    /// How long a hardware probe result is trusted. Default: 300 s.
    ///
    /// Drivers can load and devices can be hot-plugged between runs, so a
    /// negative probe must eventually be retried.
    pub probe_ttl: Duration,

    /// Upper bound on a single hardware probe. Default: 3 s.
    pub probe_timeout: Duration,

    /// Threads granted to the engine in CPU mode. Default: min(4, cpus).
    pub cpu_threads: usize,

    /// Recognition batch size in accelerated mode. Default: 6. CPU mode always uses 1.
    pub accelerated_batch_size: usize,

    /// Allow the optimized execution path (native SIMD kernels). Default: true.
    ///
    /// The engine manager turns this off by itself after the first
    /// incompatibility signal; set it to false up front on hosts known to
    /// misbehave.
    pub optimized: bool,

    /// Rasterisation resolution for scanned pages. Range: 72–600. Default: 300.
    pub render_dpi: u32,

    /// Cap on either rendered dimension in pixels. Default: 4000.
    ///
    /// A 300-DPI render of an A0 poster would otherwise allocate hundreds of
    /// megabytes before recognition even starts.
    pub max_rendered_pixels: u32,

    /// Thresholds for deciding whether a PDF's embedded text can be trusted.
    pub text_layer: TextLayerPolicy,

    /// Separator between pages in assembled output. Default: horizontal rule.
    pub page_separator: PageSeparator,

    /// Bound on a single model file download. Default: 300 s.
    pub download_timeout: Duration,

    /// Explicit pdfium shared library. `None` binds the system library.
    pub pdfium_library: Option<PathBuf>,

    /// Tesseract executable. Default: `tesseract` on `PATH`.
    pub tesseract_binary: PathBuf,

    /// Recognise scanned documents locally or with a hosted service. Default: local.
    pub ocr_mode: OcrMode,

    /// Hosted recognition settings, used when `ocr_mode` is [`OcrMode::Cloud`].
    pub cloud: CloudSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let base = dirs::cache_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
            .unwrap_or_else(std::env::temp_dir)
            .join("docnorm");
        let model_root = dirs::data_dir()
            .map(|d| d.join("docnorm").join("models"))
            .unwrap_or_else(|| base.join("models"));
        Self {
            cache_dir: Some(base.join("conversions")),
            model_root,
            device: DevicePreference::default(),
            model_tier: ModelTier::default(),
            model_source: ModelSource::default(),
            languages: vec!["eng".to_string()],
            probe_ttl: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(3),
            cpu_threads: num_cpus::get().clamp(1, 4),
            accelerated_batch_size: 6,
            optimized: true,
            render_dpi: 300,
            max_rendered_pixels: 4000,
            text_layer: TextLayerPolicy::default(),
            page_separator: PageSeparator::default(),
            download_timeout: Duration::from_secs(300),
            pdfium_library: None,
            tesseract_binary: PathBuf::from("tesseract"),
            ocr_mode: OcrMode::default(),
            cloud: CloudSettings::default(),
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("cache_dir", &self.cache_dir)
            .field("model_root", &self.model_root)
            .field("device", &self.device)
            .field("model_tier", &self.model_tier)
            .field("model_source", &self.model_source)
            .field("languages", &self.languages)
            .field("probe_ttl", &self.probe_ttl)
            .field("cpu_threads", &self.cpu_threads)
            .field("optimized", &self.optimized)
            .field("render_dpi", &self.render_dpi)
            .field("text_layer", &self.text_layer)
            .field("ocr_mode", &self.ocr_mode)
            .field("cloud", &self.cloud)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Defaults overlaid with `DOCNORM_*` environment variables.
    ///
    /// Unparseable values are logged and ignored rather than rejected, so a
    /// typo in a shell profile never prevents conversion.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::builder().apply_env(|key| std::env::var(key).ok()).build()
    }

    /// Model identifier derived from tier and languages.
    pub fn model_id(&self) -> String {
        format!("{}-{}", self.model_tier.repository(), self.languages.join("-"))
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = Some(dir.into());
        self
    }

    pub fn disable_cache(mut self) -> Self {
        self.config.cache_dir = None;
        self
    }

    pub fn model_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.model_root = dir.into();
        self
    }

    pub fn device(mut self, device: DevicePreference) -> Self {
        self.config.device = device;
        self
    }

    pub fn model_tier(mut self, tier: ModelTier) -> Self {
        self.config.model_tier = tier;
        self
    }

    pub fn model_source(mut self, source: ModelSource) -> Self {
        self.config.model_source = source;
        self
    }

    pub fn languages<I, S>(mut self, langs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.languages = langs.into_iter().map(Into::into).collect();
        self
    }

    pub fn probe_ttl(mut self, ttl: Duration) -> Self {
        self.config.probe_ttl = ttl;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout.max(Duration::from_millis(10));
        self
    }

    pub fn cpu_threads(mut self, n: usize) -> Self {
        self.config.cpu_threads = n.max(1);
        self
    }

    pub fn accelerated_batch_size(mut self, n: usize) -> Self {
        self.config.accelerated_batch_size = n.max(1);
        self
    }

    pub fn optimized(mut self, v: bool) -> Self {
        self.config.optimized = v;
        self
    }

    pub fn render_dpi(mut self, dpi: u32) -> Self {
        self.config.render_dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn text_layer(mut self, policy: TextLayerPolicy) -> Self {
        self.config.text_layer = policy;
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.config.download_timeout = timeout;
        self
    }

    pub fn pdfium_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library = Some(path.into());
        self
    }

    pub fn tesseract_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tesseract_binary = path.into();
        self
    }

    pub fn ocr_mode(mut self, mode: OcrMode) -> Self {
        self.config.ocr_mode = mode;
        self
    }

    pub fn cloud(mut self, settings: CloudSettings) -> Self {
        self.config.cloud = settings;
        self
    }

    /// Overlay values from an environment lookup.
    ///
    /// Takes the lookup as a closure so tests can feed a map instead of
    /// mutating the process environment.
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("DOCNORM_CACHE_DIR") {
            self.config.cache_dir = match v.as_str() {
                "off" | "none" => None,
                _ => Some(PathBuf::from(v)),
            };
        }
        if let Some(v) = get("DOCNORM_MODEL_DIR") {
            self.config.model_root = PathBuf::from(v);
        }
        if let Some(v) = get("DOCNORM_OCR_DEVICE") {
            let device = parse_or_default("DOCNORM_OCR_DEVICE", &v, self.config.device);
            self = self.device(device);
        }
        if let Some(v) = get("DOCNORM_OCR_TIER") {
            let tier = parse_or_default("DOCNORM_OCR_TIER", &v, self.config.model_tier);
            self = self.model_tier(tier);
        }
        if let Some(v) = get("DOCNORM_OCR_SOURCE") {
            let source = parse_or_default("DOCNORM_OCR_SOURCE", &v, self.config.model_source);
            self = self.model_source(source);
        }
        if let Some(v) = get("DOCNORM_OCR_LANG") {
            self = self.languages(v.split('+').filter(|l| !l.is_empty()));
        }
        if let Some(v) = get("DOCNORM_DEVICE_CACHE_TTL_SECONDS") {
            let secs = parse_or_default("DOCNORM_DEVICE_CACHE_TTL_SECONDS", &v, self.config.probe_ttl.as_secs());
            self = self.probe_ttl(Duration::from_secs(secs));
        }
        if let Some(v) = get("DOCNORM_OCR_CPU_THREADS") {
            let n = parse_or_default("DOCNORM_OCR_CPU_THREADS", &v, self.config.cpu_threads);
            self = self.cpu_threads(n);
        }
        if let Some(v) = get("DOCNORM_OCR_REC_BATCH_SIZE") {
            let n = parse_or_default(
                "DOCNORM_OCR_REC_BATCH_SIZE",
                &v,
                self.config.accelerated_batch_size,
            );
            self = self.accelerated_batch_size(n);
        }
        if let Some(v) = get("DOCNORM_OCR_OPTIMIZED") {
            self.config.optimized = !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off");
        }
        if let Some(v) = get("DOCNORM_PDF_RENDER_DPI") {
            let dpi = parse_or_default("DOCNORM_PDF_RENDER_DPI", &v, self.config.render_dpi);
            self = self.render_dpi(dpi);
        }
        if let Some(v) = get("PDFIUM_LIB_PATH") {
            self.config.pdfium_library = Some(PathBuf::from(v));
        }
        if let Some(v) = get("DOCNORM_TESSERACT") {
            self.config.tesseract_binary = PathBuf::from(v);
        }
        if let Some(v) = get("DOCNORM_OCR_MODE") {
            let mode = parse_or_default("DOCNORM_OCR_MODE", &v, self.config.ocr_mode);
            self = self.ocr_mode(mode);
        }
        let cloud = &mut self.config.cloud;
        if let Some(v) = get("DOCNORM_OCR_CLOUD_PROVIDER") {
            cloud.provider = v.to_ascii_lowercase();
        }
        if let Some(v) = get("DOCNORM_OCR_CLOUD_ENDPOINT") {
            cloud.endpoint = v;
        }
        if let Some(v) = get("DOCNORM_OCR_CLOUD_API_KEY") {
            cloud.api_key = v;
        }
        if let Some(v) = get("DOCNORM_OCR_CLOUD_PROXY") {
            cloud.proxy = Some(v);
        }
        if let Some(v) = get("DOCNORM_OCR_CLOUD_POLL_INTERVAL_SECONDS") {
            let secs = parse_or_default(
                "DOCNORM_OCR_CLOUD_POLL_INTERVAL_SECONDS",
                &v,
                cloud.poll_interval.as_secs_f64(),
            );
            cloud.poll_interval = Duration::from_secs_f64(secs.max(0.5));
        }
        if let Some(v) = get("DOCNORM_OCR_CLOUD_TIMEOUT_SECONDS") {
            let secs = parse_or_default("DOCNORM_OCR_CLOUD_TIMEOUT_SECONDS", &v, cloud.timeout.as_secs());
            cloud.timeout = Duration::from_secs(secs.max(30));
        }
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        let c = &self.config;
        if c.languages.is_empty() {
            return Err(ConfigError("at least one OCR language is required".into()));
        }
        if let Some(bad) = c
            .languages
            .iter()
            .find(|l| !l.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_'))
        {
            return Err(ConfigError(format!("invalid OCR language code '{bad}'")));
        }
        if c.text_layer.min_alnum_ratio < 0.0 || c.text_layer.min_alnum_ratio > 1.0 {
            return Err(ConfigError(format!(
                "text layer alnum ratio must be 0.0–1.0, got {}",
                c.text_layer.min_alnum_ratio
            )));
        }
        Ok(self.config)
    }
}

fn parse_or_default<T: FromStr + Copy + fmt::Debug>(key: &str, raw: &str, default: T) -> T {
    match raw.parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(key, value = raw, ?default, "ignoring invalid environment value");
            default
        }
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Requested execution device for the recognition engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Use the accelerator when the probe finds one. (default)
    #[default]
    Auto,
    /// Never probe; always run on the CPU.
    Cpu,
    /// Prefer the accelerator; falls back to CPU with a warning when absent.
    Gpu,
}

impl FromStr for DevicePreference {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            _ if s == "gpu" || s == "cuda" || s.starts_with("gpu:") => Ok(Self::Gpu),
            _ => Err(ConfigError(format!("unknown device '{s}' (auto, cpu, gpu)"))),
        }
    }
}

/// Model size/accuracy tier.
///
/// | Tier | Repository | Use case |
/// |------|------------|----------|
/// | lite | `tessdata_fast` | Clean scans, fastest (default) |
/// | standard | `tessdata` | Mixed quality |
/// | accuracy | `tessdata_best` | Degraded scans, small print |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    #[default]
    Lite,
    Standard,
    Accuracy,
}

impl ModelTier {
    pub fn repository(&self) -> &'static str {
        match self {
            ModelTier::Lite => "tessdata_fast",
            ModelTier::Standard => "tessdata",
            ModelTier::Accuracy => "tessdata_best",
        }
    }
}

impl FromStr for ModelTier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lite" | "fast" => Ok(Self::Lite),
            "standard" => Ok(Self::Standard),
            "accuracy" | "best" => Ok(Self::Accuracy),
            other => Err(ConfigError(format!(
                "unknown model tier '{other}' (lite, standard, accuracy)"
            ))),
        }
    }
}

/// Download origin for model artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    /// GitHub raw content. (default)
    #[default]
    Official,
    /// jsDelivr CDN mirror of the same repositories.
    Mirror,
}

impl ModelSource {
    /// Base URL for files of the given tessdata repository.
    pub fn base_url(&self, repository: &str) -> String {
        match self {
            ModelSource::Official => {
                format!("https://raw.githubusercontent.com/tesseract-ocr/{repository}/main")
            }
            ModelSource::Mirror => {
                format!("https://cdn.jsdelivr.net/gh/tesseract-ocr/{repository}@main")
            }
        }
    }
}

impl FromStr for ModelSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "official" => Ok(Self::Official),
            "mirror" | "cn_mirror" => Ok(Self::Mirror),
            other => Err(ConfigError(format!(
                "unknown model source '{other}' (official, mirror)"
            ))),
        }
    }
}

/// Where scanned documents are recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrMode {
    /// The local engine, one page at a time. (default)
    #[default]
    Local,
    /// Upload the whole document to a hosted recognition service.
    Cloud,
}

impl FromStr for OcrMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "cloud" => Ok(Self::Cloud),
            other => Err(ConfigError(format!("unknown OCR mode '{other}' (local, cloud)"))),
        }
    }
}

/// Hosted document recognition (MinerU batch API).
///
/// The API key is only checked when a cloud conversion starts, so a
/// missing key never blocks local-only commands.
#[derive(Clone)]
pub struct CloudSettings {
    /// Provider name. Only `mineru` is supported.
    pub provider: String,
    /// API root; `/api/v4` is tried first, then the bare root.
    pub endpoint: String,
    pub api_key: String,
    /// HTTP(S) proxy for every cloud request.
    pub proxy: Option<String>,
    pub model_version: String,
    /// Delay between result polls. Default: 2 s.
    pub poll_interval: Duration,
    /// Upper bound on waiting for a result. Default: 600 s.
    pub timeout: Duration,
    /// Largest accepted upload. Default: 200 MiB.
    pub max_file_bytes: u64,
    /// Most PDF pages accepted. Default: 600.
    pub max_pdf_pages: usize,
    /// Largest accepted Markdown result. Default: 20 MiB.
    pub max_result_bytes: usize,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            provider: "mineru".to_string(),
            endpoint: "https://mineru.net".to_string(),
            api_key: String::new(),
            proxy: None,
            model_version: "vlm".to_string(),
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(600),
            max_file_bytes: 200 * 1024 * 1024,
            max_pdf_pages: 600,
            max_result_bytes: 20 * 1024 * 1024,
        }
    }
}

impl fmt::Debug for CloudSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudSettings")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("proxy", &self.proxy)
            .field("poll_interval", &self.poll_interval)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Heuristic thresholds for trusting a PDF's embedded text layer.
///
/// A handful of stray glyphs (page numbers, scanner watermarks) must not
/// suppress OCR for an otherwise scanned document, so the check requires a
/// minimum amount of text and a minimum share of alphanumeric characters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TextLayerPolicy {
    /// Minimum non-whitespace characters. Default: 10.
    pub min_chars: usize,
    /// Minimum alphanumeric characters. Default: 6.
    pub min_alnum: usize,
    /// Minimum alphanumeric share of non-whitespace characters. Default: 0.2.
    pub min_alnum_ratio: f32,
}

impl Default for TextLayerPolicy {
    fn default() -> Self {
        Self {
            min_chars: 10,
            min_alnum: 6,
            min_alnum_ratio: 0.2,
        }
    }
}

impl TextLayerPolicy {
    /// Whether `text` is substantive enough to skip OCR.
    pub fn is_usable(&self, text: &str) -> bool {
        let compact: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.len() < self.min_chars {
            return false;
        }
        let alnum = compact.iter().filter(|c| c.is_alphanumeric()).count();
        let ratio_floor = (compact.len() as f32 * self.min_alnum_ratio).ceil() as usize;
        alnum >= self.min_alnum.max(ratio_floor)
    }
}

/// How to separate pages in assembled output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum PageSeparator {
    /// Pages joined with a blank line.
    None,
    /// Horizontal rule: "\n\n---\n\n" (default)
    #[default]
    HorizontalRule,
    /// HTML comment with page number: "<!-- page N -->"
    Comment,
    /// Custom string inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator placed before page `page_num` (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Comment => format!("\n\n<!-- page {} -->\n\n", page_num),
            PageSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_sane() {
        let c = PipelineConfig::default();
        assert_eq!(c.render_dpi, 300);
        assert_eq!(c.probe_ttl, Duration::from_secs(300));
        assert!(c.cpu_threads >= 1 && c.cpu_threads <= 4);
        assert_eq!(c.languages, vec!["eng".to_string()]);
        assert!(c.cache_dir.is_some());
    }

    #[test]
    fn builder_clamps_dpi() {
        let c = PipelineConfig::builder().render_dpi(10).build().unwrap();
        assert_eq!(c.render_dpi, 72);
        let c = PipelineConfig::builder().render_dpi(5000).build().unwrap();
        assert_eq!(c.render_dpi, 600);
    }

    #[test]
    fn builder_rejects_bad_language() {
        let err = PipelineConfig::builder()
            .languages(["eng", "../etc"])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("../etc"));
    }

    #[test]
    fn env_overlay_applies_and_ignores_garbage() {
        let c = PipelineConfig::builder()
            .apply_env(env(&[
                ("DOCNORM_OCR_DEVICE", "gpu:0"),
                ("DOCNORM_OCR_TIER", "accuracy"),
                ("DOCNORM_OCR_LANG", "eng+chi_sim"),
                ("DOCNORM_OCR_CPU_THREADS", "not-a-number"),
                ("DOCNORM_DEVICE_CACHE_TTL_SECONDS", "42"),
                ("DOCNORM_CACHE_DIR", "off"),
                ("DOCNORM_OCR_OPTIMIZED", "0"),
            ]))
            .build()
            .unwrap();
        assert_eq!(c.device, DevicePreference::Gpu);
        assert_eq!(c.model_tier, ModelTier::Accuracy);
        assert_eq!(c.languages, vec!["eng", "chi_sim"]);
        assert_eq!(c.cpu_threads, PipelineConfig::default().cpu_threads);
        assert_eq!(c.probe_ttl, Duration::from_secs(42));
        assert!(c.cache_dir.is_none());
        assert!(!c.optimized);
        assert_eq!(c.model_id(), "tessdata_best-eng-chi_sim");
    }

    #[test]
    fn env_overlay_sets_device_tier_and_source() {
        let c = PipelineConfig::builder()
            .apply_env(env(&[
                ("DOCNORM_OCR_DEVICE", "cpu"),
                ("DOCNORM_OCR_TIER", "lite"),
                ("DOCNORM_OCR_SOURCE", "mirror"),
            ]))
            .build()
            .unwrap();
        assert_eq!(c.device, DevicePreference::Cpu);
        assert_eq!(c.model_tier, ModelTier::Lite);
        assert_eq!(c.model_source, ModelSource::Mirror);

        let kept = PipelineConfig::builder()
            .model_source(ModelSource::Mirror)
            .apply_env(env(&[("DOCNORM_OCR_SOURCE", "ftp"), ("DOCNORM_OCR_TIER", "huge")]))
            .build()
            .unwrap();
        assert_eq!(kept.model_source, ModelSource::Mirror);
        assert_eq!(kept.model_tier, PipelineConfig::default().model_tier);
    }

    #[test]
    fn env_overlay_configures_cloud_mode() {
        let c = PipelineConfig::builder()
            .apply_env(env(&[
                ("DOCNORM_OCR_MODE", "Cloud"),
                ("DOCNORM_OCR_CLOUD_ENDPOINT", "mineru.example"),
                ("DOCNORM_OCR_CLOUD_API_KEY", "sk-secret"),
                ("DOCNORM_OCR_CLOUD_POLL_INTERVAL_SECONDS", "0.1"),
                ("DOCNORM_OCR_CLOUD_TIMEOUT_SECONDS", "5"),
            ]))
            .build()
            .unwrap();
        assert_eq!(c.ocr_mode, OcrMode::Cloud);
        assert_eq!(c.cloud.endpoint, "mineru.example");
        assert_eq!(c.cloud.poll_interval, Duration::from_millis(500));
        assert_eq!(c.cloud.timeout, Duration::from_secs(30));

        let shown = format!("{c:?}");
        assert!(!shown.contains("sk-secret"), "{shown}");
        assert!(shown.contains("<redacted>"));
    }

    #[test]
    fn text_layer_policy_rejects_stray_glyphs() {
        let p = TextLayerPolicy::default();
        assert!(!p.is_usable("  3  "));
        assert!(!p.is_usable("-- . -- . -- . --"));
        assert!(p.is_usable("Chapter one begins here with real prose."));
    }

    #[test]
    fn text_layer_policy_is_tunable() {
        let strict = TextLayerPolicy {
            min_chars: 100,
            ..TextLayerPolicy::default()
        };
        assert!(!strict.is_usable("Chapter one begins here with real prose."));
    }

    #[test]
    fn separator_rendering() {
        assert_eq!(PageSeparator::HorizontalRule.render(2), "\n\n---\n\n");
        assert!(PageSeparator::Comment.render(7).contains("page 7"));
    }

    #[test]
    fn mirror_source_uses_cdn() {
        let url = ModelSource::Mirror.base_url("tessdata_fast");
        assert!(url.starts_with("https://cdn.jsdelivr.net/"));
    }
}
