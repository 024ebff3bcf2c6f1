//! `docnorm`: normalise documents to Markdown-flavoured text from the command line.
//!
//! Run `docnorm --help` for usage.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docnorm::ocr::tesseract::TesseractFactory;
use docnorm::{
    ConversionError, ConversionRequest, ConversionResult, Converter, DevicePreference,
    ModelSource, ModelTier, OcrMode, PageSeparator, PipelineConfig, ProgressMarker, ProgressSink,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}

fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}

fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}

fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}

fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const SPINNER_TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Progress ─────────────────────────────────────────────────────────────

/// One spinner per file, driven by pipeline progress markers.
struct FileProgress {
    bar: ProgressBar,
}

impl FileProgress {
    fn new(multi: &MultiProgress, path: &Path) -> Self {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(SPINNER_TICKS),
        );
        bar.set_prefix(display_name(path));
        bar.set_message("queued");
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    fn sink(&self) -> ProgressSink {
        let bar = self.bar.clone();
        Arc::new(move |marker: &ProgressMarker| match marker {
            ProgressMarker::Page { current, total } => {
                bar.set_message(format!("recognising page {current}/{total}"));
            }
            ProgressMarker::DownloadingModel(id) => {
                bar.set_message(format!("downloading model {id} (first run only)"));
            }
            ProgressMarker::Done => bar.set_message("done"),
            other => bar.set_message(other.to_string()),
        })
    }

    fn finish(&self, outcome: &Result<ConversionResult, ConversionError>, elapsed: Duration) {
        let line = match outcome {
            Ok(r) if r.failures.is_empty() => format!(
                "{} {}  {}",
                green("✓"),
                self.bar.prefix(),
                dim(&summary(r, elapsed)),
            ),
            Ok(r) => format!(
                "{} {}  {}  {} page(s) failed",
                yellow("⚠"),
                self.bar.prefix(),
                dim(&summary(r, elapsed)),
                r.failures.len(),
            ),
            Err(e) => format!("{} {}  {}", red("✗"), self.bar.prefix(), e.code()),
        };
        self.bar.println(line);
        self.bar.finish_and_clear();
    }
}

fn summary(r: &ConversionResult, elapsed: Duration) -> String {
    let source = if r.from_cache {
        "cache".to_string()
    } else if r.ocr {
        "ocr".to_string()
    } else {
        r.format.to_string()
    };
    format!(
        "{} page(s) via {}  {}ms",
        r.page_count,
        source,
        elapsed.as_millis()
    )
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ── CLI definition ───────────────────────────────────────────────────────

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert a Word document to stdout
  docnorm convert report.docx

  # Convert a folder's worth of files, four at a time, into out/
  docnorm convert -j 4 -o out/ *.pdf *.pptx

  # Scanned PDF, German + English recognition, CPU only
  docnorm convert --lang deu+eng --device cpu scan.pdf

  # Structured output with per-page failures
  docnorm convert --json scan.pdf > scan.json

  # Is an accelerator visible? (bypasses the cached answer)
  docnorm probe --force

  # Pre-fetch recognition models before going offline
  docnorm models download

SUPPORTED INPUTS:
  .md .markdown .txt      decoded as text (UTF-8 or detected legacy encoding)
  .docx .pptx             OOXML containers
  .pdf                    text layer when usable, OCR otherwise
  .png .jpg .bmp .tiff .webp   OCR

ENVIRONMENT VARIABLES:
  DOCNORM_CACHE_DIR                 Conversion cache directory ("off" disables)
  DOCNORM_MODEL_DIR                 Root for downloaded recognition models
  DOCNORM_OCR_DEVICE                auto | cpu | gpu
  DOCNORM_OCR_TIER                  lite | standard | accuracy
  DOCNORM_OCR_SOURCE                official | mirror
  DOCNORM_OCR_LANG                  Languages joined with '+', e.g. eng+deu
  DOCNORM_OCR_CPU_THREADS           Engine threads in CPU mode
  DOCNORM_OCR_REC_BATCH_SIZE        Recognition batch size on an accelerator
  DOCNORM_OCR_OPTIMIZED             0 disables the optimized kernels up front
  DOCNORM_DEVICE_CACHE_TTL_SECONDS  How long a hardware probe is trusted
  DOCNORM_PDF_RENDER_DPI            Rasterisation DPI for scanned pages
  DOCNORM_TESSERACT                 Path to the tesseract binary
  DOCNORM_OCR_MODE                  local | cloud
  DOCNORM_OCR_CLOUD_PROVIDER        Hosted recognition provider (mineru)
  DOCNORM_OCR_CLOUD_ENDPOINT        Provider endpoint, default https://mineru.net
  DOCNORM_OCR_CLOUD_API_KEY         Provider API key
  DOCNORM_OCR_CLOUD_PROXY           Proxy URL for provider requests
  DOCNORM_OCR_CLOUD_POLL_INTERVAL_SECONDS  Result polling interval (min 0.5)
  DOCNORM_OCR_CLOUD_TIMEOUT_SECONDS        Give up waiting after this long (min 30)
  PDFIUM_LIB_PATH                   Path to libpdfium
  RUST_LOG                          Log filter, e.g. docnorm=debug
"#;

/// Normalise documents, images and scanned PDFs into text.
#[derive(Parser, Debug)]
#[command(
    name = "docnorm",
    version,
    about = "Normalise documents, images and scanned PDFs into text",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCNORM_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOCNORM_QUIET")]
    quiet: bool,

    /// Recognition device: auto, cpu, gpu.
    #[arg(long, global = true, value_enum)]
    device: Option<DeviceArg>,

    /// Recognition model tier: lite, standard, accuracy.
    #[arg(long, global = true, value_enum)]
    tier: Option<TierArg>,

    /// Where scanned PDFs and images are recognised: local, cloud.
    #[arg(long, global = true, value_enum)]
    ocr_mode: Option<OcrModeArg>,

    /// Recognition languages joined with '+', e.g. eng+deu.
    #[arg(long, global = true)]
    lang: Option<String>,

    /// Download origin for models: official, mirror.
    #[arg(long, global = true, value_enum)]
    source: Option<SourceArg>,

    /// Conversion cache directory.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Bypass the conversion cache.
    #[arg(long, global = true)]
    no_cache: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert one or more files.
    Convert {
        /// Files to convert.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Write `<name>.md` files into this directory instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of files converted concurrently.
        #[arg(short = 'j', long, env = "DOCNORM_CONCURRENCY", default_value_t = 2)]
        concurrency: usize,

        /// Emit JSON results instead of text.
        #[arg(long)]
        json: bool,

        /// Rasterisation DPI for scanned pages (72–600).
        #[arg(long, value_parser = clap::value_parser!(u32).range(72..=600))]
        dpi: Option<u32>,

        /// Page separator: none, hr, comment, or a custom string.
        #[arg(long)]
        separator: Option<String>,

        /// Disable progress spinners.
        #[arg(long, env = "DOCNORM_NO_PROGRESS")]
        no_progress: bool,
    },

    /// Report accelerator availability and the recognition backend.
    Probe {
        /// Ignore the cached probe result.
        #[arg(long)]
        force: bool,
    },

    /// Inspect or pre-fetch recognition models.
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },

    /// Inspect or empty the conversion cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum ModelsAction {
    /// Show which models are present on disk.
    Status,
    /// Download the model for the configured tier and languages.
    Download,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Entry count and size.
    Stats,
    /// Remove every entry.
    Clear,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum DeviceArg {
    Auto,
    Cpu,
    Gpu,
}

impl From<DeviceArg> for DevicePreference {
    fn from(v: DeviceArg) -> Self {
        match v {
            DeviceArg::Auto => DevicePreference::Auto,
            DeviceArg::Cpu => DevicePreference::Cpu,
            DeviceArg::Gpu => DevicePreference::Gpu,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum TierArg {
    Lite,
    Standard,
    Accuracy,
}

impl From<TierArg> for ModelTier {
    fn from(v: TierArg) -> Self {
        match v {
            TierArg::Lite => ModelTier::Lite,
            TierArg::Standard => ModelTier::Standard,
            TierArg::Accuracy => ModelTier::Accuracy,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum OcrModeArg {
    Local,
    Cloud,
}

impl From<OcrModeArg> for OcrMode {
    fn from(v: OcrModeArg) -> Self {
        match v {
            OcrModeArg::Local => OcrMode::Local,
            OcrModeArg::Cloud => OcrMode::Cloud,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum SourceArg {
    Official,
    Mirror,
}

impl From<SourceArg> for ModelSource {
    fn from(v: SourceArg) -> Self {
        match v {
            SourceArg::Official => ModelSource::Official,
            SourceArg::Mirror => ModelSource::Mirror,
        }
    }
}

// ── Entry point ──────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Spinners replace INFO logs during conversion.
    let spinners = matches!(
        &cli.command,
        Command::Convert { json: false, no_progress: false, .. }
    ) && !cli.quiet;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || spinners {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli).context("Invalid configuration")?;

    match &cli.command {
        Command::Convert {
            files,
            output,
            concurrency,
            json,
            ..
        } => {
            let converter = Converter::new(config).context("Failed to initialise converter")?;
            let failed = run_convert(
                &converter,
                files,
                output.as_deref(),
                *concurrency,
                *json,
                spinners,
                cli.quiet,
            )
            .await?;
            if failed > 0 {
                anyhow::bail!("{failed} of {} file(s) failed", files.len());
            }
        }
        Command::Probe { force } => {
            let converter = Converter::new(config).context("Failed to initialise converter")?;
            run_probe(&converter, *force).await;
        }
        Command::Models { action } => {
            let converter = Converter::new(config).context("Failed to initialise converter")?;
            run_models(&converter, action, cli.quiet).await?;
        }
        Command::Cache { action } => run_cache(&config, action)?,
    }

    Ok(())
}

/// Defaults, then `DOCNORM_*` environment, then explicit flags.
fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder().apply_env(|key| std::env::var(key).ok());

    if let Some(device) = cli.device {
        builder = builder.device(device.into());
    }
    if let Some(tier) = cli.tier {
        builder = builder.model_tier(tier.into());
    }
    if let Some(mode) = cli.ocr_mode {
        builder = builder.ocr_mode(mode.into());
    }
    if let Some(source) = cli.source {
        builder = builder.model_source(source.into());
    }
    if let Some(ref lang) = cli.lang {
        builder = builder.languages(lang.split('+').filter(|l| !l.is_empty()));
    }
    if let Some(ref dir) = cli.cache_dir {
        builder = builder.cache_dir(dir);
    }
    if cli.no_cache {
        builder = builder.disable_cache();
    }
    if let Command::Convert { dpi, separator, .. } = &cli.command {
        if let Some(dpi) = dpi {
            builder = builder.render_dpi(*dpi);
        }
        if let Some(sep) = separator {
            builder = builder.page_separator(parse_separator(sep));
        }
    }

    Ok(builder.build()?)
}

/// Parse `--separator` into a [`PageSeparator`].
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "none" => PageSeparator::None,
        "hr" | "---" => PageSeparator::HorizontalRule,
        "comment" => PageSeparator::Comment,
        _ => PageSeparator::Custom(s.to_string()),
    }
}

// ── convert ──────────────────────────────────────────────────────────────

/// Returns the number of files that failed.
async fn run_convert(
    converter: &Converter,
    files: &[PathBuf],
    output_dir: Option<&Path>,
    concurrency: usize,
    json: bool,
    spinners: bool,
    quiet: bool,
) -> Result<usize> {
    if let Some(dir) = output_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    }

    let multi = MultiProgress::new();
    let progress: Vec<Option<FileProgress>> = files
        .iter()
        .map(|f| spinners.then(|| FileProgress::new(&multi, f)))
        .collect();

    let requests = files
        .iter()
        .zip(&progress)
        .map(|(file, p)| {
            let req = ConversionRequest::new(file);
            match p {
                Some(p) => req.with_progress(p.sink()),
                None => req,
            }
        })
        .collect();

    let start = Instant::now();
    let outcomes = converter.convert_many(requests, concurrency).await;
    let elapsed = start.elapsed();

    for (p, outcome) in progress.iter().zip(&outcomes) {
        if let Some(p) = p {
            p.finish(outcome, elapsed);
        }
    }

    let failed = outcomes.iter().filter(|o| o.is_err()).count();

    if json {
        let records: Vec<serde_json::Value> = files
            .iter()
            .zip(&outcomes)
            .map(|(file, outcome)| json_record(file, outcome))
            .collect();
        let body = if records.len() == 1 {
            serde_json::to_string_pretty(&records[0])
        } else {
            serde_json::to_string_pretty(&records)
        }
        .context("Failed to serialise output")?;
        println!("{body}");
        return Ok(failed);
    }

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let many = files.len() > 1;
    for (file, outcome) in files.iter().zip(&outcomes) {
        match outcome {
            Ok(result) => {
                if let Some(dir) = output_dir {
                    let dest = output_path(dir, file);
                    tokio::fs::write(&dest, &result.content)
                        .await
                        .with_context(|| format!("Failed to write {}", dest.display()))?;
                    if !quiet && !spinners {
                        eprintln!("{} → {}", file.display(), bold(&dest.display().to_string()));
                    }
                } else {
                    if many {
                        writeln!(handle, "<!-- {} -->\n", file.display())
                            .context("Failed to write to stdout")?;
                    }
                    handle
                        .write_all(result.content.as_bytes())
                        .context("Failed to write to stdout")?;
                    if !result.content.ends_with('\n') {
                        handle.write_all(b"\n").ok();
                    }
                }
                if !quiet {
                    for failure in &result.failures {
                        eprintln!("{} {}: {failure}", yellow("warning:"), file.display());
                    }
                }
            }
            Err(e) => eprintln!("{} {}: {e}", red("error:"), file.display()),
        }
    }

    if !quiet && !spinners {
        eprintln!(
            "Converted {}/{} file(s) in {}ms",
            files.len() - failed,
            files.len(),
            elapsed.as_millis()
        );
    }

    Ok(failed)
}

fn json_record(
    file: &Path,
    outcome: &Result<ConversionResult, ConversionError>,
) -> serde_json::Value {
    match outcome {
        Ok(result) => serde_json::json!({
            "ok": true,
            "from_cache": result.from_cache,
            "result": result,
        }),
        Err(e) => serde_json::json!({
            "ok": false,
            "path": file,
            "trace_id": e.trace_id,
            "stage": e.stage,
            "code": e.code(),
            "retryable": e.is_retryable(),
            "message": e.kind.to_string(),
        }),
    }
}

/// `dir/<name>.md`. The source extension stays in the name so report.pdf
/// and report.docx land in different files.
fn output_path(dir: &Path, file: &Path) -> PathBuf {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let base = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.eq_ignore_ascii_case("md") => stem.to_string(),
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}.{ext}"),
        _ => name,
    };
    dir.join(format!("{base}.md"))
}

// ── probe / models / cache ───────────────────────────────────────────────

async fn run_probe(converter: &Converter, force: bool) {
    let config = converter.config();
    let available = converter.device_probe().is_available(force).await;
    println!(
        "Accelerator:  {}",
        if available { green("available") } else { dim("not available") }
    );
    println!("Preference:   {:?}", config.device);
    match TesseractFactory::new(config.tesseract_binary.clone()).version() {
        Ok(v) => println!("Engine:       {v}"),
        Err(e) => println!("Engine:       {} ({e})", red("unavailable")),
    }
    println!("Model:        {}", config.model_id());
    println!("Model root:   {}", config.model_root.display());
}

async fn run_models(converter: &Converter, action: &ModelsAction, quiet: bool) -> Result<()> {
    match action {
        ModelsAction::Status => {
            for id in converter.models().model_ids() {
                let status = converter.models().status(&id)?;
                if status.ready {
                    println!("{} {id}", green("✓"));
                } else {
                    println!(
                        "{} {id}  {}",
                        dim("·"),
                        dim(&format!("missing: {}", status.missing.join(", ")))
                    );
                }
            }
        }
        ModelsAction::Download => {
            let id = converter.config().model_id();
            let bar = if quiet {
                None
            } else {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner())
                        .tick_strings(SPINNER_TICKS),
                );
                bar.set_prefix(id.clone());
                bar.set_message("checking…");
                bar.enable_steady_tick(Duration::from_millis(80));
                Some(bar)
            };
            let notify = bar.clone();
            let artifacts = converter
                .models()
                .ensure_ready(&id, &move |_: &str| {
                    if let Some(ref b) = notify {
                        b.set_message("downloading…");
                    }
                })
                .await
                .with_context(|| format!("Failed to provision model {id}"))?;
            if let Some(bar) = bar {
                bar.finish_and_clear();
            }
            if !quiet {
                eprintln!(
                    "{} {id}  →  {}",
                    green("✓"),
                    bold(&artifacts.dir.display().to_string())
                );
            }
        }
    }
    Ok(())
}

fn run_cache(config: &PipelineConfig, action: &CacheAction) -> Result<()> {
    let Some(dir) = config.cache_dir.as_ref() else {
        println!("Conversion cache is disabled.");
        return Ok(());
    };
    let cache = docnorm::ConversionCache::new(dir);
    match action {
        CacheAction::Stats => {
            let stats = cache.stats();
            println!("Directory:  {}", dir.display());
            println!("Entries:    {}", stats.entries);
            println!("Size:       {} bytes", stats.total_bytes);
        }
        CacheAction::Clear => {
            let removed = cache.clear();
            println!("Removed {removed} cache entr{}", if removed == 1 { "y" } else { "ies" });
        }
    }
    Ok(())
}
