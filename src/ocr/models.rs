//! On-disk recognition model provisioning.
//!
//! A model lives in `<root>/<model_id>/` and is *present* only when its
//! `model.json` descriptor parses, names exactly the expected files, and
//! every listed file exists with the recorded non-zero size. Anything less
//! (an interrupted download, a deleted weight file) is indistinguishable
//! from "missing" and triggers a fresh download.
//!
//! ## Download protocol
//!
//! ```text
//! ensure_ready(id)
//!   ├─ present? ──────────────────────────────▶ return
//!   └─ lock(id) ─▶ present? ──────────────────▶ return   (another caller won)
//!                  └─ staging dir ─▶ fetch each file serially
//!                                  ─▶ validate + write model.json
//!                                  ─▶ rename staging → <root>/<id>
//! ```
//!
//! The rename is the commit point: a crash at any earlier step leaves only a
//! `.staging-*` directory, which never passes the presence check.

use crate::cache::ContentDigest;
use crate::config::{ModelSource, ModelTier};
use crate::error::DownloadError;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Descriptor file name inside every model directory.
pub const DESCRIPTOR_FILE: &str = "model.json";

/// One weight file a model needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFile {
    pub name: String,
    /// Expected hex SHA-256, when pinned.
    pub sha256: Option<String>,
}

/// Where a model comes from and what it consists of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: String,
    pub base_url: String,
    pub files: Vec<ModelFile>,
}

impl ModelSpec {
    /// Tesseract language data for `languages` from the tier's repository.
    pub fn tessdata(tier: ModelTier, source: ModelSource, languages: &[String]) -> Self {
        let repo = tier.repository();
        Self {
            id: format!("{repo}-{}", languages.join("-")),
            base_url: source.base_url(repo),
            files: languages
                .iter()
                .map(|lang| ModelFile {
                    name: format!("{lang}.traineddata"),
                    sha256: None,
                })
                .collect(),
        }
    }

    fn url_for(&self, file: &ModelFile) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), file.name)
    }
}

/// A provisioned model: its identity, directory and weight files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifactSet {
    pub id: String,
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Descriptor {
    id: String,
    files: Vec<DescriptorFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DescriptorFile {
    name: String,
    size: u64,
    sha256: String,
}

/// Presence report for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStatus {
    pub id: String,
    pub dir: PathBuf,
    pub ready: bool,
    /// Required files absent or inconsistent with the descriptor. Includes
    /// the descriptor itself when it is missing or unreadable.
    pub missing: Vec<String>,
}

// ── Fetcher seam ─────────────────────────────────────────────────────────

/// Downloads one URL to a local file, returning the byte count.
pub trait ArtifactFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<u64, DownloadError>>;
}

/// Streaming HTTP fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("docnorm/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| DownloadError::Network {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client, timeout })
    }

    fn map_err(&self, url: &str, e: reqwest::Error) -> DownloadError {
        if e.is_timeout() {
            DownloadError::Timeout {
                url: url.to_string(),
                secs: self.timeout.as_secs(),
            }
        } else {
            DownloadError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<u64, DownloadError>> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| self.map_err(url, e))?;
            if !response.status().is_success() {
                return Err(DownloadError::Network {
                    url: url.to_string(),
                    reason: format!("HTTP {}", response.status()),
                });
            }

            let io_err = |source| DownloadError::Io {
                path: dest.to_path_buf(),
                source,
            };
            let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
            let mut stream = response.bytes_stream();
            let mut written = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| self.map_err(url, e))?;
                file.write_all(&chunk).await.map_err(io_err)?;
                written += chunk.len() as u64;
            }
            file.flush().await.map_err(io_err)?;
            debug!(url, bytes = written, "artifact downloaded");
            Ok(written)
        })
    }
}

// ── Repository ───────────────────────────────────────────────────────────

/// Ensures model artifacts exist on disk before an engine is built.
pub struct ModelRepository {
    root: PathBuf,
    specs: HashMap<String, ModelSpec>,
    fetcher: Arc<dyn ArtifactFetcher>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    downloads: AtomicUsize,
}

impl ModelRepository {
    pub fn new(root: impl Into<PathBuf>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            root: root.into(),
            specs: HashMap::new(),
            fetcher,
            locks: StdMutex::new(HashMap::new()),
            downloads: AtomicUsize::new(0),
        }
    }

    /// Register the tessdata models of every tier for `languages`.
    pub fn with_tessdata_catalog(mut self, source: ModelSource, languages: &[String]) -> Self {
        for tier in [ModelTier::Lite, ModelTier::Standard, ModelTier::Accuracy] {
            self.register(ModelSpec::tessdata(tier, source, languages));
        }
        self
    }

    pub fn register(&mut self, spec: ModelSpec) {
        self.specs.insert(spec.id.clone(), spec);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.specs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of download sequences started by this repository.
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn spec(&self, model_id: &str) -> Result<&ModelSpec, DownloadError> {
        self.specs
            .get(model_id)
            .ok_or_else(|| DownloadError::UnknownModel(model_id.to_string()))
    }

    fn model_dir(&self, model_id: &str) -> PathBuf {
        self.root.join(model_id)
    }

    /// Presence check without downloading. Blocking; metadata reads only.
    pub fn status(&self, model_id: &str) -> Result<ModelStatus, DownloadError> {
        let spec = self.spec(model_id)?;
        Ok(inspect(spec, &self.model_dir(model_id)))
    }

    /// Return the artifact set for `model_id`, downloading it first if absent.
    ///
    /// `on_download` is called once, under the model lock, right before a
    /// download sequence starts.
    pub async fn ensure_ready(
        &self,
        model_id: &str,
        on_download: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<ModelArtifactSet, DownloadError> {
        let spec = self.spec(model_id)?;
        let dir = self.model_dir(model_id);
        if inspect_blocking(spec, &dir).await.ready {
            return Ok(artifact_set(spec, dir));
        }

        let lock = self.lock_for(model_id);
        let _guard = lock.lock().await;

        let status = inspect_blocking(spec, &dir).await;
        if status.ready {
            debug!(model = model_id, "model provisioned by a concurrent caller");
            return Ok(artifact_set(spec, dir));
        }

        info!(model = model_id, missing = ?status.missing, "downloading model");
        on_download(model_id);
        self.downloads.fetch_add(1, Ordering::SeqCst);

        match self.download(spec, &dir).await {
            Err(DownloadError::Corrupt { detail, .. }) => {
                warn!(model = model_id, %detail, "downloaded model failed validation; retrying once");
                self.download(spec, &dir).await?;
            }
            other => other?,
        }
        info!(model = model_id, dir = %dir.display(), "model ready");
        Ok(artifact_set(spec, dir))
    }

    fn lock_for(&self, model_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(model_id.to_string()).or_default())
    }

    /// One download sequence into a staging directory, committed by rename.
    async fn download(&self, spec: &ModelSpec, dir: &Path) -> Result<(), DownloadError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| DownloadError::Io { path, source }
        };
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(io_err(&self.root))?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)
            .map_err(io_err(&self.root))?;

        let mut entries = Vec::with_capacity(spec.files.len());
        for file in &spec.files {
            let url = spec.url_for(file);
            let dest = staging.path().join(&file.name);
            let size = self.fetcher.fetch(&url, &dest).await?;
            if size == 0 {
                return Err(corrupt(spec, format!("{} is empty", file.name)));
            }
            let digest_path = dest.clone();
            let digest = tokio::task::spawn_blocking(move || ContentDigest::of_file(&digest_path))
                .await
                .map_err(|e| corrupt(spec, e.to_string()))?
                .map_err(io_err(&dest))?;
            if let Some(expected) = &file.sha256 {
                if !expected.eq_ignore_ascii_case(digest.as_str()) {
                    return Err(corrupt(
                        spec,
                        format!("{} sha256 {} != {}", file.name, digest, expected),
                    ));
                }
            }
            entries.push(DescriptorFile {
                name: file.name.clone(),
                size,
                sha256: digest.as_str().to_string(),
            });
        }

        let descriptor = Descriptor {
            id: spec.id.clone(),
            files: entries,
        };
        let json = serde_json::to_vec_pretty(&descriptor).map_err(|e| corrupt(spec, e.to_string()))?;
        let descriptor_path = staging.path().join(DESCRIPTOR_FILE);
        tokio::fs::write(&descriptor_path, json)
            .await
            .map_err(io_err(&descriptor_path))?;

        let staged = inspect_blocking(spec, staging.path()).await;
        if !staged.ready {
            return Err(corrupt(spec, format!("staged model incomplete: {:?}", staged.missing)));
        }

        if tokio::fs::metadata(dir).await.is_ok() {
            tokio::fs::remove_dir_all(dir).await.map_err(io_err(dir))?;
        }
        tokio::fs::rename(staging.path(), dir)
            .await
            .map_err(io_err(dir))?;
        Ok(())
    }
}

fn corrupt(spec: &ModelSpec, detail: String) -> DownloadError {
    DownloadError::Corrupt {
        model: spec.id.clone(),
        detail,
    }
}

fn artifact_set(spec: &ModelSpec, dir: PathBuf) -> ModelArtifactSet {
    ModelArtifactSet {
        id: spec.id.clone(),
        files: spec.files.iter().map(|f| dir.join(&f.name)).collect(),
        dir,
    }
}

/// [`inspect`] on the blocking pool. A failed task reports the model as
/// missing, which leads to a fresh download.
async fn inspect_blocking(spec: &ModelSpec, dir: &Path) -> ModelStatus {
    let (owned_spec, owned_dir) = (spec.clone(), dir.to_path_buf());
    match tokio::task::spawn_blocking(move || inspect(&owned_spec, &owned_dir)).await {
        Ok(status) => status,
        Err(e) => {
            warn!(model = %spec.id, error = %e, "presence check failed");
            ModelStatus {
                id: spec.id.clone(),
                dir: dir.to_path_buf(),
                ready: false,
                missing: vec![DESCRIPTOR_FILE.to_string()],
            }
        }
    }
}

/// Structural presence check of `dir` against `spec`. Blocking, metadata only.
fn inspect(spec: &ModelSpec, dir: &Path) -> ModelStatus {
    let mut missing = Vec::new();
    let descriptor: Option<Descriptor> = std::fs::read(dir.join(DESCRIPTOR_FILE))
        .ok()
        .and_then(|raw| serde_json::from_slice(&raw).ok())
        .filter(|d: &Descriptor| d.id == spec.id);
    if descriptor.is_none() {
        missing.push(DESCRIPTOR_FILE.to_string());
    }

    for file in &spec.files {
        let recorded = descriptor
            .as_ref()
            .and_then(|d| d.files.iter().find(|f| f.name == file.name));
        let on_disk = std::fs::metadata(dir.join(&file.name))
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len());
        let ok = match (on_disk, recorded) {
            (Some(len), Some(rec)) => len > 0 && len == rec.size,
            (Some(len), None) => descriptor.is_none() && len > 0,
            _ => false,
        };
        if !ok {
            missing.push(file.name.clone());
        }
    }

    ModelStatus {
        id: spec.id.clone(),
        dir: dir.to_path_buf(),
        ready: missing.is_empty(),
        missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeFetcher {
        calls: AtomicUsize,
        /// Number of leading calls that write an empty file.
        empty_first: usize,
        fail_network: bool,
    }

    impl ArtifactFetcher for FakeFetcher {
        fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<u64, DownloadError>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                if self.fail_network {
                    return Err(DownloadError::Network {
                        url: url.into(),
                        reason: "connection reset".into(),
                    });
                }
                let body = if n < self.empty_first { Vec::new() } else { url.as_bytes().to_vec() };
                tokio::fs::write(dest, &body).await.unwrap();
                Ok(body.len() as u64)
            })
        }
    }

    fn spec() -> ModelSpec {
        ModelSpec {
            id: "tiny".into(),
            base_url: "https://models.test/repo".into(),
            files: ["a.bin", "b.bin", "c.bin"]
                .iter()
                .map(|n| ModelFile {
                    name: n.to_string(),
                    sha256: None,
                })
                .collect(),
        }
    }

    fn repo(root: &Path, fetcher: Arc<FakeFetcher>) -> ModelRepository {
        let mut repo = ModelRepository::new(root, fetcher);
        repo.register(spec());
        repo
    }

    fn noop(_: &str) {}

    #[tokio::test]
    async fn downloads_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let repo = repo(dir.path(), fetcher.clone());

        assert!(!repo.status("tiny").unwrap().ready);
        let set = repo.ensure_ready("tiny", &noop).await.unwrap();
        assert_eq!(set.files.len(), 3);
        assert!(set.dir.join(DESCRIPTOR_FILE).is_file());
        assert!(repo.status("tiny").unwrap().ready);

        repo.ensure_ready("tiny", &noop).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(repo.download_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_download_once() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let repo = Arc::new(repo(dir.path(), fetcher.clone()));

        let (a, b) = tokio::join!(
            repo.ensure_ready("tiny", &noop),
            repo.ensure_ready("tiny", &noop)
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(repo.download_count(), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn model_on_disk_is_reused_by_a_fresh_repository() {
        let dir = tempfile::tempdir().unwrap();
        repo(dir.path(), Arc::new(FakeFetcher::default()))
            .ensure_ready("tiny", &noop)
            .await
            .unwrap();

        let fetcher = Arc::new(FakeFetcher::default());
        let fresh = repo(dir.path(), fetcher.clone());
        let status = inspect_blocking(&spec(), &dir.path().join("tiny")).await;
        assert!(status.ready, "{:?}", status.missing);
        fresh.ensure_ready("tiny", &noop).await.unwrap();
        assert_eq!(fresh.download_count(), 0);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn partial_directory_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let repo = repo(dir.path(), fetcher.clone());
        repo.ensure_ready("tiny", &noop).await.unwrap();

        std::fs::remove_file(dir.path().join("tiny").join("c.bin")).unwrap();
        let status = repo.status("tiny").unwrap();
        assert!(!status.ready);
        assert_eq!(status.missing, vec!["c.bin".to_string()]);

        repo.ensure_ready("tiny", &noop).await.unwrap();
        assert_eq!(repo.download_count(), 2);
        assert!(repo.status("tiny").unwrap().ready);
    }

    #[tokio::test]
    async fn corrupt_download_is_retried_once() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher {
            empty_first: 1,
            ..Default::default()
        });
        let repo = repo(dir.path(), fetcher.clone());
        repo.ensure_ready("tiny", &noop).await.unwrap();
        // first sequence aborted after its first (empty) file, second fetched all three
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn persistent_corruption_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher {
            empty_first: usize::MAX,
            ..Default::default()
        });
        let repo = repo(dir.path(), fetcher);
        let err = repo.ensure_ready("tiny", &noop).await.unwrap_err();
        assert!(matches!(err, DownloadError::Corrupt { .. }));
        assert!(!err.is_retryable());
        assert!(!repo.status("tiny").unwrap().ready);
    }

    #[tokio::test]
    async fn network_errors_are_not_retried_internally() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher {
            fail_network: true,
            ..Default::default()
        });
        let repo = repo(dir.path(), fetcher.clone());
        let err = repo.ensure_ready("tiny", &noop).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        // no staging leftovers pass as a model
        assert!(!dir.path().join("tiny").exists());
    }

    #[tokio::test]
    async fn unknown_model() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path(), Arc::new(FakeFetcher::default()));
        assert!(matches!(
            repo.ensure_ready("nope", &noop).await,
            Err(DownloadError::UnknownModel(_))
        ));
    }

    #[test]
    fn tessdata_spec_layout() {
        let spec = ModelSpec::tessdata(
            ModelTier::Accuracy,
            ModelSource::Mirror,
            &["eng".to_string(), "deu".to_string()],
        );
        assert_eq!(spec.id, "tessdata_best-eng-deu");
        assert_eq!(
            spec.url_for(&spec.files[1]),
            "https://cdn.jsdelivr.net/gh/tesseract-ocr/tessdata_best@main/deu.traineddata"
        );
    }
}
