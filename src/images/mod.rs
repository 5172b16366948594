// OS image cache and download management
//
// Each filename has at most one transfer in flight. The transfer task is the
// only writer of its `DownloadTask`; everyone else (the progress endpoint,
// flash sessions waiting on the image) holds a `watch` receiver on the same
// channel and therefore sees the same sequence of states.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ConsoleError, Result};
use crate::models::{DownloadStatus, DownloadTask, OsImage};
use crate::task::lock;

pub mod source;
pub mod verify;

pub use source::{HttpImageSource, ImageBody, ImageSource};

const PARTIAL_SUFFIX: &str = ".download";
const IMAGE_SUFFIX: &str = ".zip";

/// Result of asking for an image.
#[derive(Debug)]
pub enum StartOutcome {
    /// A complete copy is already cached; nothing was transferred.
    AlreadyExists,
    /// A new transfer was started.
    Started(watch::Receiver<DownloadTask>),
    /// A transfer for the same filename was already running.
    Attached(watch::Receiver<DownloadTask>),
}

impl StartOutcome {
    pub fn already_exists(&self) -> bool {
        matches!(self, StartOutcome::AlreadyExists)
    }

    pub fn snapshot(&self) -> Option<DownloadTask> {
        match self {
            StartOutcome::AlreadyExists => None,
            StartOutcome::Started(rx) | StartOutcome::Attached(rx) => Some(rx.borrow().clone()),
        }
    }
}

/// Only plain `.zip` names inside the cache directory are accepted.
pub fn validate_filename(filename: &str) -> Result<()> {
    let valid = !filename.is_empty()
        && !filename.starts_with('.')
        && !filename.contains(['/', '\\', '\0'])
        && !filename.contains("..")
        && filename.ends_with(IMAGE_SUFFIX);

    if valid {
        Ok(())
    } else {
        Err(ConsoleError::Validation(format!("Invalid image file name: {filename}")))
    }
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) * 100) / total).min(99) as u8
}

struct Inner {
    cache_dir: PathBuf,
    source: Arc<dyn ImageSource>,
    /// Expected hash per filename
    checksums: HashMap<String, String>,
    stall_timeout: Duration,
    tasks: Mutex<HashMap<String, Arc<watch::Sender<DownloadTask>>>>,
    leases: Mutex<HashMap<String, usize>>,
}

impl Inner {
    fn image_path(&self, filename: &str) -> PathBuf {
        self.cache_dir.join(filename)
    }

    fn partial_path(&self, filename: &str) -> PathBuf {
        self.cache_dir.join(format!("{filename}{PARTIAL_SUFFIX}"))
    }

    fn is_cached(&self, filename: &str) -> bool {
        validate_filename(filename).is_ok()
            && fs::metadata(self.image_path(filename))
                .map(|m| m.is_file() && m.len() > 0)
                .unwrap_or(false)
    }
}

/// Cache of downloaded OS images. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ImageDownloadManager {
    inner: Arc<Inner>,
}

impl ImageDownloadManager {
    pub fn new(cache_dir: impl Into<PathBuf>, source: Arc<dyn ImageSource>, stall_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache_dir: cache_dir.into(),
                source,
                checksums: HashMap::new(),
                stall_timeout,
                tasks: Mutex::new(HashMap::new()),
                leases: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Require downloads of `filename` to hash to `sha256`.
    pub fn with_checksum(self, filename: impl Into<String>, sha256: impl Into<String>) -> Self {
        let mut inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(shared) => {
                warn!("Checksum configured on a shared image manager; ignoring");
                return Self { inner: shared };
            }
        };
        inner.checksums.insert(filename.into(), sha256.into().to_lowercase());
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }

    pub fn image_path(&self, filename: &str) -> PathBuf {
        self.inner.image_path(filename)
    }

    pub fn is_cached(&self, filename: &str) -> bool {
        self.inner.is_cached(filename)
    }

    /// Start a transfer of `filename`, or attach to the one in flight, or do
    /// nothing when the image is already cached.
    pub fn start_download(&self, filename: &str) -> Result<StartOutcome> {
        validate_filename(filename)?;

        let mut tasks = lock(&self.inner.tasks);
        if let Some(tx) = tasks.get(filename) {
            if tx.borrow().is_active() {
                info!("Attaching to running download of {}", filename);
                return Ok(StartOutcome::Attached(tx.subscribe()));
            }
        }

        if self.inner.is_cached(filename) {
            debug!("{} already cached, skipping download", filename);
            return Ok(StartOutcome::AlreadyExists);
        }

        let url = self.inner.source.locate(filename)?;
        fs::create_dir_all(&self.inner.cache_dir).map_err(|e| {
            ConsoleError::Transfer(format!("Failed to create cache directory: {}", e))
        })?;

        let (tx, rx) = watch::channel(DownloadTask::new(filename));
        let tx = Arc::new(tx);
        tasks.insert(filename.to_string(), Arc::clone(&tx));
        drop(tasks);

        info!("Starting download of {} from {}", filename, url);
        tokio::spawn(run_transfer(
            Arc::clone(&self.inner),
            filename.to_string(),
            tx,
        ));

        Ok(StartOutcome::Started(rx))
    }

    /// Snapshot of every known task, keyed by filename.
    pub fn progress(&self) -> BTreeMap<String, DownloadTask> {
        lock(&self.inner.tasks)
            .iter()
            .map(|(name, tx)| (name.clone(), tx.borrow().clone()))
            .collect()
    }

    pub fn task(&self, filename: &str) -> Option<DownloadTask> {
        lock(&self.inner.tasks)
            .get(filename)
            .map(|tx| tx.borrow().clone())
    }

    /// Cached images, newest first.
    pub fn list(&self) -> Result<Vec<OsImage>> {
        let dir = &self.inner.cache_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut images = Vec::new();
        for entry in fs::read_dir(dir)?.flatten() {
            let metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let filename = entry.file_name().to_string_lossy().to_string();
            if !filename.ends_with(IMAGE_SUFFIX) {
                continue;
            }
            let modified: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            images.push(OsImage {
                filename,
                size: metadata.len(),
                modified,
            });
        }

        images.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        Ok(images)
    }

    /// Remove a cached image. Refused while the file is being downloaded or
    /// is held by a flash session.
    pub fn delete(&self, filename: &str) -> Result<()> {
        validate_filename(filename)?;

        let mut tasks = lock(&self.inner.tasks);
        if tasks.get(filename).is_some_and(|tx| tx.borrow().is_active()) {
            return Err(ConsoleError::StateConflict(format!(
                "Download of {filename} is in progress"
            )));
        }

        let leases = lock(&self.inner.leases);
        if leases.get(filename).copied().unwrap_or(0) > 0 {
            return Err(ConsoleError::StateConflict(format!(
                "{filename} is in use by a flash session"
            )));
        }

        let path = self.inner.image_path(filename);
        if !path.exists() {
            return Err(ConsoleError::NotFound("File not found".to_string()));
        }
        if !path.is_file() {
            return Err(ConsoleError::Validation("Not a file".to_string()));
        }

        fs::remove_file(&path)?;
        tasks.remove(filename);
        info!("Deleted cached image {}", filename);
        Ok(())
    }

    /// Mark a cached image as in use; it cannot be deleted until the lease
    /// is dropped.
    pub fn lease(&self, filename: &str) -> Result<ImageLease> {
        let mut leases = lock(&self.inner.leases);
        if !self.inner.is_cached(filename) {
            return Err(ConsoleError::NotFound(format!(
                "OS image {filename} is not cached"
            )));
        }
        *leases.entry(filename.to_string()).or_insert(0) += 1;
        Ok(ImageLease {
            inner: Arc::clone(&self.inner),
            filename: filename.to_string(),
            path: self.inner.image_path(filename),
        })
    }

    /// Remove partial transfers left behind by a previous run. Call before
    /// any download is started.
    pub fn clean_partials(&self) -> Result<usize> {
        let dir = &self.inner.cache_dir;
        if !dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in fs::read_dir(dir)?.flatten() {
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().to_string();
            if is_file && name.ends_with(PARTIAL_SUFFIX) {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to remove partial download {}: {}", name, e),
                }
            }
        }
        if removed > 0 {
            info!("Removed {} partial downloads", removed);
        }
        Ok(removed)
    }
}

/// Guard keeping a cached image from being deleted.
#[derive(Debug)]
pub struct ImageLease {
    inner: Arc<Inner>,
    filename: String,
    path: PathBuf,
}

impl ImageLease {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ImageLease {
    fn drop(&mut self) {
        let mut leases = lock(&self.inner.leases);
        if let Some(count) = leases.get_mut(&self.filename) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                leases.remove(&self.filename);
            }
        }
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageDownloadManager")
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

async fn run_transfer(inner: Arc<Inner>, filename: String, tx: Arc<watch::Sender<DownloadTask>>) {
    let temp_path = inner.partial_path(&filename);
    let result = transfer(&inner, &filename, &temp_path, &tx).await;

    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(&temp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove partial file {}: {}", temp_path.display(), e);
            }
        }
    }

    match result {
        Ok(size) => {
            info!("Download of {} completed ({} bytes)", filename, size);
            tx.send_modify(|task| {
                task.status = DownloadStatus::Completed;
                task.progress = 100;
                task.downloaded_bytes = size;
                if task.total_bytes == 0 {
                    task.total_bytes = size;
                }
            });
        }
        Err(e) => {
            error!("Download of {} failed: {}", filename, e);
            tx.send_modify(|task| {
                task.status = DownloadStatus::Error;
                task.error = Some(e.to_string());
            });
        }
    }
}

fn stalled(timeout: Duration) -> ConsoleError {
    ConsoleError::Transfer(format!("Download stalled: no data received for {timeout:?}"))
}

async fn transfer(
    inner: &Inner,
    filename: &str,
    temp_path: &Path,
    tx: &watch::Sender<DownloadTask>,
) -> Result<u64> {
    // A mirror that accepts the connection but never answers counts as stalled too
    let mut body = tokio::time::timeout(inner.stall_timeout, inner.source.fetch(filename))
        .await
        .map_err(|_| stalled(inner.stall_timeout))??;
    let total_size = body.total_bytes.unwrap_or(0);
    tx.send_modify(|task| task.total_bytes = total_size);

    let mut output_file = tokio::fs::File::create(temp_path)
        .await
        .map_err(|e| ConsoleError::Transfer(format!("Failed to create output file: {}", e)))?;
    let mut downloaded = 0u64;

    loop {
        let next = tokio::time::timeout(inner.stall_timeout, body.chunks.next())
            .await
            .map_err(|_| stalled(inner.stall_timeout))?;
        let Some(chunk) = next else { break };
        let chunk = chunk?;

        output_file
            .write_all(&chunk)
            .await
            .map_err(|e| ConsoleError::Transfer(format!("Failed to write chunk: {}", e)))?;

        downloaded += chunk.len() as u64;
        let progress = percent(downloaded, total_size);
        tx.send_modify(|task| {
            task.downloaded_bytes = downloaded;
            task.progress = task.progress.max(progress);
        });
    }

    output_file
        .flush()
        .await
        .map_err(|e| ConsoleError::Transfer(format!("Failed to flush file: {}", e)))?;
    drop(output_file);

    if total_size > 0 && downloaded != total_size {
        return Err(ConsoleError::Transfer(format!(
            "Incomplete download: received {} of {} bytes",
            downloaded, total_size
        )));
    }
    if downloaded == 0 {
        return Err(ConsoleError::Transfer("Downloaded image is empty".to_string()));
    }

    if let Some(expected) = inner.checksums.get(filename).cloned() {
        let path = temp_path.to_path_buf();
        tokio::task::spawn_blocking(move || verify::verify_sha256(&path, &expected))
            .await
            .map_err(|e| ConsoleError::Transfer(format!("Task panicked: {}", e)))??;
    }

    tokio::fs::rename(temp_path, inner.image_path(filename))
        .await
        .map_err(|e| ConsoleError::Transfer(format!("Failed to rename file: {}", e)))?;

    Ok(downloaded)
}
