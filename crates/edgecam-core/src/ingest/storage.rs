// ── Storage watcher ──
//
// Tracks the combined size of the image and inference directories and
// keeps it under an optional quota by deleting the oldest files. A
// polling task rescans on an interval; between scans, paired frames are
// accounted for through `update_file_size`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreError;

/// Receives the size of every stored frame image.
pub trait StorageUsage: Send + Sync {
    fn update_file_size(&self, path: &Path);
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct WatcherInner {
    dirs: Mutex<Vec<PathBuf>>,
    limit: Option<u64>,
    interval: Duration,
    total: AtomicU64,
    running: Mutex<Option<Running>>,
}

/// Directory usage tracker with optional quota. Cheap to clone.
#[derive(Clone)]
pub struct StorageWatcher {
    inner: Arc<WatcherInner>,
}

impl StorageWatcher {
    pub fn new(limit: Option<u64>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                dirs: Mutex::new(Vec::new()),
                limit,
                interval,
                total: AtomicU64::new(0),
                running: Mutex::new(None),
            }),
        }
    }

    /// Replace the watched directory set. Takes effect at the next scan.
    pub fn set_dirs(&self, dirs: Vec<PathBuf>) {
        *self
            .inner
            .dirs
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = dirs;
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.total.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Start the polling task under a child of `parent`. No-op if running.
    pub fn start(&self, parent: &CancellationToken) {
        let mut running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        let cancel = parent.child_token();
        let watcher = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watcher.inner.interval);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = watcher.scan_once().await {
                            warn!(error = %e, "storage scan failed");
                        }
                    }
                }
            }
            debug!("storage watcher exiting");
        });
        *running = Some(Running { cancel, handle });
        info!(limit = ?self.inner.limit, "storage watcher started");
    }

    /// Stop the polling task and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Running { cancel, handle }) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "storage watcher task panicked");
            }
            info!("storage watcher stopped");
        }
    }

    /// Rescan the watched directories, prune past the quota, and return the
    /// resulting total.
    pub async fn scan_once(&self) -> Result<u64, CoreError> {
        let dirs = self
            .inner
            .dirs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut files = Vec::new();
        for dir in &dirs {
            collect_files(dir, &mut files).await?;
        }
        let mut total: u64 = files.iter().map(|f| f.size).sum();

        if let Some(limit) = self.inner.limit {
            // Oldest first.
            files.sort_by_key(|f| f.modified);
            for file in &files {
                if total <= limit {
                    break;
                }
                match tokio::fs::remove_file(&file.path).await {
                    Ok(()) => {
                        total = total.saturating_sub(file.size);
                        debug!(path = %file.path.display(), "pruned");
                    }
                    Err(e) => warn!(path = %file.path.display(), error = %e, "prune failed"),
                }
            }
        }

        self.inner.total.store(total, Ordering::Release);
        Ok(total)
    }
}

impl StorageUsage for StorageWatcher {
    fn update_file_size(&self, path: &Path) {
        match std::fs::metadata(path) {
            Ok(meta) => {
                self.inner.total.fetch_add(meta.len(), Ordering::AcqRel);
            }
            Err(e) => debug!(path = %path.display(), error = %e, "cannot size file"),
        }
    }
}

struct FileEntry {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

async fn collect_files(dir: &Path, out: &mut Vec<FileEntry>) -> Result<(), CoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CoreError::fs(dir, e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CoreError::fs(dir, e))?
    {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if meta.is_file() {
            out.push(FileEntry {
                path: entry.path(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write_aged(path: &Path, bytes: usize, age_secs: u64) {
        std::fs::write(path, vec![0u8; bytes]).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    #[tokio::test]
    async fn scan_prunes_oldest_over_quota() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir(&images).unwrap();
        write_aged(&images.join("old.jpg"), 100, 300);
        write_aged(&images.join("mid.jpg"), 100, 200);
        write_aged(&images.join("new.jpg"), 100, 100);

        let watcher = StorageWatcher::new(Some(250), Duration::from_secs(60));
        watcher.set_dirs(vec![images.clone()]);

        assert_eq!(watcher.scan_once().await.unwrap(), 200);
        assert!(!images.join("old.jpg").exists());
        assert!(images.join("mid.jpg").exists());
        assert!(images.join("new.jpg").exists());
    }

    #[tokio::test]
    async fn unbounded_watcher_only_measures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"12345").unwrap();

        let watcher = StorageWatcher::new(None, Duration::from_secs(60));
        watcher.set_dirs(vec![dir.path().to_path_buf(), dir.path().join("missing")]);
        assert_eq!(watcher.scan_once().await.unwrap(), 5);
        assert_eq!(watcher.total_bytes(), 5);
    }

    #[tokio::test]
    async fn update_file_size_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("x.jpg");
        std::fs::write(&image, b"123").unwrap();

        let watcher = StorageWatcher::new(None, Duration::from_secs(60));
        watcher.update_file_size(&image);
        watcher.update_file_size(&dir.path().join("absent.jpg"));
        assert_eq!(watcher.total_bytes(), 3);
    }

    #[tokio::test]
    async fn start_and_stop() {
        let watcher = StorageWatcher::new(None, Duration::from_millis(10));
        let root = CancellationToken::new();

        watcher.start(&root);
        assert!(watcher.is_running());

        watcher.stop().await;
        assert!(!watcher.is_running());
        watcher.stop().await;
        assert!(!root.is_cancelled());
    }
}
