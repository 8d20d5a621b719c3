// ── Artifact ingestion pipeline ──
//
// Files uploaded by the device arrive as paths under `<upload_root>/images`
// or `<upload_root>/inferences`. Each is moved into the configured output
// directory, then paired with its counterpart by file stem. A formed pair
// goes to the frame sink exactly once, then to storage accounting, then
// into `last_frame`. Arrival order within a pair does not matter.

mod decode;
mod storage;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::CoreError;
use crate::model::{Artifact, ArtifactKind, DecodedInference, FramePair};
use crate::state::DeviceState;

pub use decode::{FlatcDecoder, InferenceDecoder, get_output_from_inference_results};
pub use storage::{StorageUsage, StorageWatcher};

/// Consumer of paired frames (overlay drawing, display, export).
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn process_frame(&self, image: &Path, inference: &DecodedInference);
}

/// Move `incoming` into `target_dir`, replacing any file of the same name.
/// Creates `target_dir` if needed. Returns the stored path.
pub async fn save_into_input_directory(
    incoming: &Path,
    target_dir: &Path,
) -> Result<PathBuf, CoreError> {
    tokio::fs::create_dir_all(target_dir)
        .await
        .map_err(|e| CoreError::fs(target_dir, e))?;

    let file_name = incoming.file_name().ok_or_else(|| CoreError::Validation {
        message: format!("{} has no file name", incoming.display()),
    })?;
    let stored = target_dir.join(file_name);
    if stored == incoming {
        return Ok(stored);
    }

    match tokio::fs::rename(incoming, &stored).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            copy_across_devices(incoming, &stored, target_dir).await?;
        }
        Err(e) => return Err(CoreError::fs(incoming, e)),
    }
    Ok(stored)
}

// Copy next to the target, then rename over it, so a failed copy never
// clobbers the stored file.
async fn copy_across_devices(
    incoming: &Path,
    stored: &Path,
    target_dir: &Path,
) -> Result<(), CoreError> {
    let staging = tempfile::Builder::new()
        .prefix(".incoming-")
        .tempfile_in(target_dir)
        .map_err(|e| CoreError::fs(target_dir, e))?
        .into_temp_path();

    tokio::fs::copy(incoming, &staging)
        .await
        .map_err(|e| CoreError::fs(incoming, e))?;
    staging
        .persist(stored)
        .map_err(|e| CoreError::fs(stored, e.error))?;
    tokio::fs::remove_file(incoming)
        .await
        .map_err(|e| CoreError::fs(incoming, e))
}

struct Held<T> {
    value: T,
    since: Instant,
}

impl<T> Held<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            since: Instant::now(),
        }
    }
}

#[derive(Default)]
struct Pending {
    images: HashMap<String, Held<PathBuf>>,
    inferences: HashMap<String, Held<DecodedInference>>,
}

impl Pending {
    fn evict_older_than(&mut self, timeout: Duration) {
        self.images.retain(|stem, held| {
            let keep = held.since.elapsed() < timeout;
            if !keep {
                debug!(stem, "dropping unmatched image");
            }
            keep
        });
        self.inferences.retain(|stem, held| {
            let keep = held.since.elapsed() < timeout;
            if !keep {
                debug!(stem, "dropping unmatched inference");
            }
            keep
        });
    }
}

pub struct IngestionPipeline {
    state: Arc<DeviceState>,
    frame_sink: Arc<dyn FrameSink>,
    decoder: Arc<dyn InferenceDecoder>,
    storage: Arc<dyn StorageUsage>,
    pair_timeout: Duration,
    pending: Mutex<Pending>,
}

impl IngestionPipeline {
    pub fn new(
        state: Arc<DeviceState>,
        frame_sink: Arc<dyn FrameSink>,
        decoder: Arc<dyn InferenceDecoder>,
        storage: Arc<dyn StorageUsage>,
        pair_timeout: Duration,
    ) -> Self {
        Self {
            state,
            frame_sink,
            decoder,
            storage,
            pair_timeout,
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Number of (images, inferences) still waiting for their counterpart.
    pub fn pending_counts(&self) -> (usize, usize) {
        let pending = self.lock_pending();
        (pending.images.len(), pending.inferences.len())
    }

    /// Ingest one uploaded file. Returns the pair it completed, if any.
    /// Files outside the known upload directories are ignored. Entries
    /// left unmatched for longer than the pair timeout are dropped first.
    pub async fn process_camera_upload(&self, path: &Path) -> Result<Option<FramePair>, CoreError> {
        self.lock_pending().evict_older_than(self.pair_timeout);

        let Some(artifact) = Artifact::classify(path) else {
            warn!(path = %path.display(), "ignoring upload of unknown kind");
            return Ok(None);
        };

        match artifact.kind {
            ArtifactKind::Image => self.ingest_image(&artifact).await,
            ArtifactKind::Inference => self.ingest_inference(&artifact).await,
        }
    }

    async fn ingest_image(&self, artifact: &Artifact) -> Result<Option<FramePair>, CoreError> {
        let dir = self.state.image_dir.value().ok_or_else(|| CoreError::Config {
            message: "image directory not set".into(),
        })?;
        let stored = save_into_input_directory(&artifact.path, &dir).await?;

        let inference = {
            let mut pending = self.lock_pending();
            match pending.inferences.remove(&artifact.stem) {
                Some(held) => Some(held.value),
                None => {
                    pending
                        .images
                        .insert(artifact.stem.clone(), Held::new(stored.clone()));
                    None
                }
            }
        };

        match inference {
            Some(inference) => Ok(Some(self.pair(stored, inference).await)),
            None => Ok(None),
        }
    }

    async fn ingest_inference(&self, artifact: &Artifact) -> Result<Option<FramePair>, CoreError> {
        let dir = self.state.inference_dir.value().ok_or_else(|| CoreError::Config {
            message: "inference directory not set".into(),
        })?;
        let stored = save_into_input_directory(&artifact.path, &dir).await?;
        let inference = self.decode_inference(&stored).await?;

        let image = {
            let mut pending = self.lock_pending();
            match pending.images.remove(&artifact.stem) {
                Some(held) => Some(held.value),
                None => {
                    pending
                        .inferences
                        .insert(artifact.stem.clone(), Held::new(inference.clone()));
                    None
                }
            }
        };

        match image {
            Some(image) => Ok(Some(self.pair(image, inference).await)),
            None => Ok(None),
        }
    }

    async fn decode_inference(&self, stored: &Path) -> Result<DecodedInference, CoreError> {
        let data = tokio::fs::read(stored)
            .await
            .map_err(|e| CoreError::fs(stored, e))?;
        let output = get_output_from_inference_results(&data);

        match self.state.schema_file.value().flatten() {
            Some(schema) => {
                let decoded = self.decoder.decode(&output, &schema).await?;
                Ok(DecodedInference::Structured(decoded))
            }
            None => Ok(DecodedInference::Raw(output)),
        }
    }

    async fn pair(&self, image: PathBuf, inference: DecodedInference) -> FramePair {
        debug!(image = %image.display(), "frame paired");
        self.frame_sink.process_frame(&image, &inference).await;
        self.storage.update_file_size(&image);

        let frame = FramePair { image, inference };
        self.state.last_frame.aset(frame.clone()).await;
        frame
    }

    /// Ingest paths from `uploads` until it closes or `cancel` fires.
    pub async fn run(self: Arc<Self>, mut uploads: mpsc::Receiver<PathBuf>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = uploads.recv() => match next {
                    Some(path) => {
                        if let Err(e) = self.process_camera_upload(&path).await {
                            error!(path = %path.display(), error = %e, "failed to ingest upload");
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("ingestion consumer exiting");
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
