// ── Uploaded artifacts ──
//
// Images and inference blobs the device uploads, keyed for pairing by
// their file stem.

use std::path::{Path, PathBuf};

use serde_json::Value;
use strum::Display;

use edgecam_api::webserver::{IMAGES_DIR, INFERENCES_DIR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ArtifactKind {
    Image,
    Inference,
}

impl ArtifactKind {
    /// Classify by upload sub-directory name.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        match name {
            IMAGES_DIR => Some(Self::Image),
            INFERENCES_DIR => Some(Self::Inference),
            _ => None,
        }
    }
}

/// An uploaded file awaiting ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    /// Pairing key.
    pub stem: String,
}

impl Artifact {
    /// Classify `path` by its parent directory. `None` for files outside
    /// the known upload directories or without a usable stem.
    pub fn classify(path: &Path) -> Option<Self> {
        let dir = path.parent()?.file_name()?.to_str()?;
        let kind = ArtifactKind::from_dir_name(dir)?;
        let stem = path.file_stem()?.to_str()?.to_string();
        Some(Self {
            path: path.to_path_buf(),
            kind,
            stem,
        })
    }
}

/// Inference payload after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedInference {
    /// Decoded through the application's schema.
    Structured(Value),
    /// No schema configured: the output tensor bytes as uploaded.
    Raw(Vec<u8>),
}

/// A stored image together with its inference.
#[derive(Debug, Clone, PartialEq)]
pub struct FramePair {
    pub image: PathBuf,
    pub inference: DecodedInference,
}
