//! Frame sink that reports paired frames through tracing.

use std::path::Path;

use async_trait::async_trait;

use edgecam_core::{DecodedInference, FrameSink};

pub struct LogSink;

#[async_trait]
impl FrameSink for LogSink {
    async fn process_frame(&self, image: &Path, inference: &DecodedInference) {
        match inference {
            DecodedInference::Structured(value) => {
                tracing::info!(image = %image.display(), inference = %value, "frame");
            }
            DecodedInference::Raw(bytes) => {
                tracing::info!(image = %image.display(), bytes = bytes.len(), "frame (undecoded)");
            }
        }
    }
}
