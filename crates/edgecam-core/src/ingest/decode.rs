//! Inference payload decoding.
//!
//! The device uploads inference results as a JSON envelope whose first
//! entry carries the output tensor as base64 FlatBuffers. Decoding the
//! tensor needs the application's schema and is delegated to an
//! [`InferenceDecoder`]; the default shells out to `flatc`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use tokio::process::Command;

use crate::error::CoreError;

/// Extract the output tensor from an uploaded inference file.
///
/// `{"Inferences": [{"O": "<base64>"}, ...]}` yields the decoded `O` of the
/// first entry. Anything else is returned unchanged.
pub fn get_output_from_inference_results(data: &[u8]) -> Vec<u8> {
    let Ok(doc) = serde_json::from_slice::<Value>(data) else {
        return data.to_vec();
    };
    doc.get("Inferences")
        .and_then(|inferences| inferences.get(0))
        .and_then(|first| first.get("O"))
        .and_then(Value::as_str)
        .and_then(|encoded| BASE64.decode(encoded).ok())
        .unwrap_or_else(|| data.to_vec())
}

/// Decodes an output tensor according to a schema file.
#[async_trait]
pub trait InferenceDecoder: Send + Sync {
    async fn decode(&self, output: &[u8], schema: &Path) -> Result<Value, CoreError>;
}

/// Decoder backed by the FlatBuffers compiler.
#[derive(Debug, Clone)]
pub struct FlatcDecoder {
    program: PathBuf,
}

impl FlatcDecoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FlatcDecoder {
    fn default() -> Self {
        Self::new("flatc")
    }
}

#[async_trait]
impl InferenceDecoder for FlatcDecoder {
    async fn decode(&self, output: &[u8], schema: &Path) -> Result<Value, CoreError> {
        let workdir = tempfile::tempdir().map_err(|e| CoreError::Decode {
            message: format!("cannot create scratch dir: {e}"),
        })?;
        let input = workdir.path().join("output.bin");
        tokio::fs::write(&input, output)
            .await
            .map_err(|e| CoreError::fs(&input, e))?;

        let result = Command::new(&self.program)
            .arg("--json")
            .arg("--strict-json")
            .arg("--defaults-json")
            .arg("-o")
            .arg(workdir.path())
            .arg("--raw-binary")
            .arg(schema)
            .arg("--")
            .arg(&input)
            .output()
            .await
            .map_err(|e| CoreError::Decode {
                message: format!("cannot run {}: {e}", self.program.display()),
            })?;

        if !result.status.success() {
            return Err(CoreError::Decode {
                message: format!(
                    "{} exited with {}: {}",
                    self.program.display(),
                    result.status,
                    String::from_utf8_lossy(&result.stderr).trim()
                ),
            });
        }

        let json_path = workdir.path().join("output.json");
        let text = tokio::fs::read(&json_path)
            .await
            .map_err(|e| CoreError::fs(&json_path, e))?;
        serde_json::from_slice(&text).map_err(|e| CoreError::Decode {
            message: format!("flatc produced invalid JSON: {e}"),
        })
    }
}
