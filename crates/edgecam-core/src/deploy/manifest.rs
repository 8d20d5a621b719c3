//! Staging a module for download and describing it to the device.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use edgecam_api::webserver::DEPLOY_PATH;

use crate::error::CoreError;
use crate::model::ModuleManifest;

/// Instance and module name used for single-module application deployments.
pub const APPLICATION_NAME: &str = "node";

/// Copy `module_path` into `serve_dir` and build its manifest. The module
/// is served at `<base_url>/deploy/<file name>`.
pub async fn single_module_manifest_setup(
    name: &str,
    module_path: &Path,
    serve_dir: &Path,
    base_url: &str,
) -> Result<ModuleManifest, CoreError> {
    let metadata = tokio::fs::metadata(module_path)
        .await
        .map_err(|e| CoreError::Deployment {
            reason: format!("module {} is not readable: {e}", module_path.display()),
        })?;
    if !metadata.is_file() {
        return Err(CoreError::Deployment {
            reason: format!("module {} is not a file", module_path.display()),
        });
    }

    let file_name = module_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CoreError::Deployment {
            reason: format!("module {} has no usable file name", module_path.display()),
        })?;

    let bytes = tokio::fs::read(module_path)
        .await
        .map_err(|e| CoreError::fs(module_path, e))?;

    tokio::fs::create_dir_all(serve_dir)
        .await
        .map_err(|e| CoreError::fs(serve_dir, e))?;
    let staged: PathBuf = serve_dir.join(file_name);
    tokio::fs::write(&staged, &bytes)
        .await
        .map_err(|e| CoreError::fs(&staged, e))?;

    let hash = format!("{:x}", Sha256::digest(&bytes));
    tracing::debug!(module = %module_path.display(), %hash, "module staged");

    Ok(ModuleManifest {
        name: name.to_string(),
        source: module_path.to_path_buf(),
        download_url: format!("{}/{DEPLOY_PATH}/{file_name}", base_url.trim_end_matches('/')),
        hash,
    })
}
