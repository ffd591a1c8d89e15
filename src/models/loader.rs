//! Locating UNet files on disk.

use std::path::{Path, PathBuf};

use crate::error::{AotError, Result};
use crate::weights::{UNET_MODEL_KEY, UNET_WEIGHTS_KEY};

use super::registry::{create_safe_name, ModelSpec};

/// Files that must be present for the UNet to load.
pub const REQUIRED_UNET_FILES: &[&str] = &[UNET_MODEL_KEY];

/// Files fetched when available; large exports keep tensors here.
pub const OPTIONAL_UNET_FILES: &[&str] = &[UNET_WEIGHTS_KEY];

/// Checks that every required UNet file exists below `model_dir`.
///
/// Returns an error listing the missing files.
pub fn check_unet(model_dir: &Path) -> Result<()> {
    let missing: Vec<&str> = REQUIRED_UNET_FILES
        .iter()
        .copied()
        .filter(|file| !model_dir.join(file).exists())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(AotError::model_not_found(format!(
            "Missing model files in {}: {}",
            model_dir.display(),
            missing.join(", ")
        )))
    }
}

/// Directory holding the files of `spec` below the model root.
pub fn model_dir_for(root: &Path, spec: &ModelSpec) -> PathBuf {
    root.join(create_safe_name(&spec.id, ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_files_listed() {
        let dir = TempDir::new().unwrap();
        let err = check_unet(dir.path()).unwrap_err();
        assert!(err.message.contains("unet/model.onnx"));

        std::fs::create_dir_all(dir.path().join("unet")).unwrap();
        std::fs::write(dir.path().join(UNET_MODEL_KEY), b"graph").unwrap();
        assert!(check_unet(dir.path()).is_ok());
    }

    #[test]
    fn model_dir_uses_safe_name() {
        let spec = ModelSpec::resolve("CompVis/stable-diffusion-v1-4");
        let dir = model_dir_for(Path::new("/models"), &spec);
        assert_eq!(dir, PathBuf::from("/models/stable_diffusion_v1_4"));
    }
}
