//! Network parameter blobs and their storage.
//!
//! The UNet is carried as named byte blobs (`unet/model.onnx` plus an
//! optional `unet/weights.pb` external-data file). Blobs are either embedded
//! in the artifact or written to a separate safetensors archive, addressed
//! by storage names produced by [`NameMapper`].

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use safetensors::tensor::{Dtype, SafeTensors, View};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{AotError, Result};

/// Parameter key of the UNet graph.
pub const UNET_MODEL_KEY: &str = "unet/model.onnx";

/// Parameter key of the UNet external-data file.
pub const UNET_WEIGHTS_KEY: &str = "unet/weights.pb";

/// Metadata tag identifying external weight archives written by this tool.
const WEIGHTS_FORMAT_TAG: &str = "sd-scheduler-aot/weights-v1";

/// Blob keys a network may carry. Keys double as relative file paths.
pub const PARAMETER_KEYS: [&str; 2] = [UNET_MODEL_KEY, UNET_WEIGHTS_KEY];

/// Maps parameter keys to flat storage names.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameMapper;

impl NameMapper {
    pub fn new() -> Self {
        Self
    }

    /// `unet/model.onnx` becomes `unet.model_onnx`.
    pub fn storage_name(&self, key: &str) -> String {
        key.replace('.', "_").replace('/', ".")
    }
}

/// Rejects entries whose key is not one of [`PARAMETER_KEYS`].
pub(crate) fn check_entries(entries: &[ParameterEntry]) -> Result<()> {
    match entries
        .iter()
        .find(|entry| !PARAMETER_KEYS.contains(&entry.key.as_str()))
    {
        Some(entry) => Err(AotError::artifact_invalid(format!(
            "unexpected parameter key '{}'",
            entry.key
        ))),
        None => Ok(()),
    }
}

/// Size and fingerprint of one blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterEntry {
    pub key: String,
    pub storage_name: String,
    pub size: usize,
    pub sha256: String,
}

/// Named network parameter blobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkParameters {
    blobs: BTreeMap<String, Vec<u8>>,
}

impl NetworkParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, data: Vec<u8>) {
        self.blobs.insert(key.into(), data);
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.blobs.get(key).map(Vec::as_slice)
    }

    /// Total size of all blobs in bytes.
    pub fn total_bytes(&self) -> usize {
        self.blobs.values().map(Vec::len).sum()
    }

    /// Reads the UNet blobs from a model directory.
    ///
    /// `unet/model.onnx` is required; `unet/weights.pb` is read when present.
    pub fn load_unet(model_dir: &Path) -> Result<Self> {
        let mut params = Self::new();
        for (key, required) in [(UNET_MODEL_KEY, true), (UNET_WEIGHTS_KEY, false)] {
            let path = model_dir.join(key);
            if !path.exists() {
                if required {
                    return Err(AotError::model_not_found(format!(
                        "{} does not exist",
                        path.display()
                    )));
                }
                continue;
            }
            let data = std::fs::read(&path)
                .map_err(|e| AotError::io(format!("Failed to read {}", path.display()), e))?;
            debug!(key, bytes = data.len(), "Loaded parameter blob");
            params.insert(key, data);
        }
        Ok(params)
    }

    /// Describes every blob with its storage name and fingerprint.
    pub fn entries(&self, mapper: &NameMapper) -> Vec<ParameterEntry> {
        self.blobs
            .iter()
            .map(|(key, data)| ParameterEntry {
                key: key.clone(),
                storage_name: mapper.storage_name(key),
                size: data.len(),
                sha256: fingerprint(data),
            })
            .collect()
    }

    /// Borrowing views of every blob keyed by storage name.
    pub(crate) fn views<'a>(&'a self, entries: &[ParameterEntry]) -> Result<Vec<(String, BlobView<'a>)>> {
        entries
            .iter()
            .map(|entry| {
                let data = self.get(&entry.key).ok_or_else(|| {
                    AotError::compile_failed(format!("parameter '{}' is missing", entry.key))
                })?;
                Ok((entry.storage_name.clone(), BlobView::new(data)))
            })
            .collect()
    }

    /// Rebuilds blobs from a safetensors container and checks fingerprints.
    pub(crate) fn from_container(container: &SafeTensors<'_>, entries: &[ParameterEntry]) -> Result<Self> {
        check_entries(entries)?;
        let mut params = Self::new();
        for entry in entries {
            let view = container.tensor(&entry.storage_name).map_err(|e| {
                AotError::artifact_invalid(format!(
                    "parameter '{}' not found: {}",
                    entry.storage_name, e
                ))
            })?;
            let data = view.data().to_vec();
            verify(entry, &data)?;
            params.insert(entry.key.clone(), data);
        }
        Ok(params)
    }

    /// Writes every blob to `dir` under its key as a relative path.
    pub fn materialize(&self, dir: &Path) -> Result<()> {
        for (key, data) in &self.blobs {
            if !PARAMETER_KEYS.contains(&key.as_str()) {
                return Err(AotError::artifact_invalid(format!(
                    "refusing to write parameter '{}'",
                    key
                )));
            }
            let path = dir.join(key);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AotError::io(format!("Failed to create {}", parent.display()), e)
                })?;
            }
            std::fs::write(&path, data)
                .map_err(|e| AotError::io(format!("Failed to write {}", path.display()), e))?;
        }
        Ok(())
    }
}

/// Lowercase hex SHA256 of a blob.
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn verify(entry: &ParameterEntry, data: &[u8]) -> Result<()> {
    if data.len() != entry.size {
        return Err(AotError::artifact_invalid(format!(
            "parameter '{}' has {} bytes, expected {}",
            entry.key,
            data.len(),
            entry.size
        )));
    }
    let actual = fingerprint(data);
    if actual != entry.sha256 {
        return Err(AotError::artifact_invalid(format!(
            "parameter '{}' fingerprint mismatch (expected {}, got {})",
            entry.key, entry.sha256, actual
        )));
    }
    Ok(())
}

/// Raw byte blob exposed to safetensors as a rank-1 `U8` tensor.
pub(crate) struct BlobView<'a> {
    data: &'a [u8],
    shape: [usize; 1],
}

impl<'a> BlobView<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            shape: [data.len()],
        }
    }
}

impl View for BlobView<'_> {
    fn dtype(&self) -> Dtype {
        Dtype::U8
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Writes the parameters to an external safetensors archive.
///
/// Returns the entries recorded in the archive metadata.
pub fn write_external(path: &Path, params: &NetworkParameters, mapper: &NameMapper) -> Result<Vec<ParameterEntry>> {
    let entries = params.entries(mapper);
    let views = params.views(&entries)?;

    let entries_json = serde_json::to_string(&entries)
        .map_err(|e| AotError::compile_failed(format!("failed to encode weight index: {}", e)))?;
    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), WEIGHTS_FORMAT_TAG.to_string());
    metadata.insert("parameters".to_string(), entries_json);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AotError::io(format!("Failed to create {}", parent.display()), e))?;
        }
    }
    safetensors::tensor::serialize_to_file(views, &Some(metadata), path).map_err(|e| {
        AotError::compile_failed(format!(
            "failed to write external weights {}: {}",
            path.display(),
            e
        ))
    })?;

    info!(
        path = %path.display(),
        bytes = params.total_bytes(),
        "Wrote external weights"
    );
    Ok(entries)
}

/// Reads the blobs listed in `entries` from an external archive.
pub fn read_external(path: &Path, entries: &[ParameterEntry]) -> Result<NetworkParameters> {
    let bytes = std::fs::read(path).map_err(|e| {
        AotError::with_source(
            crate::error::ErrorCode::ArtifactInvalid,
            format!("Failed to read external weights {}: {}", path.display(), e),
            e,
        )
    })?;
    let container = SafeTensors::deserialize(&bytes).map_err(|e| {
        AotError::artifact_invalid(format!("{} is not a weights archive: {}", path.display(), e))
    })?;
    NetworkParameters::from_container(&container, entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_params() -> NetworkParameters {
        let mut params = NetworkParameters::new();
        params.insert(UNET_MODEL_KEY, b"onnx-graph-bytes".to_vec());
        params.insert(UNET_WEIGHTS_KEY, vec![7u8; 64]);
        params
    }

    #[test]
    fn storage_names() {
        let mapper = NameMapper::new();
        assert_eq!(mapper.storage_name("unet/model.onnx"), "unet.model_onnx");
        assert_eq!(mapper.storage_name("unet/weights.pb"), "unet.weights_pb");
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn external_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weights").join("sd.safetensors");
        let params = sample_params();

        let entries = write_external(&path, &params, &NameMapper::new()).unwrap();
        assert_eq!(entries.len(), 2);

        let back = read_external(&path, &entries).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn tampered_fingerprint_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sd.safetensors");
        let params = sample_params();

        let mut entries = write_external(&path, &params, &NameMapper::new()).unwrap();
        entries[0].sha256 = fingerprint(b"something else");
        let err = read_external(&path, &entries).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ArtifactInvalid);
    }

    #[test]
    fn load_unet_requires_graph() {
        let dir = TempDir::new().unwrap();
        let err = NetworkParameters::load_unet(dir.path()).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ModelNotFound);

        std::fs::create_dir_all(dir.path().join("unet")).unwrap();
        std::fs::write(dir.path().join(UNET_MODEL_KEY), b"graph").unwrap();
        let params = NetworkParameters::load_unet(dir.path()).unwrap();
        assert_eq!(params.get(UNET_MODEL_KEY), Some(&b"graph"[..]));
        assert!(params.get(UNET_WEIGHTS_KEY).is_none());
    }

    #[test]
    fn materialize_preserves_layout() {
        let dir = TempDir::new().unwrap();
        sample_params().materialize(dir.path()).unwrap();
        assert_eq!(
            std::fs::read(dir.path().join(UNET_MODEL_KEY)).unwrap(),
            b"onnx-graph-bytes"
        );
        assert!(dir.path().join(UNET_WEIGHTS_KEY).exists());
    }

    #[test]
    fn foreign_keys_never_reach_disk() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        let escaped = dir.path().join("escaped.txt");
        let mut params = NetworkParameters::new();
        params.insert(escaped.to_string_lossy().to_string(), b"payload".to_vec());
        params.insert("../escaped.txt", b"payload".to_vec());

        let err = params.materialize(&scratch).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ArtifactInvalid);
        assert!(!escaped.exists());

        let archive = dir.path().join("sd.safetensors");
        let entries = write_external(&archive, &params, &NameMapper::new()).unwrap();
        let err = read_external(&archive, &entries).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ArtifactInvalid);
    }
}
