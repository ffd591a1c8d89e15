//! UNet downloader.
//!
//! Fetches the ONNX export of a model from the Hugging Face hub when files
//! are not present locally.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{AotError, Result};

use super::loader::{check_unet, OPTIONAL_UNET_FILES, REQUIRED_UNET_FILES};
use super::registry::ModelSpec;

/// Downloads missing UNet files of `spec` into `model_dir`.
///
/// Returns Ok(()) if all required files exist or were downloaded.
pub fn ensure_unet(spec: &ModelSpec, auth_token: Option<&str>, model_dir: &Path) -> Result<()> {
    if check_unet(model_dir).is_ok() {
        debug!(dir = %model_dir.display(), "UNet files present");
        return Ok(());
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(3600))
        .build()
        .map_err(|e| {
            AotError::model_download_failed(format!("Failed to create HTTP client: {}", e))
        })?;

    info!(model = %spec.id, dir = %model_dir.display(), "Downloading UNet (this may take several minutes)");

    for file in REQUIRED_UNET_FILES {
        let dest = model_dir.join(file);
        if !dest.exists() {
            download_file_streaming(&client, &spec.file_url(file), auth_token, &dest)?;
        }
    }

    for file in OPTIONAL_UNET_FILES {
        let dest = model_dir.join(file);
        if dest.exists() {
            continue;
        }
        // Small exports inline their tensors and have no external-data file.
        if let Err(e) = download_file_streaming(&client, &spec.file_url(file), auth_token, &dest) {
            warn!(file, "Optional file not downloaded: {}", e.message);
        }
    }

    check_unet(model_dir)
}

/// Downloads a file in chunks to handle multi-gigabyte weights.
fn download_file_streaming(
    client: &reqwest::blocking::Client,
    url: &str,
    auth_token: Option<&str>,
    dest: &Path,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            AotError::model_download_failed(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let mut request = client.get(url);
    if let Some(token) = auth_token {
        request = request.bearer_auth(token);
    }
    let mut response = request.send().map_err(|e| {
        AotError::model_download_failed(format!("Failed to download {}: {}", url, e))
    })?;

    if !response.status().is_success() {
        return Err(AotError::model_download_failed(format!(
            "HTTP {} for {}",
            response.status(),
            url
        )));
    }

    let total_size = response.content_length().unwrap_or(0);
    let downloaded = stream_to_file(&mut response, dest, total_size, url)?;

    let size_mb = downloaded as f64 / (1024.0 * 1024.0);
    info!(file = %dest.display(), "Downloaded {:.1} MB", size_mb);
    Ok(())
}

/// Copies `reader` into `dest` through a `.part` file that is removed on failure.
fn stream_to_file(reader: &mut impl Read, dest: &Path, total_size: u64, url: &str) -> Result<u64> {
    // Write to a partial file so an interrupted download is not mistaken for a model.
    let partial = dest.with_extension("part");
    let mut file = fs::File::create(&partial).map_err(|e| {
        AotError::model_download_failed(format!(
            "Failed to create file {}: {}",
            partial.display(),
            e
        ))
    })?;

    let copied = copy_with_progress(reader, &mut file, total_size, url);
    drop(file);
    let downloaded = match copied {
        Ok(downloaded) => downloaded,
        Err(e) => {
            if let Err(rm) = fs::remove_file(&partial) {
                warn!(file = %partial.display(), "Failed to remove partial download: {}", rm);
            }
            return Err(e);
        }
    };

    fs::rename(&partial, dest).map_err(|e| {
        AotError::model_download_failed(format!(
            "Failed to move {} into place: {}",
            dest.display(),
            e
        ))
    })?;
    Ok(downloaded)
}

fn copy_with_progress(
    reader: &mut impl Read,
    file: &mut fs::File,
    total_size: u64,
    url: &str,
) -> Result<u64> {
    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; 65536];
    let mut last_progress = 0;

    loop {
        let bytes_read = reader.read(&mut buffer).map_err(|e| {
            AotError::model_download_failed(format!("Failed to read response: {}", e))
        })?;

        if bytes_read == 0 {
            break;
        }

        file.write_all(&buffer[..bytes_read]).map_err(|e| {
            AotError::model_download_failed(format!("Failed to write file: {}", e))
        })?;

        downloaded += bytes_read as u64;

        if total_size > 0 {
            let progress = (downloaded * 100 / total_size) as usize;
            if progress >= last_progress + 10 {
                debug!(url, progress, "Download progress");
                last_progress = progress;
            }
        }
    }
    Ok(downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::UNET_MODEL_KEY;
    use tempfile::TempDir;

    #[test]
    fn ensure_unet_succeeds_when_present() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("unet")).unwrap();
        std::fs::write(dir.path().join(UNET_MODEL_KEY), b"graph").unwrap();

        // No network access happens when the files are already there.
        let spec = ModelSpec::resolve("CompVis/stable-diffusion-v1-4");
        assert!(ensure_unet(&spec, None, dir.path()).is_ok());
    }

    #[test]
    fn required_files_have_urls() {
        let spec = ModelSpec::resolve("CompVis/stable-diffusion-v1-4");
        for file in REQUIRED_UNET_FILES.iter().chain(OPTIONAL_UNET_FILES) {
            assert!(spec.file_url(file).ends_with(file));
        }
    }

    /// Yields `good` bytes, then fails.
    struct BrokenStream {
        good: usize,
    }

    impl Read for BrokenStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.good == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
            }
            let n = self.good.min(buf.len());
            buf[..n].fill(1);
            self.good -= n;
            Ok(n)
        }
    }

    #[test]
    fn interrupted_download_leaves_no_partial_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("weights.pb");

        let err = stream_to_file(&mut BrokenStream { good: 100 }, &dest, 200, "test").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ModelDownloadFailed);
        assert!(!dest.exists());
        assert!(!dest.with_extension("part").exists());
    }

    #[test]
    fn completed_download_is_moved_into_place() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("model.onnx");

        let data = vec![3u8; 1000];
        let n = stream_to_file(&mut data.as_slice(), &dest, 1000, "test").unwrap();
        assert_eq!(n, 1000);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(!dest.with_extension("part").exists());
    }
}
