//! Upload of exported IR files to blob storage.

use std::path::Path;

use tracing::info;

use crate::error::{AotError, Result};

/// Blob path an IR file of `model` is uploaded to.
///
/// `CompVis/stable-diffusion-v1-4` maps to
/// `CompVis-stable-diffusion-v1-4_scheduler/CompVis-stable-diffusion-v1-4_scheduler.mlir`.
pub fn blob_path(model: &str) -> String {
    let name = format!("{}_scheduler", model.replace('/', "-"));
    format!("{}/{}.mlir", name, name)
}

/// Joins a container URL and a blob path, keeping any SAS query string last.
pub fn blob_url(container_url: &str, blob_path: &str) -> String {
    let (base, query) = match container_url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (container_url, None),
    };
    let mut url = format!("{}/{}", base.trim_end_matches('/'), blob_path);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Uploads `file` to `container_url` under `blob_path` with an HTTP PUT.
pub fn upload_to_blob_storage(file: &Path, container_url: &str, blob_path: &str) -> Result<()> {
    let body = std::fs::read(file)
        .map_err(|e| AotError::io(format!("Failed to read {}", file.display()), e))?;
    let url = blob_url(container_url, blob_path);

    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(600))
        .build()
        .map_err(|e| AotError::upload_failed(format!("Failed to create HTTP client: {}", e)))?;

    let response = client
        .put(&url)
        .header("x-ms-blob-type", "BlockBlob")
        .body(body)
        .send()
        .map_err(|e| AotError::upload_failed(format!("PUT {} failed: {}", blob_path, e)))?;

    if !response.status().is_success() {
        return Err(AotError::upload_failed(format!(
            "HTTP {} for {}",
            response.status(),
            blob_path
        )));
    }

    info!(file = %file.display(), blob = blob_path, "Uploaded IR");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_path_from_model() {
        assert_eq!(
            blob_path("CompVis/stable-diffusion-v1-4"),
            "CompVis-stable-diffusion-v1-4_scheduler/CompVis-stable-diffusion-v1-4_scheduler.mlir"
        );
    }

    #[test]
    fn sas_query_stays_at_end() {
        assert_eq!(
            blob_url("https://acct.blob.core.windows.net/tank?sv=1&sig=abc", "a/b.mlir"),
            "https://acct.blob.core.windows.net/tank/a/b.mlir?sv=1&sig=abc"
        );
        assert_eq!(
            blob_url("https://acct.blob.core.windows.net/tank/", "a/b.mlir"),
            "https://acct.blob.core.windows.net/tank/a/b.mlir"
        );
    }

    #[test]
    fn missing_file_fails_before_network() {
        let err = upload_to_blob_storage(
            Path::new("/nonexistent/sched.mlir"),
            "https://example.invalid/tank",
            "a/b.mlir",
        )
        .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::IoFailed);
    }
}
