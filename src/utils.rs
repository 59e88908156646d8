use std::path::Path;

use anyhow::{bail, Context};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};

use crate::config::Config;

async fn download_file(url: &str, path: &Path, token: Option<&str>) -> anyhow::Result<()> {
    tracing::info!(%url, path = %path.display(), "downloading model");

    let mut header_map = HeaderMap::new();
    if let Some(token) = token {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .context("GITHUB_TOKEN is not a valid header value")?;
        header_map.insert(AUTHORIZATION, auth_value);
    }
    header_map.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .headers(header_map)
        .send()
        .await
        .with_context(|| format!("failed to request {}", url))?;

    if !response.status().is_success() {
        bail!("failed to download {}: {}", url, response.status());
    }

    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("failed to read body of {}", url))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, &bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;

    tracing::info!(bytes = bytes.len(), "model downloaded");
    Ok(())
}

/// Makes sure the model file is on disk, fetching it from `MODEL_URL` when it is not.
pub async fn ensure_model_exists(config: &Config) -> anyhow::Result<()> {
    tracing::info!(path = %config.model_path.display(), "checking model");
    if config.model_path.exists() {
        return Ok(());
    }

    match &config.model_url {
        Some(url) => {
            download_file(url, &config.model_path, config.download_token.as_deref()).await
        }
        None => bail!(
            "model file {} not found and MODEL_URL is not set",
            config.model_path.display()
        ),
    }
}
