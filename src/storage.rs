use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use tracing::{info, warn};
use url::Url;

use crate::config::CONFIG;
use crate::utils::http::get_http_client;

/// Where an uploaded object ended up: the hosted bucket's public URL, or
/// a file under the local fallback directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredObject {
    Url(String),
    LocalPath(PathBuf),
}

impl StoredObject {
    pub fn describe(&self) -> String {
        match self {
            StoredObject::Url(url) => url.clone(),
            StoredObject::LocalPath(path) => path.display().to_string(),
        }
    }
}

fn remote_storage_configured() -> bool {
    !CONFIG.supabase_url.trim().is_empty() && !CONFIG.supabase_key.trim().is_empty()
}

fn object_endpoint(base: &str, bucket: &str, object_path: &str) -> Result<String> {
    let base = Url::parse(base.trim_end_matches('/'))?;
    let joined = base.join(&format!("/storage/v1/object/{bucket}/{object_path}"))?;
    Ok(joined.to_string())
}

fn public_object_url(base: &str, bucket: &str, object_path: &str) -> Result<String> {
    let base = Url::parse(base.trim_end_matches('/'))?;
    let joined = base.join(&format!("/storage/v1/object/public/{bucket}/{object_path}"))?;
    Ok(joined.to_string())
}

async fn upload_remote(bucket: &str, object_path: &str, data: &[u8]) -> Result<String> {
    let endpoint = object_endpoint(&CONFIG.supabase_url, bucket, object_path)?;
    let content_type = infer::get(data)
        .map(|kind| kind.mime_type())
        .unwrap_or("application/octet-stream");

    let response = get_http_client()
        .post(&endpoint)
        .bearer_auth(CONFIG.supabase_key.trim())
        .header("apikey", CONFIG.supabase_key.trim())
        .header("content-type", content_type)
        .body(data.to_vec())
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("storage upload failed with status {status}: {body}"));
    }

    public_object_url(&CONFIG.supabase_url, bucket, object_path)
}

/// Objects land in a flat directory; the object path keeps its identity
/// by folding separators into the file name, as `images/7_17.png` becomes
/// `images_7_17.png`.
async fn save_local(dir: &Path, object_path: &str, data: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let file_name = object_path.replace('/', "_");
    let local_path = dir.join(file_name);
    tokio::fs::write(&local_path, data).await?;
    Ok(local_path)
}

/// Uploads to the hosted bucket when one is configured, otherwise (or on
/// any upload failure) writes under the local fallback directory.
pub async fn upload_bytes(bucket: &str, object_path: &str, data: &[u8]) -> Result<StoredObject> {
    if remote_storage_configured() {
        match upload_remote(bucket, object_path, data).await {
            Ok(url) => {
                info!("Uploaded {object_path} to bucket {bucket}");
                return Ok(StoredObject::Url(url));
            }
            Err(err) => {
                warn!("Storage upload failed, falling back to local file: {err}");
            }
        }
    }

    let path = save_local(Path::new(&CONFIG.local_storage_dir), object_path, data).await?;
    Ok(StoredObject::LocalPath(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_url_includes_bucket_and_object_path() {
        let url = public_object_url("https://abc.supabase.co", "generated", "images/7_17.png")
            .unwrap();
        assert_eq!(
            url,
            "https://abc.supabase.co/storage/v1/object/public/generated/images/7_17.png"
        );
    }

    #[test]
    fn trailing_slash_on_base_url_is_tolerated() {
        let url = object_endpoint("https://abc.supabase.co/", "generated", "a.png").unwrap();
        assert_eq!(url, "https://abc.supabase.co/storage/v1/object/generated/a.png");
    }

    #[tokio::test]
    async fn local_fallback_flattens_the_object_path() {
        let dir = std::env::temp_dir().join("gen_bot_storage_test");
        let saved = save_local(&dir, "images/1_2.png", b"png-bytes").await.unwrap();
        assert_eq!(saved, dir.join("images_1_2.png"));
        let content = tokio::fs::read(&saved).await.unwrap();
        assert_eq!(content, b"png-bytes");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
