//! Local file cache, streaming HTTP download and archive extraction for ANSDB.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ansdb-storage";

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("network failure fetching {url}: {message}")]
    Network {
        url: String,
        status: Option<u16>,
        message: String,
    },
    #[error("corrupt archive {}: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },
    #[error("cache io at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AcquisitionError {
    fn io(path: &Path, source: io::Error) -> Self {
        AcquisitionError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn network(url: &str, err: reqwest::Error) -> Self {
        AcquisitionError::Network {
            url: url.to_string(),
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

/// A file available in the local cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    /// True when the path already existed and no request was made.
    pub from_cache: bool,
    /// SHA-256 of the downloaded body; `None` on cache hits.
    pub content_hash: Option<String>,
    pub byte_size: u64,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Filename-keyed download cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
    client: reqwest::Client,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            root: root.into(),
            client,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    /// Return `local_path` if it exists, otherwise stream `url` into it.
    ///
    /// The body is written to a temp file beside the target and renamed into
    /// place once complete, so a partial download is never mistaken for a hit.
    pub async fn ensure(&self, url: &str, local_path: &Path) -> Result<LocalFile, AcquisitionError> {
        if let Some(hit) = cached(local_path).await? {
            info!(path = %local_path.display(), "cache hit");
            return Ok(hit);
        }

        let span = info_span!("http_fetch", url, path = %local_path.display());
        self.download(url, local_path).instrument(span).await
    }

    async fn download(&self, url: &str, local_path: &Path) -> Result<LocalFile, AcquisitionError> {
        let parent = local_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .map_err(|e| AcquisitionError::io(parent, e))?;

        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AcquisitionError::network(url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AcquisitionError::Network {
                url: url.to_string(),
                status: Some(status.as_u16()),
                message: format!("http status {status}"),
            });
        }

        let temp_path = parent.join(format!(".{}.part", Uuid::new_v4()));
        let result = stream_to_file(url, &mut resp, &temp_path).await;
        let (content_hash, byte_size) = match result {
            Ok(done) => done,
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&temp_path, local_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(AcquisitionError::io(local_path, err));
        }

        info!(bytes = byte_size, sha256 = %content_hash, "downloaded");
        Ok(LocalFile {
            path: local_path.to_path_buf(),
            from_cache: false,
            content_hash: Some(content_hash),
            byte_size,
        })
    }

    /// Remove a transient file (typically an archive after extraction).
    pub async fn discard(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path).await {
            warn!(path = %path.display(), error = %err, "could not remove transient file");
        }
    }
}

async fn cached(local_path: &Path) -> Result<Option<LocalFile>, AcquisitionError> {
    match fs::metadata(local_path).await {
        Ok(meta) => Ok(Some(LocalFile {
            path: local_path.to_path_buf(),
            from_cache: true,
            content_hash: None,
            byte_size: meta.len(),
        })),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(AcquisitionError::io(local_path, err)),
    }
}

async fn stream_to_file(
    url: &str,
    resp: &mut reqwest::Response,
    temp_path: &Path,
) -> Result<(String, u64), AcquisitionError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .map_err(|e| AcquisitionError::io(temp_path, e))?;

    let mut hasher = Sha256::new();
    let mut written = 0u64;
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| AcquisitionError::network(url, e))?
    {
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|e| AcquisitionError::io(temp_path, e))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| AcquisitionError::io(temp_path, e))?;

    Ok((hex::encode(hasher.finalize()), written))
}

/// Unpack a zip archive into `dest_dir`, returning the extracted file paths.
pub async fn extract(archive_path: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, AcquisitionError> {
    let archive_path = archive_path.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();
    let join_path = archive_path.clone();
    tokio::task::spawn_blocking(move || extract_blocking(&archive_path, &dest_dir))
        .await
        .map_err(|e| AcquisitionError::Corrupt {
            path: join_path,
            message: format!("extraction task failed: {e}"),
        })?
}

fn extract_blocking(archive_path: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, AcquisitionError> {
    let corrupt = |message: String| AcquisitionError::Corrupt {
        path: archive_path.to_path_buf(),
        message,
    };

    let file = std::fs::File::open(archive_path).map_err(|e| AcquisitionError::io(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;
    std::fs::create_dir_all(dest_dir).map_err(|e| AcquisitionError::io(dest_dir, e))?;

    let mut extracted = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| corrupt(e.to_string()))?;
        let relative = entry
            .enclosed_name()
            .filter(|p| p.components().all(|c| matches!(c, Component::Normal(_))))
            .ok_or_else(|| corrupt(format!("entry {:?} escapes the target directory", entry.name())))?;
        let out_path = dest_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|e| AcquisitionError::io(&out_path, e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AcquisitionError::io(parent, e))?;
        }
        let mut out = std::fs::File::create(&out_path).map_err(|e| AcquisitionError::io(&out_path, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => corrupt(e.to_string()),
            _ => AcquisitionError::io(&out_path, e),
        })?;
        extracted.push(out_path);
    }

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn existing_path_is_returned_without_network() {
        let dir = tempdir().expect("tempdir");
        let cache = FileCache::new(dir.path(), HttpClientConfig::default()).expect("cache");
        let path = cache.path_for("operadoras_ativas.csv");
        std::fs::write(&path, b"registro_ans;cnpj\n").expect("seed");

        // Port 9 (discard) would refuse the connection if a request were made.
        let file = cache
            .ensure("http://127.0.0.1:9/Relatorio_cadop.csv", &path)
            .await
            .expect("cache hit");
        assert!(file.from_cache);
        assert_eq!(file.byte_size, 18);
        assert!(file.content_hash.is_none());
    }

    #[tokio::test]
    async fn transport_failure_is_a_network_error_and_leaves_no_file() {
        let dir = tempdir().expect("tempdir");
        let cache = FileCache::new(dir.path(), HttpClientConfig::default()).expect("cache");
        let path = cache.path_for("1T2024.zip");

        let err = cache
            .ensure("http://127.0.0.1:9/2024/1T2024.zip", &path)
            .await
            .expect_err("connection refused");
        assert!(matches!(err, AcquisitionError::Network { .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn garbage_archive_is_corrupt() {
        let dir = tempdir().expect("tempdir");
        let archive = dir.path().join("1T2024.zip");
        std::fs::write(&archive, b"this is not a zip").expect("write");

        let err = extract(&archive, dir.path()).await.expect_err("corrupt");
        assert!(matches!(err, AcquisitionError::Corrupt { .. }));
    }
}
