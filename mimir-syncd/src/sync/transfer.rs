use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use url::Url;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("target has no file name: {0}")]
    NoFileName(PathBuf),
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Request(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.status().is_some_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }
}

/// Moves raw bytes between content URLs and the local disk.
#[derive(Clone)]
pub struct TransferClient {
    http: Client,
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
    pub timeout: Option<Duration>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 4,
            upload_concurrency: 2,
            timeout: None,
        }
    }
}

impl TransferClient {
    pub fn new() -> Self {
        Self::with_config(TransferConfig::default())
    }

    pub fn with_config(config: TransferConfig) -> Self {
        let http = match config.timeout {
            Some(timeout) => Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            None => Client::new(),
        };
        Self {
            http,
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }

    /// Streams `href` into a hidden sibling of `target` and renames it into place.
    ///
    /// A crash mid-transfer leaves only the hidden partial file behind, never a truncated
    /// `target`.
    pub async fn download_to_path(&self, href: &str, target: &Path) -> Result<u64, TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let url = Url::parse(href)?;
        let response = self.http.get(url).send().await?.error_for_status()?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target)?;
        let written = match write_stream(response, &partial).await {
            Ok(written) => written,
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err);
            }
        };

        tokio::fs::rename(&partial, target).await?;
        Ok(written)
    }

    /// PUTs the file at `source` to a presigned `href`; returns the checksum tag (ETag) the
    /// storage answered with.
    pub async fn upload_from_path(
        &self,
        href: &str,
        source: &Path,
    ) -> Result<Option<String>, TransferError> {
        let _permit = self
            .upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let url = Url::parse(href)?;
        let file = tokio::fs::File::open(source).await?;
        let len = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = self
            .http
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string))
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_stream(response: reqwest::Response, partial: &Path) -> Result<u64, TransferError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

pub fn partial_path(target: &Path) -> Result<PathBuf, TransferError> {
    let name = target
        .file_name()
        .ok_or_else(|| TransferError::NoFileName(target.to_path_buf()))?;
    Ok(target.with_file_name(format!(".{}.partial", name.to_string_lossy())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn downloads_file_to_target_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("out.txt");
        let client = TransferClient::new();

        let written = client
            .download_to_path(&format!("{}/file", server.uri()), &target)
            .await
            .unwrap();

        assert_eq!(written, 5);
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");
        assert!(!partial_path(&target).unwrap().exists());
    }

    #[tokio::test]
    async fn failed_download_leaves_no_target() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("out.txt");
        let client = TransferClient::new();

        let err = client
            .download_to_path(&format!("{}/file", server.uri()), &target)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Request(_)));
        assert!(!target.exists());
        assert!(!partial_path(&target).unwrap().exists());
    }

    #[tokio::test]
    async fn uploads_file_contents_and_returns_etag() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/upload"))
            .and(header("content-type", "application/octet-stream"))
            .and(body_bytes(b"payload"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"etag-1\""))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let source = dir.path().join("in.bin");
        std::fs::write(&source, b"payload").unwrap();

        let client = TransferClient::new();
        let etag = client
            .upload_from_path(&format!("{}/upload", server.uri()), &source)
            .await
            .unwrap();

        assert_eq!(etag.as_deref(), Some("\"etag-1\""));
    }

    #[test]
    fn partial_path_is_hidden_sibling() {
        let partial = partial_path(Path::new("/data/Sunset_Photo")).unwrap();
        assert_eq!(partial, PathBuf::from("/data/.Sunset_Photo.partial"));
    }
}
