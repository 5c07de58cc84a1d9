use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::{header, Body, Client};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use super::destination::UploadDestination;
use super::progress::ProgressSink;
use crate::media::ByteSource;

/// Chunk size used when streaming in-memory payloads
const MEMORY_CHUNK_SIZE: usize = 64 * 1024;

/// Transfer failures, each with its own remedy
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Upload failed due to a network error: {message}")]
    Network { message: String },

    #[error("Upload failed with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Could not read {path}: {message}")]
    Source { path: String, message: String },
}

/// Everything a transport needs for one object write
pub struct TransferRequest<'a> {
    pub source: &'a ByteSource,
    pub destination: &'a UploadDestination,
    pub content_type: &'a str,
    pub content_length: u64,
    pub access_token: &'a str,
}

/// Writes one object to storage under a bearer token
#[async_trait]
pub trait StorageTransport: Send + Sync {
    async fn put_object(&self, request: TransferRequest<'_>, progress: ProgressSink) -> Result<(), TransportError>;
}

#[derive(Debug, Deserialize)]
struct StorageErrorBody {
    message: Option<String>,
    error: Option<String>,
}

/// HTTP object-store writer: `POST {root}/object/{bucket}/{path}`
pub struct HttpStorageTransport {
    client: Client,
    storage_root: String,
    bucket: String,
    api_key: Option<String>,
    cache_control_seconds: Option<u64>,
}

impl HttpStorageTransport {
    /// `storage_root` is the storage service base, e.g. `https://project.example.co/storage/v1`
    pub fn new(client: Client, storage_root: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            client,
            storage_root: storage_root.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            api_key: None,
            cache_control_seconds: None,
        }
    }

    /// Project key sent as `apikey` alongside the bearer token
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_cache_control(mut self, seconds: Option<u64>) -> Self {
        self.cache_control_seconds = seconds;
        self
    }

    pub fn object_url(&self, destination: &UploadDestination) -> String {
        format!(
            "{}/object/{}/{}",
            self.storage_root,
            urlencoding::encode(&self.bucket),
            destination.url_encoded()
        )
    }

    async fn body_for(&self, source: &ByteSource, progress: ProgressSink) -> Result<Body, TransportError> {
        match source {
            ByteSource::Path(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| TransportError::Source {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    })?;
                Ok(tracked_body(ReaderStream::new(file), progress))
            }
            ByteSource::Memory(data) => {
                let chunks: Vec<std::io::Result<Bytes>> = data
                    .chunks(MEMORY_CHUNK_SIZE)
                    .map(|chunk| Ok(data.slice_ref(chunk)))
                    .collect();
                Ok(tracked_body(futures_util::stream::iter(chunks), progress))
            }
        }
    }
}

/// Wrap a byte stream so every chunk handed to the connection is counted
fn tracked_body<S>(stream: S, mut progress: ProgressSink) -> Body
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static,
{
    Body::wrap_stream(stream.map(move |chunk| {
        if let Ok(bytes) = &chunk {
            progress.advance(bytes.len() as u64);
        }
        chunk
    }))
}

#[async_trait]
impl StorageTransport for HttpStorageTransport {
    async fn put_object(&self, request: TransferRequest<'_>, progress: ProgressSink) -> Result<(), TransportError> {
        let url = self.object_url(request.destination);
        tracing::debug!("Uploading {} bytes to {}", request.content_length, url);

        let body = self.body_for(request.source, progress).await?;

        let mut builder = self
            .client
            .post(&url)
            .bearer_auth(request.access_token)
            .header(header::CONTENT_TYPE, request.content_type)
            .header(header::CONTENT_LENGTH, request.content_length)
            .body(body);

        if let Some(key) = &self.api_key {
            builder = builder.header("apikey", key);
        }
        if let Some(seconds) = self.cache_control_seconds {
            builder = builder.header(header::CACHE_CONTROL, format!("max-age={}", seconds));
        }

        let response = builder.send().await.map_err(|e| TransportError::Network {
            message: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!("Storage accepted {} with HTTP {}", request.destination, status);
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<StorageErrorBody>(&body)
            .ok()
            .and_then(|b| b.message.or(b.error))
            .unwrap_or(body);

        Err(TransportError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}
