//! The remote-fetch seam: where job payloads come from.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{CONTENT_TYPE, REFERER};
use tracing::debug;

use crate::config::HttpConfig;
use crate::error::DownloadError;
use crate::job::{Job, MediaKind};

/// An opened remote payload: its detected container kind, the expected
/// size when the remote reports one, and the body as a chunk stream.
pub struct MediaPayload {
    pub kind: MediaKind,
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, Result<Bytes, DownloadError>>,
}

/// Issues the remote request for a job and opens its body stream. The
/// HTTP implementation is the only one used at runtime; tests substitute
/// scripted sources.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open(&self, job: &Job) -> Result<MediaPayload, DownloadError>;
}

/// reqwest-backed source sharing one client across all fetches.
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(config: &HttpConfig) -> Result<Self, DownloadError> {
        Ok(Self {
            client: config.build_client()?,
        })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MediaSource for HttpSource {
    async fn open(&self, job: &Job) -> Result<MediaPayload, DownloadError> {
        let mut request = self.client.get(job.url.clone());
        if let Some(referer) = &job.referer {
            request = request.header(REFERER, referer);
        }
        for (name, value) in &job.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        debug!(url = %job.url, "sending download request");
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status, job.url.as_str()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);

        // Media hosts like to serve error pages with a 200.
        if let Some(ct) = content_type.as_deref()
            && (ct.starts_with("text/") || ct.contains("html") || ct.contains("json"))
        {
            return Err(DownloadError::UnsupportedContent {
                content_type: ct.to_owned(),
                url: job.url.to_string(),
            });
        }

        let kind = MediaKind::detect(content_type.as_deref(), &job.url);
        let content_length = response.content_length();
        debug!(url = %job.url, ?kind, ?content_length, "download stream opened");

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(DownloadError::from))
            .boxed();

        Ok(MediaPayload {
            kind,
            content_length,
            chunks,
        })
    }
}
