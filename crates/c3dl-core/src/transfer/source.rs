//! Where transfer bytes come from.

use crate::config::NetworkConfig;
use crate::error::{SyncError, TransferError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tracing::debug;

/// An open response body.
pub struct RemoteBody {
    /// True when the source honoured the requested offset; the chunks then
    /// continue the partial file. False means the chunks start at byte zero.
    pub resumed: bool,
    /// Full size of the resource, if the source advertised it.
    pub total_size: Option<u64>,
    pub chunks: BoxStream<'static, Result<Bytes, TransferError>>,
}

impl std::fmt::Debug for RemoteBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBody")
            .field("resumed", &self.resumed)
            .field("total_size", &self.total_size)
            .finish_non_exhaustive()
    }
}

/// A remote byte stream that can be opened at an offset.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Open `url`, asking for the bytes from `offset` on when it is non-zero.
    async fn open(&self, url: &str, offset: u64) -> Result<RemoteBody, TransferError>;
}

/// HTTP(S) byte source backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new() -> Result<Self, SyncError> {
        let client = Client::builder()
            .user_agent(NetworkConfig::USER_AGENT)
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .read_timeout(NetworkConfig::READ_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }

    /// Check if an HTTP status code indicates a retryable error.
    pub fn is_retryable_status(status: StatusCode) -> bool {
        matches!(status.as_u16(), 408 | 429) || status.is_server_error()
    }
}

#[async_trait]
impl ByteSource for HttpSource {
    async fn open(&self, url: &str, offset: u64) -> Result<RemoteBody, TransferError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
            debug!("Requesting {} from byte {}", url, offset);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransferError::transient(url, format!("request failed: {}", e)))?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(TransferError::RangeNotSatisfiable {
                url: url.to_string(),
                offset,
            });
        }
        if !status.is_success() {
            if Self::is_retryable_status(status) {
                return Err(TransferError::transient(url, format!("HTTP {}", status)));
            }
            return Err(TransferError::Rejected {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let total_size = if resumed {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(content_range_total)
                .or_else(|| response.content_length().map(|len| len + offset))
        } else {
            response.content_length()
        };

        let owned_url = url.to_string();
        let chunks = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| TransferError::transient(&owned_url, format!("stream error: {}", e)))
            })
            .boxed();

        Ok(RemoteBody {
            resumed,
            total_size,
            chunks,
        })
    }
}

/// Total length from a `Content-Range: bytes 100-199/200` header.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}
