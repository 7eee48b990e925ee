//! Range-preserving relay for media resources
//!
//! Forwards a single GET to the backend, passing the caller's `Range` header
//! through verbatim, and streams the upstream body back chunk by chunk. The
//! relay never recomputes ranges: status and `Content-Range` are whatever the
//! backend answered.
//!
//! ```text
//! Browser ──Range──▶ RangeProxy ──Range──▶ Backend
//!    ▲                   │                   │
//!    └──── 206 + body ◀──┴──── 206 + body ◀──┘
//! ```

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::metrics::RelayMetrics;
use crate::models::{ByteRange, ContentRange, MediaLocator};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use http::header::{
    HeaderName, ACCEPT_RANGES, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
};
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upstream response headers copied downstream when present
pub const RELAYED_HEADERS: [HeaderName; 4] = [CONTENT_TYPE, CONTENT_LENGTH, CONTENT_RANGE, ACCEPT_RANGES];

/// Streaming body type handed to hyper
pub type RelayBody = UnsyncBoxBody<Bytes, RelayError>;

/// A relayed upstream response whose body has not been read yet
pub struct RelayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for RelayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl RelayResponse {
    /// Convert into a hyper response, keeping the body as a stream
    pub fn into_http_response(self) -> http::Response<RelayBody> {
        let body = StreamBody::new(self.body.map_ok(Frame::data)).boxed_unsync();
        let mut response = http::Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }

    /// Read the whole body into memory
    ///
    /// Intended for small payloads and tests; media streams should go
    /// through [`RelayResponse::into_http_response`].
    pub async fn collect_body(self) -> Result<Bytes> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        Ok(Bytes::from(chunks.concat()))
    }
}

/// Build a fully buffered body, used for locally generated responses
pub fn full_body(data: impl Into<Bytes>) -> RelayBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Copy the relayed subset of upstream headers; absent headers stay absent
pub fn copy_relayed_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in RELAYED_HEADERS.iter() {
        if let Some(value) = upstream.get(name) {
            headers.insert(name.clone(), value.clone());
        }
    }
    headers
}

/// Build the shared upstream HTTP client
///
/// Only the connect phase is bounded; range bodies may stream for as long
/// as the client keeps reading.
pub fn build_upstream_client(connect_timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_nodelay(true)
        .build()
        .map_err(|e| RelayError::HttpError(format!("Failed to create HTTP client: {}", e)))
}

/// Transparent relay for media resources
pub struct RangeProxy {
    client: Client,
    config: Arc<RelayConfig>,
    metrics: Arc<RelayMetrics>,
}

impl RangeProxy {
    /// Create a new RangeProxy with its own HTTP client
    pub fn new(config: Arc<RelayConfig>, metrics: Arc<RelayMetrics>) -> Result<Self> {
        let client = build_upstream_client(config.connect_timeout())?;
        Ok(Self::with_client(client, config, metrics))
    }

    /// Create a RangeProxy that shares an existing HTTP client
    pub fn with_client(client: Client, config: Arc<RelayConfig>, metrics: Arc<RelayMetrics>) -> Self {
        RangeProxy {
            client,
            config,
            metrics,
        }
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Relay one resource from upstream
    ///
    /// # Arguments
    /// * `locator` - The resource to fetch
    /// * `range` - The caller's `Range` header, forwarded verbatim
    ///
    /// # Returns
    /// * `Ok(RelayResponse)` for any upstream answer, including error
    ///   statuses, which are passed through with their body
    /// * `Err(RelayError::UpstreamUnreachable)` if no response head arrived
    pub async fn relay(&self, locator: &MediaLocator, range: Option<&str>) -> Result<RelayResponse> {
        let url = locator.upstream_url(&self.config.upstream_base)?;
        let range = range.filter(|r| !r.trim().is_empty());

        let mut request = self.client.get(url.clone());
        if let Some(range) = range {
            match ByteRange::from_header(range) {
                Ok(parsed) => debug!("Relaying {} with range {:?}", url, parsed),
                Err(e) => debug!("Relaying {} with unparsed range '{}': {}", url, range, e),
            }
            request = request.header(RANGE, range);
        } else {
            debug!("Relaying {} without range", url);
        }

        let response = request.send().await.map_err(|e| {
            warn!("Upstream request failed for url={}: {}", url, e);
            self.metrics.record_upstream_failure();
            RelayError::UpstreamUnreachable(e.to_string())
        })?;

        let status = response.status();
        let mut headers = copy_relayed_headers(response.headers());

        if status.is_success() {
            let cache_control = locator.class().cache_control(&self.config);
            headers.insert(
                CACHE_CONTROL,
                HeaderValue::from_str(&cache_control)
                    .map_err(|e| RelayError::HttpError(format!("Invalid header value: {}", e)))?,
            );
        } else {
            warn!("Upstream returned status={} for url={}, passing through", status, url);
        }

        if status == StatusCode::PARTIAL_CONTENT {
            if let Some(value) = headers.get(CONTENT_RANGE).and_then(|v| v.to_str().ok()) {
                match ContentRange::parse(value) {
                    Ok(cr) => {
                        debug!("Upstream served {:?} of {:?} bytes", cr.range, cr.total);
                        if let Some(len) = cr.len() {
                            self.metrics.record_partial_range(len);
                        }
                    }
                    Err(e) => debug!("Upstream sent unparsed Content-Range '{}': {}", value, e),
                }
            }
        }

        self.metrics.record_relay(status.as_u16());
        info!("Relayed url={} status={}", url, status);

        let metrics = Arc::clone(&self.metrics);
        let body = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => {
                    metrics.record_bytes_to_client(bytes.len() as u64);
                    Ok(bytes)
                }
                Err(e) => {
                    warn!("Upstream body failed mid-stream: {}", e);
                    Err(RelayError::StreamError(e.to_string()))
                }
            })
            .boxed();

        Ok(RelayResponse {
            status,
            headers,
            body,
        })
    }
}
