//! Indexing job client and relay
//!
//! The backend exposes the media indexer as `POST /media/index`, answering
//! with a long-lived progress stream. The relay either reads that stream
//! itself ([`IndexJobClient::run`]) or forwards it untouched to the browser
//! ([`IndexJobClient::relay`]).

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::event_stream::{EventStreamReader, ReaderState, StreamEvent};
use crate::metrics::RelayMetrics;
use crate::range_proxy::RelayResponse;
use futures::stream::StreamExt;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue};
use reqwest::{Client, Url};
use std::sync::Arc;
use tracing::{info, warn};

/// Content type reported downstream when upstream does not name one
const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Resolve the indexing endpoint against the backend base URL
pub fn index_url(base: &str) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| RelayError::ConfigError(format!("Invalid upstream base '{}': {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| RelayError::ConfigError(format!("Upstream base '{}' cannot be a base", base)))?
        .pop_if_empty()
        .extend(["media", "index"]);
    Ok(url)
}

/// Render an event as one line of a human-readable job log
pub fn format_progress_line(event: &StreamEvent) -> String {
    match event {
        StreamEvent::Progress(progress) => match progress.timestamp {
            Some(ts) => format!("[{}] {}", ts.format("%H:%M:%S"), progress.message),
            None => progress.message.clone(),
        },
        StreamEvent::Malformed { raw } => format!("Parse error: {}", raw),
        StreamEvent::Complete => "Indexing complete!".to_string(),
        StreamEvent::Failed { message } => format!("Error: {}", message),
    }
}

/// Starts indexing jobs on the backend
pub struct IndexJobClient {
    client: Client,
    config: Arc<RelayConfig>,
    metrics: Arc<RelayMetrics>,
}

impl IndexJobClient {
    pub fn new(client: Client, config: Arc<RelayConfig>, metrics: Arc<RelayMetrics>) -> Self {
        IndexJobClient {
            client,
            config,
            metrics,
        }
    }

    /// Start a job and read its progress stream to the end
    ///
    /// # Returns
    /// The terminal state of the reader. Failures are also reported to
    /// `on_event` as [`StreamEvent::Failed`].
    pub async fn run<F>(&self, on_event: F) -> ReaderState
    where
        F: FnMut(StreamEvent),
    {
        let mut reader = EventStreamReader::new();
        self.run_with(&mut reader, on_event).await
    }

    /// Like [`IndexJobClient::run`], with a caller-owned reader so it can be
    /// aborted through its [`AbortHandle`](crate::event_stream::AbortHandle)
    pub async fn run_with<F>(&self, reader: &mut EventStreamReader, on_event: F) -> ReaderState
    where
        F: FnMut(StreamEvent),
    {
        // A used reader must not start another job on the backend
        if reader.state() != ReaderState::Idle {
            warn!("Refusing to start indexing job on a reader in state {:?}", reader.state());
            return reader.fail("reader has already consumed a stream", on_event);
        }

        let url = match index_url(&self.config.upstream_base) {
            Ok(url) => url,
            Err(e) => return reader.fail(e.to_string(), on_event),
        };

        self.metrics.record_index_job();
        info!("Starting indexing job at {}", url);

        let abort = reader.abort_handle();
        let sent = tokio::select! {
            biased;
            _ = abort.aborted() => None,
            sent = self.client.post(url).send() => Some(sent),
        };

        let response = match sent {
            None => {
                info!("Indexing job aborted before its stream opened");
                return reader.abort_idle();
            }
            Some(Ok(response)) => response,
            Some(Err(e)) => {
                warn!("Indexing job request failed: {}", e);
                self.metrics.record_upstream_failure();
                return reader.fail(e.to_string(), on_event);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Indexing job rejected with status={}", status);
            return reader.fail(format!("{} {}", status.as_u16(), body), on_event);
        }

        let state = reader.consume(Some(response.bytes_stream()), on_event).await;
        info!(
            "Indexing job stream ended in state {:?} after {} events",
            state,
            reader.dispatched()
        );
        state
    }

    /// Forward a job start to upstream and hand back its streamed response
    ///
    /// Status and body are passed through unchanged, including error
    /// statuses. Only the content type is carried over as a header.
    pub async fn relay(&self) -> Result<RelayResponse> {
        let url = index_url(&self.config.upstream_base)?;
        self.metrics.record_index_job();

        let response = self.client.post(url.clone()).send().await.map_err(|e| {
            warn!("Indexing job relay failed for url={}: {}", url, e);
            self.metrics.record_upstream_failure();
            RelayError::UpstreamUnreachable(e.to_string())
        })?;

        let status = response.status();
        let mut headers = HeaderMap::new();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
        headers.insert(CONTENT_TYPE, content_type);

        self.metrics.record_relay(status.as_u16());
        info!("Relaying indexing job stream, status={}", status);

        let metrics = Arc::clone(&self.metrics);
        let body = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => {
                    metrics.record_bytes_to_client(bytes.len() as u64);
                    Ok(bytes)
                }
                Err(e) => Err(RelayError::StreamError(e.to_string())),
            })
            .boxed();

        Ok(RelayResponse {
            status,
            headers,
            body,
        })
    }
}
