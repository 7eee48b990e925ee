//! Media Relay
//!
//! A browser-facing relay that sits in front of a media library backend and
//! takes care of the parts of the traffic that are not plain request/response
//! forwarding.
//!
//! # Overview
//!
//! - **Range relay**: video, image and archive-entry bytes are fetched from
//!   the backend with the caller's `Range` header forwarded verbatim. Status,
//!   `Content-Range`, `Content-Length`, `Content-Type` and `Accept-Ranges`
//!   come back exactly as upstream sent them, and the body is streamed
//!   without being buffered. Only `Cache-Control` is set by the relay,
//!   according to the resource class.
//! - **Progress streams**: the backend's indexing job answers with a
//!   long-lived `data: <json>` line stream. [`EventStreamReader`] reassembles
//!   lines across arbitrary chunk boundaries and dispatches typed events in
//!   order.
//! - **Thumbnail prefetch**: [`PrefetchScheduler`] warms thumbnails in
//!   bounded batches, paced by an idle signal or a fallback delay. A new
//!   plan always supersedes the previous one.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use media_relay::{RangeProxy, RelayConfig, RelayMetrics};
//! use media_relay::models::MediaLocator;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(RelayConfig::from_file("media_relay.yaml")?);
//! let proxy = RangeProxy::new(config, Arc::new(RelayMetrics::new()))?;
//!
//! let locator = MediaLocator::Stream { rel_path: "videos/clip.mp4".to_string() };
//! let response = proxy.relay(&locator, Some("bytes=0-1023")).await?;
//! println!("status={} headers={:?}", response.status, response.headers);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! listen_address: "127.0.0.1:13337"
//! upstream_base: "http://api:8000"
//! stream_max_age_secs: 3600
//! thumbnail_max_age_secs: 300
//! archive_image_max_age_secs: 60
//! prefetch:
//!   batch_size: 24
//!   fallback_delay_ms: 50
//! ```
//!
//! See [`RelayConfig`] for all options.
//!
//! # Error Handling
//!
//! All fallible operations return [`RelayError`]. Its
//! [`to_http_status`](RelayError::to_http_status) gives the status returned
//! downstream: caller mistakes are 4xx, upstream statuses pass through and
//! transport faults are 502.

pub mod config;
pub mod error;
pub mod event_stream;
pub mod index_job;
pub mod metrics;
pub mod metrics_endpoint;
pub mod models;
pub mod prefetch;
pub mod range_proxy;
pub mod server;

// Re-export commonly used types
pub use config::{PrefetchConfig, RelayConfig};
pub use error::{RelayError, Result};
pub use event_stream::{EventStreamReader, ProgressEvent, ReaderState, StreamEvent};
pub use index_job::IndexJobClient;
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use models::{ByteRange, MediaKind, MediaLocator, MediaResource, ResourceClass};
pub use prefetch::{PrefetchScheduler, Prefetcher};
pub use range_proxy::{RangeProxy, RelayResponse};
