//! Metrics HTTP Endpoint
//!
//! Renders [`MetricsSnapshot`] in the Prometheus text exposition format.
//! The relay server answers `/metrics` itself; [`MetricsEndpoint`] serves the
//! same text on a separate listener when `metrics_endpoint` is enabled.

use crate::metrics::{MetricsSnapshot, RelayMetrics};
use crate::range_proxy::{full_body, RelayBody};
use http::header::CONTENT_TYPE;
use http::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Content type of the Prometheus text format
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Standalone metrics server
pub struct MetricsEndpoint {
    metrics: Arc<RelayMetrics>,
    addr: SocketAddr,
}

impl MetricsEndpoint {
    /// Create a new metrics endpoint
    ///
    /// # Arguments
    /// * `metrics` - Shared metrics collector
    /// * `addr` - Address to bind the HTTP server to
    pub fn new(metrics: Arc<RelayMetrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Bind and serve `/metrics` until the process exits
    pub async fn start(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics available at http://{}/metrics", self.addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let metrics = Arc::clone(&self.metrics);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = Arc::clone(&metrics);
                    async move { Ok::<_, Infallible>(handle_request(&req, &metrics)) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

fn handle_request<B>(req: &Request<B>, metrics: &RelayMetrics) -> Response<RelayBody> {
    match req.uri().path() {
        "/metrics" => metrics_response(metrics),
        _ => {
            let mut response = Response::new(full_body("404 Not Found"));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

/// Build a `200 OK` response carrying the current metrics
pub fn metrics_response(metrics: &RelayMetrics) -> Response<RelayBody> {
    let body = format_prometheus_metrics(&metrics.get_stats());
    let mut response = Response::new(full_body(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE));
    response
}

fn write_metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    // Writing to a String cannot fail
    let _ = writeln!(out, "# HELP media_relay_{} {}", name, help);
    let _ = writeln!(out, "# TYPE media_relay_{} {}", name, kind);
    let _ = writeln!(out, "media_relay_{} {}\n", name, value);
}

/// Format metrics in Prometheus exposition format
pub fn format_prometheus_metrics(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    // Relay
    write_metric(&mut out, "relayed_requests_total", "counter",
        "Responses relayed from upstream", snapshot.relayed_requests);
    write_metric(&mut out, "partial_responses_total", "counter",
        "Relayed responses with status 206", snapshot.partial_responses);
    write_metric(&mut out, "upstream_error_responses_total", "counter",
        "Relayed responses with an upstream error status", snapshot.upstream_error_responses);
    write_metric(&mut out, "upstream_failures_total", "counter",
        "Upstream requests that got no response", snapshot.upstream_failures);
    write_metric(&mut out, "rejected_requests_total", "counter",
        "Requests rejected before contacting upstream", snapshot.rejected_requests);
    write_metric(&mut out, "bytes_to_client_total", "counter",
        "Body bytes streamed to clients", snapshot.bytes_to_client);
    write_metric(&mut out, "partial_range_bytes_total", "counter",
        "Bytes covered by upstream Content-Range on 206 responses", snapshot.partial_range_bytes);

    // Indexing
    write_metric(&mut out, "index_jobs_total", "counter",
        "Indexing jobs started", snapshot.index_jobs);

    // Prefetch
    write_metric(&mut out, "prefetch_plans_total", "counter",
        "Prefetch plans started", snapshot.prefetch_plans_started);
    write_metric(&mut out, "prefetch_plans_superseded_total", "counter",
        "Prefetch plans invalidated by a newer plan", snapshot.prefetch_plans_superseded);
    write_metric(&mut out, "prefetch_batches_total", "counter",
        "Prefetch batches issued", snapshot.prefetch_batches);
    write_metric(&mut out, "prefetch_hits_total", "counter",
        "Prefetch requests that succeeded", snapshot.prefetch_hits);
    write_metric(&mut out, "prefetch_misses_total", "counter",
        "Prefetch requests that failed", snapshot.prefetch_misses);
    write_metric(&mut out, "prefetch_hit_rate", "gauge",
        "Percentage of successful prefetch requests",
        format!("{:.2}", snapshot.prefetch_hit_rate()));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = RelayMetrics::new();
        metrics.record_relay(206);
        metrics.record_relay(404);
        metrics.record_upstream_failure();
        metrics.record_bytes_to_client(1500);
        metrics.record_partial_range(100);
        metrics.record_prefetch(true);
        metrics.record_prefetch(false);

        let output = format_prometheus_metrics(&metrics.get_stats());

        assert!(output.contains("media_relay_relayed_requests_total 2"));
        assert!(output.contains("media_relay_partial_responses_total 1"));
        assert!(output.contains("media_relay_upstream_error_responses_total 1"));
        assert!(output.contains("media_relay_upstream_failures_total 1"));
        assert!(output.contains("media_relay_bytes_to_client_total 1500"));
        assert!(output.contains("media_relay_partial_range_bytes_total 100"));
        assert!(output.contains("media_relay_prefetch_hit_rate 50.00"));
        assert!(output.contains("# TYPE media_relay_relayed_requests_total counter"));
        assert!(output.contains("# TYPE media_relay_prefetch_hit_rate gauge"));
    }

    #[test]
    fn test_format_prometheus_metrics_empty() {
        let output = format_prometheus_metrics(&RelayMetrics::new().get_stats());
        assert!(output.contains("media_relay_relayed_requests_total 0"));
        assert!(output.contains("media_relay_prefetch_hit_rate 0.00"));
    }

    #[tokio::test]
    async fn test_handle_request_routes() {
        let metrics = RelayMetrics::new();
        metrics.record_index_job();

        let req = Request::get("/metrics").body(()).unwrap();
        let response = handle_request(&req, &metrics);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], PROMETHEUS_CONTENT_TYPE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("media_relay_index_jobs_total 1"));

        let req = Request::get("/other").body(()).unwrap();
        assert_eq!(handle_request(&req, &metrics).status(), StatusCode::NOT_FOUND);
    }
}
