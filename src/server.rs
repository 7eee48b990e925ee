//! Browser-facing HTTP server
//!
//! Routes:
//!
//! | Method | Path                          | Handler                         |
//! |--------|-------------------------------|---------------------------------|
//! | GET    | `/api/media/stream`           | range relay, stream class       |
//! | GET    | `/api/media/thumb`            | relay, thumbnail class          |
//! | GET    | `/api/zip/image`              | relay, archive image class      |
//! | GET    | `/api/zip/thumb`              | relay, thumbnail class          |
//! | GET    | `/api/performers/{id}/thumb`  | relay, thumbnail class          |
//! | POST   | `/api/media/index`            | streamed indexing job relay     |
//! | POST   | `/api/prefetch`               | replace the prefetch plan       |
//! | GET    | `/health`                     | local status                    |
//! | GET    | `/metrics`                    | Prometheus text                 |

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::index_job::IndexJobClient;
use crate::metrics::RelayMetrics;
use crate::metrics_endpoint::metrics_response;
use crate::models::{MediaLocator, MediaRoute};
use crate::prefetch::{HttpPrefetcher, IdleScheduler, NoIdleSignal, PrefetchRequest, PrefetchScheduler};
use crate::range_proxy::{build_upstream_client, full_body, RangeProxy, RelayBody};
use bytes::Bytes;
use http::header::{ALLOW, CONTENT_TYPE, RANGE};
use http::{HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use reqwest::Url;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared state handed to every connection
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub metrics: Arc<RelayMetrics>,
    pub proxy: RangeProxy,
    pub index_jobs: IndexJobClient,
    pub prefetch: PrefetchScheduler,
}

impl AppState {
    /// Build the state with one upstream client shared by all components
    ///
    /// The server has no idle signal of its own, so prefetch batches are
    /// paced by the configured fallback delay.
    pub fn new(config: Arc<RelayConfig>, metrics: Arc<RelayMetrics>) -> Result<Self> {
        Self::with_idle(config, metrics, Arc::new(NoIdleSignal))
    }

    pub fn with_idle(
        config: Arc<RelayConfig>,
        metrics: Arc<RelayMetrics>,
        idle: Arc<dyn IdleScheduler>,
    ) -> Result<Self> {
        let client = build_upstream_client(config.connect_timeout())?;

        let prefetcher = Arc::new(HttpPrefetcher::new(client.clone(), config.upstream_base.clone()));
        let prefetch = PrefetchScheduler::new(
            prefetcher,
            idle,
            config.prefetch.batch_size,
            config.prefetch.fallback_delay(),
            Arc::clone(&metrics),
        );

        Ok(AppState {
            proxy: RangeProxy::with_client(client.clone(), Arc::clone(&config), Arc::clone(&metrics)),
            index_jobs: IndexJobClient::new(client, Arc::clone(&config), Arc::clone(&metrics)),
            prefetch,
            config,
            metrics,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Media(MediaRoute),
    IndexJob,
    Prefetch,
    Health,
    Metrics,
}

impl Route {
    fn resolve(path: &str) -> Option<Route> {
        let route = match path {
            "/api/media/stream" => Route::Media(MediaRoute::Stream),
            "/api/media/thumb" => Route::Media(MediaRoute::Thumbnail),
            "/api/zip/image" => Route::Media(MediaRoute::ArchiveImage),
            "/api/zip/thumb" => Route::Media(MediaRoute::ArchiveThumbnail),
            "/api/media/index" => Route::IndexJob,
            "/api/prefetch" => Route::Prefetch,
            "/health" => Route::Health,
            "/metrics" => Route::Metrics,
            other => {
                let id = other
                    .strip_prefix("/api/performers/")?
                    .strip_suffix("/thumb")?;
                if id.contains('/') {
                    return None;
                }
                let id = percent_decode_str(id).decode_utf8().ok()?;
                Route::Media(MediaRoute::PerformerThumbnail(id.into_owned()))
            }
        };
        Some(route)
    }

    fn method(&self) -> Method {
        match self {
            Route::IndexJob | Route::Prefetch => Method::POST,
            _ => Method::GET,
        }
    }

    fn allow(&self) -> &'static str {
        match self {
            Route::IndexJob | Route::Prefetch => "POST",
            _ => "GET",
        }
    }
}

/// Decode the query string of a request URI
pub fn query_params(uri: &Uri) -> HashMap<String, String> {
    let Ok(mut url) = Url::parse("http://relay/") else {
        return HashMap::new();
    };
    url.set_query(uri.query());
    url.query_pairs().into_owned().collect()
}

/// Render an error as a JSON body with its mapped status
pub fn error_response(err: &RelayError) -> Response<RelayBody> {
    let status =
        StatusCode::from_u16(err.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &json!({ "error": err.to_string() }))
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<RelayBody> {
    let mut response = Response::new(full_body(value.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Handle one request
///
/// Never fails: every error is rendered as a response.
pub async fn handle_request<B>(req: Request<B>, state: Arc<AppState>) -> Response<RelayBody>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let path = req.uri().path().to_string();
    let Some(route) = Route::resolve(&path) else {
        debug!("No route for {} {}", req.method(), path);
        return error_response(&RelayError::NotFound(path));
    };

    if req.method() != route.method() {
        let mut response = json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &json!({ "error": format!("{} not allowed on {}", req.method(), path) }),
        );
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static(route.allow()));
        return response;
    }

    let result = match route {
        Route::Media(media_route) => {
            let params = query_params(req.uri());
            let range = req
                .headers()
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            relay_media(media_route, &params, range.as_deref(), &state).await
        }
        Route::IndexJob => state
            .index_jobs
            .relay()
            .await
            .map(|relayed| relayed.into_http_response()),
        Route::Prefetch => schedule_prefetch(req.into_body(), &state).await,
        Route::Health => Ok(json_response(
            StatusCode::OK,
            &json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "upstream": state.config.upstream_base,
            }),
        )),
        Route::Metrics => Ok(metrics_response(&state.metrics)),
    };

    result.unwrap_or_else(|err| {
        if err.is_client_error() {
            state.metrics.record_rejected();
            debug!("Rejected {}: {}", path, err);
        } else {
            warn!("Request to {} failed: {}", path, err);
        }
        error_response(&err)
    })
}

async fn relay_media(
    route: MediaRoute,
    params: &HashMap<String, String>,
    range: Option<&str>,
    state: &AppState,
) -> Result<Response<RelayBody>> {
    let locator = MediaLocator::from_query(route, params, &state.config)?;
    let relayed = state.proxy.relay(&locator, range).await?;
    Ok(relayed.into_http_response())
}

async fn schedule_prefetch<B>(body: B, state: &AppState) -> Result<Response<RelayBody>>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let bytes = body
        .collect()
        .await
        .map_err(|e| RelayError::InvalidRequest(format!("Failed to read request body: {}", e)))?
        .to_bytes();

    let request: PrefetchRequest = serde_json::from_slice(&bytes)
        .map_err(|e| RelayError::ParseError(format!("Invalid prefetch request: {}", e)))?;

    let locators = request.into_locators(&state.config.prefetch);
    let scheduled = locators.len();
    let plan = state.prefetch.schedule(locators);

    Ok(json_response(
        StatusCode::ACCEPTED,
        &json!({ "generation": plan.generation(), "scheduled": scheduled }),
    ))
}

/// Accept connections on `listener` until `shutdown` is cancelled
///
/// Connections already accepted keep running on their own tasks.
pub async fn serve(listener: TcpListener, state: Arc<AppState>, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Media relay listening on http://{}", addr);
    info!("Relaying to upstream {}", state.config.upstream_base);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutting down listener on {}", addr);
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    tokio::spawn(serve_connection(stream, Arc::clone(&state)));
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            },
        }
    }

    state.prefetch.cancel();
    Ok(())
}

async fn serve_connection(stream: TcpStream, state: Arc<AppState>) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(handle_request(req, state).await) }
    });

    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
        debug!("Error serving connection: {:?}", err);
    }
}

/// Wait for Ctrl-C or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;

    #[test]
    fn test_route_resolve() {
        assert_eq!(
            Route::resolve("/api/media/stream"),
            Some(Route::Media(MediaRoute::Stream))
        );
        assert_eq!(
            Route::resolve("/api/performers/42/thumb"),
            Some(Route::Media(MediaRoute::PerformerThumbnail("42".to_string())))
        );
        assert_eq!(
            Route::resolve("/api/performers/a%20b/thumb"),
            Some(Route::Media(MediaRoute::PerformerThumbnail("a b".to_string())))
        );
        assert_eq!(Route::resolve("/api/performers/%FF/thumb"), None);
        assert_eq!(Route::resolve("/api/performers/4/2/thumb"), None);
        assert_eq!(Route::resolve("/api/performers/42"), None);
        assert_eq!(Route::resolve("/api/media/index"), Some(Route::IndexJob));
        assert_eq!(Route::resolve("/"), None);
    }

    #[test]
    fn test_query_params_decodes_values() {
        let uri: Uri = "/api/zip/image?rel_path=My%20Sets%2Fa%26b.zip&entry=01+cover.jpg"
            .parse()
            .unwrap();
        let params = query_params(&uri);
        assert_eq!(params["rel_path"], "My Sets/a&b.zip");
        assert_eq!(params["entry"], "01 cover.jpg");

        let bare: Uri = "/api/media/stream".parse().unwrap();
        assert!(query_params(&bare).is_empty());
    }

    #[test]
    fn test_error_response_status() {
        let response = error_response(&RelayError::missing("rel_path"));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let response = error_response(&RelayError::UpstreamUnreachable("refused".into()));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_missing_rel_path_rejected_without_upstream() {
        let config = Arc::new(RelayConfig {
            upstream_base: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        });
        let metrics = Arc::new(RelayMetrics::new());
        let state = Arc::new(AppState::new(config, Arc::clone(&metrics)).unwrap());

        let req = Request::get("/api/media/stream").body(Empty::<Bytes>::new()).unwrap();
        let response = handle_request(req, state).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "Missing required parameter: rel_path");

        let stats = metrics.get_stats();
        assert_eq!(stats.rejected_requests, 1);
        assert_eq!(stats.upstream_failures, 0);
        assert_eq!(stats.relayed_requests, 0);
    }

    #[tokio::test]
    async fn test_wrong_method_and_unknown_path() {
        let state = Arc::new(
            AppState::new(Arc::new(RelayConfig::default()), Arc::new(RelayMetrics::new())).unwrap(),
        );

        let req = Request::get("/api/media/index").body(Empty::<Bytes>::new()).unwrap();
        let response = handle_request(req, Arc::clone(&state)).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "POST");

        let req = Request::get("/api/nothing").body(Empty::<Bytes>::new()).unwrap();
        let response = handle_request(req, state).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
