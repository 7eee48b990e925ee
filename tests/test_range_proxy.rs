// Integration tests for RangeProxy against a mock backend

use media_relay::config::RelayConfig;
use media_relay::error::RelayError;
use media_relay::metrics::RelayMetrics;
use media_relay::models::MediaLocator;
use media_relay::range_proxy::RangeProxy;
use std::sync::Arc;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn resource() -> Vec<u8> {
    (0..1000u32).map(|i| (i % 251) as u8).collect()
}

fn proxy_for(server: &MockServer) -> (RangeProxy, Arc<RelayMetrics>) {
    let config = Arc::new(RelayConfig {
        upstream_base: server.uri(),
        ..Default::default()
    });
    let metrics = Arc::new(RelayMetrics::new());
    let proxy = RangeProxy::new(config, Arc::clone(&metrics)).unwrap();
    (proxy, metrics)
}

fn stream_locator() -> MediaLocator {
    MediaLocator::Stream {
        rel_path: "videos/clip.mp4".to_string(),
    }
}

#[tokio::test]
async fn test_partial_range_is_relayed_verbatim() {
    let mock_server = MockServer::start().await;
    let data = resource();

    Mock::given(method("GET"))
        .and(path("/media/stream"))
        .and(query_param("rel_path", "videos/clip.mp4"))
        .and(header("range", "bytes=100-199"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(data[100..200].to_vec())
                .insert_header("Content-Type", "video/mp4")
                .insert_header("Content-Range", "bytes 100-199/1000")
                .insert_header("Accept-Ranges", "bytes"),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let (proxy, metrics) = proxy_for(&mock_server);
    let response = proxy.relay(&stream_locator(), Some("bytes=100-199")).await.unwrap();

    assert_eq!(response.status, 206);
    assert_eq!(response.headers["content-range"], "bytes 100-199/1000");
    assert_eq!(response.headers["content-length"], "100");
    assert_eq!(response.headers["accept-ranges"], "bytes");
    assert_eq!(response.headers["content-type"], "video/mp4");
    assert_eq!(response.headers["cache-control"], "public, max-age=3600");

    let body = response.collect_body().await.unwrap();
    assert_eq!(body.len(), 100);
    assert_eq!(&body[..], &data[100..200]);

    let stats = metrics.get_stats();
    assert_eq!(stats.relayed_requests, 1);
    assert_eq!(stats.partial_responses, 1);
    assert_eq!(stats.bytes_to_client, 100);
    assert_eq!(stats.partial_range_bytes, 100);
}

#[tokio::test]
async fn test_no_range_sends_no_range_header() {
    let mock_server = MockServer::start().await;
    let data = resource();

    Mock::given(method("GET"))
        .and(path("/media/stream"))
        .respond_with(move |req: &wiremock::Request| {
            if req.headers.get("range").is_some() {
                ResponseTemplate::new(500)
            } else {
                ResponseTemplate::new(200)
                    .set_body_bytes(data.clone())
                    .insert_header("Content-Type", "video/mp4")
            }
        })
        .expect(2)
        .mount(&mock_server)
        .await;

    let (proxy, _) = proxy_for(&mock_server);

    for range in [None, Some("")] {
        let response = proxy.relay(&stream_locator(), range).await.unwrap();
        assert_eq!(response.status, 200);
        assert!(response.headers.get("content-range").is_none());
        assert_eq!(response.collect_body().await.unwrap().len(), 1000);
    }
}

#[tokio::test]
async fn test_only_relayed_headers_are_copied() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/media/thumb"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0xFFu8, 0xD8, 0xFF])
                .insert_header("Content-Type", "image/jpeg")
                .insert_header("ETag", "\"abc\"")
                .insert_header("X-Backend", "uvicorn")
                .insert_header("Cache-Control", "no-store"),
        )
        .mount(&mock_server)
        .await;

    let (proxy, _) = proxy_for(&mock_server);
    let locator = MediaLocator::Thumbnail {
        rel_path: "images/a.png".to_string(),
    };
    let response = proxy.relay(&locator, None).await.unwrap();

    assert_eq!(response.headers["content-type"], "image/jpeg");
    assert_eq!(response.headers["cache-control"], "public, max-age=300");
    assert!(response.headers.get("etag").is_none());
    assert!(response.headers.get("x-backend").is_none());
    assert!(response.headers.get("accept-ranges").is_none());
    assert!(response.headers.get("content-range").is_none());
}

#[tokio::test]
async fn test_cache_control_by_resource_class() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 16]))
        .mount(&mock_server)
        .await;

    let (proxy, _) = proxy_for(&mock_server);
    let cases = [
        (
            MediaLocator::ArchiveImage {
                rel_path: "sets/a.zip".to_string(),
                entry: "001.jpg".to_string(),
            },
            "public, max-age=60",
        ),
        (
            MediaLocator::ArchiveThumbnail {
                rel_path: "sets/a.zip".to_string(),
                entry: "001.jpg".to_string(),
                size: 360,
            },
            "public, max-age=300",
        ),
        (
            MediaLocator::PerformerThumbnail {
                id: "12".to_string(),
                size: 480,
            },
            "public, max-age=300",
        ),
    ];

    for (locator, expected) in cases {
        let response = proxy.relay(&locator, None).await.unwrap();
        assert_eq!(response.headers["cache-control"], expected, "for {:?}", locator);
    }
}

#[tokio::test]
async fn test_upstream_error_status_and_body_pass_through() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/zip/image"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_raw("{\"detail\":\"Entry not found\"}", "application/json"),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let (proxy, metrics) = proxy_for(&mock_server);
    let locator = MediaLocator::ArchiveImage {
        rel_path: "sets/a.zip".to_string(),
        entry: "missing.jpg".to_string(),
    };
    let response = proxy.relay(&locator, Some("bytes=0-10")).await.unwrap();

    assert_eq!(response.status, 404);
    assert!(response.headers.get("cache-control").is_none());
    assert_eq!(response.headers["content-type"], "application/json");
    let body = response.collect_body().await.unwrap();
    assert_eq!(&body[..], b"{\"detail\":\"Entry not found\"}");

    assert_eq!(metrics.get_stats().upstream_error_responses, 1);
}

#[tokio::test]
async fn test_unsatisfiable_range_passes_through() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(header("range", "bytes=5000-"))
        .respond_with(ResponseTemplate::new(416).insert_header("Content-Range", "bytes */1000"))
        .mount(&mock_server)
        .await;

    let (proxy, metrics) = proxy_for(&mock_server);
    let response = proxy.relay(&stream_locator(), Some("bytes=5000-")).await.unwrap();

    assert_eq!(response.status, 416);
    assert_eq!(response.headers["content-range"], "bytes */1000");
    assert_eq!(metrics.get_stats().partial_range_bytes, 0);
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let config = Arc::new(RelayConfig {
        upstream_base: "http://127.0.0.1:1".to_string(),
        ..Default::default()
    });
    let metrics = Arc::new(RelayMetrics::new());
    let proxy = RangeProxy::new(config, Arc::clone(&metrics)).unwrap();

    let err = proxy.relay(&stream_locator(), None).await.unwrap_err();
    assert!(matches!(err, RelayError::UpstreamUnreachable(_)));
    assert_eq!(err.to_http_status(), 502);

    let stats = metrics.get_stats();
    assert_eq!(stats.upstream_failures, 1);
    assert_eq!(stats.relayed_requests, 0);
}
