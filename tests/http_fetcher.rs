// tests/http_fetcher.rs
use polyterm_pulse::error::FetchError;
use polyterm_pulse::ingest::fetcher::HttpFetcher;
use polyterm_pulse::ingest::types::Fetcher;
use polyterm_pulse::sources::{EndpointTarget, SourceKind};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

fn response(status: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (k, v) in headers {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str("\r\n");
    out.push_str(body);
    out
}

/// Serves `canned` to a single connection and returns its request line.
async fn serve_once(canned: String) -> (SocketAddr, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = sock.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        sock.write_all(canned.as_bytes()).await.unwrap();
        let _ = sock.shutdown().await;
        String::from_utf8_lossy(&buf)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string()
    });
    (addr, handle)
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(Duration::from_secs(5)).unwrap()
}

fn target(kind: SourceKind, address: String) -> EndpointTarget {
    EndpointTarget { kind, address }
}

#[tokio::test]
async fn direct_rss_keeps_items_mentioning_the_keyword_anywhere() {
    let body = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>World desk</title>
  <item><title>Oil markets wobble</title><description>Maduro signals new export terms</description><link>https://desk.example/oil</link></item>
  <item><title>Maduro meets envoy</title><link>https://desk.example/envoy</link></item>
  <item><title>Rain in Lisbon</title><description>Weather only</description><link>https://desk.example/rain</link></item>
</channel></rss>"#;
    let (addr, server) = serve_once(response("200 OK", &[("Content-Type", "application/rss+xml")], body)).await;

    let items = fetcher()
        .fetch(&target(SourceKind::DirectRss, format!("http://{addr}/world.xml")), "Maduro")
        .await
        .unwrap();
    let titles: Vec<&str> = items.iter().map(|i| i.title.as_str()).collect();
    assert_eq!(titles, ["Oil markets wobble", "Maduro meets envoy"]);
    assert_eq!(server.await.unwrap(), "GET /world.xml HTTP/1.1");
}

#[tokio::test]
async fn mirror_search_is_requested_with_the_keyword() {
    let body = r#"<rss version="2.0"><channel><title>Search</title>
  <item><title>Maduro speaks</title><link>https://m.example/u/status/1850000000000000001#m</link></item>
</channel></rss>"#;
    let (addr, server) = serve_once(response("200 OK", &[], body)).await;

    let items = fetcher()
        .fetch(&target(SourceKind::MirrorFeed, format!("http://{addr}")), "Maduro")
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].post_id.as_deref(), Some("1850000000000000001"));
    let request = server.await.unwrap();
    assert!(request.starts_with("GET /search/rss?f=tweets&q=Maduro "), "{request}");
}

#[tokio::test]
async fn rate_limit_page_with_ok_status_is_rate_limited() {
    let body = "<html><body><h1>Instance has been rate limited.</h1></body></html>";
    let (addr, _server) = serve_once(response("200 OK", &[("Content-Type", "text/html")], body)).await;

    let err = fetcher()
        .fetch(&target(SourceKind::MirrorFeed, format!("http://{addr}")), "Maduro")
        .await
        .unwrap_err();
    assert_eq!(err, FetchError::RateLimited { retry_after: None });
}

#[tokio::test]
async fn too_many_requests_carries_retry_after() {
    let (addr, _server) = serve_once(response("429 Too Many Requests", &[("Retry-After", "120")], "")).await;

    let err = fetcher()
        .fetch(&target(SourceKind::NewsSearch, format!("http://{addr}/rss/search")), "Fed")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(120))
        }
    );
}

#[tokio::test]
async fn server_errors_are_unreachable() {
    let (addr, _server) = serve_once(response("503 Service Unavailable", &[], "down")).await;

    let err = fetcher()
        .fetch(&target(SourceKind::NewsSearch, format!("http://{addr}/rss/search")), "Fed")
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Unreachable(_)), "{err:?}");
}
