//! The authenticated attachment fetch endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::header;
use axum::response::Redirect;
use axum::routing::get;
use pretty_assertions::assert_eq;
use uuid::Uuid;

use courier::config::Config;
use courier::httpx::NetworkPolicy;
use courier::registry::RegistryBuilder;
use courier::server::Server;
use courier::testing::{MockBackend, MockHandler, make_channel};

const JPEG: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01,
];

/// A provider stub hosting media on an ephemeral port.
async fn spawn_provider() -> SocketAddr {
    let app = Router::new()
        .route(
            "/hello.jpg",
            get(|| async { ([(header::CONTENT_TYPE, "image/jpeg")], JPEG) }),
        )
        .route(
            "/blob",
            get(|| async { ([(header::CONTENT_TYPE, "application/octet-stream")], JPEG) }),
        )
        .route("/moved", get(|| async { Redirect::temporary("/hello.jpg") }))
        .route(
            "/sneaky",
            get(|| async { Redirect::temporary("http://169.254.169.254/latest/meta-data") }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind provider stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

struct TestServer {
    server: Server,
    addr: SocketAddr,
    backend: Arc<MockBackend>,
    channel_uuid: Uuid,
}

async fn start_server() -> (TestServer, tempfile::TempDir) {
    start_server_with(NetworkPolicy::default()).await
}

async fn start_server_with(policy: NetworkPolicy) -> (TestServer, tempfile::TempDir) {
    let spool = tempfile::tempdir().expect("tempdir");
    let config = Config::for_testing(spool.path().to_path_buf()).with_auth_token("sesame");

    let backend = Arc::new(MockBackend::new().with_policy(policy));
    let channel = make_channel("MCK", serde_json::json!({"secret": "media-token-123"}));
    let channel_uuid = channel.uuid;
    backend.add_channel(channel);

    let registry = RegistryBuilder::new()
        .register(Arc::new(MockHandler::new()))
        .build(&[], &[]);
    let mut server = Server::new(config, Arc::clone(&backend) as Arc<dyn courier::Backend>, registry);
    server.start().await.expect("server start");
    let addr = server.address().expect("bound address");

    (
        TestServer {
            server,
            addr,
            backend,
            channel_uuid,
        },
        spool,
    )
}

async fn fetch(
    ts: &TestServer,
    token: Option<&str>,
    url: &str,
) -> reqwest::Response {
    let client = reqwest::Client::new();
    let mut request = client
        .post(format!("http://{}/c/_fetch-attachment", ts.addr))
        .json(&serde_json::json!({
            "channel_type": "MCK",
            "channel_uuid": ts.channel_uuid,
            "url": url,
        }));
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    request.send().await.expect("request")
}

#[tokio::test]
async fn fetches_sniffs_and_stores() {
    let provider = spawn_provider().await;
    let (mut ts, _spool) = start_server().await;

    let response = fetch(&ts, Some("sesame"), &format!("http://{provider}/hello.jpg")).await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["attachment"]["content_type"], "image/jpeg");
    assert_eq!(body["attachment"]["size"], JPEG.len());
    let stored_url = body["attachment"]["url"].as_str().expect("url");
    assert!(stored_url.starts_with("https://media.test.courier.io/"));
    assert!(stored_url.ends_with(".jpg"));
    assert!(body["log_uuid"].as_str().is_some());

    {
        let state = ts.backend.state();
        assert_eq!(state.saved_attachments.len(), 1);
        assert_eq!(state.written_logs.len(), 1);
        assert_eq!(state.written_logs[0].http_logs.len(), 1);
    }

    ts.server.stop().await;
}

#[tokio::test]
async fn missing_bearer_token_is_unauthorized() {
    let (mut ts, _spool) = start_server().await;

    let response = fetch(&ts, None, "http://example.com/x.jpg").await;
    assert_eq!(response.status().as_u16(), 401);
    assert_eq!(response.text().await.expect("body"), "Unauthorized");

    let response = fetch(&ts, Some("wrong"), "http://example.com/x.jpg").await;
    assert_eq!(response.status().as_u16(), 401);

    ts.server.stop().await;
}

#[tokio::test]
async fn missing_media_degrades_to_unavailable() {
    let provider = spawn_provider().await;
    let (mut ts, _spool) = start_server().await;

    let url = format!("http://{provider}/missing.jpg");
    let response = fetch(&ts, Some("sesame"), &url).await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["attachment"]["content_type"], "unavailable");
    assert_eq!(body["attachment"]["url"], url);
    assert_eq!(body["attachment"]["size"], 0);

    {
        let state = ts.backend.state();
        assert!(state.saved_attachments.is_empty());
        assert_eq!(state.written_logs.len(), 1);
        assert_eq!(state.written_logs[0].http_logs.len(), 1);
    }

    ts.server.stop().await;
}

#[tokio::test]
async fn unreachable_host_degrades_to_unavailable() {
    let (mut ts, _spool) = start_server().await;

    // nothing listens on port 9; connection fails fast
    let url = "http://127.0.0.1:9/x.jpg";
    let response = fetch(&ts, Some("sesame"), url).await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["attachment"]["content_type"], "unavailable");
    assert_eq!(body["attachment"]["url"], url);

    ts.server.stop().await;
}

#[tokio::test]
async fn follows_redirects_hop_by_hop() {
    let provider = spawn_provider().await;
    let (mut ts, _spool) = start_server().await;

    let response = fetch(&ts, Some("sesame"), &format!("http://{provider}/moved")).await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["attachment"]["content_type"], "image/jpeg");
    assert_eq!(body["attachment"]["size"], JPEG.len());

    {
        let state = ts.backend.state();
        assert_eq!(state.saved_attachments.len(), 1);
        // both hops were recorded on the log
        assert_eq!(state.written_logs[0].http_logs.len(), 2);
        assert_eq!(state.written_logs[0].http_logs[0].status_code, 307);
        assert_eq!(state.written_logs[0].http_logs[1].status_code, 200);
    }

    ts.server.stop().await;
}

#[tokio::test]
async fn redirect_into_denied_network_is_blocked() {
    let provider = spawn_provider().await;
    let policy = NetworkPolicy::parse(&["169.254.0.0/16".to_string()]).expect("policy");
    let (mut ts, _spool) = start_server_with(policy).await;

    let url = format!("http://{provider}/sneaky");
    let response = fetch(&ts, Some("sesame"), &url).await;
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("json");
    // the redirect target failed the network policy, so the media degrades
    assert_eq!(body["attachment"]["content_type"], "unavailable");
    assert_eq!(body["attachment"]["url"], url);

    assert!(ts.backend.state().saved_attachments.is_empty());

    ts.server.stop().await;
}

#[tokio::test]
async fn octet_stream_body_is_sniffed() {
    let provider = spawn_provider().await;
    let (mut ts, _spool) = start_server().await;

    let response = fetch(&ts, Some("sesame"), &format!("http://{provider}/blob")).await;
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["attachment"]["content_type"], "image/jpeg");
    assert!(
        body["attachment"]["url"]
            .as_str()
            .expect("url")
            .ends_with(".jpg")
    );

    ts.server.stop().await;
}

#[tokio::test]
async fn provider_auth_header_is_redacted_from_log() {
    let provider = spawn_provider().await;
    let (mut ts, _spool) = start_server().await;

    fetch(&ts, Some("sesame"), &format!("http://{provider}/hello.jpg")).await;

    let state = ts.backend.state();
    let serialized = serde_json::to_string(&state.written_logs[0]).expect("json");
    // the channel secret went out in the Authorization header but must not
    // appear in the recorded trace
    assert!(!serialized.contains("media-token-123"));

    drop(state);
    ts.server.stop().await;
}

#[tokio::test]
async fn validation_failures_are_field_errors() {
    let (mut ts, _spool) = start_server().await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/c/_fetch-attachment", ts.addr))
        .bearer_auth("sesame")
        .json(&serde_json::json!({"channel_type": "MCK"}))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.expect("json");
    let errors: Vec<&str> = body["data"]
        .as_array()
        .expect("data")
        .iter()
        .map(|i| i["error"].as_str().expect("error"))
        .collect();
    assert_eq!(errors, vec!["field 'channel_uuid' required", "field 'url' required"]);

    ts.server.stop().await;
}
