//! Whole-server webhook scenarios against the memory backend.

use std::net::SocketAddr;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use uuid::Uuid;

use courier::config::Config;
use courier::registry::RegistryBuilder;
use courier::server::Server;
use courier::testing::{MockBackend, MockHandler, make_channel};

const CHANNEL_UUID: &str = "e4bb1578-29da-4fa5-a214-9da19dd24230";

struct TestServer {
    server: Server,
    addr: SocketAddr,
    backend: Arc<MockBackend>,
    spool: tempfile::TempDir,
}

async fn start_server() -> TestServer {
    let spool = tempfile::tempdir().expect("tempdir");
    let config = Config::for_testing(spool.path().to_path_buf())
        .with_auth_token("sesame")
        .with_status_auth("admin", "squirrel");

    let backend = Arc::new(MockBackend::new());
    let mut channel = make_channel("MCK", serde_json::json!({"secret": "hunter2"}));
    channel.uuid = Uuid::parse_str(CHANNEL_UUID).expect("uuid");
    backend.add_channel(channel);

    let registry = RegistryBuilder::new()
        .register(Arc::new(MockHandler::new()))
        .build(&[], &[]);

    let mut server = Server::new(config, Arc::clone(&backend) as Arc<dyn courier::Backend>, registry);
    server.start().await.expect("server start");
    let addr = server.address().expect("bound address");

    TestServer {
        server,
        addr,
        backend,
        spool,
    }
}

#[tokio::test]
async fn receives_inbound_msg_and_writes_log() {
    let mut ts = start_server().await;

    let url = format!(
        "http://{}/c/mck/{CHANNEL_UUID}/receive?from=2065551212&text=hello",
        ts.addr
    );
    let response = reqwest::get(&url).await.expect("request");
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().await.expect("body");
    assert!(body.contains("ok"), "body was: {body}");

    {
        let state = ts.backend.state();
        assert_eq!(state.written_msgs.len(), 1);
        assert_eq!(state.written_msgs[0].urn.as_str(), "tel:+12065551212");
        assert_eq!(state.written_msgs[0].text, "hello");
        assert_eq!(state.written_logs.len(), 1);
        assert_eq!(state.written_logs[0].http_logs.len(), 1);
        assert!(state.written_logs[0].attached);
    }

    ts.server.stop().await;
}

#[tokio::test]
async fn validation_failures_get_one_error_item_each() {
    let mut ts = start_server().await;

    let url = format!("http://{}/c/mck/{CHANNEL_UUID}/receive", ts.addr);
    let response = reqwest::get(&url).await.expect("request");
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.expect("json");
    let data = body["data"].as_array().expect("data");
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["type"], "error");
    assert_eq!(data[0]["error"], "field 'from' required");
    assert_eq!(data[1]["error"], "field 'text' required");

    ts.server.stop().await;
}

#[tokio::test]
async fn unknown_routes_and_methods_are_json_envelopes() {
    let mut ts = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{}/c/mck/{CHANNEL_UUID}/nope", ts.addr))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 404);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["data"][0]["type"], "error");

    // receive is GET-only
    let response = client
        .post(format!(
            "http://{}/c/mck/{CHANNEL_UUID}/receive?from=1&text=x",
            ts.addr
        ))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 405);

    ts.server.stop().await;
}

#[tokio::test]
async fn unknown_channel_is_a_provider_error() {
    let mut ts = start_server().await;

    let url = format!(
        "http://{}/c/mck/{}/receive?from=2065551212&text=hi",
        ts.addr,
        Uuid::new_v4()
    );
    let response = reqwest::get(&url).await.expect("request");
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["data"][0]["error"], "channel not found");

    ts.server.stop().await;
}

#[tokio::test]
async fn handler_panics_become_500_and_server_survives() {
    let mut ts = start_server().await;

    let url = format!(
        "http://{}/c/mck/{CHANNEL_UUID}/receive?from=2065551212&text=panic!",
        ts.addr
    );
    let response = reqwest::get(&url).await.expect("request");
    assert_eq!(response.status().as_u16(), 500);

    // the panic was recorded on the channel log
    {
        let state = ts.backend.state();
        assert_eq!(state.written_logs.len(), 1);
        assert_eq!(state.written_logs[0].errors.len(), 1);
    }

    // and the server keeps serving
    let url = format!(
        "http://{}/c/mck/{CHANNEL_UUID}/receive?from=2065551212&text=hello",
        ts.addr
    );
    let response = reqwest::get(&url).await.expect("request");
    assert_eq!(response.status().as_u16(), 200);

    ts.server.stop().await;
}

#[tokio::test]
async fn backend_outage_spools_msg_and_still_answers_200() {
    let mut ts = start_server().await;
    ts.backend.set_fail_writes(true);

    let url = format!(
        "http://{}/c/mck/{CHANNEL_UUID}/receive?from=2065551212&text=hello",
        ts.addr
    );
    let response = reqwest::get(&url).await.expect("request");
    // the provider must not retry into an outage
    assert_eq!(response.status().as_u16(), 200);

    let spooled: Vec<_> = std::fs::read_dir(ts.spool.path().join("msgs"))
        .expect("spool dir")
        .collect();
    assert_eq!(spooled.len(), 1);
    assert!(ts.backend.state().written_msgs.is_empty());

    ts.server.stop().await;
}

#[tokio::test]
async fn index_lists_routes_and_health() {
    let mut ts = start_server().await;

    let body = reqwest::get(format!("http://{}/", ts.addr))
        .await
        .expect("request")
        .text()
        .await
        .expect("body");
    assert!(body.contains("courier"));
    assert!(body.contains("Health: OK"));
    assert!(body.contains("GET /c/mck/{uuid}/receive"));

    ts.server.stop().await;
}

#[tokio::test]
async fn status_page_requires_basic_auth() {
    let mut ts = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{}/status", ts.addr))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 401);

    let response = client
        .get(format!("http://{}/status", ts.addr))
        .basic_auth("admin", Some("squirrel"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.text().await.expect("body").contains("queued: 0"));

    ts.server.stop().await;
}

#[tokio::test]
async fn inbound_external_id_dedup() {
    let mut ts = start_server().await;

    let url = format!(
        "http://{}/c/mck/{CHANNEL_UUID}/receive?from=2065551212&text=hello&external_id=abc",
        ts.addr
    );
    reqwest::get(&url).await.expect("request");
    reqwest::get(&url).await.expect("request");

    assert_eq!(ts.backend.state().written_msgs.len(), 1);

    ts.server.stop().await;
}
