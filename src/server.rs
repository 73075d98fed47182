//! The HTTP server and the channel-route request wrapper.
//!
//! Channel webhooks are mounted at `/c/{type}/{uuid}/{action}` (or
//! `/c/{type}/{action}` for handlers that do not embed channel UUIDs in
//! their routes). Every channel request runs through the same pipeline:
//! hard timeout, channel lookup, panic guard, handler callback, backend
//! writes with spool fallback, and channel-log emission strictly after the
//! response is finalized so the log carries both request and response bytes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use base64::Engine;
use chrono::Utc;
use futures::FutureExt;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::attachments;
use crate::backend::Backend;
use crate::clog::{ChannelLog, ChannelLogType, ErrorCode, LogError};
use crate::config::Config;
use crate::error::{FieldError, RequestError, ServerError, SpoolError};
use crate::handler::{ChannelHandler, HandlerRequest, ReceiveEvent};
use crate::metrics;
use crate::msg::{MsgId, MsgIn};
use crate::registry::HandlerRegistry;
use crate::responses::{self, Envelope};
use crate::sender::Foreman;
use crate::spool::{Spool, write_to_spool};
use crate::status::StatusUpdate;

/// Hard ceiling on one handler invocation.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest webhook body we will buffer.
const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Backend liveness ping cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

struct RouteEntry {
    handler: Arc<dyn ChannelHandler>,
    method: Method,
    log_type: ChannelLogType,
}

struct AppState {
    backend: Arc<dyn Backend>,
    registry: Arc<HandlerRegistry>,
    config: Config,
    /// `(type, action)` → the handler routes registered for it.
    routes: HashMap<(String, String), Vec<RouteEntry>>,
    /// Sorted display lines for the index page.
    route_lines: Vec<String>,
}

/// The gateway server: HTTP surface, sender pool, spool flusher, heartbeat.
pub struct Server {
    backend: Arc<dyn Backend>,
    registry: Arc<HandlerRegistry>,
    state: Arc<AppState>,
    addr: Option<SocketAddr>,
    foreman: Option<Foreman>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: JoinSet<()>,
}

impl Server {
    /// Assemble the server. Routes are collected from the registry here;
    /// nothing registers afterwards.
    pub fn new(config: Config, backend: Arc<dyn Backend>, registry: HandlerRegistry) -> Self {
        let registry = Arc::new(registry);
        let mut routes: HashMap<(String, String), Vec<RouteEntry>> = HashMap::new();
        let mut route_lines = Vec::new();

        for handler in registry.active() {
            let tag = handler.channel_type().to_string().to_lowercase();
            for route in handler.routes() {
                let pattern = if handler.use_channel_route_uuid() {
                    format!("{} /c/{}/{{uuid}}/{}", route.method, tag, route.action)
                } else {
                    format!("{} /c/{}/{}", route.method, tag, route.action)
                };
                route_lines.push(pattern);
                routes
                    .entry((tag.clone(), route.action.clone()))
                    .or_default()
                    .push(RouteEntry {
                        handler: Arc::clone(handler),
                        method: route.method,
                        log_type: route.log_type,
                    });
            }
        }
        route_lines.sort();

        let state = Arc::new(AppState {
            backend: Arc::clone(&backend),
            registry: Arc::clone(&registry),
            config,
            routes,
            route_lines,
        });

        Server {
            backend,
            registry,
            state,
            addr: None,
            foreman: None,
            shutdown: None,
            tasks: JoinSet::new(),
        }
    }

    /// Start the backend, spool flusher, heartbeat, sender pool and HTTP
    /// listener.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        let config = &self.state.config;
        self.backend.start().await?;

        let mut spool = Spool::new(&config.spool_dir)?;
        register_backend_flushers(&mut spool, &self.backend)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.tasks.spawn(spool.run(shutdown_rx.clone()));
        self.tasks
            .spawn(heartbeat(Arc::clone(&self.backend), shutdown_rx.clone()));

        self.foreman = Some(Foreman::start(
            Arc::clone(&self.backend),
            Arc::clone(&self.registry),
            config.spool_dir.clone(),
            config.max_workers,
        ));

        let app = router(Arc::clone(&self.state));
        let bind = format!("{}:{}", config.address, config.port);
        let listener =
            tokio::net::TcpListener::bind(&bind)
                .await
                .map_err(|e| ServerError::Bind {
                    address: bind.clone(),
                    reason: e.to_string(),
                })?;
        self.addr = listener.local_addr().ok();

        let mut http_shutdown = shutdown_rx;
        self.tasks.spawn(async move {
            let graceful = async move {
                let _ = http_shutdown.changed().await;
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(graceful).await {
                tracing::error!(error = %e, "http server error");
            }
        });
        self.shutdown = Some(shutdown_tx);

        tracing::info!(
            address = %self.addr.map(|a| a.to_string()).unwrap_or_default(),
            version = %self.state.config.version,
            handlers = self.registry.len(),
            "server started"
        );
        Ok(())
    }

    /// Graceful shutdown: foreman drains, HTTP requests complete within
    /// their own deadlines, spool flusher exits at its next check, then the
    /// backend releases its pools.
    pub async fn stop(&mut self) {
        tracing::info!("stopping server");
        if let Some(foreman) = self.foreman.take() {
            foreman.stop().await;
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Err(e) = self.backend.stop().await {
            tracing::error!(error = %e, "error stopping backend");
        }
        while self.tasks.join_next().await.is_some() {}
        if let Err(e) = self.backend.cleanup().await {
            tracing::error!(error = %e, "error cleaning up backend");
        }
        tracing::info!("server stopped");
    }

    /// The bound listen address, once started.
    pub fn address(&self) -> Option<SocketAddr> {
        self.addr
    }
}

fn register_backend_flushers(spool: &mut Spool, backend: &Arc<dyn Backend>) -> Result<(), SpoolError> {
    let b = Arc::clone(backend);
    spool.register(
        "msgs",
        Box::new(move |bytes: Vec<u8>| {
            let b = Arc::clone(&b);
            async move {
                let msg: MsgIn =
                    serde_json::from_slice(&bytes).map_err(|e| SpoolError::Unparseable {
                        reason: e.to_string(),
                    })?;
                b.write_msg(&msg).await.map_err(|e| SpoolError::Flush {
                    reason: e.to_string(),
                })
            }
            .boxed()
        }),
    )?;

    let b = Arc::clone(backend);
    spool.register(
        "statuses",
        Box::new(move |bytes: Vec<u8>| {
            let b = Arc::clone(&b);
            async move {
                let status: StatusUpdate =
                    serde_json::from_slice(&bytes).map_err(|e| SpoolError::Unparseable {
                        reason: e.to_string(),
                    })?;
                b.write_status_update(&status)
                    .await
                    .map_err(|e| SpoolError::Flush {
                        reason: e.to_string(),
                    })
            }
            .boxed()
        }),
    )?;
    Ok(())
}

async fn heartbeat(backend: Arc<dyn Backend>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick fires immediately
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = backend.heartbeat().await {
                    tracing::error!(error = %e, "backend heartbeat failed");
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status_page))
        .route("/c/_fetch-attachment", post(fetch_attachment))
        .route("/c/{type}/{uuid}/{action}", any(channel_request_with_uuid))
        .route("/c/{type}/{action}", any(channel_request_bare))
        .fallback(|| async { responses::not_found() })
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    let health = state.backend.health().await;
    let health = if health.is_empty() { "OK".to_string() } else { health };
    let mut page = String::new();
    page.push_str("<html><head><title>courier</title></head><body><pre>\n");
    page.push_str(&format!("courier {}\n", state.config.version));
    page.push_str(&format!("Health: {health}\n\nRoutes:\n"));
    for line in &state.route_lines {
        page.push_str(&format!("  {line}\n"));
    }
    page.push_str("</pre></body></html>");
    Html(page)
}

async fn status_page(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
) -> Response {
    let expected_user = &state.config.status_username;
    let expected_pass = state
        .config
        .status_password
        .as_ref()
        .map(|p| p.expose_secret().to_string())
        .unwrap_or_default();
    if expected_user.is_empty() || expected_pass.is_empty() || !basic_auth_ok(&headers, expected_user, &expected_pass)
    {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"courier\"")],
            "Unauthorized",
        )
            .into_response();
    }

    let status = state.backend.status().await;
    Html(format!(
        "<html><head><title>courier</title></head><body><pre>\ncourier {}\n\n{}\n</pre></body></html>",
        state.config.version, status
    ))
    .into_response()
}

fn basic_auth_ok(headers: &axum::http::HeaderMap, user: &str, pass: &str) -> bool {
    let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((got_user, got_pass)) = decoded.split_once(':') else {
        return false;
    };
    bool::from(got_user.as_bytes().ct_eq(user.as_bytes()))
        && bool::from(got_pass.as_bytes().ct_eq(pass.as_bytes()))
}

fn bearer_auth_ok(headers: &axum::http::HeaderMap, token: &str) -> bool {
    let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    // auth-scheme comparison is case-insensitive per RFC 6750
    if value.len() <= 7 || !value[..7].eq_ignore_ascii_case("Bearer ") {
        return false;
    }
    bool::from(value[7..].as_bytes().ct_eq(token.as_bytes()))
}

#[derive(Debug, Deserialize)]
struct FetchAttachmentRequest {
    channel_type: Option<String>,
    channel_uuid: Option<Uuid>,
    url: Option<String>,
    msg_id: Option<MsgId>,
}

#[derive(Debug, Serialize)]
struct FetchAttachmentResponse {
    attachment: crate::msg::Attachment,
    log_uuid: Uuid,
}

async fn fetch_attachment(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let Some(token) = state.config.auth_token.as_ref() else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };
    if !bearer_auth_ok(&headers, token.expose_secret()) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let request: FetchAttachmentRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return responses::error_response(&RequestError::Payload(format!(
                "unable to parse request JSON: {e}"
            )));
        }
    };

    let mut missing = Vec::new();
    for (name, absent) in [
        ("channel_type", request.channel_type.is_none()),
        ("channel_uuid", request.channel_uuid.is_none()),
        ("url", request.url.is_none()),
    ] {
        if absent {
            missing.push(FieldError {
                name: name.to_string(),
                tag: "required".to_string(),
            });
        }
    }
    if !missing.is_empty() {
        return responses::error_response(&RequestError::Validation(missing));
    }
    let (channel_type, channel_uuid, url) = (
        request.channel_type.unwrap_or_default(),
        request.channel_uuid.unwrap_or_default(),
        request.url.unwrap_or_default(),
    );

    let Ok(channel_type) = channel_type.parse::<crate::channel::ChannelType>() else {
        return responses::error_response(&RequestError::Payload(format!(
            "invalid channel type '{channel_type}'"
        )));
    };
    let channel = match state.backend.get_channel(&channel_type, channel_uuid).await {
        Ok(channel) => channel,
        Err(e) => return responses::error_response(&RequestError::Backend(e)),
    };

    let Some(handler) = state.registry.get(&channel_type) else {
        return responses::error_response(&RequestError::Payload(format!(
            "no handler for channel type '{channel_type}'"
        )));
    };

    let mut clog = ChannelLog::new(
        ChannelLogType::AttachmentFetch,
        &channel,
        &handler.redact_values(&channel),
    );
    if let Some(msg_id) = request.msg_id {
        clog.set_msg_id(msg_id);
    }

    let fetched =
        attachments::fetch_and_store(&*state.backend, &*handler, &channel, &url, &mut clog).await;

    clog.end();
    let log_uuid = clog.uuid;
    if let Err(e) = state.backend.write_channel_log(&clog).await {
        tracing::warn!(error = %e, "error writing attachment fetch log");
    }

    match fetched {
        Ok(attachment) => Json(FetchAttachmentResponse {
            attachment,
            log_uuid,
        })
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "error storing attachment");
            responses::internal_error()
        }
    }
}

async fn channel_request_with_uuid(
    State(state): State<Arc<AppState>>,
    Path((channel_type, uuid, action)): Path<(String, String, String)>,
    request: Request,
) -> Response {
    let Ok(uuid) = Uuid::parse_str(&uuid) else {
        return responses::not_found();
    };
    dispatch_channel_request(state, channel_type, Some(uuid), action, request).await
}

async fn channel_request_bare(
    State(state): State<Arc<AppState>>,
    Path((channel_type, action)): Path<(String, String)>,
    request: Request,
) -> Response {
    dispatch_channel_request(state, channel_type, None, action, request).await
}

async fn dispatch_channel_request(
    state: Arc<AppState>,
    channel_type: String,
    channel_uuid: Option<Uuid>,
    action: String,
    request: Request,
) -> Response {
    let tag = channel_type.to_lowercase();
    let method = request.method().clone();
    let (handler, log_type) = {
        let Some(entries) = state.routes.get(&(tag, action.clone())) else {
            return responses::not_found();
        };
        let Some(entry) = entries.iter().find(|e| e.method == method) else {
            return responses::method_not_allowed(&method);
        };
        (Arc::clone(&entry.handler), entry.log_type)
    };
    if handler.use_channel_route_uuid() != channel_uuid.is_some() {
        return responses::not_found();
    }

    let uri = request.uri().clone();
    let headers = request.headers().clone();
    let body = match axum::body::to_bytes(request.into_body(), MAX_REQUEST_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return responses::error_response(&RequestError::Payload(
                "request body too large".to_string(),
            ));
        }
    };

    let handler_request = HandlerRequest {
        method,
        uri,
        headers,
        body,
        channel_uuid,
        action,
    };

    match tokio::time::timeout(
        REQUEST_TIMEOUT,
        handle_channel_request(state, handler, log_type, handler_request),
    )
    .await
    {
        Ok(response) => response,
        Err(_) => responses::json(
            StatusCode::GATEWAY_TIMEOUT,
            Envelope::errors("Error", vec!["request timed out".to_string()]),
        ),
    }
}

/// The per-request pipeline around one handler invocation.
async fn handle_channel_request(
    state: Arc<AppState>,
    handler: Arc<dyn ChannelHandler>,
    log_type: ChannelLogType,
    request: HandlerRequest,
) -> Response {
    let backend = &*state.backend;
    let started_on = Utc::now();
    let start = Instant::now();
    let request_dump = request.dump();
    let url = request.uri.to_string();

    // channel resolution may legitimately come up empty for verification
    // handshakes; lookup failures are the provider's 400
    let channel = match handler.get_channel(backend, &request).await {
        Ok(channel) => channel,
        Err(e) => {
            tracing::info!(error = %e, url = %url, "error resolving channel");
            return responses::error_response(&e);
        }
    };

    let mut clog = match &channel {
        Some(channel) => {
            ChannelLog::new(log_type, channel, &handler.redact_values(channel))
        }
        None => ChannelLog::without_channel(log_type),
    };

    let outcome = std::panic::AssertUnwindSafe(handler.receive(
        backend,
        channel.as_ref(),
        &request,
        &mut clog,
    ))
    .catch_unwind()
    .await;

    let (events, response) = match outcome {
        Ok(Ok(events)) => {
            let response = responses::json(StatusCode::OK, Envelope::ok("ok", &events));
            (events, response)
        }
        Ok(Err(e)) => {
            // the provider misbehaved, not us
            tracing::info!(error = %e, url = %url, "error handling request");
            (Vec::new(), responses::error_response(&e))
        }
        Err(panic) => {
            let reason = match panic.downcast_ref::<&str>() {
                Some(s) => (*s).to_string(),
                None => panic
                    .downcast_ref::<String>()
                    .cloned()
                    .unwrap_or_else(|| "unknown panic".to_string()),
            };
            tracing::error!(%reason, url = %url, "panic handling request");
            clog.error(LogError::new(
                ErrorCode::InternalError,
                format!("panic handling request: {reason}"),
            ));
            (Vec::new(), responses::internal_error())
        }
    };

    // finalize the trace so the log carries both request and response bytes
    let response_dump = format!("HTTP/1.1 {}", response.status());
    clog.http(
        &url,
        response.status().as_u16(),
        &request_dump,
        &response_dump,
        start.elapsed(),
        started_on,
    );

    write_events(&state, &mut clog, &events).await;

    for event in &events {
        metrics::record_receive(&handler.channel_type().to_string(), event.kind());
        tracing::info!(
            channel_type = %handler.channel_type(),
            kind = event.kind(),
            log_uuid = %clog.uuid,
            "handled channel event"
        );
    }

    match &channel {
        Some(_) => {
            clog.end();
            if let Err(e) = backend.write_channel_log(&clog).await {
                tracing::warn!(error = %e, "error writing channel log");
            }
        }
        None => {
            tracing::info!(log_uuid = %clog.uuid, url = %url, "request handled without channel");
        }
    }

    response
}

/// Persist what the handler produced, spooling messages and statuses when
/// the backend is down. The provider still gets its 200 so it will not
/// retry into an outage.
async fn write_events(state: &Arc<AppState>, clog: &mut ChannelLog, events: &[ReceiveEvent]) {
    let backend = &*state.backend;
    let spool_dir = &state.config.spool_dir;

    for event in events {
        clog.attach();
        match event {
            ReceiveEvent::Msg(msg) => {
                match backend.check_external_id_seen(msg).await {
                    Ok(true) => {
                        tracing::info!(msg_uuid = %msg.uuid, "msg already seen, ignoring");
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => tracing::error!(error = %e, "error checking external id"),
                }
                if let Err(e) = backend.write_msg(msg).await {
                    tracing::warn!(error = %e, msg_uuid = %msg.uuid, "error writing msg, spooling");
                    if let Err(e) = write_to_spool(spool_dir, "msgs", msg).await {
                        tracing::error!(error = %e, msg_uuid = %msg.uuid, "error spooling msg");
                    }
                } else if let Err(e) = backend.write_external_id_seen(msg).await {
                    tracing::error!(error = %e, "error recording external id");
                }
            }
            ReceiveEvent::Status(status) => {
                if let Err(e) = backend.write_status_update(status).await {
                    tracing::warn!(error = %e, "error writing status, spooling");
                    if let Err(e) = write_to_spool(spool_dir, "statuses", status).await {
                        tracing::error!(error = %e, "error spooling status");
                    }
                }
            }
            ReceiveEvent::Event(event) => {
                if let Err(e) = backend.write_channel_event(event).await {
                    tracing::error!(error = %e, "error writing channel event");
                }
            }
        }
    }
}
