//! Mock backend and handler used by the test suite and by the `memory`
//! backend selector for local development.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use axum::http::Method;
use uuid::Uuid;

use crate::backend::Backend;
use crate::channel::{Channel, ChannelType};
use crate::clog::{ChannelLog, ChannelLogType};
use crate::error::{BackendError, FieldError, RequestError, SendError};
use crate::event::{ChannelEvent, ChannelEventType};
use crate::handler::{
    AttachmentRequestBuilder, ChannelHandler, HandlerRequest, HandlerRoute, ReceiveEvent,
    SendResult,
};
use crate::httpx::{self, NetworkPolicy};
use crate::msg::{MsgId, MsgIn, MsgOut};
use crate::status::{MsgStatus, StatusUpdate};
use crate::urns::Urn;

/// Everything the mock backend has observed, exposed for assertions.
#[derive(Default)]
pub struct MockState {
    pub channels: HashMap<Uuid, Channel>,
    pub queue: VecDeque<MsgOut>,
    pub sent: HashSet<MsgId>,
    pub written_msgs: Vec<MsgIn>,
    pub written_statuses: Vec<StatusUpdate>,
    pub written_events: Vec<ChannelEvent>,
    pub written_logs: Vec<ChannelLog>,
    pub seen_external_ids: HashSet<(Uuid, String)>,
    pub saved_attachments: Vec<(String, String, usize)>,
    pub completed: Vec<(MsgId, MsgStatus)>,
    /// When set, message/status/event writes fail, exercising the spool.
    pub fail_writes: bool,
    pub stopped: bool,
}

/// In-memory backend. Channels, the queue and all observed writes live
/// behind one lock; no call holds it across an await.
pub struct MockBackend {
    state: Mutex<MockState>,
    policy: NetworkPolicy,
    client: reqwest::Client,
    client_no_redirect: reqwest::Client,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        MockBackend {
            state: Mutex::new(MockState::default()),
            policy: NetworkPolicy::default(),
            client: reqwest::Client::new(),
            client_no_redirect: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("http client"),
        }
    }

    pub fn with_policy(mut self, policy: NetworkPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state lock")
    }

    pub fn add_channel(&self, channel: Channel) {
        self.state().channels.insert(channel.uuid, channel);
    }

    pub fn queue_msg(&self, msg: MsgOut) {
        self.state().queue.push_back(msg);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn start(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.state().stopped = true;
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn get_channel(
        &self,
        channel_type: &ChannelType,
        uuid: Uuid,
    ) -> Result<Channel, BackendError> {
        let state = self.state();
        let channel = state.channels.get(&uuid).ok_or(BackendError::ChannelNotFound)?;
        if &channel.channel_type != channel_type {
            return Err(BackendError::ChannelWrongType {
                expected: channel_type.to_string(),
                found: channel.channel_type.to_string(),
            });
        }
        Ok(channel.clone())
    }

    async fn pop_next_outgoing_msg(&self) -> Result<Option<MsgOut>, BackendError> {
        Ok(self.state().queue.pop_front())
    }

    async fn was_msg_sent(&self, id: MsgId) -> Result<bool, BackendError> {
        Ok(self.state().sent.contains(&id))
    }

    async fn clear_msg_sent(&self, id: MsgId) -> Result<(), BackendError> {
        self.state().sent.remove(&id);
        Ok(())
    }

    async fn mark_outgoing_msg_complete(
        &self,
        msg: &MsgOut,
        status: &StatusUpdate,
    ) -> Result<(), BackendError> {
        let mut state = self.state();
        if status.status == MsgStatus::Wired {
            state.sent.insert(msg.id);
        }
        state.completed.push((msg.id, status.status));
        Ok(())
    }

    async fn write_msg(&self, msg: &MsgIn) -> Result<(), BackendError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(BackendError::Storage {
                reason: "mock backend unavailable".to_string(),
            });
        }
        state.written_msgs.push(msg.clone());
        Ok(())
    }

    async fn write_status_update(&self, status: &StatusUpdate) -> Result<(), BackendError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(BackendError::Storage {
                reason: "mock backend unavailable".to_string(),
            });
        }
        state.written_statuses.push(status.clone());
        Ok(())
    }

    async fn write_channel_event(&self, event: &ChannelEvent) -> Result<(), BackendError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(BackendError::Storage {
                reason: "mock backend unavailable".to_string(),
            });
        }
        state.written_events.push(event.clone());
        Ok(())
    }

    async fn write_channel_log(&self, clog: &ChannelLog) -> Result<(), BackendError> {
        self.state().written_logs.push(clog.clone());
        Ok(())
    }

    async fn check_external_id_seen(&self, msg: &MsgIn) -> Result<bool, BackendError> {
        let Some(external_id) = &msg.external_id else {
            return Ok(false);
        };
        let key = (msg.channel_uuid, external_id.clone());
        Ok(self.state().seen_external_ids.contains(&key))
    }

    async fn write_external_id_seen(&self, msg: &MsgIn) -> Result<(), BackendError> {
        if let Some(external_id) = &msg.external_id {
            let key = (msg.channel_uuid, external_id.clone());
            self.state().seen_external_ids.insert(key);
        }
        Ok(())
    }

    fn new_incoming_msg(
        &self,
        channel: &Channel,
        urn: Urn,
        text: &str,
        clog: &ChannelLog,
    ) -> MsgIn {
        MsgIn::new(channel, urn, text, clog.uuid)
    }

    async fn save_attachment(
        &self,
        _channel: &Channel,
        content_type: &str,
        data: &[u8],
        extension: &str,
    ) -> Result<String, BackendError> {
        let url = format!("https://media.test.courier.io/{}.{}", Uuid::new_v4(), extension);
        self.state()
            .saved_attachments
            .push((url.clone(), content_type.to_string(), data.len()));
        Ok(url)
    }

    fn http_client(&self, allow_redirects: bool) -> reqwest::Client {
        if allow_redirects {
            self.client.clone()
        } else {
            self.client_no_redirect.clone()
        }
    }

    fn http_access(&self) -> NetworkPolicy {
        self.policy.clone()
    }

    async fn health(&self) -> String {
        String::new()
    }

    async fn status(&self) -> String {
        let state = self.state();
        format!(
            "queued: {}, written msgs: {}, written statuses: {}",
            state.queue.len(),
            state.written_msgs.len(),
            state.written_statuses.len()
        )
    }

    async fn heartbeat(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Mock channel handler, registered under the `MCK` type tag.
///
/// Its send behavior is driven by channel config so tests (and the memory
/// dev mode) can exercise every classification path:
///
/// - `send_url`: POST the message text there, treat the response body as
///   the external id
/// - `send_error`: return the named sentinel without any HTTP traffic
/// - `send_external_id` / `send_new_urn`: record into the send result
/// - `secret`: value redacted from all logs emitted for the channel
pub struct MockHandler {
    channel_type: ChannelType,
}

impl Default for MockHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHandler {
    pub fn new() -> Self {
        MockHandler {
            channel_type: "MCK".parse().expect("static tag"),
        }
    }

    pub fn with_type(channel_type: ChannelType) -> Self {
        MockHandler { channel_type }
    }

    fn receive_msg(
        &self,
        backend: &dyn Backend,
        channel: &Channel,
        request: &HandlerRequest,
        clog: &ChannelLog,
    ) -> Result<Vec<ReceiveEvent>, RequestError> {
        let from = request.query_param("from");
        let text = request.query_param("text");

        let mut missing = Vec::new();
        if from.as_deref().is_none_or(str::is_empty) {
            missing.push(FieldError {
                name: "from".to_string(),
                tag: "required".to_string(),
            });
        }
        if text.is_none() {
            missing.push(FieldError {
                name: "text".to_string(),
                tag: "required".to_string(),
            });
        }
        if !missing.is_empty() {
            return Err(RequestError::Validation(missing));
        }
        let (from, text) = (from.unwrap_or_default(), text.unwrap_or_default());
        if text == "panic!" {
            panic!("mock receive panic");
        }

        let urn = Urn::from_tel(&from, &channel.country)
            .map_err(|e| RequestError::Payload(format!("invalid sender: {e}")))?;
        let mut msg = backend.new_incoming_msg(channel, urn, &text, clog);
        if let Some(ext_id) = request.query_param("external_id") {
            msg = msg.with_external_id(ext_id);
        }
        Ok(vec![ReceiveEvent::Msg(msg)])
    }

    fn receive_status(
        &self,
        backend: &dyn Backend,
        channel: &Channel,
        request: &HandlerRequest,
        clog: &ChannelLog,
    ) -> Result<Vec<ReceiveEvent>, RequestError> {
        let id: MsgId = request
            .query_param("id")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| RequestError::required("id"))?;
        let status = match request.query_param("status").as_deref() {
            Some("sent") => MsgStatus::Sent,
            Some("delivered") => MsgStatus::Delivered,
            Some("read") => MsgStatus::Read,
            Some("failed") => MsgStatus::Failed,
            _ => return Err(RequestError::required("status")),
        };
        Ok(vec![ReceiveEvent::Status(backend.new_status_update(
            channel, id, status, clog,
        ))])
    }
}

#[async_trait]
impl ChannelHandler for MockHandler {
    fn channel_type(&self) -> ChannelType {
        self.channel_type.clone()
    }

    fn channel_name(&self) -> &str {
        "Mock"
    }

    fn redact_values(&self, channel: &Channel) -> Vec<String> {
        let secret = channel.config_string("secret", "");
        if secret.is_empty() { Vec::new() } else { vec![secret] }
    }

    fn routes(&self) -> Vec<HandlerRoute> {
        vec![
            HandlerRoute::new(Method::GET, "receive", ChannelLogType::MsgReceive),
            HandlerRoute::new(Method::POST, "status", ChannelLogType::MsgStatus),
            HandlerRoute::new(Method::GET, "stopped", ChannelLogType::EventReceive),
        ]
    }

    async fn receive(
        &self,
        backend: &dyn Backend,
        channel: Option<&Channel>,
        request: &HandlerRequest,
        clog: &mut ChannelLog,
    ) -> Result<Vec<ReceiveEvent>, RequestError> {
        let channel = channel.ok_or_else(|| RequestError::required("uuid"))?;
        match request.action.as_str() {
            "receive" => self.receive_msg(backend, channel, request, clog),
            "status" => self.receive_status(backend, channel, request, clog),
            "stopped" => {
                let from = request
                    .query_param("from")
                    .ok_or_else(|| RequestError::required("from"))?;
                let urn = Urn::from_tel(&from, &channel.country)
                    .map_err(|e| RequestError::Payload(format!("invalid sender: {e}")))?;
                let event =
                    backend.new_channel_event(channel, ChannelEventType::StopContact, urn, clog);
                Ok(vec![ReceiveEvent::Event(event)])
            }
            other => Err(RequestError::Payload(format!("unknown action '{other}'"))),
        }
    }

    async fn send(
        &self,
        backend: &dyn Backend,
        msg: &MsgOut,
        result: &mut SendResult,
        clog: &mut ChannelLog,
    ) -> Result<(), SendError> {
        let channel = &msg.channel;

        match channel.config_string("send_error", "").as_str() {
            "" => {}
            "channel_config" => {
                return Err(SendError::ChannelConfig {
                    reason: "missing auth token".to_string(),
                });
            }
            "connection_failed" => {
                return Err(SendError::ConnectionFailed {
                    reason: "connection refused".to_string(),
                });
            }
            "connection_throttled" => return Err(SendError::ConnectionThrottled),
            "response_status" => return Err(SendError::ResponseStatus { status: 403 }),
            "response_unparseable" => {
                return Err(SendError::ResponseUnparseable {
                    reason: "invalid character 'x'".to_string(),
                });
            }
            "response_unexpected" => {
                return Err(SendError::ResponseUnexpected {
                    reason: "expected 'ok' to be true".to_string(),
                });
            }
            "contact_stopped" => return Err(SendError::ContactStopped),
            "rejected" => {
                return Err(SendError::FailedWithReason {
                    code: "1890".to_string(),
                    description: "sender id not registered".to_string(),
                });
            }
            "panic" => panic!("mock handler panic"),
            other => {
                return Err(SendError::Internal {
                    reason: format!("unknown mock error '{other}'"),
                });
            }
        }

        let send_url = channel.config_string("send_url", "");
        if !send_url.is_empty() {
            let client = backend.http_client(false);
            let request = client
                .post(&send_url)
                .header(
                    "Authorization",
                    format!("Token {}", channel.config_string("secret", "")),
                )
                .body(msg.text.clone())
                .build()
                .map_err(|e| SendError::Internal { reason: e.to_string() })?;
            let response = httpx::request_traced(&client, request, clog, None, 1024 * 1024)
                .await
                .map_err(|e| match e {
                    httpx::FetchError::Connection { reason } => {
                        SendError::ConnectionFailed { reason }
                    }
                    other => SendError::Internal {
                        reason: other.to_string(),
                    },
                })?;
            if !response.is_success() {
                return Err(SendError::ResponseStatus {
                    status: response.status,
                });
            }
            let body = String::from_utf8_lossy(&response.body);
            let ext_id = body.trim();
            if !ext_id.is_empty() {
                result.set_external_id(ext_id);
            }
        }

        if let Some(ext_id) = channel.config.get("send_external_id").and_then(|v| v.as_str()) {
            result.set_external_id(ext_id);
        }
        if let Some(new_urn) = channel.config.get("send_new_urn").and_then(|v| v.as_str()) {
            let urn = Urn::parse(new_urn).map_err(|e| SendError::Internal {
                reason: format!("invalid rewrite urn: {e}"),
            })?;
            result.set_new_urn(urn);
        }
        Ok(())
    }

    fn attachment_request_builder(&self) -> Option<&dyn AttachmentRequestBuilder> {
        Some(self)
    }
}

#[async_trait]
impl AttachmentRequestBuilder for MockHandler {
    async fn build_attachment_request(
        &self,
        backend: &dyn Backend,
        channel: &Channel,
        url: &str,
    ) -> Result<reqwest::Request, RequestError> {
        backend
            .http_client(true)
            .get(url)
            .header(
                "Authorization",
                format!("Token {}", channel.config_string("secret", "")),
            )
            .build()
            .map_err(|e| RequestError::Payload(format!("invalid attachment url: {e}")))
    }
}

/// A test channel of the given type with the supplied config values.
pub fn make_channel(channel_type: &str, config: serde_json::Value) -> Channel {
    let config = match config {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Channel::new(
        Uuid::new_v4(),
        channel_type.parse().expect("channel type"),
        "Test Channel",
        "+12065551212",
        "US",
    )
    .with_config(config)
}
