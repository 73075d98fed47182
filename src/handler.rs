//! The handler contract.
//!
//! A handler is the code that knows one provider's protocol. It declares the
//! webhook routes it services, resolves channels for inbound requests, parses
//! provider payloads into messages/statuses/events, and performs the provider
//! calls for outbound sends. Optional capabilities are exposed as accessor
//! methods returning trait objects, so the core never downcasts.

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, Uri};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::backend::Backend;
use crate::channel::{Channel, ChannelType};
use crate::clog::{ChannelLog, ChannelLogType};
use crate::error::{RequestError, SendError};
use crate::event::ChannelEvent;
use crate::msg::{MsgIn, MsgOut};
use crate::status::StatusUpdate;
use crate::urns::Urn;

/// An inbound HTTP request as handed to a handler callback.
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Channel UUID from the route, when the route embeds one.
    pub channel_uuid: Option<Uuid>,
    /// The route action (`receive`, `status`, ...).
    pub action: String,
}

impl HandlerRequest {
    /// First query parameter named `name`, URL-decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// First form-encoded body parameter named `name`.
    pub fn form_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(&self.body)
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RequestError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| RequestError::Payload(format!("unable to parse request JSON: {e}")))
    }

    /// Wire-format dump of the request for the channel log.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{} {} HTTP/1.1\r\n", self.method, self.uri));
        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\r\n", name, value.to_str().unwrap_or("<binary>")));
        }
        out.push_str("\r\n");
        out.push_str(&String::from_utf8_lossy(&self.body));
        out
    }
}

/// A webhook route a handler services under `/c/{type}`.
#[derive(Debug, Clone)]
pub struct HandlerRoute {
    pub method: Method,
    pub action: String,
    pub log_type: ChannelLogType,
}

impl HandlerRoute {
    pub fn new(method: Method, action: &str, log_type: ChannelLogType) -> Self {
        HandlerRoute {
            method,
            action: action.to_string(),
            log_type,
        }
    }
}

/// What a handler callback produced from an inbound request.
///
/// The request wrapper owns writing these to the backend (with spool
/// fallback for messages and statuses) and attaching the channel log.
#[derive(Debug, Clone)]
pub enum ReceiveEvent {
    Msg(MsgIn),
    Status(StatusUpdate),
    Event(ChannelEvent),
}

impl ReceiveEvent {
    /// Discriminator used in response envelopes and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ReceiveEvent::Msg(_) => "msg",
            ReceiveEvent::Status(_) => "status",
            ReceiveEvent::Event(_) => "event",
        }
    }
}

/// Mutable outcome of a send attempt, filled in by the handler.
///
/// The handler never constructs the final status update; the sender builds
/// it from the returned error shape plus whatever landed here.
#[derive(Debug, Default)]
pub struct SendResult {
    external_id: Option<String>,
    new_urn: Option<Urn>,
}

impl SendResult {
    /// Record the id the provider assigned to the message.
    pub fn set_external_id(&mut self, id: impl Into<String>) {
        self.external_id = Some(id.into());
    }

    /// Record a URN rewrite for providers that return a normalized address.
    pub fn set_new_urn(&mut self, urn: Urn) {
        self.new_urn = Some(urn);
    }

    pub fn external_id(&self) -> Option<&str> {
        self.external_id.as_deref()
    }

    pub fn new_urn(&self) -> Option<&Urn> {
        self.new_urn.as_ref()
    }
}

/// Provider-side display-name lookup for a URN.
#[async_trait]
pub trait UrnDescriber: Send + Sync {
    async fn describe_urn(
        &self,
        backend: &dyn Backend,
        channel: &Channel,
        urn: &Urn,
    ) -> Result<String, RequestError>;
}

/// Builds a provider-authenticated request to fetch media the provider
/// hosts behind auth. Consumed by the attachment fetch service.
#[async_trait]
pub trait AttachmentRequestBuilder: Send + Sync {
    async fn build_attachment_request(
        &self,
        backend: &dyn Backend,
        channel: &Channel,
        url: &str,
    ) -> Result<reqwest::Request, RequestError>;
}

/// One provider protocol adapter.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// The type tag this handler services (`TG`, `WA`, ...).
    fn channel_type(&self) -> ChannelType;

    /// Human name of the provider.
    fn channel_name(&self) -> &str;

    /// Whether this handler's routes embed a channel UUID.
    fn use_channel_route_uuid(&self) -> bool {
        true
    }

    /// Secret strings to redact from any log emitted on this handler's
    /// behalf, typically pulled from the channel config.
    fn redact_values(&self, _channel: &Channel) -> Vec<String> {
        Vec::new()
    }

    /// The webhook routes this handler services.
    fn routes(&self) -> Vec<HandlerRoute>;

    /// Resolve the channel for an inbound request.
    ///
    /// The default reads the UUID embedded in the route. Handlers whose
    /// webhooks precede channel identification (verification handshakes)
    /// may return `Ok(None)`; handlers that identify channels from signed
    /// headers override this entirely.
    async fn get_channel(
        &self,
        backend: &dyn Backend,
        request: &HandlerRequest,
    ) -> Result<Option<Channel>, RequestError> {
        let Some(uuid) = request.channel_uuid else {
            return Err(RequestError::required("uuid"));
        };
        Ok(Some(backend.get_channel(&self.channel_type(), uuid).await?))
    }

    /// Service one inbound webhook call, returning the messages, statuses
    /// and events parsed out of the provider payload.
    async fn receive(
        &self,
        backend: &dyn Backend,
        channel: Option<&Channel>,
        request: &HandlerRequest,
        clog: &mut ChannelLog,
    ) -> Result<Vec<ReceiveEvent>, RequestError>;

    /// Deliver one outbound message to the provider.
    ///
    /// Performs the provider call(s) through the traced client, records any
    /// externally assigned id or URN rewrite into `result`, and communicates
    /// the outcome through the returned [`SendError`] sentinel (or `Ok`).
    async fn send(
        &self,
        backend: &dyn Backend,
        msg: &MsgOut,
        result: &mut SendResult,
        clog: &mut ChannelLog,
    ) -> Result<(), SendError>;

    /// Optional capability: provider-side URN display-name lookup.
    fn urn_describer(&self) -> Option<&dyn UrnDescriber> {
        None
    }

    /// Optional capability: provider-authenticated media fetches.
    fn attachment_request_builder(&self) -> Option<&dyn AttachmentRequestBuilder> {
        None
    }
}
