//! Inbound and outbound messages.
//!
//! `MsgIn` is a message observed from a provider; `MsgOut` is a message to
//! deliver to one. They are distinct types because their fields differ
//! sharply: inbound messages are built inside handlers, outbound messages
//! arrive from the upstream queue fully formed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::{Channel, OrgId};
use crate::urns::Urn;

/// Database row id of an outgoing message.
pub type MsgId = i64;

/// Content type marking media the provider refused to give us; the message
/// proceeds without it.
pub const CONTENT_TYPE_UNAVAILABLE: &str = "unavailable";

/// A fetched or referenced piece of media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub content_type: String,
    pub url: String,
    pub size: usize,
}

impl Attachment {
    /// The fallback attachment for media that could not be fetched.
    pub fn unavailable(url: &str) -> Self {
        Attachment {
            content_type: CONTENT_TYPE_UNAVAILABLE.to_string(),
            url: url.to_string(),
            size: 0,
        }
    }
}

/// Where an outbound message originated upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgOrigin {
    Flow,
    Broadcast,
    Ticket,
    Chat,
}

/// Reference to an upstream entity (flow, opt-in, template...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedRef {
    pub uuid: Uuid,
    pub name: String,
}

/// Contact reference carried on outbound messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRef {
    pub id: i64,
    pub uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_on: Option<DateTime<Utc>>,
}

/// Template parameters for providers that send templated messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Templating {
    pub template: NamedRef,
    #[serde(default)]
    pub namespace: String,
    /// Provider-specific component structures, passed through untouched.
    #[serde(default)]
    pub components: serde_json::Value,
    /// Variable bindings, passed through untouched.
    #[serde(default)]
    pub variables: serde_json::Value,
    #[serde(default)]
    pub language: String,
}

/// A quick-reply option attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickReply {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

/// A message observed from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgIn {
    /// Time-ordered message UUID.
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub channel_uuid: Uuid,
    pub urn: Urn,
    pub text: String,
    /// Attachment URLs in the order the provider presented them.
    pub attachments: Vec<String>,
    /// Provider-assigned id, used for status reconciliation and dedup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub received_on: DateTime<Utc>,
    /// Channel logs produced while receiving this message.
    pub log_uuids: Vec<Uuid>,
}

impl MsgIn {
    /// Build an incoming message for `channel`. The caller (a handler) must
    /// ensure at least one of text or attachments ends up non-empty.
    pub fn new(channel: &Channel, urn: Urn, text: &str, log_uuid: Uuid) -> Self {
        MsgIn {
            uuid: Uuid::now_v7(),
            org_id: channel.org_id,
            channel_uuid: channel.uuid,
            urn,
            text: text.to_string(),
            attachments: Vec::new(),
            external_id: None,
            received_on: Utc::now(),
            log_uuids: vec![log_uuid],
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_attachment(mut self, url: impl Into<String>) -> Self {
        self.attachments.push(url.into());
        self
    }

    pub fn with_received_on(mut self, received_on: DateTime<Utc>) -> Self {
        self.received_on = received_on;
        self
    }

    /// A message must carry text or media to be writable.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.attachments.is_empty()
    }
}

/// A message to deliver to a provider.
///
/// Exactly one channel owns each outbound message for its entire send
/// lifecycle; the channel descriptor rides along from the queue pop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgOut {
    pub id: MsgId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub channel: Channel,
    pub urn: Urn,
    /// Provider auth token scoped to this URN, when the provider needs one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urn_auth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactRef>,
    pub text: String,
    pub attachments: Vec<String>,
    #[serde(default)]
    pub quick_replies: Vec<QuickReply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub templating: Option<Templating>,
    pub origin: MsgOrigin,
    #[serde(default)]
    pub high_priority: bool,
    /// External id of the message this one replies to, for threaded replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_to_external_id: Option<String>,
    #[serde(default)]
    pub is_resend: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<NamedRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opt_in: Option<NamedRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

impl MsgOut {
    /// Build an outbound message with the fields every send needs; optional
    /// fields start empty and are set by the upstream queue deserialization.
    pub fn new(id: MsgId, channel: Channel, urn: Urn, text: &str, origin: MsgOrigin) -> Self {
        MsgOut {
            id,
            uuid: Uuid::now_v7(),
            org_id: channel.org_id,
            channel,
            urn,
            urn_auth: None,
            contact: None,
            text: text.to_string(),
            attachments: Vec::new(),
            quick_replies: Vec::new(),
            locale: None,
            templating: None,
            origin,
            high_priority: false,
            response_to_external_id: None,
            is_resend: false,
            flow: None,
            opt_in: None,
            session_uuid: None,
            user_id: None,
        }
    }

    pub fn with_resend(mut self, is_resend: bool) -> Self {
        self.is_resend = is_resend;
        self
    }

    pub fn with_attachment(mut self, url: impl Into<String>) -> Self {
        self.attachments.push(url.into());
        self
    }
}
