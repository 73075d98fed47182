//! Non-message provider signals.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::urns::Urn;

/// Kinds of channel events providers report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelEventType {
    NewConversation,
    Referral,
    StopContact,
    WelcomeMessage,
    OptIn,
    OptOut,
}

/// A non-message signal observed on a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub channel_uuid: Uuid,
    pub event_type: ChannelEventType,
    pub urn: Urn,
    /// Provider-specific details (referrer ids, payloads, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, String>,
    /// Auth tokens to store against the URN, for providers that issue them.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub urn_auth_tokens: HashMap<String, String>,
    pub created_on: DateTime<Utc>,
    /// When the event happened on the provider side, if reported.
    pub occurred_on: DateTime<Utc>,
    pub log_uuids: Vec<Uuid>,
}

impl ChannelEvent {
    pub fn new(channel_uuid: Uuid, event_type: ChannelEventType, urn: Urn, log_uuid: Uuid) -> Self {
        let now = Utc::now();
        ChannelEvent {
            channel_uuid,
            event_type,
            urn,
            extra: HashMap::new(),
            urn_auth_tokens: HashMap::new(),
            created_on: now,
            occurred_on: now,
            log_uuids: vec![log_uuid],
        }
    }

    pub fn with_extra(mut self, extra: HashMap<String, String>) -> Self {
        self.extra = extra;
        self
    }

    pub fn with_urn_auth_tokens(mut self, tokens: HashMap<String, String>) -> Self {
        self.urn_auth_tokens = tokens;
        self
    }

    pub fn with_occurred_on(mut self, occurred_on: DateTime<Utc>) -> Self {
        self.occurred_on = occurred_on;
        self
    }
}
