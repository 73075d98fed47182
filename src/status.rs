//! Delivery status transitions for outbound messages.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::msg::MsgId;
use crate::urns::Urn;

/// Delivery states of an outbound message.
///
/// Pending → Queued → Wired → (Sent | Delivered | Read) on the success path;
/// Errored is retryable, Failed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgStatus {
    Pending,
    Queued,
    /// Handed to the provider; awaiting provider confirmation.
    Wired,
    Sent,
    Delivered,
    Read,
    /// The attempt failed but the queue may retry.
    Errored,
    /// Terminal failure; the message will not be retried.
    Failed,
}

impl MsgStatus {
    /// Terminal states are read-only; no further updates apply.
    pub fn is_terminal(self) -> bool {
        matches!(self, MsgStatus::Failed | MsgStatus::Read)
    }
}

/// A mutation of an outbound message's delivery state.
///
/// The message is identified by its row id, its provider-assigned external
/// id, or both; construction requires at least one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub channel_uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<MsgId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub status: MsgStatus,
    /// External id newly assigned by the provider during this transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext_id_assignment: Option<String>,
    /// `(old, new)` rewrite for providers that return a normalized address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urn_update: Option<(Urn, Urn)>,
    /// Channel log recorded during the attempt that produced this update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_uuid: Option<Uuid>,
}

impl StatusUpdate {
    /// Status update addressed by message row id.
    pub fn by_id(channel_uuid: Uuid, msg_id: MsgId, status: MsgStatus) -> Self {
        StatusUpdate {
            channel_uuid,
            msg_id: Some(msg_id),
            external_id: None,
            status,
            ext_id_assignment: None,
            urn_update: None,
            log_uuid: None,
        }
    }

    /// Status update addressed by provider-assigned external id.
    pub fn by_external_id(channel_uuid: Uuid, external_id: &str, status: MsgStatus) -> Self {
        StatusUpdate {
            channel_uuid,
            msg_id: None,
            external_id: Some(external_id.to_string()),
            status,
            ext_id_assignment: None,
            urn_update: None,
            log_uuid: None,
        }
    }

    pub fn set_ext_id(&mut self, ext_id: &str) {
        self.ext_id_assignment = Some(ext_id.to_string());
    }

    pub fn set_urn_update(&mut self, old: Urn, new: Urn) {
        self.urn_update = Some((old, new));
    }

    pub fn set_log_uuid(&mut self, uuid: Uuid) {
        self.log_uuid = Some(uuid);
    }
}
