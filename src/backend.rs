//! The backend contract.
//!
//! The gateway core is storage-agnostic: everything it needs from the
//! database, queue and object store sits behind this trait, consumed as an
//! `Arc<dyn Backend>`. Implementations are expected to be internally
//! thread-safe; the core calls them from the request path, the sender pool
//! and the spool flusher concurrently.

use async_trait::async_trait;
use uuid::Uuid;

use crate::channel::{Channel, ChannelType};
use crate::clog::ChannelLog;
use crate::error::BackendError;
use crate::event::{ChannelEvent, ChannelEventType};
use crate::httpx::NetworkPolicy;
use crate::msg::{MsgId, MsgIn, MsgOut};
use crate::status::{MsgStatus, StatusUpdate};
use crate::urns::Urn;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Open connection pools and start any background maintenance.
    async fn start(&self) -> Result<(), BackendError>;

    /// Stop accepting new work.
    async fn stop(&self) -> Result<(), BackendError>;

    /// Release connection pools. Called last, after all tasks have joined.
    async fn cleanup(&self) -> Result<(), BackendError>;

    /// Look up a channel by type and UUID.
    ///
    /// Errors distinguish [`BackendError::ChannelNotFound`],
    /// [`BackendError::ChannelWrongType`] and [`BackendError::ChannelExpired`].
    async fn get_channel(&self, channel_type: &ChannelType, uuid: Uuid)
    -> Result<Channel, BackendError>;

    /// Pop the next ready outbound message, blocking up to the caller's
    /// deadline. `None` means no work right now.
    async fn pop_next_outgoing_msg(&self) -> Result<Option<MsgOut>, BackendError>;

    /// Whether this message was already handed to its provider.
    async fn was_msg_sent(&self, id: MsgId) -> Result<bool, BackendError>;

    /// Clear the sent marker ahead of a deliberate resend.
    async fn clear_msg_sent(&self, id: MsgId) -> Result<(), BackendError>;

    /// Mark the send task complete, freeing the message's queue slot.
    /// Called exactly once per processed message, after the status write.
    async fn mark_outgoing_msg_complete(
        &self,
        msg: &MsgOut,
        status: &StatusUpdate,
    ) -> Result<(), BackendError>;

    /// Persist an inbound message.
    async fn write_msg(&self, msg: &MsgIn) -> Result<(), BackendError>;

    /// Persist a status transition.
    async fn write_status_update(&self, status: &StatusUpdate) -> Result<(), BackendError>;

    /// Persist a channel event.
    async fn write_channel_event(&self, event: &ChannelEvent) -> Result<(), BackendError>;

    /// Persist a channel log.
    async fn write_channel_log(&self, clog: &ChannelLog) -> Result<(), BackendError>;

    /// Whether an inbound message with this external id was already written.
    async fn check_external_id_seen(&self, msg: &MsgIn) -> Result<bool, BackendError>;

    /// Record an inbound external id so later duplicates are dropped.
    async fn write_external_id_seen(&self, msg: &MsgIn) -> Result<(), BackendError>;

    /// Construct an incoming message owned by this backend's org model.
    fn new_incoming_msg(&self, channel: &Channel, urn: Urn, text: &str, clog: &ChannelLog)
    -> MsgIn;

    /// Construct a status update addressed by message row id.
    fn new_status_update(
        &self,
        channel: &Channel,
        id: MsgId,
        status: MsgStatus,
        clog: &ChannelLog,
    ) -> StatusUpdate {
        let mut update = StatusUpdate::by_id(channel.uuid, id, status);
        update.set_log_uuid(clog.uuid);
        update
    }

    /// Construct a status update addressed by provider external id.
    fn new_status_update_by_external_id(
        &self,
        channel: &Channel,
        external_id: &str,
        status: MsgStatus,
        clog: &ChannelLog,
    ) -> StatusUpdate {
        let mut update = StatusUpdate::by_external_id(channel.uuid, external_id, status);
        update.set_log_uuid(clog.uuid);
        update
    }

    /// Construct a channel event.
    fn new_channel_event(
        &self,
        channel: &Channel,
        event_type: ChannelEventType,
        urn: Urn,
        clog: &ChannelLog,
    ) -> ChannelEvent {
        ChannelEvent::new(channel.uuid, event_type, urn, clog.uuid)
    }

    /// Store fetched media and return its public URL.
    async fn save_attachment(
        &self,
        channel: &Channel,
        content_type: &str,
        data: &[u8],
        extension: &str,
    ) -> Result<String, BackendError>;

    /// HTTP client for provider calls.
    fn http_client(&self, allow_redirects: bool) -> reqwest::Client;

    /// Network access policy applied to outbound fetches.
    fn http_access(&self) -> NetworkPolicy;

    /// Empty string when healthy, otherwise a description of what is wrong.
    async fn health(&self) -> String;

    /// Operator-facing status text for the `/status` page.
    async fn status(&self) -> String;

    /// Periodic liveness ping, also used to report queue depths upstream.
    async fn heartbeat(&self) -> Result<(), BackendError>;
}
