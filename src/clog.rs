//! Channel logs: the audit record of one handler invocation or send attempt.
//!
//! A log carries the HTTP exchanges performed on the channel's behalf and any
//! structured errors. Every byte recorded into a log passes through a
//! redaction filter built from the channel's sensitive values, fixed when the
//! log is created.

use std::time::Duration;

use aho_corasick::AhoCorasick;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::channel::Channel;
use crate::msg::MsgId;

const REDACTED: &str = "**********";

/// What kind of work a log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLogType {
    MsgSend,
    MsgReceive,
    MsgStatus,
    EventReceive,
    AttachmentFetch,
    TokenRefresh,
    WebhookVerify,
}

/// Closed vocabulary of channel-log error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ResponseStatusCode,
    ResponseUnparseable,
    ResponseUnexpected,
    ResponseValueMissing,
    MediaUnsupported,
    MediaUnresolveable,
    AttachmentNotDecodable,
    ChannelConfig,
    ConnectionFailed,
    ConnectionThrottled,
    ContactStopped,
    RejectedWithReason,
    External,
    InternalError,
}

/// One structured error on a channel log.
#[derive(Debug, Clone, Serialize)]
pub struct LogError {
    pub code: ErrorCode,
    /// Provider-assigned error code, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext_code: Option<String>,
    pub message: String,
}

impl LogError {
    pub fn new(code: ErrorCode, message: String) -> Self {
        LogError {
            code,
            ext_code: None,
            message,
        }
    }

    pub fn with_ext_code(mut self, ext_code: String) -> Self {
        self.ext_code = Some(ext_code);
        self
    }
}

/// One recorded HTTP exchange, stored post-redaction.
#[derive(Debug, Clone, Serialize)]
pub struct HttpLog {
    pub url: String,
    /// 0 when no response was received.
    pub status_code: u16,
    pub request: String,
    pub response: String,
    /// Elapsed time in milliseconds.
    pub elapsed_ms: u64,
    pub started_on: DateTime<Utc>,
}

/// The audit record of one handler invocation or send attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelLog {
    pub uuid: Uuid,
    pub log_type: ChannelLogType,
    pub channel_uuid: Option<Uuid>,
    pub msg_id: Option<MsgId>,
    pub http_logs: Vec<HttpLog>,
    pub errors: Vec<LogError>,
    pub created_on: DateTime<Utc>,
    /// Elapsed time in milliseconds, stamped by [`ChannelLog::end`].
    pub elapsed_ms: u64,
    /// Whether a downstream entity (msg, status, event) references this log.
    pub attached: bool,
    #[serde(skip)]
    redactor: Redactor,
}

impl ChannelLog {
    /// Create a log for a resolved channel, redacting `redact_values`.
    pub fn new(log_type: ChannelLogType, channel: &Channel, redact_values: &[String]) -> Self {
        Self::build(log_type, Some(channel.uuid), redact_values)
    }

    /// Create a log for a request whose channel could not be resolved yet
    /// (e.g. provider verification handshakes).
    pub fn without_channel(log_type: ChannelLogType) -> Self {
        Self::build(log_type, None, &[])
    }

    fn build(log_type: ChannelLogType, channel_uuid: Option<Uuid>, redact_values: &[String]) -> Self {
        ChannelLog {
            uuid: Uuid::new_v4(),
            log_type,
            channel_uuid,
            msg_id: None,
            http_logs: Vec::new(),
            errors: Vec::new(),
            created_on: Utc::now(),
            elapsed_ms: 0,
            attached: false,
            redactor: Redactor::new(redact_values),
        }
    }

    pub fn set_msg_id(&mut self, id: MsgId) {
        self.msg_id = Some(id);
    }

    /// Record one HTTP exchange. Request and response bytes are redacted
    /// before they are stored.
    pub fn http(
        &mut self,
        url: &str,
        status_code: u16,
        request: &str,
        response: &str,
        elapsed: Duration,
        started_on: DateTime<Utc>,
    ) {
        let request = self.redactor.redact(request);
        let response = self.redactor.redact(response);
        self.http_logs.push(HttpLog {
            url: url.to_string(),
            status_code,
            request,
            response,
            elapsed_ms: elapsed.as_millis() as u64,
            started_on,
        });
    }

    /// Record a structured error. The message is redacted like HTTP bytes.
    pub fn error(&mut self, err: LogError) {
        let message = self.redactor.redact(&err.message);
        self.errors.push(LogError { message, ..err });
    }

    /// Mark the log as referenced by a downstream entity.
    pub fn attach(&mut self) {
        self.attached = true;
    }

    /// Stamp the elapsed time. Called once, right before the log is written.
    pub fn end(&mut self) {
        self.elapsed_ms = (Utc::now() - self.created_on).num_milliseconds().max(0) as u64;
    }

    /// A log is error-bearing when it has error records or any recorded
    /// exchange finished outside 200-399.
    pub fn is_error(&self) -> bool {
        !self.errors.is_empty()
            || self
                .http_logs
                .iter()
                .any(|h| !(200..400).contains(&h.status_code))
    }
}

/// Multi-pattern secret replacement over log bytes.
#[derive(Debug, Clone, Default)]
struct Redactor {
    matcher: Option<AhoCorasick>,
}

impl Redactor {
    fn new(values: &[String]) -> Self {
        let values: Vec<&String> = values.iter().filter(|v| !v.is_empty()).collect();
        if values.is_empty() {
            return Redactor { matcher: None };
        }
        // Patterns are fixed literals supplied by the handler; construction
        // only fails on pathological pattern counts.
        Redactor {
            matcher: AhoCorasick::new(&values).ok(),
        }
    }

    fn redact(&self, input: &str) -> String {
        match &self.matcher {
            Some(m) => {
                let replacements = vec![REDACTED; m.patterns_len()];
                m.replace_all(input, &replacements)
            }
            None => input.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;

    fn channel() -> Channel {
        Channel::new(
            Uuid::new_v4(),
            "MCK".parse().expect("type"),
            "Test",
            "+12065551212",
            "US",
        )
    }

    #[test]
    fn redacts_every_recorded_byte() {
        let ch = channel();
        let secrets = vec!["sesame".to_string(), "api-key-123".to_string()];
        let mut clog = ChannelLog::new(ChannelLogType::MsgSend, &ch, &secrets);

        clog.http(
            "https://api.example.com/send",
            200,
            "POST /send\nAuthorization: Bearer sesame\n\n{\"key\":\"api-key-123\"}",
            "{\"token\":\"sesame\"}",
            Duration::from_millis(12),
            Utc::now(),
        );
        clog.error(LogError::new(
            ErrorCode::ResponseUnexpected,
            "no id for token sesame".to_string(),
        ));

        let serialized = serde_json::to_string(&clog).expect("json");
        assert!(!serialized.contains("sesame"));
        assert!(!serialized.contains("api-key-123"));
        assert!(serialized.contains(REDACTED));
    }

    #[test]
    fn error_bearing_definition() {
        let ch = channel();
        let mut clog = ChannelLog::new(ChannelLogType::MsgSend, &ch, &[]);
        assert!(!clog.is_error());

        clog.http("https://x", 201, "req", "resp", Duration::ZERO, Utc::now());
        assert!(!clog.is_error());

        clog.http("https://x", 403, "req", "resp", Duration::ZERO, Utc::now());
        assert!(clog.is_error());

        let mut clog = ChannelLog::new(ChannelLogType::MsgReceive, &ch, &[]);
        clog.error(LogError::new(ErrorCode::External, "provider error".to_string()));
        assert!(clog.is_error());
    }

    #[test]
    fn attach_marks_log_referenced() {
        let ch = channel();
        let mut clog = ChannelLog::new(ChannelLogType::MsgStatus, &ch, &[]);
        assert!(!clog.attached);
        clog.attach();
        clog.end();
        assert!(clog.attached);
    }
}
