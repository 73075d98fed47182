//! Uniform JSON envelopes for webhook responses.
//!
//! Every non-binary response is `{message, data: [...]}` where each data
//! item carries a `type` discriminator: `msg`, `status`, `event`, `error`
//! or `info`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use uuid::Uuid;

use crate::error::RequestError;
use crate::handler::ReceiveEvent;
use crate::msg::MsgId;
use crate::status::MsgStatus;

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub message: String,
    pub data: Vec<DataItem>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataItem {
    Msg {
        channel_uuid: Uuid,
        msg_uuid: Uuid,
        urn: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        external_id: Option<String>,
    },
    Status {
        channel_uuid: Uuid,
        status: MsgStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        msg_id: Option<MsgId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        external_id: Option<String>,
    },
    Event {
        channel_uuid: Uuid,
        event_type: crate::event::ChannelEventType,
        urn: String,
    },
    Error {
        error: String,
    },
    Info {
        info: String,
    },
}

impl DataItem {
    pub fn from_event(event: &ReceiveEvent) -> Self {
        match event {
            ReceiveEvent::Msg(m) => DataItem::Msg {
                channel_uuid: m.channel_uuid,
                msg_uuid: m.uuid,
                urn: m.urn.to_string(),
                text: m.text.clone(),
                external_id: m.external_id.clone(),
            },
            ReceiveEvent::Status(s) => DataItem::Status {
                channel_uuid: s.channel_uuid,
                status: s.status,
                msg_id: s.msg_id,
                external_id: s.external_id.clone(),
            },
            ReceiveEvent::Event(e) => DataItem::Event {
                channel_uuid: e.channel_uuid,
                event_type: e.event_type,
                urn: e.urn.to_string(),
            },
        }
    }
}

impl Envelope {
    /// 200 envelope describing what was accepted.
    pub fn ok(message: &str, events: &[ReceiveEvent]) -> Self {
        let data = if events.is_empty() {
            vec![DataItem::Info {
                info: "no messages, ignored".to_string(),
            }]
        } else {
            events.iter().map(DataItem::from_event).collect()
        };
        Envelope {
            message: message.to_string(),
            data,
        }
    }

    /// Error envelope with one item per failure string.
    pub fn errors(message: &str, errors: Vec<String>) -> Self {
        Envelope {
            message: message.to_string(),
            data: errors.into_iter().map(|error| DataItem::Error { error }).collect(),
        }
    }
}

/// Map a handler request error to its HTTP response.
pub fn error_response(err: &RequestError) -> Response {
    match err {
        RequestError::Validation(fields) => {
            let errors = fields.iter().map(|f| f.to_string()).collect();
            json(StatusCode::BAD_REQUEST, Envelope::errors("Error", errors))
        }
        RequestError::Payload(reason) => json(
            StatusCode::BAD_REQUEST,
            Envelope::errors("Error", vec![reason.clone()]),
        ),
        RequestError::Unauthorized => {
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
        RequestError::Backend(e) => json(
            StatusCode::BAD_REQUEST,
            Envelope::errors("Error", vec![e.to_string()]),
        ),
    }
}

pub fn not_found() -> Response {
    json(
        StatusCode::NOT_FOUND,
        Envelope::errors("Error", vec!["not found".to_string()]),
    )
}

pub fn method_not_allowed(method: &axum::http::Method) -> Response {
    json(
        StatusCode::METHOD_NOT_ALLOWED,
        Envelope::errors("Error", vec![format!("method not allowed: {method}")]),
    )
}

pub fn internal_error() -> Response {
    json(
        StatusCode::INTERNAL_SERVER_ERROR,
        Envelope::errors("Error", vec!["internal server error".to_string()]),
    )
}

pub fn json(status: StatusCode, envelope: Envelope) -> Response {
    (status, Json(envelope)).into_response()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::FieldError;

    #[test]
    fn envelope_shapes() {
        let env = Envelope::ok("Messages Handled", &[]);
        let value = serde_json::to_value(&env).expect("json");
        assert_eq!(value["message"], "Messages Handled");
        assert_eq!(value["data"][0]["type"], "info");

        let env = Envelope::errors("Error", vec!["boom".to_string()]);
        let value = serde_json::to_value(&env).expect("json");
        assert_eq!(value["data"][0]["type"], "error");
        assert_eq!(value["data"][0]["error"], "boom");
    }

    #[test]
    fn validation_errors_render_field_and_tag() {
        let err = RequestError::Validation(vec![
            FieldError {
                name: "from".to_string(),
                tag: "required".to_string(),
            },
            FieldError {
                name: "text".to_string(),
                tag: "required".to_string(),
            },
        ]);
        if let RequestError::Validation(fields) = &err {
            assert_eq!(fields[0].to_string(), "field 'from' required");
            assert_eq!(fields[1].to_string(), "field 'text' required");
        }
    }
}
