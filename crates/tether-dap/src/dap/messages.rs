use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DapError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub seq: i64,
    #[serde(rename = "type")]
    pub message_type: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub seq: i64,
    #[serde(rename = "type")]
    pub message_type: String,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    #[serde(rename = "type")]
    pub message_type: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// An incoming message, classified by its `type` field.
///
/// Servers may send responses, events, and reverse requests interleaved on
/// the same stream.
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl Message {
    pub fn classify(value: Value) -> Result<Message> {
        let message_type = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DapError::Protocol("message without a 'type' field".to_string()))?;

        match message_type {
            "request" => Ok(Message::Request(serde_json::from_value(value)?)),
            "response" => Ok(Message::Response(serde_json::from_value(value)?)),
            "event" => Ok(Message::Event(serde_json::from_value(value)?)),
            other => Err(DapError::Protocol(format!(
                "unknown message type {other:?}"
            ))),
        }
    }
}

pub fn make_request(seq: i64, command: impl Into<String>, arguments: Value) -> Request {
    Request {
        seq,
        message_type: "request".to_string(),
        command: command.into(),
        arguments,
    }
}

pub fn make_response(
    seq: i64,
    request: &Request,
    success: bool,
    body: Option<Value>,
    message: Option<String>,
) -> Response {
    Response {
        seq,
        message_type: "response".to_string(),
        request_seq: request.seq,
        success,
        command: request.command.clone(),
        message,
        body,
    }
}

pub fn make_event(seq: i64, event: impl Into<String>, body: Option<Value>) -> Event {
    Event {
        seq,
        message_type: "event".to_string(),
        event: event.into(),
        body,
    }
}
