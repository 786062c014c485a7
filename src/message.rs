use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

/// Correlates one CALL with its REPLY or ERROR. Zero means no answer is wanted.
pub type CallId = u32;

/// The call id of a fire-and-forget CALL.
pub const NO_REPLY: CallId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call,
    Reply,
    Error,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            MessageType::Call => "CALL",
            MessageType::Reply => "REPLY",
            MessageType::Error => "ERROR",
        })
    }
}

/// The unit carried by a [`Channel`](crate::net::channel::Channel).
///
/// Fields are private so a message cannot change after it is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    call_id: CallId,
    payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// `{ "name": String, "body": Value }`
    Call(Value),
    Reply(Value),
    Error(RemoteError),
}

impl Message {
    /// A CALL for `name` with `body`.
    pub fn call(call_id: CallId, name: &str, body: Value) -> Self {
        let mut payload = BTreeMap::new();
        payload.insert("name".to_owned(), Value::String(name.to_owned()));
        payload.insert("body".to_owned(), body);
        Self::call_raw(call_id, Value::Map(payload))
    }

    /// A CALL whose payload is sent as given, without checking for a name.
    pub fn call_raw(call_id: CallId, payload: Value) -> Self {
        Self {
            call_id,
            payload: Payload::Call(payload),
        }
    }

    pub fn reply(call_id: CallId, result: Value) -> Self {
        Self {
            call_id,
            payload: Payload::Reply(result),
        }
    }

    pub fn error(call_id: CallId, error: RemoteError) -> Self {
        Self {
            call_id,
            payload: Payload::Error(error),
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn expects_reply(&self) -> bool {
        self.call_id != NO_REPLY
    }

    pub fn message_type(&self) -> MessageType {
        match self.payload {
            Payload::Call(_) => MessageType::Call,
            Payload::Reply(_) => MessageType::Reply,
            Payload::Error(_) => MessageType::Error,
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }
}

/// Error descriptor carried by an ERROR message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    pub code: Option<String>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

/// Machine codes the server attaches to errors it raises itself.
pub mod codes {
    pub const PROTOCOL: &str = "protocol";
    pub const METHOD_NOT_FOUND: &str = "method_not_found";
    pub const INVALID_BODY: &str = "invalid_body";
    pub const PANIC: &str = "panic";
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProtocolError(pub String);

/// The decoded payload of a CALL.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub name: String,
    pub body: Value,
}

impl CallRequest {
    pub fn parse(payload: &Value) -> Result<Self, ProtocolError> {
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ProtocolError("name should be specified in a body".to_owned()))?;
        let body = payload.get("body").cloned().unwrap_or_default();
        Ok(Self {
            name: name.to_owned(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_payload_round_trips_through_parse() {
        let msg = Message::call(7, "echo", Value::from("hi"));
        assert_eq!(msg.message_type(), MessageType::Call);
        assert!(msg.expects_reply());
        let Payload::Call(payload) = msg.payload() else {
            panic!("not a call");
        };
        let req = CallRequest::parse(payload).unwrap();
        assert_eq!(req.name, "echo");
        assert_eq!(req.body, Value::from("hi"));
    }

    #[test]
    fn missing_name_is_a_protocol_error() {
        let payload = Value::map([("body", Value::Int(1))]);
        let err = CallRequest::parse(&payload).unwrap_err();
        assert!(err.to_string().contains("name"));

        let payload = Value::map([("name", Value::Int(1))]);
        assert!(CallRequest::parse(&payload).is_err());
        assert!(CallRequest::parse(&Value::Nil).is_err());
    }

    #[test]
    fn missing_body_is_nil() {
        let payload = Value::map([("name", "fail")]);
        let req = CallRequest::parse(&payload).unwrap();
        assert_eq!(req.body, Value::Nil);
    }

    #[test]
    fn zero_call_id_expects_no_reply() {
        assert!(!Message::call(NO_REPLY, "log", Value::Nil).expects_reply());
        assert_eq!(Message::reply(3, Value::Nil).message_type(), MessageType::Reply);
        assert_eq!(
            Message::error(3, RemoteError::new("boom")).message_type(),
            MessageType::Error
        );
    }
}
