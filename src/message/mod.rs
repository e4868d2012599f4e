//! Application messages: a logical event name plus an opaque payload.
//!
//! Text frames carry a JSON envelope:
//!
//! ```text
//! {"event": "chat", "data": {"body": "hi"}}
//! ```
//!
//! Binary frames carry a one-byte event-name length, the event name, and then
//! the raw payload. The payload bytes are handed to handlers exactly as they
//! arrived.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::frame::{Frame, Opcode};

/// Longest event name that fits the binary header.
pub const MAX_EVENT_NAME_LEN: usize = u8::MAX as usize;

/// Errors produced while converting between frames and messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed JSON envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary frame is missing its event-name header")]
    MissingHeader,

    #[error("event name is not valid UTF-8")]
    InvalidEventName,

    #[error("event name must be 1..=255 bytes, got {0}")]
    EventNameLength(usize),

    #[error("{0} frames do not carry messages")]
    NotData(Opcode),
}

/// Message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured payload carried in a text frame.
    Json(Value),
    /// Opaque bytes carried in a binary frame, never reinterpreted.
    Binary(Bytes),
}

impl Payload {
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(data) => Some(data),
            Self::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Binary(_) => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// An application-level message routed by event name.
///
/// # Examples
///
/// ```
/// use rtgate::message::Message;
/// use serde_json::json;
///
/// let message = Message::json("chat", json!({"body": "hi"}));
/// let frame = message.to_frame().unwrap();
/// assert_eq!(Message::from_frame(frame).unwrap(), message);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    event: String,
    payload: Payload,
}

impl Message {
    pub fn new(event: impl Into<String>, payload: Payload) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Creates a message with a JSON payload.
    pub fn json(event: impl Into<String>, data: Value) -> Self {
        Self::new(event, Payload::Json(data))
    }

    /// Creates a message with a binary payload.
    pub fn binary(event: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(event, Payload::Binary(data.into()))
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Decodes a data frame into a message.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::NotData`] for control frames, and a decoding
    /// error when the envelope or header is malformed.
    pub fn from_frame(frame: Frame) -> Result<Self, MessageError> {
        match frame {
            Frame::Text(text) => {
                let envelope: Envelope = serde_json::from_str(&text)?;
                check_event_name(&envelope.event)?;
                Ok(Self::json(envelope.event, envelope.data))
            }
            Frame::Binary(mut data) => {
                let Some(&name_len) = data.first() else {
                    return Err(MessageError::MissingHeader);
                };
                let name_len = name_len as usize;
                if name_len == 0 {
                    return Err(MessageError::EventNameLength(0));
                }
                if data.len() < 1 + name_len {
                    return Err(MessageError::MissingHeader);
                }
                let name = std::str::from_utf8(&data[1..1 + name_len])
                    .map_err(|_| MessageError::InvalidEventName)?
                    .to_owned();
                // Slice off the header; the remaining bytes are shared, not copied.
                let payload = data.split_off(1 + name_len);
                Ok(Self::binary(name, payload))
            }
            other => Err(MessageError::NotData(other.opcode())),
        }
    }

    /// Encodes the message as a data frame.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::EventNameLength`] when the event name is empty
    /// or longer than [`MAX_EVENT_NAME_LEN`].
    pub fn to_frame(&self) -> Result<Frame, MessageError> {
        check_event_name(&self.event)?;
        match &self.payload {
            Payload::Json(data) => {
                let text = serde_json::to_string(&Envelope {
                    event: self.event.clone(),
                    data: data.clone(),
                })?;
                Ok(Frame::Text(text))
            }
            Payload::Binary(data) => {
                let mut buf = BytesMut::with_capacity(1 + self.event.len() + data.len());
                buf.put_u8(self.event.len() as u8);
                buf.put_slice(self.event.as_bytes());
                buf.put_slice(data);
                Ok(Frame::Binary(buf.freeze()))
            }
        }
    }
}

fn check_event_name(name: &str) -> Result<(), MessageError> {
    if name.is_empty() || name.len() > MAX_EVENT_NAME_LEN {
        return Err(MessageError::EventNameLength(name.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_frame_decodes_envelope() {
        let frame = Frame::Text(r#"{"event":"chat","data":{"body":"hi"}}"#.into());
        let message = Message::from_frame(frame).unwrap();
        assert_eq!(message.event(), "chat");
        assert_eq!(message.payload().as_json(), Some(&json!({"body": "hi"})));
    }

    #[test]
    fn text_frame_without_data_is_null() {
        let message = Message::from_frame(Frame::Text(r#"{"event":"ready"}"#.into())).unwrap();
        assert_eq!(message.payload(), &Payload::Json(Value::Null));
    }

    #[test]
    fn text_frame_with_bad_json_rejected() {
        let err = Message::from_frame(Frame::Text("not json".into())).unwrap_err();
        assert!(matches!(err, MessageError::Json(_)));
    }

    #[test]
    fn binary_payload_preserved_verbatim() {
        let raw: Vec<u8> = (0..=255).collect();
        let frame = Message::binary("blob", raw.clone()).to_frame().unwrap();
        let decoded = Message::from_frame(frame).unwrap();
        assert_eq!(decoded.event(), "blob");
        assert_eq!(decoded.payload().as_bytes().unwrap().as_ref(), raw.as_slice());
    }

    #[test]
    fn binary_frame_with_truncated_header_rejected() {
        let frame = Frame::Binary(Bytes::from_static(&[5, b'a', b'b']));
        assert!(matches!(
            Message::from_frame(frame),
            Err(MessageError::MissingHeader)
        ));
        assert!(matches!(
            Message::from_frame(Frame::Binary(Bytes::new())),
            Err(MessageError::MissingHeader)
        ));
    }

    #[test]
    fn control_frames_are_not_messages() {
        assert!(matches!(
            Message::from_frame(Frame::Close),
            Err(MessageError::NotData(Opcode::Close))
        ));
    }

    #[test]
    fn event_name_bounds_enforced() {
        assert!(Message::json("", Value::Null).to_frame().is_err());
        let long = "x".repeat(MAX_EVENT_NAME_LEN + 1);
        assert!(matches!(
            Message::binary(long, Bytes::new()).to_frame(),
            Err(MessageError::EventNameLength(256))
        ));
    }
}
