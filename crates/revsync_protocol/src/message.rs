//! Profile-tagged request/response messages.

use crate::error::{ProtocolError, ProtocolResult};

/// Message profile names.
pub mod profiles {
    /// Fetch a checkpoint stored on the peer.
    pub const GET_CHECKPOINT: &str = "getCheckpoint";
    /// Store a checkpoint on the peer.
    pub const SET_CHECKPOINT: &str = "setCheckpoint";
    /// Subscribe to the peer's changes (pull side → push side).
    pub const SUB_CHANGES: &str = "subChanges";
    /// Announce changes (push side → pull side).
    pub const CHANGES: &str = "changes";
    /// Propose changes in conflict-free mode.
    pub const PROPOSE_CHANGES: &str = "proposeChanges";
    /// Deliver one revision.
    pub const REV: &str = "rev";
    /// Announce that a requested revision cannot be sent.
    pub const NOREV: &str = "norev";
    /// Request an attachment blob by digest.
    pub const GET_ATTACHMENT: &str = "getAttachment";
    /// Ask the peer to prove it has an attachment.
    pub const PROVE_ATTACHMENT: &str = "proveAttachment";
}

/// The property naming a message's profile.
pub const PROFILE_PROPERTY: &str = "Profile";

/// A single message on the wire: a profile, short string properties, and a
/// body of arbitrary bytes (usually JSON).
///
/// Responses are messages without a profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    properties: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
    /// The sender does not want a reply.
    pub no_reply: bool,
    /// The body should be compressed in flight.
    pub compressed: bool,
}

impl Message {
    /// Creates a request with the given profile.
    pub fn request(profile: &str) -> Self {
        Self {
            properties: vec![(PROFILE_PROPERTY.to_string(), profile.to_string())],
            ..Self::default()
        }
    }

    /// Creates an empty response.
    pub fn response() -> Self {
        Self::default()
    }

    /// The profile, if this is a request.
    pub fn profile(&self) -> Option<&str> {
        self.property(PROFILE_PROPERTY)
    }

    /// Looks up a property by name.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Looks up an integer-valued property.
    pub fn int_property(&self, name: &str) -> Option<i64> {
        self.property(name).and_then(|v| v.parse().ok())
    }

    /// Looks up a boolean property; `"true"` and `"1"` are true.
    pub fn bool_property(&self, name: &str) -> bool {
        matches!(self.property(name), Some("true") | Some("1"))
    }

    /// Sets a property, replacing any existing value.
    pub fn set_property(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(slot) = self.properties.iter_mut().find(|(k, _)| k == name) {
            slot.1 = value;
        } else {
            self.properties.push((name.to_string(), value));
        }
    }

    /// Builder form of [`set_property`](Message::set_property).
    pub fn with_property(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_property(name, value);
        self
    }

    /// Builder: sets the body bytes.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Builder: sets a JSON body.
    pub fn with_json_body(mut self, body: &serde_json::Value) -> Self {
        self.body = body.to_string().into_bytes();
        self
    }

    /// Builder: marks this message as expecting no reply.
    pub fn without_reply(mut self) -> Self {
        self.no_reply = true;
        self
    }

    /// Parses the body as JSON.
    pub fn json_body(&self) -> ProtocolResult<serde_json::Value> {
        if self.body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&self.body)
            .map_err(|e| ProtocolError::invalid_body(e.to_string()))
    }

    /// The body as UTF-8, lossily.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// An error reply to a request, in the `{domain, code, message}` shape used
/// on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Error domain: `"HTTP"` for status-code errors, `"BLIP"` for framing
    /// and validation errors.
    pub domain: String,
    /// Status code.
    pub code: u16,
    /// Optional human-readable message.
    pub message: String,
}

impl ErrorResponse {
    /// Creates an HTTP-domain error.
    pub fn http(code: u16, message: impl Into<String>) -> Self {
        Self {
            domain: "HTTP".to_string(),
            code,
            message: message.into(),
        }
    }

    /// Creates a BLIP-domain (framing/validation) error.
    pub fn blip(code: u16, message: impl Into<String>) -> Self {
        Self {
            domain: "BLIP".to_string(),
            code,
            message: message.into(),
        }
    }

    /// Returns true if this is an HTTP error with the given code.
    pub fn is_http(&self, code: u16) -> bool {
        self.domain == "HTTP" && self.code == code
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{} {}", self.domain, self.code)
        } else {
            write!(f, "{} {}: {}", self.domain, self.code, self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_profile() {
        let msg = Message::request(profiles::CHANGES);
        assert_eq!(msg.profile(), Some("changes"));
        assert_eq!(Message::response().profile(), None);
    }

    #[test]
    fn properties_are_typed() {
        let msg = Message::request(profiles::SUB_CHANGES)
            .with_property("since", "42")
            .with_property("continuous", "true");
        assert_eq!(msg.int_property("since"), Some(42));
        assert!(msg.bool_property("continuous"));
        assert!(!msg.bool_property("missing"));
    }

    #[test]
    fn set_property_replaces() {
        let mut msg = Message::request(profiles::REV);
        msg.set_property("rev", "1-a");
        msg.set_property("rev", "2-b");
        assert_eq!(msg.property("rev"), Some("2-b"));
    }

    #[test]
    fn json_body_roundtrip() {
        let body = serde_json::json!([[1, "d1", "1-a"]]);
        let msg = Message::request(profiles::CHANGES).with_json_body(&body);
        assert_eq!(msg.json_body().unwrap(), body);
    }

    #[test]
    fn empty_body_is_null_json() {
        assert_eq!(
            Message::response().json_body().unwrap(),
            serde_json::Value::Null
        );
    }

    #[test]
    fn error_response_display() {
        let err = ErrorResponse::http(409, "revision ID mismatch");
        assert!(err.is_http(409));
        assert_eq!(err.to_string(), "HTTP 409: revision ID mismatch");
    }
}
