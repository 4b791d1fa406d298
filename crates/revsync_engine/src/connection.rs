//! The abstract duplex message transport.
//!
//! The real framed transport (and the websocket/TLS stack under it) lives
//! outside this crate; the engine sees only this surface: start, send a
//! request with a completion callback, close. Incoming traffic arrives
//! through a [`ConnectionDelegate`].

use crate::error::{ws_codes, ErrorDomain};
use revsync_protocol::{ErrorResponse, Message};
use std::sync::Arc;
use tracing::warn;

/// Mirror of the transport's connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet connected, or fully closed.
    Closed,
    /// Connection being established.
    Connecting,
    /// Open for traffic.
    Connected,
    /// Close requested, waiting for completion.
    Closing,
    /// Dropped without a clean close.
    Disconnected,
}

/// WebSocket-style close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Clean close.
    Normal,
    /// The peer is going away.
    GoingAway,
    /// Protocol violation.
    ProtocolError,
    /// Application-level permanent failure; do not retry.
    AppPermanent,
    /// Application-level transient failure; retrying may help.
    AppTransient,
    /// Any other numeric code.
    Other(i32),
}

impl CloseCode {
    /// The numeric wire form.
    pub fn as_i32(self) -> i32 {
        match self {
            CloseCode::Normal => ws_codes::NORMAL,
            CloseCode::GoingAway => ws_codes::GOING_AWAY,
            CloseCode::ProtocolError => ws_codes::PROTOCOL_ERROR,
            CloseCode::AppPermanent => ws_codes::APP_PERMANENT,
            CloseCode::AppTransient => ws_codes::APP_TRANSIENT,
            CloseCode::Other(code) => code,
        }
    }
}

/// What layer a close status came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A websocket close frame.
    WebSocketClose,
    /// An OS-level error.
    PosixError,
    /// A network-stack error.
    NetworkError,
    /// A storage or engine error.
    StorageError,
}

impl CloseReason {
    /// The error domain a synthesized error for this reason belongs to.
    pub fn domain(self) -> ErrorDomain {
        match self {
            CloseReason::WebSocketClose => ErrorDomain::WebSocket,
            CloseReason::PosixError => ErrorDomain::Posix,
            CloseReason::NetworkError => ErrorDomain::Network,
            CloseReason::StorageError => ErrorDomain::Storage,
        }
    }
}

/// How (and why) a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    /// Originating layer.
    pub reason: CloseReason,
    /// Layer-specific code.
    pub code: i32,
    /// Close message.
    pub message: String,
}

impl CloseStatus {
    /// A clean websocket close.
    pub fn normal() -> Self {
        Self {
            reason: CloseReason::WebSocketClose,
            code: ws_codes::NORMAL,
            message: String::new(),
        }
    }

    /// True for a clean websocket close.
    pub fn is_normal(&self) -> bool {
        self.reason == CloseReason::WebSocketClose && self.code == ws_codes::NORMAL
    }
}

/// Why a reply callback fired without a reply message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    /// The peer answered with an error.
    Remote(ErrorResponse),
    /// The connection went away before the reply arrived.
    Disconnected,
}

/// The terminal result of a request: exactly one of these is delivered per
/// callback.
pub type ReplyResult = Result<Message, ReplyError>;

/// Completion callback for a request.
pub type ResponseCallback = Box<dyn FnOnce(ReplyResult) + Send>;

/// An incoming request, with the means to answer it.
///
/// Dropping an unanswered request (that expects a reply) sends a
/// "not handled" error so the peer never hangs.
pub struct IncomingRequest {
    /// The request message.
    pub message: Message,
    responder: Option<ResponderFn>,
}

/// The reply path of an incoming request.
pub type ResponderFn = Box<dyn FnOnce(Result<Message, ErrorResponse>) + Send>;

impl IncomingRequest {
    /// Wraps a message and its reply path. `responder` is `None` for
    /// no-reply messages.
    pub fn new(message: Message, responder: Option<ResponderFn>) -> Self {
        Self { message, responder }
    }

    /// True if the sender does not want a reply.
    pub fn no_reply(&self) -> bool {
        self.message.no_reply
    }

    /// Sends a successful response.
    pub fn respond(&mut self, response: Message) {
        if let Some(responder) = self.responder.take() {
            responder(Ok(response));
        }
    }

    /// Sends an empty successful response.
    pub fn respond_ok(&mut self) {
        self.respond(Message::response());
    }

    /// Sends an error response.
    pub fn respond_error(&mut self, error: ErrorResponse) {
        if let Some(responder) = self.responder.take() {
            responder(Err(error));
        }
    }

    /// Declines to handle the request.
    pub fn not_handled(&mut self) {
        if !self.no_reply() {
            warn!(
                profile = self.message.profile().unwrap_or("?"),
                "request not handled"
            );
        }
        self.respond_error(ErrorResponse::blip(404, "request not handled"));
    }
}

impl Drop for IncomingRequest {
    fn drop(&mut self) {
        if let Some(responder) = self.responder.take() {
            responder(Err(ErrorResponse::blip(404, "request not handled")));
        }
    }
}

/// Callbacks from the transport into the engine.
pub trait ConnectionDelegate: Send + Sync {
    /// The connection is open.
    fn on_connect(&self);

    /// The HTTP upgrade response arrived.
    fn on_http_response(&self, status: u16, headers: &[(String, String)]);

    /// The peer presented a TLS certificate.
    fn on_tls_certificate(&self, _cert: &[u8]) {}

    /// A request arrived.
    fn on_request(&self, request: IncomingRequest);

    /// The connection closed. `state` is the transport's final state.
    fn on_close(&self, status: CloseStatus, state: ConnectionState);
}

/// The engine's view of the framed message transport.
pub trait Connection: Send + Sync {
    /// Registers the delegate and begins connecting.
    fn start(&self, delegate: Arc<dyn ConnectionDelegate>);

    /// Sends a request. If `on_response` is given, it is invoked exactly
    /// once with the terminal result; outstanding callbacks fail with
    /// [`ReplyError::Disconnected`] when the connection closes.
    fn send_request(&self, message: Message, on_response: Option<ResponseCallback>);

    /// Requests a close with the given code.
    fn close(&self, code: CloseCode, message: &str);

    /// Hard-releases the connection; no further delegate calls.
    fn terminate(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn close_code_values() {
        assert_eq!(CloseCode::Normal.as_i32(), 1000);
        assert_eq!(CloseCode::GoingAway.as_i32(), 1001);
        assert_eq!(CloseCode::Other(4999).as_i32(), 4999);
    }

    #[test]
    fn close_status_normality() {
        assert!(CloseStatus::normal().is_normal());
        let unclean = CloseStatus {
            reason: CloseReason::NetworkError,
            code: 2,
            message: "reset".to_string(),
        };
        assert!(!unclean.is_normal());
    }

    #[test]
    fn dropped_request_answers_not_handled() {
        let (tx, rx) = mpsc::channel();
        let request = IncomingRequest::new(
            Message::request("bogus"),
            Some(Box::new(move |result| {
                tx.send(result).unwrap();
            })),
        );
        drop(request);
        let result = rx.recv().unwrap();
        assert_eq!(result, Err(ErrorResponse::blip(404, "request not handled")));
    }

    #[test]
    fn respond_consumes_responder() {
        let (tx, rx) = mpsc::channel();
        let mut request = IncomingRequest::new(
            Message::request("x"),
            Some(Box::new(move |result| {
                tx.send(result).unwrap();
            })),
        );
        request.respond_ok();
        drop(request);
        assert!(rx.recv().unwrap().is_ok());
        // Only one terminal result.
        assert!(rx.recv().is_err());
    }
}
