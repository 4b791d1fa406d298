//! An in-process duplex pipe implementing [`Connection`].
//!
//! Two linked endpoints shuttle profile-tagged messages between two engines
//! in the same process. Used by the integration tests to drive full
//! two-peer replication sessions without a network stack.

use crate::connection::{
    CloseCode, CloseReason, CloseStatus, Connection, ConnectionDelegate, ConnectionState,
    IncomingRequest, ReplyError, ResponseCallback,
};
use parking_lot::Mutex;
use revsync_protocol::{ErrorResponse, Message};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::trace;

/// The protocol name announced in the simulated HTTP upgrade response.
pub const PIPE_PROTOCOL: &str = "revsync+blip";

enum PipeEvent {
    MaybeConnect,
    PeerStarted,
    Request {
        number: Option<u64>,
        message: Message,
    },
    Response {
        number: u64,
        result: Result<Message, ErrorResponse>,
    },
    FailSend {
        callback: ResponseCallback,
    },
    Close {
        status: CloseStatus,
        state: ConnectionState,
    },
    Shutdown,
}

struct EndpointInner {
    delegate: Option<Arc<dyn ConnectionDelegate>>,
    peer: Option<Sender<PipeEvent>>,
    started: bool,
    peer_started: bool,
    open: bool,
    closed: bool,
    next_request: u64,
    pending: HashMap<u64, ResponseCallback>,
    upgrade_headers: Vec<(String, String)>,
}

/// One side of an in-process pipe.
pub struct PipeEndpoint {
    name: &'static str,
    inner: Mutex<EndpointInner>,
    events: Sender<PipeEvent>,
}

/// Creates a linked pair of pipe endpoints.
pub struct InProcessPipe;

impl InProcessPipe {
    /// Builds two connected endpoints.
    pub fn pair() -> (Arc<PipeEndpoint>, Arc<PipeEndpoint>) {
        let (a_tx, a_rx) = mpsc::channel();
        let (b_tx, b_rx) = mpsc::channel();

        let a = Arc::new(PipeEndpoint::new("pipe-a", a_tx.clone()));
        let b = Arc::new(PipeEndpoint::new("pipe-b", b_tx.clone()));

        a.inner.lock().peer = Some(b_tx);
        b.inner.lock().peer = Some(a_tx);

        PipeEndpoint::spawn_dispatcher(Arc::downgrade(&a), a_rx);
        PipeEndpoint::spawn_dispatcher(Arc::downgrade(&b), b_rx);

        (a, b)
    }
}

impl PipeEndpoint {
    fn new(name: &'static str, events: Sender<PipeEvent>) -> Self {
        Self {
            name,
            inner: Mutex::new(EndpointInner {
                delegate: None,
                peer: None,
                started: false,
                peer_started: false,
                open: false,
                closed: false,
                next_request: 1,
                pending: HashMap::new(),
                upgrade_headers: vec![(
                    "Sec-WebSocket-Protocol".to_string(),
                    PIPE_PROTOCOL.to_string(),
                )],
            }),
            events,
        }
    }

    /// Replaces the headers this endpoint's delegate will see in the
    /// simulated HTTP upgrade response.
    pub fn set_upgrade_headers(&self, headers: Vec<(String, String)>) {
        self.inner.lock().upgrade_headers = headers;
    }

    fn spawn_dispatcher(endpoint: Weak<PipeEndpoint>, rx: Receiver<PipeEvent>) {
        thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                let Some(endpoint) = endpoint.upgrade() else {
                    break;
                };
                if !endpoint.dispatch(event) {
                    break;
                }
            }
        });
    }

    /// Handles one event on the dispatcher thread. Returns false to stop.
    fn dispatch(&self, event: PipeEvent) -> bool {
        match event {
            PipeEvent::PeerStarted => {
                self.inner.lock().peer_started = true;
                self.try_open();
            }
            PipeEvent::MaybeConnect => {
                self.try_open();
            }
            PipeEvent::Request { number, message } => {
                let delegate = self.inner.lock().delegate.clone();
                let Some(delegate) = delegate else {
                    return true;
                };
                trace!(
                    endpoint = self.name,
                    profile = message.profile().unwrap_or("(response)"),
                    "incoming request"
                );
                let responder = number.and_then(|number| {
                    let peer = self.inner.lock().peer.clone()?;
                    Some(Box::new(move |result: Result<Message, ErrorResponse>| {
                        let _ = peer.send(PipeEvent::Response { number, result });
                    }) as Box<dyn FnOnce(Result<Message, ErrorResponse>) + Send>)
                });
                delegate.on_request(IncomingRequest::new(message, responder));
            }
            PipeEvent::Response { number, result } => {
                let callback = self.inner.lock().pending.remove(&number);
                if let Some(callback) = callback {
                    callback(result.map_err(ReplyError::Remote));
                }
            }
            PipeEvent::FailSend { callback } => {
                callback(Err(ReplyError::Disconnected));
            }
            PipeEvent::Close { status, state } => {
                let (delegate, orphaned) = {
                    let mut inner = self.inner.lock();
                    if inner.closed {
                        return true;
                    }
                    inner.closed = true;
                    inner.open = false;
                    let orphaned: Vec<ResponseCallback> =
                        inner.pending.drain().map(|(_, cb)| cb).collect();
                    (inner.delegate.clone(), orphaned)
                };
                for callback in orphaned {
                    callback(Err(ReplyError::Disconnected));
                }
                if let Some(delegate) = delegate {
                    delegate.on_close(status, state);
                }
            }
            PipeEvent::Shutdown => return false,
        }
        true
    }

    fn try_open(&self) {
        let (delegate, headers) = {
            let mut inner = self.inner.lock();
            if inner.open || inner.closed || !inner.started || !inner.peer_started {
                return;
            }
            let Some(delegate) = inner.delegate.clone() else {
                return;
            };
            inner.open = true;
            (delegate, inner.upgrade_headers.clone())
        };
        delegate.on_http_response(101, &headers);
        delegate.on_connect();
    }
}

impl Connection for PipeEndpoint {
    fn start(&self, delegate: Arc<dyn ConnectionDelegate>) {
        let peer = {
            let mut inner = self.inner.lock();
            inner.delegate = Some(delegate);
            inner.started = true;
            inner.peer.clone()
        };
        if let Some(peer) = peer {
            let _ = peer.send(PipeEvent::PeerStarted);
        }
        let _ = self.events.send(PipeEvent::MaybeConnect);
    }

    fn send_request(&self, message: Message, on_response: Option<ResponseCallback>) {
        let mut inner = self.inner.lock();
        if inner.closed || !inner.started {
            drop(inner);
            if let Some(callback) = on_response {
                let _ = self.events.send(PipeEvent::FailSend { callback });
            }
            return;
        }
        let number = if message.no_reply {
            None
        } else {
            let number = inner.next_request;
            inner.next_request += 1;
            if let Some(callback) = on_response {
                inner.pending.insert(number, callback);
            }
            Some(number)
        };
        let peer = inner.peer.clone();
        drop(inner);
        if let Some(peer) = peer {
            let _ = peer.send(PipeEvent::Request { number, message });
        }
    }

    fn close(&self, code: CloseCode, message: &str) {
        let status = CloseStatus {
            reason: CloseReason::WebSocketClose,
            code: code.as_i32(),
            message: message.to_string(),
        };
        let peer = self.inner.lock().peer.clone();
        if let Some(peer) = peer {
            let _ = peer.send(PipeEvent::Close {
                status: status.clone(),
                state: ConnectionState::Closed,
            });
        }
        let _ = self.events.send(PipeEvent::Close {
            status,
            state: ConnectionState::Closed,
        });
    }

    fn terminate(&self) {
        {
            let mut inner = self.inner.lock();
            inner.delegate = None;
            inner.peer = None;
        }
        let _ = self.events.send(PipeEvent::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::Sender as StdSender;
    use std::time::Duration;

    enum Seen {
        Connect,
        Http(u16, Vec<(String, String)>),
        Request(Message),
        Close(CloseStatus),
    }

    struct Recorder {
        tx: StdSender<Seen>,
        auto_respond: bool,
    }

    impl ConnectionDelegate for Recorder {
        fn on_connect(&self) {
            let _ = self.tx.send(Seen::Connect);
        }

        fn on_http_response(&self, status: u16, headers: &[(String, String)]) {
            let _ = self.tx.send(Seen::Http(status, headers.to_vec()));
        }

        fn on_request(&self, mut request: IncomingRequest) {
            if self.auto_respond {
                request.respond(Message::response().with_body("pong"));
            }
            let _ = self.tx.send(Seen::Request(request.message.clone()));
        }

        fn on_close(&self, status: CloseStatus, _state: ConnectionState) {
            let _ = self.tx.send(Seen::Close(status));
        }
    }

    fn recorder(auto_respond: bool) -> (Arc<Recorder>, mpsc::Receiver<Seen>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Recorder { tx, auto_respond }), rx)
    }

    fn expect_connect(rx: &mpsc::Receiver<Seen>) {
        let mut saw_connect = false;
        for _ in 0..2 {
            match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
                Seen::Connect => saw_connect = true,
                Seen::Http(status, _) => assert_eq!(status, 101),
                _ => panic!("unexpected event before connect"),
            }
        }
        assert!(saw_connect);
    }

    #[test]
    fn both_sides_connect() {
        let (a, b) = InProcessPipe::pair();
        let (da, ra) = recorder(false);
        let (db, rb) = recorder(false);
        a.start(da);
        b.start(db);
        expect_connect(&ra);
        expect_connect(&rb);
    }

    #[test]
    fn request_reply_roundtrip() {
        let (a, b) = InProcessPipe::pair();
        let (da, ra) = recorder(false);
        let (db, _rb) = recorder(true);
        a.start(da);
        b.start(db);
        expect_connect(&ra);

        let (tx, rx) = mpsc::channel();
        a.send_request(
            Message::request("ping"),
            Some(Box::new(move |result| {
                tx.send(result).unwrap();
            })),
        );
        let reply = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(reply.body, b"pong");
    }

    #[test]
    fn close_fails_outstanding_requests() {
        let (a, b) = InProcessPipe::pair();
        let (da, ra) = recorder(false);
        // No auto-response: the request stays pending.
        let (db, rb) = recorder(false);
        a.start(da);
        b.start(db.clone());
        expect_connect(&ra);
        expect_connect(&rb);

        let (tx, rx) = mpsc::channel();
        a.send_request(
            Message::request("ping"),
            Some(Box::new(move |result| {
                tx.send(result).unwrap();
            })),
        );
        // Let the request arrive (and be dropped as unanswered is avoided
        // by keeping db alive but not responding from the recorder).
        match rb.recv_timeout(Duration::from_secs(1)).unwrap() {
            Seen::Request(_) => {}
            _ => panic!("expected request"),
        }

        a.close(CloseCode::Normal, "done");
        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            Err(ReplyError::Disconnected) => {}
            // The dropped IncomingRequest may have answered first.
            Err(ReplyError::Remote(e)) => assert_eq!(e.code, 404),
            Ok(_) => panic!("expected failure"),
        }

        match ra.recv_timeout(Duration::from_secs(1)).unwrap() {
            Seen::Close(status) => assert!(status.is_normal()),
            _ => panic!("expected close"),
        }
    }

    #[test]
    fn send_after_close_fails_fast() {
        let (a, b) = InProcessPipe::pair();
        let (da, ra) = recorder(false);
        let (db, _rb) = recorder(false);
        a.start(da);
        b.start(db);
        expect_connect(&ra);

        a.close(CloseCode::Normal, "");
        match ra.recv_timeout(Duration::from_secs(1)).unwrap() {
            Seen::Close(_) => {}
            _ => panic!("expected close"),
        }

        let (tx, rx) = mpsc::channel();
        a.send_request(
            Message::request("late"),
            Some(Box::new(move |result| {
                tx.send(result).unwrap();
            })),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Err(ReplyError::Disconnected)
        );
    }

    #[test]
    fn custom_upgrade_headers_are_delivered() {
        let (a, b) = InProcessPipe::pair();
        a.set_upgrade_headers(vec![("Set-Cookie".to_string(), "s=1".to_string())]);
        let (da, ra) = recorder(false);
        let (db, _rb) = recorder(false);
        a.start(da);
        b.start(db);

        let mut headers = None;
        for _ in 0..2 {
            if let Seen::Http(_, h) = ra.recv_timeout(Duration::from_secs(1)).unwrap() {
                headers = Some(h);
            }
        }
        assert_eq!(
            headers.unwrap(),
            vec![("Set-Cookie".to_string(), "s=1".to_string())]
        );
    }
}
