//! In-memory HTTP/2 peer.
//!
//! Stands in for a server and the wire-level engine. Frames the client
//! sends are recorded and handed to a [`PeerHandler`] on one task; frames
//! the peer sends reach the client's `SessionHandler` on another, so
//! neither side ever runs inside the other's call.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use h2_transport::{
    BoxFuture, Connector, Endpoint, Error, ErrorCode, Session, SessionConfig, SessionHandler,
    Settings,
};
use http::{Response, StatusCode};
use tokio::sync::mpsc;
use tracing::debug;

/// A frame sent by the client, as recorded by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Headers {
        stream_id: u32,
        end_stream: bool,
    },
    Data {
        stream_id: u32,
        len: usize,
        end_stream: bool,
    },
    Reset {
        stream_id: u32,
        error_code: ErrorCode,
    },
    GoAway {
        error_code: ErrorCode,
    },
}

enum ToPeer {
    Headers(u32, http::request::Parts, bool),
    Data(u32, Bytes, bool),
    Reset(u32, ErrorCode),
    Close(ErrorCode),
}

enum ToClient {
    Settings(Settings),
    Headers(u32, Response<()>, bool),
    Data(u32, Bytes, bool),
    Reset(u32, ErrorCode),
    GoAway(u32, ErrorCode),
    Closed,
}

/// Server-side behavior of the peer. Every hook defaults to a no-op.
#[allow(unused_variables)]
pub trait PeerHandler: Send + Sync + 'static {
    fn on_new_stream(&self, stream: PeerStream, head: http::request::Parts, end_stream: bool) {}

    fn on_data(&self, stream: PeerStream, data: Bytes, end_stream: bool) {}

    fn on_reset(&self, stream: PeerStream, error_code: ErrorCode) {}

    /// The client sent GOAWAY and closed its session.
    fn on_go_away(&self, session: PeerSession, error_code: ErrorCode) {}
}

impl PeerHandler for () {}

/// Answers every request with an empty `200 OK` once the request is
/// complete.
pub struct Responder;

impl PeerHandler for Responder {
    fn on_new_stream(&self, stream: PeerStream, _head: http::request::Parts, end_stream: bool) {
        if end_stream {
            stream.respond(StatusCode::OK, true);
        }
    }

    fn on_data(&self, stream: PeerStream, _data: Bytes, end_stream: bool) {
        if end_stream {
            stream.respond(StatusCode::OK, true);
        }
    }
}

struct PeerInner {
    to_client: mpsc::UnboundedSender<ToClient>,
    frames: Mutex<Vec<Frame>>,
    last_stream_id: AtomicU32,
    closed: AtomicBool,
}

/// Peer side of one session.
#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<PeerInner>,
}

impl PeerSession {
    fn new(to_client: mpsc::UnboundedSender<ToClient>) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                to_client,
                frames: Mutex::new(Vec::new()),
                last_stream_id: AtomicU32::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Frames received from the client so far, in send order.
    pub fn frames(&self) -> Vec<Frame> {
        self.inner.frames.lock().unwrap().clone()
    }

    /// Highest stream id the peer has processed.
    pub fn last_stream_id(&self) -> u32 {
        self.inner.last_stream_id.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stream(&self, stream_id: u32) -> PeerStream {
        PeerStream {
            session: self.clone(),
            stream_id,
        }
    }

    pub fn settings(&self, settings: Settings) {
        self.send(ToClient::Settings(settings));
    }

    pub fn headers(&self, stream_id: u32, head: Response<()>, end_stream: bool) {
        self.send(ToClient::Headers(stream_id, head, end_stream));
    }

    pub fn data(&self, stream_id: u32, data: Bytes, end_stream: bool) {
        self.send(ToClient::Data(stream_id, data, end_stream));
    }

    pub fn reset(&self, stream_id: u32, error_code: ErrorCode) {
        self.send(ToClient::Reset(stream_id, error_code));
    }

    /// Send GOAWAY but keep serving streams up to `last_stream_id`.
    pub fn go_away(&self, last_stream_id: u32, error_code: ErrorCode) {
        self.send(ToClient::GoAway(last_stream_id, error_code));
    }

    /// Send GOAWAY naming the last processed stream, then drop the session.
    pub fn close(&self, error_code: ErrorCode) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let last_stream_id = self.last_stream_id();
        debug!(last_stream_id, ?error_code, "peer closing session");
        let _ = self
            .inner
            .to_client
            .send(ToClient::GoAway(last_stream_id, error_code));
        let _ = self.inner.to_client.send(ToClient::Closed);
    }

    fn send(&self, frame: ToClient) {
        if !self.is_closed() {
            let _ = self.inner.to_client.send(frame);
        }
    }

    fn record(&self, frame: Frame) {
        self.inner.frames.lock().unwrap().push(frame);
    }
}

/// Peer side of one stream.
#[derive(Clone)]
pub struct PeerStream {
    session: PeerSession,
    stream_id: u32,
}

impl PeerStream {
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    /// Send response HEADERS with `status`.
    pub fn respond(&self, status: StatusCode, end_stream: bool) {
        let mut head = Response::new(());
        *head.status_mut() = status;
        self.session.headers(self.stream_id, head, end_stream);
    }

    pub fn data(&self, data: impl Into<Bytes>, end_stream: bool) {
        self.session.data(self.stream_id, data.into(), end_stream);
    }

    pub fn reset(&self, error_code: ErrorCode) {
        self.session.reset(self.stream_id, error_code);
    }
}

/// Client half handed to the connection.
struct MemorySession {
    peer: PeerSession,
    to_peer: mpsc::UnboundedSender<ToPeer>,
}

impl Session for MemorySession {
    fn headers(&self, stream_id: u32, head: &http::request::Parts, end_stream: bool) {
        self.peer.record(Frame::Headers {
            stream_id,
            end_stream,
        });
        let _ = self
            .to_peer
            .send(ToPeer::Headers(stream_id, head.clone(), end_stream));
    }

    fn data(&self, stream_id: u32, data: Bytes, end_stream: bool) {
        self.peer.record(Frame::Data {
            stream_id,
            len: data.len(),
            end_stream,
        });
        let _ = self.to_peer.send(ToPeer::Data(stream_id, data, end_stream));
    }

    fn reset(&self, stream_id: u32, error_code: ErrorCode) {
        self.peer.record(Frame::Reset {
            stream_id,
            error_code,
        });
        let _ = self.to_peer.send(ToPeer::Reset(stream_id, error_code));
    }

    fn close(&self, error_code: ErrorCode) {
        self.peer.record(Frame::GoAway { error_code });
        let _ = self.to_peer.send(ToPeer::Close(error_code));
    }
}

/// Opens in-memory sessions served by a [`PeerHandler`].
///
/// The peer's SETTINGS are applied before `connect` resolves, so the first
/// request already sees the concurrency limit.
pub struct MemoryConnector {
    handler: Arc<dyn PeerHandler>,
    settings: Settings,
    stalled: bool,
    sessions: Mutex<Vec<PeerSession>>,
    configs: Mutex<Vec<Arc<SessionConfig>>>,
}

impl MemoryConnector {
    pub fn new(handler: impl PeerHandler) -> Self {
        Self {
            handler: Arc::new(handler),
            settings: Settings::default(),
            stalled: false,
            sessions: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
        }
    }

    /// Advertise `max_concurrent_streams` on every new session.
    pub fn max_concurrent_streams(mut self, limit: u32) -> Self {
        self.settings.max_concurrent_streams = Some(limit);
        self
    }

    /// Never complete a connect.
    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    /// Sessions opened so far, oldest first.
    pub fn sessions(&self) -> Vec<PeerSession> {
        self.sessions.lock().unwrap().clone()
    }

    /// Configuration passed to each connect call.
    pub fn configs(&self) -> Vec<Arc<SessionConfig>> {
        self.configs.lock().unwrap().clone()
    }
}

impl Connector for MemoryConnector {
    fn connect(
        &self,
        endpoint: &Endpoint,
        config: Arc<SessionConfig>,
        handler: Arc<dyn SessionHandler>,
    ) -> BoxFuture<'static, Result<Arc<dyn Session>, Error>> {
        self.configs.lock().unwrap().push(config);
        if self.stalled {
            return Box::pin(std::future::pending::<Result<Arc<dyn Session>, Error>>());
        }

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (to_peer, peer_rx) = mpsc::unbounded_channel();
        let peer = PeerSession::new(to_client);
        self.sessions.lock().unwrap().push(peer.clone());

        let peer_handler = self.handler.clone();
        let settings = self.settings;
        let endpoint = endpoint.clone();
        Box::pin(async move {
            tokio::spawn(run_peer(peer.clone(), peer_handler, peer_rx));
            handler.on_settings(&settings);
            tokio::spawn(run_client(handler, client_rx));
            debug!(%endpoint, "in-memory session opened");
            let session: Arc<dyn Session> = Arc::new(MemorySession { peer, to_peer });
            Ok(session)
        })
    }
}

async fn run_peer(
    peer: PeerSession,
    handler: Arc<dyn PeerHandler>,
    mut frames: mpsc::UnboundedReceiver<ToPeer>,
) {
    while let Some(frame) = frames.recv().await {
        match frame {
            ToPeer::Headers(stream_id, head, end_stream) => {
                peer.inner
                    .last_stream_id
                    .fetch_max(stream_id, Ordering::AcqRel);
                handler.on_new_stream(peer.stream(stream_id), head, end_stream);
            }
            ToPeer::Data(stream_id, data, end_stream) => {
                handler.on_data(peer.stream(stream_id), data, end_stream);
            }
            ToPeer::Reset(stream_id, error_code) => {
                handler.on_reset(peer.stream(stream_id), error_code);
            }
            ToPeer::Close(error_code) => {
                handler.on_go_away(peer.clone(), error_code);
                break;
            }
        }
    }
}

async fn run_client(
    handler: Arc<dyn SessionHandler>,
    mut frames: mpsc::UnboundedReceiver<ToClient>,
) {
    while let Some(frame) = frames.recv().await {
        match frame {
            ToClient::Settings(settings) => handler.on_settings(&settings),
            ToClient::Headers(stream_id, head, end_stream) => {
                handler.on_headers(stream_id, head, end_stream)
            }
            ToClient::Data(stream_id, data, end_stream) => {
                handler.on_data(stream_id, data, end_stream)
            }
            ToClient::Reset(stream_id, error_code) => handler.on_reset(stream_id, error_code),
            ToClient::GoAway(last_stream_id, error_code) => {
                handler.on_go_away(last_stream_id, error_code)
            }
            ToClient::Closed => {
                handler.on_closed();
                break;
            }
        }
    }
}
