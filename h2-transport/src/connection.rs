//! A multiplexed HTTP/2 connection.
//!
//! Binds exchanges to streams over one [`Session`], enforcing the peer's
//! SETTINGS_MAX_CONCURRENT_STREAMS and handling GOAWAY. Every mutation of
//! the stream set happens under the connection mutex, which also makes
//! stream id allocation and the HEADERS that open a stream one atomic step.
//! RST_STREAM, GOAWAY and listener notifications go out after the mutex is
//! released.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use http::{Request, Response, Version};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{ErrorCode, Failure};
use crate::exchange::{Event, Exchange, Outcome};
use crate::listener::ExchangeListener;
use crate::session::{
    Endpoint, MAX_STREAM_ID, Session, SessionHandler, Settings, StreamId, StreamState,
};
use crate::shutdown;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting new streams.
    Active,
    /// GOAWAY received or ids exhausted; existing streams finish, no new ones.
    Draining,
    /// Session released.
    Closed,
}

/// Why [`Connection::create_exchange`] declined a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefuseReason {
    /// The peer's concurrent stream limit is reached; retry on this
    /// connection once a stream is released.
    ConcurrencyLimit,
    /// The connection no longer accepts streams; use another one.
    Closing,
}

/// A request the connection declined, handed back to the caller.
pub struct Refused {
    pub reason: RefuseReason,
    pub request: Request<Bytes>,
    pub listener: Arc<dyn ExchangeListener>,
}

impl fmt::Debug for Refused {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refused")
            .field("reason", &self.reason)
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .finish()
    }
}

/// Connection lifecycle hooks, used by the destination pool.
#[allow(unused_variables)]
pub trait ConnectionListener: Send + Sync {
    /// A stream was released or the limit was raised.
    fn on_available(&self, connection: &Connection) {}

    /// The peer sent GOAWAY.
    fn on_go_away(&self, connection: &Connection, last_stream_id: u32, error_code: ErrorCode) {}

    /// The connection reached `Closed`. Called once.
    fn on_closed(&self, connection: &Connection) {}
}

pub(crate) struct StreamEntry {
    pub state: StreamState,
    pub response_started: bool,
    pub exchange: Exchange,
}

struct Inner {
    state: ConnectionState,
    session: Option<Arc<dyn Session>>,
    streams: BTreeMap<u32, StreamEntry>,
    next_stream_id: u32,
    max_concurrent_streams: Option<u32>,
    last_accepted_stream_id: Option<u32>,
    go_away_error: Option<ErrorCode>,
}

/// Follow-up decided under the lock, carried out after it.
enum Notice {
    None,
    Available,
    /// The connection closed; the session, if still attached, gets GOAWAY.
    Closed(Option<Arc<dyn Session>>),
}

pub struct Connection {
    id: u64,
    endpoint: Endpoint,
    config: Arc<SessionConfig>,
    listener: Arc<dyn ConnectionListener>,
    this: Weak<Connection>,
    inner: Mutex<Inner>,
}

impl Connection {
    /// Create an unbound connection. Requests are refused until
    /// [`bind`](Self::bind) attaches a session.
    pub fn new(
        endpoint: Endpoint,
        config: Arc<SessionConfig>,
        listener: Arc<dyn ConnectionListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            config,
            listener,
            this: this.clone(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Active,
                session: None,
                streams: BTreeMap::new(),
                next_stream_id: 1,
                max_concurrent_streams: None,
                last_accepted_stream_id: None,
                go_away_error: None,
            }),
        })
    }

    /// Attach the session opened for this connection.
    ///
    /// Returns `false` (and closes the session) if the connection was
    /// closed while connecting.
    pub fn bind(&self, session: Arc<dyn Session>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ConnectionState::Closed {
            drop(inner);
            session.close(ErrorCode::NoError);
            return false;
        }
        inner.session = Some(session);
        info!(connection = self.id, endpoint = %self.endpoint, "connection opened");
        true
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    /// Peer concurrency limit; `None` until the peer advertises one.
    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.inner.lock().unwrap().max_concurrent_streams
    }

    pub fn active_streams(&self) -> usize {
        self.inner.lock().unwrap().streams.len()
    }

    pub fn stream_state(&self, stream_id: u32) -> Option<StreamState> {
        self.inner
            .lock()
            .unwrap()
            .streams
            .get(&stream_id)
            .map(|entry| entry.state)
    }

    /// Last stream id the peer promised to process, once it sent GOAWAY.
    pub fn last_accepted_stream_id(&self) -> Option<u32> {
        self.inner.lock().unwrap().last_accepted_stream_id
    }

    /// Bind `request` to a new stream and send its headers.
    ///
    /// The request is tagged with `Version::HTTP_2` and a [`StreamId`]
    /// extension. A body is sent after the listener's
    /// `on_request_commit`. Declined requests are handed back in
    /// [`Refused`].
    pub fn create_exchange(
        &self,
        request: Request<Bytes>,
        listener: Arc<dyn ExchangeListener>,
    ) -> Result<Exchange, Refused> {
        let mut inner = self.inner.lock().unwrap();

        let session = match (&inner.session, inner.state) {
            (Some(session), ConnectionState::Active) => session.clone(),
            _ => {
                return Err(Refused {
                    reason: RefuseReason::Closing,
                    request,
                    listener,
                });
            }
        };
        if let Some(limit) = inner.max_concurrent_streams
            && inner.streams.len() >= limit as usize
        {
            debug!(
                connection = self.id,
                active = inner.streams.len(),
                limit,
                "concurrent stream limit reached"
            );
            return Err(Refused {
                reason: RefuseReason::ConcurrencyLimit,
                request,
                listener,
            });
        }
        let stream_id = inner.next_stream_id;
        if stream_id > MAX_STREAM_ID {
            info!(connection = self.id, "stream ids exhausted, draining");
            inner.state = ConnectionState::Draining;
            let notice = self.settle(&mut inner);
            drop(inner);
            self.notify(notice);
            return Err(Refused {
                reason: RefuseReason::Closing,
                request,
                listener,
            });
        }
        inner.next_stream_id += 2;

        let (mut head, body) = request.into_parts();
        head.version = Version::HTTP_2;
        head.extensions.insert(StreamId(stream_id));
        let body = (!body.is_empty()).then_some(body);
        let end_stream = body.is_none();

        session.headers(stream_id, &head, end_stream);
        let (exchange, dispatcher) =
            Exchange::new(stream_id, head, body, self.this.clone(), listener);
        inner.streams.insert(
            stream_id,
            StreamEntry {
                state: if end_stream {
                    StreamState::HalfClosedLocal
                } else {
                    StreamState::Open
                },
                response_started: false,
                exchange: exchange.clone(),
            },
        );
        debug!(connection = self.id, stream_id, end_stream, "stream opened");
        drop(inner);

        dispatcher.start(&self.config);
        Ok(exchange)
    }

    /// Send the request body; finishes the exchange if the response already
    /// completed.
    pub(crate) fn send_request_content(&self, exchange: &Exchange, body: Bytes) {
        let stream_id = exchange.stream_id();
        let mut inner = self.inner.lock().unwrap();
        let Some(session) = inner.session.clone() else {
            return;
        };
        let Some(entry) = inner
            .streams
            .get_mut(&stream_id)
            .filter(|entry| entry.exchange.same(exchange))
        else {
            return;
        };
        match entry.state {
            StreamState::Open => {
                session.data(stream_id, body, true);
                entry.state = StreamState::HalfClosedLocal;
            }
            StreamState::HalfClosedRemote => {
                session.data(stream_id, body, true);
                self.complete(&mut inner, stream_id);
                let notice = self.settle(&mut inner);
                drop(inner);
                self.notify(notice);
            }
            _ => {}
        }
    }

    /// Fail `exchange` and reset its stream, unless it already finished.
    pub(crate) fn abort_exchange(&self, exchange: &Exchange, failure: Failure) -> bool {
        let stream_id = exchange.stream_id();
        let mut inner = self.inner.lock().unwrap();
        let registered = inner
            .streams
            .get(&stream_id)
            .is_some_and(|entry| entry.exchange.same(exchange));
        if !registered {
            return exchange.finalize(Outcome::Failed(failure));
        }
        if !exchange.finalize(Outcome::Failed(failure)) {
            return false;
        }
        inner.streams.remove(&stream_id);
        let session = inner.session.clone();
        debug!(connection = self.id, stream_id, "stream cancelled by abort");
        let notice = self.settle(&mut inner);
        drop(inner);
        if let Some(session) = session {
            session.reset(stream_id, ErrorCode::Cancel);
        }
        self.notify(notice);
        true
    }

    /// Apply a new peer concurrency limit.
    ///
    /// Lowering the limit never closes open streams; it only affects later
    /// [`create_exchange`](Self::create_exchange) calls.
    pub fn on_peer_settings_update(&self, new_limit: u32) {
        let mut inner = self.inner.lock().unwrap();
        let previous = inner.max_concurrent_streams.replace(new_limit);
        debug!(
            connection = self.id,
            ?previous,
            new_limit,
            active = inner.streams.len(),
            "peer concurrency limit updated"
        );
        let raised = previous.is_some_and(|previous| new_limit > previous);
        let active = inner.state == ConnectionState::Active;
        drop(inner);
        if raised && active {
            self.listener.on_available(self);
        }
    }

    /// Handle a peer GOAWAY.
    ///
    /// Streams above `last_stream_id` fail as refused; the others keep
    /// running. The connection closes once they have all finished.
    pub fn on_peer_graceful_close(&self, last_stream_id: u32, error_code: ErrorCode) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ConnectionState::Closed {
            return;
        }
        inner.state = ConnectionState::Draining;
        inner.go_away_error.get_or_insert(error_code);
        let Inner {
            streams,
            last_accepted_stream_id,
            ..
        } = &mut *inner;
        let drain = shutdown::drain(streams, last_accepted_stream_id, last_stream_id, error_code);
        info!(
            connection = self.id,
            last_stream_id = drain.last_stream_id,
            ?error_code,
            accepted = drain.accepted,
            refused = drain.refused,
            "peer sent GOAWAY"
        );
        let notice = self.settle(&mut inner);
        drop(inner);
        self.listener.on_go_away(self, last_stream_id, error_code);
        self.notify(notice);
    }

    /// Handle a peer RST_STREAM.
    pub fn on_stream_reset(&self, stream_id: u32, error_code: ErrorCode) {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut entry) = inner.streams.remove(&stream_id) else {
            debug!(connection = self.id, stream_id, "reset for unknown stream");
            return;
        };
        entry.state = StreamState::Reset;
        debug!(connection = self.id, stream_id, ?error_code, "stream reset by peer");
        entry
            .exchange
            .finalize(Outcome::Failed(Failure::reset(error_code)));
        let notice = self.settle(&mut inner);
        drop(inner);
        self.notify(notice);
    }

    /// Relay response HEADERS. A second header block is treated as
    /// trailers and only its END_STREAM flag is honoured.
    pub fn on_response_headers(&self, stream_id: u32, head: Response<()>, end_stream: bool) {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.streams.get_mut(&stream_id) else {
            debug!(connection = self.id, stream_id, "headers for unknown stream");
            return;
        };
        if !entry.response_started {
            if head.status().is_informational() && !end_stream {
                return;
            }
            entry.response_started = true;
            entry.exchange.deliver(Event::ResponseHeaders(head));
        }
        if end_stream {
            let notice = self.remote_end(&mut inner, stream_id);
            drop(inner);
            self.notify(notice);
        }
    }

    /// Relay response DATA.
    pub fn on_response_data(&self, stream_id: u32, data: Bytes, end_stream: bool) {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.streams.get_mut(&stream_id) else {
            debug!(connection = self.id, stream_id, "data for unknown stream");
            return;
        };
        if !entry.response_started {
            warn!(connection = self.id, stream_id, "DATA before response HEADERS");
            let session = inner.session.clone();
            if let Some(entry) = inner.streams.remove(&stream_id) {
                entry
                    .exchange
                    .finalize(Outcome::Failed(Failure::reset(ErrorCode::ProtocolError)));
            }
            let notice = self.settle(&mut inner);
            drop(inner);
            if let Some(session) = session {
                session.reset(stream_id, ErrorCode::ProtocolError);
            }
            self.notify(notice);
            return;
        }
        if !data.is_empty() {
            entry.exchange.deliver(Event::ResponseContent(data));
        }
        if end_stream {
            let notice = self.remote_end(&mut inner, stream_id);
            drop(inner);
            self.notify(notice);
        }
    }

    /// The session went away. Every open exchange is finalized.
    ///
    /// Streams above a GOAWAY's last stream id were already refused when it
    /// arrived, so the ones left may have been processed and fail as closed.
    pub fn on_session_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.session = None;
        let streams = std::mem::take(&mut inner.streams);
        let error_code = inner.go_away_error.unwrap_or(ErrorCode::InternalError);
        if !streams.is_empty() {
            warn!(
                connection = self.id,
                open = streams.len(),
                "session closed with open streams"
            );
        }
        for entry in streams.into_values() {
            entry
                .exchange
                .finalize(Outcome::Failed(Failure::closed(error_code)));
        }
        let was_closed = inner.state == ConnectionState::Closed;
        inner.state = ConnectionState::Closed;
        drop(inner);
        if !was_closed {
            info!(connection = self.id, "connection closed by peer");
            self.listener.on_closed(self);
        }
    }

    /// Close locally: send GOAWAY and fail every open exchange.
    pub fn close(&self, error_code: ErrorCode) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ConnectionState::Closed {
            return;
        }
        inner.state = ConnectionState::Closed;
        let session = inner.session.take();
        let streams = std::mem::take(&mut inner.streams);
        drop(inner);
        if let Some(session) = session {
            session.close(error_code);
        }
        for entry in streams.into_values() {
            entry
                .exchange
                .finalize(Outcome::Failed(Failure::closed(error_code)));
        }
        info!(connection = self.id, ?error_code, "connection closed");
        self.listener.on_closed(self);
    }

    /// The peer finished its side of `stream_id`.
    fn remote_end(&self, inner: &mut Inner, stream_id: u32) -> Notice {
        let Some(entry) = inner.streams.get_mut(&stream_id) else {
            return Notice::None;
        };
        let state = entry.state;
        match state {
            StreamState::HalfClosedLocal => {
                self.complete(inner, stream_id);
                self.settle(inner)
            }
            StreamState::Open => {
                entry.state = StreamState::HalfClosedRemote;
                Notice::None
            }
            _ => Notice::None,
        }
    }

    /// Both sides of `stream_id` are done.
    fn complete(&self, inner: &mut Inner, stream_id: u32) {
        if let Some(mut entry) = inner.streams.remove(&stream_id) {
            entry.state = StreamState::Closed;
            debug!(connection = self.id, stream_id, "stream closed");
            entry.exchange.finalize(Outcome::Succeeded);
        }
    }

    /// Close a draining connection once its last stream is gone.
    fn settle(&self, inner: &mut Inner) -> Notice {
        match inner.state {
            ConnectionState::Draining if inner.streams.is_empty() => {
                inner.state = ConnectionState::Closed;
                info!(
                    connection = self.id,
                    last_stream_id = ?inner.last_accepted_stream_id,
                    "connection drained"
                );
                Notice::Closed(inner.session.take())
            }
            ConnectionState::Active => Notice::Available,
            _ => Notice::None,
        }
    }

    fn notify(&self, notice: Notice) {
        match notice {
            Notice::None => {}
            Notice::Available => self.listener.on_available(self),
            Notice::Closed(session) => {
                if let Some(session) = session {
                    session.close(ErrorCode::NoError);
                }
                self.listener.on_closed(self);
            }
        }
    }
}

impl SessionHandler for Connection {
    fn on_settings(&self, settings: &Settings) {
        if let Some(limit) = settings.max_concurrent_streams {
            self.on_peer_settings_update(limit);
        }
    }

    fn on_headers(&self, stream_id: u32, head: Response<()>, end_stream: bool) {
        self.on_response_headers(stream_id, head, end_stream);
    }

    fn on_data(&self, stream_id: u32, data: Bytes, end_stream: bool) {
        self.on_response_data(stream_id, data, end_stream);
    }

    fn on_reset(&self, stream_id: u32, error_code: ErrorCode) {
        self.on_stream_reset(stream_id, error_code);
    }

    fn on_go_away(&self, last_stream_id: u32, error_code: ErrorCode) {
        self.on_peer_graceful_close(last_stream_id, error_code);
    }

    fn on_closed(&self) {
        self.on_session_closed();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
