//! One request/response pair bound to one HTTP/2 stream.
//!
//! The outcome of an exchange is decided exactly once: the first of
//! completion, peer reset, shutdown refusal or user abort to reach
//! [`Exchange::finalize`] wins, every later attempt is a no-op. Listener
//! hooks never run on the session's I/O path; they are delivered in order
//! by a per-exchange dispatcher task spawned on the configured executor.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Response, StatusCode, Version};
use tokio::sync::{mpsc, watch};
use tracing::error;

use crate::config::{ByteBufferPool, SessionConfig};
use crate::connection::Connection;
use crate::error::{BoxError, ErrorCode, Failure};
use crate::listener::ExchangeListener;

/// Outcome of an exchange.
#[derive(Debug, Clone)]
pub enum Outcome {
    Pending,
    Succeeded,
    Failed(Failure),
}

impl Outcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

/// A fully received response.
#[derive(Debug, Clone)]
pub struct ContentResponse {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl ContentResponse {
    fn new(head: Response<()>, body: Bytes) -> Self {
        let (parts, ()) = head.into_parts();
        Self {
            status: parts.status,
            version: Version::HTTP_2,
            headers: parts.headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Frame and lifecycle events queued for the dispatcher.
#[derive(Debug)]
pub(crate) enum Event {
    RequestBegin,
    RequestHeaders,
    RequestCommit,
    ResponseHeaders(Response<()>),
    ResponseContent(Bytes),
    Complete,
}

struct Inner {
    stream_id: u32,
    request: http::request::Parts,
    body: Mutex<Option<Bytes>>,
    connection: Weak<Connection>,
    listener: Arc<dyn ExchangeListener>,
    outcome: OnceLock<Outcome>,
    request_aborted: AtomicBool,
    response_aborted: AtomicBool,
    request_succeeded: AtomicBool,
    events: mpsc::UnboundedSender<Event>,
    done: watch::Sender<Option<Result<ContentResponse, Failure>>>,
}

/// Handle to an in-flight exchange. Cheap to clone.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<Inner>,
}

impl Exchange {
    /// Create the exchange. Its listener hooks start running once the
    /// returned [`Dispatcher`] is started.
    ///
    /// `request.version` must already carry `Version::HTTP_2`.
    pub(crate) fn new(
        stream_id: u32,
        request: http::request::Parts,
        body: Option<Bytes>,
        connection: Weak<Connection>,
        listener: Arc<dyn ExchangeListener>,
    ) -> (Self, Dispatcher) {
        let (events, rx) = mpsc::unbounded_channel();
        let (done, _) = watch::channel(None);
        let exchange = Self {
            inner: Arc::new(Inner {
                stream_id,
                request,
                body: Mutex::new(body),
                connection,
                listener,
                outcome: OnceLock::new(),
                request_aborted: AtomicBool::new(false),
                response_aborted: AtomicBool::new(false),
                request_succeeded: AtomicBool::new(false),
                events,
                done,
            }),
        };
        exchange.deliver(Event::RequestBegin);
        exchange.deliver(Event::RequestHeaders);
        exchange.deliver(Event::RequestCommit);

        let dispatcher = Dispatcher {
            exchange: exchange.clone(),
            events: rx,
        };
        (exchange, dispatcher)
    }

    pub fn stream_id(&self) -> u32 {
        self.inner.stream_id
    }

    /// The request head as sent on the stream.
    pub fn request(&self) -> &http::request::Parts {
        &self.inner.request
    }

    /// Protocol version the exchange is served with.
    pub fn version(&self) -> Version {
        self.inner.request.version
    }

    pub fn outcome(&self) -> Outcome {
        self.inner.outcome.get().cloned().unwrap_or(Outcome::Pending)
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    fn is_failed(&self) -> bool {
        self.inner.outcome.get().is_some_and(Outcome::is_failed)
    }

    /// Abort while the request is being sent.
    ///
    /// Resets the stream and fails the exchange unless it already reached
    /// an outcome. Returns whether this call decided the outcome.
    pub fn abort_request(&self, reason: impl Into<BoxError>) -> bool {
        if self.inner.request_aborted.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.abort(Failure::aborted(reason))
    }

    /// Abort while the response is being received.
    ///
    /// Same cancellation behavior as [`abort_request`](Self::abort_request).
    pub fn abort_response(&self, reason: impl Into<BoxError>) -> bool {
        if self.inner.response_aborted.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.abort(Failure::aborted(reason))
    }

    fn abort(&self, failure: Failure) -> bool {
        if self.is_finalized() {
            return false;
        }
        match self.inner.connection.upgrade() {
            Some(connection) => connection.abort_exchange(self, failure),
            None => self.finalize(Outcome::Failed(failure)),
        }
    }

    /// Wait for the terminal result.
    pub async fn response(&self) -> Result<ContentResponse, Failure> {
        let mut done = self.inner.done.subscribe();
        match done.wait_for(Option::is_some).await {
            Ok(result) => (*result)
                .clone()
                .unwrap_or_else(|| Err(Failure::closed(ErrorCode::InternalError))),
            Err(_) => Err(Failure::closed(ErrorCode::InternalError)),
        }
    }

    /// Record the outcome. Only the first call has any effect.
    pub(crate) fn finalize(&self, outcome: Outcome) -> bool {
        debug_assert!(!outcome.is_pending());
        if self.inner.outcome.set(outcome).is_err() {
            return false;
        }
        self.deliver(Event::Complete);
        true
    }

    pub(crate) fn deliver(&self, event: Event) {
        // The dispatcher only stops after `Complete`, later events are moot.
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn same(&self, other: &Exchange) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run a listener hook. A panicking hook fails the exchange instead of
    /// taking the dispatcher down with it.
    fn call(&self, hook: impl FnOnce()) {
        if panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
            error!(stream_id = self.inner.stream_id, "exchange listener panicked");
            self.abort(Failure::closed(ErrorCode::InternalError));
        }
    }

    /// Send the request body, if any, after commit.
    fn send_content(&self) {
        let body = self.inner.body.lock().unwrap().take();
        if let Some(body) = body {
            if let Some(connection) = self.inner.connection.upgrade() {
                connection.send_request_content(self, body.clone());
            }
            if self.is_failed() {
                return;
            }
            self.call(|| self.inner.listener.on_request_content(self, &body));
        }
        if !self.is_failed() {
            self.inner.request_succeeded.store(true, Ordering::Release);
            self.call(|| self.inner.listener.on_request_success(self));
        }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("stream_id", &self.inner.stream_id)
            .field("method", &self.inner.request.method)
            .field("uri", &self.inner.request.uri)
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Delivers one exchange's events to its listener, in order.
pub(crate) struct Dispatcher {
    exchange: Exchange,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Dispatcher {
    pub(crate) fn start(self, config: &SessionConfig) {
        let buffer_pool = config.buffer_pool.clone();
        config.executor.execute(Box::pin(self.run(buffer_pool)));
    }

    /// Content is aggregated in a pooled buffer and copied out on success,
    /// so the buffer goes back to the pool with its allocation before the
    /// result is published.
    async fn run(mut self, buffer_pool: Arc<ByteBufferPool>) {
        let exchange = &self.exchange;
        let listener = exchange.inner.listener.clone();
        let mut head: Option<Response<()>> = None;
        let mut content: BytesMut = buffer_pool.acquire(0);

        while let Some(event) = self.events.recv().await {
            if !matches!(event, Event::Complete) && exchange.is_failed() {
                continue;
            }
            match event {
                Event::RequestBegin => exchange.call(|| listener.on_request_begin(exchange)),
                Event::RequestHeaders => exchange.call(|| listener.on_request_headers(exchange)),
                Event::RequestCommit => {
                    exchange.call(|| listener.on_request_commit(exchange));
                    if !exchange.is_failed() {
                        exchange.send_content();
                    }
                }
                Event::ResponseHeaders(response) => {
                    exchange.call(|| listener.on_response_headers(exchange, &response));
                    head = Some(response);
                }
                Event::ResponseContent(chunk) => {
                    exchange.call(|| listener.on_response_content(exchange, &chunk));
                    content.extend_from_slice(&chunk);
                }
                Event::Complete => {
                    let result = match exchange.outcome() {
                        Outcome::Failed(failure) => {
                            let request_succeeded =
                                exchange.inner.request_succeeded.load(Ordering::Acquire);
                            exchange.call(|| {
                                if !request_succeeded {
                                    listener.on_request_failure(exchange, &failure);
                                }
                                listener.on_response_failure(exchange, &failure);
                            });
                            Err(failure)
                        }
                        _ => {
                            exchange.call(|| listener.on_response_success(exchange));
                            let body = Bytes::copy_from_slice(&content);
                            Ok(ContentResponse::new(head.take().unwrap_or_default(), body))
                        }
                    };
                    buffer_pool.release(content);
                    exchange.call(|| listener.on_complete(exchange, &result));
                    exchange.inner.done.send_replace(Some(result));
                    return;
                }
            }
        }
        buffer_pool.release(content);
    }
}
