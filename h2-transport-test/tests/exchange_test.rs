//! Request/response exchange tests
//!
//! Requests are tagged as HTTP/2, bound to a stream, and report their
//! listener events in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use h2_transport::{
    ByteBufferPool, ClientConfig, ContentResponse, ErrorCode, Exchange, ExchangeListener, Failure,
    FailureKind, StreamId,
};
use h2_transport_test::peer::{MemoryConnector, PeerHandler, PeerStream, Responder};
use h2_transport_test::util::{TEST_TIMEOUT, get, init_tracing, request, start_transport};
use http::{Method, StatusCode, Version};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Echoes the request body back, recording the version of each request.
#[derive(Default)]
struct Echo {
    bodies: Mutex<HashMap<u32, BytesMut>>,
    versions: Mutex<Vec<Version>>,
}

impl PeerHandler for Echo {
    fn on_new_stream(&self, stream: PeerStream, head: http::request::Parts, end_stream: bool) {
        self.versions.lock().unwrap().push(head.version);
        if end_stream {
            stream.respond(StatusCode::OK, true);
        }
    }

    fn on_data(&self, stream: PeerStream, data: Bytes, end_stream: bool) {
        let mut bodies = self.bodies.lock().unwrap();
        bodies.entry(stream.id()).or_default().extend_from_slice(&data);
        if end_stream {
            let body = bodies.remove(&stream.id()).unwrap_or_default();
            stream.respond(StatusCode::OK, false);
            stream.data(body.freeze(), true);
        }
    }
}

/// Records listener hooks by name.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<&'static str>>,
    versions: Mutex<Vec<Version>>,
    stream_ids: Mutex<Vec<Option<StreamId>>>,
}

impl Recorder {
    fn push(&self, event: &'static str) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }
}

impl ExchangeListener for Recorder {
    fn on_request_begin(&self, exchange: &Exchange) {
        self.versions.lock().unwrap().push(exchange.version());
        self.stream_ids
            .lock()
            .unwrap()
            .push(exchange.request().extensions.get::<StreamId>().copied());
        self.push("request_begin");
    }

    fn on_request_headers(&self, _exchange: &Exchange) {
        self.push("request_headers");
    }

    fn on_request_commit(&self, _exchange: &Exchange) {
        self.push("request_commit");
    }

    fn on_request_content(&self, _exchange: &Exchange, _content: &Bytes) {
        self.push("request_content");
    }

    fn on_request_success(&self, _exchange: &Exchange) {
        self.push("request_success");
    }

    fn on_request_failure(&self, _exchange: &Exchange, _failure: &Failure) {
        self.push("request_failure");
    }

    fn on_response_headers(&self, _exchange: &Exchange, _head: &http::Response<()>) {
        self.push("response_headers");
    }

    fn on_response_content(&self, _exchange: &Exchange, _content: &Bytes) {
        self.push("response_content");
    }

    fn on_response_success(&self, _exchange: &Exchange) {
        self.push("response_success");
    }

    fn on_response_failure(&self, _exchange: &Exchange, _failure: &Failure) {
        self.push("response_failure");
    }

    fn on_complete(&self, _exchange: &Exchange, _result: &Result<ContentResponse, Failure>) {
        self.push("complete");
    }
}

#[tokio::test]
async fn request_has_http2_version() {
    init_tracing();
    let echo = Arc::new(Echo::default());
    let connector = Arc::new(MemoryConnector::new(SharedEcho(echo.clone())));
    let transport = start_transport(connector, ClientConfig::default(), None);

    let mut plain = request(Method::GET, "/", Bytes::new());
    *plain.version_mut() = Version::HTTP_11;

    let recorder = Arc::new(Recorder::default());
    let exchange = transport.send(plain, recorder.clone()).await.unwrap();
    assert_eq!(exchange.version(), Version::HTTP_2);

    let response = timeout(TEST_TIMEOUT, exchange.response())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.version(), Version::HTTP_2);

    assert_eq!(*echo.versions.lock().unwrap(), vec![Version::HTTP_2]);
    assert_eq!(*recorder.versions.lock().unwrap(), vec![Version::HTTP_2]);
    assert_eq!(
        *recorder.stream_ids.lock().unwrap(),
        vec![Some(StreamId(exchange.stream_id()))]
    );
}

#[tokio::test]
async fn request_content_is_echoed() {
    init_tracing();
    let connector = Arc::new(MemoryConnector::new(Echo::default()));
    let transport = start_transport(connector, ClientConfig::default(), None);

    let recorder = Arc::new(Recorder::default());
    let exchange = transport
        .send(request(Method::POST, "/echo", "hello over h2"), recorder.clone())
        .await
        .unwrap();
    let response = timeout(TEST_TIMEOUT, exchange.response())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.body(), "hello over h2");

    assert_eq!(
        recorder.events(),
        vec![
            "request_begin",
            "request_headers",
            "request_commit",
            "request_content",
            "request_success",
            "response_headers",
            "response_content",
            "response_success",
            "complete",
        ]
    );
}

#[tokio::test]
async fn request_without_content_ends_stream_with_headers() {
    init_tracing();
    let connector = Arc::new(MemoryConnector::new(Responder));
    let transport = start_transport(connector.clone(), ClientConfig::default(), None);

    let recorder = Arc::new(Recorder::default());
    let exchange = transport.send(get("/"), recorder.clone()).await.unwrap();
    timeout(TEST_TIMEOUT, exchange.response())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        connector.sessions()[0].frames(),
        vec![h2_transport_test::peer::Frame::Headers {
            stream_id: 1,
            end_stream: true,
        }]
    );
    assert!(!recorder.events().contains(&"request_content"));
    assert!(recorder.events().contains(&"request_success"));
}

struct ResetByPeer;

impl PeerHandler for ResetByPeer {
    fn on_new_stream(&self, stream: PeerStream, _head: http::request::Parts, _end_stream: bool) {
        stream.reset(ErrorCode::InternalError);
    }
}

#[tokio::test]
async fn peer_reset_fails_exchange() {
    init_tracing();
    let connector = Arc::new(MemoryConnector::new(ResetByPeer));
    let transport = start_transport(connector, ClientConfig::default(), None);

    let recorder = Arc::new(Recorder::default());
    let exchange = transport.send(get("/"), recorder.clone()).await.unwrap();
    let failure = timeout(TEST_TIMEOUT, exchange.response())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(failure.kind(), FailureKind::Reset(ErrorCode::InternalError));
    assert!(!failure.is_retryable());
    assert_eq!(recorder.events().last(), Some(&"complete"));
    assert!(recorder.events().contains(&"response_failure"));
}

/// Sends DATA before any response HEADERS.
struct DataFirst {
    resets: mpsc::UnboundedSender<ErrorCode>,
}

impl PeerHandler for DataFirst {
    fn on_new_stream(&self, stream: PeerStream, _head: http::request::Parts, _end_stream: bool) {
        stream.data(&b"early"[..], true);
    }

    fn on_reset(&self, _stream: PeerStream, error_code: ErrorCode) {
        let _ = self.resets.send(error_code);
    }
}

#[tokio::test]
async fn data_before_headers_is_a_protocol_error() {
    init_tracing();
    let (resets, mut reset_rx) = mpsc::unbounded_channel();
    let connector = Arc::new(MemoryConnector::new(DataFirst { resets }));
    let transport = start_transport(connector, ClientConfig::default(), None);

    let exchange = transport.send(get("/"), Arc::new(())).await.unwrap();
    let failure = timeout(TEST_TIMEOUT, exchange.response())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(failure.kind(), FailureKind::Reset(ErrorCode::ProtocolError));
    let error_code = timeout(TEST_TIMEOUT, reset_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(error_code, ErrorCode::ProtocolError);
}

/// Informational responses are skipped; the final one is reported.
struct Informational;

impl PeerHandler for Informational {
    fn on_new_stream(&self, stream: PeerStream, _head: http::request::Parts, _end_stream: bool) {
        stream.respond(StatusCode::CONTINUE, false);
        stream.respond(StatusCode::NO_CONTENT, true);
    }
}

#[tokio::test]
async fn informational_headers_are_skipped() {
    init_tracing();
    let connector = Arc::new(MemoryConnector::new(Informational));
    let transport = start_transport(connector, ClientConfig::default(), None);

    let response = timeout(TEST_TIMEOUT, transport.request(get("/")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(response.body().is_empty());
}

#[tokio::test]
async fn content_buffer_returns_to_pool() {
    init_tracing();
    let pool = Arc::new(ByteBufferPool::new(4, 64 * 1024));
    let connector = Arc::new(MemoryConnector::new(Echo::default()));
    let config = ClientConfig::default().buffer_pool(pool.clone());
    let transport = start_transport(connector, config, None);

    let body = "x".repeat(4096);
    let response = timeout(
        TEST_TIMEOUT,
        transport.request(request(Method::POST, "/echo", body.clone())),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(response.body(), body.as_bytes());

    // The buffer keeps its allocation for the next exchange.
    assert_eq!(pool.pooled(), 1);
    let reused = pool.acquire(0);
    assert!(reused.is_empty());
    assert!(reused.capacity() >= body.len());
}

/// Answers with headers and keeps the stream open, reporting resets.
struct OpenResponse {
    resets: mpsc::UnboundedSender<ErrorCode>,
}

impl PeerHandler for OpenResponse {
    fn on_new_stream(&self, stream: PeerStream, _head: http::request::Parts, _end_stream: bool) {
        stream.respond(StatusCode::OK, false);
    }

    fn on_reset(&self, _stream: PeerStream, error_code: ErrorCode) {
        let _ = self.resets.send(error_code);
    }
}

#[derive(Default)]
struct PanicOnHeaders {
    completes: AtomicUsize,
}

impl ExchangeListener for PanicOnHeaders {
    fn on_response_headers(&self, _exchange: &Exchange, _head: &http::Response<()>) {
        panic!("listener bug");
    }

    fn on_complete(&self, _exchange: &Exchange, _result: &Result<ContentResponse, Failure>) {
        self.completes.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn panicking_listener_fails_exchange() {
    init_tracing();
    let (resets, mut reset_rx) = mpsc::unbounded_channel();
    let connector = Arc::new(MemoryConnector::new(OpenResponse { resets }));
    let transport = start_transport(connector, ClientConfig::default(), None);

    let listener = Arc::new(PanicOnHeaders::default());
    let exchange = transport.send(get("/"), listener.clone()).await.unwrap();
    let failure = timeout(TEST_TIMEOUT, exchange.response())
        .await
        .expect("response never resolved")
        .unwrap_err();
    assert_eq!(failure.kind(), FailureKind::Closed(ErrorCode::InternalError));
    assert_eq!(listener.completes.load(Ordering::SeqCst), 1);

    // The stream is cancelled on the wire.
    let error_code = timeout(TEST_TIMEOUT, reset_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(error_code, ErrorCode::Cancel);
}

struct PanicOnComplete;

impl ExchangeListener for PanicOnComplete {
    fn on_complete(&self, _exchange: &Exchange, _result: &Result<ContentResponse, Failure>) {
        panic!("listener bug");
    }
}

#[tokio::test]
async fn panicking_completion_hook_still_reports_result() {
    init_tracing();
    let connector = Arc::new(MemoryConnector::new(Responder));
    let transport = start_transport(connector, ClientConfig::default(), None);

    let exchange = transport
        .send(get("/"), Arc::new(PanicOnComplete))
        .await
        .unwrap();
    let response = timeout(TEST_TIMEOUT, exchange.response())
        .await
        .expect("response never resolved")
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

/// Shares one [`Echo`] with the test body.
struct SharedEcho(Arc<Echo>);

impl PeerHandler for SharedEcho {
    fn on_new_stream(&self, stream: PeerStream, head: http::request::Parts, end_stream: bool) {
        self.0.on_new_stream(stream, head, end_stream);
    }

    fn on_data(&self, stream: PeerStream, data: Bytes, end_stream: bool) {
        self.0.on_data(stream, data, end_stream);
    }
}
