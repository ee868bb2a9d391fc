//! HTTP/2 client transport.
//!
//! Runs the request/response exchanges of a generic HTTP client over
//! multiplexed HTTP/2 sessions. Many exchanges share one connection; each
//! is bound to its own stream, and the peer's SETTINGS_MAX_CONCURRENT_STREAMS
//! decides how many run at once.
//!
//! The wire protocol is not implemented here. A [`Connector`] opens a
//! [`Session`] (the outbound frame sink) and feeds inbound frames back
//! through the [`SessionHandler`] it was given.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use h2_transport::{ClientConfig, Http2Client, Http2Transport};
//!
//! async fn run(connector: Arc<dyn h2_transport::Connector>) {
//!     let transport = Http2Transport::new(Arc::new(Http2Client::new(connector)));
//!     transport.start(ClientConfig::default()).unwrap();
//!
//!     let request = http::Request::get("https://example.com/")
//!         .body(Bytes::new())
//!         .unwrap();
//!     let response = transport.request(request).await.unwrap();
//!     assert_eq!(response.version(), http::Version::HTTP_2);
//! }
//! ```

pub mod bridge;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod exchange;
pub mod listener;
mod pool;
pub mod session;
pub mod shutdown;
pub mod transport;

pub use client::Http2Client;
pub use config::{
    BoxFuture, ByteBufferPool, ClientConfig, Executor, Scheduler, SessionConfig, TokioExecutor,
    TokioScheduler,
};
pub use connection::{Connection, ConnectionListener, ConnectionState, RefuseReason, Refused};
pub use error::{BoxError, Error, ErrorCode, Failure, FailureKind};
pub use exchange::{ContentResponse, Exchange, Outcome};
pub use listener::ExchangeListener;
pub use session::{
    Connector, Endpoint, MAX_STREAM_ID, Session, SessionHandler, Settings, StreamId, StreamState,
};
pub use transport::{Http2Transport, TransportListener};
