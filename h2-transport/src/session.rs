//! Interfaces to the wire-level HTTP/2 engine.
//!
//! The adapter never encodes frames itself. It drives a [`Session`] for
//! outbound frames and receives inbound frames through a
//! [`SessionHandler`]. Sessions are opened by a [`Connector`].

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::{Response, Uri};

use crate::config::{BoxFuture, SessionConfig};
use crate::error::{Error, ErrorCode};

/// Largest stream identifier allowed by HTTP/2 (31 bits).
pub const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// State of an HTTP/2 stream (RFC 7540 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream identifier reserved, no frames sent.
    Idle,
    /// HEADERS sent, request body still to be sent.
    Open,
    /// We sent END_STREAM (no more outgoing data).
    HalfClosedLocal,
    /// Peer sent END_STREAM (no more incoming data).
    HalfClosedRemote,
    /// RST_STREAM sent or received.
    Reset,
    /// Both sides done.
    Closed,
}

/// Stream identifier attached to a request's extensions once the request
/// has been bound to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

/// Peer SETTINGS relevant to the adapter.
///
/// SETTINGS frames only carry changed parameters, so `None` means
/// "unchanged", not "unlimited".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3).
    pub max_concurrent_streams: Option<u32>,
}

/// Outbound half of a multiplexed session.
///
/// Calls never block; delivery failures surface later as
/// [`SessionHandler::on_closed`].
///
/// `headers` and `data` are called with the connection lock held, so that
/// stream ids reach the wire in order. They must not call back into the
/// [`SessionHandler`]; inbound events belong on the engine's own task.
/// `reset` and `close` are called after the lock is released and may report
/// back synchronously.
pub trait Session: Send + Sync {
    /// Send HEADERS opening `stream_id`.
    fn headers(&self, stream_id: u32, head: &http::request::Parts, end_stream: bool);

    /// Send DATA on `stream_id`.
    fn data(&self, stream_id: u32, data: Bytes, end_stream: bool);

    /// Send RST_STREAM.
    fn reset(&self, stream_id: u32, error_code: ErrorCode);

    /// Send GOAWAY and close the session.
    fn close(&self, error_code: ErrorCode);
}

/// Inbound events of a multiplexed session.
///
/// Invoked on the engine's I/O path. Each hook defaults to a no-op so
/// implementors only override what they consume.
#[allow(unused_variables)]
pub trait SessionHandler: Send + Sync {
    fn on_settings(&self, settings: &Settings) {}

    fn on_headers(&self, stream_id: u32, head: Response<()>, end_stream: bool) {}

    fn on_data(&self, stream_id: u32, data: Bytes, end_stream: bool) {}

    fn on_reset(&self, stream_id: u32, error_code: ErrorCode) {}

    fn on_go_away(&self, last_stream_id: u32, error_code: ErrorCode) {}

    /// The underlying connection is gone. No further events follow.
    fn on_closed(&self) {}
}

/// Opens sessions to an [`Endpoint`].
pub trait Connector: Send + Sync {
    /// Open a session and start delivering its inbound events to `handler`.
    ///
    /// The engine applies `config.idle_timeout` to the session.
    fn connect(
        &self,
        endpoint: &Endpoint,
        config: Arc<SessionConfig>,
        handler: Arc<dyn SessionHandler>,
    ) -> BoxFuture<'static, Result<Arc<dyn Session>, Error>>;
}

/// Destination of a request: scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// Derive the endpoint from a request URI.
    ///
    /// Scheme defaults to `http`; the port defaults to 443 for `https` and 80
    /// otherwise.
    pub fn from_uri(uri: &Uri) -> Result<Self, Error> {
        let host = uri.host().ok_or(Error::MissingHost)?;
        let scheme = uri.scheme_str().unwrap_or("http");
        let port = uri
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        Ok(Self::new(scheme, host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_from_uri_defaults_port() {
        let uri: Uri = "https://example.com/path".parse().unwrap();
        let endpoint = Endpoint::from_uri(&uri).unwrap();
        assert_eq!(endpoint, Endpoint::new("https", "example.com", 443));

        let uri: Uri = "http://localhost:8080/".parse().unwrap();
        let endpoint = Endpoint::from_uri(&uri).unwrap();
        assert_eq!(endpoint.port, 8080);
        assert_eq!(endpoint.to_string(), "http://localhost:8080");
    }

    #[test]
    fn endpoint_requires_host() {
        let uri: Uri = "/relative".parse().unwrap();
        assert!(matches!(Endpoint::from_uri(&uri), Err(Error::MissingHost)));
    }
}
