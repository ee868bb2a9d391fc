use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A boxed error type for h2-transport operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Map a wire value to a known code. Unknown codes are treated as
    /// `InternalError` (RFC 7540 Section 7).
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Error type for h2-transport operations.
#[derive(Debug)]
pub enum Error {
    /// Missing host in request URI.
    MissingHost,
    /// The transport or its HTTP/2 engine has not been started.
    NotStarted,
    /// The HTTP/2 engine was already started with a different configuration.
    ConfigConflict { field: &'static str },
    /// Opening the session failed.
    Connect(BoxError),
    /// Opening the session did not complete within the connect timeout.
    ConnectTimeout(Duration),
    /// The destination queue is full.
    QueueFull,
    /// The exchange reached a terminal failure.
    Failed(Failure),
    /// The transport was stopped while the request was pending.
    Stopped,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MissingHost => write!(f, "missing host in request URI"),
            Error::NotStarted => write!(f, "transport is not started"),
            Error::ConfigConflict { field } => {
                write!(f, "HTTP/2 engine already started with a different {field}")
            }
            Error::Connect(e) => write!(f, "session connect error: {e}"),
            Error::ConnectTimeout(d) => write!(f, "session connect timed out after {d:?}"),
            Error::QueueFull => write!(f, "destination request queue is full"),
            Error::Failed(e) => write!(f, "exchange failed: {e}"),
            Error::Stopped => write!(f, "transport stopped"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connect(e) => Some(e.as_ref()),
            Error::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Failure> for Error {
    fn from(e: Failure) -> Self {
        Error::Failed(e)
    }
}

/// Classification of a terminal exchange failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Aborted by the user.
    Aborted,
    /// The peer reset the stream.
    Reset(ErrorCode),
    /// The peer announced shutdown and never processed this stream.
    Refused,
    /// The session went away while the stream was still open.
    Closed(ErrorCode),
}

/// Terminal failure of an exchange.
#[derive(Debug, Clone)]
pub struct Failure {
    kind: FailureKind,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Failure {
    pub fn aborted(cause: impl Into<BoxError>) -> Self {
        Self {
            kind: FailureKind::Aborted,
            cause: Some(Arc::from(cause.into())),
        }
    }

    pub fn reset(code: ErrorCode) -> Self {
        Self {
            kind: FailureKind::Reset(code),
            cause: None,
        }
    }

    pub fn refused() -> Self {
        Self {
            kind: FailureKind::Refused,
            cause: None,
        }
    }

    pub fn closed(code: ErrorCode) -> Self {
        Self {
            kind: FailureKind::Closed(code),
            cause: None,
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// The user supplied abort reason, if any.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Whether the request is known not to have been processed by the peer
    /// and may be sent again on another connection.
    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Refused
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.cause) {
            (FailureKind::Aborted, Some(cause)) => write!(f, "aborted: {cause}"),
            (FailureKind::Aborted, None) => write!(f, "aborted"),
            (FailureKind::Reset(code), _) => write!(f, "stream reset by peer: {code:?}"),
            (FailureKind::Refused, _) => {
                write!(f, "refused by peer shutdown, safe to retry elsewhere")
            }
            (FailureKind::Closed(code), _) => write!(f, "session closed: {code:?}"),
        }
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause.as_ref()),
            None => None,
        }
    }
}
