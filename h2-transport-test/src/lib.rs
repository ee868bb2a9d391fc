pub mod peer;

pub mod util {

    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use h2_transport::{ClientConfig, Endpoint, Http2Client, Http2Transport, TransportListener};
    use http::{Method, Request};
    use tracing_subscriber::EnvFilter;

    use crate::peer::MemoryConnector;

    /// Upper bound for anything a test waits on.
    pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    pub const TEST_AUTHORITY: &str = "localhost:8080";

    /// Install a test-writer subscriber. Respects RUST_LOG, defaults to
    /// info. Safe to call from every test.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_ansi(false)
            .with_test_writer()
            .try_init();
    }

    pub fn endpoint() -> Endpoint {
        Endpoint::new("http", "localhost", 8080)
    }

    pub fn request(method: Method, path: &str, body: impl Into<Bytes>) -> Request<Bytes> {
        Request::builder()
            .method(method)
            .uri(format!("http://{TEST_AUTHORITY}{path}"))
            .body(body.into())
            .expect("valid test request")
    }

    pub fn get(path: &str) -> Request<Bytes> {
        request(Method::GET, path, Bytes::new())
    }

    /// Start a transport over `connector` with `config`.
    pub fn start_transport(
        connector: Arc<MemoryConnector>,
        config: ClientConfig,
        listener: Option<Arc<dyn TransportListener>>,
    ) -> Arc<Http2Transport> {
        let mut transport = Http2Transport::new(Arc::new(Http2Client::new(connector)));
        if let Some(listener) = listener {
            transport = transport.with_listener(listener);
        }
        transport.start(config).expect("transport starts");
        Arc::new(transport)
    }
}
