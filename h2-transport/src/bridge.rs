//! Configuration bridge between the generic client and the HTTP/2 engine.
//!
//! Runs once when the transport starts. Executor, scheduler and buffer pool
//! are shared by reference; timeouts are copied.

use std::sync::Arc;

use crate::client::Http2Client;
use crate::config::{ClientConfig, SessionConfig};
use crate::error::Error;

/// Derive the engine configuration from the client configuration.
pub fn propagate(client: &ClientConfig) -> SessionConfig {
    SessionConfig {
        executor: Arc::clone(&client.executor),
        scheduler: Arc::clone(&client.scheduler),
        buffer_pool: Arc::clone(&client.buffer_pool),
        connect_timeout: client.connect_timeout,
        idle_timeout: client.idle_timeout,
    }
}

/// Start `engine` with the configuration derived from `client`.
///
/// An engine started beforehand is accepted only if it runs with the same
/// configuration; otherwise this fails with [`Error::ConfigConflict`] and
/// the engine is left untouched.
pub fn bind(client: &ClientConfig, engine: &Http2Client) -> Result<(), Error> {
    engine.start(propagate(client))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoxFuture, ByteBufferPool};
    use crate::session::{Connector, Endpoint, Session, SessionHandler};
    use std::time::Duration;

    struct NoConnector;

    impl Connector for NoConnector {
        fn connect(
            &self,
            _endpoint: &Endpoint,
            _config: Arc<SessionConfig>,
            _handler: Arc<dyn SessionHandler>,
        ) -> BoxFuture<'static, Result<Arc<dyn Session>, Error>> {
            Box::pin(async { Err(Error::Connect("unreachable".into())) })
        }
    }

    #[test]
    fn propagate_aliases_handles_and_copies_timeouts() {
        let client = ClientConfig::default()
            .connect_timeout(Duration::from_millis(13))
            .idle_timeout(Duration::from_millis(17));
        let session = propagate(&client);
        assert!(Arc::ptr_eq(&client.executor, &session.executor));
        assert!(Arc::ptr_eq(&client.scheduler, &session.scheduler));
        assert!(Arc::ptr_eq(&client.buffer_pool, &session.buffer_pool));
        assert_eq!(session.connect_timeout, Duration::from_millis(13));
        assert_eq!(session.idle_timeout, Duration::from_millis(17));
    }

    #[test]
    fn bind_starts_a_stopped_engine() {
        let engine = Http2Client::new(Arc::new(NoConnector));
        let client = ClientConfig::default();
        bind(&client, &engine).unwrap();
        assert!(engine.is_started());
        let config = engine.config().unwrap();
        assert_eq!(config.mismatch(&propagate(&client)), None);
    }

    #[test]
    fn bind_accepts_engine_started_with_same_config() {
        let engine = Http2Client::new(Arc::new(NoConnector));
        let client = ClientConfig::default();
        engine.start(propagate(&client)).unwrap();
        bind(&client, &engine).unwrap();
    }

    #[test]
    fn bind_fails_fast_on_conflicting_engine() {
        let engine = Http2Client::new(Arc::new(NoConnector));
        let client = ClientConfig::default();
        engine.start(propagate(&client)).unwrap();

        let other = client
            .clone()
            .buffer_pool(Arc::new(ByteBufferPool::default()));
        match bind(&other, &engine) {
            Err(Error::ConfigConflict { field }) => assert_eq!(field, "buffer pool"),
            other => panic!("expected conflict, got {other:?}"),
        }
        // The running configuration is kept.
        let config = engine.config().unwrap();
        assert!(Arc::ptr_eq(&config.buffer_pool, &client.buffer_pool));
    }
}
