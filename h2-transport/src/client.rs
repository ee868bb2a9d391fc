use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::Error;
use crate::session::{Connector, Endpoint, Session, SessionHandler};

/// Lifecycle of the HTTP/2 engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifeCycle {
    Stopped,
    Started,
}

/// The HTTP/2 engine: opens sessions through a [`Connector`] using the
/// configuration it was started with.
///
/// The configuration is fixed between [`start`](Self::start) and
/// [`stop`](Self::stop); readers get it without locking.
///
/// # Examples
///
/// ```ignore
/// use std::sync::Arc;
/// use h2_transport::{Http2Client, Http2Transport, ClientConfig};
///
/// async fn run(connector: Arc<dyn h2_transport::Connector>) {
///     let http2_client = Arc::new(Http2Client::new(connector));
///     let transport = Http2Transport::new(http2_client.clone());
///     transport.start(ClientConfig::default()).unwrap();
///     assert!(http2_client.is_started());
/// }
/// ```
pub struct Http2Client {
    connector: Arc<dyn Connector>,
    config: ArcSwapOption<SessionConfig>,
    lifecycle: Mutex<LifeCycle>,
}

impl Http2Client {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            config: ArcSwapOption::empty(),
            lifecycle: Mutex::new(LifeCycle::Stopped),
        }
    }

    /// Start the engine with `config`.
    ///
    /// Starting an already started engine is a no-op when the configuration
    /// matches and an [`Error::ConfigConflict`] otherwise.
    pub fn start(&self, config: SessionConfig) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if *lifecycle == LifeCycle::Started {
            let current = self.config.load_full().ok_or(Error::NotStarted)?;
            if let Some(field) = current.mismatch(&config) {
                warn!(field, "HTTP/2 engine already started with a different configuration");
                return Err(Error::ConfigConflict { field });
            }
            return Ok(());
        }
        info!(
            connect_timeout = ?config.connect_timeout,
            idle_timeout = ?config.idle_timeout,
            "HTTP/2 engine started"
        );
        self.config.store(Some(Arc::new(config)));
        *lifecycle = LifeCycle::Started;
        Ok(())
    }

    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if *lifecycle == LifeCycle::Started {
            *lifecycle = LifeCycle::Stopped;
            info!("HTTP/2 engine stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        *self.lifecycle.lock().unwrap() == LifeCycle::Started
    }

    pub fn is_stopped(&self) -> bool {
        !self.is_started()
    }

    /// Configuration of the last start, if any.
    pub fn config(&self) -> Option<Arc<SessionConfig>> {
        self.config.load_full()
    }

    /// Open a session to `endpoint`, bounded by the connect timeout.
    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Arc<dyn Session>, Error> {
        if !self.is_started() {
            return Err(Error::NotStarted);
        }
        let config = self.config.load_full().ok_or(Error::NotStarted)?;
        let timeout = config.connect_timeout;
        let connect = self.connector.connect(endpoint, config.clone(), handler);
        let expired = config.scheduler.sleep(timeout);

        debug!(%endpoint, "connecting");
        tokio::select! {
            result = connect => {
                if let Err(e) = &result {
                    error!(%endpoint, error = %e, "session connect failed");
                }
                result
            }
            () = expired => {
                error!(%endpoint, ?timeout, "session connect timed out");
                Err(Error::ConnectTimeout(timeout))
            }
        }
    }
}
