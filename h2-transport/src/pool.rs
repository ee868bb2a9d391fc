use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use http::Request;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Http2Client;
use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionListener, ConnectionState, RefuseReason, Refused};
use crate::error::{Error, ErrorCode};
use crate::exchange::Exchange;
use crate::listener::ExchangeListener;
use crate::session::Endpoint;
use crate::transport::TransportListener;

/// Destinations of a transport, keyed by endpoint.
pub(crate) type Destinations = Mutex<HashMap<Endpoint, Arc<Destination>>>;

/// Result of waiting in a destination queue.
enum Admission {
    Admitted(Exchange),
    /// The connection stopped accepting streams; acquire another one.
    Retry(Request<Bytes>, Arc<dyn ExchangeListener>),
}

struct Pending {
    request: Request<Bytes>,
    listener: Arc<dyn ExchangeListener>,
    admit: oneshot::Sender<Admission>,
}

/// Requests and the connection for one [`Endpoint`].
///
/// Keeps at most one usable connection. Requests that hit the peer's
/// concurrency limit wait in a FIFO queue until a stream is released.
pub(crate) struct Destination {
    endpoint: Endpoint,
    client: Arc<Http2Client>,
    max_queued: usize,
    listener: Option<Arc<dyn TransportListener>>,
    shutdown: CancellationToken,
    registry: Weak<Destinations>,
    /// Open [`Lease`]s. Only incremented under the registry lock.
    leases: AtomicUsize,
    this: Weak<Destination>,
    connecting: tokio::sync::Mutex<()>,
    current: Mutex<Option<Arc<Connection>>>,
    queue: Mutex<VecDeque<Pending>>,
}

impl Destination {
    pub(crate) fn new(
        endpoint: Endpoint,
        client: Arc<Http2Client>,
        max_queued: usize,
        listener: Option<Arc<dyn TransportListener>>,
        shutdown: CancellationToken,
        registry: Weak<Destinations>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            endpoint,
            client,
            max_queued,
            listener,
            shutdown,
            registry,
            leases: AtomicUsize::new(0),
            this: this.clone(),
            connecting: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// The connection currently used for new requests.
    pub(crate) fn connection(&self) -> Option<Arc<Connection>> {
        self.current.lock().unwrap().clone()
    }

    /// Bind `request` to a stream, waiting for capacity if needed.
    pub(crate) async fn send(
        &self,
        mut request: Request<Bytes>,
        mut listener: Arc<dyn ExchangeListener>,
    ) -> Result<Exchange, Error> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(Error::Stopped);
            }
            self.acquire().await?;

            let (admit, admitted) = oneshot::channel();
            {
                let mut queue = self.queue.lock().unwrap();
                if queue.len() >= self.max_queued {
                    return Err(Error::QueueFull);
                }
                queue.push_back(Pending {
                    request,
                    listener,
                    admit,
                });
            }
            self.process();

            let admission = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Err(Error::Stopped),
                admission = admitted => admission.map_err(|_| Error::Stopped)?,
            };
            match admission {
                Admission::Admitted(exchange) => return Ok(exchange),
                Admission::Retry(r, l) => {
                    debug!(endpoint = %self.endpoint, "connection closing, retrying on a new one");
                    request = r;
                    listener = l;
                }
            }
        }
    }

    /// Return an active connection, opening one if needed.
    ///
    /// Never opens a connection once the transport is stopping.
    async fn acquire(&self) -> Result<Arc<Connection>, Error> {
        let _connecting = self.connecting.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(Error::Stopped);
        }
        if let Some(connection) = self.connection()
            && connection.state() == ConnectionState::Active
        {
            return Ok(connection);
        }
        let this = self.this.upgrade().ok_or(Error::Stopped)?;
        let config = self.client.config().ok_or(Error::NotStarted)?;

        let connection = Connection::new(self.endpoint.clone(), config, this);
        let session = self
            .client
            .connect(&self.endpoint, connection.clone())
            .await?;
        if !connection.bind(session) {
            return Err(Error::Stopped);
        }
        {
            // The transport cancels the token before `close` takes `current`.
            let mut current = self.current.lock().unwrap();
            if !self.shutdown.is_cancelled() {
                *current = Some(connection.clone());
                return Ok(connection);
            }
        }
        connection.close(ErrorCode::NoError);
        Err(Error::Stopped)
    }

    /// Admit queued requests in order until the connection refuses one.
    ///
    /// The queue lock is held across `create_exchange` so admissions are
    /// strictly FIFO. Connection callbacks never take this lock directly;
    /// they schedule `process` on the executor.
    fn process(&self) {
        let connection = self.connection();
        let mut queue = self.queue.lock().unwrap();
        while let Some(pending) = queue.pop_front() {
            if pending.admit.is_closed() {
                continue;
            }
            let Pending {
                request,
                listener,
                admit,
            } = pending;
            let Some(connection) = &connection else {
                let _ = admit.send(Admission::Retry(request, listener));
                continue;
            };
            match connection.create_exchange(request, listener) {
                Ok(exchange) => {
                    if let Err(Admission::Admitted(exchange)) =
                        admit.send(Admission::Admitted(exchange))
                    {
                        exchange.abort_request("request cancelled while queued");
                    }
                }
                Err(Refused {
                    reason: RefuseReason::ConcurrencyLimit,
                    request,
                    listener,
                }) => {
                    queue.push_front(Pending {
                        request,
                        listener,
                        admit,
                    });
                    debug!(
                        endpoint = %self.endpoint,
                        queued = queue.len(),
                        "request queued until a stream is released"
                    );
                    break;
                }
                Err(Refused {
                    reason: RefuseReason::Closing,
                    request,
                    listener,
                }) => {
                    let _ = admit.send(Admission::Retry(request, listener));
                }
            }
        }
    }

    /// Run `process` on the executor, off the caller's lock scope.
    fn schedule_process(&self, config: Option<Arc<SessionConfig>>) {
        let (Some(config), Some(this)) = (config, self.this.upgrade()) else {
            return;
        };
        config
            .executor
            .execute(Box::pin(async move { this.process() }));
    }

    /// Close the connection and drop every queued request.
    pub(crate) fn close(&self) {
        let connection = self.current.lock().unwrap().take();
        if let Some(connection) = connection {
            connection.close(ErrorCode::NoError);
        }
        self.queue.lock().unwrap().clear();
    }

    /// Remove this destination from the registry once it has no connection
    /// and no open lease. Every queued request belongs to a leaseholder.
    ///
    /// May run under the queue lock (a connection closing inside `process`),
    /// so it must not take it.
    fn retire(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut destinations = registry.lock().unwrap();
        if self.leases.load(Ordering::Acquire) > 0 || self.current.lock().unwrap().is_some() {
            return;
        }
        let registered = destinations
            .get(&self.endpoint)
            .is_some_and(|destination| std::ptr::eq(destination.as_ref(), self));
        if registered {
            destinations.remove(&self.endpoint);
            debug!(endpoint = %self.endpoint, "idle destination removed");
        }
    }

    fn notify<F>(&self, config: Option<Arc<SessionConfig>>, f: F)
    where
        F: FnOnce(&dyn TransportListener) + Send + 'static,
    {
        let (Some(config), Some(listener)) = (config, self.listener.clone()) else {
            return;
        };
        config
            .executor
            .execute(Box::pin(async move { f(listener.as_ref()) }));
    }
}

impl ConnectionListener for Destination {
    fn on_available(&self, _connection: &Connection) {
        self.schedule_process(self.client.config());
    }

    fn on_go_away(&self, connection: &Connection, last_stream_id: u32, error_code: ErrorCode) {
        let id = connection.id();
        self.notify(self.client.config(), move |listener| {
            listener.on_go_away(id, last_stream_id, error_code)
        });
        self.schedule_process(self.client.config());
    }

    fn on_closed(&self, connection: &Connection) {
        {
            let mut current = self.current.lock().unwrap();
            if current.as_ref().is_some_and(|c| c.id() == connection.id()) {
                *current = None;
            }
        }
        self.retire();
        let id = connection.id();
        self.notify(self.client.config(), move |listener| listener.on_closed(id));
        self.schedule_process(self.client.config());
    }
}

/// A caller's hold on a [`Destination`].
///
/// Taken under the registry lock; a destination with open leases is never
/// removed from the registry.
pub(crate) struct Lease {
    destination: Arc<Destination>,
}

impl Lease {
    /// Look up or create the destination for `endpoint` and lease it.
    pub(crate) fn take(
        registry: &Arc<Destinations>,
        endpoint: Endpoint,
        create: impl FnOnce(&Endpoint) -> Arc<Destination>,
    ) -> Self {
        let mut destinations = registry.lock().unwrap();
        let destination = destinations
            .entry(endpoint)
            .or_insert_with_key(create)
            .clone();
        destination.leases.fetch_add(1, Ordering::AcqRel);
        Self { destination }
    }
}

impl Deref for Lease {
    type Target = Destination;

    fn deref(&self) -> &Destination {
        &self.destination
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.destination.leases.fetch_sub(1, Ordering::AcqRel);
        self.destination.retire();
    }
}
