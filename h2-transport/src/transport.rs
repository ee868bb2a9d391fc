use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use http::Request;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge;
use crate::client::Http2Client;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{Error, ErrorCode};
use crate::exchange::{ContentResponse, Exchange};
use crate::listener::ExchangeListener;
use crate::pool::{Destination, Destinations, Lease};
use crate::session::Endpoint;

/// Connection events surfaced to the owner of the transport.
///
/// Delivered on the configured executor, never on the session's I/O path.
#[allow(unused_variables)]
pub trait TransportListener: Send + Sync {
    /// The peer sent GOAWAY on `connection`.
    fn on_go_away(&self, connection: u64, last_stream_id: u32, error_code: ErrorCode) {}

    /// `connection` is closed and will not be used again.
    fn on_closed(&self, connection: u64) {}
}

/// Runs generic HTTP exchanges over multiplexed HTTP/2 sessions.
///
/// Requests for the same [`Endpoint`] share one connection; a request that
/// finds the peer's concurrency limit reached waits for a free stream.
pub struct Http2Transport {
    client: Arc<Http2Client>,
    listener: Option<Arc<dyn TransportListener>>,
    config: ArcSwapOption<ClientConfig>,
    shutdown: Mutex<CancellationToken>,
    destinations: Arc<Destinations>,
}

impl Http2Transport {
    pub fn new(client: Arc<Http2Client>) -> Self {
        Self {
            client,
            listener: None,
            config: ArcSwapOption::empty(),
            shutdown: Mutex::new(CancellationToken::new()),
            destinations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TransportListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// The engine this transport runs on.
    pub fn http2_client(&self) -> &Arc<Http2Client> {
        &self.client
    }

    /// Start the transport: forward `config` to the engine and start it.
    pub fn start(&self, config: ClientConfig) -> Result<(), Error> {
        bridge::bind(&config, &self.client)?;
        {
            let mut shutdown = self.shutdown.lock().unwrap();
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
        }
        self.config.store(Some(Arc::new(config)));
        info!("HTTP/2 transport started");
        Ok(())
    }

    /// Stop the transport.
    ///
    /// Closes every connection, failing their in-flight exchanges, fails
    /// queued requests with [`Error::Stopped`] and stops the engine.
    pub fn stop(&self) {
        self.shutdown.lock().unwrap().cancel();
        self.config.store(None);
        let destinations: Vec<_> = self
            .destinations
            .lock()
            .unwrap()
            .drain()
            .map(|(_, destination)| destination)
            .collect();
        for destination in destinations {
            destination.close();
        }
        self.client.stop();
        info!("HTTP/2 transport stopped");
    }

    pub fn is_started(&self) -> bool {
        self.config.load().is_some() && self.client.is_started()
    }

    /// Send `request`, returning once it is bound to a stream.
    ///
    /// Listener hooks run on the executor as the exchange progresses;
    /// [`Exchange::response`] waits for the result.
    pub async fn send(
        &self,
        request: Request<Bytes>,
        listener: Arc<dyn ExchangeListener>,
    ) -> Result<Exchange, Error> {
        let destination = self.destination(Endpoint::from_uri(request.uri())?)?;
        destination.send(request, listener).await
    }

    /// Send `request` and wait for the complete response.
    pub async fn request(&self, request: Request<Bytes>) -> Result<ContentResponse, Error> {
        let exchange = self.send(request, Arc::new(())).await?;
        Ok(exchange.response().await?)
    }

    /// The connection currently serving `endpoint`, if any.
    pub fn connection(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        self.destinations
            .lock()
            .unwrap()
            .get(endpoint)
            .and_then(|destination| destination.connection())
    }

    /// Endpoints with a live destination: an open connection or a request
    /// in progress.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.destinations.lock().unwrap().keys().cloned().collect()
    }

    fn destination(&self, endpoint: Endpoint) -> Result<Lease, Error> {
        let config = self.config.load_full().ok_or(Error::NotStarted)?;
        if !self.client.is_started() {
            return Err(Error::NotStarted);
        }
        let shutdown = self.shutdown.lock().unwrap().clone();
        let registry = Arc::downgrade(&self.destinations);
        Ok(Lease::take(&self.destinations, endpoint, |endpoint| {
            debug!(%endpoint, "new destination");
            Destination::new(
                endpoint.clone(),
                self.client.clone(),
                config.max_requests_queued_per_destination,
                self.listener.clone(),
                shutdown,
                registry,
            )
        }))
    }
}
