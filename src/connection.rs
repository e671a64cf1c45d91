#![deny(unsafe_code)]

//! Connection abstractions and composite connections.
//!
//! Transports hand the router anonymous point-to-point byte streams behind
//! the [`UnderlyingConnection`] trait. The router composes them into
//! [`MulticastConnection`] (one writable stream fanning out to several
//! subconnections) and [`ForkingConnection`] (a relay that pipes a stream
//! onward while optionally surfacing it to the local endpoint).

use crate::types::MeshError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the local side.
    Local,
    /// Closed by the remote side or the transport beneath it.
    Remote,
}

/// Events surfaced by a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Bytes received from the remote side.
    Data(Bytes),
    /// The connection is closed; no further data will arrive.
    Closed(CloseReason),
}

/// A bidirectional byte stream to one remote endpoint.
///
/// Implementations queue received data internally; consumers pull it with
/// [`UnderlyingConnection::next_event`]. After a `Closed` event the stream
/// keeps reporting `Closed`. Writes preserve order and never reorder bytes
/// within the connection.
#[async_trait]
pub trait UnderlyingConnection: Send + Sync + std::fmt::Debug {
    /// Bring the connection up. A no-op for already-connected streams.
    async fn connect(&self) -> Result<(), MeshError>;

    /// Write bytes to the remote side.
    async fn write(&self, data: Bytes) -> Result<(), MeshError>;

    /// Close the connection. Idempotent.
    async fn close(&self);

    /// Await the next data or close event.
    async fn next_event(&self) -> ConnectionEvent;
}

const EVENT_QUEUE_DEPTH: usize = 64;

/// Fan-out connection over several subconnections.
///
/// Writes go to every subconnection and complete once all of them have
/// acknowledged. Events from all subconnections surface on the composite;
/// the first subconnection to close closes the composite, since a multicast
/// with a missing branch must not keep accepting data.
pub struct MulticastConnection {
    subconnections: Vec<Arc<dyn UnderlyingConnection>>,
    events: Mutex<mpsc::Receiver<ConnectionEvent>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MulticastConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastConnection").finish_non_exhaustive()
    }
}

impl MulticastConnection {
    /// Aggregate `subconnections` into one composite connection.
    pub fn new(subconnections: Vec<Arc<dyn UnderlyingConnection>>) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        for subconnection in &subconnections {
            let subconnection = Arc::clone(subconnection);
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                loop {
                    match subconnection.next_event().await {
                        ConnectionEvent::Data(data) => {
                            if event_tx.send(ConnectionEvent::Data(data)).await.is_err() {
                                break;
                            }
                        }
                        ConnectionEvent::Closed(reason) => {
                            let _ = event_tx.send(ConnectionEvent::Closed(reason)).await;
                            break;
                        }
                    }
                }
            });
        }
        Arc::new(Self {
            subconnections,
            events: Mutex::new(event_rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of aggregated subconnections.
    pub fn len(&self) -> usize {
        self.subconnections.len()
    }

    /// Whether the composite has no subconnections.
    pub fn is_empty(&self) -> bool {
        self.subconnections.is_empty()
    }
}

#[async_trait]
impl UnderlyingConnection for MulticastConnection {
    async fn connect(&self) -> Result<(), MeshError> {
        Ok(())
    }

    async fn write(&self, data: Bytes) -> Result<(), MeshError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::TransportClosed);
        }
        let writes = self
            .subconnections
            .iter()
            .map(|subconnection| subconnection.write(data.clone()));
        for result in join_all(writes).await {
            result?;
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for subconnection in &self.subconnections {
            subconnection.close().await;
        }
    }

    async fn next_event(&self) -> ConnectionEvent {
        let event = {
            let mut events = self.events.lock().await;
            events.recv().await
        };
        match event {
            Some(ConnectionEvent::Closed(reason)) => {
                self.closed.store(true, Ordering::SeqCst);
                ConnectionEvent::Closed(reason)
            }
            Some(event) => event,
            None => ConnectionEvent::Closed(CloseReason::Remote),
        }
    }
}

/// Relay connection that can also act as a local endpoint.
///
/// Wired between the upstream connection a routed stream arrived on
/// (`incoming`) and the downstream connection(s) it continues over
/// (`outgoing`). Downstream-bound bytes from `incoming` are piped to
/// `outgoing` verbatim and, when the relay is itself a destination, surfaced
/// to the local endpoint. Upstream-bound bytes from `outgoing` are piped
/// back to `incoming` so destination traffic reaches the connection's
/// source. Local endpoint writes travel upstream, like any other terminal
/// destination's. Close of either side closes the whole fork and fires the
/// release callback exactly once.
pub struct ForkingConnection {
    incoming: Arc<dyn UnderlyingConnection>,
    outgoing: Arc<dyn UnderlyingConnection>,
    local_events: Mutex<mpsc::Receiver<ConnectionEvent>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for ForkingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkingConnection").finish_non_exhaustive()
    }
}

impl ForkingConnection {
    /// Wire `incoming` and `outgoing` into a relay.
    ///
    /// `surface_locally` selects whether downstream data is also delivered
    /// to the local endpoint stream. `on_release` runs once the relay shuts
    /// down, whatever side closed first.
    pub fn new(
        incoming: Arc<dyn UnderlyingConnection>,
        outgoing: Arc<dyn UnderlyingConnection>,
        surface_locally: bool,
        on_release: Box<dyn FnOnce() + Send>,
    ) -> Arc<Self> {
        let (local_tx, local_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let closed = Arc::new(AtomicBool::new(false));

        let relay_incoming = Arc::clone(&incoming);
        let relay_outgoing = Arc::clone(&outgoing);
        let relay_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            let reason = relay_loop(
                &relay_incoming,
                &relay_outgoing,
                surface_locally,
                &local_tx,
            )
            .await;
            relay_closed.store(true, Ordering::SeqCst);
            relay_incoming.close().await;
            relay_outgoing.close().await;
            // Release router retention before the endpoint learns of the
            // close, so observers never see a closed-but-retained fork.
            on_release();
            let _ = local_tx.send(ConnectionEvent::Closed(reason)).await;
        });

        Arc::new(Self {
            incoming,
            outgoing,
            local_events: Mutex::new(local_rx),
            closed,
        })
    }
}

async fn relay_loop(
    incoming: &Arc<dyn UnderlyingConnection>,
    outgoing: &Arc<dyn UnderlyingConnection>,
    surface_locally: bool,
    local_tx: &mpsc::Sender<ConnectionEvent>,
) -> CloseReason {
    loop {
        tokio::select! {
            event = incoming.next_event() => match event {
                ConnectionEvent::Data(data) => {
                    if let Err(error) = outgoing.write(data.clone()).await {
                        debug!("relay write downstream failed: {}", error);
                        return CloseReason::Remote;
                    }
                    if surface_locally
                        && local_tx.send(ConnectionEvent::Data(data)).await.is_err()
                    {
                        return CloseReason::Local;
                    }
                }
                ConnectionEvent::Closed(reason) => return reason,
            },
            event = outgoing.next_event() => match event {
                ConnectionEvent::Data(data) => {
                    if let Err(error) = incoming.write(data).await {
                        debug!("relay write upstream failed: {}", error);
                        return CloseReason::Remote;
                    }
                }
                ConnectionEvent::Closed(reason) => return reason,
            },
        }
    }
}

#[async_trait]
impl UnderlyingConnection for ForkingConnection {
    async fn connect(&self) -> Result<(), MeshError> {
        Ok(())
    }

    async fn write(&self, data: Bytes) -> Result<(), MeshError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::TransportClosed);
        }
        self.incoming.write(data).await
    }

    async fn close(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // The relay task observes the closes and runs the release callback.
        self.incoming.close().await;
        self.outgoing.close().await;
    }

    async fn next_event(&self) -> ConnectionEvent {
        let event = {
            let mut events = self.local_events.lock().await;
            events.recv().await
        };
        event.unwrap_or_else(|| {
            warn!("forking connection event stream dropped");
            ConnectionEvent::Closed(CloseReason::Remote)
        })
    }
}
