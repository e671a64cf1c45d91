//! Transport module interface and the in-process memory transport.
//!
//! Concrete transports (TCP, Bluetooth, Wi-Fi) live outside this crate and
//! plug in through the [`Module`] trait: they advertise and discover peers,
//! report addresses, and hand incoming raw connections to the router. The
//! [`MemoryHub`] here wires routers in one process together over
//! channel-backed byte streams with scriptable link topology; the integration
//! suite runs on it.

use crate::connection::{CloseReason, ConnectionEvent, UnderlyingConnection};
use crate::node::{Address, ConnectionFactory};
use crate::types::{MeshError, PeerId};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Events a transport module reports to the router.
#[derive(Clone)]
pub enum TransportEvent {
    /// A peer became reachable at a new address.
    AddressDiscovered {
        /// The advertising peer.
        peer: PeerId,
        /// The endpoint it was discovered at.
        address: Address,
    },
    /// A previously reported address is gone.
    AddressLost {
        /// The peer the address belonged to.
        peer: PeerId,
        /// Identity of the lost address.
        address_id: u64,
    },
    /// A remote peer opened a raw connection to us.
    IncomingConnection(Arc<dyn UnderlyingConnection>),
}

/// A transport substrate that discovers peers and carries connections.
#[async_trait]
pub trait Module: Send + Sync {
    /// Name of the transport, for logs.
    fn name(&self) -> &str;

    /// Start advertising and discovery, reporting through `events`.
    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), MeshError>;

    /// Stop advertising and discovery.
    async fn stop(&self);
}

const STREAM_QUEUE_DEPTH: usize = 64;

/// One end of an in-process byte-stream pair.
pub struct MemoryConnection {
    peer_tx: mpsc::Sender<ConnectionEvent>,
    self_tx: mpsc::Sender<ConnectionEvent>,
    events: Mutex<mpsc::Receiver<ConnectionEvent>>,
    open: Arc<AtomicBool>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection").finish_non_exhaustive()
    }
}

/// Create a connected pair of in-process byte streams.
///
/// Closing either end closes both directions.
pub fn memory_pair() -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
    let (a_tx, a_rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
    let (b_tx, b_rx) = mpsc::channel(STREAM_QUEUE_DEPTH);
    let open = Arc::new(AtomicBool::new(true));
    let a = Arc::new(MemoryConnection {
        peer_tx: b_tx.clone(),
        self_tx: a_tx.clone(),
        events: Mutex::new(a_rx),
        open: Arc::clone(&open),
    });
    let b = Arc::new(MemoryConnection {
        peer_tx: a_tx,
        self_tx: b_tx,
        events: Mutex::new(b_rx),
        open,
    });
    (a, b)
}

#[async_trait]
impl UnderlyingConnection for MemoryConnection {
    async fn connect(&self) -> Result<(), MeshError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MeshError::TransportClosed)
        }
    }

    async fn write(&self, data: Bytes) -> Result<(), MeshError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(MeshError::TransportClosed);
        }
        self.peer_tx
            .send(ConnectionEvent::Data(data))
            .await
            .map_err(|_| MeshError::TransportClosed)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.peer_tx.try_send(ConnectionEvent::Closed(CloseReason::Remote));
            let _ = self.self_tx.try_send(ConnectionEvent::Closed(CloseReason::Local));
        }
    }

    async fn next_event(&self) -> ConnectionEvent {
        let mut events = self.events.lock().await;
        loop {
            match events.try_recv() {
                Ok(event) => return event,
                Err(mpsc::error::TryRecvError::Empty) => {
                    // Drained past any queued close notification.
                    if !self.open.load(Ordering::SeqCst) {
                        return ConnectionEvent::Closed(CloseReason::Remote);
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return ConnectionEvent::Closed(CloseReason::Remote);
                }
            }
            match events.recv().await {
                Some(event) => return event,
                None => return ConnectionEvent::Closed(CloseReason::Remote),
            }
        }
    }
}

struct LinkRecord {
    low_to_high: u64,
    high_to_low: u64,
}

struct HubInner {
    endpoints: DashMap<PeerId, mpsc::Sender<TransportEvent>>,
    links: SyncMutex<HashMap<(PeerId, PeerId), LinkRecord>>,
}

/// In-process transport hub connecting [`MemoryModule`]s.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                endpoints: DashMap::new(),
                links: SyncMutex::new(HashMap::new()),
            }),
        }
    }

    /// Create the transport module for one peer.
    pub fn module(&self, local: PeerId) -> MemoryModule {
        MemoryModule {
            inner: Arc::clone(&self.inner),
            local,
        }
    }

    /// Make `a` and `b` mutually discoverable at the given link cost.
    ///
    /// Both modules must be started; each receives an `AddressDiscovered`
    /// event for the other end.
    pub async fn link(&self, a: PeerId, b: PeerId, cost: u32) {
        let address_for_a = Address::new(
            cost,
            Arc::new(MemoryFactory {
                inner: Arc::clone(&self.inner),
                target: b,
            }),
        );
        let address_for_b = Address::new(
            cost,
            Arc::new(MemoryFactory {
                inner: Arc::clone(&self.inner),
                target: a,
            }),
        );

        {
            let mut links = self.inner.links.lock();
            let (low, high) = ordered(a, b);
            let record = if a <= b {
                LinkRecord {
                    low_to_high: address_for_a.id(),
                    high_to_low: address_for_b.id(),
                }
            } else {
                LinkRecord {
                    low_to_high: address_for_b.id(),
                    high_to_low: address_for_a.id(),
                }
            };
            links.insert((low, high), record);
        }

        self.deliver(
            a,
            TransportEvent::AddressDiscovered {
                peer: b,
                address: address_for_a,
            },
        )
        .await;
        self.deliver(
            b,
            TransportEvent::AddressDiscovered {
                peer: a,
                address: address_for_b,
            },
        )
        .await;
    }

    /// Tear the link between `a` and `b` down again.
    pub async fn unlink(&self, a: PeerId, b: PeerId) {
        let record = {
            let mut links = self.inner.links.lock();
            links.remove(&ordered(a, b))
        };
        let Some(record) = record else {
            return;
        };
        let (low, high) = ordered(a, b);
        self.deliver(
            low,
            TransportEvent::AddressLost {
                peer: high,
                address_id: record.low_to_high,
            },
        )
        .await;
        self.deliver(
            high,
            TransportEvent::AddressLost {
                peer: low,
                address_id: record.high_to_low,
            },
        )
        .await;
    }

    async fn deliver(&self, to: PeerId, event: TransportEvent) {
        let sender = self.inner.endpoints.get(&to).map(|entry| entry.value().clone());
        match sender {
            Some(sender) => {
                if sender.send(event).await.is_err() {
                    warn!("memory hub endpoint {} stopped consuming events", to);
                }
            }
            None => debug!("memory hub has no endpoint for {}", to),
        }
    }
}

fn ordered(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

struct MemoryFactory {
    inner: Arc<HubInner>,
    target: PeerId,
}

#[async_trait]
impl ConnectionFactory for MemoryFactory {
    async fn open(&self) -> Result<Arc<dyn UnderlyingConnection>, MeshError> {
        let sender = self
            .inner
            .endpoints
            .get(&self.target)
            .map(|entry| entry.value().clone())
            .ok_or(MeshError::TransportClosed)?;
        let (near, far) = memory_pair();
        sender
            .send(TransportEvent::IncomingConnection(far))
            .await
            .map_err(|_| MeshError::TransportClosed)?;
        Ok(near)
    }
}

/// The per-peer transport module backed by a [`MemoryHub`].
pub struct MemoryModule {
    inner: Arc<HubInner>,
    local: PeerId,
}

#[async_trait]
impl Module for MemoryModule {
    fn name(&self) -> &str {
        "memory"
    }

    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), MeshError> {
        self.inner.endpoints.insert(self.local, events);
        Ok(())
    }

    async fn stop(&self) {
        self.inner.endpoints.remove(&self.local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_carries_data_both_ways() {
        let (a, b) = memory_pair();
        a.write(Bytes::from_static(b"ping")).await.unwrap();
        b.write(Bytes::from_static(b"pong")).await.unwrap();

        match b.next_event().await {
            ConnectionEvent::Data(data) => assert_eq!(data, Bytes::from_static(b"ping")),
            other => panic!("unexpected event {:?}", other),
        }
        match a.next_event().await {
            ConnectionEvent::Data(data) => assert_eq!(data, Bytes::from_static(b"pong")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_is_seen_by_both_ends() {
        let (a, b) = memory_pair();
        a.close().await;

        assert!(matches!(a.next_event().await, ConnectionEvent::Closed(_)));
        assert!(matches!(b.next_event().await, ConnectionEvent::Closed(_)));
        assert!(matches!(
            b.write(Bytes::from_static(b"late")).await,
            Err(MeshError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn hub_link_announces_addresses_to_both_modules() {
        let hub = MemoryHub::new();
        let a = PeerId::from_bytes([1; 16]);
        let b = PeerId::from_bytes([2; 16]);
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);
        hub.module(a).start(a_tx).await.unwrap();
        hub.module(b).start(b_tx).await.unwrap();

        hub.link(a, b, 3).await;

        match a_rx.recv().await.unwrap() {
            TransportEvent::AddressDiscovered { peer, address } => {
                assert_eq!(peer, b);
                assert_eq!(address.cost(), 3);
            }
            _ => panic!("expected address discovery"),
        }
        match b_rx.recv().await.unwrap() {
            TransportEvent::AddressDiscovered { peer, .. } => assert_eq!(peer, a),
            _ => panic!("expected address discovery"),
        }
    }

    #[tokio::test]
    async fn hub_unlink_reports_the_same_address_ids() {
        let hub = MemoryHub::new();
        let a = PeerId::from_bytes([1; 16]);
        let b = PeerId::from_bytes([2; 16]);
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, _b_rx) = mpsc::channel(8);
        hub.module(a).start(a_tx).await.unwrap();
        hub.module(b).start(b_tx).await.unwrap();

        hub.link(a, b, 1).await;
        let discovered_id = match a_rx.recv().await.unwrap() {
            TransportEvent::AddressDiscovered { address, .. } => address.id(),
            _ => panic!("expected address discovery"),
        };

        hub.unlink(a, b).await;
        match a_rx.recv().await.unwrap() {
            TransportEvent::AddressLost { peer, address_id } => {
                assert_eq!(peer, b);
                assert_eq!(address_id, discovered_id);
            }
            _ => panic!("expected address loss"),
        }
    }

    #[tokio::test]
    async fn factory_delivers_incoming_connection_to_target() {
        let hub = MemoryHub::new();
        let a = PeerId::from_bytes([1; 16]);
        let b = PeerId::from_bytes([2; 16]);
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);
        hub.module(a).start(a_tx).await.unwrap();
        hub.module(b).start(b_tx).await.unwrap();
        hub.link(a, b, 1).await;

        let address = match a_rx.recv().await.unwrap() {
            TransportEvent::AddressDiscovered { address, .. } => address,
            _ => panic!("expected address discovery"),
        };
        let near = address.open_connection().await.unwrap();
        near.write(Bytes::from_static(b"hello")).await.unwrap();

        let far = loop {
            match b_rx.recv().await.unwrap() {
                TransportEvent::IncomingConnection(connection) => break connection,
                _ => continue,
            }
        };
        match far.next_event().await {
            ConnectionEvent::Data(data) => assert_eq!(data, Bytes::from_static(b"hello")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn open_fails_when_target_module_is_stopped() {
        let hub = MemoryHub::new();
        let a = PeerId::from_bytes([1; 16]);
        let b = PeerId::from_bytes([2; 16]);
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, _b_rx) = mpsc::channel(8);
        hub.module(a).start(a_tx).await.unwrap();
        let b_module = hub.module(b);
        b_module.start(b_tx).await.unwrap();
        hub.link(a, b, 1).await;

        let address = match a_rx.recv().await.unwrap() {
            TransportEvent::AddressDiscovered { address, .. } => address,
            _ => panic!("expected address discovery"),
        };
        b_module.stop().await;

        assert!(matches!(
            address.open_connection().await,
            Err(MeshError::TransportClosed)
        ));
    }
}
