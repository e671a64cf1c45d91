//! End-to-end scenarios over the in-memory transport.

use async_trait::async_trait;
use bytes::Bytes;
use meshlink::{
    Address, ConnectionEvent, ConnectionFactory, MemoryHub, MeshConfig, MeshError, Node, PeerId,
    Router, RouterDelegate, UnderlyingConnection,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelegateEvent {
    Found(PeerId),
    Lost(PeerId),
    Improved(PeerId),
}

#[derive(Default)]
struct TestDelegate {
    events: Mutex<Vec<DelegateEvent>>,
    connections: Mutex<Vec<(PeerId, Arc<dyn UnderlyingConnection>)>>,
}

impl TestDelegate {
    fn found_count(&self, peer: PeerId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| **event == DelegateEvent::Found(peer))
            .count()
    }

    fn lost_count(&self, peer: PeerId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| **event == DelegateEvent::Lost(peer))
            .count()
    }

    fn connection_from(&self, peer: PeerId) -> Option<Arc<dyn UnderlyingConnection>> {
        self.connections
            .lock()
            .iter()
            .find(|(source, _)| *source == peer)
            .map(|(_, connection)| Arc::clone(connection))
    }

    fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl RouterDelegate for TestDelegate {
    async fn did_find_node(&self, node: Arc<Node>) {
        self.events.lock().push(DelegateEvent::Found(node.id()));
    }

    async fn did_lose_node(&self, node: Arc<Node>) {
        self.events.lock().push(DelegateEvent::Lost(node.id()));
    }

    async fn did_improve_route(&self, node: Arc<Node>) {
        self.events.lock().push(DelegateEvent::Improved(node.id()));
    }

    async fn handle_connection(
        &self,
        source: Arc<Node>,
        connection: Arc<dyn UnderlyingConnection>,
    ) {
        self.connections.lock().push((source.id(), connection));
    }
}

struct Peer {
    id: PeerId,
    router: Arc<Router>,
    delegate: Arc<TestDelegate>,
}

fn test_config() -> MeshConfig {
    MeshConfig {
        broadcast_regular_delay: Duration::from_millis(200),
        broadcast_short_delay: Duration::from_millis(40),
        handshake_timeout: Duration::from_secs(2),
        routing_retry_limit: 5,
    }
}

async fn spawn_peer(hub: &MemoryHub, byte: u8) -> Peer {
    let id = PeerId::from_bytes([byte; 16]);
    let delegate = Arc::new(TestDelegate::default());
    let router = Router::new(id, test_config(), delegate.clone());
    router
        .add_module(Arc::new(hub.module(id)))
        .await
        .expect("memory module starts");
    Peer {
        id,
        router,
        delegate,
    }
}

async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn route_of(peer: &Peer, target: PeerId) -> Option<(PeerId, u32)> {
    peer.router
        .node(target)
        .and_then(|node| node.reachable_via())
        .map(|route| (route.next_hop, route.cost))
}

async fn expect_data(connection: &Arc<dyn UnderlyingConnection>) -> Bytes {
    match timeout(Duration::from_secs(2), connection.next_event())
        .await
        .expect("connection event before timeout")
    {
        ConnectionEvent::Data(data) => data,
        other => panic!("expected data, got {:?}", other),
    }
}

async fn stop_all(peers: &[&Peer]) {
    for peer in peers {
        peer.router.stop().await;
    }
}

#[tokio::test]
async fn relayed_multicast_across_a_line() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, 1).await;
    let b = spawn_peer(&hub, 2).await;
    let c = spawn_peer(&hub, 3).await;
    hub.link(a.id, b.id, 1).await;
    hub.link(b.id, c.id, 1).await;

    assert!(
        wait_until(Duration::from_secs(5), || route_of(&a, c.id).is_some()).await,
        "A never learned a route to C"
    );
    assert_eq!(route_of(&a, c.id), Some((b.id, 2)));

    let connection = a
        .router
        .establish_multicast([c.id].into_iter().collect())
        .await
        .expect("relayed multicast establishes");

    assert!(
        wait_until(Duration::from_secs(2), || c
            .delegate
            .connection_from(a.id)
            .is_some())
        .await,
        "C never saw the inbound connection"
    );
    // B relayed without becoming an endpoint.
    assert_eq!(b.delegate.connection_count(), 0);
    assert_eq!(b.router.stats().forking_connections, 1);
    assert_eq!(b.router.stats().pending_forwarded, 0);

    connection
        .write(Bytes::from_static(b"hello"))
        .await
        .unwrap();
    let c_connection = c.delegate.connection_from(a.id).unwrap();
    assert_eq!(expect_data(&c_connection).await, Bytes::from_static(b"hello"));

    // Replies travel back upstream through the relay.
    c_connection
        .write(Bytes::from_static(b"world"))
        .await
        .unwrap();
    assert_eq!(expect_data(&connection).await, Bytes::from_static(b"world"));

    stop_all(&[&a, &b, &c]).await;
}

#[tokio::test]
async fn multicast_to_relay_and_leaf_delivers_to_both() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, 1).await;
    let b = spawn_peer(&hub, 2).await;
    let c = spawn_peer(&hub, 3).await;
    hub.link(a.id, b.id, 1).await;
    hub.link(b.id, c.id, 1).await;

    assert!(wait_until(Duration::from_secs(5), || route_of(&a, c.id).is_some()).await);

    let destinations: BTreeSet<PeerId> = [b.id, c.id].into_iter().collect();
    let connection = a
        .router
        .establish_multicast(destinations)
        .await
        .expect("multicast through relay endpoint establishes");

    assert!(
        wait_until(Duration::from_secs(2), || {
            b.delegate.connection_from(a.id).is_some()
                && c.delegate.connection_from(a.id).is_some()
        })
        .await,
        "both destinations must receive the connection"
    );

    let payload = Bytes::from(vec![0x5a; 100]);
    connection.write(payload.clone()).await.unwrap();
    let b_connection = b.delegate.connection_from(a.id).unwrap();
    let c_connection = c.delegate.connection_from(a.id).unwrap();
    assert_eq!(expect_data(&b_connection).await, payload);
    assert_eq!(expect_data(&c_connection).await, payload);

    stop_all(&[&a, &b, &c]).await;
}

#[tokio::test]
async fn multicast_to_two_neighbors() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, 1).await;
    let b = spawn_peer(&hub, 2).await;
    let c = spawn_peer(&hub, 3).await;
    hub.link(a.id, b.id, 1).await;
    hub.link(a.id, c.id, 1).await;

    assert!(
        wait_until(Duration::from_secs(5), || {
            route_of(&a, b.id).is_some() && route_of(&a, c.id).is_some()
        })
        .await
    );

    let destinations: BTreeSet<PeerId> = [b.id, c.id].into_iter().collect();
    let connection = a
        .router
        .establish_multicast(destinations)
        .await
        .expect("two-neighbor multicast establishes");

    assert!(
        wait_until(Duration::from_secs(2), || {
            b.delegate.connection_from(a.id).is_some()
                && c.delegate.connection_from(a.id).is_some()
        })
        .await
    );

    let payload = Bytes::from(vec![0xa5; 100]);
    connection.write(payload.clone()).await.unwrap();
    let b_connection = b.delegate.connection_from(a.id).unwrap();
    let c_connection = c.delegate.connection_from(a.id).unwrap();
    assert_eq!(expect_data(&b_connection).await, payload);
    assert_eq!(expect_data(&c_connection).await, payload);

    stop_all(&[&a, &b, &c]).await;
}

#[tokio::test]
async fn ring_converges_and_reroutes_around_a_cut() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, 1).await;
    let b = spawn_peer(&hub, 2).await;
    let c = spawn_peer(&hub, 3).await;
    let d = spawn_peer(&hub, 4).await;
    hub.link(a.id, b.id, 1).await;
    hub.link(b.id, c.id, 1).await;
    hub.link(c.id, d.id, 1).await;
    hub.link(d.id, a.id, 1).await;

    // Everyone learns everyone; A's equal-cost route to C breaks toward the
    // lexicographically smaller neighbor B.
    for peer in [&a, &b, &c, &d] {
        let others: Vec<PeerId> = [a.id, b.id, c.id, d.id]
            .into_iter()
            .filter(|id| *id != peer.id)
            .collect();
        assert!(
            wait_until(Duration::from_secs(5), || {
                others.iter().all(|id| route_of(peer, *id).is_some())
            })
            .await,
            "ring did not converge"
        );
    }
    assert_eq!(route_of(&a, c.id), Some((b.id, 2)));

    hub.unlink(b.id, c.id).await;

    assert!(
        wait_until(Duration::from_secs(5), || route_of(&a, c.id)
            == Some((d.id, 2)))
        .await,
        "A did not reroute to C via D"
    );
    // C stayed reachable the whole time: found exactly once, never lost.
    assert_eq!(a.delegate.found_count(c.id), 1);
    assert_eq!(a.delegate.lost_count(c.id), 0);

    stop_all(&[&a, &b, &c, &d]).await;
}

#[tokio::test]
async fn neighbor_loss_propagates_through_the_mesh() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, 1).await;
    let b = spawn_peer(&hub, 2).await;
    let c = spawn_peer(&hub, 3).await;
    hub.link(a.id, b.id, 1).await;
    hub.link(b.id, c.id, 1).await;

    assert!(wait_until(Duration::from_secs(5), || route_of(&a, c.id).is_some()).await);

    hub.unlink(b.id, c.id).await;

    assert!(
        wait_until(Duration::from_secs(5), || route_of(&a, c.id).is_none()).await,
        "A should lose its route to C"
    );
    assert_eq!(a.delegate.lost_count(c.id), 1);

    stop_all(&[&a, &b, &c]).await;
}

struct FailingFactory;

#[async_trait]
impl ConnectionFactory for FailingFactory {
    async fn open(&self) -> Result<Arc<dyn UnderlyingConnection>, MeshError> {
        Err(MeshError::TransportClosed)
    }
}

#[tokio::test]
async fn partial_multicast_failure_tears_everything_down() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, 1).await;
    let b = spawn_peer(&hub, 2).await;
    hub.link(a.id, b.id, 1).await;
    assert!(wait_until(Duration::from_secs(5), || route_of(&a, b.id).is_some()).await);

    // C is a neighbor on paper, but every connection attempt fails.
    let c_id = PeerId::from_bytes([3; 16]);
    a.router
        .add_address(c_id, Address::new(1, Arc::new(FailingFactory)))
        .await;
    assert!(wait_until(Duration::from_secs(1), || route_of(&a, c_id).is_some()).await);

    let destinations: BTreeSet<PeerId> = [b.id, c_id].into_iter().collect();
    let error = a
        .router
        .establish_multicast(destinations)
        .await
        .expect_err("multicast must fail atomically");
    assert!(matches!(error, MeshError::PartialMulticastFailure));

    // Nothing is left retained, and B never saw a connection.
    let stats = a.router.stats();
    assert_eq!(stats.forking_connections, 0);
    assert_eq!(stats.pending_forwarded, 0);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(b.delegate.connection_count(), 0);

    stop_all(&[&a, &b]).await;
}

#[tokio::test]
async fn multicast_to_unknown_peer_fails_with_no_route() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, 1).await;
    let stranger = PeerId::from_bytes([9; 16]);

    let error = a
        .router
        .establish_multicast([stranger].into_iter().collect())
        .await
        .expect_err("no route to a peer nobody advertised");
    assert!(matches!(error, MeshError::NoRoute(missing) if missing == vec![stranger]));

    stop_all(&[&a]).await;
}
