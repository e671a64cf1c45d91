//! Mesh router: neighbor lifecycle, link-state dissemination, and the
//! connection-establishment protocol.
//!
//! The router owns all per-peer [`Node`] state, feeds neighbor observations
//! and received link-state packets into the routing table, broadcasts its own
//! link state through the flooding manager, and drives the multi-party
//! handshakes that turn point-to-point transport connections into direct,
//! routed, and multicast connections.

use crate::connection::{
    ConnectionEvent, ForkingConnection, MulticastConnection, UnderlyingConnection,
};
use crate::executor::RepeatedExecutor;
use crate::flooding::{FloodHandler, FloodingPacketManager, LinkInstall, LinkRegistry};
use crate::message::{ConnectionPurpose, FrameDecoder, HopTree, Packet, TAG_LINK_STATE};
use crate::node::{Address, Node};
use crate::routing::{LinkStateRoutingTable, Route, RoutingTableChange};
use crate::transport::{Module, TransportEvent};
use crate::types::{MeshError, PeerId};
use crate::MeshConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callbacks the router raises toward the layer above it.
#[async_trait]
pub trait RouterDelegate: Send + Sync {
    /// A previously unreachable peer became reachable.
    async fn did_find_node(&self, node: Arc<Node>);

    /// A peer became unreachable.
    async fn did_lose_node(&self, node: Arc<Node>);

    /// The route to a peer got strictly cheaper.
    async fn did_improve_route(&self, node: Arc<Node>);

    /// An inbound routed or multicast connection finished its handshake with
    /// the local endpoint.
    async fn handle_connection(&self, source: Arc<Node>, connection: Arc<dyn UnderlyingConnection>);
}

/// Counters describing the router's current state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Peers with at least one known address.
    pub neighbors: usize,
    /// Peers the routing table currently has a route to.
    pub reachable_peers: usize,
    /// Relay connections retained until their close callback fires.
    pub forking_connections: usize,
    /// Incoming connections retained while their outgoing hops come up.
    pub pending_forwarded: usize,
}

struct ModuleEntry {
    module: Arc<dyn Module>,
    events_task: JoinHandle<()>,
}

/// The routing and connection-establishment core of one mesh peer.
pub struct Router {
    local_id: PeerId,
    config: MeshConfig,
    delegate: Arc<dyn RouterDelegate>,
    /// Back-reference handed to spawned tasks and close callbacks; breaks
    /// the ownership cycle between the router and its connections.
    self_ref: Weak<Router>,
    nodes: RwLock<HashMap<PeerId, Arc<Node>>>,
    routing_table: Mutex<LinkStateRoutingTable>,
    links: Arc<LinkRegistry>,
    flooding: Arc<FloodingPacketManager>,
    forking_connections: Mutex<HashMap<u64, Arc<ForkingConnection>>>,
    pending_forwarded: Mutex<Vec<Arc<dyn UnderlyingConnection>>>,
    broadcast: Mutex<Option<RepeatedExecutor>>,
    modules: Mutex<Vec<ModuleEntry>>,
    next_fork_id: AtomicU64,
    stopped: AtomicBool,
}

impl Router {
    /// Create a router for `local_id` and start its broadcast cadence.
    ///
    /// Must run inside a tokio runtime.
    pub fn new(
        local_id: PeerId,
        config: MeshConfig,
        delegate: Arc<dyn RouterDelegate>,
    ) -> Arc<Self> {
        let links = Arc::new(LinkRegistry::new());
        let flooding = Arc::new(FloodingPacketManager::new(local_id, Arc::clone(&links)));
        let regular_delay = config.broadcast_regular_delay;
        let short_delay = config.broadcast_short_delay;

        let router = Arc::new_cyclic(|self_ref: &Weak<Router>| Self {
            local_id,
            config,
            delegate,
            self_ref: self_ref.clone(),
            nodes: RwLock::new(HashMap::new()),
            routing_table: Mutex::new(LinkStateRoutingTable::new(local_id)),
            links,
            flooding,
            forking_connections: Mutex::new(HashMap::new()),
            pending_forwarded: Mutex::new(Vec::new()),
            broadcast: Mutex::new(None),
            modules: Mutex::new(Vec::new()),
            next_fork_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        });

        router.flooding.register_handler(
            TAG_LINK_STATE,
            Arc::new(LinkStateFloodHandler {
                router: Arc::downgrade(&router),
            }),
        );

        let weak = Arc::downgrade(&router);
        let executor = RepeatedExecutor::spawn(
            regular_delay,
            short_delay,
            move || -> BoxFuture<'static, ()> {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(router) = weak.upgrade() {
                        router.broadcast_link_state().await;
                    }
                })
            },
        );
        *router.broadcast.lock() = Some(executor);

        info!("router {} up", local_id);
        router
    }

    /// The local peer's identity.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_id
    }

    /// The node for `peer`, creating it on first mention.
    pub fn provide_node(&self, peer: PeerId) -> Arc<Node> {
        if let Some(node) = self.nodes.read().get(&peer) {
            return Arc::clone(node);
        }
        let mut nodes = self.nodes.write();
        Arc::clone(nodes.entry(peer).or_insert_with(|| Node::new(peer)))
    }

    /// The node for `peer`, if it has been mentioned before.
    pub fn node(&self, peer: PeerId) -> Option<Arc<Node>> {
        self.nodes.read().get(&peer).cloned()
    }

    /// All current neighbors (peers with at least one address).
    pub fn neighbors(&self) -> Vec<Arc<Node>> {
        self.nodes
            .read()
            .values()
            .filter(|node| node.is_neighbor())
            .cloned()
            .collect()
    }

    /// Current state counters.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            neighbors: self.neighbors().len(),
            reachable_peers: self.routing_table.lock().routes().len(),
            forking_connections: self.forking_connections.lock().len(),
            pending_forwarded: self.pending_forwarded.lock().len(),
        }
    }

    /// Attach a transport module and start consuming its events.
    pub async fn add_module(&self, module: Arc<dyn Module>) -> Result<(), MeshError> {
        let (event_tx, mut event_rx) = mpsc::channel(64);
        module.start(event_tx).await?;
        info!("transport module {} started", module.name());

        let router = self.self_ref.clone();
        let events_task = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let Some(router) = router.upgrade() else { break };
                router.handle_transport_event(event).await;
            }
        });
        self.modules.lock().push(ModuleEntry {
            module,
            events_task,
        });
        Ok(())
    }

    /// Stop the broadcast cadence, transport modules, and every retained
    /// connection.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping router {}", self.local_id);
        if let Some(executor) = self.broadcast.lock().take() {
            executor.stop();
        }
        let modules: Vec<ModuleEntry> = self.modules.lock().drain(..).collect();
        for entry in modules {
            entry.module.stop().await;
            entry.events_task.abort();
        }
        for connection in self.links.drain() {
            connection.close().await;
        }
        let forks: Vec<Arc<ForkingConnection>> = {
            let mut forking = self.forking_connections.lock();
            forking.drain().map(|(_, fork)| fork).collect()
        };
        for fork in forks {
            fork.close().await;
        }
        let pending: Vec<Arc<dyn UnderlyingConnection>> =
            self.pending_forwarded.lock().drain(..).collect();
        for connection in pending {
            connection.close().await;
        }
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::AddressDiscovered { peer, address } => {
                self.add_address(peer, address).await;
            }
            TransportEvent::AddressLost { peer, address_id } => {
                self.remove_address(peer, address_id).await;
            }
            TransportEvent::IncomingConnection(connection) => {
                let Some(router) = self.self_ref.upgrade() else { return };
                tokio::spawn(async move {
                    router.handle_direct(connection).await;
                });
            }
        }
    }

    /// Record a discovered address for `peer`.
    pub async fn add_address(&self, peer: PeerId, address: Address) {
        if peer == self.local_id {
            return;
        }
        let node = self.provide_node(peer);
        let change = node.add_address(address);
        if change.became_neighbor {
            info!("neighbor {} reachable", peer);
        }
        if let Some(cost) = change.best_cost_changed {
            let routing_change = self.routing_table.lock().neighbor_update(peer, cost);
            self.apply_routing_change(routing_change).await;
            self.trigger_broadcast();
        }
        if change.became_neighbor && self.links.get(peer).is_none() {
            let Some(router) = self.self_ref.upgrade() else { return };
            tokio::spawn(async move {
                router.establish_routing_connection(node).await;
            });
        }
    }

    /// Record the loss of an address previously reported for `peer`.
    pub async fn remove_address(&self, peer: PeerId, address_id: u64) {
        let Some(node) = self.node(peer) else { return };
        let change = node.remove_address(address_id);
        if change.lost_neighbor {
            self.handle_neighbor_lost(&node).await;
        } else if let Some(cost) = change.best_cost_changed {
            let routing_change = self.routing_table.lock().neighbor_update(peer, cost);
            self.apply_routing_change(routing_change).await;
            self.trigger_broadcast();
        }
    }

    async fn handle_neighbor_lost(&self, node: &Arc<Node>) {
        info!("neighbor {} lost", node.id());
        node.clear_addresses();
        if let Some(connection) = node.take_routing_connection() {
            self.links.remove(node.id(), &connection);
            connection.close().await;
        }
        let change = self.routing_table.lock().neighbor_removal(node.id());
        self.apply_routing_change(change).await;
        self.trigger_broadcast();
    }

    fn trigger_broadcast(&self) {
        if let Some(executor) = self.broadcast.lock().as_ref() {
            executor.trigger_short();
        }
    }

    async fn broadcast_link_state(&self) {
        let neighbors = self.routing_table.lock().link_state_information();
        debug!(
            "{} broadcasting link state with {} neighbors",
            self.local_id,
            neighbors.len()
        );
        self.flooding
            .flood(Packet::LinkState {
                peer_id: self.local_id,
                neighbors,
            })
            .await;
    }

    async fn handle_link_state(&self, origin: PeerId, neighbors: Vec<(PeerId, u32)>) {
        if origin == self.local_id {
            return;
        }
        self.provide_node(origin);
        let change = self.routing_table.lock().link_state_update(origin, neighbors);
        self.apply_routing_change(change).await;
    }

    /// Push a reachability delta into the affected nodes and the delegate.
    async fn apply_routing_change(&self, change: RoutingTableChange) {
        for (peer, route) in change.now_reachable {
            let node = self.provide_node(peer);
            node.set_reachable_via(Some(route));
            info!(
                "{} found route to {} via {} (cost {})",
                self.local_id, peer, route.next_hop, route.cost
            );
            self.delegate.did_find_node(node).await;
        }
        for peer in change.now_unreachable {
            let node = self.provide_node(peer);
            node.set_reachable_via(None);
            info!("{} lost route to {}", self.local_id, peer);
            self.delegate.did_lose_node(node).await;
        }
        for update in change.route_changed {
            let node = self.provide_node(update.peer);
            node.set_reachable_via(Some(Route {
                next_hop: update.next_hop,
                cost: update.new_cost,
            }));
            if update.new_cost < update.old_cost {
                debug!(
                    "route to {} improved: {} -> {}",
                    update.peer, update.old_cost, update.new_cost
                );
                self.delegate.did_improve_route(node).await;
            }
        }
    }

    // --- routing metadata connections -----------------------------------

    /// Open the long-lived flooding link to a neighbor, retrying with
    /// exponential backoff. Gives the neighbor up after the configured
    /// number of attempts.
    async fn establish_routing_connection(self: Arc<Self>, node: Arc<Node>) {
        let mut delay = self.config.broadcast_short_delay;
        for attempt in 1..=self.config.routing_retry_limit {
            if self.stopped.load(Ordering::SeqCst) || !node.is_neighbor() {
                return;
            }
            if self.links.get(node.id()).is_some() {
                return;
            }
            match self
                .establish_direct(&node, ConnectionPurpose::RoutingConnection)
                .await
            {
                Ok(connection) => {
                    self.install_routing_connection(
                        node.id(),
                        connection,
                        self.local_id,
                        FrameDecoder::new(),
                    );
                    return;
                }
                Err(error) => {
                    debug!(
                        "routing connection to {} failed (attempt {}): {}",
                        node.id(),
                        attempt,
                        error
                    );
                }
            }
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
            tokio::time::sleep(delay + jitter).await;
            delay = (delay * 2).min(self.config.broadcast_regular_delay);
        }
        warn!(
            "giving up on routing connection to {} after {} attempts",
            node.id(),
            self.config.routing_retry_limit
        );
        self.handle_neighbor_lost(&node).await;
    }

    fn install_routing_connection(
        &self,
        peer: PeerId,
        connection: Arc<dyn UnderlyingConnection>,
        initiator: PeerId,
        decoder: FrameDecoder,
    ) {
        match self.links.install(peer, Arc::clone(&connection), initiator) {
            LinkInstall::Installed { replaced } => {
                let node = self.provide_node(peer);
                node.set_routing_connection(Arc::clone(&connection));
                if let Some(old) = replaced {
                    tokio::spawn(async move {
                        old.close().await;
                    });
                }
                debug!("routing connection to {} up", peer);
                let Some(router) = self.self_ref.upgrade() else { return };
                tokio::spawn(async move {
                    router.routing_pump(peer, connection, decoder).await;
                });
            }
            LinkInstall::Rejected(connection) => {
                debug!("dropping duplicate routing connection to {}", peer);
                tokio::spawn(async move {
                    connection.close().await;
                });
            }
        }
    }

    /// Reads flooding envelopes off a routing link until it closes, then
    /// re-establishes it if the peer is still a neighbor.
    async fn routing_pump(
        self: Arc<Self>,
        peer: PeerId,
        connection: Arc<dyn UnderlyingConnection>,
        mut decoder: FrameDecoder,
    ) {
        loop {
            match connection.next_event().await {
                ConnectionEvent::Data(data) => {
                    decoder.extend(&data);
                    while let Some(frame) = decoder.next_frame() {
                        match Packet::decode(&frame) {
                            Ok(Packet::FloodingEnvelope {
                                origin,
                                sequence,
                                inner,
                            }) => {
                                self.flooding
                                    .handle_envelope(peer, origin, sequence, *inner)
                                    .await;
                            }
                            Ok(other) => debug!(
                                "unexpected packet tag {:#04x} on routing link from {}",
                                other.tag(),
                                peer
                            ),
                            // An undecodable packet is dropped; it must not
                            // poison the routing table.
                            Err(error) => {
                                warn!("bad packet on routing link from {}: {}", peer, error);
                            }
                        }
                    }
                }
                ConnectionEvent::Closed(_) => break,
            }
        }

        if !self.links.remove(peer, &connection) {
            // A newer link already replaced this one.
            return;
        }
        if let Some(node) = self.node(peer) {
            node.clear_routing_connection(&connection);
            if !self.stopped.load(Ordering::SeqCst) && node.is_neighbor() {
                debug!("routing connection to {} dropped, re-establishing", peer);
                let router = Arc::clone(&self);
                tokio::spawn(async move {
                    router.establish_routing_connection(node).await;
                });
            }
        }
    }

    // --- connection establishment ---------------------------------------

    /// Open a direct connection to `node` and perform the link handshake.
    pub async fn establish_direct(
        &self,
        node: &Arc<Node>,
        purpose: ConnectionPurpose,
    ) -> Result<Arc<dyn UnderlyingConnection>, MeshError> {
        let address = node.best_address().ok_or(MeshError::NoAddress(node.id()))?;
        let connection = address.open_connection().await?;
        connection.connect().await?;
        let handshake = Packet::LinkHandshake {
            peer_id: self.local_id,
            purpose,
        };
        let frame = handshake
            .to_frame()
            .map_err(|error| MeshError::HandshakeFailure(error.to_string()))?;
        if let Err(error) = connection.write(frame).await {
            connection.close().await;
            return Err(error);
        }
        Ok(connection)
    }

    /// Establish a connection to every destination at once.
    ///
    /// Consults the routing table for a next-hop tree, opens and handshakes
    /// the hop connections, and waits for every destination's confirmation.
    /// All-or-nothing: on any failure every partial connection is closed.
    pub async fn establish_multicast(
        &self,
        destinations: BTreeSet<PeerId>,
    ) -> Result<Arc<dyn UnderlyingConnection>, MeshError> {
        let tree = self.routing_table.lock().hop_tree(&destinations)?;
        debug!("{} establishing multicast to {:?}", self.local_id, destinations);

        let destination_list: Vec<PeerId> = destinations.iter().copied().collect();
        let mut subconnections: Vec<Arc<dyn UnderlyingConnection>> =
            Vec::with_capacity(tree.children.len());
        for child in &tree.children {
            match self
                .establish_hop(self.local_id, &destination_list, child)
                .await
            {
                Ok(connection) => subconnections.push(connection),
                Err(error) => {
                    warn!(
                        "multicast to {:?} failed opening hop to {}: {}",
                        destinations, child.peer, error
                    );
                    for connection in &subconnections {
                        connection.close().await;
                    }
                    return Err(MeshError::PartialMulticastFailure);
                }
            }
        }
        // Endpoint confirmation: every destination confirms over the
        // subconnection its subtree hangs off. The subconnections are
        // independent byte streams, so each one gets its own frame decoder;
        // splicing them into one stream could cut a frame in half.
        for (child, subconnection) in tree.children.iter().zip(&subconnections) {
            let expected: BTreeSet<PeerId> = child
                .peers()
                .into_iter()
                .filter(|peer| destinations.contains(peer))
                .collect();
            let mut decoder = FrameDecoder::new();
            let mut confirmed: BTreeSet<PeerId> = BTreeSet::new();
            while confirmed.len() < expected.len() {
                let frame = match self.read_frame(subconnection, &mut decoder).await {
                    Ok(frame) => frame,
                    Err(error) => {
                        warn!(
                            "multicast to {:?} failed awaiting confirmations via {}: {}",
                            destinations, child.peer, error
                        );
                        for connection in &subconnections {
                            connection.close().await;
                        }
                        return Err(MeshError::PartialMulticastFailure);
                    }
                };
                match Packet::decode(&frame) {
                    Ok(Packet::EstablishedConfirmation { source }) => {
                        if expected.contains(&source) {
                            confirmed.insert(source);
                        }
                    }
                    Ok(other) => {
                        for connection in &subconnections {
                            connection.close().await;
                        }
                        return Err(MeshError::HandshakeFailure(format!(
                            "expected establishment confirmation, got tag {:#04x}",
                            other.tag()
                        )));
                    }
                    Err(error) => {
                        for connection in &subconnections {
                            connection.close().await;
                        }
                        return Err(MeshError::HandshakeFailure(error.to_string()));
                    }
                }
            }
        }

        let connection: Arc<dyn UnderlyingConnection> = if subconnections.len() > 1 {
            MulticastConnection::new(subconnections)
        } else {
            match subconnections.pop() {
                Some(connection) => connection,
                None => return Err(MeshError::NoRoute(Vec::new())),
            }
        };
        let confirmation = Packet::EstablishedConfirmation {
            source: self.local_id,
        };
        let frame = confirmation
            .to_frame()
            .map_err(|error| MeshError::HandshakeFailure(error.to_string()))?;
        if let Err(error) = connection.write(frame).await {
            connection.close().await;
            return Err(error);
        }
        info!(
            "{} multicast connection to {:?} established",
            self.local_id, destinations
        );
        Ok(connection)
    }

    /// Open one edge of a routed path and hand over the hop handshake.
    async fn establish_hop(
        &self,
        source: PeerId,
        destinations: &[PeerId],
        subtree: &HopTree,
    ) -> Result<Arc<dyn UnderlyingConnection>, MeshError> {
        let node = self.provide_node(subtree.peer);
        let connection = self
            .establish_direct(&node, ConnectionPurpose::RoutedConnection)
            .await?;
        let handshake = Packet::MulticastHandshake {
            source,
            destinations: destinations.to_vec(),
            next_hop_subtree: subtree.clone(),
        };
        let frame = handshake
            .to_frame()
            .map_err(|error| MeshError::HandshakeFailure(error.to_string()))?;
        if let Err(error) = connection.write(frame).await {
            connection.close().await;
            return Err(error);
        }
        Ok(connection)
    }

    /// Handle an incoming raw connection from a transport.
    pub async fn handle_direct(self: Arc<Self>, connection: Arc<dyn UnderlyingConnection>) {
        let mut decoder = FrameDecoder::new();
        let frame = match self.read_frame(&connection, &mut decoder).await {
            Ok(frame) => frame,
            Err(error) => {
                debug!("incoming connection dropped before handshake: {}", error);
                connection.close().await;
                return;
            }
        };
        match Packet::decode(&frame) {
            Ok(Packet::LinkHandshake {
                peer_id,
                purpose: ConnectionPurpose::RoutingConnection,
            }) => {
                debug!("routing connection accepted from {}", peer_id);
                self.install_routing_connection(peer_id, connection, peer_id, decoder);
            }
            Ok(Packet::LinkHandshake {
                peer_id,
                purpose: ConnectionPurpose::RoutedConnection,
            }) => {
                self.handle_hop(peer_id, connection, decoder).await;
            }
            Ok(other) => {
                warn!("expected link handshake, got tag {:#04x}", other.tag());
                connection.close().await;
            }
            Err(error) => {
                warn!("malformed link handshake: {}", error);
                connection.close().await;
            }
        }
    }

    /// Handle one edge of a routed path after its link handshake.
    async fn handle_hop(
        self: Arc<Self>,
        from: PeerId,
        connection: Arc<dyn UnderlyingConnection>,
        mut decoder: FrameDecoder,
    ) {
        let frame = match self.read_frame(&connection, &mut decoder).await {
            Ok(frame) => frame,
            Err(error) => {
                debug!("hop connection from {} dropped: {}", from, error);
                connection.close().await;
                return;
            }
        };
        match Packet::decode(&frame) {
            Ok(Packet::MulticastHandshake {
                source,
                destinations,
                next_hop_subtree,
            }) => {
                if next_hop_subtree.is_leaf() {
                    self.run_terminal_handshake(source, connection, decoder).await;
                } else {
                    self.establish_forwarding(source, destinations, next_hop_subtree, connection)
                        .await;
                }
            }
            Ok(other) => {
                warn!(
                    "expected multicast handshake from {}, got tag {:#04x}",
                    from,
                    other.tag()
                );
                connection.close().await;
            }
            Err(error) => {
                warn!("malformed multicast handshake from {}: {}", from, error);
                connection.close().await;
            }
        }
    }

    /// Terminal side of the endpoint confirmation: confirm, await the
    /// initiator's confirmation, then hand the connection up.
    async fn run_terminal_handshake(
        &self,
        source: PeerId,
        connection: Arc<dyn UnderlyingConnection>,
        mut decoder: FrameDecoder,
    ) {
        let confirmation = Packet::EstablishedConfirmation {
            source: self.local_id,
        };
        let frame = match confirmation.to_frame() {
            Ok(frame) => frame,
            Err(error) => {
                warn!("could not encode confirmation: {}", error);
                connection.close().await;
                return;
            }
        };
        if let Err(error) = connection.write(frame).await {
            debug!("routed connection from {} failed confirming: {}", source, error);
            connection.close().await;
            return;
        }
        match self.read_frame(&connection, &mut decoder).await {
            Ok(reply) => match Packet::decode(&reply) {
                Ok(Packet::EstablishedConfirmation { .. }) => {
                    info!("routed connection from {} established", source);
                    let node = self.provide_node(source);
                    self.delegate.handle_connection(node, connection).await;
                }
                Ok(other) => {
                    warn!(
                        "expected establishment confirmation from {}, got tag {:#04x}",
                        source,
                        other.tag()
                    );
                    connection.close().await;
                }
                Err(error) => {
                    warn!("malformed confirmation from {}: {}", source, error);
                    connection.close().await;
                }
            },
            Err(error) => {
                debug!(
                    "routed connection from {} failed before confirmation: {}",
                    source, error
                );
                connection.close().await;
            }
        }
    }

    /// Relay role: bring up the outgoing hops for a subtree, then fork the
    /// incoming connection into them.
    async fn establish_forwarding(
        &self,
        source: PeerId,
        destinations: Vec<PeerId>,
        subtree: HopTree,
        incoming: Arc<dyn UnderlyingConnection>,
    ) {
        // Retain the incoming connection while its outgoing peers come up.
        self.pending_forwarded.lock().push(Arc::clone(&incoming));

        let mut outgoing: Vec<Arc<dyn UnderlyingConnection>> =
            Vec::with_capacity(subtree.children.len());
        for child in &subtree.children {
            match self.establish_hop(source, &destinations, child).await {
                Ok(connection) => outgoing.push(connection),
                Err(error) => {
                    warn!(
                        "forwarding for {} failed at child {}: {}",
                        source, child.peer, error
                    );
                    for connection in &outgoing {
                        connection.close().await;
                    }
                    incoming.close().await;
                    self.remove_pending_forwarded(&incoming);
                    return;
                }
            }
        }
        let outgoing: Arc<dyn UnderlyingConnection> = if outgoing.len() > 1 {
            MulticastConnection::new(outgoing)
        } else {
            match outgoing.pop() {
                Some(connection) => connection,
                None => {
                    // Leaf subtrees never reach forwarding.
                    incoming.close().await;
                    self.remove_pending_forwarded(&incoming);
                    return;
                }
            }
        };

        let surface_locally = destinations.contains(&self.local_id);
        let fork_id = self.next_fork_id.fetch_add(1, Ordering::Relaxed);
        let weak = self.self_ref.clone();
        let forking = ForkingConnection::new(
            Arc::clone(&incoming),
            outgoing,
            surface_locally,
            Box::new(move || {
                if let Some(router) = weak.upgrade() {
                    router.remove_forking_connection(fork_id);
                }
            }),
        );
        self.forking_connections
            .lock()
            .insert(fork_id, Arc::clone(&forking));
        debug!(
            "{} forwarding for {} across {} destinations{}",
            self.local_id,
            source,
            destinations.len(),
            if surface_locally { " (also endpoint)" } else { "" }
        );

        if surface_locally {
            if let Some(router) = self.self_ref.upgrade() {
                let endpoint: Arc<dyn UnderlyingConnection> = forking;
                tokio::spawn(async move {
                    router
                        .run_terminal_handshake(source, endpoint, FrameDecoder::new())
                        .await;
                });
            }
        }
        self.remove_pending_forwarded(&incoming);
    }

    fn remove_pending_forwarded(&self, connection: &Arc<dyn UnderlyingConnection>) {
        self.pending_forwarded
            .lock()
            .retain(|pending| !Arc::ptr_eq(pending, connection));
    }

    pub(crate) fn remove_forking_connection(&self, fork_id: u64) {
        if self.forking_connections.lock().remove(&fork_id).is_some() {
            debug!("released forking connection {}", fork_id);
        }
    }

    /// Read one length-prefixed frame, honoring the handshake timeout.
    async fn read_frame(
        &self,
        connection: &Arc<dyn UnderlyingConnection>,
        decoder: &mut FrameDecoder,
    ) -> Result<Bytes, MeshError> {
        loop {
            if let Some(frame) = decoder.next_frame() {
                return Ok(frame);
            }
            let event = tokio::time::timeout(
                self.config.handshake_timeout,
                connection.next_event(),
            )
            .await
            .map_err(|_| MeshError::HandshakeFailure("timed out waiting for packet".into()))?;
            match event {
                ConnectionEvent::Data(data) => decoder.extend(&data),
                ConnectionEvent::Closed(_) => return Err(MeshError::TransportClosed),
            }
        }
    }
}

/// Feeds flooded link-state packets into the routing table.
struct LinkStateFloodHandler {
    router: Weak<Router>,
}

#[async_trait]
impl FloodHandler for LinkStateFloodHandler {
    async fn handle_packet(&self, _from: PeerId, packet: &Packet) {
        let Some(router) = self.router.upgrade() else { return };
        if let Packet::LinkState { peer_id, neighbors } = packet {
            router.handle_link_state(*peer_id, neighbors.clone()).await;
        }
    }
}
