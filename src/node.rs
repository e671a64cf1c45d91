//! Per-peer state: known addresses, best-address selection, and the routing
//! metadata connection.

use crate::connection::UnderlyingConnection;
use crate::routing::Route;
use crate::types::{MeshError, PeerId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ADDRESS_ID: AtomicU64 = AtomicU64::new(1);

/// Produces fresh connections to one transport endpoint.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection to the endpoint.
    async fn open(&self) -> Result<Arc<dyn UnderlyingConnection>, MeshError>;
}

/// An opaque transport endpoint for one peer.
///
/// Carries a cost metric (lower is better) and a factory for fresh
/// connections. Each address gets a process-unique identity at construction;
/// equal-cost selection ties break on that identity so the choice is stable.
#[derive(Clone)]
pub struct Address {
    id: u64,
    cost: u32,
    factory: Arc<dyn ConnectionFactory>,
}

impl Address {
    /// Create an address with the given cost metric.
    pub fn new(cost: u32, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            id: NEXT_ADDRESS_ID.fetch_add(1, Ordering::Relaxed),
            cost,
            factory,
        }
    }

    /// The address's process-unique identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The cost metric; lower is better.
    pub fn cost(&self) -> u32 {
        self.cost
    }

    /// Open a fresh connection to this endpoint.
    pub async fn open_connection(&self) -> Result<Arc<dyn UnderlyingConnection>, MeshError> {
        self.factory.open().await
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Address {}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Address")
            .field("id", &self.id)
            .field("cost", &self.cost)
            .finish()
    }
}

/// What an address mutation did to the owning node.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AddressChange {
    /// The node gained its first address.
    pub became_neighbor: bool,
    /// The node lost its last address.
    pub lost_neighbor: bool,
    /// The best-address cost afterwards, if it differs from before.
    pub best_cost_changed: Option<u32>,
}

/// State for one known peer.
///
/// Nodes are created on first mention and live as long as the router, so
/// reachability transitions stay observable across disappearance and
/// rediscovery.
pub struct Node {
    id: PeerId,
    addresses: RwLock<Vec<Address>>,
    reachable_via: RwLock<Option<Route>>,
    routing_connection: RwLock<Option<Arc<dyn UnderlyingConnection>>>,
}

impl Node {
    /// Create a node for `id` with no known addresses.
    pub fn new(id: PeerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            addresses: RwLock::new(Vec::new()),
            reachable_via: RwLock::new(None),
            routing_connection: RwLock::new(None),
        })
    }

    /// The peer this node describes.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Whether at least one address is known. Neighborship is strictly a
    /// local observation, independent of graph-derived reachability.
    pub fn is_neighbor(&self) -> bool {
        !self.addresses.read().is_empty()
    }

    /// The lowest-cost known address, ties broken by address identity.
    pub fn best_address(&self) -> Option<Address> {
        self.addresses
            .read()
            .iter()
            .min_by_key(|address| (address.cost(), address.id()))
            .cloned()
    }

    /// The current route to this peer, if any.
    pub fn reachable_via(&self) -> Option<Route> {
        *self.reachable_via.read()
    }

    pub(crate) fn set_reachable_via(&self, route: Option<Route>) {
        *self.reachable_via.write() = route;
    }

    pub(crate) fn add_address(&self, address: Address) -> AddressChange {
        let mut addresses = self.addresses.write();
        let old_best = addresses
            .iter()
            .map(|existing| (existing.cost(), existing.id()))
            .min();
        let became_neighbor = addresses.is_empty();
        if !addresses.contains(&address) {
            addresses.push(address);
        }
        let new_best = addresses
            .iter()
            .map(|existing| (existing.cost(), existing.id()))
            .min();
        AddressChange {
            became_neighbor,
            lost_neighbor: false,
            best_cost_changed: best_cost_delta(old_best, new_best),
        }
    }

    pub(crate) fn remove_address(&self, address_id: u64) -> AddressChange {
        let mut addresses = self.addresses.write();
        let old_best = addresses
            .iter()
            .map(|existing| (existing.cost(), existing.id()))
            .min();
        let had_addresses = !addresses.is_empty();
        addresses.retain(|existing| existing.id() != address_id);
        let new_best = addresses
            .iter()
            .map(|existing| (existing.cost(), existing.id()))
            .min();
        AddressChange {
            became_neighbor: false,
            lost_neighbor: had_addresses && addresses.is_empty(),
            best_cost_changed: best_cost_delta(old_best, new_best),
        }
    }

    /// Drop every known address, e.g. when the peer stopped answering.
    pub(crate) fn clear_addresses(&self) {
        self.addresses.write().clear();
    }

    /// The long-lived link carrying flooded routing metadata, if up.
    pub fn routing_connection(&self) -> Option<Arc<dyn UnderlyingConnection>> {
        self.routing_connection.read().clone()
    }

    pub(crate) fn set_routing_connection(&self, connection: Arc<dyn UnderlyingConnection>) {
        *self.routing_connection.write() = Some(connection);
    }

    /// Drop the stored routing connection if it is the given one.
    pub(crate) fn clear_routing_connection(
        &self,
        connection: &Arc<dyn UnderlyingConnection>,
    ) -> bool {
        let mut current = self.routing_connection.write();
        if let Some(existing) = current.as_ref() {
            if Arc::ptr_eq(existing, connection) {
                *current = None;
                return true;
            }
        }
        false
    }

    pub(crate) fn take_routing_connection(&self) -> Option<Arc<dyn UnderlyingConnection>> {
        self.routing_connection.write().take()
    }
}

fn best_cost_delta(old: Option<(u32, u64)>, new: Option<(u32, u64)>) -> Option<u32> {
    match (old, new) {
        (Some((old_cost, _)), Some((new_cost, _))) if old_cost != new_cost => Some(new_cost),
        (None, Some((new_cost, _))) => Some(new_cost),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionEvent;
    use bytes::Bytes;

    struct DeadFactory;

    #[async_trait]
    impl ConnectionFactory for DeadFactory {
        async fn open(&self) -> Result<Arc<dyn UnderlyingConnection>, MeshError> {
            Err(MeshError::TransportClosed)
        }
    }

    fn address(cost: u32) -> Address {
        Address::new(cost, Arc::new(DeadFactory))
    }

    #[test]
    fn first_address_makes_neighbor() {
        let node = Node::new(PeerId::random());
        assert!(!node.is_neighbor());

        let change = node.add_address(address(5));
        assert!(change.became_neighbor);
        assert_eq!(change.best_cost_changed, Some(5));
        assert!(node.is_neighbor());
    }

    #[test]
    fn best_address_is_minimum_cost_with_stable_tie_break() {
        let node = Node::new(PeerId::random());
        let cheap_first = address(2);
        let cheap_second = address(2);
        node.add_address(address(9));
        node.add_address(cheap_first.clone());
        node.add_address(cheap_second);

        // Of the two equal-cost addresses, the one created first wins.
        assert_eq!(node.best_address(), Some(cheap_first));
    }

    #[test]
    fn cheaper_address_changes_best_cost() {
        let node = Node::new(PeerId::random());
        node.add_address(address(9));
        let change = node.add_address(address(3));
        assert!(!change.became_neighbor);
        assert_eq!(change.best_cost_changed, Some(3));
    }

    #[test]
    fn removing_last_address_loses_neighbor() {
        let node = Node::new(PeerId::random());
        let only = address(4);
        let only_id = only.id();
        node.add_address(only);

        let change = node.remove_address(only_id);
        assert!(change.lost_neighbor);
        assert!(!node.is_neighbor());
        assert!(node.best_address().is_none());
    }

    #[test]
    fn removing_unknown_address_changes_nothing() {
        let node = Node::new(PeerId::random());
        node.add_address(address(4));
        let change = node.remove_address(u64::MAX);
        assert_eq!(change, AddressChange::default());
        assert!(node.is_neighbor());
    }

    #[derive(Debug)]
    struct NullConnection;

    #[async_trait]
    impl UnderlyingConnection for NullConnection {
        async fn connect(&self) -> Result<(), MeshError> {
            Ok(())
        }
        async fn write(&self, _data: Bytes) -> Result<(), MeshError> {
            Ok(())
        }
        async fn close(&self) {}
        async fn next_event(&self) -> ConnectionEvent {
            ConnectionEvent::Closed(crate::connection::CloseReason::Remote)
        }
    }

    #[test]
    fn clear_routing_connection_only_drops_matching_one() {
        let node = Node::new(PeerId::random());
        let first: Arc<dyn UnderlyingConnection> = Arc::new(NullConnection);
        let second: Arc<dyn UnderlyingConnection> = Arc::new(NullConnection);
        node.set_routing_connection(first.clone());

        assert!(!node.clear_routing_connection(&second));
        assert!(node.routing_connection().is_some());
        assert!(node.clear_routing_connection(&first));
        assert!(node.routing_connection().is_none());
    }
}
