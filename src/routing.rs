//! Link-state routing table.
//!
//! Maintains a weighted directed graph of the mesh as advertised by link-state
//! packets and direct neighbor observation, and derives shortest-path routes
//! from the local peer with Dijkstra's algorithm. Every mutation returns the
//! reachability delta it caused, so callers can notify exactly the peers whose
//! status changed.

use crate::message::HopTree;
use crate::types::{MeshError, PeerId};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

/// A route to a peer: the neighbor to forward through and the path cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Second vertex on the shortest path from the local peer.
    pub next_hop: PeerId,
    /// Total weight of the shortest path.
    pub cost: u32,
}

/// A route whose next hop or cost changed between two recomputations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteUpdate {
    /// The destination peer.
    pub peer: PeerId,
    /// The new next hop.
    pub next_hop: PeerId,
    /// Path cost before the update.
    pub old_cost: u32,
    /// Path cost after the update.
    pub new_cost: u32,
}

/// Reachability delta produced by one routing table mutation.
///
/// A peer whose status changed appears in exactly one of the three sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTableChange {
    /// Peers that became reachable, with their new routes.
    pub now_reachable: Vec<(PeerId, Route)>,
    /// Peers that became unreachable.
    pub now_unreachable: Vec<PeerId>,
    /// Peers still reachable whose next hop or cost changed.
    pub route_changed: Vec<RouteUpdate>,
}

impl RoutingTableChange {
    /// Whether the mutation changed no peer's reachability.
    pub fn is_empty(&self) -> bool {
        self.now_reachable.is_empty()
            && self.now_unreachable.is_empty()
            && self.route_changed.is_empty()
    }
}

/// Link-state routing table rooted at one local peer.
pub struct LinkStateRoutingTable {
    local: PeerId,
    /// Latest advertised outgoing edges per peer. The local entry is
    /// authoritative from direct neighbor observation.
    adjacency: HashMap<PeerId, BTreeMap<PeerId, u32>>,
    routes: HashMap<PeerId, Route>,
    predecessors: HashMap<PeerId, PeerId>,
}

impl LinkStateRoutingTable {
    /// Create an empty table for the given local peer.
    pub fn new(local: PeerId) -> Self {
        let mut adjacency = HashMap::new();
        adjacency.insert(local, BTreeMap::new());
        Self {
            local,
            adjacency,
            routes: HashMap::new(),
            predecessors: HashMap::new(),
        }
    }

    /// The peer this table computes routes from.
    pub fn local_id(&self) -> PeerId {
        self.local
    }

    /// Set the local edge to `peer`, then recompute routes.
    pub fn neighbor_update(&mut self, peer: PeerId, cost: u32) -> RoutingTableChange {
        self.adjacency
            .entry(self.local)
            .or_default()
            .insert(peer, cost);
        self.recompute()
    }

    /// Remove the local edge to `peer`, then recompute routes.
    pub fn neighbor_removal(&mut self, peer: PeerId) -> RoutingTableChange {
        self.adjacency.entry(self.local).or_default().remove(&peer);
        self.recompute()
    }

    /// Replace `origin`'s outgoing edge set with an advertised neighbor list.
    ///
    /// Updates naming the local peer as origin are ignored; local edges come
    /// only from direct observation.
    pub fn link_state_update(
        &mut self,
        origin: PeerId,
        neighbors: Vec<(PeerId, u32)>,
    ) -> RoutingTableChange {
        if origin == self.local {
            return RoutingTableChange::default();
        }
        self.adjacency.insert(origin, neighbors.into_iter().collect());
        self.recompute()
    }

    /// The local peer's current neighbor-cost list, for broadcast.
    pub fn link_state_information(&self) -> Vec<(PeerId, u32)> {
        self.adjacency
            .get(&self.local)
            .map(|edges| edges.iter().map(|(peer, cost)| (*peer, *cost)).collect())
            .unwrap_or_default()
    }

    /// The current route to `peer`, if reachable.
    pub fn route_to(&self, peer: &PeerId) -> Option<Route> {
        self.routes.get(peer).copied()
    }

    /// All currently reachable peers with their routes.
    pub fn routes(&self) -> &HashMap<PeerId, Route> {
        &self.routes
    }

    /// The union of shortest paths to `destinations`, as a tree rooted at the
    /// local peer. Fails with [`MeshError::NoRoute`] if any destination is
    /// unreachable.
    pub fn hop_tree(&self, destinations: &BTreeSet<PeerId>) -> Result<HopTree, MeshError> {
        let unroutable: Vec<PeerId> = destinations
            .iter()
            .filter(|peer| **peer == self.local || !self.routes.contains_key(peer))
            .copied()
            .collect();
        if !unroutable.is_empty() || destinations.is_empty() {
            return Err(MeshError::NoRoute(unroutable));
        }

        let mut root = TreeBuilder::new(self.local);
        for destination in destinations {
            let mut path = vec![*destination];
            let mut cursor = *destination;
            while cursor != self.local {
                // Predecessors always chain back to the local peer for any
                // routed destination.
                cursor = self.predecessors[&cursor];
                path.push(cursor);
            }
            path.reverse();
            root.insert_path(&path[1..]);
        }
        Ok(root.build())
    }

    /// Recompute shortest paths and return the delta from the previous state.
    ///
    /// Next-hop ties between equal-cost paths break toward the
    /// lexicographically smaller next-hop peer ID.
    fn recompute(&mut self) -> RoutingTableChange {
        let mut routes = HashMap::new();
        let mut predecessors = HashMap::new();

        // Heap entries are ordered by (cost, next_hop, vertex) so that the
        // first settlement of a vertex carries the minimal cost and, among
        // equal costs, the smallest next hop.
        let mut heap: BinaryHeap<Reverse<(u32, PeerId, PeerId, PeerId)>> = BinaryHeap::new();
        if let Some(edges) = self.adjacency.get(&self.local) {
            for (neighbor, cost) in edges {
                heap.push(Reverse((*cost, *neighbor, *neighbor, self.local)));
            }
        }

        while let Some(Reverse((cost, next_hop, vertex, predecessor))) = heap.pop() {
            if routes.contains_key(&vertex) {
                continue;
            }
            routes.insert(vertex, Route { next_hop, cost });
            predecessors.insert(vertex, predecessor);

            if let Some(edges) = self.adjacency.get(&vertex) {
                for (target, weight) in edges {
                    if *target == self.local || routes.contains_key(target) {
                        continue;
                    }
                    heap.push(Reverse((
                        cost.saturating_add(*weight),
                        next_hop,
                        *target,
                        vertex,
                    )));
                }
            }
        }

        let change = diff(&self.routes, &routes);
        self.routes = routes;
        self.predecessors = predecessors;
        change
    }
}

fn diff(old: &HashMap<PeerId, Route>, new: &HashMap<PeerId, Route>) -> RoutingTableChange {
    let mut change = RoutingTableChange::default();

    for (peer, route) in new {
        match old.get(peer) {
            None => change.now_reachable.push((*peer, *route)),
            Some(previous) if previous != route => change.route_changed.push(RouteUpdate {
                peer: *peer,
                next_hop: route.next_hop,
                old_cost: previous.cost,
                new_cost: route.cost,
            }),
            Some(_) => {}
        }
    }
    for peer in old.keys() {
        if !new.contains_key(peer) {
            change.now_unreachable.push(*peer);
        }
    }

    change.now_reachable.sort_by_key(|(peer, _)| *peer);
    change.now_unreachable.sort();
    change.route_changed.sort_by_key(|update| update.peer);
    change
}

/// Accumulates shortest paths into a merged next-hop tree.
struct TreeBuilder {
    peer: PeerId,
    children: BTreeMap<PeerId, TreeBuilder>,
}

impl TreeBuilder {
    fn new(peer: PeerId) -> Self {
        Self {
            peer,
            children: BTreeMap::new(),
        }
    }

    fn insert_path(&mut self, path: &[PeerId]) {
        if let Some((head, rest)) = path.split_first() {
            self.children
                .entry(*head)
                .or_insert_with(|| TreeBuilder::new(*head))
                .insert_path(rest);
        }
    }

    fn build(self) -> HopTree {
        HopTree {
            peer: self.peer,
            children: self.children.into_values().map(TreeBuilder::build).collect(),
        }
    }
}
