#![deny(unsafe_code)]

//! Mesh networking core for ad-hoc peer-to-peer networks.
//!
//! This crate maintains a link-state view of a churning peer graph, floods
//! routing updates across neighbor links, and establishes end-to-end
//! connections over anonymous point-to-point transports: direct links,
//! multi-hop relayed paths, and one-to-many multicast trees. Concrete
//! transports plug in through the [`Module`] and [`UnderlyingConnection`]
//! interfaces; the layer above consumes reachability changes and inbound
//! connections through [`RouterDelegate`].

pub mod connection;
pub mod executor;
pub mod flooding;
pub mod message;
pub mod node;
pub mod router;
pub mod routing;
pub mod transport;
pub mod types;

pub use connection::{
    CloseReason, ConnectionEvent, ForkingConnection, MulticastConnection, UnderlyingConnection,
};
pub use executor::RepeatedExecutor;
pub use flooding::{FloodHandler, FloodingPacketManager, LinkRegistry};
pub use message::{ConnectionPurpose, FrameDecoder, HopTree, MessageError, Packet};
pub use node::{Address, ConnectionFactory, Node};
pub use router::{Router, RouterDelegate, RouterStats};
pub use routing::{LinkStateRoutingTable, Route, RouteUpdate, RoutingTableChange};
pub use transport::{MemoryHub, MemoryModule, Module, TransportEvent};
pub use types::{MeshError, PeerId};

use std::time::Duration;

/// Process-wide tunables, passed at router construction.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Delay between periodic link-state broadcasts.
    pub broadcast_regular_delay: Duration,
    /// Coalescing delay for broadcasts triggered by topology changes.
    pub broadcast_short_delay: Duration,
    /// Per-step timeout while waiting for a handshake packet.
    pub handshake_timeout: Duration,
    /// Attempts at a neighbor's routing metadata connection before the
    /// neighbor is given up as lost.
    pub routing_retry_limit: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            broadcast_regular_delay: Duration::from_secs(5),
            broadcast_short_delay: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(10),
            routing_retry_limit: 5,
        }
    }
}
