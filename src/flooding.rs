//! Flooded dissemination of routing packets.
//!
//! Packets are wrapped in a [`Packet::FloodingEnvelope`] carrying the origin
//! peer and a per-origin monotone sequence number, sent over every neighbor's
//! routing metadata connection, and re-broadcast on first receipt. The
//! `(origin, sequence)` pair is delivered to local handlers at most once.

use crate::connection::UnderlyingConnection;
use crate::message::Packet;
use crate::types::PeerId;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// The routing metadata connections currently up, one per neighbor.
pub struct LinkRegistry {
    links: DashMap<PeerId, LinkEntry>,
}

struct LinkEntry {
    connection: Arc<dyn UnderlyingConnection>,
    /// Which side initiated, for resolving simultaneous establishment.
    initiator: PeerId,
}

/// Outcome of [`LinkRegistry::install`].
pub enum LinkInstall {
    /// The link was installed; any replaced connection should be closed.
    Installed {
        /// The connection this one replaced, if any.
        replaced: Option<Arc<dyn UnderlyingConnection>>,
    },
    /// An existing link won the tie-break; the new connection is handed back
    /// to be closed.
    Rejected(Arc<dyn UnderlyingConnection>),
}

impl Default for LinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            links: DashMap::new(),
        }
    }

    /// Install a link to `peer`, resolving simultaneous establishment.
    ///
    /// When both sides open routing connections at once, the connection
    /// initiated by the smaller peer ID wins.
    pub fn install(
        &self,
        peer: PeerId,
        connection: Arc<dyn UnderlyingConnection>,
        initiator: PeerId,
    ) -> LinkInstall {
        match self.links.entry(peer) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(LinkEntry {
                    connection,
                    initiator,
                });
                LinkInstall::Installed { replaced: None }
            }
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if initiator <= entry.get().initiator {
                    let old = entry.insert(LinkEntry {
                        connection,
                        initiator,
                    });
                    LinkInstall::Installed {
                        replaced: Some(old.connection),
                    }
                } else {
                    LinkInstall::Rejected(connection)
                }
            }
        }
    }

    /// Drop the link to `peer` if it is the given connection.
    pub fn remove(&self, peer: PeerId, connection: &Arc<dyn UnderlyingConnection>) -> bool {
        self.links
            .remove_if(&peer, |_, entry| {
                Arc::ptr_eq(&entry.connection, connection)
            })
            .is_some()
    }

    /// The link to `peer`, if one is up.
    pub fn get(&self, peer: PeerId) -> Option<Arc<dyn UnderlyingConnection>> {
        self.links
            .get(&peer)
            .map(|entry| Arc::clone(&entry.connection))
    }

    /// Peers with a link currently up.
    pub fn peers(&self) -> Vec<PeerId> {
        self.links.iter().map(|entry| *entry.key()).collect()
    }

    /// Remove and return every link.
    pub fn drain(&self) -> Vec<Arc<dyn UnderlyingConnection>> {
        let peers = self.peers();
        peers
            .into_iter()
            .filter_map(|peer| self.links.remove(&peer).map(|(_, entry)| entry.connection))
            .collect()
    }

    /// Send a frame over every link except `exclude`.
    pub async fn broadcast(&self, exclude: Option<PeerId>, frame: Bytes) {
        let targets: Vec<(PeerId, Arc<dyn UnderlyingConnection>)> = self
            .links
            .iter()
            .filter(|entry| Some(*entry.key()) != exclude)
            .map(|entry| (*entry.key(), Arc::clone(&entry.value().connection)))
            .collect();
        for (peer, connection) in targets {
            if let Err(error) = connection.write(frame.clone()).await {
                debug!("broadcast to {} failed: {}", peer, error);
            }
        }
    }
}

/// A handler for flooded packets of one type tag.
#[async_trait]
pub trait FloodHandler: Send + Sync {
    /// Called once per newly seen `(origin, sequence)` pair.
    async fn handle_packet(&self, from: PeerId, packet: &Packet);
}

/// Tracks which sequence numbers of one origin have been seen.
///
/// Sequences below the contiguous watermark are pruned; only the sparse
/// out-of-order tail is kept.
#[derive(Debug, Default)]
struct SeenWindow {
    /// Highest `h` such that all sequences `0..=h` were seen.
    contiguous: Option<u32>,
    /// Seen sequences above the watermark.
    pending: BTreeSet<u32>,
}

impl SeenWindow {
    /// Record `sequence`; returns false if it was already seen.
    fn insert(&mut self, sequence: u32) -> bool {
        if let Some(watermark) = self.contiguous {
            if sequence <= watermark {
                return false;
            }
        }
        if !self.pending.insert(sequence) {
            return false;
        }
        loop {
            let next = match self.contiguous {
                None => 0,
                Some(watermark) => match watermark.checked_add(1) {
                    Some(next) => next,
                    None => break,
                },
            };
            if self.pending.remove(&next) {
                self.contiguous = Some(next);
            } else {
                break;
            }
        }
        true
    }
}

/// De-duplicating flood dissemination over the neighbor links.
pub struct FloodingPacketManager {
    local: PeerId,
    links: Arc<LinkRegistry>,
    next_sequence: AtomicU32,
    seen: Mutex<HashMap<PeerId, SeenWindow>>,
    handlers: RwLock<HashMap<u16, Vec<Arc<dyn FloodHandler>>>>,
}

impl FloodingPacketManager {
    /// Create a manager flooding under `local`'s identity over `links`.
    pub fn new(local: PeerId, links: Arc<LinkRegistry>) -> Self {
        Self {
            local,
            links,
            next_sequence: AtomicU32::new(0),
            seen: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for packets with the given type tag.
    ///
    /// Multiple handlers per tag are allowed; they run in registration order.
    pub fn register_handler(&self, tag: u16, handler: Arc<dyn FloodHandler>) {
        self.handlers.write().entry(tag).or_default().push(handler);
    }

    /// Flood `packet` to the mesh under the local peer's identity.
    pub async fn flood(&self, packet: Packet) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .entry(self.local)
            .or_default()
            .insert(sequence);
        let envelope = Packet::FloodingEnvelope {
            origin: self.local,
            sequence,
            inner: Box::new(packet),
        };
        match envelope.to_frame() {
            Ok(frame) => {
                trace!("flooding ({}, {})", self.local, sequence);
                self.links.broadcast(None, frame).await;
            }
            Err(error) => warn!("could not encode flood envelope: {}", error),
        }
    }

    /// Process a flooding envelope received from neighbor `from`.
    ///
    /// First receipt dispatches to the registered handlers and re-broadcasts
    /// to every other neighbor; duplicates are dropped.
    pub async fn handle_envelope(
        &self,
        from: PeerId,
        origin: PeerId,
        sequence: u32,
        inner: Packet,
    ) {
        let fresh = self
            .seen
            .lock()
            .entry(origin)
            .or_default()
            .insert(sequence);
        if !fresh {
            trace!("dropping duplicate flood ({}, {})", origin, sequence);
            return;
        }

        let handlers = self
            .handlers
            .read()
            .get(&inner.tag())
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler.handle_packet(from, &inner).await;
        }

        let envelope = Packet::FloodingEnvelope {
            origin,
            sequence,
            inner: Box::new(inner),
        };
        match envelope.to_frame() {
            Ok(frame) => self.links.broadcast(Some(from), frame).await,
            Err(error) => warn!("could not re-encode flood envelope: {}", error),
        }
    }
}
