#![deny(unsafe_code)]

//! Wire format for routing and handshake packets.
//!
//! Every packet travels length-prefixed (16-bit big-endian length excluding
//! the prefix) and starts with a 16-bit type tag. Flooded packets are wrapped
//! in a [`Packet::FloodingEnvelope`] carrying the origin and sequence number.

use crate::types::PeerId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Type tag for [`Packet::LinkHandshake`].
pub const TAG_LINK_HANDSHAKE: u16 = 0x01;
/// Type tag for [`Packet::MulticastHandshake`].
pub const TAG_MULTICAST_HANDSHAKE: u16 = 0x02;
/// Type tag for [`Packet::EstablishedConfirmation`].
pub const TAG_ESTABLISHED_CONFIRMATION: u16 = 0x03;
/// Type tag for [`Packet::LinkState`].
pub const TAG_LINK_STATE: u16 = 0x10;
/// Type tag for [`Packet::FloodingEnvelope`].
pub const TAG_FLOODING_ENVELOPE: u16 = 0x20;

/// Errors that can occur while encoding or decoding packets.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The buffer ended before the packet was complete.
    #[error("truncated packet")]
    Truncated,

    /// The packet carried an unknown type tag.
    #[error("unknown packet tag {0:#06x}")]
    UnknownTag(u16),

    /// The link handshake carried an unknown purpose byte.
    #[error("unknown connection purpose {0}")]
    UnknownPurpose(u8),

    /// A link-state entry advertised a negative cost.
    #[error("negative link cost {0}")]
    NegativeCost(i32),

    /// The encoded packet does not fit a 16-bit length prefix.
    #[error("packet body of {0} bytes exceeds frame limit")]
    Oversized(usize),

    /// Trailing bytes were left after a complete packet.
    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),
}

/// Purpose of a direct link, declared in the opening handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPurpose {
    /// Long-lived neighbor link carrying flooded routing metadata.
    RoutingConnection,
    /// One hop of a routed or multicast connection.
    RoutedConnection,
}

impl ConnectionPurpose {
    fn to_byte(self) -> u8 {
        match self {
            ConnectionPurpose::RoutingConnection => 1,
            ConnectionPurpose::RoutedConnection => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, MessageError> {
        match byte {
            1 => Ok(ConnectionPurpose::RoutingConnection),
            2 => Ok(ConnectionPurpose::RoutedConnection),
            other => Err(MessageError::UnknownPurpose(other)),
        }
    }
}

/// Next-hop plan for a multicast: a tree of peers rooted at the sender.
///
/// Children are kept sorted by peer ID so serialization is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopTree {
    /// The peer this subtree is rooted at.
    pub peer: PeerId,
    /// Subtrees reached through `peer`.
    pub children: Vec<HopTree>,
}

impl HopTree {
    /// Create a subtree, sorting children by peer ID.
    pub fn new(peer: PeerId, mut children: Vec<HopTree>) -> Self {
        children.sort_by_key(|child| child.peer);
        Self { peer, children }
    }

    /// Create a terminal node.
    pub fn leaf(peer: PeerId) -> Self {
        Self {
            peer,
            children: Vec::new(),
        }
    }

    /// Whether this subtree is a terminal destination.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Every peer in this subtree, in depth-first order.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers = Vec::new();
        self.collect_peers(&mut peers);
        peers
    }

    fn collect_peers(&self, out: &mut Vec<PeerId>) {
        out.push(self.peer);
        for child in &self.children {
            child.collect_peers(out);
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(self.peer.as_bytes());
        buf.put_u16(self.children.len() as u16);
        for child in &self.children {
            child.encode_into(buf);
        }
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self, MessageError> {
        let peer = get_peer_id(buf)?;
        if buf.remaining() < 2 {
            return Err(MessageError::Truncated);
        }
        let child_count = buf.get_u16();
        let mut children = Vec::with_capacity(child_count as usize);
        for _ in 0..child_count {
            children.push(HopTree::decode_from(buf)?);
        }
        Ok(Self { peer, children })
    }
}

/// A routing or handshake packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Opens a direct link and declares what it will be used for.
    LinkHandshake {
        /// Identity of the initiating peer.
        peer_id: PeerId,
        /// Declared use of the link.
        purpose: ConnectionPurpose,
    },
    /// Describes a routed/multicast connection being wired through this hop.
    MulticastHandshake {
        /// The peer that initiated the connection.
        source: PeerId,
        /// All terminal destinations of the connection.
        destinations: Vec<PeerId>,
        /// The part of the hop tree this link is responsible for.
        next_hop_subtree: HopTree,
    },
    /// Endpoint confirmation exchanged once a routed connection is wired.
    EstablishedConfirmation {
        /// The confirming peer.
        source: PeerId,
    },
    /// Advertisement of one peer's neighbors and link costs.
    LinkState {
        /// The advertising peer.
        peer_id: PeerId,
        /// Its current neighbor-cost list.
        neighbors: Vec<(PeerId, u32)>,
    },
    /// Flood-dissemination wrapper around an inner packet.
    FloodingEnvelope {
        /// The peer that first flooded the inner packet.
        origin: PeerId,
        /// Per-origin monotone sequence number.
        sequence: u32,
        /// The wrapped packet.
        inner: Box<Packet>,
    },
}

impl Packet {
    /// The packet's 16-bit type tag.
    pub fn tag(&self) -> u16 {
        match self {
            Packet::LinkHandshake { .. } => TAG_LINK_HANDSHAKE,
            Packet::MulticastHandshake { .. } => TAG_MULTICAST_HANDSHAKE,
            Packet::EstablishedConfirmation { .. } => TAG_ESTABLISHED_CONFIRMATION,
            Packet::LinkState { .. } => TAG_LINK_STATE,
            Packet::FloodingEnvelope { .. } => TAG_FLOODING_ENVELOPE,
        }
    }

    /// Encode the packet body (type tag included, no length prefix).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.tag());
        match self {
            Packet::LinkHandshake { peer_id, purpose } => {
                buf.put_slice(peer_id.as_bytes());
                buf.put_u8(purpose.to_byte());
            }
            Packet::MulticastHandshake {
                source,
                destinations,
                next_hop_subtree,
            } => {
                buf.put_slice(source.as_bytes());
                buf.put_u16(destinations.len() as u16);
                for destination in destinations {
                    buf.put_slice(destination.as_bytes());
                }
                next_hop_subtree.encode_into(buf);
            }
            Packet::EstablishedConfirmation { source } => {
                buf.put_slice(source.as_bytes());
            }
            Packet::LinkState { peer_id, neighbors } => {
                buf.put_slice(peer_id.as_bytes());
                buf.put_u16(neighbors.len() as u16);
                for (neighbor, cost) in neighbors {
                    buf.put_slice(neighbor.as_bytes());
                    buf.put_i32(*cost as i32);
                }
            }
            Packet::FloodingEnvelope {
                origin,
                sequence,
                inner,
            } => {
                buf.put_slice(origin.as_bytes());
                buf.put_u32(*sequence);
                inner.encode_into(buf);
            }
        }
    }

    /// Encode the packet as a length-prefixed frame ready for the wire.
    pub fn to_frame(&self) -> Result<Bytes, MessageError> {
        let body = self.encode();
        let len = u16::try_from(body.len()).map_err(|_| MessageError::Oversized(body.len()))?;
        let mut frame = BytesMut::with_capacity(2 + body.len());
        frame.put_u16(len);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    /// Decode one packet from a complete frame body.
    ///
    /// Fails on truncation, unknown tags, and trailing garbage.
    pub fn decode(frame: &Bytes) -> Result<Self, MessageError> {
        let mut buf = frame.clone();
        let packet = Self::decode_from(&mut buf)?;
        if buf.has_remaining() {
            return Err(MessageError::TrailingBytes(buf.remaining()));
        }
        Ok(packet)
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self, MessageError> {
        if buf.remaining() < 2 {
            return Err(MessageError::Truncated);
        }
        let tag = buf.get_u16();
        match tag {
            TAG_LINK_HANDSHAKE => {
                let peer_id = get_peer_id(buf)?;
                if buf.remaining() < 1 {
                    return Err(MessageError::Truncated);
                }
                let purpose = ConnectionPurpose::from_byte(buf.get_u8())?;
                Ok(Packet::LinkHandshake { peer_id, purpose })
            }
            TAG_MULTICAST_HANDSHAKE => {
                let source = get_peer_id(buf)?;
                if buf.remaining() < 2 {
                    return Err(MessageError::Truncated);
                }
                let destination_count = buf.get_u16();
                let mut destinations = Vec::with_capacity(destination_count as usize);
                for _ in 0..destination_count {
                    destinations.push(get_peer_id(buf)?);
                }
                let next_hop_subtree = HopTree::decode_from(buf)?;
                Ok(Packet::MulticastHandshake {
                    source,
                    destinations,
                    next_hop_subtree,
                })
            }
            TAG_ESTABLISHED_CONFIRMATION => {
                let source = get_peer_id(buf)?;
                Ok(Packet::EstablishedConfirmation { source })
            }
            TAG_LINK_STATE => {
                let peer_id = get_peer_id(buf)?;
                if buf.remaining() < 2 {
                    return Err(MessageError::Truncated);
                }
                let neighbor_count = buf.get_u16();
                let mut neighbors = Vec::with_capacity(neighbor_count as usize);
                for _ in 0..neighbor_count {
                    let neighbor = get_peer_id(buf)?;
                    if buf.remaining() < 4 {
                        return Err(MessageError::Truncated);
                    }
                    let cost = buf.get_i32();
                    if cost < 0 {
                        return Err(MessageError::NegativeCost(cost));
                    }
                    neighbors.push((neighbor, cost as u32));
                }
                Ok(Packet::LinkState { peer_id, neighbors })
            }
            TAG_FLOODING_ENVELOPE => {
                let origin = get_peer_id(buf)?;
                if buf.remaining() < 4 {
                    return Err(MessageError::Truncated);
                }
                let sequence = buf.get_u32();
                let inner = Box::new(Packet::decode_from(buf)?);
                Ok(Packet::FloodingEnvelope {
                    origin,
                    sequence,
                    inner,
                })
            }
            other => Err(MessageError::UnknownTag(other)),
        }
    }
}

fn get_peer_id(buf: &mut Bytes) -> Result<PeerId, MessageError> {
    if buf.remaining() < 16 {
        return Err(MessageError::Truncated);
    }
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(PeerId::from_bytes(bytes))
}

/// Incremental decoder for length-prefixed frames on a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame body, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        self.buf.advance(2);
        Some(self.buf.split_to(len).freeze())
    }

    /// Whether no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
