//! Peer-to-peer networking
//!
//! This module handles communication between nodes: the message protocol
//! and its framing, the peer registry with liveness tracking, gossip
//! duplicate suppression, and the server that ties them together.

pub mod message;
pub mod peer_registry;
pub mod seen_cache;
pub mod server;

pub use message::{send_message, HandshakeInfo, Message, PeerInfo, PROTOCOL_VERSION};
pub use peer_registry::{Liveness, PeerEntry, PeerRegistry};
pub use seen_cache::SeenCache;
pub use server::Server;
