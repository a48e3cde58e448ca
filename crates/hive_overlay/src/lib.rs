//! Hive Overlay: peer-to-peer mesh with hive-scoped flooding.
//!
//! This crate provides the overlay layer: peers connect over TCP, subscribe
//! to named channels ("hives") and exchange packets that are either flooded
//! through the mesh under a hop budget or source-routed back along the path
//! they arrived on. A reconciliation protocol converges two peers' item sets
//! for a shared hive.
//!
//! # Architecture
//!
//! - **Transport**: length-prefixed, AES-256-CBC encrypted JSON frames over
//!   plain TCP ([`codec`], [`session`], [`listener`]).
//! - **Handshake**: a version-gated `Welcome` exchange activates each session.
//! - **Routing**: flooding bounded by hops-to-live, amplified on hive match,
//!   with duplicate suppression ([`packet`], [`dedup`]).
//! - **Reconciliation**: root-hash / list / difference exchange ([`sync`]).
//! - **Orchestration**: one node owning the sessions, a connection manager
//!   loop and a content loop ([`node`]).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hive_overlay::{NodeIdentity, OverlayConfig, OverlayNode, Packet};
//!
//! # async fn example() {
//! let node = OverlayNode::new(NodeIdentity::generate("my-node"), OverlayConfig::default());
//! node.register_hive("news");
//! node.start().await.unwrap();
//! node.connect("192.0.2.10", 9470).unwrap();
//! node.enqueue(Packet::data("news", "text/plain", "hello")).unwrap();
//! while let Some(packet) = node.dequeue() {
//!     println!("{:?}", packet.body);
//! }
//! node.close().await;
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod dedup;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod listener;
pub mod node;
pub mod packet;
pub mod record;
pub mod session;
pub mod sync;
pub mod version;

#[cfg(test)]
mod testing;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::OverlayConfig;
pub use endpoint::Endpoint;
pub use error::OverlayError;
pub use identity::{NodeIdentity, PeerGuid, SessionId};
pub use node::{OverlayNode, TopologyEvent};
pub use packet::{Packet, PacketBody, PathHop};
pub use record::SyncRecord;
pub use sync::{HiveStore, MemoryHiveStore};
pub use version::{PeerVersion, SupportCode, VersionPolicy, VersionThreshold};
