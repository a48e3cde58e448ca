//! `hive-peer`: runs one overlay node until Ctrl-C.
//!
//! Usage: `hive-peer [config.json] [identity.json]`. Both default to files
//! under `~/.hive/overlay/`; missing files yield defaults and a freshly
//! generated identity is saved for the next run.

mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use hive_overlay::{
    HiveStore, MemoryHiveStore, NodeIdentity, OverlayConfig, OverlayNode, PacketBody,
    TopologyEvent,
};

fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".hive").join("overlay"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let base = base_dir()?;
    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| base.join("config.json"));
    let identity_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| base.join("identity.json"));

    let _guard = logging::init_logging(&base.join("logs"))?;

    let config = OverlayConfig::load_or_default(&config_path);
    let identity = NodeIdentity::load_or_generate(&identity_path, "hive-peer");
    info!(
        "Loaded identity {} ({}) version {}",
        identity.name, identity.guid, identity.version
    );

    let poll = config.content_poll_interval;
    let store = Arc::new(MemoryHiveStore::with_owner(identity.guid.to_string()));
    let node = OverlayNode::new(identity, config)
        .with_hive_store(Arc::clone(&store) as Arc<dyn HiveStore>);
    node.start().await.context("Failed to start overlay node")?;

    tokio::spawn(log_topology(node.clone()));

    let mut tick = tokio::time::interval(poll);
    loop {
        tokio::select! {
            _ = tick.tick() => drain_inbox(&node, &store),
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Ctrl-C handler failed: {e}");
                }
                break;
            }
        }
    }

    info!("Shutting down");
    node.close().await;
    Ok(())
}

async fn log_topology(node: OverlayNode) {
    let mut events = node.subscribe_topology();
    loop {
        match events.recv().await {
            Ok(TopologyEvent::PeerConnected { session, peer }) => {
                info!("Peer {peer} connected on session {session}");
            }
            Ok(TopologyEvent::PeerDisconnected { session, peer }) => match peer {
                Some(peer) => info!("Peer {peer} disconnected from session {session}"),
                None => info!("Session {session} disconnected"),
            },
            Err(RecvError::Lagged(missed)) => debug!("Missed {missed} topology events"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn drain_inbox(node: &OverlayNode, store: &MemoryHiveStore) {
    while let Some(packet) = node.dequeue() {
        let from = packet
            .origin_path
            .first()
            .map_or_else(|| "?".to_string(), |hop| hop.guid.to_string());
        match &packet.body {
            PacketBody::Welcome {
                support,
                link,
                message,
            } => {
                let code = support.map_or_else(|| "none".to_string(), |c| c.to_string());
                warn!("Peer {from} reports our version as {code}: {message} {link}");
            }
            PacketBody::Data {
                item_guid: Some(item),
                ..
            } => {
                if store.absorb(&packet) {
                    info!("Stored item {item} for hive '{}' from {from}", packet.hive_guid);
                }
            }
            PacketBody::Data {
                content_type,
                payload,
                ..
            } => {
                info!(
                    "[{}] {from} ({content_type}): {payload}",
                    packet.hive_guid
                );
            }
            PacketBody::Synchro { .. } => debug!("Unexpected synchro packet in inbox"),
        }
    }
}
