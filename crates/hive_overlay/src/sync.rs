//! Hive reconciliation: converging two peers' item sets for a shared hive.
//!
//! A round has at most three legs, all carried by `Synchro` packets and all
//! source-routed back along the recorded path (never flooded):
//!
//! 1. kickoff: the requester sends only its root hash;
//! 2. continue: a peer whose root hash differs answers with its full item list;
//! 3. response: the requester answers with the items it is missing.
//!
//! After the continue leg the requester pushes what the other side lacks; after
//! the response leg the other side pushes what the requester lacks. The
//! content itself travels as `Data` packets produced from the [`HiveStore`].
//!
//! On the wire, `response_list` names the items its *sender* lacks and wants
//! pushed, not the items it is offering. Both ends must read it this way for
//! a round to converge.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use crate::error::OverlayError;
use crate::identity::SessionId;
use crate::packet::{OverlayContext, Packet, PacketBody, PathHop, SendMode};
use crate::record::SyncRecord;

/// Content type of items pushed by reconciliation.
pub const SYNC_ITEM_CONTENT_TYPE: &str = "application/x-hive-item";

/// Item storage consumed by reconciliation. Implemented by the application.
pub trait HiveStore: Send + Sync {
    /// GUIDs of every item held for `hive`.
    fn item_guids(&self, hive: &str) -> Vec<String>;

    /// Digest of the item set; equal sets must produce equal hashes.
    fn root_hash(&self, hive: &str) -> String {
        root_hash_of(&self.item_guids(hive))
    }

    /// Serialized content of one item, if still held.
    fn materialize(&self, hive: &str, item_guid: &str) -> Option<String>;

    /// Store an item received as a `Data` packet carrying an item GUID.
    /// Returns whether the stored copy changed.
    fn absorb(&self, packet: &Packet) -> bool;
}

/// Hex SHA-256 over the sorted, newline-joined GUIDs.
pub fn root_hash_of(guids: &[String]) -> String {
    let mut sorted: Vec<&str> = guids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let mut hasher = Sha256::new();
    for guid in sorted {
        hasher.update(guid.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Wire form of an item held by [`MemoryHiveStore`]: its version record and
/// its content. This is what reconciliation carries in a `Data` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredItem {
    pub record: SyncRecord,
    pub content: String,
}

/// In-memory [`HiveStore`], keyed by hive then item GUID. Local writes are
/// attributed to `owner`; copies arriving from peers replace the local one
/// only when their [`SyncRecord`] ranks higher.
#[derive(Debug)]
pub struct MemoryHiveStore {
    owner: String,
    hives: Mutex<BTreeMap<String, BTreeMap<String, StoredItem>>>,
}

impl Default for MemoryHiveStore {
    fn default() -> Self {
        Self::with_owner("local")
    }
}

impl MemoryHiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            hives: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create or locally modify an item. A modification bumps its version.
    pub fn insert(&self, hive: &str, item_guid: &str, content: &str) {
        let now = Utc::now();
        let mut hives = self.hives.lock();
        let items = hives.entry(hive.to_string()).or_default();
        match items.get_mut(item_guid) {
            Some(item) => {
                item.record.record_update(self.owner.clone(), now);
                item.content = content.to_string();
            }
            None => {
                items.insert(
                    item_guid.to_string(),
                    StoredItem {
                        record: SyncRecord::new(item_guid, self.owner.clone(), now),
                        content: content.to_string(),
                    },
                );
            }
        }
    }

    pub fn content(&self, hive: &str, item_guid: &str) -> Option<String> {
        Some(self.hives.lock().get(hive)?.get(item_guid)?.content.clone())
    }

    pub fn record(&self, hive: &str, item_guid: &str) -> Option<SyncRecord> {
        Some(self.hives.lock().get(hive)?.get(item_guid)?.record.clone())
    }

    pub fn len(&self, hive: &str) -> usize {
        self.hives.lock().get(hive).map_or(0, BTreeMap::len)
    }
}

impl HiveStore for MemoryHiveStore {
    fn item_guids(&self, hive: &str) -> Vec<String> {
        self.hives
            .lock()
            .get(hive)
            .map(|items| items.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn materialize(&self, hive: &str, item_guid: &str) -> Option<String> {
        let hives = self.hives.lock();
        let item = hives.get(hive)?.get(item_guid)?;
        match serde_json::to_string(item) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!("Cannot serialize item {item_guid} of hive '{hive}': {e}");
                None
            }
        }
    }

    fn absorb(&self, packet: &Packet) -> bool {
        let PacketBody::Data {
            item_guid: Some(item_guid),
            payload,
            ..
        } = &packet.body
        else {
            return false;
        };
        let incoming: StoredItem = match serde_json::from_str(payload) {
            Ok(item) => item,
            Err(e) => {
                debug!("Item {item_guid} for hive '{}' is malformed: {e}", packet.hive_guid);
                return false;
            }
        };
        if incoming.record.item_guid != *item_guid {
            debug!(
                "Item {item_guid} carries a record for {}, ignored",
                incoming.record.item_guid
            );
            return false;
        }

        let mut hives = self.hives.lock();
        let items = hives.entry(packet.hive_guid.clone()).or_default();
        if let Some(current) = items.get(item_guid) {
            if incoming.record.is_conflict(&current.record) {
                warn!(
                    "Concurrent updates to item {item_guid} in hive '{}', keeping the higher-ranked copy",
                    packet.hive_guid
                );
            }
            if !incoming.record.is_winner(&current.record) {
                trace!("Kept local copy of item {item_guid}");
                return false;
            }
        }
        items.insert(item_guid.clone(), incoming);
        true
    }
}

impl Packet {
    /// Run one reconciliation step for this `Synchro` packet.
    ///
    /// Returns the item GUIDs the caller must now push back along
    /// [`path_to_origin`](Packet::path_to_origin), one data packet per item.
    pub async fn reconcile(
        &self,
        local_guids: &[String],
        local_root_hash: &str,
        ctx: &dyn OverlayContext,
    ) -> Result<Vec<String>, OverlayError> {
        let PacketBody::Synchro {
            root_hash,
            request_list,
            response_list,
        } = &self.body
        else {
            return Err(OverlayError::Protocol(format!(
                "reconcile called on {} packet",
                self.body.kind_name()
            )));
        };

        if self.is_locally_originated() {
            let mut kickoff = self.clone();
            kickoff.body = PacketBody::Synchro {
                root_hash: Some(local_root_hash.to_string()),
                request_list: None,
                response_list: None,
            };
            match self.sender {
                Some(session) => ctx.send(session, kickoff, SendMode::Async).await?,
                None => {
                    let sent = ctx.flood(kickoff, None).await;
                    debug!("Hive '{}' sync kickoff flooded to {sent} sessions", self.hive_guid);
                }
            }
            return Ok(Vec::new());
        }

        if let Some(missing_at_origin) = response_list {
            return Ok(missing_at_origin.clone());
        }

        if let Some(remote) = request_list {
            let remote_set: HashSet<&str> = remote.iter().map(String::as_str).collect();
            let local_set: HashSet<&str> = local_guids.iter().map(String::as_str).collect();

            let we_lack: Vec<String> = remote
                .iter()
                .filter(|g| !local_set.contains(g.as_str()))
                .cloned()
                .collect();
            let they_lack: Vec<String> = local_guids
                .iter()
                .filter(|g| !remote_set.contains(g.as_str()))
                .cloned()
                .collect();

            if !we_lack.is_empty() {
                let response = self.reply(PacketBody::Synchro {
                    root_hash: None,
                    request_list: None,
                    response_list: Some(we_lack),
                });
                ctx.route(response).await?;
            }
            return Ok(they_lack);
        }

        match root_hash {
            Some(remote_hash) if remote_hash != local_root_hash => {
                let cont = self.reply(PacketBody::Synchro {
                    root_hash: None,
                    request_list: Some(local_guids.to_vec()),
                    response_list: None,
                });
                ctx.route(cont).await?;
            }
            Some(_) => trace!("Hive '{}' already in sync", self.hive_guid),
            None => debug!("Empty synchro packet {} ignored", self.packet_guid),
        }
        Ok(Vec::new())
    }
}

/// `Synchro` processing: relay if source-routed elsewhere, otherwise run a
/// reconciliation step against the local store and push the resulting items.
pub(crate) async fn process_synchro(
    packet: Packet,
    ctx: &dyn OverlayContext,
) -> Result<(), OverlayError> {
    if let Some(receiver) = packet.receiver {
        if !ctx.is_handshaken(receiver) {
            debug!(
                "Dropping synchro {} from session {receiver}: handshake incomplete",
                packet.packet_guid
            );
            return Ok(());
        }
    }
    if !packet.destination_path.is_empty() {
        return ctx.route(packet).await;
    }
    let Some(store) = ctx.hive_store() else {
        debug!("No hive store attached, ignoring synchro for '{}'", packet.hive_guid);
        return Ok(());
    };
    if !ctx.has_hive(&packet.hive_guid) {
        debug!("Not subscribed to hive '{}', ignoring synchro", packet.hive_guid);
        return Ok(());
    }

    let hive = packet.hive_guid.clone();
    let local = store.item_guids(&hive);
    let root = store.root_hash(&hive);
    let push = packet.reconcile(&local, &root, ctx).await?;
    if !push.is_empty() {
        push_items(ctx, store.as_ref(), &hive, &packet.path_to_origin(), &push).await;
    }
    Ok(())
}

/// Send one data packet per item along `path` (newest hop first).
pub async fn push_items(
    ctx: &dyn OverlayContext,
    store: &dyn HiveStore,
    hive: &str,
    path: &[PathHop],
    items: &[String],
) -> usize {
    let destination: Vec<_> = path.iter().map(|h| h.guid.clone()).collect();
    let mut pushed = 0;
    for item in items {
        let Some(content) = store.materialize(hive, item) else {
            debug!("Item {item} vanished from hive '{hive}' before push");
            continue;
        };
        let mut packet = Packet::new(
            hive,
            PacketBody::Data {
                item_guid: Some(item.clone()),
                content_type: SYNC_ITEM_CONTENT_TYPE.to_string(),
                payload: content,
            },
        );
        packet.destination_path = destination.clone();
        packet.forward_if_hive_match = false;
        packet.forward_if_no_hive_match = false;
        match ctx.route(packet).await {
            Ok(()) => pushed += 1,
            Err(e) => debug!("Push of item {item} failed: {e}"),
        }
    }
    debug!("Pushed {pushed}/{} items for hive '{hive}'", items.len());
    pushed
}

/// Start reconciling `hive` with one session, or with every neighbor.
pub async fn start_hive_sync(
    ctx: &dyn OverlayContext,
    hive: &str,
    target: Option<SessionId>,
) -> Result<(), OverlayError> {
    let Some(store) = ctx.hive_store() else {
        debug!("No hive store attached, skipping sync of '{hive}'");
        return Ok(());
    };
    let mut kickoff = Packet::synchro(hive);
    kickoff.sender = target;
    let local = store.item_guids(hive);
    let root = store.root_hash(hive);
    kickoff.reconcile(&local, &root, ctx).await.map(|_| ())
}

/// Kick off reconciliation of every registered hive over a new session.
pub(crate) async fn start_all_hive_syncs(ctx: &dyn OverlayContext, session: SessionId) {
    for hive in ctx.hives() {
        if let Err(e) = start_hive_sync(ctx, &hive, Some(session)).await {
            debug!("Sync kickoff for '{hive}' on session {session} failed: {e}");
        }
    }
}

/// Convenience for tests and simple hosts: shares one store between a node
/// and the code draining its inbox.
pub fn shared_memory_store() -> Arc<MemoryHiveStore> {
    Arc::new(MemoryHiveStore::new())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
