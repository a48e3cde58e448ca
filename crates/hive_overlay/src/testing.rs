//! In-memory [`OverlayContext`] for exercising packet logic without sockets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::OverlayError;
use crate::identity::{PeerGuid, SessionId};
use crate::packet::{OverlayContext, Packet, PathHop, SendMode};
use crate::session::SessionRole;
use crate::sync::HiveStore;
use crate::version::VersionPolicy;

pub(crate) fn hop(guid: &str) -> PathHop {
    PathHop {
        host: "127.0.0.1".into(),
        port: 9470,
        guid: PeerGuid::from_string(guid),
        version: "1.0".parse().unwrap(),
    }
}

pub(crate) struct MockContext {
    hop: PathHop,
    policy: VersionPolicy,
    store: Option<Arc<dyn HiveStore>>,
    hives: Mutex<HashSet<String>>,
    roles: Mutex<HashMap<SessionId, SessionRole>>,
    handshaken: Mutex<HashSet<SessionId>>,
    links: Mutex<HashMap<PeerGuid, SessionId>>,
    sent: Mutex<Vec<(SessionId, Packet, SendMode)>>,
    flooded: Mutex<Vec<(Packet, Option<SessionId>)>>,
    delivered: Mutex<Vec<Packet>>,
    activated: Mutex<Vec<(SessionId, PeerGuid)>>,
    closed: Mutex<Vec<(SessionId, bool)>>,
}

impl MockContext {
    pub(crate) fn new(guid: &str) -> Self {
        Self {
            hop: hop(guid),
            policy: VersionPolicy::default(),
            store: None,
            hives: Mutex::default(),
            roles: Mutex::default(),
            handshaken: Mutex::default(),
            links: Mutex::default(),
            sent: Mutex::default(),
            flooded: Mutex::default(),
            delivered: Mutex::default(),
            activated: Mutex::default(),
            closed: Mutex::default(),
        }
    }

    pub(crate) fn with_policy(mut self, policy: VersionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub(crate) fn with_store(mut self, store: Arc<dyn HiveStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub(crate) fn add_hive(&self, hive: &str) {
        self.hives.lock().insert(hive.to_string());
    }

    pub(crate) fn set_role(&self, session: SessionId, role: SessionRole) {
        self.roles.lock().insert(session, role);
    }

    pub(crate) fn handshake(&self, session: SessionId, role: SessionRole) {
        self.set_role(session, role);
        self.handshaken.lock().insert(session);
    }

    /// Make `session` the route to the peer with `guid`.
    pub(crate) fn link(&self, session: SessionId, guid: &str) {
        self.links.lock().insert(PeerGuid::from_string(guid), session);
    }

    pub(crate) fn take_sent(&self) -> Vec<(SessionId, Packet, SendMode)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub(crate) fn flooded(&self) -> Vec<(Packet, Option<SessionId>)> {
        self.flooded.lock().clone()
    }

    pub(crate) fn delivered(&self) -> Vec<Packet> {
        self.delivered.lock().clone()
    }

    pub(crate) fn drain_delivered(&self) -> Vec<Packet> {
        std::mem::take(&mut *self.delivered.lock())
    }

    pub(crate) fn activated(&self) -> Vec<(SessionId, PeerGuid)> {
        self.activated.lock().clone()
    }

    pub(crate) fn closed(&self) -> Vec<(SessionId, bool)> {
        self.closed.lock().clone()
    }
}

#[async_trait]
impl OverlayContext for MockContext {
    fn local_hop(&self) -> PathHop {
        self.hop.clone()
    }

    fn is_handshaken(&self, session: SessionId) -> bool {
        self.handshaken.lock().contains(&session)
    }

    fn session_role(&self, session: SessionId) -> Option<SessionRole> {
        self.roles.lock().get(&session).copied()
    }

    fn has_hive(&self, hive_guid: &str) -> bool {
        self.hives.lock().contains(hive_guid)
    }

    fn hives(&self) -> Vec<String> {
        let mut hives: Vec<String> = self.hives.lock().iter().cloned().collect();
        hives.sort();
        hives
    }

    fn version_policy(&self) -> VersionPolicy {
        self.policy.clone()
    }

    fn hive_store(&self) -> Option<Arc<dyn HiveStore>> {
        self.store.clone()
    }

    async fn send(
        &self,
        session: SessionId,
        mut packet: Packet,
        mode: SendMode,
    ) -> Result<(), OverlayError> {
        packet.stamp(self.hop.clone());
        self.sent.lock().push((session, packet, mode));
        Ok(())
    }

    async fn route(&self, mut packet: Packet) -> Result<(), OverlayError> {
        if packet.destination_path.is_empty() {
            return Err(OverlayError::Protocol("empty destination path".into()));
        }
        let next = packet.destination_path.remove(0);
        let session = self
            .links
            .lock()
            .get(&next)
            .copied()
            .ok_or_else(|| OverlayError::PeerNotFound(next.to_string()))?;
        self.send(session, packet, SendMode::Async).await
    }

    async fn flood(&self, mut packet: Packet, except: Option<SessionId>) -> usize {
        packet.stamp(self.hop.clone());
        self.flooded.lock().push((packet, except));
        1
    }

    fn deliver(&self, packet: Packet) {
        self.delivered.lock().push(packet);
    }

    async fn activate(&self, session: SessionId, peer: &PathHop) {
        self.handshaken.lock().insert(session);
        self.activated.lock().push((session, peer.guid.clone()));
    }

    async fn close_session(&self, session: SessionId, suppress_retry: bool) {
        self.closed.lock().push((session, suppress_retry));
    }
}
