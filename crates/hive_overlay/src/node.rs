//! OverlayNode: top-level coordinator for the overlay.
//!
//! [`OverlayNode`] is the primary public API for hive_overlay. It owns:
//! - the TCP listener (incoming sessions)
//! - the connection manager loop (dialing and re-dialing endpoints)
//! - the content loop (sending queued packets, processing received ones)
//! - the session table, hive registry, packet queues and dedup cache
//!
//! All packet processing happens on the content loop, one packet at a time.
//! Sessions, the listener and spawned sends run concurrently and only touch
//! the node through short critical sections on its collections.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::codec::FrameCodec;
use crate::config::OverlayConfig;
use crate::dedup::HashQueue;
use crate::endpoint::Endpoint;
use crate::error::OverlayError;
use crate::identity::{NodeIdentity, PeerGuid, SessionId};
use crate::listener::{Listener, SessionFactory};
use crate::packet::{OverlayContext, Packet, PacketBody, PathHop, SendMode};
use crate::session::{Session, SessionOwner, SessionRole, SharedEndpoint};
use crate::sync::HiveStore;
use crate::version::VersionPolicy;

const TOPOLOGY_CHANNEL_CAPACITY: usize = 64;

/// Neighbor set changes, published to [`OverlayNode::subscribe_topology`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// A session finished its handshake.
    PeerConnected { session: SessionId, peer: PeerGuid },
    /// A previously connected session went away.
    PeerDisconnected {
        session: SessionId,
        peer: Option<PeerGuid>,
    },
}

/// What sessions hand to the content loop, in arrival order.
enum Inbound {
    Packet(Packet),
    Closed(SessionId),
}

/// The overlay node.
///
/// Create one per process. Call [`start()`](OverlayNode::start) to bind the
/// listener and launch the control loops, and [`close()`](OverlayNode::close)
/// to tear everything down. Cloning yields another handle to the same node.
#[derive(Clone)]
pub struct OverlayNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    self_weak: Weak<NodeInner>,
    identity: NodeIdentity,
    config: OverlayConfig,
    codec: FrameCodec,
    store: RwLock<Option<Arc<dyn HiveStore>>>,
    local_hop: RwLock<PathHop>,

    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    pending: Mutex<VecDeque<SharedEndpoint>>,
    hives: Mutex<BTreeSet<String>>,
    inbound: Mutex<VecDeque<Inbound>>,
    outbound: Mutex<VecDeque<Packet>>,
    inbox: Mutex<VecDeque<Packet>>,
    dedup: HashQueue,

    listener: Mutex<Option<Arc<Listener>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    wake: Notify,
    topology_tx: broadcast::Sender<TopologyEvent>,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
    closed: AtomicBool,
}

impl OverlayNode {
    /// Create a node. Nothing is bound or spawned until [`start`](Self::start).
    pub fn new(identity: NodeIdentity, config: OverlayConfig) -> Self {
        let local_hop = PathHop {
            host: config.listen_addr.ip().to_string(),
            port: config.listen_addr.port(),
            guid: identity.guid.clone(),
            version: identity.version.clone(),
        };
        let hives: BTreeSet<String> = config.seed_hives.iter().cloned().collect();
        let (topology_tx, _) = broadcast::channel(TOPOLOGY_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        let inner = Arc::new_cyclic(|self_weak| NodeInner {
            self_weak: self_weak.clone(),
            codec: FrameCodec::new(config.max_frame_size),
            dedup: HashQueue::new(config.dedup_capacity),
            store: RwLock::new(None),
            local_hop: RwLock::new(local_hop),
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            hives: Mutex::new(hives),
            inbound: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(VecDeque::new()),
            inbox: Mutex::new(VecDeque::new()),
            listener: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            wake: Notify::new(),
            topology_tx,
            shutdown_tx,
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            identity,
            config,
        });
        Self { inner }
    }

    /// Create a node with a fresh identity and default config.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(NodeIdentity::generate(name), OverlayConfig::default())
    }

    /// Attach the item store used to answer reconciliation.
    pub fn with_hive_store(self, store: Arc<dyn HiveStore>) -> Self {
        *self.inner.store.write() = Some(store);
        self
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.inner.config
    }

    pub fn guid(&self) -> &PeerGuid {
        &self.inner.identity.guid
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Bound listener address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().as_ref().map(|l| l.local_addr())
    }

    /// The hop this node appends to every packet it sends.
    pub fn local_hop(&self) -> PathHop {
        self.inner.local_hop.read().clone()
    }

    /// Bind the listener, queue the seed peers and launch both loops.
    pub async fn start(&self) -> Result<(), OverlayError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(OverlayError::NotRunning);
        }
        if inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let listener = match Listener::bind(inner.config.listen_addr).await {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                error!("Cannot bind {}: {e}", inner.config.listen_addr);
                inner.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let advertised = listener.local_endpoint();
        {
            let mut hop = inner.local_hop.write();
            hop.host = advertised.ip().to_string();
            hop.port = advertised.port();
        }
        listener.start(Arc::clone(inner) as Arc<dyn SessionFactory>);
        *inner.listener.lock() = Some(listener);

        for seed in &inner.config.seed_peers {
            match Endpoint::parse(seed) {
                Some(endpoint) => inner.queue_endpoint(endpoint),
                None => warn!("Ignoring malformed seed peer '{seed}'"),
            }
        }

        let connections = tokio::spawn(
            Arc::clone(inner).connection_loop(inner.shutdown_tx.subscribe()),
        );
        let content = tokio::spawn(Arc::clone(inner).content_loop(inner.shutdown_tx.subscribe()));
        inner.tasks.lock().extend([connections, content]);

        info!(
            "OverlayNode '{}' started (guid: {}, advertised as {advertised})",
            inner.identity.name, inner.identity.guid
        );
        Ok(())
    }

    /// Close every session, stop the listener and both loops. Idempotent;
    /// a closed node cannot be restarted.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.running.store(false, Ordering::SeqCst);
        let _ = inner.shutdown_tx.send(());

        let listener = inner.listener.lock().take();
        if let Some(listener) = listener {
            listener.close().await;
        }

        let sessions: Vec<Arc<Session>> = inner.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close(true).await;
        }

        let tasks = std::mem::take(&mut *inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        inner.pending.lock().clear();
        info!("OverlayNode '{}' stopped", inner.identity.name);
    }

    /// Subscribe to a hive. Returns false if already subscribed.
    pub fn register_hive(&self, hive_guid: impl Into<String>) -> bool {
        let hive_guid = hive_guid.into();
        let added = self.inner.hives.lock().insert(hive_guid.clone());
        if added {
            debug!("Registered hive '{hive_guid}'");
        }
        added
    }

    pub fn unregister_hive(&self, hive_guid: &str) -> bool {
        let removed = self.inner.hives.lock().remove(hive_guid);
        if removed {
            debug!("Unregistered hive '{hive_guid}'");
        }
        removed
    }

    pub fn hives(&self) -> Vec<String> {
        self.inner.hives.lock().iter().cloned().collect()
    }

    /// Queue a packet for sending on the next content tick. A packet with a
    /// destination path is source-routed, one with a `sender` goes out on
    /// that session only, anything else is flooded.
    pub fn enqueue(&self, packet: Packet) -> Result<(), OverlayError> {
        if !self.is_running() {
            return Err(OverlayError::NotRunning);
        }
        self.inner.outbound.lock().push_back(packet);
        Ok(())
    }

    /// Next packet delivered to this node, if any.
    pub fn dequeue(&self) -> Option<Packet> {
        self.inner.inbox.lock().pop_front()
    }

    /// Queue a connection attempt and wake the connection manager.
    pub fn connect(&self, host: impl Into<String>, port: u16) -> Result<(), OverlayError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OverlayError::NotRunning);
        }
        self.inner.queue_endpoint(Endpoint::new(host, port));
        Ok(())
    }

    /// Start reconciling `hive_guid` with every connected neighbor.
    pub fn synchronize_hive(&self, hive_guid: impl Into<String>) -> Result<(), OverlayError> {
        self.enqueue(Packet::synchro(hive_guid))
    }

    pub fn subscribe_topology(&self) -> broadcast::Receiver<TopologyEvent> {
        self.inner.topology_tx.subscribe()
    }

    /// GUIDs of peers with a completed handshake.
    pub fn connected_peers(&self) -> Vec<PeerGuid> {
        self.inner
            .connected_sessions(None)
            .iter()
            .filter_map(|s| s.peer_guid())
            .collect()
    }

    /// Sessions in any state except removed.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Endpoints waiting to be dialed.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Internal tasks
// ---------------------------------------------------------------------------

impl NodeInner {
    fn queue_endpoint(&self, endpoint: Endpoint) {
        let endpoint = endpoint.with_max_retries(self.config.max_retries);
        debug!("Queued connection to {endpoint}");
        self.pending.lock().push_back(Arc::new(Mutex::new(endpoint)));
        self.wake.notify_one();
    }

    fn requeue(&self, endpoint: SharedEndpoint) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        {
            let ep = endpoint.lock();
            if ep.is_exhausted() {
                info!("Giving up on {ep}");
                return;
            }
        }
        self.pending.lock().push_back(endpoint);
        self.wake.notify_one();
    }

    fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().get(&id).cloned()
    }

    fn connected_sessions(&self, except: Option<SessionId>) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.is_connected() && Some(s.id()) != except)
            .cloned()
            .collect()
    }

    /// Track and start a new session. Returns `None` once the node has
    /// closed; the check happens under the session table lock that `close`
    /// drains, so no session can slip in behind the drain.
    fn register_session(
        self: &Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        role: SessionRole,
        endpoint: SharedEndpoint,
    ) -> Option<Arc<Session>> {
        let session = Session::new(
            stream,
            remote_addr,
            role,
            endpoint,
            self.codec.clone(),
            self.config.send_timeout,
        );
        {
            let mut sessions = self.sessions.lock();
            if self.closed.load(Ordering::SeqCst) {
                debug!("Node closed, dropping {role:?} connection with {remote_addr}");
                return None;
            }
            sessions.insert(session.id(), Arc::clone(&session));
        }
        session.begin_receive(Arc::clone(self) as Arc<dyn SessionOwner>);
        debug!("Registered {role:?} session {} with {remote_addr}", session.id());
        Some(session)
    }

    /// Connection manager: dial due endpoints, then sleep until the next
    /// backoff check or until new work is queued.
    async fn connection_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let waiting = self.dial_due_endpoints();
            let pause = if waiting {
                self.config.retry_poll_interval
            } else {
                self.config.idle_poll_interval
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.wake.notified() => {}
                _ = shutdown.recv() => {
                    debug!("Connection loop shutting down");
                    break;
                }
            }
        }
    }

    /// Returns whether endpoints are still waiting out their backoff.
    fn dial_due_endpoints(self: &Arc<Self>) -> bool {
        let queued: Vec<SharedEndpoint> = self.pending.lock().drain(..).collect();
        let mut waiting = Vec::new();
        for endpoint in queued {
            let due = {
                let mut ep = endpoint.lock();
                if ep.is_exhausted() {
                    info!("Giving up on {ep}");
                    continue;
                }
                ep.should_connect_now()
            };
            if due {
                tokio::spawn(Arc::clone(self).dial(endpoint));
            } else {
                waiting.push(endpoint);
            }
        }
        let mut pending = self.pending.lock();
        pending.extend(waiting);
        !pending.is_empty()
    }

    async fn dial(self: Arc<Self>, endpoint: SharedEndpoint) {
        let address = endpoint.lock().address();
        let timeout = self.config.connect_timeout;
        trace!("Dialing {address}");

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Connect to {address} failed: {e}");
                self.requeue(endpoint);
                return;
            }
            Err(_) => {
                warn!("Connect to {address} failed: {}", OverlayError::Timeout(timeout));
                self.requeue(endpoint);
                return;
            }
        };
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let remote_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Connection to {address} lost before registration: {e}");
                self.requeue(endpoint);
                return;
            }
        };

        let Some(session) =
            self.register_session(stream, remote_addr, SessionRole::Client, endpoint)
        else {
            return;
        };
        if let Err(e) = self.send(session.id(), Packet::welcome(), SendMode::Sync).await {
            warn!("Handshake with {address} failed to start: {e}");
            session.close(false).await;
        }
    }

    /// Content loop: on every tick send what the application queued, then
    /// process what sessions received.
    async fn content_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(self.config.content_poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.drain_outbound().await;
                    self.drain_inbound().await;
                }
                _ = shutdown.recv() => {
                    debug!("Content loop shutting down");
                    break;
                }
            }
        }
    }

    async fn drain_outbound(&self) {
        loop {
            let Some(packet) = self.outbound.lock().pop_front() else {
                break;
            };
            self.dedup.enqueue(&packet.packet_guid);
            let guid = packet.packet_guid.clone();

            let result = if matches!(packet.body, PacketBody::Synchro { .. })
                && packet.is_locally_originated()
            {
                self.start_reconciliation(packet).await
            } else if !packet.destination_path.is_empty() {
                self.route(packet).await
            } else if let Some(session) = packet.sender {
                self.send(session, packet, SendMode::Async).await
            } else {
                let sent = self.flood(packet, None).await;
                trace!("Packet {guid} flooded to {sent} sessions");
                Ok(())
            };
            if let Err(e) = result {
                warn!("Outbound packet {guid} dropped: {e}");
            }
        }
    }

    async fn start_reconciliation(&self, packet: Packet) -> Result<(), OverlayError> {
        let Some(store) = self.hive_store() else {
            debug!("No hive store attached, skipping sync of '{}'", packet.hive_guid);
            return Ok(());
        };
        let local = store.item_guids(&packet.hive_guid);
        let root = store.root_hash(&packet.hive_guid);
        packet.reconcile(&local, &root, self).await.map(|_| ())
    }

    async fn drain_inbound(&self) {
        loop {
            let Some(next) = self.inbound.lock().pop_front() else {
                break;
            };
            match next {
                Inbound::Packet(packet) => self.process_inbound(packet).await,
                Inbound::Closed(session) => self.handle_session_closed(session).await,
            }
        }
    }

    /// Process one received packet unless it was seen before. Errors and
    /// panics are contained here.
    async fn process_inbound(&self, packet: Packet) {
        let guid = packet.packet_guid.clone();
        if self.dedup.contains(&guid) {
            trace!("Duplicate packet {guid} ignored");
            return;
        }

        let ctx: &dyn OverlayContext = self;
        match std::panic::AssertUnwindSafe(packet.process(ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Processing packet {guid} failed: {e}"),
            Err(_) => error!("Panic while processing packet {guid}"),
        }
        self.dedup.enqueue(&guid);
    }

    async fn handle_session_closed(&self, id: SessionId) {
        let Some(session) = self.sessions.lock().remove(&id) else {
            return;
        };
        session.close(false).await;

        if session.was_activated() {
            let peer = session.peer_guid();
            info!(
                "Session {id} with {} disconnected",
                peer.as_ref().map_or_else(|| "unknown peer".to_string(), |p| p.to_string())
            );
            let _ = self
                .topology_tx
                .send(TopologyEvent::PeerDisconnected { session: id, peer });
        }

        if session.role() != SessionRole::Client || !self.running.load(Ordering::SeqCst) {
            return;
        }
        let endpoint = Arc::clone(session.endpoint());
        {
            let mut ep = endpoint.lock();
            if session.was_activated() {
                if !ep.has_retries_left() {
                    debug!("No retries left for {ep}");
                    return;
                }
                ep.reset_retry_stats();
            } else if ep.is_exhausted() {
                debug!("Not redialing {ep}");
                return;
            }
            debug!("Re-queueing {ep}");
        }
        self.pending.lock().push_back(endpoint);
        self.wake.notify_one();
    }
}

impl SessionFactory for NodeInner {
    fn create_session(&self, stream: TcpStream, remote_addr: SocketAddr) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        if !this.running.load(Ordering::SeqCst) {
            return;
        }
        let endpoint = Endpoint::new(remote_addr.ip().to_string(), remote_addr.port());
        this.register_session(
            stream,
            remote_addr,
            SessionRole::Server,
            Arc::new(Mutex::new(endpoint)),
        );
    }
}

impl SessionOwner for NodeInner {
    fn on_packet(&self, session: SessionId, mut packet: Packet) {
        packet.receiver = Some(session);
        self.inbound.lock().push_back(Inbound::Packet(packet));
    }

    fn on_closed(&self, session: SessionId) {
        self.inbound.lock().push_back(Inbound::Closed(session));
    }
}

#[async_trait]
impl OverlayContext for NodeInner {
    fn local_hop(&self) -> PathHop {
        self.local_hop.read().clone()
    }

    fn is_handshaken(&self, session: SessionId) -> bool {
        self.session(session).is_some_and(|s| s.is_connected())
    }

    fn session_role(&self, session: SessionId) -> Option<SessionRole> {
        self.session(session).map(|s| s.role())
    }

    fn has_hive(&self, hive_guid: &str) -> bool {
        self.hives.lock().contains(hive_guid)
    }

    fn hives(&self) -> Vec<String> {
        self.hives.lock().iter().cloned().collect()
    }

    fn version_policy(&self) -> VersionPolicy {
        self.config.version_policy.clone()
    }

    fn hive_store(&self) -> Option<Arc<dyn HiveStore>> {
        self.store.read().clone()
    }

    async fn send(
        &self,
        session: SessionId,
        mut packet: Packet,
        mode: SendMode,
    ) -> Result<(), OverlayError> {
        let target = self
            .session(session)
            .ok_or_else(|| OverlayError::PeerNotFound(session.to_string()))?;
        packet.stamp(self.local_hop());
        // Handshakes never travel past one hop, and a self-connect has to see
        // its own Welcome arrive.
        if !matches!(packet.body, PacketBody::Welcome { .. }) {
            self.dedup.enqueue(&packet.packet_guid);
        }
        match mode {
            SendMode::Sync => target.send(&packet).await,
            SendMode::Async => {
                target.send_async(packet);
                Ok(())
            }
        }
    }

    async fn route(&self, mut packet: Packet) -> Result<(), OverlayError> {
        if packet.destination_path.is_empty() {
            return Err(OverlayError::Protocol(format!(
                "packet {} has no destination to route to",
                packet.packet_guid
            )));
        }
        let next = packet.destination_path.remove(0);
        let target = self
            .connected_sessions(None)
            .into_iter()
            .find(|s| s.peer_guid().as_ref() == Some(&next))
            .ok_or_else(|| OverlayError::PeerNotFound(next.to_string()))?;
        trace!("Routing packet {} to {next}", packet.packet_guid);
        self.send(target.id(), packet, SendMode::Async).await
    }

    async fn flood(&self, mut packet: Packet, except: Option<SessionId>) -> usize {
        let targets = self.connected_sessions(except);
        if targets.is_empty() {
            return 0;
        }
        packet.stamp(self.local_hop());
        self.dedup.enqueue(&packet.packet_guid);
        for target in &targets {
            target.send_async(packet.clone());
        }
        targets.len()
    }

    fn deliver(&self, packet: Packet) {
        trace!("Delivered packet {} to inbox", packet.packet_guid);
        self.inbox.lock().push_back(packet);
    }

    async fn activate(&self, session: SessionId, peer: &PathHop) {
        let Some(target) = self.session(session) else {
            return;
        };
        target.set_peer(peer);
        if target.activate() {
            info!(
                "Session {session} with {} ({}) connected",
                peer.guid,
                target.remote_addr()
            );
            let _ = self.topology_tx.send(TopologyEvent::PeerConnected {
                session,
                peer: peer.guid.clone(),
            });
        }
    }

    async fn close_session(&self, session: SessionId, suppress_retry: bool) {
        if let Some(target) = self.session(session) {
            target.close(suppress_retry).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
