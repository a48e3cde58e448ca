//! Session: one duplex TCP connection to a neighbor.
//!
//! The read half is driven by a spawned task that feeds a [`FrameReader`]
//! and reports decoded packets (and the end of the stream) to the owning
//! node. The write half sits behind an async mutex so synchronous sends are
//! written in call order; asynchronous sends are spawned and may interleave.
//! Every write is bounded by the send timeout and abandoned as soon as the
//! session closes, so a peer that stops reading cannot hold up its owner.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::codec::{FrameCodec, FrameReader};
use crate::endpoint::Endpoint;
use crate::error::OverlayError;
use crate::identity::{PeerGuid, SessionId};
use crate::packet::{Packet, PathHop};

const READ_CHUNK: usize = 8 * 1024;

/// How long `close` waits for an in-flight write to let go of the write half.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Endpoint shared between a session and the reconnect queue.
pub type SharedEndpoint = Arc<Mutex<Endpoint>>;

/// Which side opened the connection. Fixed for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// We dialed out; we open the handshake and we retry on loss.
    Client,
    /// We accepted; we answer the handshake.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Receives what a session's read loop produces.
pub trait SessionOwner: Send + Sync {
    fn on_packet(&self, session: SessionId, packet: Packet);

    /// Called exactly once, after the read loop has stopped for any reason.
    fn on_closed(&self, session: SessionId);
}

pub struct Session {
    id: SessionId,
    role: SessionRole,
    remote_addr: SocketAddr,
    status: Mutex<SessionStatus>,
    activated: AtomicBool,
    endpoint: SharedEndpoint,
    codec: FrameCodec,
    send_timeout: Duration,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Session {
    pub fn new(
        stream: TcpStream,
        remote_addr: SocketAddr,
        role: SessionRole,
        endpoint: SharedEndpoint,
        codec: FrameCodec,
        send_timeout: Duration,
    ) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            id: SessionId::generate(),
            role,
            remote_addr,
            status: Mutex::new(SessionStatus::Connecting),
            activated: AtomicBool::new(false),
            endpoint,
            codec,
            send_timeout,
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            shutdown_tx,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Connected
    }

    pub fn endpoint(&self) -> &SharedEndpoint {
        &self.endpoint
    }

    pub fn peer_guid(&self) -> Option<PeerGuid> {
        self.endpoint.lock().peer_guid.clone()
    }

    /// Record the identity the peer announced during the handshake.
    pub fn set_peer(&self, hop: &PathHop) {
        let mut endpoint = self.endpoint.lock();
        endpoint.peer_guid = Some(hop.guid.clone());
        endpoint.peer_version = Some(hop.version.clone());
    }

    /// `Connecting → Connected`. Returns false if the session was not
    /// connecting (already active or closed).
    pub fn activate(&self) -> bool {
        let mut status = self.status.lock();
        if *status != SessionStatus::Connecting {
            return false;
        }
        *status = SessionStatus::Connected;
        self.activated.store(true, Ordering::SeqCst);
        true
    }

    /// Whether the handshake ever completed, even if closed since.
    pub fn was_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    /// Start the read loop. Has no effect after the first call.
    pub fn begin_receive(self: &Arc<Self>, owner: Arc<dyn SessionOwner>) {
        let Some(mut half) = self.reader.lock().take() else {
            return;
        };
        let mut shutdown = self.shutdown_tx.subscribe();
        let session = Arc::clone(self);

        tokio::spawn(async move {
            let id = session.id;
            let mut frames = FrameReader::new(session.codec.clone());
            let mut buf = vec![0u8; READ_CHUNK];

            if session.status() != SessionStatus::Disconnected {
                loop {
                    tokio::select! {
                        read = half.read(&mut buf) => match read {
                            Ok(0) => {
                                debug!("Session {id} closed by {}", session.remote_addr);
                                break;
                            }
                            Ok(n) => match frames.push(&buf[..n]) {
                                Ok(packets) => {
                                    for packet in packets {
                                        trace!("Session {id} received {}", packet.packet_guid);
                                        owner.on_packet(id, packet);
                                    }
                                }
                                Err(e) => {
                                    warn!("Protocol error on session {id}, closing: {e}");
                                    break;
                                }
                            },
                            Err(e) => {
                                debug!("Read error on session {id}: {e}");
                                break;
                            }
                        },
                        _ = shutdown.recv() => {
                            trace!("Session {id} read loop cancelled");
                            break;
                        }
                    }
                }
            }

            owner.on_closed(id);
        });
    }

    /// Encode and write one packet before returning. Ordered with respect
    /// to other `send` calls on this session. A write still blocked after
    /// the send timeout closes the session.
    pub async fn send(&self, packet: &Packet) -> Result<(), OverlayError> {
        // Subscribe before the status check so a concurrent close is seen.
        let mut shutdown = self.shutdown_tx.subscribe();
        if self.status() == SessionStatus::Disconnected {
            return Err(OverlayError::SessionClosed(self.id));
        }
        let frame = self.codec.encode_frame(packet)?;

        let outcome = tokio::select! {
            outcome = tokio::time::timeout(self.send_timeout, self.write_frame(&frame)) => outcome,
            _ = shutdown.recv() => return Err(OverlayError::SessionClosed(self.id)),
        };
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Write to {} on session {} stalled for {:?}, closing",
                    self.remote_addr, self.id, self.send_timeout
                );
                self.close(false).await;
                Err(OverlayError::Timeout(self.send_timeout))
            }
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), OverlayError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(OverlayError::SessionClosed(self.id));
        };
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Fire-and-forget send on a spawned task.
    pub fn send_async(self: &Arc<Self>, packet: Packet) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = session.send(&packet).await {
                debug!(
                    "Async send of {} on session {} failed: {e}",
                    packet.packet_guid, session.id
                );
            }
        });
    }

    /// Close the connection. Returns true only for the call that actually
    /// moved the session to `Disconnected`. Retry suppression is applied
    /// even when the session was already closed.
    ///
    /// Pending writes are cancelled first. The write half is then shut down
    /// if it can be reclaimed within a short grace period; otherwise it is
    /// released when the session itself is dropped.
    pub async fn close(&self, suppress_retry: bool) -> bool {
        if suppress_retry {
            self.endpoint.lock().suppress_retry();
        }
        {
            let mut status = self.status.lock();
            if *status == SessionStatus::Disconnected {
                return false;
            }
            *status = SessionStatus::Disconnected;
        }
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(CLOSE_GRACE, self.writer.lock()).await {
            Ok(mut guard) => {
                let writer = guard.take();
                drop(guard);
                if let Some(mut writer) = writer {
                    let _ = tokio::time::timeout(CLOSE_GRACE, writer.shutdown()).await;
                }
            }
            Err(_) => debug!("Session {} write half still busy at close", self.id),
        }
        debug!("Session {} to {} closed", self.id, self.remote_addr);
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote_addr", &self.remote_addr)
            .field("status", &self.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
