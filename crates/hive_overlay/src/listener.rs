//! TCP listener: accepts incoming peer connections.
//!
//! The accept loop runs on its own task and hands every accepted stream to a
//! [`SessionFactory`]. A failed accept is logged and the loop keeps going;
//! only [`Listener::close`] stops it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::OverlayError;

/// Pause after a failed accept so a persistent error (fd exhaustion) does
/// not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Turns an accepted stream into a session. Implemented by the node.
pub trait SessionFactory: Send + Sync {
    fn create_session(&self, stream: TcpStream, remote_addr: SocketAddr);
}

pub struct Listener {
    local_addr: SocketAddr,
    socket: Mutex<Option<TcpListener>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, OverlayError> {
        let socket = TcpListener::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        info!("Listening for peers on {local_addr}");
        Ok(Self {
            local_addr,
            socket: Mutex::new(Some(socket)),
            task: Mutex::new(None),
            shutdown_tx,
        })
    }

    /// The bound address, with the real port when bound to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address other peers should use to reach us. Best effort: when bound
    /// to a wildcard address the outbound interface is guessed and loopback
    /// is used if that fails.
    pub fn local_endpoint(&self) -> SocketAddr {
        if !self.local_addr.ip().is_unspecified() {
            return self.local_addr;
        }
        SocketAddr::new(outbound_ip(), self.local_addr.port())
    }

    /// Spawn the accept loop. Only the first call has an effect.
    pub fn start(&self, factory: Arc<dyn SessionFactory>) {
        let Some(socket) = self.socket.lock().take() else {
            debug!("Listener on {} already started", self.local_addr);
            return;
        };
        let mut shutdown = self.shutdown_tx.subscribe();
        let local_addr = self.local_addr;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = socket.accept() => match accepted {
                        Ok((stream, remote)) => {
                            debug!("Accepted connection from {remote}");
                            factory.create_session(stream, remote);
                        }
                        Err(e) => {
                            error!("Accept on {local_addr} failed: {e}");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    },
                    _ = shutdown.recv() => {
                        debug!("Listener on {local_addr} shutting down");
                        break;
                    }
                }
            }
        });
        *self.task.lock() = Some(handle);
    }

    /// Stop accepting and release the port.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(());
        drop(self.socket.lock().take());
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Local address of the interface used for outbound traffic. No packet is
/// sent: connecting a UDP socket only selects a route.
fn outbound_ip() -> IpAddr {
    let route_lookup = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    match route_lookup() {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
