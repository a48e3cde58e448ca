//! Packet model and per-variant processing.
//!
//! Every packet carries the same routing header (hive, hop budget, forward
//! flags, recorded origin path, optional source route) plus a variant body.
//! [`Packet::process`] is the single entry point the content loop calls for
//! each distinct packet; the variant decides whether it is a handshake step,
//! a reconciliation step or ordinary routed data.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::OverlayError;
use crate::identity::{PeerGuid, SessionId};
use crate::session::SessionRole;
use crate::sync::{self, HiveStore};
use crate::version::{PeerVersion, SupportCode, VersionPolicy, VersionVerdict};

/// Hop budget of a freshly created packet.
pub const DEFAULT_HOPS_TO_LIVE: u32 = 15;

/// Extra hops granted each time a packet reaches a peer subscribed to its
/// hive. Fixed so that clients cannot inflate it.
pub const HIVE_MATCH_GAIN: u32 = 3;

/// One traversed hop, appended by each sender before the packet leaves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathHop {
    pub host: String,
    pub port: u16,
    pub guid: PeerGuid,
    pub version: PeerVersion,
}

/// Variant-specific content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PacketBody {
    /// Handshake. `support` is `None` on the opening message and carries the
    /// server's verdict on the completion message.
    Welcome {
        support: Option<SupportCode>,
        #[serde(default)]
        link: String,
        #[serde(default)]
        message: String,
    },
    /// Hive reconciliation. Which optional field is populated selects the leg.
    Synchro {
        root_hash: Option<String>,
        request_list: Option<Vec<String>>,
        /// Items the sender of this leg lacks.
        response_list: Option<Vec<String>>,
    },
    /// Opaque application content.
    Data {
        item_guid: Option<String>,
        content_type: String,
        payload: String,
    },
}

impl PacketBody {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Synchro { .. } => "synchro",
            Self::Data { .. } => "data",
        }
    }
}

/// A routed overlay message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub packet_guid: String,
    pub hive_guid: String,
    pub hops_to_live: u32,
    pub forward_if_hive_match: bool,
    pub forward_if_no_hive_match: bool,
    /// Oldest hop first.
    pub origin_path: Vec<PathHop>,
    /// Remaining source route, consumed front to back.
    pub destination_path: Vec<PeerGuid>,
    /// For locally created packets: the one session it should leave through.
    #[serde(skip)]
    pub sender: Option<SessionId>,
    /// For received packets: the session it arrived on.
    #[serde(skip)]
    pub receiver: Option<SessionId>,
    pub body: PacketBody,
}

impl Packet {
    pub fn new(hive_guid: impl Into<String>, body: PacketBody) -> Self {
        Self {
            packet_guid: uuid::Uuid::new_v4().to_string(),
            hive_guid: hive_guid.into(),
            hops_to_live: DEFAULT_HOPS_TO_LIVE,
            forward_if_hive_match: true,
            forward_if_no_hive_match: true,
            origin_path: Vec::new(),
            destination_path: Vec::new(),
            sender: None,
            receiver: None,
            body,
        }
    }

    /// Application content flooded through the hive.
    pub fn data(
        hive_guid: impl Into<String>,
        content_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self::new(
            hive_guid,
            PacketBody::Data {
                item_guid: None,
                content_type: content_type.into(),
                payload: payload.into(),
            },
        )
    }

    /// Opening handshake message.
    pub fn welcome() -> Self {
        Self::new(
            String::new(),
            PacketBody::Welcome {
                support: None,
                link: String::new(),
                message: String::new(),
            },
        )
    }

    /// Server's completion of the handshake.
    pub fn welcome_reply(verdict: VersionVerdict) -> Self {
        Self::new(
            String::new(),
            PacketBody::Welcome {
                support: Some(verdict.code),
                link: verdict.link,
                message: verdict.message,
            },
        )
    }

    /// Empty reconciliation request for `hive_guid`. Never flooded further
    /// than one hop.
    pub fn synchro(hive_guid: impl Into<String>) -> Self {
        let mut packet = Self::new(
            hive_guid,
            PacketBody::Synchro {
                root_hash: None,
                request_list: None,
                response_list: None,
            },
        );
        packet.hops_to_live = 1;
        packet.forward_if_hive_match = false;
        packet.forward_if_no_hive_match = false;
        packet
    }

    /// A new packet for the same hive, source-routed back along the path
    /// this one travelled. Relays never flood it.
    pub fn reply(&self, body: PacketBody) -> Self {
        let mut reply = Self::new(self.hive_guid.clone(), body);
        reply.destination_path = self.path_to_origin().into_iter().map(|h| h.guid).collect();
        reply.forward_if_hive_match = false;
        reply.forward_if_no_hive_match = false;
        reply
    }

    /// Origin path, newest hop first.
    pub fn path_to_origin(&self) -> Vec<PathHop> {
        self.origin_path.iter().rev().cloned().collect()
    }

    /// The neighbor that handed us this packet.
    pub fn previous_hop(&self) -> Option<&PathHop> {
        self.origin_path.last()
    }

    pub fn is_locally_originated(&self) -> bool {
        self.origin_path.is_empty()
    }

    /// Append the sending node's hop. Called once per send or flood.
    pub fn stamp(&mut self, hop: PathHop) {
        self.origin_path.push(hop);
    }

    /// Handle this packet on behalf of the node behind `ctx`.
    pub async fn process(self, ctx: &dyn OverlayContext) -> Result<(), OverlayError> {
        trace!(
            "Processing {} packet {} (hive '{}', ttl {})",
            self.body.kind_name(),
            self.packet_guid,
            self.hive_guid,
            self.hops_to_live
        );
        match self.body {
            PacketBody::Welcome { .. } => self.process_welcome(ctx).await,
            PacketBody::Synchro { .. } => sync::process_synchro(self, ctx).await,
            PacketBody::Data { .. } => self.route_default(ctx).await,
        }
    }

    /// Shared routing: source route if a destination path remains, otherwise
    /// deliver on hive match and flood while hops and forward flags allow.
    pub async fn route_default(mut self, ctx: &dyn OverlayContext) -> Result<(), OverlayError> {
        let Some(receiver) = self.receiver else {
            return Err(OverlayError::Protocol(
                "routed packet without a receiving session".into(),
            ));
        };
        if !ctx.is_handshaken(receiver) {
            debug!(
                "Dropping packet {} from session {receiver}: handshake incomplete",
                self.packet_guid
            );
            return Ok(());
        }

        if !self.destination_path.is_empty() {
            return ctx.route(self).await;
        }

        // An exhausted packet is still delivered but never revived by the gain.
        let expired = self.hops_to_live == 0;
        let matched = ctx.has_hive(&self.hive_guid);
        if matched {
            if !expired {
                self.hops_to_live = self.hops_to_live.saturating_add(HIVE_MATCH_GAIN);
            }
            ctx.deliver(self.clone());
        }
        self.hops_to_live = self.hops_to_live.saturating_sub(1);

        let allowed = if matched {
            self.forward_if_hive_match
        } else {
            self.forward_if_no_hive_match
        };
        if !expired && self.hops_to_live > 0 && allowed {
            let sent = ctx.flood(self, Some(receiver)).await;
            trace!("Forwarded to {sent} sessions");
        }
        Ok(())
    }

    async fn process_welcome(self, ctx: &dyn OverlayContext) -> Result<(), OverlayError> {
        let PacketBody::Welcome { support, .. } = &self.body else {
            return Ok(());
        };
        let support = *support;
        let Some(session) = self.receiver else {
            return Err(OverlayError::Protocol("welcome without receiving session".into()));
        };
        let Some(peer) = self.previous_hop().cloned() else {
            ctx.close_session(session, true).await;
            return Err(OverlayError::Protocol(format!(
                "welcome on session {session} carries no origin hop"
            )));
        };
        let local = ctx.local_hop();

        match (ctx.session_role(session), support) {
            (Some(SessionRole::Server), None) => {
                if peer.guid == local.guid {
                    info!("Session {session} is a connection to ourselves, closing");
                    let notice = Packet::welcome_reply(VersionVerdict {
                        code: SupportCode::Unsupported,
                        link: String::new(),
                        message: "connected to self".into(),
                    });
                    let _ = ctx.send(session, notice, SendMode::Sync).await;
                    ctx.close_session(session, true).await;
                    return Ok(());
                }

                let verdict = ctx.version_policy().evaluate(&peer.version);
                let code = verdict.code;
                debug!("Peer {} version {} evaluated as {code}", peer.guid, peer.version);
                ctx.send(session, Packet::welcome_reply(verdict), SendMode::Sync)
                    .await?;
                if code == SupportCode::Unsupported {
                    info!("Refused peer {} (version {})", peer.guid, peer.version);
                } else {
                    ctx.activate(session, &peer).await;
                }
                Ok(())
            }
            (Some(SessionRole::Client), Some(code)) => {
                match code {
                    SupportCode::Unsupported => {
                        warn!("Peer {} refused our version: {code}", peer.guid);
                        ctx.close_session(session, true).await;
                        if peer.guid != local.guid {
                            ctx.deliver(self);
                        }
                    }
                    SupportCode::Supported => {
                        ctx.activate(session, &peer).await;
                        sync::start_all_hive_syncs(ctx, session).await;
                    }
                    SupportCode::Deprecated | SupportCode::Unknown => {
                        warn!("Peer {} reports our version as {code}", peer.guid);
                        ctx.activate(session, &peer).await;
                        ctx.deliver(self);
                        sync::start_all_hive_syncs(ctx, session).await;
                    }
                }
                Ok(())
            }
            (Some(role), _) => {
                debug!("Ignoring out-of-sequence welcome on {role:?} session {session}");
                Ok(())
            }
            (None, _) => {
                debug!("Welcome for unknown session {session}");
                Ok(())
            }
        }
    }
}

/// How a unicast send is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Written before the call returns; ordered with other synchronous sends.
    Sync,
    /// Handed to a spawned task; no ordering guarantee.
    Async,
}

/// Capabilities a packet needs from the node processing it.
#[async_trait]
pub trait OverlayContext: Send + Sync {
    /// This node's own hop, appended to origin paths on every send.
    fn local_hop(&self) -> PathHop;

    /// Whether the session exists and finished the handshake.
    fn is_handshaken(&self, session: SessionId) -> bool;

    fn session_role(&self, session: SessionId) -> Option<SessionRole>;

    fn has_hive(&self, hive_guid: &str) -> bool;

    fn hives(&self) -> Vec<String>;

    fn version_policy(&self) -> VersionPolicy;

    fn hive_store(&self) -> Option<Arc<dyn HiveStore>>;

    /// Stamp and unicast to one session.
    async fn send(
        &self,
        session: SessionId,
        packet: Packet,
        mode: SendMode,
    ) -> Result<(), OverlayError>;

    /// Pop the next hop off the destination path and unicast to the
    /// connected session with that GUID.
    async fn route(&self, packet: Packet) -> Result<(), OverlayError>;

    /// Stamp and send to every connected session except `except`. Returns
    /// the number of sessions the packet was handed to.
    async fn flood(&self, packet: Packet, except: Option<SessionId>) -> usize;

    /// Hand a packet to the application inbox.
    fn deliver(&self, packet: Packet);

    /// Complete the handshake: record the peer's identity and mark connected.
    async fn activate(&self, session: SessionId, peer: &PathHop);

    async fn close_session(&self, session: SessionId, suppress_retry: bool);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
