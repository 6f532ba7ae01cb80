//! SWIM-style cluster membership over UDP.
//!
//! Each node periodically probes a random peer; a missed ack triggers
//! indirect probes through other peers, then suspicion, then — after the
//! suspicion timeout — a death notice. State changes gossip with
//! incarnation numbers so a suspected node can refute by re-announcing
//! itself with a higher incarnation.
//!
//! The layer surfaces exactly two things to the injected [`Handler`]:
//! a peer becoming alive (`join`, with its advertised RPC address) and a
//! peer departing or failing (`leave`). Self events are suppressed, and a
//! handler error never stops the dispatcher.

use crate::config::{GossipConfig, RPC_ADDR_TAG};
use crate::error::{ClusterError, Result};
use crate::node::{Member, MemberState, MemberStatus};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// HMAC-SHA256 tag length appended to authenticated datagrams.
const HMAC_TAG_LEN: usize = 32;

/// Departed members linger this long so stale gossip cannot resurrect
/// them as fresh joins.
const REMOVAL_DELAY: Duration = Duration::from_secs(5);

/// Receives membership notifications. Implementations must tolerate
/// duplicate joins for the same peer across reconnect cycles.
pub trait Handler: Send + Sync + 'static {
    fn join(&self, name: &str, rpc_addr: &str) -> Result<()>;
    fn leave(&self, name: &str) -> Result<()>;
}

/// Internal event stream from the gossip state machine to the dispatcher.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Joined {
        name: String,
        rpc_addr: Option<String>,
    },
    Left {
        name: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum GossipMessage {
    /// Direct liveness check.
    Ping { from: String, incarnation: u64 },
    /// Answer to a ping, direct or relayed.
    Ack { from: String, incarnation: u64 },
    /// Ask the receiver to probe `target` on our behalf.
    PingReq { from: String, target: String },
    /// A node announcing itself.
    Join { member: MemberState },
    /// Full state exchange.
    Sync {
        from: String,
        members: Vec<MemberState>,
    },
    /// Graceful departure.
    Leave { name: String, incarnation: u64 },
    /// Someone missed probes on this node.
    Suspect { name: String, incarnation: u64 },
    /// Refutation of a suspicion.
    Alive { name: String, incarnation: u64 },
    /// Confirmed failure.
    Dead { name: String, incarnation: u64 },
}

/// Gossip membership over one UDP socket.
pub struct Membership {
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: GossipConfig,
    local_addr: SocketAddr,
    incarnation: AtomicU64,
    members: Arc<DashMap<String, Member>>,
    pending_pings: DashMap<String, Instant>,
    /// (requester, target) -> requester address, for relaying acks of
    /// indirect probes.
    pending_ping_reqs: DashMap<(String, String), (SocketAddr, Instant)>,
    socket: UdpSocket,
    event_tx: mpsc::UnboundedSender<MembershipEvent>,
}

impl Membership {
    /// Bind the gossip socket, start the protocol tasks, and contact the
    /// configured seed addresses.
    pub async fn start(config: GossipConfig, handler: Arc<dyn Handler>) -> Result<Membership> {
        if config.node_name.is_empty() {
            return Err(ClusterError::InvalidConfig("node_name is required".into()));
        }
        if !config.tags.contains_key(RPC_ADDR_TAG) {
            warn!(
                node = %config.node_name,
                "no {RPC_ADDR_TAG} tag; peers cannot replicate from this node"
            );
        }

        let socket = UdpSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            local_addr,
            incarnation: AtomicU64::new(0),
            members: Arc::new(DashMap::new()),
            pending_pings: DashMap::new(),
            pending_ping_reqs: DashMap::new(),
            socket,
            event_tx,
            config,
        });

        // We are always a member of our own cluster.
        inner.members.insert(
            inner.config.node_name.clone(),
            Member::new(inner.local_state()),
        );

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(dispatch_events(event_rx, handler)));
        tasks.push(tokio::spawn(run_receiver(Arc::clone(&inner))));
        tasks.push(tokio::spawn(run_prober(Arc::clone(&inner))));
        tasks.push(tokio::spawn(run_syncer(Arc::clone(&inner))));

        if let Err(e) = inner.join_seeds().await {
            for task in &tasks {
                task.abort();
            }
            return Err(e);
        }

        info!(node = %inner.config.node_name, %local_addr, "membership started");
        Ok(Membership { inner, tasks })
    }

    /// The bound gossip address; with port 0 this is how peers learn it.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Snapshot of every known member, self included.
    pub fn members(&self) -> Vec<MemberState> {
        self.inner
            .members
            .iter()
            .map(|entry| entry.value().state.clone())
            .collect()
    }

    /// Announce a graceful departure to every reachable member.
    pub async fn leave(&self) -> Result<()> {
        let msg = GossipMessage::Leave {
            name: self.inner.config.node_name.clone(),
            incarnation: self.inner.incarnation.load(Ordering::SeqCst),
        };
        self.inner.broadcast(&msg).await;
        info!(node = %self.inner.config.node_name, "announced leave");
        Ok(())
    }

    /// Leave the cluster and stop all protocol tasks.
    pub async fn shutdown(self) -> Result<()> {
        self.leave().await?;
        for task in &self.tasks {
            task.abort();
        }
        Ok(())
    }

    /// Stop without announcing departure. Peers will detect the silence
    /// and declare this node failed; used to exercise the failure path.
    pub fn abort(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Inner {
    fn local_state(&self) -> MemberState {
        MemberState {
            name: self.config.node_name.clone(),
            gossip_addr: self.local_addr,
            tags: self.config.tags.clone(),
            status: MemberStatus::Alive,
            incarnation: self.incarnation.load(Ordering::SeqCst),
        }
    }

    fn is_local(&self, name: &str) -> bool {
        name == self.config.node_name
    }

    async fn join_seeds(&self) -> Result<()> {
        if self.config.start_join_addrs.is_empty() {
            return Ok(());
        }

        let join = GossipMessage::Join {
            member: self.local_state(),
        };
        let mut contacted = false;

        for seed in &self.config.start_join_addrs {
            let addr: SocketAddr = match seed.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    warn!(%seed, "invalid seed address");
                    continue;
                }
            };
            if addr == self.local_addr {
                continue;
            }
            match self.send(&join, addr).await {
                Ok(()) => {
                    debug!(%seed, "sent join to seed");
                    contacted = true;
                }
                Err(e) => warn!(%seed, error = %e, "failed to contact seed"),
            }
        }

        if !contacted {
            return Err(ClusterError::JoinFailed(
                "could not contact any seed node".into(),
            ));
        }
        Ok(())
    }

    async fn send(&self, msg: &GossipMessage, addr: SocketAddr) -> Result<()> {
        let data = postcard::to_allocvec(msg)?;
        let packet = self.sign(&data);
        self.socket.send_to(&packet, addr).await?;
        Ok(())
    }

    async fn broadcast(&self, msg: &GossipMessage) {
        let targets: Vec<(String, SocketAddr)> = self
            .members
            .iter()
            .filter(|e| !self.is_local(e.key()) && e.value().is_reachable())
            .map(|e| (e.key().clone(), e.value().state.gossip_addr))
            .collect();

        for (name, addr) in targets {
            if let Err(e) = self.send(msg, addr).await {
                debug!(peer = %name, error = %e, "broadcast send failed");
            }
        }
    }

    /// Append an HMAC-SHA256 tag when an auth token is configured.
    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let Some(token) = &self.config.auth_token else {
            return data.to_vec();
        };
        let mut mac = Hmac::<Sha256>::new_from_slice(token.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(data);
        let tag = mac.finalize().into_bytes();

        let mut signed = Vec::with_capacity(data.len() + HMAC_TAG_LEN);
        signed.extend_from_slice(data);
        signed.extend_from_slice(&tag);
        signed
    }

    /// Verify and strip the HMAC tag. Returns the payload on success.
    fn verify<'a>(&self, data: &'a [u8]) -> std::result::Result<&'a [u8], &'static str> {
        let Some(token) = &self.config.auth_token else {
            return Ok(data);
        };
        if data.len() < HMAC_TAG_LEN {
            return Err("datagram too short for HMAC tag");
        }
        let (payload, tag) = data.split_at(data.len() - HMAC_TAG_LEN);
        let mut mac = Hmac::<Sha256>::new_from_slice(token.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(payload);
        mac.verify_slice(tag).map_err(|_| "HMAC verification failed")?;
        Ok(payload)
    }

    async fn handle_message(&self, msg: GossipMessage, from_addr: SocketAddr) {
        trace!(?msg, %from_addr, "gossip message");
        match msg {
            GossipMessage::Ping { from, .. } => self.handle_ping(&from, from_addr).await,
            GossipMessage::Ack { from, incarnation } => self.handle_ack(&from, incarnation).await,
            GossipMessage::PingReq { from, target } => {
                self.handle_ping_req(from, target, from_addr).await
            }
            GossipMessage::Join { member } => self.handle_join(member).await,
            GossipMessage::Sync { members, .. } => {
                for state in members {
                    self.merge_state(state);
                }
            }
            GossipMessage::Leave { name, .. } => self.handle_leave(&name),
            GossipMessage::Suspect { name, incarnation } => {
                self.handle_suspect(&name, incarnation).await
            }
            GossipMessage::Alive { name, incarnation } => self.handle_alive(&name, incarnation),
            GossipMessage::Dead { name, incarnation } => self.handle_dead(&name, incarnation),
        }
    }

    async fn handle_ping(&self, from: &str, from_addr: SocketAddr) {
        let ack = GossipMessage::Ack {
            from: self.config.node_name.clone(),
            incarnation: self.incarnation.load(Ordering::SeqCst),
        };
        if let Err(e) = self.send(&ack, from_addr).await {
            debug!(peer = from, error = %e, "failed to ack ping");
        }

        if let Some(mut member) = self.members.get_mut(from) {
            member.touch();
        }
    }

    async fn handle_ack(&self, from: &str, incarnation: u64) {
        self.pending_pings.remove(from);

        // Relay the ack to anyone who asked us to probe this node.
        let relays: Vec<((String, String), SocketAddr)> = self
            .pending_ping_reqs
            .iter()
            .filter(|e| e.key().1 == from)
            .map(|e| (e.key().clone(), e.value().0))
            .collect();
        for (key, requester_addr) in relays {
            let ack = GossipMessage::Ack {
                from: from.to_string(),
                incarnation,
            };
            let _ = self.send(&ack, requester_addr).await;
            self.pending_ping_reqs.remove(&key);
        }

        if let Some(mut member) = self.members.get_mut(from) {
            if member.state.status == MemberStatus::Suspect {
                debug!(peer = from, "suspect answered, marking alive");
            }
            let new_incarnation = incarnation.max(member.state.incarnation);
            member.mark_alive(new_incarnation);
        }
    }

    async fn handle_ping_req(&self, from: String, target: String, from_addr: SocketAddr) {
        let Some(target_addr) = self
            .members
            .get(&target)
            .map(|m| m.state.gossip_addr)
        else {
            return;
        };

        let ping = GossipMessage::Ping {
            from: self.config.node_name.clone(),
            incarnation: self.incarnation.load(Ordering::SeqCst),
        };
        if self.send(&ping, target_addr).await.is_ok() {
            self.pending_ping_reqs
                .insert((from, target), (from_addr, Instant::now()));
        }
    }

    async fn handle_join(&self, member: MemberState) {
        if self.is_local(&member.name) {
            return;
        }

        let is_new = !self.members.contains_key(&member.name);
        let gossip_addr = member.gossip_addr;

        if is_new {
            info!(peer = %member.name, %gossip_addr, "member joined");
            self.emit_joined(&member);
            self.members
                .insert(member.name.clone(), Member::new(member.clone()));

            // Disseminate the newcomer to everyone else...
            self.broadcast(&GossipMessage::Join {
                member: member.clone(),
            })
            .await;
        } else if let Some(mut existing) = self.members.get_mut(&member.name) {
            existing.state.tags = member.tags.clone();
            existing.state.gossip_addr = gossip_addr;
            existing.touch();
        }

        // ...and answer with everything we know so the newcomer catches up.
        let sync = GossipMessage::Sync {
            from: self.config.node_name.clone(),
            members: self.members.iter().map(|e| e.value().state.clone()).collect(),
        };
        if let Err(e) = self.send(&sync, gossip_addr).await {
            debug!(peer = %member.name, error = %e, "failed to sync joiner");
        }
    }

    /// Fold one gossiped member state into our view, gated on incarnation
    /// so stale news never overrides fresher observations.
    fn merge_state(&self, state: MemberState) {
        if self.is_local(&state.name) {
            return;
        }

        match self.members.get_mut(&state.name) {
            Some(mut member) => {
                let newer = state.incarnation > member.state.incarnation;
                let as_new = state.incarnation >= member.state.incarnation;
                let was_reachable = member.is_reachable();

                match state.status {
                    MemberStatus::Alive if newer => member.mark_alive(state.incarnation),
                    MemberStatus::Suspect
                        if as_new && member.state.status == MemberStatus::Alive =>
                    {
                        member.mark_suspect()
                    }
                    MemberStatus::Dead if as_new => {
                        member.mark_dead();
                        if was_reachable {
                            drop(member);
                            self.emit_left(&state.name);
                        }
                    }
                    MemberStatus::Leaving if as_new => {
                        member.mark_leaving();
                        if was_reachable {
                            drop(member);
                            self.emit_left(&state.name);
                        }
                    }
                    _ => {}
                }
            }
            None if state.status.is_reachable() => {
                info!(peer = %state.name, "member discovered via sync");
                self.emit_joined(&state);
                self.members
                    .insert(state.name.clone(), Member::new(state));
            }
            None => {}
        }
    }

    fn handle_leave(&self, name: &str) {
        if self.is_local(name) {
            return;
        }
        let Some(mut member) = self.members.get_mut(name) else {
            return;
        };
        if !member.is_reachable() {
            return;
        }
        member.mark_leaving();
        drop(member);

        info!(peer = name, "member left");
        self.emit_left(name);
        self.schedule_removal(name.to_string());
    }

    async fn handle_suspect(&self, name: &str, incarnation: u64) {
        // A suspicion about us is refuted with a fresher incarnation.
        if self.is_local(name) {
            let current = self.incarnation.load(Ordering::SeqCst);
            if incarnation >= current {
                let next = incarnation + 1;
                self.incarnation.store(next, Ordering::SeqCst);
                debug!(incarnation = next, "refuting suspicion");
                self.broadcast(&GossipMessage::Alive {
                    name: self.config.node_name.clone(),
                    incarnation: next,
                })
                .await;
            }
            return;
        }

        if let Some(mut member) = self.members.get_mut(name) {
            if incarnation >= member.state.incarnation
                && member.state.status == MemberStatus::Alive
            {
                member.mark_suspect();
                debug!(peer = name, "member suspected");
            }
        }
    }

    fn handle_alive(&self, name: &str, incarnation: u64) {
        if self.is_local(name) {
            return;
        }
        if let Some(mut member) = self.members.get_mut(name) {
            if incarnation > member.state.incarnation {
                member.mark_alive(incarnation);
            }
        }
    }

    fn handle_dead(&self, name: &str, incarnation: u64) {
        if self.is_local(name) {
            // Dead rumors about us are refuted by the next suspicion cycle.
            return;
        }
        let Some(mut member) = self.members.get_mut(name) else {
            return;
        };
        if incarnation >= member.state.incarnation && member.is_reachable() {
            member.mark_dead();
            drop(member);
            info!(peer = name, "member declared dead");
            self.emit_left(name);
            self.schedule_removal(name.to_string());
        }
    }

    /// One failure-detection round: probe a random reachable peer, fall
    /// back to indirect probes, then suspect. Also expires suspects and
    /// stale indirect-probe bookkeeping.
    async fn probe_round(&self) {
        if let Some((name, addr)) = self.select_probe_target() {
            let ping = GossipMessage::Ping {
                from: self.config.node_name.clone(),
                incarnation: self.incarnation.load(Ordering::SeqCst),
            };
            if self.send(&ping, addr).await.is_ok() {
                self.pending_pings.insert(name.clone(), Instant::now());
                tokio::time::sleep(self.config.probe_timeout).await;

                if self.pending_pings.contains_key(&name) {
                    self.send_indirect_probes(&name).await;
                    tokio::time::sleep(self.config.probe_timeout * 2).await;

                    if self.pending_pings.remove(&name).is_some() {
                        self.suspect(&name).await;
                    }
                }
            }
        }

        self.expire_suspects().await;

        let stale = self.config.probe_timeout * 8;
        self.pending_ping_reqs
            .retain(|_, value| value.1.elapsed() < stale);
    }

    fn select_probe_target(&self) -> Option<(String, SocketAddr)> {
        use rand::seq::IteratorRandom;

        self.members
            .iter()
            .filter(|e| !self.is_local(e.key()) && e.value().is_reachable())
            .map(|e| (e.key().clone(), e.value().state.gossip_addr))
            .choose(&mut rand::thread_rng())
    }

    async fn send_indirect_probes(&self, target: &str) {
        use rand::seq::IteratorRandom;

        let intermediaries: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|e| {
                !self.is_local(e.key())
                    && e.key() != target
                    && e.value().state.status == MemberStatus::Alive
            })
            .map(|e| e.value().state.gossip_addr)
            .choose_multiple(&mut rand::thread_rng(), self.config.indirect_probes);

        let ping_req = GossipMessage::PingReq {
            from: self.config.node_name.clone(),
            target: target.to_string(),
        };
        for addr in intermediaries {
            let _ = self.send(&ping_req, addr).await;
        }
    }

    async fn suspect(&self, name: &str) {
        let incarnation = match self.members.get_mut(name) {
            Some(mut member) if member.state.status == MemberStatus::Alive => {
                member.mark_suspect();
                member.state.incarnation
            }
            _ => return,
        };

        warn!(peer = name, "no ack, suspecting member");
        self.broadcast(&GossipMessage::Suspect {
            name: name.to_string(),
            incarnation,
        })
        .await;
    }

    async fn expire_suspects(&self) {
        let timeout = self.config.suspicion_timeout();
        let now = Instant::now();

        let expired: Vec<(String, u64)> = self
            .members
            .iter()
            .filter(|e| {
                e.value().state.status == MemberStatus::Suspect
                    && now.duration_since(e.value().last_seen) > timeout
            })
            .map(|e| (e.key().clone(), e.value().state.incarnation))
            .collect();

        for (name, incarnation) in expired {
            if let Some(mut member) = self.members.get_mut(&name) {
                member.mark_dead();
            }
            warn!(peer = %name, "suspicion timeout, declaring dead");
            self.emit_left(&name);
            self.schedule_removal(name.clone());
            self.broadcast(&GossipMessage::Dead { name, incarnation }).await;
        }
    }

    fn emit_joined(&self, state: &MemberState) {
        let rpc_addr = state.tags.get(RPC_ADDR_TAG).cloned();
        if rpc_addr.is_none() {
            warn!(peer = %state.name, "joined without an {RPC_ADDR_TAG} tag");
        }
        let _ = self.event_tx.send(MembershipEvent::Joined {
            name: state.name.clone(),
            rpc_addr,
        });
    }

    fn emit_left(&self, name: &str) {
        let _ = self.event_tx.send(MembershipEvent::Left {
            name: name.to_string(),
        });
    }

    fn schedule_removal(&self, name: String) {
        let members = Arc::clone(&self.members);
        tokio::spawn(async move {
            tokio::time::sleep(REMOVAL_DELAY).await;
            members.remove(&name);
        });
    }
}

/// Deliver membership events to the handler. Handler errors are logged
/// and the loop continues; a failing handler must not stall membership.
async fn dispatch_events(
    mut event_rx: mpsc::UnboundedReceiver<MembershipEvent>,
    handler: Arc<dyn Handler>,
) {
    while let Some(event) = event_rx.recv().await {
        match event {
            MembershipEvent::Joined { name, rpc_addr } => {
                let Some(rpc_addr) = rpc_addr else {
                    continue;
                };
                if let Err(e) = handler.join(&name, &rpc_addr) {
                    warn!(peer = %name, error = %e, "handler join failed");
                }
            }
            MembershipEvent::Left { name } => {
                if let Err(e) = handler.leave(&name) {
                    warn!(peer = %name, error = %e, "handler leave failed");
                }
            }
        }
    }
}

async fn run_receiver(inner: Arc<Inner>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, from_addr) = match inner.socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "gossip socket recv failed");
                continue;
            }
        };

        let payload = match inner.verify(&buf[..len]) {
            Ok(p) => p,
            Err(reason) => {
                warn!(%from_addr, reason, "dropping unauthenticated datagram");
                continue;
            }
        };

        let msg: GossipMessage = match postcard::from_bytes(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(%from_addr, error = %e, "undecodable gossip datagram");
                continue;
            }
        };

        inner.handle_message(msg, from_addr).await;
    }
}

async fn run_prober(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(inner.config.probe_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        inner.probe_round().await;
    }
}

async fn run_syncer(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(inner.config.sync_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Some((_, addr)) = inner.select_probe_target() {
            let sync = GossipMessage::Sync {
                from: inner.config.node_name.clone(),
                members: inner
                    .members
                    .iter()
                    .map(|e| e.value().state.clone())
                    .collect(),
            };
            let _ = inner.send(&sync, addr).await;
        }
    }
}
