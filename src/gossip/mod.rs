//! SWIM-style gossip membership with delegate-driven state replication.
//!
//! One UDP socket carries probes (ping/ack), death notices, and
//! application broadcasts; a TCP listener on the same port serves the
//! periodic anti-entropy push/pull, where both sides exchange their
//! membership table and the delegate's full local state.

pub mod broadcast;
pub mod member;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{CronError, Result};

pub use broadcast::BroadcastQueue;
pub use member::{Member, MemberInfo, MemberState};
use member::Membership;

/// Application hooks the gossip layer calls into. The delegate must be
/// constructed before the gossip layer so the callbacks are live from the
/// first exchange.
pub trait Delegate: Send + Sync + 'static {
    /// Serialize the full local state for anti-entropy push/pull.
    fn local_state(&self, join: bool) -> Vec<u8>;
    /// Merge a peer's full state, called during anti-entropy.
    fn merge_remote_state(&self, buf: &[u8], join: bool);
    /// Drain pending broadcasts, up to `limit` bytes with `overhead` bytes
    /// of packet framing per message.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;
    /// Deliver a broadcast payload received from a peer.
    fn notify_msg(&self, buf: &[u8]);
}

const MAX_PACKET_SIZE: usize = 1400;
const PACKET_OVERHEAD: usize = 32;
const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub node_name: String,
    pub bind_addr: SocketAddr,
    pub advertise_addr: SocketAddr,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub gossip_interval: Duration,
    pub push_pull_interval: Duration,
    pub fanout: usize,
    pub retransmit_mult: u32,
}

impl GossipConfig {
    /// Timings for a local-area network.
    pub fn lan(node_name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr,
            advertise_addr: derive_advertise(bind_addr),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            gossip_interval: Duration::from_millis(200),
            push_pull_interval: Duration::from_secs(30),
            fanout: 3,
            retransmit_mult: 4,
        }
    }

    /// Conservative timings for crossing the open internet.
    pub fn wan(node_name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            gossip_interval: Duration::from_millis(500),
            push_pull_interval: Duration::from_secs(60),
            fanout: 4,
            ..Self::lan(node_name, bind_addr)
        }
    }

    /// Aggressive timings for loopback clusters.
    pub fn local(node_name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(200),
            gossip_interval: Duration::from_millis(100),
            push_pull_interval: Duration::from_secs(15),
            fanout: 3,
            ..Self::lan(node_name, bind_addr)
        }
    }

    pub fn with_advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.advertise_addr = addr;
        self
    }
}

fn derive_advertise(bind: SocketAddr) -> SocketAddr {
    if bind.ip().is_unspecified() {
        SocketAddr::new("127.0.0.1".parse().unwrap(), bind.port())
    } else {
        bind
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Packet {
    Ping { seq: u64, from: MemberInfo },
    Ack { seq: u64 },
    Dead { name: String },
    User { payload: Vec<u8> },
}

#[derive(Serialize, Deserialize)]
struct PushPull {
    from: MemberInfo,
    members: Vec<MemberInfo>,
    state: Vec<u8>,
    join: bool,
}

struct GossipInner {
    config: GossipConfig,
    membership: Membership,
    delegate: Arc<dyn Delegate>,
    socket: UdpSocket,
    pending_acks: Mutex<std::collections::HashMap<u64, oneshot::Sender<()>>>,
    seq: AtomicU64,
    cancel: CancellationToken,
}

/// Handle to a running gossip member. Cheap to clone.
#[derive(Clone)]
pub struct Gossip {
    inner: Arc<GossipInner>,
}

impl Gossip {
    pub async fn new(
        config: GossipConfig,
        delegate: Arc<dyn Delegate>,
        cluster_size: Arc<AtomicUsize>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let listener = TcpListener::bind(config.bind_addr).await?;

        let local = MemberInfo {
            name: config.node_name.clone(),
            addr: config.advertise_addr,
        };
        tracing::info!(name = %local.name, addr = %local.addr, "gossip member starting");

        let inner = Arc::new(GossipInner {
            membership: Membership::new(local, cluster_size),
            delegate,
            socket,
            pending_acks: Mutex::new(std::collections::HashMap::new()),
            seq: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            config,
        });

        let gossip = Self { inner };
        gossip.spawn_udp_loop();
        gossip.spawn_tcp_loop(listener);
        gossip.spawn_probe_loop();
        gossip.spawn_gossip_loop();
        gossip.spawn_push_pull_loop();
        Ok(gossip)
    }

    pub fn local_name(&self) -> &str {
        &self.inner.membership.local().name
    }

    pub fn members(&self) -> Vec<Member> {
        self.inner.membership.snapshot()
    }

    /// Push/pull with each seed to enter the cluster. Returns how many
    /// seeds answered; errors only when seeds were given and none did.
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        let mut joined = 0;
        for seed in seeds {
            let addr: SocketAddr = match seed.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    tracing::warn!(seed = %seed, "invalid seed address");
                    continue;
                }
            };
            match self.inner.push_pull(addr, true).await {
                Ok(()) => joined += 1,
                Err(e) => tracing::warn!(seed = %seed, error = %e, "seed join failed"),
            }
        }
        if joined == 0 && !seeds.is_empty() {
            return Err(CronError::Gossip("no seed could be reached".to_string()));
        }
        Ok(joined)
    }

    /// Best-effort leave notice, then stop all background tasks.
    pub async fn shutdown(&self) {
        let name = self.local_name().to_string();
        let notice = Packet::Dead { name };
        for peer in self.inner.membership.alive_peers() {
            self.inner.send_packet(&notice, peer.addr).await;
        }
        self.inner.cancel.cancel();
    }

    fn spawn_udp_loop(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                tokio::select! {
                    res = inner.socket.recv_from(&mut buf) => match res {
                        Ok((len, src)) => inner.handle_packet(&buf[..len], src).await,
                        Err(e) => {
                            tracing::error!(error = %e, "udp receive failed");
                            break;
                        }
                    },
                    _ = inner.cancel.cancelled() => break,
                }
            }
        });
    }

    fn spawn_tcp_loop(&self, listener: TcpListener) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = listener.accept() => match res {
                        Ok((stream, peer)) => {
                            let inner = inner.clone();
                            tokio::spawn(async move {
                                if let Err(e) = inner.handle_push_pull(stream).await {
                                    tracing::warn!(peer = %peer, error = %e, "push/pull exchange failed");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "tcp accept failed");
                            break;
                        }
                    },
                    _ = inner.cancel.cancelled() => break,
                }
            }
        });
    }

    fn spawn_probe_loop(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => inner.probe_random_peer().await,
                    _ = inner.cancel.cancelled() => break,
                }
            }
        });
    }

    fn spawn_gossip_loop(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.gossip_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => inner.gossip_broadcasts().await,
                    _ = inner.cancel.cancelled() => break,
                }
            }
        });
    }

    fn spawn_push_pull_loop(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.push_pull_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh node
            // doesn't sync with itself before joining.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(peer) = inner.random_peer() {
                            if let Err(e) = inner.push_pull(peer.addr, false).await {
                                tracing::warn!(peer = %peer.name, error = %e, "anti-entropy exchange failed");
                            }
                        }
                    }
                    _ = inner.cancel.cancelled() => break,
                }
            }
        });
    }
}

impl GossipInner {
    async fn handle_packet(&self, buf: &[u8], src: SocketAddr) {
        let packet: Packet = match serde_json::from_slice(buf) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(src = %src, error = %e, "dropping undecodable packet");
                return;
            }
        };

        match packet {
            Packet::Ping { seq, from } => {
                if self.membership.note_alive(from) {
                    tracing::debug!(src = %src, "member discovered by ping");
                }
                self.send_packet(&Packet::Ack { seq }, src).await;
            }
            Packet::Ack { seq } => {
                let sender = self.pending_acks.lock().unwrap().remove(&seq);
                if let Some(sender) = sender {
                    let _ = sender.send(());
                }
            }
            Packet::Dead { name } => {
                if self.membership.note_dead(&name) {
                    tracing::info!(member = %name, "member reported dead");
                }
            }
            Packet::User { payload } => self.delegate.notify_msg(&payload),
        }
    }

    async fn send_packet(&self, packet: &Packet, to: SocketAddr) {
        match serde_json::to_vec(packet) {
            Ok(buf) => {
                if let Err(e) = self.socket.send_to(&buf, to).await {
                    tracing::debug!(to = %to, error = %e, "udp send failed");
                }
            }
            Err(e) => tracing::error!(error = %e, "packet encode failed"),
        }
    }

    fn random_peer(&self) -> Option<MemberInfo> {
        let peers = self.membership.alive_peers();
        peers.choose(&mut rand::thread_rng()).cloned()
    }

    async fn probe_random_peer(&self) {
        let Some(peer) = self.random_peer() else {
            return;
        };

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().unwrap().insert(seq, tx);

        let ping = Packet::Ping {
            seq,
            from: self.membership.local().clone(),
        };
        self.send_packet(&ping, peer.addr).await;

        let acked = tokio::time::timeout(self.config.probe_timeout, rx)
            .await
            .is_ok();
        if !acked {
            self.pending_acks.lock().unwrap().remove(&seq);
            if self.membership.note_dead(&peer.name) {
                tracing::warn!(member = %peer.name, "probe timed out, declaring dead");
                let notice = Packet::Dead {
                    name: peer.name.clone(),
                };
                for other in self.membership.alive_peers() {
                    self.send_packet(&notice, other.addr).await;
                }
            }
        }
    }

    async fn gossip_broadcasts(&self) {
        let msgs = self
            .delegate
            .get_broadcasts(PACKET_OVERHEAD, MAX_PACKET_SIZE);
        if msgs.is_empty() {
            return;
        }

        let mut peers = self.membership.alive_peers();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(self.config.fanout);

        for msg in msgs {
            let packet = Packet::User { payload: msg };
            for peer in &peers {
                self.send_packet(&packet, peer.addr).await;
            }
        }
    }

    async fn push_pull(&self, addr: SocketAddr, join: bool) -> Result<()> {
        let mut stream = TcpStream::connect(addr).await?;

        let frame = PushPull {
            from: self.membership.local().clone(),
            members: self.membership.alive_peers(),
            state: self.delegate.local_state(join),
            join,
        };
        write_frame(&mut stream, &frame).await?;
        let remote: PushPull = read_frame(&mut stream).await?;
        self.merge_push_pull(remote);
        Ok(())
    }

    async fn handle_push_pull(&self, mut stream: TcpStream) -> Result<()> {
        let remote: PushPull = read_frame(&mut stream).await?;
        let reply = PushPull {
            from: self.membership.local().clone(),
            members: self.membership.alive_peers(),
            state: self.delegate.local_state(remote.join),
            join: remote.join,
        };
        write_frame(&mut stream, &reply).await?;
        self.merge_push_pull(remote);
        Ok(())
    }

    fn merge_push_pull(&self, remote: PushPull) {
        let join = remote.join;
        if self.membership.note_alive(remote.from.clone()) {
            tracing::info!(member = %remote.from.name, "member joined");
        }
        for info in remote.members {
            if self.membership.note_alive(info.clone()) {
                tracing::info!(member = %info.name, "member learned via anti-entropy");
            }
        }
        self.delegate.merge_remote_state(&remote.state, join);
    }
}

async fn write_frame<T: Serialize>(stream: &mut TcpStream, frame: &T) -> Result<()> {
    let buf = serde_json::to_vec(frame)?;
    stream.write_all(&(buf.len() as u32).to_be_bytes()).await?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut TcpStream) -> Result<T> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(CronError::Gossip(format!("oversized frame: {len} bytes")));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}
