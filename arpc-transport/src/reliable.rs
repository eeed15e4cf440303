use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use arpc_proto::{
    AckKind, AckPacket, ConnectionKey, OwnedDataPacket, Packet, PacketTypeId, RpcId,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bitset::BitSet;
use crate::error::RpcError;
use crate::handler::{Handler, HandlerChains, Role};
use crate::timer::{TIMER_KEY_MSG_TIMEOUT_BASE, TIMER_KEY_RELIABLE_SWEEP_BASE, TimerManager};
use crate::transport::TransportSender;

/// Completed messages remembered per connection for duplicate detection.
/// Oldest records are evicted past this count, bounding memory on
/// long-lived connections.
const MAX_COMPLETED_MESSAGES: usize = 1024;

/// Reliable-transport handler configuration.
#[derive(Debug, Clone)]
pub struct ReliableConfig {
    /// Delay before an unacknowledged message is retransmitted.
    pub retransmit_timeout: Duration,
    /// Retransmission rounds before an unacknowledged message is
    /// abandoned and its buffered segments released.
    pub max_retransmits: u32,
    /// Idle time after which a peer's state is dropped.
    pub connection_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            retransmit_timeout: Duration::from_secs(1),
            max_retransmits: 30,
            connection_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// An outgoing message awaiting acknowledgment. `send_ts == None` is the
/// ACKed sentinel; an ACKed message keeps no segment copies.
struct MsgTx {
    count: u16,
    send_ts: Option<Instant>,
    dst: SocketAddr,
    packet_type: PacketTypeId,
    retransmit_count: u32,
    segments: BTreeMap<u16, OwnedDataPacket>,
}

/// Receive-side record for a message still assembling. On completion the
/// record migrates into the connection's bounded completed cache, which
/// keeps duplicate datagrams triggering ACK re-sends instead of
/// re-delivery.
struct RxMsg {
    seen: BitSet,
    total: u16,
    received: u16,
    kind: AckKind,
}

#[derive(Default)]
struct MsgEntry {
    tx: Option<MsgTx>,
    rx: Option<RxMsg>,
}

/// Recently completed incoming messages, capped by count and pruned by
/// age so one connection's history cannot grow without limit.
#[derive(Default)]
struct CompletedCache {
    order: VecDeque<(RpcId, Instant)>,
    kinds: HashMap<RpcId, AckKind>,
}

impl CompletedCache {
    fn kind(&self, rpc_id: RpcId) -> Option<AckKind> {
        self.kinds.get(&rpc_id).copied()
    }

    fn record(&mut self, rpc_id: RpcId, kind: AckKind, now: Instant) {
        if self.kinds.insert(rpc_id, kind).is_none() {
            self.order.push_back((rpc_id, now));
        }
        while self.order.len() > MAX_COMPLETED_MESSAGES {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.kinds.remove(&oldest);
            }
        }
    }

    fn prune(&mut self, now: Instant, keep_for: Duration) {
        while let Some(&(rpc_id, at)) = self.order.front() {
            if now.saturating_duration_since(at) < keep_for {
                break;
            }
            self.order.pop_front();
            self.kinds.remove(&rpc_id);
        }
    }
}

struct ConnState {
    addr: SocketAddr,
    last_activity: Mutex<Instant>,
    msgs: Mutex<HashMap<RpcId, Arc<Mutex<MsgEntry>>>>,
    completed: Mutex<CompletedCache>,
}

struct ReliableInner {
    role: Role,
    config: ReliableConfig,
    sender: Arc<TransportSender>,
    timers: Arc<TimerManager>,
    conns: Mutex<HashMap<ConnectionKey, Arc<ConnState>>>,
    /// Smallest ACK-derived round trip seen, microseconds. `u64::MAX`
    /// until the first sample.
    rtt_min_micros: AtomicU64,
}

/// Message-level reliability: ACKs on completion, duplicate detection, and
/// timer-driven retransmission from buffered segment copies.
///
/// The handler is symmetric: the client instance guards REQUEST sends and
/// RESPONSE receives, the server instance mirrors it, both over this one
/// implementation. Cloning is cheap and shares the underlying state.
#[derive(Clone)]
pub struct ReliableHandler {
    inner: Arc<ReliableInner>,
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl ReliableHandler {
    pub fn new(
        role: Role,
        sender: Arc<TransportSender>,
        timers: Arc<TimerManager>,
        config: ReliableConfig,
    ) -> Self {
        let inner = Arc::new(ReliableInner {
            role,
            config,
            sender,
            timers: timers.clone(),
            conns: Mutex::new(HashMap::new()),
            rtt_min_micros: AtomicU64::new(u64::MAX),
        });
        let weak: Weak<ReliableInner> = Arc::downgrade(&inner);
        let sweep_interval = inner.config.sweep_interval;
        timers.schedule_periodic(
            TIMER_KEY_RELIABLE_SWEEP_BASE + role.index(),
            sweep_interval,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.sweep(Instant::now());
                }
            },
        );
        Self { inner }
    }

    /// Registers this handler on the data and ACK chains for its role.
    pub fn register(&self, chains: &HandlerChains) {
        let role = self.inner.role;
        let handler: Arc<dyn Handler> = Arc::new(self.clone());
        chains.register(PacketTypeId::REQUEST, role, handler.clone());
        chains.register(PacketTypeId::RESPONSE, role, handler.clone());
        chains.register(PacketTypeId::ACK, role, handler);
    }

    /// Smallest round trip derived from ACK timestamps, if any ACK carried
    /// one yet.
    pub fn rtt_min(&self) -> Option<Duration> {
        match self.inner.rtt_min_micros.load(Ordering::Relaxed) {
            u64::MAX => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    /// Number of unACKed outgoing messages, for tests and diagnostics.
    pub fn outstanding(&self) -> usize {
        let conns: Vec<Arc<ConnState>> = self.inner.conns.lock().values().cloned().collect();
        conns
            .iter()
            .map(|conn| {
                let entries: Vec<Arc<Mutex<MsgEntry>>> =
                    conn.msgs.lock().values().cloned().collect();
                entries
                    .iter()
                    .filter(|e| e.lock().tx.as_ref().is_some_and(|tx| tx.send_ts.is_some()))
                    .count()
            })
            .sum()
    }

    /// Number of live per-RPC entries across all connections. Finished
    /// messages leave the map, so this tracks work in progress, not
    /// history.
    pub fn pending_entries(&self) -> usize {
        let conns: Vec<Arc<ConnState>> = self.inner.conns.lock().values().cloned().collect();
        conns.iter().map(|conn| conn.msgs.lock().len()).sum()
    }
}

impl ReliableInner {
    /// The data type this side transmits reliably.
    fn guarded_send_type(&self) -> PacketTypeId {
        match self.role {
            Role::Client => PacketTypeId::REQUEST,
            Role::Server => PacketTypeId::RESPONSE,
        }
    }

    /// The data type this side receives and acknowledges.
    fn guarded_receive_type(&self) -> PacketTypeId {
        match self.role {
            Role::Client => PacketTypeId::RESPONSE,
            Role::Server => PacketTypeId::REQUEST,
        }
    }

    /// ACK kind acknowledging what this side sends.
    fn guarded_ack_kind(&self) -> AckKind {
        match self.role {
            Role::Client => AckKind::Request,
            Role::Server => AckKind::Response,
        }
    }

    /// ACK kind this side emits for completed incoming messages.
    fn emitted_ack_kind(&self) -> AckKind {
        match self.role {
            Role::Client => AckKind::Response,
            Role::Server => AckKind::Request,
        }
    }

    fn connection(&self, peer: SocketAddr, now: Instant) -> Arc<ConnState> {
        let key = ConnectionKey::from_socket_addr(peer);
        self.conns
            .lock()
            .entry(key)
            .or_insert_with(|| {
                Arc::new(ConnState {
                    addr: peer,
                    last_activity: Mutex::new(now),
                    msgs: Mutex::new(HashMap::new()),
                    completed: Mutex::new(CompletedCache::default()),
                })
            })
            .clone()
    }

    fn entry(&self, conn: &ConnState, rpc_id: RpcId) -> Arc<Mutex<MsgEntry>> {
        conn.msgs
            .lock()
            .entry(rpc_id)
            .or_insert_with(|| Arc::new(Mutex::new(MsgEntry::default())))
            .clone()
    }

    /// Drops a message entry once neither direction needs it: the
    /// outgoing side is absent or acknowledged and the incoming side has
    /// migrated to the completed cache.
    fn maybe_remove_entry(&self, conn: &ConnState, rpc_id: RpcId, entry: &Arc<Mutex<MsgEntry>>) {
        let mut msgs = conn.msgs.lock();
        if let Some(current) = msgs.get(&rpc_id)
            && Arc::ptr_eq(current, entry)
        {
            let finished = {
                let entry = current.lock();
                entry.rx.is_none()
                    && entry.tx.as_ref().is_none_or(|tx| tx.send_ts.is_none())
            };
            if finished {
                msgs.remove(&rpc_id);
            }
        }
    }

    fn msg_timer_key(rpc_id: RpcId) -> u64 {
        TIMER_KEY_MSG_TIMEOUT_BASE.wrapping_add(rpc_id.0)
    }

    fn send_ack(&self, rpc_id: RpcId, kind: AckKind, peer: SocketAddr) {
        let ack = AckPacket {
            rpc_id,
            kind,
            status: 0,
            timestamp_micros: unix_micros(),
            message: b"",
        };
        // ACKs go straight out the socket: no chains, no fragmentation.
        if let Err(err) = self.sender.send_packet(&Packet::Ack(ack), peer) {
            warn!(%peer, %rpc_id, %err, "failed to send ack");
        }
    }

    fn on_data_sent(inner: &Arc<ReliableInner>, packet: &arpc_proto::DataPacket<'_>, peer: SocketAddr) {
        let now = Instant::now();
        let conn = inner.connection(peer, now);
        *conn.last_activity.lock() = now;
        let entry = inner.entry(&conn, packet.header.rpc_id);
        let mut entry = entry.lock();

        let is_new = entry.tx.is_none();
        let tx = entry.tx.get_or_insert_with(|| MsgTx {
            count: packet.header.total_packets,
            send_ts: Some(now),
            dst: peer,
            packet_type: packet.header.packet_type,
            retransmit_count: 0,
            segments: BTreeMap::new(),
        });
        tx.segments.insert(packet.header.seq_number, packet.to_owned());

        if is_new {
            let rpc_id = packet.header.rpc_id;
            let key = ConnectionKey::from_socket_addr(peer);
            let weak: Weak<ReliableInner> = Arc::downgrade(inner);
            inner.timers.schedule(
                Self::msg_timer_key(rpc_id),
                inner.config.retransmit_timeout,
                move || {
                    if let Some(inner) = weak.upgrade() {
                        ReliableInner::on_retransmit_timer(&inner, key, rpc_id);
                    }
                },
            );
        }
    }

    fn on_data_received(
        &self,
        packet: &arpc_proto::DataPacket<'_>,
        peer: SocketAddr,
    ) -> Result<(), RpcError> {
        let now = Instant::now();
        let rpc_id = packet.header.rpc_id;
        let kind = self.emitted_ack_kind();
        let conn = self.connection(peer, now);
        *conn.last_activity.lock() = now;

        if let Some(kind) = conn.completed.lock().kind(rpc_id) {
            // The peer kept sending, so our first ACK was lost.
            debug!(%rpc_id, %peer, "duplicate of completed message, re-acking");
            self.send_ack(rpc_id, kind, peer);
            return Err(RpcError::Duplicate);
        }

        let entry = self.entry(&conn, rpc_id);
        let completed_kind = {
            let mut entry = entry.lock();
            let total = packet.header.total_packets;
            let rx = entry.rx.get_or_insert_with(|| RxMsg {
                seen: BitSet::new(total as usize),
                total,
                received: 0,
                kind,
            });
            if rx.seen.set(packet.header.seq_number as usize) {
                rx.received += 1;
            }
            if rx.received == rx.total {
                // The finished record moves to the bounded completed
                // cache; keeping it in the entry map would grow state by
                // one record per RPC for the connection's lifetime.
                let kind = rx.kind;
                entry.rx = None;
                Some(kind)
            } else {
                None
            }
        };
        if let Some(kind) = completed_kind {
            conn.completed.lock().record(rpc_id, kind, now);
            self.send_ack(rpc_id, kind, peer);
            self.maybe_remove_entry(&conn, rpc_id, &entry);
        }
        Ok(())
    }

    fn on_ack_received(&self, ack: &AckPacket<'_>, peer: SocketAddr) {
        if ack.kind != self.guarded_ack_kind() {
            return;
        }
        let now = Instant::now();
        let key = ConnectionKey::from_socket_addr(peer);
        let Some(conn) = self.conns.lock().get(&key).cloned() else {
            return;
        };
        *conn.last_activity.lock() = now;
        let Some(entry) = conn.msgs.lock().get(&ack.rpc_id).cloned() else {
            return;
        };
        let acked = {
            let mut entry = entry.lock();
            match entry.tx.as_mut() {
                Some(tx) if tx.send_ts.is_some() => {
                    tx.segments.clear();
                    tx.send_ts = None;
                    debug!(
                        rpc_id = %ack.rpc_id,
                        packet_type = %tx.packet_type,
                        "message acked"
                    );
                    true
                }
                _ => false, // unknown or already ACKed
            }
        };
        if !acked {
            return;
        }
        self.timers.stop(Self::msg_timer_key(ack.rpc_id));
        self.maybe_remove_entry(&conn, ack.rpc_id, &entry);

        if self.role == Role::Client && ack.timestamp_micros > 0 {
            let rtt = unix_micros().saturating_sub(ack.timestamp_micros);
            self.rtt_min_micros.fetch_min(rtt, Ordering::Relaxed);
        }
    }

    fn on_retransmit_timer(inner: &Arc<ReliableInner>, key: ConnectionKey, rpc_id: RpcId) {
        let Some(conn) = inner.conns.lock().get(&key).cloned() else {
            return;
        };
        let Some(entry) = conn.msgs.lock().get(&rpc_id).cloned() else {
            return;
        };
        {
            let mut guard = entry.lock();
            let Some(tx) = guard.tx.as_mut() else {
                return;
            };
            if tx.send_ts.is_none() {
                return; // ACKed between fire and lock
            }
            if tx.retransmit_count >= inner.config.max_retransmits {
                // A message the peer never acknowledges must not keep a
                // retransmit loop alive on an otherwise healthy
                // connection.
                warn!(
                    %rpc_id,
                    attempts = tx.retransmit_count,
                    "abandoning unacknowledged message"
                );
                guard.tx = None;
            } else {
                // Buffered copies are serialized lazily, at resend time.
                debug!(
                    %rpc_id,
                    segments = tx.segments.len(),
                    total = tx.count,
                    "retransmitting message"
                );
                for packet in tx.segments.values() {
                    if let Err(err) = inner
                        .sender
                        .send_packet(&Packet::Data(packet.borrow()), tx.dst)
                    {
                        warn!(%rpc_id, %err, "retransmission send failed");
                    }
                }
                tx.send_ts = Some(Instant::now());
                tx.retransmit_count += 1;

                let weak: Weak<ReliableInner> = Arc::downgrade(inner);
                inner.timers.schedule(
                    Self::msg_timer_key(rpc_id),
                    inner.config.retransmit_timeout,
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            ReliableInner::on_retransmit_timer(&inner, key, rpc_id);
                        }
                    },
                );
                return;
            }
        }
        inner.maybe_remove_entry(&conn, rpc_id, &entry);
    }

    fn sweep(&self, now: Instant) {
        let timeout = self.config.connection_timeout;
        self.conns.lock().retain(|_, conn| {
            conn.completed.lock().prune(now, timeout);
            let fresh = now.saturating_duration_since(*conn.last_activity.lock()) < timeout;
            if !fresh {
                debug!(peer = %conn.addr, "reliable state expired");
            }
            fresh
        });
    }
}

impl Handler for ReliableHandler {
    fn on_send(&self, packet: &Packet<'_>, peer: SocketAddr) -> Result<(), RpcError> {
        if let Packet::Data(p) = packet
            && p.header.packet_type == self.inner.guarded_send_type()
        {
            ReliableInner::on_data_sent(&self.inner, p, peer);
        }
        Ok(())
    }

    fn on_receive(&self, packet: &Packet<'_>, peer: SocketAddr) -> Result<(), RpcError> {
        match packet {
            Packet::Data(p) if p.header.packet_type == self.inner.guarded_receive_type() => {
                self.inner.on_data_received(p, peer)
            }
            Packet::Ack(ack) => {
                self.inner.on_ack_received(ack, peer);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
