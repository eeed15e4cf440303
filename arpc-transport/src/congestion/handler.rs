use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arpc_proto::codec::CC_FEEDBACK_HEADER_LEN;
use arpc_proto::{CcFeedbackPacket, ConnectionKey, Packet, PacketId};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{CongestionControl, CubicSender};
use crate::error::RpcError;
use crate::handler::{Handler, HandlerChains, Role};
use crate::timer::{TIMER_KEY_CC_PACKET_TIMEOUT_BASE, TIMER_KEY_CC_SWEEP_BASE, TimerManager};
use crate::transport::TransportSender;

/// Congestion-control handler configuration.
#[derive(Debug, Clone)]
pub struct CcConfig {
    /// Received packets accumulated before one feedback emission.
    pub feedback_interval: u32,
    /// Per-packet timeout baseline; the effective timer is
    /// `packet_timeout × feedback_interval`.
    pub packet_timeout: Duration,
    pub connection_timeout: Duration,
    pub sweep_interval: Duration,
    /// When set, exhausted pacing budget or congestion window fails the
    /// send instead of logging a warning. Must be uniform per deployment.
    pub block_on_gating: bool,
    /// Used to clamp `feedback_interval` so a full feedback packet always
    /// fits one datagram.
    pub max_udp_payload: usize,
}

impl Default for CcConfig {
    fn default() -> Self {
        Self {
            feedback_interval: 10,
            packet_timeout: Duration::from_millis(200),
            connection_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            block_on_gating: false,
            max_udp_payload: crate::fragment::DEFAULT_MAX_UDP_PAYLOAD,
        }
    }
}

struct SentPacket {
    bytes: u64,
    sent_at: Instant,
}

struct CcConnection {
    addr: SocketAddr,
    controller: CubicSender,
    sent: HashMap<PacketId, SentPacket>,
    bytes_in_flight: u64,
    received: HashMap<PacketId, u64>,
    feedback_count: u32,
    last_activity: Instant,
}

impl CcConnection {
    fn new(addr: SocketAddr, now: Instant) -> Self {
        Self {
            addr,
            controller: CubicSender::new(),
            sent: HashMap::new(),
            bytes_in_flight: 0,
            received: HashMap::new(),
            feedback_count: 0,
            last_activity: now,
        }
    }
}

struct CcInner {
    config: CcConfig,
    /// `feedback_interval` after the MTU clamp.
    feedback_interval: u32,
    /// Effective per-packet timeout.
    packet_timeout: Duration,
    sender: Arc<TransportSender>,
    timers: Arc<TimerManager>,
    conns: Mutex<HashMap<ConnectionKey, Arc<Mutex<CcConnection>>>>,
}

/// Tracks sent and received data packets per connection, emits batched
/// feedback, and drives the CUBIC sender from ACKs, losses and timeouts.
///
/// Cloning is cheap and shares the underlying state, which is how the
/// same handler value registers in several chains.
#[derive(Clone)]
pub struct CcHandler {
    inner: Arc<CcInner>,
}

impl CcHandler {
    pub fn new(
        role: Role,
        sender: Arc<TransportSender>,
        timers: Arc<TimerManager>,
        config: CcConfig,
    ) -> Self {
        // A feedback packet must fit one datagram; cap the interval at
        // whatever the MTU can carry.
        let max_ids = ((config.max_udp_payload.saturating_sub(CC_FEEDBACK_HEADER_LEN)) / 8)
            .max(1) as u32;
        let feedback_interval = config.feedback_interval.min(max_ids).max(1);
        if feedback_interval != config.feedback_interval {
            warn!(
                requested = config.feedback_interval,
                clamped = feedback_interval,
                "feedback interval clamped to fit one datagram"
            );
        }
        let packet_timeout = config.packet_timeout * feedback_interval;
        let inner = Arc::new(CcInner {
            feedback_interval,
            packet_timeout,
            sender,
            timers: timers.clone(),
            conns: Mutex::new(HashMap::new()),
            config,
        });

        let weak: Weak<CcInner> = Arc::downgrade(&inner);
        let sweep_interval = inner.config.sweep_interval;
        timers.schedule_periodic(
            TIMER_KEY_CC_SWEEP_BASE + role.index(),
            sweep_interval,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.sweep(Instant::now());
                }
            },
        );

        Self { inner }
    }

    /// Registers this handler on the data and feedback chains for `role`.
    pub fn register(&self, chains: &HandlerChains, role: Role) {
        let handler: Arc<dyn Handler> = Arc::new(self.clone());
        chains.register(arpc_proto::PacketTypeId::REQUEST, role, handler.clone());
        chains.register(arpc_proto::PacketTypeId::RESPONSE, role, handler.clone());
        chains.register(arpc_proto::PacketTypeId::CC_FEEDBACK, role, handler);
    }

    pub fn feedback_interval(&self) -> u32 {
        self.inner.feedback_interval
    }

    /// `(bytes_in_flight, tracked sends, congestion window)` for a peer.
    pub fn connection_stats(&self, peer: SocketAddr) -> Option<(u64, usize, u64)> {
        let key = ConnectionKey::from_socket_addr(peer);
        let conn = self.inner.conns.lock().get(&key)?.clone();
        let conn = conn.lock();
        Some((
            conn.bytes_in_flight,
            conn.sent.len(),
            conn.controller.congestion_window(),
        ))
    }
}

impl CcInner {
    fn connection(&self, peer: SocketAddr, now: Instant) -> Arc<Mutex<CcConnection>> {
        let key = ConnectionKey::from_socket_addr(peer);
        self.conns
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(CcConnection::new(peer, now))))
            .clone()
    }

    fn packet_timer_key(packet_id: PacketId) -> u64 {
        TIMER_KEY_CC_PACKET_TIMEOUT_BASE.wrapping_add(packet_id.0)
    }

    fn on_data_sent(
        inner: &Arc<CcInner>,
        peer: SocketAddr,
        packet_id: PacketId,
        bytes: u64,
    ) -> Result<(), RpcError> {
        let now = Instant::now();
        let conn = inner.connection(peer, now);
        {
            let mut conn = conn.lock();
            conn.last_activity = now;
            if !conn.controller.has_pacing_budget(now) {
                warn!(%peer, "pacing budget exhausted");
                if inner.config.block_on_gating {
                    return Err(RpcError::WindowExhausted);
                }
            }
            if !conn.controller.can_send(conn.bytes_in_flight) {
                warn!(
                    %peer,
                    in_flight = conn.bytes_in_flight,
                    cwnd = conn.controller.congestion_window(),
                    "congestion window exhausted"
                );
                if inner.config.block_on_gating {
                    return Err(RpcError::WindowExhausted);
                }
            }
            let prior_in_flight = conn.bytes_in_flight;
            conn.sent.insert(
                packet_id,
                SentPacket {
                    bytes,
                    sent_at: now,
                },
            );
            conn.bytes_in_flight += bytes;
            conn.controller
                .on_packet_sent(now, prior_in_flight, packet_id, bytes, false);
        }

        let weak: Weak<CcInner> = Arc::downgrade(inner);
        let key = ConnectionKey::from_socket_addr(peer);
        inner.timers.schedule(
            Self::packet_timer_key(packet_id),
            inner.packet_timeout,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_packet_timeout(key, packet_id);
                }
            },
        );
        Ok(())
    }

    fn on_packet_timeout(&self, key: ConnectionKey, packet_id: PacketId) {
        let Some(conn) = self.conns.lock().get(&key).cloned() else {
            return;
        };
        let mut conn = conn.lock();
        if let Some(sent) = conn.sent.remove(&packet_id) {
            conn.bytes_in_flight = conn.bytes_in_flight.saturating_sub(sent.bytes);
            conn.controller.on_retransmission_timeout(false);
            conn.controller.maybe_exit_slow_start();
            debug!(%packet_id, "packet timed out without feedback");
        }
    }

    fn on_data_received(&self, peer: SocketAddr, packet_id: PacketId, bytes: u64) {
        let now = Instant::now();
        let conn = self.connection(peer, now);
        let feedback = {
            let mut conn = conn.lock();
            conn.last_activity = now;
            conn.received.insert(packet_id, bytes);
            conn.feedback_count += 1;
            if conn.feedback_count >= self.feedback_interval {
                let packet_ids: Vec<PacketId> = conn.received.keys().copied().collect();
                let acked_bytes: u64 = conn.received.values().sum();
                let feedback = CcFeedbackPacket {
                    acked_count: packet_ids.len() as u32,
                    acked_bytes,
                    packet_ids,
                };
                conn.received.clear();
                conn.feedback_count = 0;
                Some(feedback)
            } else {
                None
            }
        };
        if let Some(feedback) = feedback {
            // Feedback bypasses fragmentation; the interval clamp keeps it
            // within one datagram.
            if let Err(err) = self
                .sender
                .send_packet(&Packet::CcFeedback(feedback), peer)
            {
                warn!(%peer, %err, "failed to send congestion feedback");
            }
        }
    }

    fn on_feedback(&self, peer: SocketAddr, feedback: &CcFeedbackPacket) {
        let now = Instant::now();
        let conn = self.connection(peer, now);
        let mut conn = conn.lock();
        conn.last_activity = now;

        let acked: HashSet<PacketId> = feedback.packet_ids.iter().copied().collect();
        let smallest_acked = feedback.packet_ids.iter().min().copied();
        let tracked: Vec<PacketId> = conn.sent.keys().copied().collect();

        for packet_id in tracked {
            if acked.contains(&packet_id) {
                if let Some(sent) = conn.sent.remove(&packet_id) {
                    let prior_in_flight = conn.bytes_in_flight;
                    conn.bytes_in_flight = conn.bytes_in_flight.saturating_sub(sent.bytes);
                    conn.controller
                        .on_rtt_sample(now.saturating_duration_since(sent.sent_at));
                    conn.controller
                        .on_packet_acked(packet_id, sent.bytes, prior_in_flight, now);
                    conn.controller.maybe_exit_slow_start();
                    self.timers.stop(Self::packet_timer_key(packet_id));
                }
            } else if smallest_acked.is_some_and(|min| packet_id < min) {
                // Older than everything the peer reported: lost.
                if let Some(sent) = conn.sent.remove(&packet_id) {
                    let prior_in_flight = conn.bytes_in_flight;
                    conn.bytes_in_flight = conn.bytes_in_flight.saturating_sub(sent.bytes);
                    conn.controller
                        .on_congestion_event(packet_id, sent.bytes, prior_in_flight);
                    self.timers.stop(Self::packet_timer_key(packet_id));
                    debug!(%packet_id, "packet below feedback floor treated as lost");
                }
            }
        }
    }

    fn sweep(&self, now: Instant) {
        let timeout = self.config.connection_timeout;
        self.conns.lock().retain(|_, conn| {
            let conn = conn.lock();
            let fresh = now.saturating_duration_since(conn.last_activity) < timeout;
            if !fresh {
                debug!(peer = %conn.addr, "congestion state expired");
            }
            fresh
        });
    }
}

impl Handler for CcHandler {
    fn on_send(&self, packet: &Packet<'_>, peer: SocketAddr) -> Result<(), RpcError> {
        match packet {
            Packet::Data(p) => {
                CcInner::on_data_sent(&self.inner, peer, p.packet_id(), p.payload.len() as u64)
            }
            _ => Ok(()),
        }
    }

    fn on_receive(&self, packet: &Packet<'_>, peer: SocketAddr) -> Result<(), RpcError> {
        match packet {
            Packet::Data(p) => {
                self.inner
                    .on_data_received(peer, p.packet_id(), p.payload.len() as u64);
            }
            Packet::CcFeedback(feedback) => self.inner.on_feedback(peer, feedback),
            _ => {}
        }
        Ok(())
    }
}
