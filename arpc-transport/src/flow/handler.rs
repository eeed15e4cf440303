use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arpc_proto::{ConnectionKey, FcFeedbackPacket, Packet};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{ConnectionFlowController, FlowConfig};
use crate::error::RpcError;
use crate::handler::{Handler, HandlerChains, Role};
use crate::timer::{TIMER_KEY_FC_SWEEP_BASE, TimerManager};
use crate::transport::TransportSender;

/// Flow-control handler configuration.
#[derive(Debug, Clone)]
pub struct FcConfig {
    pub flow: FlowConfig,
    pub connection_timeout: Duration,
    pub sweep_interval: Duration,
    /// When set, a zero send window fails the send instead of warning.
    pub block_on_gating: bool,
}

impl Default for FcConfig {
    fn default() -> Self {
        Self {
            flow: FlowConfig::default(),
            connection_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            block_on_gating: false,
        }
    }
}

struct FcConnection {
    addr: SocketAddr,
    fc: ConnectionFlowController,
    last_activity: Instant,
}

struct FcInner {
    config: FcConfig,
    sender: Arc<TransportSender>,
    conns: Mutex<HashMap<ConnectionKey, Arc<Mutex<FcConnection>>>>,
}

/// Maintains the per-connection receive window, emits threshold-triggered
/// window advertisements, and gates sends on the peer's advertised window.
///
/// Cloning is cheap and shares the underlying state.
#[derive(Clone)]
pub struct FcHandler {
    inner: Arc<FcInner>,
}

impl FcHandler {
    pub fn new(
        role: Role,
        sender: Arc<TransportSender>,
        timers: Arc<TimerManager>,
        config: FcConfig,
    ) -> Self {
        let inner = Arc::new(FcInner {
            config,
            sender,
            conns: Mutex::new(HashMap::new()),
        });
        let weak: Weak<FcInner> = Arc::downgrade(&inner);
        let sweep_interval = inner.config.sweep_interval;
        timers.schedule_periodic(
            TIMER_KEY_FC_SWEEP_BASE + role.index(),
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
        chains.register(arpc_proto::PacketTypeId::FC_FEEDBACK, role, handler);
    }

    /// Feeds an RTT estimate into a peer's window auto-tuning.
    pub fn set_peer_rtt(&self, peer: SocketAddr, rtt: Duration) {
        let conn = self.inner.connection(peer, Instant::now());
        conn.lock().fc.set_rtt(rtt);
    }

    /// The peer's remaining send window, for tests and diagnostics.
    pub fn send_window_size(&self, peer: SocketAddr) -> Option<u64> {
        let key = ConnectionKey::from_socket_addr(peer);
        let conn = self.inner.conns.lock().get(&key)?.clone();
        let window = conn.lock().fc.send_window_size();
        Some(window)
    }
}

impl FcInner {
    fn connection(&self, peer: SocketAddr, now: Instant) -> Arc<Mutex<FcConnection>> {
        let key = ConnectionKey::from_socket_addr(peer);
        self.conns
            .lock()
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(FcConnection {
                    addr: peer,
                    fc: ConnectionFlowController::new(self.config.flow),
                    last_activity: now,
                }))
            })
            .clone()
    }

    fn on_data_sent(&self, peer: SocketAddr, bytes: u64) -> Result<(), RpcError> {
        let now = Instant::now();
        let conn = self.connection(peer, now);
        let mut conn = conn.lock();
        conn.last_activity = now;
        if conn.fc.send_window_size() == 0 {
            warn!(%peer, "send window exhausted");
            if self.config.block_on_gating {
                return Err(RpcError::WindowExhausted);
            }
        }
        conn.fc.add_bytes_sent(bytes);
        Ok(())
    }

    fn on_data_received(&self, peer: SocketAddr, bytes: u64) {
        let now = Instant::now();
        let conn = self.connection(peer, now);
        let offset = {
            let mut conn = conn.lock();
            conn.last_activity = now;
            if conn.fc.add_bytes_read(bytes) {
                conn.fc.get_window_update(now)
            } else {
                0
            }
        };
        if offset > 0 {
            debug!(%peer, offset, "advertising window update");
            let feedback = FcFeedbackPacket {
                send_window: offset,
            };
            if let Err(err) = self.sender.send_packet(&Packet::FcFeedback(feedback), peer) {
                warn!(%peer, %err, "failed to send window update");
            }
        }
    }

    fn on_feedback(&self, peer: SocketAddr, feedback: &FcFeedbackPacket) {
        let now = Instant::now();
        let conn = self.connection(peer, now);
        let mut conn = conn.lock();
        conn.last_activity = now;
        conn.fc.update_send_window(feedback.send_window);
    }

    fn sweep(&self, now: Instant) {
        let timeout = self.config.connection_timeout;
        self.conns.lock().retain(|_, conn| {
            let conn = conn.lock();
            let fresh = now.saturating_duration_since(conn.last_activity) < timeout;
            if !fresh {
                debug!(peer = %conn.addr, "flow-control state expired");
            }
            fresh
        });
    }
}

impl Handler for FcHandler {
    fn on_send(&self, packet: &Packet<'_>, peer: SocketAddr) -> Result<(), RpcError> {
        match packet {
            Packet::Data(p) => self.inner.on_data_sent(peer, p.payload.len() as u64),
            _ => Ok(()),
        }
    }

    fn on_receive(&self, packet: &Packet<'_>, peer: SocketAddr) -> Result<(), RpcError> {
        match packet {
            Packet::Data(p) => self.inner.on_data_received(peer, p.payload.len() as u64),
            Packet::FcFeedback(feedback) => self.inner.on_feedback(peer, feedback),
            _ => {}
        }
        Ok(())
    }
}
