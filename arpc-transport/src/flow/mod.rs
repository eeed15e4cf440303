use std::time::{Duration, Instant};

pub mod handler;

pub use handler::{FcConfig, FcHandler};

/// Per-RPC receive-window base the connection-level window scales from.
const RECEIVE_WINDOW_BASE: u64 = 10 * 1024 * 1024;
/// Connection-level windows are this multiple of the per-RPC base.
pub const CONNECTION_FLOW_CONTROL_MULTIPLIER: f64 = 1.5;
/// Initial receive window advertised to a peer: the per-RPC base scaled
/// by the connection multiplier (15 MiB).
pub const DEFAULT_INITIAL_RECEIVE_WINDOW: u64 =
    (RECEIVE_WINDOW_BASE as f64 * CONNECTION_FLOW_CONTROL_MULTIPLIER) as u64;
/// Ceiling the auto-tuner may grow the receive window to.
pub const DEFAULT_MAX_RECEIVE_WINDOW: u64 = 25 * 1024 * 1024;
/// A window update is warranted once this fraction of the advertised
/// window has been consumed.
pub const WINDOW_UPDATE_THRESHOLD: f64 = 0.25;

#[derive(Debug, Clone, Copy)]
pub struct FlowConfig {
    pub initial_receive_window: u64,
    pub max_receive_window: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            initial_receive_window: DEFAULT_INITIAL_RECEIVE_WINDOW,
            max_receive_window: DEFAULT_MAX_RECEIVE_WINDOW,
        }
    }
}

/// Byte-offset flow controller for one connection.
///
/// The send side tracks cumulative bytes sent against the peer's last
/// advertised window offset; the receive side tracks cumulative bytes read
/// and decides when to advertise a larger offset. Window offsets only ever
/// grow, so a reordered advertisement can never shrink the send window.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionFlowController {
    send_window: u64,
    bytes_sent: u64,

    bytes_read: u64,
    receive_window_offset: u64,
    receive_window_size: u64,
    max_receive_window_size: u64,
    epoch_start_time: Option<Instant>,
    epoch_start_offset: u64,
    rtt: Duration,
}

impl ConnectionFlowController {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            // Until the first advertisement arrives the peer is assumed to
            // run the same initial window.
            send_window: config.initial_receive_window,
            bytes_sent: 0,
            bytes_read: 0,
            receive_window_offset: config.initial_receive_window,
            receive_window_size: config.initial_receive_window,
            max_receive_window_size: config.max_receive_window,
            epoch_start_time: None,
            epoch_start_offset: 0,
            rtt: Duration::ZERO,
        }
    }

    /// Bytes still sendable under the peer's advertised window.
    pub fn send_window_size(&self) -> u64 {
        self.send_window.saturating_sub(self.bytes_sent)
    }

    pub fn add_bytes_sent(&mut self, n: u64) {
        self.bytes_sent += n;
    }

    /// Applies a window advertisement. Smaller offsets than the current
    /// window are ignored; returns whether the window grew.
    pub fn update_send_window(&mut self, offset: u64) -> bool {
        if offset > self.send_window {
            self.send_window = offset;
            true
        } else {
            false
        }
    }

    /// Accounts consumed receive-side bytes; true once an update is
    /// warranted (≥ 25% of the advertised window consumed).
    pub fn add_bytes_read(&mut self, n: u64) -> bool {
        self.bytes_read += n;
        self.has_window_update()
    }

    fn has_window_update(&self) -> bool {
        let remaining = self.receive_window_offset.saturating_sub(self.bytes_read);
        (remaining as f64) <= self.receive_window_size as f64 * (1.0 - WINDOW_UPDATE_THRESHOLD)
    }

    /// Returns the new offset to advertise, or 0 when no update is
    /// warranted. Auto-tunes the window upward when it is being consumed
    /// faster than the round-trip time can replenish it.
    pub fn get_window_update(&mut self, now: Instant) -> u64 {
        if !self.has_window_update() {
            return 0;
        }
        self.maybe_adjust_window_size(now);
        self.receive_window_offset = self.bytes_read + self.receive_window_size;
        self.receive_window_offset
    }

    fn maybe_adjust_window_size(&mut self, now: Instant) {
        let Some(epoch_start) = self.epoch_start_time else {
            self.start_auto_tuning_epoch(now);
            return;
        };
        let in_epoch = self.bytes_read.saturating_sub(self.epoch_start_offset);
        if in_epoch <= self.receive_window_size / 2 {
            return;
        }
        if self.rtt.is_zero() {
            return;
        }
        let fraction = in_epoch as f64 / self.receive_window_size as f64;
        if now.saturating_duration_since(epoch_start) < self.rtt.mul_f64(4.0 * fraction) {
            self.receive_window_size =
                (2 * self.receive_window_size).min(self.max_receive_window_size);
        }
        self.start_auto_tuning_epoch(now);
    }

    fn start_auto_tuning_epoch(&mut self, now: Instant) {
        self.epoch_start_time = Some(now);
        self.epoch_start_offset = self.bytes_read;
    }

    /// Feeds the round-trip estimate used by window auto-tuning.
    pub fn set_rtt(&mut self, rtt: Duration) {
        self.rtt = rtt;
    }

    pub fn receive_window_size(&self) -> u64 {
        self.receive_window_size
    }
}
