use std::time::{Duration, Instant};

use arpc_proto::PacketId;

pub mod cubic;
pub mod handler;
pub mod hybrid_slow_start;
pub mod pacer;
pub mod sender;

pub use cubic::CubicCurve;
pub use handler::{CcConfig, CcHandler};
pub use hybrid_slow_start::HybridSlowStart;
pub use pacer::Pacer;
pub use sender::CubicSender;

/// Maximum segment size assumed by the window arithmetic, in bytes.
pub const DEFAULT_MSS: u64 = 1460;
/// Initial congestion window, in packets.
pub const INITIAL_CONGESTION_WINDOW: u64 = 10;
/// Floor for the congestion window, in packets.
pub const MIN_CONGESTION_WINDOW: u64 = 2;
/// Ceiling for the congestion window, in packets.
pub const MAX_CONGESTION_WINDOW: u64 = 10_000;

/// Connection-level congestion controller driven by the CC handler.
///
/// Packet IDs are the monotonic `(RPCID << 16) | seq` values derived from
/// wire fields, so ID comparisons order packets by send time.
pub trait CongestionControl: Send {
    fn on_packet_sent(
        &mut self,
        now: Instant,
        bytes_in_flight: u64,
        packet_id: PacketId,
        bytes: u64,
        retransmittable: bool,
    );

    fn on_packet_acked(
        &mut self,
        packet_id: PacketId,
        acked_bytes: u64,
        prior_in_flight: u64,
        now: Instant,
    );

    /// A packet was deemed lost by feedback gap analysis.
    fn on_congestion_event(&mut self, packet_id: PacketId, lost_bytes: u64, prior_in_flight: u64);

    /// A packet's timeout timer fired without an ACK.
    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool);

    /// Checks the slow-start exit condition; call after each ACK.
    fn maybe_exit_slow_start(&mut self);

    /// An RTT sample became available for this connection.
    fn on_rtt_sample(&mut self, rtt: Duration);

    fn can_send(&self, bytes_in_flight: u64) -> bool;

    fn has_pacing_budget(&mut self, now: Instant) -> bool;

    fn congestion_window(&self) -> u64;

    fn in_slow_start(&self) -> bool;

    fn in_recovery(&self) -> bool;
}
