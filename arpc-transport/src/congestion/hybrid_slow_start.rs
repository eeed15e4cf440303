use std::time::Duration;

use arpc_proto::PacketId;

/// Below this window (in packets) delay-based exit is not attempted.
const LOW_WINDOW: u64 = 16;
/// RTT samples examined per round before a verdict.
const MIN_SAMPLES: u32 = 8;
/// Exit when the smoothed sample exceeds `min_rtt + min_rtt >> EXPONENT`.
const DELAY_FACTOR_EXPONENT: u32 = 3;
const DELAY_MIN_THRESHOLD: Duration = Duration::from_millis(4);
const DELAY_MAX_THRESHOLD: Duration = Duration::from_millis(16);

/// HyStart delay-based slow-start exit detection.
///
/// Watches per-round RTT inflation: when the minimum RTT observed within a
/// round rises a threshold above the connection's floor, slow start has
/// begun filling the bottleneck queue and should end before loss does it
/// the hard way.
#[derive(Debug, Clone, Copy, Default)]
pub struct HybridSlowStart {
    end_packet_id: Option<PacketId>,
    last_sent_packet_id: Option<PacketId>,
    started: bool,
    found: bool,
    rtt_sample_count: u32,
    current_min_rtt: Option<Duration>,
}

impl HybridSlowStart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets the exit verdict, as after a retransmission timeout.
    pub fn restart(&mut self) {
        self.started = false;
        self.found = false;
    }

    pub fn on_packet_sent(&mut self, packet_id: PacketId) {
        self.last_sent_packet_id = Some(packet_id);
    }

    /// Closes the sampling round when its last packet is acknowledged.
    pub fn on_packet_acked(&mut self, packet_id: PacketId) {
        if self.end_packet_id.is_some_and(|end| packet_id >= end) {
            self.started = false;
        }
    }

    fn start_round(&mut self) {
        self.started = true;
        self.rtt_sample_count = 0;
        self.current_min_rtt = None;
        self.end_packet_id = self.last_sent_packet_id;
    }

    /// Returns true when the latest RTT sample indicates queue buildup and
    /// the window is large enough for the signal to be trustworthy.
    pub fn should_exit_slow_start(
        &mut self,
        latest_rtt: Duration,
        min_rtt: Duration,
        cwnd_packets: u64,
    ) -> bool {
        if !self.started {
            self.start_round();
        }
        if self.found {
            return cwnd_packets >= LOW_WINDOW;
        }
        self.rtt_sample_count += 1;
        if self.rtt_sample_count <= MIN_SAMPLES
            && self.current_min_rtt.is_none_or(|m| latest_rtt < m)
        {
            self.current_min_rtt = Some(latest_rtt);
        }
        if self.rtt_sample_count == MIN_SAMPLES {
            let threshold = (min_rtt / (1 << DELAY_FACTOR_EXPONENT))
                .clamp(DELAY_MIN_THRESHOLD, DELAY_MAX_THRESHOLD);
            if let Some(current) = self.current_min_rtt
                && current > min_rtt + threshold
            {
                self.found = true;
            }
        }
        cwnd_packets >= LOW_WINDOW && self.found
    }
}
