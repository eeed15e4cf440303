use std::time::{Duration, Instant};

use arpc_proto::PacketId;
use tracing::debug;

use super::{
    CongestionControl, CubicCurve, DEFAULT_MSS, HybridSlowStart, INITIAL_CONGESTION_WINDOW,
    MAX_CONGESTION_WINDOW, MIN_CONGESTION_WINDOW, Pacer,
};
use crate::rtt::RttEstimator;

/// Pacing gain applied while probing for bandwidth in slow start.
const SLOW_START_PACING_GAIN: f64 = 2.0;
/// Pacing gain during congestion avoidance.
const AVOIDANCE_PACING_GAIN: f64 = 1.25;

/// CUBIC congestion-control sender for one connection.
///
/// Combines the cubic window curve with HyStart slow-start exit and a
/// token pacer. Loss handled through feedback gaps triggers a window
/// cutback once per congestion episode: packets sent before the last
/// cutback neither shrink the window again nor grow it while their ACKs
/// drain in (recovery).
pub struct CubicSender {
    curve: CubicCurve,
    hybrid: HybridSlowStart,
    pacer: Pacer,
    rtt: RttEstimator,
    latest_rtt: Option<Duration>,
    cwnd: u64,
    ssthresh: u64,
    largest_sent: Option<PacketId>,
    largest_acked: Option<PacketId>,
    largest_sent_at_last_cutback: Option<PacketId>,
}

impl Default for CubicSender {
    fn default() -> Self {
        Self::new()
    }
}

impl CubicSender {
    pub fn new() -> Self {
        Self {
            curve: CubicCurve::new(),
            hybrid: HybridSlowStart::new(),
            pacer: Pacer::new(),
            rtt: RttEstimator::new(),
            latest_rtt: None,
            cwnd: INITIAL_CONGESTION_WINDOW * DEFAULT_MSS,
            ssthresh: MAX_CONGESTION_WINDOW * DEFAULT_MSS,
            largest_sent: None,
            largest_acked: None,
            largest_sent_at_last_cutback: None,
        }
    }

    fn pacing_rate(&self) -> f64 {
        let gain = if self.in_slow_start() {
            SLOW_START_PACING_GAIN
        } else {
            AVOIDANCE_PACING_GAIN
        };
        let srtt = self.rtt.srtt().as_secs_f64().max(0.001);
        gain * self.cwnd as f64 / srtt
    }

    fn clamp_window(&mut self) {
        self.cwnd = self.cwnd.clamp(
            MIN_CONGESTION_WINDOW * DEFAULT_MSS,
            MAX_CONGESTION_WINDOW * DEFAULT_MSS,
        );
    }
}

impl CongestionControl for CubicSender {
    fn on_packet_sent(
        &mut self,
        _now: Instant,
        _bytes_in_flight: u64,
        packet_id: PacketId,
        bytes: u64,
        _retransmittable: bool,
    ) {
        if self.largest_sent.is_none_or(|l| packet_id > l) {
            self.largest_sent = Some(packet_id);
        }
        self.hybrid.on_packet_sent(packet_id);
        self.pacer.on_packet_sent(bytes);
    }

    fn on_packet_acked(
        &mut self,
        packet_id: PacketId,
        acked_bytes: u64,
        _prior_in_flight: u64,
        now: Instant,
    ) {
        if self.largest_acked.is_none_or(|l| packet_id > l) {
            self.largest_acked = Some(packet_id);
        }
        self.hybrid.on_packet_acked(packet_id);
        if self.in_recovery() {
            // ACKs for pre-cutback packets do not reopen the window.
            return;
        }
        if self.in_slow_start() {
            self.cwnd += DEFAULT_MSS;
        } else {
            let cwnd_packets = self.cwnd as f32 / DEFAULT_MSS as f32;
            let acked_packets = acked_bytes as f32 / DEFAULT_MSS as f32;
            let next = self
                .curve
                .window_after_ack(acked_packets.max(0.0), cwnd_packets, now);
            self.cwnd = (next * DEFAULT_MSS as f32) as u64;
        }
        self.clamp_window();
    }

    fn on_congestion_event(&mut self, packet_id: PacketId, _lost_bytes: u64, _prior_in_flight: u64) {
        if self
            .largest_sent_at_last_cutback
            .is_some_and(|cutback| packet_id <= cutback)
        {
            // Loss within the current episode; the window already paid.
            return;
        }
        let cwnd_packets = self.cwnd as f32 / DEFAULT_MSS as f32;
        self.cwnd = (self.curve.window_after_loss(cwnd_packets) * DEFAULT_MSS as f32) as u64;
        self.clamp_window();
        self.ssthresh = self.cwnd;
        self.largest_sent_at_last_cutback = self.largest_sent;
        debug!(cwnd = self.cwnd, "congestion event, window cut back");
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.largest_sent_at_last_cutback = None;
        if !packets_retransmitted {
            return;
        }
        self.hybrid.restart();
        self.curve.reset();
        self.ssthresh = self.cwnd / 2;
        self.cwnd = MIN_CONGESTION_WINDOW * DEFAULT_MSS;
    }

    fn maybe_exit_slow_start(&mut self) {
        if !self.in_slow_start() {
            return;
        }
        let Some(latest) = self.latest_rtt else {
            return;
        };
        let Some(min) = self.rtt.min_rtt() else {
            return;
        };
        if self
            .hybrid
            .should_exit_slow_start(latest, min, self.cwnd / DEFAULT_MSS)
        {
            debug!(cwnd = self.cwnd, "leaving slow start");
            self.ssthresh = self.cwnd;
        }
    }

    fn on_rtt_sample(&mut self, rtt: Duration) {
        self.latest_rtt = Some(rtt);
        self.rtt.update(rtt);
    }

    fn can_send(&self, bytes_in_flight: u64) -> bool {
        bytes_in_flight < self.cwnd
    }

    fn has_pacing_budget(&mut self, now: Instant) -> bool {
        let rate = self.pacing_rate();
        self.pacer.has_budget(now, rate)
    }

    fn congestion_window(&self) -> u64 {
        self.cwnd
    }

    fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    fn in_recovery(&self) -> bool {
        match (self.largest_acked, self.largest_sent_at_last_cutback) {
            (Some(acked), Some(cutback)) => acked <= cutback,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}
