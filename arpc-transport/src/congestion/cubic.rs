use std::time::Instant;

/// CUBIC scaling constant.
const C: f32 = 0.4;
/// Multiplicative decrease factor.
pub const BETA: f32 = 0.7;

/// The CUBIC window curve (RFC 8312), in units of packets.
///
/// Tracks the window at the last congestion event (`w_max`), the time `k`
/// at which the cubic function regains it, and a parallel Reno-style
/// estimate for the TCP-friendly region.
#[derive(Debug, Clone, Copy)]
pub struct CubicCurve {
    w_max: f32,
    k: f32,
    epoch_start: Option<Instant>,
    tcp_cwnd: f32,
}

impl Default for CubicCurve {
    fn default() -> Self {
        Self::new()
    }
}

impl CubicCurve {
    pub fn new() -> Self {
        Self {
            w_max: 0.0,
            k: 0.0,
            epoch_start: None,
            tcp_cwnd: 0.0,
        }
    }

    /// Forgets all epoch state, as after a retransmission timeout.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Ends the current epoch so the next ACK starts a fresh one. Called
    /// when the sender goes application-limited; counting idle time toward
    /// `t` would balloon the window.
    pub fn on_application_limited(&mut self) {
        self.epoch_start = None;
    }

    /// Window after a loss event, applying the multiplicative decrease and
    /// re-arming the curve around the fallen window.
    pub fn window_after_loss(&mut self, cwnd: f32) -> f32 {
        self.epoch_start = None;
        if cwnd < self.w_max {
            // Fast convergence: release bandwidth to newer flows.
            self.w_max = cwnd * (1.0 + BETA) / 2.0;
        } else {
            self.w_max = cwnd;
        }
        self.k = ((self.w_max * (1.0 - BETA)) / C).powf(1.0 / 3.0);
        self.tcp_cwnd = cwnd * BETA;
        cwnd * BETA
    }

    /// Window during congestion avoidance after `acked` packets worth of
    /// acknowledgment.
    pub fn window_after_ack(&mut self, acked: f32, cwnd: f32, now: Instant) -> f32 {
        if self.epoch_start.is_none() {
            self.epoch_start = Some(now);
            if cwnd < self.w_max {
                // Concave region: approach w_max from below.
                self.k = ((self.w_max - cwnd) / C).powf(1.0 / 3.0);
            } else {
                // Convex region: probe beyond the previous maximum.
                self.k = 0.0;
                self.w_max = cwnd;
            }
            self.tcp_cwnd = cwnd;
        }

        let t = now
            .saturating_duration_since(self.epoch_start.expect("epoch started above"))
            .as_secs_f32();
        let target = C * (t - self.k).powi(3) + self.w_max;

        // Reno-equivalent growth keeps CUBIC at least as fast as standard
        // TCP in short-RTT regimes.
        self.tcp_cwnd += acked / self.tcp_cwnd.max(1.0);

        target.max(self.tcp_cwnd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_loss_applies_beta() {
        let mut curve = CubicCurve::new();
        let after = curve.window_after_loss(100.0);
        assert!((after - 70.0).abs() < 0.01);
    }

    #[test]
    fn test_fast_convergence_lowers_w_max() {
        let mut curve = CubicCurve::new();
        curve.window_after_loss(100.0); // w_max = 100
        let after = curve.window_after_loss(70.0); // below w_max
        assert!((after - 49.0).abs() < 0.01);
        // w_max was set below the fallen window: 70 * 0.85 = 59.5.
        let now = Instant::now();
        let grown = curve.window_after_ack(1.0, 49.0, now + Duration::from_secs(100));
        assert!(grown > 59.0);
    }

    #[test]
    fn test_window_grows_with_time() {
        let mut curve = CubicCurve::new();
        curve.window_after_loss(50.0);
        let now = Instant::now();
        let early = curve.window_after_ack(1.0, 35.0, now);
        let late = curve.window_after_ack(1.0, 35.0, now + Duration::from_secs(20));
        assert!(late > early);
        assert!(late > 50.0, "cubic must eventually exceed w_max");
    }
}
