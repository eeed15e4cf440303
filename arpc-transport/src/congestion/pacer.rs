use std::time::Instant;

use super::DEFAULT_MSS;

/// Largest burst the bucket accumulates while idle, in packets.
const MAX_BURST_PACKETS: u64 = 10;

/// Token-bucket pacer smoothing packet departures across an RTT instead of
/// releasing the whole congestion window at once.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    budget: u64,
    last_update: Option<Instant>,
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new()
    }
}

impl Pacer {
    pub fn new() -> Self {
        Self {
            budget: MAX_BURST_PACKETS * DEFAULT_MSS,
            last_update: None,
        }
    }

    fn refill(&mut self, now: Instant, rate_bytes_per_sec: f64) {
        if let Some(last) = self.last_update {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            let earned = (elapsed * rate_bytes_per_sec) as u64;
            self.budget = (self.budget + earned).min(MAX_BURST_PACKETS * DEFAULT_MSS);
        }
        self.last_update = Some(now);
    }

    /// Whether at least one full-sized packet's worth of budget is
    /// available at `now`, given the sender's current pacing rate.
    pub fn has_budget(&mut self, now: Instant, rate_bytes_per_sec: f64) -> bool {
        self.refill(now, rate_bytes_per_sec);
        self.budget >= DEFAULT_MSS
    }

    pub fn on_packet_sent(&mut self, bytes: u64) {
        self.budget = self.budget.saturating_sub(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_throttle() {
        let mut pacer = Pacer::new();
        let now = Instant::now();
        let rate = 10_000.0; // bytes per second

        // The initial burst allowance drains.
        for _ in 0..MAX_BURST_PACKETS {
            assert!(pacer.has_budget(now, rate));
            pacer.on_packet_sent(DEFAULT_MSS);
        }
        assert!(!pacer.has_budget(now, rate));

        // Budget replenishes with elapsed time at the pacing rate.
        let later = now + Duration::from_secs(1);
        assert!(pacer.has_budget(later, rate));
    }
}
