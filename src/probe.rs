//! Probe traffic selection while fused.

use rand::Rng;

/// Decides whether a request should be let through while the limiter is
/// fused.
///
/// Fusing all traffic would starve the latency signal: no completions
/// means no percentile updates and the counter never recovers. A small
/// share of requests is deliberately leaked through as probes to keep the
/// signal alive.
#[derive(Debug, Clone, Copy)]
pub struct ProbePolicy {
    percentage: u8,
}

impl ProbePolicy {
    /// Below this rate (req/s) ratios are too noisy to act on.
    const MIN_MEANINGFUL_RATE: f64 = 10.0;

    /// Policy targeting `percentage`% of requests admitted as probes.
    pub fn new(percentage: u8) -> Self {
        debug_assert!((1..=99).contains(&percentage));
        Self { percentage }
    }

    /// Whether this request should pass as a probe.
    pub fn is_probe(&self, outbound_rate: f64, inbound_rate: f64) -> bool {
        self.decide(outbound_rate, inbound_rate, &mut rand::thread_rng())
    }

    /// [`is_probe`](Self::is_probe) with an injected randomness source.
    pub fn decide<R: Rng>(&self, outbound_rate: f64, inbound_rate: f64, rng: &mut R) -> bool {
        // Enough traffic is escaping to serve as a probe already.
        let outbound_suffices = outbound_rate >= Self::MIN_MEANINGFUL_RATE
            && 100.0 * outbound_rate / inbound_rate > f64::from(self.percentage);

        // The randomized majority is enforced. The rate guard suppresses
        // probing at trickle rates, where the ratios are meaningless.
        let majority_enforced = inbound_rate >= Self::MIN_MEANINGFUL_RATE
            && rng.gen_range(0..100) >= i32::from(self.percentage);

        !(outbound_suffices || majority_enforced)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::SmallRng, SeedableRng};

    use super::*;

    #[test]
    fn enforces_when_outbound_share_exceeds_target() {
        let policy = ProbePolicy::new(10);
        let mut rng = SmallRng::seed_from_u64(7);

        // 100 * 50 / 50 = 100% > 10%: plenty already escaping.
        for _ in 0..100 {
            assert!(!policy.decide(50.0, 50.0, &mut rng));
        }
    }

    #[test]
    fn probes_everything_at_trickle_rates() {
        let policy = ProbePolicy::new(10);
        let mut rng = SmallRng::seed_from_u64(7);

        // Both guards off: ratios are meaningless, let it through.
        for _ in 0..100 {
            assert!(policy.decide(5.0, 5.0, &mut rng));
        }
    }

    #[test]
    fn probe_share_converges_to_target() {
        let policy = ProbePolicy::new(10);
        let mut rng = SmallRng::seed_from_u64(42);

        let draws = 10_000;
        let probes = (0..draws)
            .filter(|_| policy.decide(5.0, 50.0, &mut rng))
            .count();

        let share = probes as f64 / draws as f64;
        assert!(
            (0.08..=0.12).contains(&share),
            "probe share {share} should be close to 0.10"
        );
    }

    #[test]
    fn outbound_guard_wins_without_a_draw() {
        // inbound of zero makes the ratio infinite, which still reads as
        // "enough outbound traffic" rather than a division error.
        let policy = ProbePolicy::new(10);
        let mut rng = SmallRng::seed_from_u64(7);

        assert!(!policy.decide(10.0, 0.0, &mut rng));
    }
}
