use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use rand::Rng;

use crate::config::ReconnectConfig;

/// Bounded exponential backoff for station reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    jitter_percent: u8,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        let initial = Duration::from_millis(config.initial_delay_ms);
        Self {
            initial,
            max: Duration::from_millis(config.max_delay_ms).max(initial),
            multiplier: config.multiplier.max(1),
            jitter_percent: config.jitter_percent.min(100),
        }
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    /// `min(initial * multiplier^attempt, max)` without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;

        let factor = (self.multiplier as u64).checked_pow(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
    }

    pub fn delay_with_jitter<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base_delay(attempt).as_millis() as u64;
        let jitter = self.jitter_percent as u64;
        let spread = base_ms / 100 * jitter + base_ms % 100 * jitter / 100;
        if spread == 0 {
            return Duration::from_millis(base_ms);
        }

        let low = base_ms.saturating_sub(spread);
        let high = base_ms.saturating_add(spread);
        let drawn = rng.gen_range(low..=high);
        Duration::from_millis(drawn.min(self.max.as_millis() as u64))
    }
}

/// Coalesces connect scheduling: only one attempt may be pending at a time.
#[derive(Debug, Default)]
pub struct ReconnectGate {
    pending: AtomicBool,
}

impl ReconnectGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the caller now owns the pending slot.
    pub fn try_arm(&self) -> bool {
        self.pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn disarm(&self) {
        self.pending.store(false, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::config::MAX_RECONNECT_DELAY_MS;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::from_config(&ReconnectConfig::default())
    }

    #[test]
    fn base_delay_grows_until_cap() {
        let policy = policy();

        assert_eq!(policy.base_delay(0), Duration::from_millis(250));
        assert_eq!(policy.base_delay(1), Duration::from_millis(500));
        assert_eq!(policy.base_delay(4), Duration::from_millis(4_000));
        assert_eq!(policy.base_delay(7), Duration::from_millis(30_000));
        assert_eq!(policy.base_delay(200), Duration::from_millis(30_000));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(7);

        for attempt in 0..20 {
            let base = policy.base_delay(attempt).as_millis() as u64;
            for _ in 0..50 {
                let delay = policy.delay_with_jitter(attempt, &mut rng).as_millis() as u64;
                assert!(delay >= base - base / 5, "attempt {attempt}: {delay} < {base}");
                assert!(delay <= base + base / 5);
                assert!(delay <= 30_000);
            }
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = ReconnectPolicy::from_config(&ReconnectConfig {
            jitter_percent: 0,
            ..ReconnectConfig::default()
        });
        let mut rng = StdRng::seed_from_u64(1);

        assert_eq!(policy.delay_with_jitter(2, &mut rng), Duration::from_millis(1_000));
    }

    #[test]
    fn huge_cap_does_not_overflow_jitter() {
        let raw = ReconnectConfig {
            max_delay_ms: u64::MAX / 2,
            ..ReconnectConfig::default()
        };
        let unclamped = ReconnectPolicy::from_config(&raw);
        let mut rng = StdRng::seed_from_u64(3);
        let delay = unclamped.delay_with_jitter(60, &mut rng);
        assert!(delay <= unclamped.max_delay());

        let mut sanitized = raw;
        sanitized.sanitize();
        let policy = ReconnectPolicy::from_config(&sanitized);
        assert_eq!(policy.max_delay(), Duration::from_millis(MAX_RECONNECT_DELAY_MS));
        for attempt in [0, 30, 60, u32::MAX] {
            assert!(policy.delay_with_jitter(attempt, &mut rng) <= policy.max_delay());
        }
    }

    #[test]
    fn gate_allows_one_pending_attempt() {
        let gate = ReconnectGate::new();

        assert!(gate.try_arm());
        assert!(!gate.try_arm());
        assert!(gate.is_pending());

        gate.disarm();
        assert!(gate.try_arm());
    }
}
