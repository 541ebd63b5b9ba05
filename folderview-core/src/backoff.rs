use std::time::Duration;

use rand::Rng;

/// Exponential retry delay for listing requests, optionally jittered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(8), true)
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, retry_after, &mut rng)
    }

    /// A server-provided `Retry-After` wins over the computed delay but is
    /// still capped at `max`.
    pub fn delay_with_rng<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max);
        }
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.min(16)).min(max_ms);
        let delay_ms = if self.jitter && exp > 0 {
            rng.gen_range(exp / 2..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn doubles_until_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500), false);
        let mut rng = StdRng::seed_from_u64(7);
        let delays: Vec<u128> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, None, &mut rng).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn jitter_stays_within_upper_half() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10), true);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..32 {
            let delay = backoff.delay_with_rng(2, None, &mut rng);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
    }

    #[test]
    fn retry_after_hint_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2), true);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            backoff.delay_with_rng(0, Some(Duration::from_secs(1)), &mut rng),
            Duration::from_secs(1)
        );
        assert_eq!(
            backoff.delay_with_rng(0, Some(Duration::from_secs(30)), &mut rng),
            Duration::from_secs(2)
        );
    }
}
