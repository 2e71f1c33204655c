use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Bounded exponential backoff with jitter: 1s doubling to a 60s cap,
/// each delay jittered by ±25%.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(6); // 2^6 s = 64 s, already past the cap
        self.attempt = self.attempt.saturating_add(1);
        let base = BASE_DELAY
            .saturating_mul(1u32 << exp)
            .min(MAX_DELAY)
            .as_secs_f64();
        let jitter = 0.75 + fastrand::f64() * 0.5;
        Duration::from_secs_f64(base * jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_to_cap() {
        let mut backoff = Backoff::new();
        let first = backoff.next_delay();
        assert!(first >= Duration::from_secs_f64(0.75));
        assert!(first <= Duration::from_secs_f64(1.25));

        for _ in 0..10 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped <= Duration::from_secs_f64(60.0 * 1.25));
        assert!(capped >= Duration::from_secs_f64(60.0 * 0.75));
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut backoff = Backoff::new();
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempt(), 5);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_secs_f64(1.25));
    }
}
