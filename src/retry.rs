use rand::Rng;
use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_millis(150);
const MAX_DELAY: Duration = Duration::from_secs(2);
const JITTER_FRACTION: f64 = 0.30;

/// Exponential backoff starting at 150ms, doubling, capped at 2s, plus up
/// to 30% uniform jitter on top of the current delay.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(MAX_DELAY);
    let jitter_max = capped.mul_f64(JITTER_FRACTION);
    let jitter = if jitter_max.is_zero() {
        Duration::ZERO
    } else {
        Duration::from_nanos(rand::thread_rng().gen_range(0..=jitter_max.as_nanos() as u64))
    };
    capped + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_caps_at_two_seconds_plus_jitter() {
        let d = backoff_delay(20);
        assert!(d >= MAX_DELAY);
        assert!(d <= MAX_DELAY + MAX_DELAY.mul_f64(JITTER_FRACTION));
    }

    #[test]
    fn test_delay_starts_at_base() {
        let d = backoff_delay(0);
        assert!(d >= BASE_DELAY);
        assert!(d <= BASE_DELAY + BASE_DELAY.mul_f64(JITTER_FRACTION));
    }

    #[test]
    fn test_delay_doubles() {
        let d1 = backoff_delay(1);
        assert!(d1 >= BASE_DELAY * 2);
    }
}
