use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const GC_IDLE: Duration = Duration::from_secs(60);
const CONCURRENT_RETRY_AFTER_SECS: u64 = 10;
const TOKEN_SCALE: u64 = 1_000; // integer-scaled fractional tokens

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

struct IpState {
    active: std::sync::Mutex<HashSet<u64>>,
    /// Tokens scaled by TOKEN_SCALE to keep fractional refill exact.
    tokens_scaled: AtomicU64,
    last_refill_ms: AtomicI64,
    last_seen_ms: AtomicI64,
}

/// Per-IP concurrent-session cap plus token-bucket rate cap. Both gates
/// must pass for admission; neither check consumes state, only register
/// does.
pub struct IpRateLimiter {
    enabled: bool,
    max_concurrent: u64,
    capacity_per_min: u64,
    states: DashMap<String, IpState>,
}

impl IpRateLimiter {
    pub fn new(enabled: bool, max_concurrent: u64, capacity_per_min: u64) -> Self {
        IpRateLimiter {
            enabled,
            max_concurrent,
            capacity_per_min,
            states: DashMap::new(),
        }
    }

    fn refill_rate_per_ms(&self) -> f64 {
        self.capacity_per_min as f64 / 60_000.0
    }

    fn entry(&self, ip: &str) -> dashmap::mapref::one::RefMut<'_, String, IpState> {
        self.states.entry(ip.to_string()).or_insert_with(|| IpState {
            active: std::sync::Mutex::new(HashSet::new()),
            tokens_scaled: AtomicU64::new(self.capacity_per_min * TOKEN_SCALE),
            last_refill_ms: AtomicI64::new(now_ms()),
            last_seen_ms: AtomicI64::new(now_ms()),
        })
    }

    fn refill(&self, state: &IpState) {
        let now = now_ms();
        let last = state.last_refill_ms.swap(now, Ordering::AcqRel);
        let elapsed = (now - last).max(0) as f64;
        if elapsed == 0.0 {
            return;
        }
        let added = (elapsed * self.refill_rate_per_ms() * TOKEN_SCALE as f64) as u64;
        if added == 0 {
            return;
        }
        let cap = self.capacity_per_min * TOKEN_SCALE;
        let mut current = state.tokens_scaled.load(Ordering::Acquire);
        loop {
            let next = (current + added).min(cap);
            match state.tokens_scaled.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Idempotent check: does not consume a token or mutate the active set.
    pub fn check_connection_allowed(&self, ip: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let state = self.entry(ip);
        state.last_seen_ms.store(now_ms(), Ordering::Release);
        if state.active.lock().unwrap().len() as u64 >= self.max_concurrent {
            return false;
        }
        self.refill(&state);
        state.tokens_scaled.load(Ordering::Acquire) >= TOKEN_SCALE
    }

    /// Consumes one token and registers `id` as active. Returns false if
    /// admission should be denied (caller should not have called this
    /// without a prior successful check, but it re-validates defensively).
    pub fn register_connection(&self, ip: &str, id: u64) -> bool {
        if !self.enabled {
            return true;
        }
        let state = self.entry(ip);
        state.last_seen_ms.store(now_ms(), Ordering::Release);
        if state.active.lock().unwrap().len() as u64 >= self.max_concurrent {
            return false;
        }
        self.refill(&state);
        let mut current = state.tokens_scaled.load(Ordering::Acquire);
        loop {
            if current < TOKEN_SCALE {
                return false;
            }
            let next = current - TOKEN_SCALE;
            match state.tokens_scaled.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        state.active.lock().unwrap().insert(id);
        true
    }

    pub fn unregister_connection(&self, ip: &str, id: u64) {
        if let Some(state) = self.states.get(ip) {
            state.active.lock().unwrap().remove(&id);
            state.last_seen_ms.store(now_ms(), Ordering::Release);
        }
    }

    pub fn get_retry_after_seconds(&self, ip: &str) -> u64 {
        if !self.enabled {
            return 0;
        }
        let state = self.entry(ip);
        if state.active.lock().unwrap().len() as u64 >= self.max_concurrent {
            return CONCURRENT_RETRY_AFTER_SECS;
        }
        self.refill(&state);
        let tokens = state.tokens_scaled.load(Ordering::Acquire) as f64 / TOKEN_SCALE as f64;
        if tokens >= 1.0 {
            return 1;
        }
        let needed = 1.0 - tokens;
        let rate_per_sec = self.refill_rate_per_ms() * 1000.0;
        if rate_per_sec <= 0.0 {
            return CONCURRENT_RETRY_AFTER_SECS;
        }
        (needed / rate_per_sec).ceil().max(1.0) as u64
    }

    /// Evicts IPs with an empty active set, a full bucket, and no activity
    /// in the last 60s.
    pub fn gc(&self) {
        let cutoff = now_ms() - GC_IDLE.as_millis() as i64;
        let full = self.capacity_per_min * TOKEN_SCALE;
        let before = self.states.len();
        self.states.retain(|_, state| {
            let idle = state.last_seen_ms.load(Ordering::Acquire) < cutoff;
            let empty = state.active.lock().unwrap().is_empty();
            let refilled = state.tokens_scaled.load(Ordering::Acquire) >= full;
            !(idle && empty && refilled)
        });
        let removed = before - self.states.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.states.len(), "ratelimit: gc swept idle ip buckets");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_cap_blocks_admission() {
        let limiter = IpRateLimiter::new(true, 2, 1000);
        assert!(limiter.register_connection("1.1.1.1", 1));
        assert!(limiter.register_connection("1.1.1.1", 2));
        assert!(!limiter.check_connection_allowed("1.1.1.1"));
        assert!(!limiter.register_connection("1.1.1.1", 3));
    }

    #[test]
    fn test_unregister_frees_concurrent_slot() {
        let limiter = IpRateLimiter::new(true, 1, 1000);
        assert!(limiter.register_connection("2.2.2.2", 1));
        assert!(!limiter.check_connection_allowed("2.2.2.2"));
        limiter.unregister_connection("2.2.2.2", 1);
        assert!(limiter.check_connection_allowed("2.2.2.2"));
    }

    #[test]
    fn test_token_bucket_exhaustion() {
        let limiter = IpRateLimiter::new(true, 100, 2);
        assert!(limiter.register_connection("3.3.3.3", 1));
        assert!(limiter.register_connection("3.3.3.3", 2));
        assert!(!limiter.register_connection("3.3.3.3", 3));
    }

    #[test]
    fn test_disabled_always_allows() {
        let limiter = IpRateLimiter::new(false, 0, 0);
        assert!(limiter.check_connection_allowed("4.4.4.4"));
        assert!(limiter.register_connection("4.4.4.4", 1));
    }

    #[test]
    fn test_retry_after_seconds_concurrent_saturated() {
        let limiter = IpRateLimiter::new(true, 1, 1000);
        limiter.register_connection("5.5.5.5", 1);
        assert_eq!(limiter.get_retry_after_seconds("5.5.5.5"), CONCURRENT_RETRY_AFTER_SECS);
    }

    #[test]
    fn test_gc_evicts_idle_empty_full_bucket() {
        let limiter = IpRateLimiter::new(true, 10, 10);
        limiter.check_connection_allowed("6.6.6.6");
        {
            let state = limiter.entry("6.6.6.6");
            state.last_seen_ms.store(0, Ordering::Release);
        }
        limiter.gc();
        assert!(limiter.states.get("6.6.6.6").is_none());
    }
}
