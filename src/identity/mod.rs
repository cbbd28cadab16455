use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const STALE_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const BUCKET_IDLE_EVICT: Duration = Duration::from_secs(10 * 60);
const MAX_BUCKETS: usize = 10_000;
const REPLACED_CODE: u16 = 1008;
const REPLACED_REASON: &str = "Connection replaced by a newer session";
const STALE_CODE: u16 = 1001;
const STALE_REASON: &str = "Stale connection cleanup";

pub type Disconnector = Arc<dyn Fn(u16, &str) + Send + Sync>;

struct Session {
    address: String,
    registered_at: Instant,
    disconnect: Disconnector,
}

struct Bucket {
    sessions: HashMap<u64, Session>,
    last_activity: Instant,
}

impl Bucket {
    fn new() -> Self {
        Bucket {
            sessions: HashMap::new(),
            last_activity: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn has_address(&self, address: &str) -> bool {
        self.sessions.values().any(|s| s.address == address)
    }
}

/// Tracks active sessions per configuration-recognized identity, enforcing
/// a per-identity session cap with same-address reconnect exemption and
/// same-address session replacement on register.
pub struct IdentityManager {
    max_per_identity: u64,
    buckets: DashMap<String, Mutex<Bucket>>,
}

impl IdentityManager {
    pub fn new(max_per_identity: u64) -> Self {
        IdentityManager {
            max_per_identity,
            buckets: DashMap::new(),
        }
    }

    /// 0 means the identity gate is disabled entirely.
    pub fn enabled(&self) -> bool {
        self.max_per_identity > 0
    }

    pub fn check_connection_allowed(&self, id: &str, address: &str) -> bool {
        if !self.enabled() {
            return true;
        }
        match self.buckets.get(id) {
            Some(bucket) => {
                let bucket = bucket.lock().unwrap();
                (bucket.sessions.len() as u64) < self.max_per_identity || bucket.has_address(address)
            }
            None => true,
        }
    }

    /// Replaces any existing sessions from `address` in this bucket, then
    /// installs the new one keyed by `conn_id`.
    pub fn register_connection(&self, id: &str, conn_id: u64, address: &str, disconnect: Disconnector) {
        if self.buckets.len() >= MAX_BUCKETS && self.buckets.get(id).is_none() {
            self.evict_oldest_idle_bucket();
        }
        let entry = self
            .buckets
            .entry(id.to_string())
            .or_insert_with(|| Mutex::new(Bucket::new()));
        let mut bucket = entry.lock().unwrap();

        let replaced: Vec<u64> = bucket
            .sessions
            .iter()
            .filter(|(_, s)| s.address == address)
            .map(|(id, _)| *id)
            .collect();
        for rid in replaced {
            if let Some(session) = bucket.sessions.remove(&rid) {
                tracing::debug!(identity = id, address, "identity: replacing existing session from same address");
                crate::metrics::record_identity_replaced();
                (session.disconnect)(REPLACED_CODE, REPLACED_REASON);
            }
        }

        bucket.sessions.insert(
            conn_id,
            Session {
                address: address.to_string(),
                registered_at: Instant::now(),
                disconnect,
            },
        );
        bucket.touch();
    }

    pub fn unregister_connection(&self, id: &str, conn_id: u64) {
        if let Some(bucket) = self.buckets.get(id) {
            let mut bucket = bucket.lock().unwrap();
            bucket.sessions.remove(&conn_id);
            bucket.touch();
        }
    }

    fn evict_oldest_idle_bucket(&self) {
        let oldest = self
            .buckets
            .iter()
            .min_by_key(|e| e.value().lock().unwrap().last_activity)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.buckets.remove(&key);
        }
    }

    /// Disconnects sessions older than the stale threshold, then evicts
    /// empty buckets idle past the eviction threshold.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut empty_idle = Vec::new();
        for entry in self.buckets.iter() {
            let mut bucket = entry.value().lock().unwrap();
            let stale: Vec<u64> = bucket
                .sessions
                .iter()
                .filter(|(_, s)| now.duration_since(s.registered_at) >= STALE_AGE)
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                if let Some(session) = bucket.sessions.remove(&id) {
                    (session.disconnect)(STALE_CODE, STALE_REASON);
                }
            }
            if bucket.sessions.is_empty() && now.duration_since(bucket.last_activity) >= BUCKET_IDLE_EVICT {
                empty_idle.push(entry.key().clone());
            }
        }
        if !empty_idle.is_empty() {
            tracing::debug!(count = empty_idle.len(), "identity: sweeping idle buckets");
        }
        for key in empty_idle {
            self.buckets.remove(&key);
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};

    fn noop_disconnect() -> Disconnector {
        Arc::new(|_, _| {})
    }

    #[test]
    fn test_same_address_always_admitted() {
        let mgr = IdentityManager::new(1);
        mgr.register_connection("user1", 1, "1.1.1.1", noop_disconnect());
        assert!(mgr.check_connection_allowed("user1", "1.1.1.1"));
        assert!(!mgr.check_connection_allowed("user1", "2.2.2.2"));
    }

    #[test]
    fn test_register_replaces_same_address_session() {
        let mgr = IdentityManager::new(2);
        let code = Arc::new(AtomicU16::new(0));
        let code2 = code.clone();
        let disconnect: Disconnector = Arc::new(move |c, _| code2.store(c, Ordering::SeqCst));
        mgr.register_connection("user1", 1, "1.1.1.1", disconnect);
        mgr.register_connection("user1", 2, "1.1.1.1", noop_disconnect());
        assert_eq!(code.load(Ordering::SeqCst), REPLACED_CODE);
    }

    #[test]
    fn test_disabled_when_max_zero() {
        let mgr = IdentityManager::new(0);
        assert!(!mgr.enabled());
        assert!(mgr.check_connection_allowed("anyone", "1.1.1.1"));
    }

    #[test]
    fn test_unregister_removes_session() {
        let mgr = IdentityManager::new(1);
        mgr.register_connection("user1", 1, "1.1.1.1", noop_disconnect());
        mgr.unregister_connection("user1", 1);
        assert!(mgr.check_connection_allowed("user1", "2.2.2.2"));
    }

    #[test]
    fn test_sweep_evicts_empty_idle_bucket() {
        let mgr = IdentityManager::new(1);
        mgr.register_connection("user1", 1, "1.1.1.1", noop_disconnect());
        mgr.unregister_connection("user1", 1);
        {
            let bucket = mgr.buckets.get("user1").unwrap();
            bucket.lock().unwrap().last_activity = Instant::now() - BUCKET_IDLE_EVICT - Duration::from_secs(1);
        }
        mgr.sweep();
        assert_eq!(mgr.bucket_count(), 0);
    }
}
