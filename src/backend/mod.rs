pub mod alias;

use alias::AliasTable;
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::BackendConfig;

const HEALTHY: u8 = 0;
const UNHEALTHY: u8 = 1;
const UNHEALTHY_THRESHOLD: u32 = 1;
const RECOVERY_THRESHOLD: u32 = 2;
const PROBE_TIMEOUT: Duration = Duration::from_secs(4);

/// One configured backend and its live health state.
#[derive(Debug)]
pub struct BackendEntry {
    pub origin: String,
    pub weight: u32,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
}

impl BackendEntry {
    fn new(origin: String, weight: u32) -> Self {
        BackendEntry {
            origin,
            weight,
            state: AtomicU8::new(HEALTHY),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state.load(Ordering::Acquire) == HEALTHY
    }

    /// Returns true if this report flipped the backend's health state.
    fn report_success(&self) -> bool {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.state.load(Ordering::Acquire) != UNHEALTHY {
            return false;
        }
        let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
        if successes >= RECOVERY_THRESHOLD {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            self.state.store(HEALTHY, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn report_failure(&self) -> bool {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if self.state.load(Ordering::Acquire) == HEALTHY && failures >= UNHEALTHY_THRESHOLD {
            self.state.store(UNHEALTHY, Ordering::Release);
            true
        } else {
            false
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Pool of backends behind a single proxy, with weighted selection,
/// hysteretic health tracking, and opportunistic periodic probing.
pub struct BackendPool {
    entries: Vec<Arc<BackendEntry>>,
    full_alias: Option<AliasTable>,
    healthy_alias: ArcSwap<Option<AliasTable>>,
    sticky: bool,
    probe_interval: Duration,
    next_probe_at: AtomicI64,
    probe_in_flight: AtomicBool,
    http_client: reqwest::Client,
}

impl BackendPool {
    pub fn new(backends: &[BackendConfig], sticky: bool, probe_interval: Duration) -> Arc<Self> {
        let entries: Vec<Arc<BackendEntry>> = if backends.is_empty() {
            vec![Arc::new(BackendEntry::new(
                "http://127.0.0.1:80".to_string(),
                1,
            ))]
        } else {
            backends
                .iter()
                .map(|b| Arc::new(BackendEntry::new(b.origin.clone(), b.weight)))
                .collect()
        };

        let weights: Vec<u32> = entries.iter().map(|e| e.weight).collect();
        let all_indices: Vec<usize> = (0..entries.len()).collect();
        let full_alias = AliasTable::new(&weights, &all_indices);
        let healthy_alias = full_alias.clone();

        let http_client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Arc::new(BackendPool {
            entries,
            full_alias,
            healthy_alias: ArcSwap::from_pointee(healthy_alias),
            sticky,
            probe_interval,
            next_probe_at: AtomicI64::new(now_ms()),
            probe_in_flight: AtomicBool::new(false),
            http_client,
        })
    }

    pub fn total_count(&self) -> usize {
        self.entries.len()
    }

    pub fn healthy_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_healthy()).count()
    }

    pub fn entries(&self) -> &[Arc<BackendEntry>] {
        &self.entries
    }

    fn rebuild_healthy_alias(&self) {
        let healthy_indices: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_healthy())
            .map(|(i, _)| i)
            .collect();
        if healthy_indices.is_empty() {
            self.healthy_alias.store(Arc::new(None));
            return;
        }
        let weights: Vec<u32> = healthy_indices.iter().map(|&i| self.entries[i].weight).collect();
        self.healthy_alias
            .store(Arc::new(AliasTable::new(&weights, &healthy_indices)));
    }

    pub fn report_success(&self, origin: &str) {
        if let Some(entry) = self.entries.iter().find(|e| e.origin == origin) {
            if entry.report_success() {
                tracing::info!(backend = origin, "backend: recovered, marked healthy");
                self.rebuild_healthy_alias();
            }
        }
    }

    pub fn report_failure(&self, origin: &str) {
        if let Some(entry) = self.entries.iter().find(|e| e.origin == origin) {
            if entry.report_failure() {
                tracing::warn!(backend = origin, "backend: marked unhealthy");
                self.rebuild_healthy_alias();
            }
        }
    }

    /// Weighted or sticky selection, excluding already-tried origins.
    pub fn select(&self, exclude: &HashSet<String>) -> String {
        if self.sticky && self.entries.len() > 1 {
            return self.select_sticky(exclude);
        }

        let healthy = self.healthy_alias.load();
        if let Some(table) = healthy.as_ref() {
            if let Some(origin) = self.sample_excluding(table, exclude) {
                return origin;
            }
        }
        // Healthy set exhausted or empty: fall back to full set.
        if let Some(table) = &self.full_alias {
            if let Some(origin) = self.sample_excluding(table, exclude) {
                return origin;
            }
        }
        self.entries
            .first()
            .map(|e| e.origin.clone())
            .unwrap_or_else(|| "http://127.0.0.1:80".to_string())
    }

    fn sample_excluding(&self, table: &AliasTable, exclude: &HashSet<String>) -> Option<String> {
        let mut rng = rand::thread_rng();
        let attempts = std::cmp::max(4, 2 * table.len());
        for _ in 0..attempts {
            let idx = table.sample(&mut rng);
            let origin = &self.entries[idx].origin;
            if !exclude.contains(origin) {
                return Some(origin.clone());
            }
        }
        // Exhausted random attempts: scan the table's own candidates in order.
        table
            .indices()
            .iter()
            .map(|&idx| &self.entries[idx].origin)
            .find(|origin| !exclude.contains(*origin))
            .cloned()
    }

    fn select_sticky(&self, exclude: &HashSet<String>) -> String {
        for entry in &self.entries {
            if entry.is_healthy() && !exclude.contains(&entry.origin) {
                return entry.origin.clone();
            }
        }
        for entry in &self.entries {
            if !exclude.contains(&entry.origin) {
                return entry.origin.clone();
            }
        }
        self.entries
            .first()
            .map(|e| e.origin.clone())
            .unwrap_or_else(|| "http://127.0.0.1:80".to_string())
    }

    /// Called on every selection; schedules one probe cycle if the
    /// configured interval has elapsed, setting the next mark before
    /// dispatch so concurrent selectors never double-schedule.
    pub fn maybe_schedule_probe(self: &Arc<Self>) {
        let now = now_ms();
        let current = self.next_probe_at.load(Ordering::Acquire);
        if now < current {
            return;
        }
        let next = now + self.probe_interval.as_millis() as i64;
        if self
            .next_probe_at
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.run_probe_cycle().await;
            pool.probe_in_flight.store(false, Ordering::Release);
        });
    }

    async fn run_probe_cycle(self: &Arc<Self>) {
        let mut handles = Vec::with_capacity(self.entries.len());
        for entry in self.entries.iter().cloned() {
            let client = self.http_client.clone();
            let pool = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let url = format!("{}/health", entry.origin);
                let ok = match client.get(&url).send().await {
                    Ok(resp) => resp.status().as_u16() < 500,
                    Err(_) => false,
                };
                crate::metrics::record_probe(!ok);
                if ok {
                    pool.report_success(&entry.origin);
                } else {
                    pool.report_failure(&entry.origin);
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        crate::metrics::set_backend_gauges(self.healthy_count(), self.entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(origin: &str, weight: u32) -> BackendConfig {
        BackendConfig {
            origin: origin.to_string(),
            weight,
        }
    }

    #[test]
    fn test_single_failure_flips_unhealthy() {
        let pool = BackendPool::new(&[cfg("http://a:80", 1)], false, Duration::from_secs(30));
        assert!(pool.entries()[0].is_healthy());
        pool.report_failure("http://a:80");
        assert!(!pool.entries()[0].is_healthy());
    }

    #[test]
    fn test_requires_two_successes_to_recover() {
        let pool = BackendPool::new(&[cfg("http://a:80", 1)], false, Duration::from_secs(30));
        pool.report_failure("http://a:80");
        assert!(!pool.entries()[0].is_healthy());
        pool.report_success("http://a:80");
        assert!(!pool.entries()[0].is_healthy());
        pool.report_success("http://a:80");
        assert!(pool.entries()[0].is_healthy());
    }

    #[test]
    fn test_select_excludes_tried_origins() {
        let pool = BackendPool::new(
            &[cfg("http://a:80", 1), cfg("http://b:80", 1)],
            false,
            Duration::from_secs(30),
        );
        let mut excl = HashSet::new();
        excl.insert("http://a:80".to_string());
        for _ in 0..20 {
            assert_eq!(pool.select(&excl), "http://b:80");
        }
    }

    #[test]
    fn test_sticky_picks_first_healthy() {
        let pool = BackendPool::new(
            &[cfg("http://a:80", 1), cfg("http://b:80", 1)],
            true,
            Duration::from_secs(30),
        );
        pool.report_failure("http://a:80");
        let excl = HashSet::new();
        assert_eq!(pool.select(&excl), "http://b:80");
    }

    #[test]
    fn test_all_unhealthy_falls_back_to_full_set() {
        let pool = BackendPool::new(&[cfg("http://a:80", 1)], false, Duration::from_secs(30));
        pool.report_failure("http://a:80");
        let excl = HashSet::new();
        assert_eq!(pool.select(&excl), "http://a:80");
    }
}
