//! Per-server circuit breaker: consecutive failures disable a server
//! until a cool-down elapses

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Consecutive failures before a server is disabled.
pub const FAILURE_THRESHOLD: u32 = 5;

/// Idle time after which a disabled server is retried.
pub const RESET_AFTER: Duration = Duration::from_secs(30);

/// Sweep cadence for stale records.
pub const GC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Healthy records idle longer than this are evicted by the sweep.
const GC_IDLE: Duration = Duration::from_secs(5 * 60);

/// Failure state for one server. All fields update lock-free.
struct ServerFailure {
    fails: AtomicU32,
    /// Milliseconds since the breaker's epoch.
    last_failure_ms: AtomicU64,
    disabled: AtomicBool,
}

impl ServerFailure {
    fn new() -> Self {
        ServerFailure {
            fails: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            disabled: AtomicBool::new(false),
        }
    }
}

/// Tracks per-server consecutive failures. The map takes a write lock
/// only to insert; queries and updates run under the read lock.
pub struct CircuitBreaker {
    servers: RwLock<HashMap<String, Arc<ServerFailure>>>,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        CircuitBreaker {
            servers: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }

    fn ms_at(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn entry(&self, addr: &str) -> Arc<ServerFailure> {
        if let Some(entry) = self.servers.read().get(addr) {
            return entry.clone();
        }
        self.servers
            .write()
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(ServerFailure::new()))
            .clone()
    }

    /// Count a failed exchange against `addr`.
    pub fn record_failure(&self, addr: &str) {
        self.record_failure_at(addr, Instant::now());
    }

    pub fn record_failure_at(&self, addr: &str, now: Instant) {
        let entry = self.entry(addr);
        let fails = entry.fails.fetch_add(1, Ordering::Relaxed) + 1;
        entry.last_failure_ms.store(self.ms_at(now), Ordering::Relaxed);
        if fails >= FAILURE_THRESHOLD && !entry.disabled.swap(true, Ordering::Relaxed) {
            warn!(
                "circuit breaker tripped for {} after {} consecutive failures",
                addr, fails
            );
        }
    }

    /// Clear failure state after a successful exchange.
    pub fn record_success(&self, addr: &str) {
        let entry = match self.servers.read().get(addr) {
            Some(entry) => entry.clone(),
            None => return,
        };
        entry.fails.store(0, Ordering::Relaxed);
        if entry.disabled.swap(false, Ordering::Relaxed) {
            info!("circuit breaker reset for {}", addr);
        }
    }

    /// Whether the server may be queried right now.
    pub fn can_query(&self, addr: &str) -> bool {
        self.can_query_at(addr, Instant::now())
    }

    pub fn can_query_at(&self, addr: &str, now: Instant) -> bool {
        let entry = match self.servers.read().get(addr) {
            Some(entry) => entry.clone(),
            None => return true,
        };
        if !entry.disabled.load(Ordering::Relaxed) {
            return true;
        }
        let last = entry.last_failure_ms.load(Ordering::Relaxed);
        if self.ms_at(now).saturating_sub(last) > RESET_AFTER.as_millis() as u64 {
            entry.fails.store(0, Ordering::Relaxed);
            entry.disabled.store(false, Ordering::Relaxed);
            debug!("circuit breaker cooled down for {}", addr);
            return true;
        }
        false
    }

    /// Drop healthy records whose last failure is old news.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    pub fn sweep_at(&self, now: Instant) {
        let cutoff = self.ms_at(now).saturating_sub(GC_IDLE.as_millis() as u64);
        let mut servers = self.servers.write();
        let before = servers.len();
        servers.retain(|_, entry| {
            entry.fails.load(Ordering::Relaxed) != 0
                || entry.last_failure_ms.load(Ordering::Relaxed) >= cutoff
        });
        let dropped = before - servers.len();
        if dropped > 0 {
            debug!("circuit breaker swept {} idle records", dropped);
        }
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detached task sweeping stale records every five minutes.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let breaker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                breaker.sweep();
            }
        })
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        CircuitBreaker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_after_five_failures() {
        let breaker = CircuitBreaker::new();
        let addr = "192.0.2.1:53";
        let now = Instant::now();

        for i in 0..FAILURE_THRESHOLD {
            assert!(breaker.can_query_at(addr, now), "failure {}", i);
            breaker.record_failure_at(addr, now);
        }
        assert!(!breaker.can_query_at(addr, now));
    }

    #[test]
    fn test_auto_reset_after_cooldown() {
        let breaker = CircuitBreaker::new();
        let addr = "192.0.2.1:53";
        let now = Instant::now();

        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure_at(addr, now);
        }
        assert!(!breaker.can_query_at(addr, now + Duration::from_secs(29)));
        assert!(breaker.can_query_at(addr, now + Duration::from_secs(31)));
        // reset cleared the tally as well
        breaker.record_failure_at(addr, now + Duration::from_secs(32));
        assert!(breaker.can_query_at(addr, now + Duration::from_secs(32)));
    }

    #[test]
    fn test_success_clears_state() {
        let breaker = CircuitBreaker::new();
        let addr = "192.0.2.2:53";
        let now = Instant::now();

        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure_at(addr, now);
        }
        assert!(!breaker.can_query_at(addr, now));
        breaker.record_success(addr);
        assert!(breaker.can_query_at(addr, now));
    }

    #[test]
    fn test_sweep_evicts_idle_healthy_records() {
        let breaker = CircuitBreaker::new();
        let now = Instant::now();
        breaker.record_failure_at("192.0.2.3:53", now);
        breaker.record_success("192.0.2.3:53");
        assert_eq!(breaker.len(), 1);

        breaker.sweep_at(now + Duration::from_secs(301));
        assert_eq!(breaker.len(), 0);
    }

    #[test]
    fn test_sweep_keeps_failing_records() {
        let breaker = CircuitBreaker::new();
        let now = Instant::now();
        breaker.record_failure_at("192.0.2.4:53", now);
        breaker.sweep_at(now + Duration::from_secs(600));
        assert_eq!(breaker.len(), 1);
    }

    #[test]
    fn test_unknown_server_is_queryable() {
        let breaker = CircuitBreaker::new();
        assert!(breaker.can_query("203.0.113.9:53"));
    }
}
