//! Authoritative server candidates with lock-free health statistics

use crate::dns::name::Name;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Address family of a candidate server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// One candidate authoritative server. RTT accumulates lock-free:
/// `rtt / count` is the mean until a sort collapses the pair.
pub struct AuthServer {
    pub addr: String,
    pub family: IpFamily,
    rtt_nanos: AtomicU64,
    count: AtomicU64,
}

impl AuthServer {
    pub fn new(addr: impl Into<String>, family: IpFamily) -> Self {
        AuthServer {
            addr: addr.into(),
            family,
            rtt_nanos: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record one exchange's elapsed time, success or not.
    pub fn record_rtt(&self, elapsed: Duration) {
        self.rtt_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Penalize a misbehaving server without waiting for a timeout.
    pub fn penalize(&self, extra: Duration) {
        self.rtt_nanos
            .fetch_add(extra.as_nanos() as u64, Ordering::Relaxed);
        let _ = self
            .count
            .compare_exchange(0, 1, Ordering::Relaxed, Ordering::Relaxed);
    }

    /// Mean RTT, or zero when no sample exists yet.
    pub fn mean_rtt(&self) -> Duration {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.rtt_nanos.load(Ordering::Relaxed) / count)
    }

    pub fn sample_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Collapse the accumulated `(sum, count)` pair to `(mean, 1)`.
    /// Fresh servers become `(0, 1)` and therefore rank first.
    fn collapse(&self) {
        let count = self.count.swap(1, Ordering::Relaxed);
        if count > 1 {
            let sum = self.rtt_nanos.load(Ordering::Relaxed);
            self.rtt_nanos.store(sum / count, Ordering::Relaxed);
        } else if count == 0 {
            self.rtt_nanos.store(0, Ordering::Relaxed);
        }
    }

    fn rtt_key(&self) -> u64 {
        self.rtt_nanos.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for AuthServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, rtt {:?}, samples {})",
            self.addr,
            self.family,
            self.mean_rtt(),
            self.sample_count()
        )
    }
}

/// Collapse every server's statistics and order ascending by mean RTT.
/// The dispatch counter rotates servers that tie at the front so equal
/// candidates share the fast-start slots over time.
pub fn sort_by_rtt(servers: &mut Vec<Arc<AuthServer>>, dispatch: u64) {
    for server in servers.iter() {
        server.collapse();
    }
    servers.sort_by_key(|s| s.rtt_key());

    let lead = servers.first().map(|s| s.rtt_key());
    if let Some(lead) = lead {
        let ties = servers.iter().take_while(|s| s.rtt_key() == lead).count();
        if ties > 1 {
            let rot = (dispatch % ties as u64) as usize;
            servers[..ties].rotate_left(rot);
        }
    }
}

struct SetInner {
    servers: Vec<Arc<AuthServer>>,
    nss: Vec<Name>,
}

/// The ordered candidate set for one zone: servers, NS host names, error
/// accounting, and the flags the resolver tracks per delegation.
pub struct AuthServerSet {
    pub zone: Name,
    pub checking_disabled: bool,
    inner: RwLock<SetInner>,
    checked: AtomicBool,
    errors: AtomicU32,
    dispatch: AtomicU64,
}

impl AuthServerSet {
    pub fn new(zone: Name, checking_disabled: bool) -> Self {
        AuthServerSet {
            zone,
            checking_disabled,
            inner: RwLock::new(SetInner {
                servers: Vec::new(),
                nss: Vec::new(),
            }),
            checked: AtomicBool::new(false),
            errors: AtomicU32::new(0),
            dispatch: AtomicU64::new(0),
        }
    }

    pub fn with_servers(
        zone: Name,
        checking_disabled: bool,
        servers: Vec<Arc<AuthServer>>,
    ) -> Self {
        let set = AuthServerSet::new(zone, checking_disabled);
        set.inner.write().servers = servers;
        set
    }

    /// Append a server unless its address is already present.
    pub fn add_server(&self, server: Arc<AuthServer>) -> bool {
        let mut inner = self.inner.write();
        if inner.servers.iter().any(|s| s.addr == server.addr) {
            return false;
        }
        inner.servers.push(server);
        true
    }

    pub fn set_nss(&self, nss: Vec<Name>) {
        self.inner.write().nss = nss;
    }

    pub fn nss(&self) -> Vec<Name> {
        self.inner.read().nss.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the servers without ordering.
    pub fn snapshot(&self) -> Vec<Arc<AuthServer>> {
        self.inner.read().servers.clone()
    }

    /// Snapshot the servers ordered for dispatch.
    pub fn sorted(&self) -> Vec<Arc<AuthServer>> {
        let dispatch = self.dispatch.fetch_add(1, Ordering::Relaxed);
        let mut servers = self.snapshot();
        sort_by_rtt(&mut servers, dispatch);
        servers
    }

    /// Addresses of every server, for diagnostics.
    pub fn addrs(&self) -> Vec<String> {
        self.inner
            .read()
            .servers
            .iter()
            .map(|s| s.addr.clone())
            .collect()
    }

    pub fn mark_checked(&self) {
        self.checked.store(true, Ordering::Relaxed);
    }

    pub fn is_checked(&self) -> bool {
        self.checked.load(Ordering::Relaxed)
    }

    /// Count a set-wide resolution failure; returns the running total.
    pub fn record_error(&self) -> u32 {
        self.errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_errors(&self) {
        self.errors.store(0, Ordering::Relaxed);
    }

    /// True when both sets contain exactly the same addresses.
    pub fn same_servers(&self, other: &AuthServerSet) -> bool {
        let mut a = self.addrs();
        let mut b = other.addrs();
        a.sort();
        b.sort();
        a == b
    }
}

impl fmt::Debug for AuthServerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthServerSet({}, {} servers)", self.zone, self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_accumulation() {
        let s = AuthServer::new("192.0.2.1:53", IpFamily::V4);
        s.record_rtt(Duration::from_millis(10));
        s.record_rtt(Duration::from_millis(30));
        assert_eq!(s.sample_count(), 2);
        assert_eq!(s.mean_rtt(), Duration::from_millis(20));
    }

    #[test]
    fn test_sort_collapses_and_orders() {
        let fast = Arc::new(AuthServer::new("192.0.2.1:53", IpFamily::V4));
        let slow = Arc::new(AuthServer::new("192.0.2.2:53", IpFamily::V4));
        fast.record_rtt(Duration::from_millis(5));
        fast.record_rtt(Duration::from_millis(15));
        slow.record_rtt(Duration::from_millis(200));

        let mut servers = vec![slow.clone(), fast.clone()];
        sort_by_rtt(&mut servers, 0);

        for s in &servers {
            assert_eq!(s.sample_count(), 1);
        }
        let rtts: Vec<_> = servers.iter().map(|s| s.mean_rtt()).collect();
        let mut sorted = rtts.clone();
        sorted.sort();
        assert_eq!(rtts, sorted);
        assert_eq!(servers[0].addr, "192.0.2.1:53");
    }

    #[test]
    fn test_fresh_servers_rank_first() {
        let seen = Arc::new(AuthServer::new("192.0.2.1:53", IpFamily::V4));
        let fresh = Arc::new(AuthServer::new("192.0.2.2:53", IpFamily::V4));
        seen.record_rtt(Duration::from_millis(50));

        let mut servers = vec![seen, fresh];
        sort_by_rtt(&mut servers, 0);
        assert_eq!(servers[0].addr, "192.0.2.2:53");
        assert_eq!(servers[0].sample_count(), 1);
    }

    #[test]
    fn test_dispatch_rotates_ties() {
        let a = Arc::new(AuthServer::new("192.0.2.1:53", IpFamily::V4));
        let b = Arc::new(AuthServer::new("192.0.2.2:53", IpFamily::V4));
        let mut servers = vec![a.clone(), b.clone()];
        sort_by_rtt(&mut servers, 1);
        assert_eq!(servers[0].addr, "192.0.2.2:53");
    }

    #[test]
    fn test_set_dedupes_servers() {
        let set = AuthServerSet::new(Name::parse("example.com.").unwrap(), false);
        assert!(set.add_server(Arc::new(AuthServer::new("192.0.2.1:53", IpFamily::V4))));
        assert!(!set.add_server(Arc::new(AuthServer::new("192.0.2.1:53", IpFamily::V4))));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_error_counter() {
        let set = AuthServerSet::new(Name::root(), false);
        assert_eq!(set.record_error(), 1);
        assert_eq!(set.record_error(), 2);
        set.reset_errors();
        assert_eq!(set.record_error(), 1);
    }
}
