//! Idle TCP connections to root and TLD servers, kept alive under
//! EDNS keepalive

use crate::dns::message::Message;
use crate::dns::name::Name;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Default cap across both maps.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Default idle timeout for root-server connections.
pub const DEFAULT_ROOT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default idle timeout for TLD-server connections.
pub const DEFAULT_TLD_TIMEOUT: Duration = Duration::from_secs(10);

/// Sweep cadence for expired idle connections.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Host prefixes of the 13 IANA root server addresses, plus loopback so
/// tests can stand in a fake root.
const ROOT_PREFIXES: [&str; 14] = [
    "198.41.0.", "170.247.170.", "192.33.4.", "199.7.91.", "192.203.230.", "192.5.5.",
    "192.112.36.", "198.97.190.", "192.36.148.", "192.58.128.", "193.0.14.", "199.7.83.",
    "202.12.27.", "127.0.0.",
];

/// Whether `addr` (`host:port`) points at a root server.
pub fn is_root_server(addr: &str) -> bool {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    ROOT_PREFIXES.iter().any(|p| host.starts_with(p))
}

/// Whether the question targets a TLD zone (exactly two labels, e.g.
/// `example.com.`).
pub fn is_tld_query(name: &Name) -> bool {
    name.label_count() == 2
}

struct PooledConn {
    stream: TcpStream,
    last_used: Instant,
    idle_timeout: Duration,
}

impl PooledConn {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_used) > self.idle_timeout
    }
}

/// Connection pool with disjoint root and TLD maps. Connections to any
/// other server are closed on `put`.
pub struct TcpPool {
    root: Mutex<HashMap<String, PooledConn>>,
    tld: Mutex<HashMap<String, PooledConn>>,
    max_connections: usize,
    root_timeout: Duration,
    tld_timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TcpPool {
    pub fn new(max_connections: usize, root_timeout: Duration, tld_timeout: Duration) -> Self {
        TcpPool {
            root: Mutex::new(HashMap::new()),
            tld: Mutex::new(HashMap::new()),
            max_connections,
            root_timeout,
            tld_timeout,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Detach a live connection for `addr`, if one is pooled.
    pub fn get(&self, addr: &str, is_root: bool, is_tld: bool) -> Option<TcpStream> {
        let map = if is_root {
            &self.root
        } else if is_tld {
            &self.tld
        } else {
            return None;
        };
        let conn = map.lock().remove(addr);
        match conn {
            Some(conn) if !conn.expired(Instant::now()) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(conn.stream)
            }
            Some(_) => {
                // expired: dropping closes it
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Return a connection after a clean exchange. `response` supplies
    /// the server's keepalive suggestion, which can only lower the idle
    /// timeout.
    pub fn put(
        &self,
        stream: TcpStream,
        addr: &str,
        is_root: bool,
        is_tld: bool,
        response: Option<&Message>,
    ) {
        let (map, default_timeout) = if is_root {
            (&self.root, self.root_timeout)
        } else if is_tld {
            (&self.tld, self.tld_timeout)
        } else {
            // not poolable: dropping closes it
            return;
        };

        if self.active() >= self.max_connections {
            debug!("tcp pool full, closing connection to {}", addr);
            return;
        }

        let mut idle_timeout = default_timeout;
        if let Some(suggested) = response.and_then(|m| m.keepalive_timeout()) {
            if suggested < idle_timeout {
                idle_timeout = suggested;
            }
        }

        map.lock().insert(
            addr.to_string(),
            PooledConn {
                stream,
                last_used: Instant::now(),
                idle_timeout,
            },
        );
    }

    /// Close idle-expired connections.
    pub fn sweep(&self) {
        let now = Instant::now();
        for map in [&self.root, &self.tld] {
            map.lock().retain(|_, conn| !conn.expired(now));
        }
    }

    pub fn active(&self) -> usize {
        self.root.lock().len() + self.tld.lock().len()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Detached task closing expired connections every 30 seconds.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                pool.sweep();
            }
        })
    }
}

impl Default for TcpPool {
    fn default() -> Self {
        TcpPool::new(
            DEFAULT_MAX_CONNECTIONS,
            DEFAULT_ROOT_TIMEOUT,
            DEFAULT_TLD_TIMEOUT,
        )
    }
}
