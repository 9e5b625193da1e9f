//! Nameserver cache and glue-address caches

pub mod server;
pub mod ttl_lru;

pub use server::{sort_by_rtt, AuthServer, AuthServerSet, IpFamily};
pub use ttl_lru::{CacheMiss, TtlLru};

use crate::dns::message::Record;
use crate::dns::name::Name;
use crate::dns::rdata::RrType;
use siphasher::sip::SipHasher24;
use std::hash::Hasher;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lower clamp for cached delegations.
pub const NS_TTL_MIN: Duration = Duration::from_secs(60 * 60);

/// Upper clamp for cached delegations.
pub const NS_TTL_MAX: Duration = Duration::from_secs(12 * 60 * 60);

/// Lifetime of a provisional entry inserted while glue is still being
/// discovered.
pub const NS_TTL_PROVISIONAL: Duration = Duration::from_secs(60);

/// Stable key for `(question, cd)` pairs shared by the caches and the
/// in-flight deduplicator.
pub fn question_key(name: &Name, qtype: RrType, cd: bool) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(0x6972_6f6e, 0x726f_6f74);
    for b in name.as_str().as_bytes() {
        hasher.write_u8(b.to_ascii_lowercase());
    }
    hasher.write_u16(qtype.to_u16());
    hasher.write_u8(cd as u8);
    hasher.finish()
}

/// A cached delegation: the server set plus the DS records covering its
/// zone.
#[derive(Clone)]
pub struct NsEntry {
    pub servers: Arc<AuthServerSet>,
    pub ds: Vec<Record>,
}

impl NsEntry {
    pub fn new(servers: Arc<AuthServerSet>, ds: Vec<Record>) -> Self {
        NsEntry { servers, ds }
    }
}

/// TTL-bounded zone-to-authority mapping.
pub struct NsCache {
    inner: TtlLru<u64, NsEntry>,
}

impl NsCache {
    pub fn new(capacity: usize) -> Self {
        NsCache {
            inner: TtlLru::new(capacity),
        }
    }

    pub fn get(&self, key: u64) -> Result<NsEntry, CacheMiss> {
        self.inner.get(&key)
    }

    pub fn get_at(&self, key: u64, now: Instant) -> Result<NsEntry, CacheMiss> {
        self.inner.get_at(&key, now)
    }

    /// Store a delegation, clamping the TTL into `[1 h, 12 h]`.
    pub fn set(&self, key: u64, entry: NsEntry, ttl: Duration) {
        let ttl = ttl.clamp(NS_TTL_MIN, NS_TTL_MAX);
        self.inner.set(key, entry, ttl);
    }

    /// Store a short-lived entry while glue discovery is in progress.
    pub fn set_provisional(&self, key: u64, entry: NsEntry) {
        self.inner.set(key, entry, NS_TTL_PROVISIONAL);
    }

    pub fn remove(&self, key: u64) -> bool {
        self.inner.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Find the deepest cached delegation at or above `name`, returning
    /// the entry and the matched zone's label count. DS questions start
    /// one label up since the parent holds the answer.
    pub fn find_deepest(&self, name: &Name, qtype: RrType, cd: bool) -> (Option<NsEntry>, usize) {
        let mut zone = name.clone();
        if qtype == RrType::Ds && !zone.is_root() {
            zone = zone.parent();
        }
        loop {
            let key = question_key(&zone, RrType::Ns, cd);
            if let Ok(entry) = self.inner.get(&key) {
                return (Some(entry), zone.label_count());
            }
            if zone.is_root() {
                return (None, 0);
            }
            zone = zone.parent();
        }
    }
}

/// Address records discovered for one NS host name.
pub struct GlueCache {
    inner: TtlLru<u64, Vec<IpAddr>>,
    family: RrType,
}

impl GlueCache {
    pub fn new(capacity: usize, family: RrType) -> Self {
        GlueCache {
            inner: TtlLru::new(capacity),
            family,
        }
    }

    fn key(&self, host: &Name) -> u64 {
        question_key(host, self.family, false)
    }

    pub fn get(&self, host: &Name) -> Result<Vec<IpAddr>, CacheMiss> {
        self.inner.get(&self.key(host))
    }

    pub fn set(&self, host: &Name, addrs: Vec<IpAddr>, ttl: Duration) {
        self.inner.set(self.key(host), addrs, ttl);
    }

    pub fn remove(&self, host: &Name) -> bool {
        self.inner.remove(&self.key(host))
    }
}
