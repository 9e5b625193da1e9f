//! The iterative resolver: walks delegations from the root, drives
//! qname minimization, selects caches, races servers, and validates

pub mod context;
pub mod lookup;

pub use context::ResolveContext;

use crate::anchors::TrustAnchors;
use crate::breaker::CircuitBreaker;
use crate::cache::{
    question_key, AuthServer, AuthServerSet, GlueCache, IpFamily, NsCache, NsEntry,
};
use crate::config::Config;
use crate::dns::message::{Message, Rcode, Record};
use crate::dns::name::Name;
use crate::dns::rdata::{RData, RrType};
use crate::dnssec::sig::{key_map, verify_ds, verify_rrsig_msg};
use crate::dnssec::{self, find_rrsig_signer, has_nsec, has_nsec3, now_unix};
use crate::error::ResolveError;
use crate::exchange::{Exchanger, DEFAULT_UDP_SIZE};
use crate::handler::Chain;
use crate::singleflight::SingleFlight;
use crate::tcp_pool::TcpPool;
use async_recursion::async_recursion;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Cache capacity for delegations and each glue family.
const NS_CACHE_SIZE: usize = 10_240;
const GLUE_CACHE_SIZE: usize = 10_240;

/// Set-wide failures before the server set is re-checked.
const SET_FAILURE_RECHECK: u32 = 5;

/// Concurrent internal lookups during a set re-check.
const CHECK_NSS_PARALLELISM: usize = 4;

/// Delay before background AAAA glue discovery starts.
const V6_LOOKUP_DELAY: Duration = Duration::from_millis(500);

/// Cadence of root priming and trust-anchor refresh.
const MAINTAIN_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// The recursive resolution engine and its shared state.
pub struct Resolver {
    pub(crate) dnssec: bool,
    ipv6_access: bool,
    maxdepth: u32,
    query_timeout: Duration,
    qname_min_level: usize,
    pub(crate) max_concurrent_queries: usize,
    pub(crate) exchanger: Exchanger,
    pub(crate) ncache: NsCache,
    glue4: GlueCache,
    glue6: GlueCache,
    pub(crate) breaker: Arc<CircuitBreaker>,
    sflight: Arc<SingleFlight>,
    tcp_pool: Arc<TcpPool>,
    pub(crate) semaphore: Arc<Semaphore>,
    anchors: Arc<TrustAnchors>,
    root_servers: RwLock<Arc<AuthServerSet>>,
    root_keys: RwLock<Vec<Record>>,
    chain: RwLock<Option<Chain>>,
}

impl Resolver {
    pub fn new(cfg: &Config, anchors: Arc<TrustAnchors>) -> Arc<Self> {
        let tcp_pool = Arc::new(TcpPool::new(
            cfg.tcp_max_connections,
            cfg.root_tcp_timeout(),
            cfg.tld_tcp_timeout(),
        ));
        let exchanger = Exchanger::new(
            cfg.net_timeout(),
            cfg.outbound_ips.clone(),
            cfg.outbound_ip6s.clone(),
            cfg.tcp_keepalive,
            tcp_pool.clone(),
        );

        let roots = AuthServerSet::new(Name::root(), false);
        for addr in &cfg.root_servers {
            roots.add_server(Arc::new(AuthServer::new(addr.clone(), IpFamily::V4)));
        }
        if cfg.ipv6_access {
            for addr in &cfg.root6_servers {
                roots.add_server(Arc::new(AuthServer::new(addr.clone(), IpFamily::V6)));
            }
        }

        Arc::new(Resolver {
            dnssec: cfg.dnssec,
            ipv6_access: cfg.ipv6_access,
            maxdepth: cfg.maxdepth,
            query_timeout: cfg.query_timeout(),
            qname_min_level: cfg.qname_min_level,
            max_concurrent_queries: cfg.max_concurrent_queries,
            exchanger,
            ncache: NsCache::new(NS_CACHE_SIZE),
            glue4: GlueCache::new(GLUE_CACHE_SIZE, RrType::A),
            glue6: GlueCache::new(GLUE_CACHE_SIZE, RrType::Aaaa),
            breaker: Arc::new(CircuitBreaker::new()),
            sflight: Arc::new(SingleFlight::new()),
            tcp_pool,
            semaphore: Arc::new(Semaphore::new(cfg.max_concurrent_queries)),
            anchors,
            root_servers: RwLock::new(Arc::new(roots)),
            root_keys: RwLock::new(Vec::new()),
            chain: RwLock::new(None),
        })
    }

    /// Wire the middleware chain the resolver re-enters for DS, DNSKEY,
    /// glue, and CNAME-chain lookups.
    pub fn attach_chain(&self, chain: Chain) {
        *self.chain.write() = Some(chain);
    }

    /// Spawn every background loop: cache sweepers, priming, and
    /// trust-anchor maintenance.
    pub fn start_background(self: &Arc<Self>) {
        self.breaker.start_sweeper();
        self.sflight.start_sweeper();
        self.tcp_pool.start_sweeper();

        let resolver = self.clone();
        tokio::spawn(async move {
            resolver.prime().await;
            let mut interval = tokio::time::interval(MAINTAIN_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                resolver.prime().await;
            }
        });

        if self.dnssec {
            let resolver = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(MAINTAIN_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if let Err(err) = resolver.refresh_anchors().await {
                        warn!("trust anchor refresh failed: {}", err);
                    }
                }
            });
        }
    }

    pub fn root_server_addrs(&self) -> Vec<String> {
        self.root_servers.read().addrs()
    }

    pub fn ncache_len(&self) -> usize {
        self.ncache.len()
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Resolve one request to a final response.
    pub async fn resolve(self: &Arc<Self>, req: &Message, nested: bool) -> Result<Message, ResolveError> {
        let deadline = Instant::now() + self.query_timeout;
        let mut rctx = ResolveContext::new(deadline, self.maxdepth);
        rctx.nested = nested;
        let servers = self.root_servers.read().clone();
        Arc::clone(self).iterate(req.clone(), servers, rctx).await
    }

    #[async_recursion]
    async fn iterate(
        self: Arc<Self>,
        req: Message,
        mut servers: Arc<AuthServerSet>,
        mut rctx: ResolveContext,
    ) -> Result<Message, ResolveError> {
        let q = req.q().ok_or(ResolveError::NoResponse)?.clone();
        let cd = req.checking_disabled;

        // first step: start from the deepest cached delegation
        if rctx.is_root {
            rctx.is_root = false;
            let (found, level) = self.ncache.find_deepest(&q.name, q.qtype, cd);
            match found {
                Some(entry) => {
                    debug!(
                        "starting {} from cached delegation {} (level {})",
                        q.name, entry.servers.zone, level
                    );
                    servers = entry.servers.clone();
                    rctx.parent_ds = entry.ds.clone();
                    rctx.level = level;
                }
                None => {
                    if self.dnssec && !cd {
                        rctx.parent_ds = self.anchors.to_ds();
                    }
                }
            }
        }

        // qname minimization: ask the next ancestor for its NS set only
        let minimized_target = if self.qname_min_level > 0
            && !rctx.no_minimize
            && rctx.level < self.qname_min_level
        {
            let target = q.name.ancestor(rctx.level + 1);
            (target != q.name).then_some(target)
        } else {
            None
        };
        let minimized = minimized_target.is_some();

        let mut out_req = match &minimized_target {
            Some(target) => {
                let mut m = Message::query(target.clone(), RrType::Ns);
                m.checking_disabled = cd;
                m
            }
            None => {
                let mut m = Message::query(q.name.clone(), q.qtype);
                m.checking_disabled = cd;
                m
            }
        };
        out_req.recursion_desired = false;
        out_req.set_edns(DEFAULT_UDP_SIZE, self.dnssec);

        let resp = self
            .group_lookup(&out_req, &servers, rctx.level, rctx.deadline)
            .await;
        let mut resp = match resp {
            Ok(resp) => {
                servers.reset_errors();
                resp
            }
            Err(err) => {
                if minimized {
                    debug!("minimized walk for {} failed ({}), retrying plain", q.name, err);
                    rctx.no_minimize = true;
                    return Arc::clone(&self).iterate(req, servers, rctx).await;
                }
                if err.is_transport() && !rctx.nested {
                    let failures = servers.record_error();
                    if failures >= SET_FAILURE_RECHECK && !servers.is_checked() {
                        servers.mark_checked();
                        self.check_nss(&servers, cd).await;
                        return Arc::clone(&self).iterate(req, servers, rctx).await;
                    }
                }
                return Err(err);
            }
        };

        // negative reply with nothing else: advance under minimization,
        // otherwise hand it to the caller as-is
        if resp.rcode != Rcode::Success && resp.answer.is_empty() && resp.ns.is_empty() {
            if minimized {
                rctx.level += 1;
                return Arc::clone(&self).iterate(req, servers, rctx).await;
            }
            return Ok(self.finalize(resp, &req, &rctx));
        }

        if !minimized && !resp.answer.is_empty() {
            if resp.rcode == Rcode::NameError {
                return self.authority_response(&req, resp, &rctx).await;
            }
            if resp.rcode != Rcode::Success {
                // answers alongside an error code: trust the records
                resp.rcode = Rcode::Success;
            }
            return self.answer_response(&req, resp, &mut rctx).await;
        }

        if minimized && (!resp.answer.is_empty() || resp.ns.is_empty()) {
            rctx.level += 1;
            return Arc::clone(&self).iterate(req, servers, rctx).await;
        }

        if !resp.ns.is_empty() {
            let has_soa = resp.ns.iter().any(|rr| rr.rrtype == RrType::Soa);
            let has_cname = resp.ns.iter().any(|rr| rr.rrtype == RrType::Cname);
            if minimized && (has_soa || has_cname) {
                rctx.level += 1;
                return Arc::clone(&self).iterate(req, servers, rctx).await;
            }
            if has_soa || resp.rcode == Rcode::NameError {
                return self.authority_response(&req, resp, &rctx).await;
            }
            return self.process_delegation(req, resp, servers, rctx).await;
        }

        // neither answer nor authority: synthesize an empty success
        let mut empty = Message::new();
        empty.set_reply(&req);
        empty.recursion_available = true;
        Ok(empty)
    }

    /// Collapse concurrent identical questions into one race.
    async fn group_lookup(
        self: &Arc<Self>,
        req: &Message,
        servers: &Arc<AuthServerSet>,
        level: usize,
        deadline: Instant,
    ) -> Result<Message, ResolveError> {
        let q = req.q().ok_or(ResolveError::NoResponse)?;
        let key = question_key(&q.name, q.qtype, req.checking_disabled);
        let sorted = servers.sorted();
        let resolver = Arc::clone(self);
        let flight_req = req.clone();
        let shared = self
            .sflight
            .timed_do(key, deadline, move || {
                resolver.lookup_race(flight_req, sorted, level, deadline)
            })
            .await?;
        // every caller gets its own copy under its own transaction id
        let mut resp = (*shared).clone();
        resp.id = req.id;
        Ok(resp)
    }

    /// Positive answers: verify the chain of trust, then follow any
    /// unresolved CNAME chain through the middleware.
    async fn answer_response(
        self: &Arc<Self>,
        req: &Message,
        mut resp: Message,
        rctx: &mut ResolveContext,
    ) -> Result<Message, ResolveError> {
        let q = req.q().ok_or(ResolveError::NoResponse)?.clone();
        let cd = req.checking_disabled;

        if self.dnssec && !cd && !rctx.parent_ds.is_empty() {
            match find_rrsig_signer(&resp, &q.name, true) {
                Some(signer) => {
                    let ds = self
                        .find_ds(&signer, &q.name, &rctx.parent_ds, rctx.deadline)
                        .await?;
                    let secure = self.verify_chain(&signer, &resp, &ds).await?;
                    resp.authenticated_data = secure;
                }
                None => return Err(ResolveError::RrsigsMissing),
            }
        }

        // chase a cname chain the upstream left dangling
        if q.qtype != RrType::Cname {
            let mut target = q.name.clone();
            loop {
                let next = resp.answer.iter().find_map(|rr| match &rr.data {
                    RData::Cname(next) if rr.name == target => Some(next.clone()),
                    _ => None,
                });
                match next {
                    Some(next) => target = next,
                    None => break,
                }
            }
            let resolved = resp
                .answer
                .iter()
                .any(|rr| rr.rrtype == q.qtype && rr.name == target);
            if target != q.name && !resolved {
                if rctx.visit(RrType::Cname, &target) {
                    let sub = self
                        .lookup_internal(target, q.qtype, req.do_bit(), cd)
                        .await?;
                    resp.rcode = sub.rcode;
                    resp.authenticated_data &= sub.authenticated_data;
                    resp.answer.extend(sub.answer);
                } else {
                    debug!("cname loop at {} cut short", target);
                }
            }
        }

        Ok(self.finalize(resp, req, rctx))
    }

    /// Negative answers: verify the chain and the denial proof.
    async fn authority_response(
        self: &Arc<Self>,
        req: &Message,
        mut resp: Message,
        rctx: &ResolveContext,
    ) -> Result<Message, ResolveError> {
        let q = req.q().ok_or(ResolveError::NoResponse)?.clone();
        let cd = req.checking_disabled;

        if self.dnssec && !cd && !rctx.parent_ds.is_empty() {
            match find_rrsig_signer(&resp, &q.name, false) {
                Some(signer) => {
                    let ds = self
                        .find_ds(&signer, &q.name, &rctx.parent_ds, rctx.deadline)
                        .await?;
                    let secure = self.verify_chain(&signer, &resp, &ds).await?;
                    if secure {
                        match resp.rcode {
                            Rcode::NameError => dnssec::verify_name_error(&q.name, &resp.ns)?,
                            Rcode::Success => dnssec::verify_nodata(&q.name, q.qtype, &resp.ns)?,
                            _ => {}
                        }
                    }
                    resp.authenticated_data = secure;
                }
                None => return Err(ResolveError::RrsigsMissing),
            }
        }

        Ok(self.finalize(resp, req, rctx))
    }

    /// A referral: validate it, derive the child server set, and walk
    /// down.
    async fn process_delegation(
        self: &Arc<Self>,
        req: Message,
        resp: Message,
        current: Arc<AuthServerSet>,
        mut rctx: ResolveContext,
    ) -> Result<Message, ResolveError> {
        let q = req.q().ok_or(ResolveError::NoResponse)?.clone();
        let cd = req.checking_disabled;

        let ns_records: Vec<&Record> = resp
            .ns
            .iter()
            .filter(|rr| rr.rrtype == RrType::Ns)
            .collect();
        let new_zone = match ns_records.first() {
            Some(rr) => rr.name.clone(),
            None => return Err(ResolveError::NoReachableAuthority),
        };

        // a delegation may never point at or above what is resolved
        if new_zone.label_count() < rctx.level {
            return Err(ResolveError::ParentDetection);
        }

        // chain of trust across the cut
        let mut child_ds: Vec<Record> = Vec::new();
        if self.dnssec && !cd && !rctx.parent_ds.is_empty() {
            match find_rrsig_signer(&resp, &new_zone, false) {
                None => {
                    if q.qtype == RrType::Ds {
                        return Err(ResolveError::Bogus(format!(
                            "unsigned referral for a ds question at {}",
                            new_zone
                        )));
                    }
                }
                Some(signer) => {
                    let ds = self
                        .find_ds(&signer, &q.name, &rctx.parent_ds, rctx.deadline)
                        .await?;
                    let secure = self.verify_chain(&signer, &resp, &ds).await?;
                    if secure {
                        let published: Vec<Record> = resp
                            .ns
                            .iter()
                            .filter(|rr| rr.rrtype == RrType::Ds)
                            .cloned()
                            .collect();
                        if !published.is_empty() {
                            child_ds = published;
                        } else if has_nsec3(&resp.ns) {
                            dnssec::nsec3::verify_delegation(&new_zone, &resp.ns)?;
                        } else if has_nsec(&resp.ns) {
                            dnssec::nsec::verify_unsigned_delegation(&new_zone, &resp.ns)?;
                        } else {
                            return Err(ResolveError::NsecMissing);
                        }
                    }
                }
            }
        }

        rctx.depth = rctx.depth.saturating_sub(1);
        if rctx.depth == 0 {
            return Err(ResolveError::MaxDepth);
        }

        let key = question_key(&new_zone, RrType::Ns, cd);
        if let Ok(entry) = self.ncache.get(key) {
            if entry.servers.same_servers(&current) {
                // walking in place burns budget twice as fast
                rctx.depth = rctx.depth.saturating_sub(1);
                if rctx.depth == 0 {
                    return Err(ResolveError::MaxDepth);
                }
            }
            rctx.level = new_zone.label_count();
            if !entry.ds.is_empty() {
                rctx.parent_ds = entry.ds.clone();
            } else {
                rctx.parent_ds = child_ds;
            }
            return Arc::clone(&self).iterate(req, entry.servers, rctx).await;
        }

        // fresh delegation: harvest glue and fill the gaps
        let hostnames: Vec<Name> = ns_records
            .iter()
            .filter_map(|rr| match &rr.data {
                RData::Ns(host) => Some(host.clone()),
                _ => None,
            })
            .collect();
        let ns_ttl = ns_records.iter().map(|rr| rr.ttl).min().unwrap_or(3600);

        let set = Arc::new(AuthServerSet::new(new_zone.clone(), cd));
        set.set_nss(hostnames.clone());
        let mut missing: Vec<Name> = Vec::new();
        for host in &hostnames {
            let before = set.len();
            self.harvest_glue(&set, host, &resp, rctx.level, ns_ttl);
            if set.len() == before {
                missing.push(host.clone());
            }
        }

        let entry = NsEntry::new(set.clone(), child_ds.clone());
        self.ncache.set_provisional(key, entry);

        if !missing.is_empty() {
            self.lookup_v4_nss(&set, &missing, &mut rctx, cd).await;
        }
        self.ncache.set(
            key,
            NsEntry::new(set.clone(), child_ds.clone()),
            Duration::from_secs(ns_ttl as u64),
        );

        if self.ipv6_access {
            self.spawn_v6_glue(&set, hostnames, cd);
        }

        if set.is_empty() {
            return Err(ResolveError::NoReachableAuthority);
        }

        rctx.level = new_zone.label_count();
        rctx.parent_ds = child_ds;
        Arc::clone(&self).iterate(req, set, rctx).await
    }

    /// Pull in-bailiwick glue addresses for `host` out of the additional
    /// section, feeding both the server set and the glue caches.
    fn harvest_glue(
        &self,
        set: &AuthServerSet,
        host: &Name,
        resp: &Message,
        level: usize,
        ttl: u32,
    ) {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for rr in &resp.extra {
            if rr.name != *host || rr.name.label_count() < level {
                continue;
            }
            match &rr.data {
                RData::A(ip) => {
                    if !ip.is_loopback() && !ip.is_unspecified() && !ip.is_link_local() {
                        v4.push(IpAddr::V4(*ip));
                        set.add_server(Arc::new(AuthServer::new(
                            format!("{}:53", ip),
                            IpFamily::V4,
                        )));
                    }
                }
                RData::Aaaa(ip) if self.ipv6_access => {
                    if !ip.is_loopback() && !ip.is_unspecified() {
                        v6.push(IpAddr::V6(*ip));
                        set.add_server(Arc::new(AuthServer::new(
                            format!("[{}]:53", ip),
                            IpFamily::V6,
                        )));
                    }
                }
                _ => {}
            }
        }
        if !v4.is_empty() {
            self.glue4.set(host, v4, Duration::from_secs(ttl as u64));
        }
        if !v6.is_empty() {
            self.glue6.set(host, v6, Duration::from_secs(ttl as u64));
        }
    }

    /// Resolve missing NS addresses over the middleware chain, breaking
    /// cycles through the context's visited list.
    async fn lookup_v4_nss(
        &self,
        set: &AuthServerSet,
        missing: &[Name],
        rctx: &mut ResolveContext,
        _cd: bool,
    ) {
        for host in missing {
            if let Ok(cached) = self.glue4.get(host) {
                for ip in cached {
                    set.add_server(Arc::new(AuthServer::new(
                        format!("{}:53", ip),
                        IpFamily::V4,
                    )));
                }
                continue;
            }
            if !rctx.visit(RrType::A, host) {
                debug!("skipping glue lookup for {} (cycle)", host);
                continue;
            }
            match self.lookup_internal(host.clone(), RrType::A, false, false).await {
                Ok(resp) => {
                    let mut ips = Vec::new();
                    let mut ttl = 3600u32;
                    for rr in &resp.answer {
                        if let RData::A(ip) = &rr.data {
                            ips.push(IpAddr::V4(*ip));
                            ttl = ttl.min(rr.ttl);
                            set.add_server(Arc::new(AuthServer::new(
                                format!("{}:53", ip),
                                IpFamily::V4,
                            )));
                        }
                    }
                    if !ips.is_empty() {
                        self.glue4.set(host, ips, Duration::from_secs(ttl as u64));
                    }
                }
                Err(err) => debug!("glue lookup for {} failed: {}", host, err),
            }
        }
    }

    /// Detached AAAA glue discovery; the server set is upgraded in place
    /// while it sits in the cache.
    fn spawn_v6_glue(self: &Arc<Self>, set: &Arc<AuthServerSet>, hostnames: Vec<Name>, _cd: bool) {
        let resolver = self.clone();
        let set = set.clone();
        tokio::spawn(async move {
            tokio::time::sleep(V6_LOOKUP_DELAY).await;
            for host in hostnames {
                if let Ok(cached) = resolver.glue6.get(&host) {
                    for ip in cached {
                        set.add_server(Arc::new(AuthServer::new(
                            format!("[{}]:53", ip),
                            IpFamily::V6,
                        )));
                    }
                    continue;
                }
                match resolver
                    .lookup_internal(host.clone(), RrType::Aaaa, false, false)
                    .await
                {
                    Ok(resp) => {
                        let mut ips = Vec::new();
                        let mut ttl = 3600u32;
                        for rr in &resp.answer {
                            if let RData::Aaaa(ip) = &rr.data {
                                ips.push(IpAddr::V6(*ip));
                                ttl = ttl.min(rr.ttl);
                                set.add_server(Arc::new(AuthServer::new(
                                    format!("[{}]:53", ip),
                                    IpFamily::V6,
                                )));
                            }
                        }
                        if !ips.is_empty() {
                            resolver.glue6.set(&host, ips, Duration::from_secs(ttl as u64));
                        }
                    }
                    Err(err) => debug!("aaaa glue lookup for {} failed: {}", host, err),
                }
            }
        });
    }

    /// Re-resolve every NS address of a repeatedly failing set, a few at
    /// a time.
    async fn check_nss(&self, set: &Arc<AuthServerSet>, _cd: bool) {
        let hostnames = set.nss();
        info!(
            "re-checking {} nameservers of {}",
            hostnames.len(),
            set.zone
        );
        for window in hostnames.chunks(CHECK_NSS_PARALLELISM) {
            let mut tasks = tokio::task::JoinSet::new();
            for host in window {
                let host = host.clone();
                let chain = self.chain.read().clone();
                let ipv6 = self.ipv6_access;
                tasks.spawn(async move {
                    let Some(chain) = chain else {
                        return (host, Vec::new());
                    };
                    let mut addrs: Vec<(IpAddr, IpFamily)> = Vec::new();
                    let mut req = Message::query(host.clone(), RrType::A);
                    req.id = rand::random();
                    req.recursion_desired = true;
                    if let Ok(resp) = chain.exchange_internal(req).await {
                        for rr in &resp.answer {
                            if let RData::A(ip) = &rr.data {
                                addrs.push((IpAddr::V4(*ip), IpFamily::V4));
                            }
                        }
                    }
                    if ipv6 {
                        let mut req = Message::query(host.clone(), RrType::Aaaa);
                        req.id = rand::random();
                        req.recursion_desired = true;
                        if let Ok(resp) = chain.exchange_internal(req).await {
                            for rr in &resp.answer {
                                if let RData::Aaaa(ip) = &rr.data {
                                    addrs.push((IpAddr::V6(*ip), IpFamily::V6));
                                }
                            }
                        }
                    }
                    (host, addrs)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                if let Ok((host, addrs)) = joined {
                    for (ip, family) in addrs {
                        let addr = match family {
                            IpFamily::V4 => format!("{}:53", ip),
                            IpFamily::V6 => format!("[{}]:53", ip),
                        };
                        if set.add_server(Arc::new(AuthServer::new(addr, family))) {
                            debug!("re-check found {} for {}", ip, host);
                        }
                    }
                }
            }
        }
    }

    /// Fetch (or synthesize) the DS set for `signer`, walking label by
    /// label from where the parent's DS left off.
    async fn find_ds(
        &self,
        signer: &Name,
        qname: &Name,
        parent_ds: &[Record],
        _deadline: Instant,
    ) -> Result<Vec<Record>, ResolveError> {
        if signer.is_root() && parent_ds.is_empty() {
            return Ok(self.anchors.to_ds());
        }
        let ds_owner = parent_ds
            .first()
            .map(|rr| rr.name.clone())
            .unwrap_or_else(Name::root);
        if ds_owner == *signer {
            return Ok(parent_ds.to_vec());
        }
        if !signer.is_subdomain_of(&ds_owner) {
            debug!("signer {} outside the covered zone {}", signer, ds_owner);
        }

        let _ = qname;
        let mut current = parent_ds.to_vec();
        for keep in ds_owner.label_count() + 1..=signer.label_count() {
            let zone = signer.ancestor(keep);
            let resp = self
                .lookup_internal(zone.clone(), RrType::Ds, true, false)
                .await?;
            let found: Vec<Record> = resp
                .answer
                .iter()
                .filter(|rr| rr.rrtype == RrType::Ds)
                .cloned()
                .collect();
            if found.is_empty() {
                // provably unsigned from this cut downward
                return Ok(Vec::new());
            }
            current = found;
        }
        Ok(current)
    }

    /// Verify `resp` against the DS set of `signer`. Returns whether the
    /// response is cryptographically secure; unsupported algorithms make
    /// it insecure rather than bogus.
    async fn verify_chain(
        self: &Arc<Self>,
        signer: &Name,
        resp: &Message,
        ds: &[Record],
    ) -> Result<bool, ResolveError> {
        if ds.is_empty() {
            return Ok(false);
        }
        // full answer section of the DNSKEY fetch, keys and signatures
        let key_rrs = self.fetch_dnskey(signer).await?;
        let keys: Vec<Record> = key_rrs
            .iter()
            .filter(|rr| rr.rrtype == RrType::Dnskey)
            .cloned()
            .collect();
        let kmap = key_map(&keys);
        let unsupported = verify_ds(&kmap, ds)?;
        if unsupported {
            debug!("treating {} as insecure (unsupported ds digest)", signer);
            return Ok(false);
        }
        // the key set is self-signed by the key the DS pinned
        verify_rrsig_msg(&kmap, &key_rrs, &[], now_unix())?;
        verify_rrsig_msg(&kmap, &resp.answer, &resp.ns, now_unix())?;
        Ok(true)
    }

    /// Fetch the DNSKEY RRset for a zone, returned with its signatures.
    /// The root set is validated against the trust anchors before use
    /// and cached.
    async fn fetch_dnskey(self: &Arc<Self>, signer: &Name) -> Result<Vec<Record>, ResolveError> {
        if signer.is_root() {
            {
                let cached = self.root_keys.read();
                if !cached.is_empty() {
                    return Ok(cached.clone());
                }
            }
            let resp = self
                .lookup_internal(Name::root(), RrType::Dnskey, true, true)
                .await?;
            let keys: Vec<Record> = resp
                .answer
                .iter()
                .filter(|rr| rr.rrtype == RrType::Dnskey)
                .cloned()
                .collect();
            if keys.is_empty() {
                return Err(ResolveError::DnskeyMissing);
            }
            let kmap = key_map(&keys);
            verify_ds(&kmap, &self.anchors.to_ds())?;
            verify_rrsig_msg(&kmap, &resp.answer, &[], now_unix())?;
            *self.root_keys.write() = resp.answer.clone();
            return Ok(resp.answer);
        }

        let resp = self
            .lookup_internal(signer.clone(), RrType::Dnskey, true, true)
            .await?;
        if !resp.answer.iter().any(|rr| rr.rrtype == RrType::Dnskey) {
            return Err(ResolveError::DnskeyMissing);
        }
        Ok(resp.answer)
    }

    /// Issue a lookup through the middleware chain so caching and the
    /// rest of the stack apply to resolver-internal questions too.
    pub(crate) async fn lookup_internal(
        &self,
        name: Name,
        qtype: RrType,
        do_bit: bool,
        cd: bool,
    ) -> Result<Message, ResolveError> {
        let chain = self.chain.read().clone();
        let chain = chain.ok_or(ResolveError::NoResponse)?;
        let mut req = Message::query(name, qtype);
        req.id = rand::random();
        req.recursion_desired = true;
        req.checking_disabled = cd;
        req.set_edns(DEFAULT_UDP_SIZE, do_bit);
        chain.exchange_internal(req).await
    }

    /// Shape an upstream response into the client-facing reply.
    fn finalize(&self, mut resp: Message, req: &Message, rctx: &ResolveContext) -> Message {
        resp.id = req.id;
        resp.response = true;
        resp.recursion_available = true;
        resp.recursion_desired = req.recursion_desired;
        resp.question = req.question.clone();
        if !rctx.keep_extra {
            resp.extra.retain(|rr| rr.rrtype == RrType::Opt);
        }
        if req.checking_disabled {
            resp.authenticated_data = false;
        }
        resp
    }

    /// Refresh the root server set from a `. NS` priming query.
    pub async fn prime(self: &Arc<Self>) {
        let mut req = Message::query(Name::root(), RrType::Ns);
        req.recursion_desired = false;
        req.set_edns(DEFAULT_UDP_SIZE, self.dnssec);

        let deadline = Instant::now() + self.query_timeout;
        let sorted = self.root_servers.read().sorted();
        let resp = match Arc::clone(self).lookup_race(req, sorted, 0, deadline).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!("root priming failed: {}", err);
                return;
            }
        };

        let ns_hosts: HashSet<Name> = resp
            .answer
            .iter()
            .chain(&resp.ns)
            .filter_map(|rr| match &rr.data {
                RData::Ns(host) => Some(host.clone()),
                _ => None,
            })
            .collect();

        let fresh = AuthServerSet::new(Name::root(), false);
        for rr in &resp.extra {
            if !ns_hosts.contains(&rr.name) {
                continue;
            }
            match &rr.data {
                RData::A(ip) => {
                    fresh.add_server(Arc::new(AuthServer::new(
                        format!("{}:53", ip),
                        IpFamily::V4,
                    )));
                }
                RData::Aaaa(ip) if self.ipv6_access => {
                    fresh.add_server(Arc::new(AuthServer::new(
                        format!("[{}]:53", ip),
                        IpFamily::V6,
                    )));
                }
                _ => {}
            }
        }

        if fresh.is_empty() {
            warn!("root priming produced no addresses, keeping the previous set");
            return;
        }
        if fresh.len() < ns_hosts.len() {
            warn!(
                "root priming resolved {} of {} servers",
                fresh.len(),
                ns_hosts.len()
            );
        }
        info!("root server set primed with {} addresses", fresh.len());
        *self.root_servers.write() = Arc::new(fresh);
    }

    /// Probe `. DNSKEY`, verify it against the current anchors, and run
    /// the rollover state machine.
    pub async fn refresh_anchors(self: &Arc<Self>) -> Result<(), ResolveError> {
        let resp = self
            .lookup_internal(Name::root(), RrType::Dnskey, true, true)
            .await?;
        let keys: Vec<Record> = resp
            .answer
            .iter()
            .filter(|rr| rr.rrtype == RrType::Dnskey)
            .cloned()
            .collect();
        if keys.is_empty() {
            return Err(ResolveError::DnskeyMissing);
        }

        let kmap = key_map(&keys);
        verify_ds(&kmap, &self.anchors.to_ds())?;
        verify_rrsig_msg(&kmap, &resp.answer, &[], now_unix())?;

        if self.anchors.observe(&keys, chrono::Utc::now().timestamp()) {
            if let Err(err) = self.anchors.persist() {
                warn!("failed to persist trust anchors: {}", err);
            }
        }
        *self.root_keys.write() = resp.answer;
        info!("trust anchors refreshed ({} valid)", self.anchors.valid_keys().len());
        Ok(())
    }

    /// Purge cached delegations for a name, both cd states.
    pub fn purge(&self, name: &Name, qtype: RrType) {
        for cd in [false, true] {
            self.ncache.remove(question_key(name, RrType::Ns, cd));
            self.ncache.remove(question_key(name, qtype, cd));
        }
        self.glue4.remove(name);
        self.glue6.remove(name);
    }

    /// Servers behind the deepest cached delegation for a name, for the
    /// CHAOS-class diagnostic dump.
    pub fn debug_servers(&self, name: &Name) -> (Name, Vec<String>) {
        let (found, _) = self.ncache.find_deepest(name, RrType::Ns, false);
        match found {
            Some(entry) => (entry.servers.zone.clone(), entry.servers.addrs()),
            None => {
                let roots = self.root_servers.read();
                (Name::root(), roots.addrs())
            }
        }
    }
}
