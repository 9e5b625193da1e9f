//! Parallel server racing: staggered fan-out over the RTT-sorted
//! candidate list, first good answer wins

use crate::cache::server::AuthServer;
use crate::dns::message::{Message, Rcode};
use crate::dns::rdata::RrType;
use crate::error::ResolveError;
use crate::exchange::Transport;
use crate::resolver::Resolver;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Servers launched immediately before staggering kicks in.
const FAST_START: usize = 2;

/// Stagger bounds around twice the candidate's mean RTT.
const STAGGER_MIN: Duration = Duration::from_millis(25);
const STAGGER_MAX: Duration = Duration::from_millis(300);
const STAGGER_DEFAULT: Duration = Duration::from_millis(100);

/// RTT penalty for a server answering with a lame referral.
const MISCONFIG_PENALTY: Duration = Duration::from_secs(2);

/// NXDOMAIN answers needed before returning one early at depth.
const NXDOMAIN_EARLY: usize = 3;

fn stagger_for(server: &AuthServer) -> Duration {
    if server.sample_count() == 0 {
        return STAGGER_DEFAULT;
    }
    (server.mean_rtt() * 2).clamp(STAGGER_MIN, STAGGER_MAX)
}

/// A referral is lame when it "delegates" at or above the level that was
/// already resolved.
fn is_lame_referral(resp: &Message, level: usize) -> bool {
    if resp.rcode != Rcode::Success || !resp.answer.is_empty() || resp.ns.is_empty() {
        return false;
    }
    resp.ns
        .iter()
        .filter(|rr| rr.rrtype == RrType::Ns)
        .any(|rr| rr.name.label_count() <= level)
}

type Probe = (Arc<AuthServer>, Result<Message, ResolveError>);

impl Resolver {
    async fn launch_probe(
        self: &Arc<Self>,
        set: &mut JoinSet<Probe>,
        req: &Message,
        server: &Arc<AuthServer>,
        deadline: Instant,
    ) -> bool {
        if !self.breaker.can_query(&server.addr) {
            debug!("skipping {} (circuit breaker open)", server.addr);
            return false;
        }

        let left = deadline.saturating_duration_since(Instant::now());
        let permit = match tokio::time::timeout(left, self.semaphore.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            _ => return false,
        };
        if self.semaphore.available_permits() * 10 < self.max_concurrent_queries {
            warn!(
                "concurrent upstream queries above 90% of the {} cap",
                self.max_concurrent_queries
            );
        }

        let resolver = self.clone();
        let server = server.clone();
        let mut req = req.clone();
        set.spawn(async move {
            let _permit = permit;
            let result = resolver
                .exchanger
                .exchange(deadline, Transport::Udp, &mut req, &server, 0)
                .await;
            (server, result)
        });
        true
    }

    /// Race the candidate servers for one question. The list must
    /// already be RTT-sorted.
    pub(crate) async fn lookup_race(
        self: Arc<Self>,
        req: Message,
        servers: Vec<Arc<AuthServer>>,
        level: usize,
        deadline: Instant,
    ) -> Result<Message, ResolveError> {
        if servers.is_empty() {
            return Err(ResolveError::NoReachableAuthority);
        }

        let mut set: JoinSet<Probe> = JoinSet::new();
        let mut idx = 0usize;

        while idx < servers.len() && set.len() < FAST_START {
            self.launch_probe(&mut set, &req, &servers[idx], deadline).await;
            idx += 1;
        }

        let mut nxdomain: Option<Message> = None;
        let mut nxdomain_count = 0usize;
        let mut error_resp: Option<Message> = None;
        let mut lame_resp: Option<Message> = None;

        loop {
            if set.is_empty() {
                if idx >= servers.len() {
                    break;
                }
                self.launch_probe(&mut set, &req, &servers[idx], deadline).await;
                idx += 1;
                continue;
            }

            let joined = if idx < servers.len() {
                let stagger = stagger_for(&servers[idx]);
                tokio::select! {
                    joined = set.join_next() => joined,
                    _ = tokio::time::sleep(stagger) => {
                        self.launch_probe(&mut set, &req, &servers[idx], deadline).await;
                        idx += 1;
                        continue;
                    }
                }
            } else {
                set.join_next().await
            };

            let (server, result) = match joined {
                Some(Ok(probe)) => probe,
                Some(Err(_)) | None => continue,
            };

            match result {
                Ok(resp) => {
                    self.breaker.record_success(&server.addr);
                    if is_lame_referral(&resp, level) {
                        debug!("{} answered a lame referral, penalizing", server.addr);
                        server.penalize(MISCONFIG_PENALTY);
                        lame_resp.get_or_insert(resp);
                        continue;
                    }
                    match resp.rcode {
                        Rcode::Success => return Ok(resp),
                        Rcode::NameError => {
                            nxdomain_count += 1;
                            nxdomain.get_or_insert(resp);
                            if nxdomain_count >= NXDOMAIN_EARLY || level < 2 {
                                return Ok(nxdomain.take().expect("just stored"));
                            }
                        }
                        _ => {
                            error_resp.get_or_insert(resp);
                        }
                    }
                }
                Err(err) => {
                    debug!("exchange with {} failed: {}", server.addr, err);
                    self.breaker.record_failure(&server.addr);
                }
            }
        }

        if let Some(resp) = nxdomain {
            return Ok(resp);
        }
        if let Some(resp) = error_resp {
            return Ok(resp);
        }
        if let Some(resp) = lame_resp {
            return Ok(resp);
        }
        Err(ResolveError::ConnectionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::message::Record;
    use crate::dns::name::Name;
    use crate::dns::rdata::RData;

    #[test]
    fn test_stagger_bounds() {
        let fresh = AuthServer::new("192.0.2.1:53", crate::cache::server::IpFamily::V4);
        assert_eq!(stagger_for(&fresh), STAGGER_DEFAULT);

        let quick = AuthServer::new("192.0.2.2:53", crate::cache::server::IpFamily::V4);
        quick.record_rtt(Duration::from_millis(5));
        assert_eq!(stagger_for(&quick), STAGGER_MIN);

        let slow = AuthServer::new("192.0.2.3:53", crate::cache::server::IpFamily::V4);
        slow.record_rtt(Duration::from_secs(1));
        assert_eq!(stagger_for(&slow), STAGGER_MAX);

        let mid = AuthServer::new("192.0.2.4:53", crate::cache::server::IpFamily::V4);
        mid.record_rtt(Duration::from_millis(60));
        assert_eq!(stagger_for(&mid), Duration::from_millis(120));
    }

    #[test]
    fn test_lame_referral_detection() {
        let mut resp = Message::new();
        resp.ns.push(Record::new(
            Name::parse("com.").unwrap(),
            RrType::Ns,
            3600,
            RData::Ns(Name::parse("a.gtld-servers.net.").unwrap()),
        ));
        // a "delegation" back to com. while already two labels deep
        assert!(is_lame_referral(&resp, 2));
        assert!(is_lame_referral(&resp, 1));
        // genuine downward delegation
        assert!(!is_lame_referral(&resp, 0));

        resp.answer.push(Record::new(
            Name::parse("x.com.").unwrap(),
            RrType::A,
            60,
            RData::A("192.0.2.1".parse().unwrap()),
        ));
        assert!(!is_lame_referral(&resp, 2));
    }
}
