//! Middleware chain plumbing and the resolver's chain handler

use crate::dns::message::{Message, Rcode, Record};
use crate::dns::name::Name;
use crate::dns::rdata::{Class, RData, RrType};
use crate::error::ResolveError;
use crate::resolver::Resolver;
use async_trait::async_trait;
use base64::Engine;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Synthetic peer address for resolver-internal chain re-entry.
pub const INTERNAL_ADDR: &str = "127.0.0.255:0";

/// Environment variable gating the CHAOS-class server dump.
pub const DEBUG_NS_ENV: &str = "IRONROOT_DEBUGNS";

/// One link in the middleware chain. A handler must either write a
/// response or pass the request along with `ctx.next()`.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn serve(&self, ctx: &mut DnsContext);
}

/// Per-request state walked down the chain.
pub struct DnsContext {
    pub req: Message,
    pub remote: SocketAddr,
    /// Set for resolver-internal lookups re-entering the chain.
    pub internal: bool,
    resp: Option<Message>,
    index: usize,
    handlers: Arc<Vec<Arc<dyn Handler>>>,
}

impl DnsContext {
    /// Hand the request to the next handler in the chain.
    pub async fn next(&mut self) {
        let handler = self.handlers.get(self.index).cloned();
        if let Some(handler) = handler {
            self.index += 1;
            handler.serve(self).await;
        }
    }

    pub fn write(&mut self, msg: Message) {
        self.resp = Some(msg);
    }

    pub fn written(&self) -> bool {
        self.resp.is_some()
    }
}

/// The ordered handler chain. Cloning shares the same handlers.
#[derive(Clone)]
pub struct Chain {
    handlers: Arc<Vec<Arc<dyn Handler>>>,
}

impl Chain {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        Chain {
            handlers: Arc::new(handlers),
        }
    }

    /// Serve one client request to completion.
    pub async fn serve(&self, req: Message, remote: SocketAddr) -> Option<Message> {
        let mut ctx = DnsContext {
            req,
            remote,
            internal: false,
            resp: None,
            index: 0,
            handlers: self.handlers.clone(),
        };
        ctx.next().await;
        ctx.resp
    }

    /// Re-enter the chain for a resolver-internal question so caching
    /// and middleware apply uniformly.
    pub async fn exchange_internal(&self, req: Message) -> Result<Message, ResolveError> {
        let mut ctx = DnsContext {
            req,
            remote: INTERNAL_ADDR.parse().expect("static address"),
            internal: true,
            resp: None,
            index: 0,
            handlers: self.handlers.clone(),
        };
        ctx.next().await;
        ctx.resp.ok_or(ResolveError::NoResponse)
    }
}

/// SERVFAIL reply preserving the request's DO bit, with the failure
/// attached as an extended DNS error.
pub fn servfail(req: &Message, err: Option<&ResolveError>) -> Message {
    let mut m = Message::new();
    m.set_reply(req);
    m.rcode = Rcode::ServFail;
    m.recursion_available = true;
    if req.is_edns() {
        m.set_edns(req.udp_size(), req.do_bit());
        if let Some(err) = err {
            m.add_ede(err.ede_code(), &err.to_string());
        }
    }
    m
}

/// The recursive resolver as a chain handler.
pub struct ResolverHandler {
    resolver: Arc<Resolver>,
}

impl ResolverHandler {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        ResolverHandler { resolver }
    }

    /// CLASS CHAOS diagnostics: a server dump behind an environment
    /// variable and a cache-purge hook. Returns false when the query is
    /// not one of ours.
    fn serve_chaos(&self, req: &Message) -> Option<Message> {
        let q = req.q()?;
        match q.qtype {
            RrType::Hinfo => {
                if std::env::var(DEBUG_NS_ENV).is_err() {
                    return None;
                }
                let (zone, addrs) = self.resolver.debug_servers(&q.name);
                let mut m = Message::new();
                m.set_reply(req);
                for addr in addrs {
                    m.ns.push(Record {
                        name: q.name.clone(),
                        rrtype: RrType::Hinfo,
                        class: Class::Chaos,
                        ttl: 0,
                        data: RData::Hinfo {
                            cpu: addr,
                            os: zone.to_string(),
                        },
                    });
                }
                Some(m)
            }
            RrType::Null => {
                let encoded = q.name.as_str().trim_end_matches('.');
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .ok()?;
                let text = String::from_utf8(decoded).ok()?;
                let (qtype, name) = text.split_once(':')?;
                let name = Name::parse(name).ok()?;
                let qtype = RrType::parse(qtype)?;
                self.resolver.purge(&name, qtype);
                info!("cache purged for {} {}", name, qtype);

                let mut m = Message::new();
                m.set_reply(req);
                m.answer.push(Record {
                    name: q.name.clone(),
                    rrtype: RrType::Txt,
                    class: Class::Chaos,
                    ttl: 0,
                    data: RData::Txt(vec!["cache purged".to_string()]),
                });
                Some(m)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Handler for ResolverHandler {
    fn name(&self) -> &'static str {
        "resolver"
    }

    async fn serve(&self, ctx: &mut DnsContext) {
        let req = ctx.req.clone();
        let Some(q) = req.q() else {
            ctx.write(servfail(&req, None));
            return;
        };

        if q.qclass == Class::Chaos {
            match self.serve_chaos(&req) {
                Some(resp) => ctx.write(resp),
                None => {
                    let mut m = Message::new();
                    m.set_reply(&req);
                    m.rcode = Rcode::Refused;
                    ctx.write(m);
                }
            }
            return;
        }

        match self.resolver.resolve(&req, ctx.internal).await {
            Ok(mut resp) => {
                if matches!(resp.rcode, Rcode::Refused | Rcode::NotZone) {
                    resp.rcode = Rcode::ServFail;
                }
                ctx.write(resp);
            }
            Err(err) => {
                debug!("resolution of {} failed: {}", q, err);
                ctx.write(servfail(&req, Some(&err)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Static {
        rcode: Rcode,
    }

    #[async_trait]
    impl Handler for Static {
        fn name(&self) -> &'static str {
            "static"
        }

        async fn serve(&self, ctx: &mut DnsContext) {
            let mut m = Message::new();
            m.set_reply(&ctx.req);
            m.rcode = self.rcode;
            ctx.write(m);
        }
    }

    struct Silent;

    #[async_trait]
    impl Handler for Silent {
        fn name(&self) -> &'static str {
            "silent"
        }

        async fn serve(&self, _ctx: &mut DnsContext) {}
    }

    fn query() -> Message {
        Message::query(Name::parse("example.com.").unwrap(), RrType::A)
    }

    #[tokio::test]
    async fn test_chain_serves_first_writer() {
        let chain = Chain::new(vec![Arc::new(Static { rcode: Rcode::Success })]);
        let resp = chain
            .serve(query(), "192.0.2.1:4242".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(resp.rcode, Rcode::Success);
        assert!(resp.response);
    }

    #[tokio::test]
    async fn test_internal_exchange_requires_a_written_message() {
        let chain = Chain::new(vec![Arc::new(Silent)]);
        let err = chain.exchange_internal(query()).await.unwrap_err();
        assert_eq!(err, ResolveError::NoResponse);
    }

    #[tokio::test]
    async fn test_internal_exchange_returns_response() {
        let chain = Chain::new(vec![Arc::new(Static { rcode: Rcode::NameError })]);
        let resp = chain.exchange_internal(query()).await.unwrap();
        assert_eq!(resp.rcode, Rcode::NameError);
    }

    #[test]
    fn test_servfail_preserves_do_bit_and_ede() {
        let mut req = query();
        req.set_edns(1232, true);
        let resp = servfail(&req, Some(&ResolveError::DnskeyMissing));
        assert_eq!(resp.rcode, Rcode::ServFail);
        assert!(resp.do_bit());
        assert!(resp.opt().is_some());
    }

    #[test]
    fn test_servfail_without_edns_stays_bare() {
        let req = query();
        let resp = servfail(&req, Some(&ResolveError::MaxDepth));
        assert!(!resp.is_edns());
    }
}
