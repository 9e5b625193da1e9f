pub mod anchors;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod dns;
pub mod dnssec;
pub mod error;
pub mod exchange;
pub mod handler;
pub mod resolver;
pub mod singleflight;
pub mod tcp_pool;

pub use anchors::{KeyState, TrustAnchor, TrustAnchors};
pub use breaker::CircuitBreaker;
pub use cache::{AuthServer, AuthServerSet, GlueCache, NsCache, NsEntry};
pub use config::Config;
pub use dns::{Message, Name, Question, Rcode, Record, RrType};
pub use error::ResolveError;
pub use handler::{Chain, DnsContext, Handler, ResolverHandler};
pub use resolver::Resolver;
pub use singleflight::SingleFlight;
pub use tcp_pool::TcpPool;
