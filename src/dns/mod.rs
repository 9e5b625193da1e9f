//! DNS data model and wire plumbing

pub mod edns;
pub mod message;
pub mod name;
pub mod pool;
pub mod rdata;

pub use message::{Message, Question, Rcode, Record};
pub use name::Name;
pub use pool::{BufferPool, MessagePool};
pub use rdata::{Class, RData, RrType};
