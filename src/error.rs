//! Resolver error taxonomy with extended DNS error mapping

use thiserror::Error;

/// Wire-format decode/encode failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,
    #[error("label exceeds 63 octets")]
    LabelTooLong,
    #[error("name exceeds 255 octets")]
    NameTooLong,
    #[error("empty label")]
    EmptyLabel,
    #[error("invalid label")]
    BadLabel,
    #[error("invalid compression pointer")]
    BadPointer,
    #[error("invalid type bitmap")]
    BadBitmap,
    #[error("invalid rdata")]
    BadRdata,
}

/// Extended DNS error codes, RFC 8914.
pub mod ede {
    pub const OTHER: u16 = 0;
    pub const DNSSEC_BOGUS: u16 = 6;
    pub const SIGNATURE_EXPIRED: u16 = 7;
    pub const DNSKEY_MISSING: u16 = 9;
    pub const RRSIGS_MISSING: u16 = 10;
    pub const NSEC_MISSING: u16 = 11;
    pub const NO_REACHABLE_AUTHORITY: u16 = 22;
    pub const NETWORK_ERROR: u16 = 23;
}

/// Everything resolution can fail with. Cloneable so a single in-flight
/// result can be fanned out to every coalesced caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("network error: {0}")]
    Network(String),

    #[error("connection failed to all servers")]
    ConnectionFailed,

    #[error("no reachable authority")]
    NoReachableAuthority,

    #[error("maximum recursion depth exceeded")]
    MaxDepth,

    #[error("delegation points above the current zone")]
    ParentDetection,

    #[error("no DNSKEY matching the delegation")]
    DnskeyMissing,

    #[error("required signatures are missing")]
    RrsigsMissing,

    #[error("signature validity period failed")]
    SignatureExpired,

    #[error("dnssec verification failed: {0}")]
    Bogus(String),

    #[error("denial-of-existence proof incomplete")]
    NsecMissing,

    #[error("no replied any message")]
    NoResponse,

    #[error("malformed message: {0}")]
    Wire(#[from] WireError),
}

impl ResolveError {
    /// The extended DNS error code surfaced to clients.
    pub fn ede_code(&self) -> u16 {
        match self {
            ResolveError::Network(_) | ResolveError::ConnectionFailed | ResolveError::NoResponse => {
                ede::NETWORK_ERROR
            }
            ResolveError::NoReachableAuthority => ede::NO_REACHABLE_AUTHORITY,
            ResolveError::MaxDepth | ResolveError::ParentDetection => ede::OTHER,
            ResolveError::DnskeyMissing => ede::DNSKEY_MISSING,
            ResolveError::RrsigsMissing => ede::RRSIGS_MISSING,
            ResolveError::SignatureExpired => ede::SIGNATURE_EXPIRED,
            ResolveError::Bogus(_) => ede::DNSSEC_BOGUS,
            ResolveError::NsecMissing => ede::NSEC_MISSING,
            ResolveError::Wire(_) => ede::OTHER,
        }
    }

    /// True for failures that count against a server's health.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ResolveError::Network(_) | ResolveError::ConnectionFailed | ResolveError::NoResponse
        )
    }
}

impl From<std::io::Error> for ResolveError {
    fn from(e: std::io::Error) -> Self {
        ResolveError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ede_mapping() {
        assert_eq!(ResolveError::DnskeyMissing.ede_code(), 9);
        assert_eq!(ResolveError::RrsigsMissing.ede_code(), 10);
        assert_eq!(ResolveError::SignatureExpired.ede_code(), 7);
        assert_eq!(ResolveError::NsecMissing.ede_code(), 11);
        assert_eq!(ResolveError::Bogus("ds mismatch".into()).ede_code(), 6);
        assert_eq!(ResolveError::ConnectionFailed.ede_code(), 23);
        assert_eq!(ResolveError::NoReachableAuthority.ede_code(), 22);
    }

    #[test]
    fn test_transport_classification() {
        assert!(ResolveError::Network("timed out".into()).is_transport());
        assert!(!ResolveError::MaxDepth.is_transport());
    }
}
