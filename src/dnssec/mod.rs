//! DNSSEC validation: chain-of-trust primitives and denial proofs.
//!
//! The pure verification steps live here; the resolver drives them and
//! supplies fetched DNSKEY/DS sets.

pub mod nsec;
pub mod nsec3;
pub mod sig;

use crate::dns::message::{Message, Record};
use crate::dns::name::Name;
use crate::dns::rdata::{RData, RrType};
use crate::error::ResolveError;

/// Current time as the 32-bit seconds counter RRSIG timestamps use.
pub fn now_unix() -> u32 {
    chrono::Utc::now().timestamp() as u32
}

/// Find the signer of the signatures covering `qname`. In the answer
/// section the RRSIG must sit on the queried name (or cover a DNAME the
/// name was synthesized under); authority-section records all belong to
/// the answering zone, so any signature there names the signer.
pub fn find_rrsig_signer(msg: &Message, qname: &Name, in_answer: bool) -> Option<Name> {
    if in_answer {
        for rr in &msg.answer {
            if let RData::Rrsig(sig) = &rr.data {
                if rr.name == *qname || sig.type_covered == RrType::Dname {
                    return Some(sig.signer.clone());
                }
            }
        }
        return None;
    }
    msg.ns.iter().find_map(|rr| match &rr.data {
        RData::Rrsig(sig) => Some(sig.signer.clone()),
        _ => None,
    })
}

/// All records of one type within a section.
pub fn records_of<'a>(section: &'a [Record], rrtype: RrType) -> Vec<&'a Record> {
    section.iter().filter(|rr| rr.rrtype == rrtype).collect()
}

pub fn has_nsec3(section: &[Record]) -> bool {
    section.iter().any(|rr| rr.rrtype == RrType::Nsec3)
}

pub fn has_nsec(section: &[Record]) -> bool {
    section.iter().any(|rr| rr.rrtype == RrType::Nsec)
}

/// Verify the denial-of-existence shape of a NameError response using
/// whichever proof family the authority section carries.
pub fn verify_name_error(qname: &Name, ns: &[Record]) -> Result<(), ResolveError> {
    if has_nsec3(ns) {
        nsec3::verify_name_error(qname, ns)
    } else if has_nsec(ns) {
        nsec::verify_name_error(qname, ns)
    } else {
        Err(ResolveError::NsecMissing)
    }
}

/// Verify a NODATA response the same way.
pub fn verify_nodata(qname: &Name, qtype: RrType, ns: &[Record]) -> Result<(), ResolveError> {
    if has_nsec3(ns) {
        nsec3::verify_nodata(qname, qtype, ns)
    } else if has_nsec(ns) {
        nsec::verify_nodata(qname, qtype, ns)
    } else {
        Err(ResolveError::NsecMissing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::rdata::Rrsig;

    #[test]
    fn test_find_signer_in_authority() {
        let mut msg = Message::new();
        let zone = Name::parse("example.com.").unwrap();
        msg.ns.push(Record::new(
            zone.clone(),
            RrType::Rrsig,
            3600,
            RData::Rrsig(Rrsig {
                type_covered: RrType::Ns,
                algorithm: 8,
                labels: 2,
                orig_ttl: 3600,
                expiration: 0,
                inception: 0,
                key_tag: 1,
                signer: Name::parse("com.").unwrap(),
                signature: Vec::new(),
            }),
        ));
        let signer = find_rrsig_signer(&msg, &zone, false).unwrap();
        assert_eq!(signer.as_str(), "com.");
        assert!(find_rrsig_signer(&msg, &zone, true).is_none());
    }

    #[test]
    fn test_denial_without_proofs_is_missing() {
        let qname = Name::parse("nope.example.").unwrap();
        assert_eq!(
            verify_name_error(&qname, &[]),
            Err(ResolveError::NsecMissing)
        );
        assert_eq!(
            verify_nodata(&qname, RrType::A, &[]),
            Err(ResolveError::NsecMissing)
        );
    }
}
