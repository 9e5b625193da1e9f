//! NSEC denial-of-existence proofs

use crate::dns::message::Record;
use crate::dns::name::Name;
use crate::dns::rdata::{Nsec, RData, RrType};
use crate::error::ResolveError;
use std::cmp::Ordering;
use tracing::debug;

/// Canonical-order coverage test: does the span `(owner, next)` cover
/// `name`? Handles the single-name zone (`owner == next` covers
/// everything else) and the wrap-around span ending at the apex.
pub fn nsec_covers(owner: &Name, next: &Name, name: &Name) -> bool {
    if name == owner {
        return false;
    }
    match owner.canonical_cmp(next) {
        Ordering::Equal => true,
        Ordering::Less => {
            owner.canonical_cmp(name) == Ordering::Less
                && name.canonical_cmp(next) == Ordering::Less
        }
        Ordering::Greater => {
            owner.canonical_cmp(name) == Ordering::Less
                || name.canonical_cmp(next) == Ordering::Less
        }
    }
}

fn nsecs(records: &[Record]) -> impl Iterator<Item = (&Name, &Nsec)> {
    records.iter().filter_map(|rr| match &rr.data {
        RData::Nsec(nsec) => Some((&rr.name, nsec)),
        _ => None,
    })
}

fn find_cover<'a>(
    records: &'a [Record],
    name: &Name,
) -> Option<(&'a Name, &'a Nsec)> {
    nsecs(records).find(|(owner, nsec)| nsec_covers(owner, &nsec.next, name))
}

fn exact<'a>(records: &'a [Record], name: &Name) -> Option<&'a Nsec> {
    nsecs(records)
        .find(|(owner, _)| *owner == name)
        .map(|(_, nsec)| nsec)
}

/// Minimally-covering spans (RFC 4470) place the successor directly
/// under the denied name; such a proof carries no usable wildcard span.
fn is_white_lie(nsec: &Nsec, qname: &Name) -> bool {
    nsec.next.is_subdomain_of(qname) && nsec.next != *qname
}

/// Prove that `qname` does not exist: a span must cover the name itself
/// and another must cover the wildcard at the closest encloser.
pub fn verify_name_error(qname: &Name, records: &[Record]) -> Result<(), ResolveError> {
    let (owner, covering) = find_cover(records, qname).ok_or(ResolveError::NsecMissing)?;

    if is_white_lie(covering, qname) {
        debug!("accepting minimally-covering nsec span for {}", qname);
        return Ok(());
    }

    let encloser_labels = qname
        .common_suffix_len(owner)
        .max(qname.common_suffix_len(&covering.next));
    let wildcard = Name::prepend("*", &qname.ancestor(encloser_labels));
    if find_cover(records, &wildcard).is_none() {
        return Err(ResolveError::NsecMissing);
    }
    Ok(())
}

/// Prove NODATA: an NSEC at exactly `qname` whose bitmap lacks the
/// queried type. DS questions at a delegation additionally need the NS
/// bit present and the SOA bit absent.
pub fn verify_nodata(
    qname: &Name,
    qtype: RrType,
    records: &[Record],
) -> Result<(), ResolveError> {
    let nsec = exact(records, qname).ok_or(ResolveError::NsecMissing)?;

    if nsec.has_type(qtype) {
        return Err(ResolveError::Bogus(format!(
            "nsec at {} asserts {} exists",
            qname, qtype
        )));
    }
    if qtype == RrType::Ds {
        if !nsec.has_type(RrType::Ns) {
            return Err(ResolveError::Bogus(format!(
                "nsec at {} is not a delegation",
                qname
            )));
        }
        if nsec.has_type(RrType::Soa) {
            return Err(ResolveError::Bogus(format!(
                "nsec at {} crosses a zone cut",
                qname
            )));
        }
        return Ok(());
    }
    if nsec.has_type(RrType::Cname) {
        return Err(ResolveError::Bogus(format!(
            "nsec at {} hides a cname",
            qname
        )));
    }
    Ok(())
}

/// Prove a delegation is unsigned: the NSEC at the delegation point has
/// the NS bit but neither DS nor SOA.
pub fn verify_unsigned_delegation(
    delegation: &Name,
    records: &[Record],
) -> Result<(), ResolveError> {
    verify_nodata(delegation, RrType::Ds, records).and_then(|_| {
        let nsec = exact(records, delegation).ok_or(ResolveError::NsecMissing)?;
        if nsec.has_type(RrType::Ds) {
            return Err(ResolveError::Bogus(format!(
                "delegation {} has a ds despite the unsigned proof",
                delegation
            )));
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nsec_rr(owner: &str, next: &str, types: Vec<RrType>) -> Record {
        Record::new(
            Name::parse(owner).unwrap(),
            RrType::Nsec,
            3600,
            RData::Nsec(Nsec {
                next: Name::parse(next).unwrap(),
                types,
            }),
        )
    }

    #[test]
    fn test_covers_ordinary_span() {
        let owner = Name::parse("alpha.example.").unwrap();
        let next = Name::parse("delta.example.").unwrap();
        assert!(nsec_covers(&owner, &next, &Name::parse("beta.example.").unwrap()));
        assert!(!nsec_covers(&owner, &next, &Name::parse("zeta.example.").unwrap()));
        assert!(!nsec_covers(&owner, &next, &owner));
    }

    #[test]
    fn test_covers_wraparound() {
        let owner = Name::parse("zeta.example.").unwrap();
        let next = Name::parse("example.").unwrap();
        assert!(nsec_covers(&owner, &next, &Name::parse("zz.example.").unwrap()));
        assert!(!nsec_covers(&owner, &next, &Name::parse("beta.example.").unwrap()));
    }

    #[test]
    fn test_covers_single_name_zone() {
        let only = Name::parse("example.").unwrap();
        assert!(nsec_covers(&only, &only, &Name::parse("any.example.").unwrap()));
        assert!(!nsec_covers(&only, &only, &only));
    }

    #[test]
    fn test_covers_is_canonical_case_insensitive() {
        let owner = Name::parse("ALPHA.Example.").unwrap();
        let next = Name::parse("Delta.EXAMPLE.").unwrap();
        let x = Name::parse("Beta.example.").unwrap();
        assert!(nsec_covers(&owner, &next, &x));
    }

    #[test]
    fn test_name_error_requires_cover() {
        let records = vec![nsec_rr("m.example.", "p.example.", vec![RrType::A])];
        assert!(verify_name_error(&Name::parse("zz.example.").unwrap(), &records).is_err());
    }

    #[test]
    fn test_name_error_with_wildcard_proof() {
        let records = vec![
            nsec_rr("m.example.", "p.example.", vec![RrType::A]),
            // covers *.example. (canonically before any single-label child)
            nsec_rr("example.", "b.example.", vec![RrType::Soa]),
        ];
        assert!(verify_name_error(&Name::parse("n.example.").unwrap(), &records).is_ok());
    }

    #[test]
    fn test_name_error_white_lie() {
        // minimally-covering span: the successor sits directly under the
        // denied name, so no separate wildcard span can exist
        let records = vec![nsec_rr("mz.example.", "x.n.example.", vec![RrType::A])];
        assert!(verify_name_error(&Name::parse("n.example.").unwrap(), &records).is_ok());
    }

    #[test]
    fn test_nodata_exact() {
        let records = vec![nsec_rr("host.example.", "z.example.", vec![RrType::A])];
        let qname = Name::parse("host.example.").unwrap();
        assert!(verify_nodata(&qname, RrType::Aaaa, &records).is_ok());
        assert!(verify_nodata(&qname, RrType::A, &records).is_err());
    }

    #[test]
    fn test_nodata_ds_at_delegation() {
        let records = vec![nsec_rr(
            "child.example.",
            "d.example.",
            vec![RrType::Ns],
        )];
        let qname = Name::parse("child.example.").unwrap();
        assert!(verify_nodata(&qname, RrType::Ds, &records).is_ok());

        let crossed = vec![nsec_rr(
            "child.example.",
            "d.example.",
            vec![RrType::Ns, RrType::Soa],
        )];
        assert!(verify_nodata(&qname, RrType::Ds, &crossed).is_err());

        let not_delegation = vec![nsec_rr("child.example.", "d.example.", vec![RrType::A])];
        assert!(verify_nodata(&qname, RrType::Ds, &not_delegation).is_err());
    }

    #[test]
    fn test_unsigned_delegation_proof() {
        let qname = Name::parse("child.example.").unwrap();
        let good = vec![nsec_rr("child.example.", "d.example.", vec![RrType::Ns])];
        assert!(verify_unsigned_delegation(&qname, &good).is_ok());

        let signed = vec![nsec_rr(
            "child.example.",
            "d.example.",
            vec![RrType::Ns, RrType::Ds],
        )];
        assert!(verify_unsigned_delegation(&qname, &signed).is_err());
    }
}
