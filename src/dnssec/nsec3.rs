//! NSEC3 denial-of-existence proofs

use crate::dns::message::Record;
use crate::dns::name::Name;
use crate::dns::rdata::{Nsec3, RData, RrType};
use crate::error::ResolveError;
use base32::Alphabet;
use tracing::debug;

/// SHA-1 is the only defined NSEC3 hash algorithm.
const NSEC3_HASH_SHA1: u8 = 1;

/// Iteration counts above this are refused outright.
const MAX_ITERATIONS: u16 = 2048;

const BASE32HEX: Alphabet = Alphabet::Rfc4648Hex { padding: false };

/// Hash `name` with the record's parameters, returned as the lowercase
/// base32hex label NSEC3 owners use.
pub fn hash_name(name: &Name, hash_alg: u8, iterations: u16, salt: &[u8]) -> Option<String> {
    if hash_alg != NSEC3_HASH_SHA1 || iterations > MAX_ITERATIONS {
        return None;
    }
    let mut input = Vec::with_capacity(name.wire_len() + salt.len());
    name.to_wire(&mut input);
    input.extend_from_slice(salt);

    let mut digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, &input)
        .as_ref()
        .to_vec();
    for _ in 0..iterations {
        let mut round = digest;
        round.extend_from_slice(salt);
        digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, &round)
            .as_ref()
            .to_vec();
    }
    Some(base32::encode(BASE32HEX, &digest).to_ascii_lowercase())
}

fn owner_label(owner: &Name) -> Option<&str> {
    owner.labels().next()
}

fn nsec3s(records: &[Record]) -> impl Iterator<Item = (&Name, &Nsec3)> {
    records.iter().filter_map(|rr| match &rr.data {
        RData::Nsec3(n3) => Some((&rr.name, n3)),
        _ => None,
    })
}

fn hash_for(rr: &Nsec3, name: &Name) -> Option<String> {
    hash_name(name, rr.hash_alg, rr.iterations, &rr.salt)
}

/// Does this record's hashed span cover `target_hash`? base32hex is
/// order-preserving, so string comparison matches hash order.
fn span_covers(owner: &Name, rr: &Nsec3, target_hash: &str) -> bool {
    let Some(owner_hash) = owner_label(owner) else {
        return false;
    };
    let next_hash = base32::encode(BASE32HEX, &rr.next_hashed).to_ascii_lowercase();
    let owner_hash = owner_hash.to_ascii_lowercase();
    if target_hash == owner_hash {
        return false;
    }
    match owner_hash.as_str().cmp(next_hash.as_str()) {
        std::cmp::Ordering::Equal => true,
        std::cmp::Ordering::Less => {
            owner_hash.as_str() < target_hash && target_hash < next_hash.as_str()
        }
        std::cmp::Ordering::Greater => {
            target_hash > owner_hash.as_str() || target_hash < next_hash.as_str()
        }
    }
}

fn find_match<'a>(records: &'a [Record], name: &Name) -> Option<(&'a Name, &'a Nsec3)> {
    nsec3s(records).find(|(owner, rr)| {
        hash_for(rr, name)
            .and_then(|h| owner_label(owner).map(|o| o.eq_ignore_ascii_case(&h)))
            .unwrap_or(false)
    })
}

fn find_cover<'a>(records: &'a [Record], name: &Name) -> Option<(&'a Name, &'a Nsec3)> {
    nsec3s(records).find(|(owner, rr)| {
        hash_for(rr, name)
            .map(|h| span_covers(owner, rr, &h))
            .unwrap_or(false)
    })
}

/// Longest ancestor of `qname` (or the name itself) that hash-matches a
/// record in the set, together with the next-closer name.
pub fn find_closest_encloser(qname: &Name, records: &[Record]) -> Option<(Name, Name)> {
    let total = qname.label_count();
    for keep in (0..=total).rev() {
        let candidate = qname.ancestor(keep);
        if find_match(records, &candidate).is_some() {
            let next_closer = qname.ancestor((keep + 1).min(total));
            return Some((candidate, next_closer));
        }
    }
    None
}

/// Prove that `qname` does not exist: a matched closest encloser, a
/// covered next-closer, and a covered wildcard. Proofs that only cover
/// the wildcard are accepted, matching widely deployed signers.
pub fn verify_name_error(qname: &Name, records: &[Record]) -> Result<(), ResolveError> {
    let (encloser, next_closer) =
        find_closest_encloser(qname, records).ok_or(ResolveError::NsecMissing)?;

    let wildcard = Name::prepend("*", &encloser);
    let wildcard_covered = find_cover(records, &wildcard).is_some();
    let next_closer_covered = find_cover(records, &next_closer).is_some();

    if next_closer_covered && wildcard_covered {
        return Ok(());
    }
    if wildcard_covered {
        debug!("accepting wildcard-only nsec3 proof for {}", qname);
        return Ok(());
    }
    Err(ResolveError::NsecMissing)
}

/// Prove NODATA: a record hash-matching `qname` whose bitmap lacks both
/// the queried type and CNAME. DS questions without a match fall back to
/// a covered next-closer inside the closest encloser (opt-out spans).
pub fn verify_nodata(
    qname: &Name,
    qtype: RrType,
    records: &[Record],
) -> Result<(), ResolveError> {
    if let Some((_, rr)) = find_match(records, qname) {
        if rr.has_type(qtype) {
            return Err(ResolveError::Bogus(format!(
                "nsec3 match asserts {} exists at {}",
                qtype, qname
            )));
        }
        if qtype != RrType::Ds && rr.has_type(RrType::Cname) {
            return Err(ResolveError::Bogus(format!("nsec3 match hides a cname at {}", qname)));
        }
        return Ok(());
    }

    if qtype == RrType::Ds {
        let (_, next_closer) =
            find_closest_encloser(qname, records).ok_or(ResolveError::NsecMissing)?;
        if find_cover(records, &next_closer).is_some() {
            return Ok(());
        }
    }
    Err(ResolveError::NsecMissing)
}

/// Prove a delegation: a record matching the delegation name with the NS
/// bit set but neither DS nor SOA, or an opt-out span covering the
/// next-closer name.
pub fn verify_delegation(delegation: &Name, records: &[Record]) -> Result<(), ResolveError> {
    if let Some((_, rr)) = find_match(records, delegation) {
        if !rr.has_type(RrType::Ns) {
            return Err(ResolveError::Bogus(format!(
                "nsec3 at delegation {} lacks the ns bit",
                delegation
            )));
        }
        if rr.has_type(RrType::Ds) || rr.has_type(RrType::Soa) {
            return Err(ResolveError::Bogus(format!(
                "nsec3 at delegation {} carries ds or soa",
                delegation
            )));
        }
        return Ok(());
    }

    let (_, next_closer) =
        find_closest_encloser(delegation, records).ok_or(ResolveError::NsecMissing)?;
    match find_cover(records, &next_closer) {
        Some((_, rr)) if rr.opt_out() => Ok(()),
        Some(_) => Err(ResolveError::Bogus(format!(
            "covering nsec3 for {} lacks opt-out",
            delegation
        ))),
        None => Err(ResolveError::NsecMissing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &[u8] = &[0xAA, 0xBB, 0xCC, 0xDD];
    const ITERATIONS: u16 = 12;

    fn hash_label(name: &str) -> String {
        hash_name(&Name::parse(name).unwrap(), 1, ITERATIONS, SALT).unwrap()
    }

    fn raw_hash(name: &str) -> Vec<u8> {
        let label = hash_label(name);
        base32::decode(BASE32HEX, &label.to_ascii_uppercase()).unwrap()
    }

    fn nsec3_rr(zone: &str, owner_of: &str, next_of: &str, flags: u8, types: Vec<RrType>) -> Record {
        let owner = Name::parse(&format!("{}.{}", hash_label(owner_of), zone)).unwrap();
        Record::new(
            owner,
            RrType::Nsec3,
            3600,
            RData::Nsec3(Nsec3 {
                hash_alg: 1,
                flags,
                iterations: ITERATIONS,
                salt: SALT.to_vec(),
                next_hashed: raw_hash(next_of),
                types,
            }),
        )
    }

    /// Span record whose owner/next sandwich the hash of `covered`.
    fn covering_rr(zone: &str, covered: &str, flags: u8) -> Record {
        let target = raw_hash(covered);
        let mut before = target.clone();
        let mut after = target;
        // adjust the last octet to sit just around the target hash
        let last = before.len() - 1;
        before[last] = before[last].wrapping_sub(1);
        after[last] = after[last].wrapping_add(1);
        let owner_label = base32::encode(BASE32HEX, &before).to_ascii_lowercase();
        Record::new(
            Name::parse(&format!("{}.{}", owner_label, zone)).unwrap(),
            RrType::Nsec3,
            3600,
            RData::Nsec3(Nsec3 {
                hash_alg: 1,
                flags,
                iterations: ITERATIONS,
                salt: SALT.to_vec(),
                next_hashed: after,
                types: vec![],
            }),
        )
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(hash_label("example.com."), hash_label("EXAMPLE.com."));
        assert_ne!(hash_label("example.com."), hash_label("example.org."));
    }

    #[test]
    fn test_excessive_iterations_refused() {
        assert!(hash_name(&Name::root(), 1, 5000, &[]).is_none());
        assert!(hash_name(&Name::root(), 2, 0, &[]).is_none());
    }

    #[test]
    fn test_closest_encloser() {
        let records = vec![nsec3_rr(
            "example.",
            "example.",
            "example.",
            0,
            vec![RrType::Soa],
        )];
        let (encloser, next_closer) =
            find_closest_encloser(&Name::parse("a.b.example.").unwrap(), &records).unwrap();
        assert_eq!(encloser.as_str(), "example.");
        assert_eq!(next_closer.as_str(), "b.example.");

        assert!(find_closest_encloser(&Name::parse("a.other.").unwrap(), &records).is_none());
    }

    #[test]
    fn test_name_error_full_proof() {
        let qname = Name::parse("missing.example.").unwrap();
        let records = vec![
            nsec3_rr("example.", "example.", "example.", 0, vec![RrType::Soa]),
            covering_rr("example.", "missing.example.", 0),
            covering_rr("example.", "*.example.", 0),
        ];
        assert!(verify_name_error(&qname, &records).is_ok());
    }

    #[test]
    fn test_name_error_wildcard_only_accepted() {
        let qname = Name::parse("missing.example.").unwrap();
        let records = vec![
            nsec3_rr("example.", "example.", "example.", 0, vec![RrType::Soa]),
            covering_rr("example.", "*.example.", 0),
        ];
        assert!(verify_name_error(&qname, &records).is_ok());
    }

    #[test]
    fn test_name_error_without_wildcard_rejected() {
        let qname = Name::parse("missing.example.").unwrap();
        let records = vec![
            nsec3_rr("example.", "example.", "example.", 0, vec![RrType::Soa]),
            covering_rr("example.", "missing.example.", 0),
        ];
        assert!(verify_name_error(&qname, &records).is_err());
    }

    #[test]
    fn test_nodata_match() {
        let qname = Name::parse("host.example.").unwrap();
        let records = vec![nsec3_rr(
            "example.",
            "host.example.",
            "example.",
            0,
            vec![RrType::A],
        )];
        assert!(verify_nodata(&qname, RrType::Aaaa, &records).is_ok());
        assert!(verify_nodata(&qname, RrType::A, &records).is_err());
    }

    #[test]
    fn test_nodata_ds_optout_fallback() {
        let qname = Name::parse("child.example.").unwrap();
        let records = vec![
            nsec3_rr("example.", "example.", "example.", 1, vec![RrType::Soa]),
            covering_rr("example.", "child.example.", 1),
        ];
        assert!(verify_nodata(&qname, RrType::Ds, &records).is_ok());
    }

    #[test]
    fn test_delegation_match() {
        let delegation = Name::parse("child.example.").unwrap();
        let good = vec![nsec3_rr(
            "example.",
            "child.example.",
            "example.",
            0,
            vec![RrType::Ns],
        )];
        assert!(verify_delegation(&delegation, &good).is_ok());

        let bad = vec![nsec3_rr(
            "example.",
            "child.example.",
            "example.",
            0,
            vec![RrType::Ns, RrType::Ds],
        )];
        assert!(verify_delegation(&delegation, &bad).is_err());
    }

    #[test]
    fn test_delegation_optout() {
        let delegation = Name::parse("child.example.").unwrap();
        let records = vec![
            nsec3_rr("example.", "example.", "example.", 1, vec![RrType::Soa]),
            covering_rr("example.", "child.example.", 1),
        ];
        assert!(verify_delegation(&delegation, &records).is_ok());

        let no_optout = vec![
            nsec3_rr("example.", "example.", "example.", 0, vec![RrType::Soa]),
            covering_rr("example.", "child.example.", 0),
        ];
        assert!(verify_delegation(&delegation, &no_optout).is_err());
    }
}
