//! DNSKEY/DS/RRSIG cryptographic verification

use crate::dns::message::Record;
use crate::dns::name::Name;
use crate::dns::rdata::{Dnskey, Ds, RData, Rrsig, RrType};
use crate::error::ResolveError;
use ring::signature;
use std::collections::HashMap;
use tracing::debug;

/// DNSSEC signing algorithm numbers the validator understands.
pub const ALG_RSASHA1: u8 = 5;
pub const ALG_RSASHA1_NSEC3: u8 = 7;
pub const ALG_RSASHA256: u8 = 8;
pub const ALG_RSASHA512: u8 = 10;
pub const ALG_ECDSAP256SHA256: u8 = 13;
pub const ALG_ECDSAP384SHA384: u8 = 14;
pub const ALG_ED25519: u8 = 15;

/// DS digest types.
pub const DIGEST_SHA1: u8 = 1;
pub const DIGEST_SHA256: u8 = 2;
pub const DIGEST_GOST: u8 = 3;
pub const DIGEST_SHA384: u8 = 4;

/// Key tag of a DNSKEY, RFC 4034 appendix B.
pub fn key_tag(key: &Dnskey) -> u16 {
    let mut rdata = Vec::with_capacity(4 + key.public_key.len());
    RData::Dnskey(key.clone()).to_wire(&mut rdata);

    let mut acc: u32 = 0;
    for (i, byte) in rdata.iter().enumerate() {
        if i % 2 == 0 {
            acc += (*byte as u32) << 8;
        } else {
            acc += *byte as u32;
        }
    }
    acc += (acc >> 16) & 0xFFFF;
    (acc & 0xFFFF) as u16
}

/// Build the DS record for a DNSKEY. Returns None for digest types the
/// resolver does not support (notably GOST).
pub fn key_to_ds(owner: &Name, key: &Dnskey, digest_type: u8) -> Option<Ds> {
    let mut input = Vec::new();
    owner.to_wire(&mut input);
    RData::Dnskey(key.clone()).to_wire(&mut input);

    let digest = match digest_type {
        DIGEST_SHA1 => {
            ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, &input)
                .as_ref()
                .to_vec()
        }
        DIGEST_SHA256 => ring::digest::digest(&ring::digest::SHA256, &input)
            .as_ref()
            .to_vec(),
        DIGEST_SHA384 => ring::digest::digest(&ring::digest::SHA384, &input)
            .as_ref()
            .to_vec(),
        _ => return None,
    };

    Some(Ds {
        key_tag: key_tag(key),
        algorithm: key.algorithm,
        digest_type,
        digest,
    })
}

/// Map DNSKEY records by key tag. Tag collisions are rare but legal, so
/// each tag carries every matching key.
pub fn key_map(keys: &[Record]) -> HashMap<u16, Vec<(&Name, &Dnskey)>> {
    let mut map: HashMap<u16, Vec<(&Name, &Dnskey)>> = HashMap::new();
    for rr in keys {
        if let RData::Dnskey(key) = &rr.data {
            map.entry(key_tag(key)).or_default().push((&rr.name, key));
        }
    }
    map
}

/// Verify a DS set against a DNSKEY map.
///
/// Returns `Ok(true)` when every candidate used an unsupported digest,
/// `Ok(false)` when some DS matched a key, and an error when all
/// supported candidates mismatched.
pub fn verify_ds(
    keys: &HashMap<u16, Vec<(&Name, &Dnskey)>>,
    ds_set: &[Record],
) -> Result<bool, ResolveError> {
    let mut unsupported = 0usize;
    let mut candidates = 0usize;

    for rr in ds_set {
        let ds = match &rr.data {
            RData::Ds(ds) => ds,
            _ => continue,
        };
        candidates += 1;
        let Some(matching) = keys.get(&ds.key_tag) else {
            continue;
        };
        for (owner, key) in matching {
            if key.algorithm != ds.algorithm {
                continue;
            }
            match key_to_ds(owner, key, ds.digest_type) {
                None => {
                    debug!("ds digest type {} unsupported", ds.digest_type);
                    unsupported += 1;
                }
                Some(computed) if computed.digest == ds.digest => return Ok(false),
                Some(computed) => {
                    debug!(
                        "ds digest mismatch for tag {}: {} != {}",
                        ds.key_tag,
                        hex::encode(&computed.digest),
                        hex::encode(&ds.digest)
                    );
                    continue;
                }
            }
        }
    }

    if candidates == 0 {
        return Err(ResolveError::DnskeyMissing);
    }
    if unsupported > 0 {
        return Ok(true);
    }
    Err(ResolveError::Bogus("no DS matched the DNSKEY set".into()))
}

/// RSA public exponents wider than 31 bits are unsupported, not bogus.
fn rsa_components(public_key: &[u8]) -> Option<(&[u8], &[u8])> {
    let (exp_len, rest) = match public_key.split_first()? {
        (0, rest) if rest.len() >= 2 => {
            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            (len, &rest[2..])
        }
        (&len, rest) => (len as usize, rest),
    };
    if exp_len == 0 || rest.len() <= exp_len {
        return None;
    }
    Some(rest.split_at(exp_len))
}

fn rsa_exponent_supported(exponent: &[u8]) -> bool {
    let trimmed: Vec<u8> = exponent.iter().copied().skip_while(|&b| b == 0).collect();
    trimmed.len() < 4 || (trimmed.len() == 4 && trimmed[0] & 0x80 == 0)
}

/// One signature check. `Ok(true)` means verified; `Ok(false)` means the
/// algorithm or key shape is unsupported and the signature must not be
/// treated as bogus.
pub fn verify_signature(
    key: &Dnskey,
    signed: &[u8],
    sig: &[u8],
) -> Result<bool, ResolveError> {
    match key.algorithm {
        ALG_RSASHA1 | ALG_RSASHA1_NSEC3 | ALG_RSASHA256 | ALG_RSASHA512 => {
            let Some((exponent, modulus)) = rsa_components(&key.public_key) else {
                return Err(ResolveError::Bogus("malformed RSA public key".into()));
            };
            if !rsa_exponent_supported(exponent) {
                return Ok(false);
            }
            let alg: &signature::RsaParameters = match key.algorithm {
                ALG_RSASHA1 | ALG_RSASHA1_NSEC3 => {
                    &signature::RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY
                }
                ALG_RSASHA256 => &signature::RSA_PKCS1_1024_8192_SHA256_FOR_LEGACY_USE_ONLY,
                _ => &signature::RSA_PKCS1_1024_8192_SHA512_FOR_LEGACY_USE_ONLY,
            };
            let components = signature::RsaPublicKeyComponents {
                n: modulus,
                e: exponent,
            };
            components
                .verify(alg, signed, sig)
                .map(|_| true)
                .map_err(|_| ResolveError::Bogus("RSA signature verification failed".into()))
        }
        ALG_ECDSAP256SHA256 | ALG_ECDSAP384SHA384 => {
            let alg: &dyn signature::VerificationAlgorithm = if key.algorithm == ALG_ECDSAP256SHA256
            {
                &signature::ECDSA_P256_SHA256_FIXED
            } else {
                &signature::ECDSA_P384_SHA384_FIXED
            };
            // DNSKEY stores the bare point; ring wants the uncompressed form
            let mut point = Vec::with_capacity(1 + key.public_key.len());
            point.push(0x04);
            point.extend_from_slice(&key.public_key);
            signature::UnparsedPublicKey::new(alg, &point)
                .verify(signed, sig)
                .map(|_| true)
                .map_err(|_| ResolveError::Bogus("ECDSA signature verification failed".into()))
        }
        ALG_ED25519 => signature::UnparsedPublicKey::new(&signature::ED25519, &key.public_key)
            .verify(signed, sig)
            .map(|_| true)
            .map_err(|_| ResolveError::Bogus("Ed25519 signature verification failed".into())),
        other => {
            debug!("signing algorithm {} unsupported", other);
            Ok(false)
        }
    }
}

/// The owner name a signature actually covers: fewer RRSIG labels than
/// the owner means wildcard expansion.
fn signed_owner(owner: &Name, sig: &Rrsig) -> Name {
    let owner_labels = owner.label_count();
    if (sig.labels as usize) < owner_labels {
        Name::prepend("*", &owner.ancestor(sig.labels as usize))
    } else {
        owner.clone()
    }
}

/// Build the signed data for one RRset, RFC 4034 section 3.1.8.1:
/// the RRSIG rdata through the signer name, then each record in
/// canonical form ordered by rdata.
pub fn signed_data(rrset: &[&Record], sig: &Rrsig) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&sig.type_covered.to_u16().to_be_bytes());
    buf.push(sig.algorithm);
    buf.push(sig.labels);
    buf.extend_from_slice(&sig.orig_ttl.to_be_bytes());
    buf.extend_from_slice(&sig.expiration.to_be_bytes());
    buf.extend_from_slice(&sig.inception.to_be_bytes());
    buf.extend_from_slice(&sig.key_tag.to_be_bytes());
    sig.signer.to_wire(&mut buf);

    let mut rdatas: Vec<Vec<u8>> = rrset
        .iter()
        .map(|rr| {
            let mut rdata = Vec::new();
            rr.data.to_wire(&mut rdata);
            rdata
        })
        .collect();
    let owner = signed_owner(&rrset[0].name, sig);
    rdatas.sort();
    rdatas.dedup();

    let mut owner_wire = Vec::new();
    owner.to_wire(&mut owner_wire);
    for rdata in &rdatas {
        buf.extend_from_slice(&owner_wire);
        buf.extend_from_slice(&sig.type_covered.to_u16().to_be_bytes());
        buf.extend_from_slice(&rrset[0].class.to_u16().to_be_bytes());
        buf.extend_from_slice(&sig.orig_ttl.to_be_bytes());
        buf.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        buf.extend_from_slice(rdata);
    }
    buf
}

/// Serial-number comparison of RRSIG timestamps.
fn in_validity_window(sig: &Rrsig, now: u32) -> bool {
    let since_inception = now.wrapping_sub(sig.inception) as i32;
    let until_expiration = sig.expiration.wrapping_sub(now) as i32;
    since_inception >= 0 && until_expiration >= 0
}

/// Verify every RRSIG in the answer and authority sections of `msg`
/// against the key map. Multiple signatures over the same set may fail
/// individually as long as one verifies.
pub fn verify_rrsig_msg(
    keys: &HashMap<u16, Vec<(&Name, &Dnskey)>>,
    answer: &[Record],
    ns: &[Record],
    now: u32,
) -> Result<(), ResolveError> {
    for section in [answer, ns] {
        verify_section(keys, section, now)?;
    }
    Ok(())
}

fn verify_section(
    keys: &HashMap<u16, Vec<(&Name, &Dnskey)>>,
    section: &[Record],
    now: u32,
) -> Result<(), ResolveError> {
    // group covered sets by (owner, type)
    let mut groups: Vec<(&Name, RrType)> = Vec::new();
    for rr in section {
        if let RData::Rrsig(sig) = &rr.data {
            let key = (&rr.name, sig.type_covered);
            if !groups.contains(&key) {
                groups.push(key);
            }
        }
    }

    for (owner, covered) in groups {
        let rrset: Vec<&Record> = section
            .iter()
            .filter(|rr| rr.rrtype == covered && &rr.name == owner)
            .collect();
        if rrset.is_empty() {
            continue;
        }
        let sigs: Vec<&Rrsig> = section
            .iter()
            .filter_map(|rr| match &rr.data {
                RData::Rrsig(sig) if &rr.name == owner && sig.type_covered == covered => Some(sig),
                _ => None,
            })
            .collect();

        let mut last_err = ResolveError::RrsigsMissing;
        let mut ok = false;
        for sig in sigs {
            if !in_validity_window(sig, now) {
                last_err = ResolveError::SignatureExpired;
                continue;
            }
            let Some(candidates) = keys.get(&sig.key_tag) else {
                last_err = ResolveError::DnskeyMissing;
                continue;
            };
            let signed = signed_data(&rrset, sig);
            for (key_owner, key) in candidates {
                if **key_owner != sig.signer || key.algorithm != sig.algorithm {
                    continue;
                }
                match verify_signature(key, &signed, &sig.signature) {
                    Ok(_) => {
                        // unsupported algorithms are skipped, not bogus
                        ok = true;
                        break;
                    }
                    Err(err) => last_err = err,
                }
            }
            if ok {
                break;
            }
        }
        if !ok {
            debug!("rrset {}/{} failed signature verification", owner, covered);
            return Err(last_err);
        }
    }
    Ok(())
}
