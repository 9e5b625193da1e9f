//! Trust-anchor maintenance: the RFC 5011 state machine for root KSK
//! rollover, persisted to a single file

use crate::dns::message::Record;
use crate::dns::name::Name;
use crate::dns::rdata::{Dnskey, RData, RrType};
use crate::dnssec::sig::{key_tag, key_to_ds, DIGEST_SHA256};
use base64::Engine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Hold-down before a newly seen key becomes trusted.
pub const ADD_HOLD_DOWN_SECS: i64 = 30 * 24 * 3600;

/// Hold-down before a vanished or revoked key is removed.
pub const REMOVE_HOLD_DOWN_SECS: i64 = 90 * 24 * 3600;

/// Refresh cadence for the `. DNSKEY` probe.
pub const REFRESH_INTERVAL_SECS: u64 = 12 * 3600;

/// File name inside the data directory.
pub const ANCHOR_FILE: &str = "trust-anchor.db";

/// State-file loads above this size are rejected before parsing.
const MAX_ANCHOR_FILE_SIZE: u64 = 1024 * 1024;

/// Key states, RFC 5011 section 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
    Start,
    AddPend,
    Valid,
    Missing,
    Revoked,
    Removed,
}

/// One tracked key with its state-machine bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustAnchor {
    pub key_tag: u16,
    pub flags: u16,
    pub protocol: u8,
    pub algorithm: u8,
    pub public_key: String,
    pub state: KeyState,
    pub first_seen: i64,
}

impl TrustAnchor {
    fn from_key(key: &Dnskey, state: KeyState, now: i64) -> Self {
        TrustAnchor {
            key_tag: key_tag(key),
            flags: key.flags,
            protocol: key.protocol,
            algorithm: key.algorithm,
            public_key: base64::engine::general_purpose::STANDARD.encode(&key.public_key),
            state,
            first_seen: now,
        }
    }

    pub fn dnskey(&self) -> Option<Dnskey> {
        let public_key = base64::engine::general_purpose::STANDARD
            .decode(&self.public_key)
            .ok()?;
        Some(Dnskey {
            flags: self.flags,
            protocol: self.protocol,
            algorithm: self.algorithm,
            public_key,
        })
    }

    fn record(&self) -> Option<Record> {
        Some(Record::new(
            Name::root(),
            RrType::Dnskey,
            172800,
            RData::Dnskey(self.dnskey()?),
        ))
    }
}

/// The persisted anchor set, keyed by key tag.
pub struct TrustAnchors {
    path: PathBuf,
    anchors: RwLock<HashMap<u16, TrustAnchor>>,
}

impl TrustAnchors {
    /// Read the state file; when that fails, seed `Valid` anchors from
    /// the configured root keys.
    pub fn load_or_seed(dir: &Path, seed: &[Record], now: i64) -> Self {
        let path = dir.join(ANCHOR_FILE);
        match Self::load(&path) {
            Ok(anchors) => {
                info!("loaded {} trust anchors from {}", anchors.len(), path.display());
                TrustAnchors {
                    path,
                    anchors: RwLock::new(anchors),
                }
            }
            Err(err) => {
                info!(
                    "seeding trust anchors from configured root keys ({})",
                    err
                );
                let mut anchors = HashMap::new();
                for rr in seed {
                    if let RData::Dnskey(key) = &rr.data {
                        let anchor = TrustAnchor::from_key(key, KeyState::Valid, now);
                        anchors.insert(anchor.key_tag, anchor);
                    }
                }
                TrustAnchors {
                    path,
                    anchors: RwLock::new(anchors),
                }
            }
        }
    }

    fn load(path: &Path) -> Result<HashMap<u16, TrustAnchor>, std::io::Error> {
        let meta = std::fs::metadata(path)?;
        if meta.len() > MAX_ANCHOR_FILE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("anchor file too large: {} bytes", meta.len()),
            ));
        }
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Rewrite the state file atomically.
    pub fn persist(&self) -> Result<(), std::io::Error> {
        let data = serde_json::to_vec_pretty(&*self.anchors.read())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)
    }

    pub fn len(&self) -> usize {
        self.anchors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state_of(&self, tag: u16) -> Option<KeyState> {
        self.anchors.read().get(&tag).map(|a| a.state)
    }

    /// DNSKEY records for every anchor currently trusted for validation.
    pub fn valid_keys(&self) -> Vec<Record> {
        self.anchors
            .read()
            .values()
            .filter(|a| a.state == KeyState::Valid)
            .filter_map(|a| a.record())
            .collect()
    }

    /// Synthesize the DS set for the trusted anchors, used where the
    /// root has no parent to publish one.
    pub fn to_ds(&self) -> Vec<Record> {
        self.anchors
            .read()
            .values()
            .filter(|a| a.state == KeyState::Valid)
            .filter_map(|a| {
                let key = a.dnskey()?;
                let ds = key_to_ds(&Name::root(), &key, DIGEST_SHA256)?;
                Some(Record::new(Name::root(), RrType::Ds, 172800, RData::Ds(ds)))
            })
            .collect()
    }

    /// Apply one observation of the `. DNSKEY` RRset to the state
    /// machine and report whether anything changed.
    pub fn observe(&self, observed: &[Record], now: i64) -> bool {
        let mut seen: HashMap<u16, (Dnskey, bool)> = HashMap::new();
        for rr in observed {
            if let RData::Dnskey(key) = &rr.data {
                if !key.is_zone_key() || !key.is_sep() {
                    continue;
                }
                seen.insert(key_tag(key), (key.clone(), key.is_revoked()));
            }
        }

        let mut anchors = self.anchors.write();
        let mut changed = false;

        // A revoked key reappears under a new tag (the revoke bit is part
        // of the tag). Track it as Revoked and drop the stand-by entry
        // stored under the unrevoked tag.
        for (tag, (key, revoked)) in &seen {
            if !revoked {
                continue;
            }
            let mut unrevoked = key.clone();
            unrevoked.flags &= !0x0080;
            let paired = key_tag(&unrevoked);
            if anchors.remove(&paired).is_some() {
                warn!("trust anchor {} revoked (revoked tag {})", paired, tag);
                changed = true;
            }
            if !anchors.contains_key(tag) {
                anchors.insert(*tag, TrustAnchor::from_key(key, KeyState::Revoked, now));
                changed = true;
            }
        }

        enum Act {
            Keep,
            Set(KeyState),
            Delete,
        }

        // walk existing anchors against the observation
        let tags: Vec<u16> = anchors.keys().copied().collect();
        for tag in tags {
            let (state, first_seen) = {
                let anchor = &anchors[&tag];
                (anchor.state, anchor.first_seen)
            };
            let observation = seen.get(&tag).map(|(_, revoked)| *revoked);
            let act = match (state, observation) {
                (KeyState::Start, Some(false)) => Act::Set(KeyState::AddPend),
                (KeyState::Start, _) => Act::Keep,
                (KeyState::AddPend, Some(false)) => {
                    if now - first_seen > ADD_HOLD_DOWN_SECS {
                        info!("trust anchor {} completed the add hold-down", tag);
                        Act::Set(KeyState::Valid)
                    } else {
                        Act::Keep
                    }
                }
                (KeyState::AddPend, Some(true)) => Act::Set(KeyState::Revoked),
                (KeyState::AddPend, None) => Act::Set(KeyState::Missing),
                (KeyState::Valid, Some(false)) => Act::Keep,
                (KeyState::Valid, Some(true)) => Act::Set(KeyState::Revoked),
                (KeyState::Valid, None) => Act::Set(KeyState::Missing),
                (KeyState::Missing, Some(false)) => Act::Set(KeyState::AddPend),
                (KeyState::Missing, Some(true)) => Act::Set(KeyState::Revoked),
                (KeyState::Missing, None) => {
                    if now - first_seen > REMOVE_HOLD_DOWN_SECS {
                        Act::Set(KeyState::Removed)
                    } else {
                        Act::Keep
                    }
                }
                (KeyState::Revoked, Some(_)) => Act::Keep,
                (KeyState::Revoked, None) => {
                    if now - first_seen > REMOVE_HOLD_DOWN_SECS {
                        Act::Delete
                    } else {
                        Act::Set(KeyState::Removed)
                    }
                }
                (KeyState::Removed, _) => {
                    if now - first_seen > REMOVE_HOLD_DOWN_SECS {
                        Act::Delete
                    } else {
                        Act::Keep
                    }
                }
            };
            match act {
                Act::Keep => {}
                Act::Delete => {
                    anchors.remove(&tag);
                    info!("trust anchor {} deleted after the remove hold-down", tag);
                    changed = true;
                }
                Act::Set(next) => {
                    if let Some(anchor) = anchors.get_mut(&tag) {
                        if anchor.state != next {
                            info!("trust anchor {}: {:?} -> {:?}", tag, anchor.state, next);
                            anchor.state = next;
                            // entering a hold-down state restarts its clock
                            if matches!(
                                next,
                                KeyState::AddPend | KeyState::Missing | KeyState::Revoked
                            ) {
                                anchor.first_seen = now;
                            }
                            changed = true;
                        }
                    }
                }
            }
        }

        // brand-new unrevoked keys enter the add hold-down
        for (tag, (key, revoked)) in &seen {
            if *revoked || anchors.contains_key(tag) {
                continue;
            }
            info!("new trust anchor candidate {} entering hold-down", tag);
            anchors.insert(*tag, TrustAnchor::from_key(key, KeyState::AddPend, now));
            changed = true;
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnssec::sig::ALG_RSASHA256;

    fn test_key(seed: u8, flags: u16) -> Dnskey {
        Dnskey {
            flags,
            protocol: 3,
            algorithm: ALG_RSASHA256,
            public_key: vec![seed; 64],
        }
    }

    fn key_record(key: &Dnskey) -> Record {
        Record::new(Name::root(), RrType::Dnskey, 172800, RData::Dnskey(key.clone()))
    }

    fn fresh(dir: &Path, seed: &Dnskey) -> TrustAnchors {
        TrustAnchors::load_or_seed(dir, &[key_record(seed)], 1000)
    }

    #[test]
    fn test_seed_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key(1, 257);
        let anchors = fresh(dir.path(), &key);
        assert_eq!(anchors.len(), 1);
        assert_eq!(anchors.state_of(key_tag(&key)), Some(KeyState::Valid));
        assert_eq!(anchors.valid_keys().len(), 1);
        assert_eq!(anchors.to_ds().len(), 1);
    }

    #[test]
    fn test_persist_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key(2, 257);
        let anchors = fresh(dir.path(), &key);
        anchors.persist().unwrap();

        let reloaded = TrustAnchors::load_or_seed(dir.path(), &[], 2000);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.state_of(key_tag(&key)), Some(KeyState::Valid));
        let a = anchors.anchors.read().clone();
        let b = reloaded.anchors.read().clone();
        assert_eq!(a.len(), b.len());
        for (tag, anchor) in a {
            let other = &b[&tag];
            assert_eq!(anchor.state, other.state);
            assert_eq!(anchor.public_key, other.public_key);
            assert_eq!(anchor.first_seen, other.first_seen);
        }
    }

    #[test]
    fn test_new_key_waits_out_hold_down() {
        let dir = tempfile::tempdir().unwrap();
        let old = test_key(3, 257);
        let new = test_key(4, 257);
        let anchors = fresh(dir.path(), &old);

        let observed = vec![key_record(&old), key_record(&new)];
        anchors.observe(&observed, 1000);
        assert_eq!(anchors.state_of(key_tag(&new)), Some(KeyState::AddPend));
        assert_eq!(anchors.valid_keys().len(), 1);

        // before the hold-down elapses: still pending
        anchors.observe(&observed, 1000 + ADD_HOLD_DOWN_SECS - 1);
        assert_eq!(anchors.state_of(key_tag(&new)), Some(KeyState::AddPend));

        // after 30 days: trusted
        anchors.observe(&observed, 1000 + ADD_HOLD_DOWN_SECS + 1);
        assert_eq!(anchors.state_of(key_tag(&new)), Some(KeyState::Valid));
        assert_eq!(anchors.valid_keys().len(), 2);
    }

    #[test]
    fn test_missing_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key(5, 257);
        let anchors = fresh(dir.path(), &key);
        let tag = key_tag(&key);

        anchors.observe(&[], 2000);
        assert_eq!(anchors.state_of(tag), Some(KeyState::Missing));

        // reappearing re-enters the hold-down
        anchors.observe(&[key_record(&key)], 3000);
        assert_eq!(anchors.state_of(tag), Some(KeyState::AddPend));

        anchors.observe(&[], 4000);
        assert_eq!(anchors.state_of(tag), Some(KeyState::Missing));

        // the remove hold-down runs from the latest Missing entry, not
        // from the key's first sighting
        anchors.observe(&[], 1000 + REMOVE_HOLD_DOWN_SECS + 1);
        assert_eq!(anchors.state_of(tag), Some(KeyState::Missing));

        anchors.observe(&[], 4000 + REMOVE_HOLD_DOWN_SECS + 1);
        assert_eq!(anchors.state_of(tag), Some(KeyState::Removed));
    }

    #[test]
    fn test_reappearance_restarts_add_hold_down() {
        let dir = tempfile::tempdir().unwrap();
        let old = test_key(7, 257);
        let new = test_key(8, 257);
        let anchors = fresh(dir.path(), &old);
        let tag = key_tag(&new);

        // candidate appears, vanishes, then comes back much later
        anchors.observe(&[key_record(&old), key_record(&new)], 1000);
        assert_eq!(anchors.state_of(tag), Some(KeyState::AddPend));
        anchors.observe(&[key_record(&old)], 2000);
        assert_eq!(anchors.state_of(tag), Some(KeyState::Missing));

        let reseen = 2000 + ADD_HOLD_DOWN_SECS;
        anchors.observe(&[key_record(&old), key_record(&new)], reseen);
        assert_eq!(anchors.state_of(tag), Some(KeyState::AddPend));

        // the add hold-down counts from the re-sighting, so the key is
        // still pending until thirty days after that
        anchors.observe(
            &[key_record(&old), key_record(&new)],
            reseen + ADD_HOLD_DOWN_SECS - 1,
        );
        assert_eq!(anchors.state_of(tag), Some(KeyState::AddPend));
        anchors.observe(
            &[key_record(&old), key_record(&new)],
            reseen + ADD_HOLD_DOWN_SECS + 1,
        );
        assert_eq!(anchors.state_of(tag), Some(KeyState::Valid));
    }

    #[test]
    fn test_revocation() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key(6, 257);
        let anchors = fresh(dir.path(), &key);
        let tag = key_tag(&key);

        let mut revoked = key.clone();
        revoked.flags |= 0x0080;
        anchors.observe(&[key_record(&revoked)], 2000);

        // the unrevoked entry is dropped and nothing remains trusted
        assert_eq!(anchors.state_of(tag), None);
        assert!(anchors.valid_keys().is_empty());
    }
}
