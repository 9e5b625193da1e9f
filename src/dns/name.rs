//! Domain names: case-insensitive FQDNs, label math, canonical ordering

use crate::error::WireError;
use std::fmt;

/// Maximum wire length of a name, per RFC 1035.
pub const MAX_NAME_WIRE_LEN: usize = 255;

/// Maximum length of a single label.
pub const MAX_LABEL_LEN: usize = 63;

/// Compression pointers chased before a message is declared malformed.
const MAX_POINTER_HOPS: usize = 32;

/// A fully-qualified domain name.
///
/// The spelling a name arrived with is preserved; equality, hashing,
/// and ordering are case-insensitive. The root is `"."`.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct Name(String);

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Name {}

impl std::hash::Hash for Name {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for b in self.0.as_bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl Name {
    /// The root name `"."`.
    pub fn root() -> Self {
        Name(".".to_string())
    }

    /// Parse a presentation-format name, qualifying it with the
    /// trailing dot.
    pub fn parse(s: &str) -> Result<Self, WireError> {
        if s.is_empty() || s == "." {
            return Ok(Name::root());
        }
        let mut owned = s.to_string();
        if !owned.ends_with('.') {
            owned.push('.');
        }
        let mut wire_len = 1; // terminating zero octet
        for label in owned.split('.') {
            if label.is_empty() {
                continue;
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(WireError::LabelTooLong);
            }
            wire_len += label.len() + 1;
        }
        if wire_len > MAX_NAME_WIRE_LEN {
            return Err(WireError::NameTooLong);
        }
        if owned.contains("..") {
            return Err(WireError::EmptyLabel);
        }
        Ok(Name(owned))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "."
    }

    /// Iterate labels leftmost-first. The root yields nothing.
    pub fn labels(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.0.split('.').filter(|l| !l.is_empty())
    }

    /// Number of labels; the root has zero.
    pub fn label_count(&self) -> usize {
        self.labels().count()
    }

    /// The name with the leftmost label removed. The root is its own parent.
    pub fn parent(&self) -> Name {
        if self.is_root() {
            return Name::root();
        }
        match self.0.find('.') {
            Some(idx) if idx + 1 < self.0.len() => Name(self.0[idx + 1..].to_string()),
            _ => Name::root(),
        }
    }

    /// The ancestor keeping only the rightmost `count` labels.
    pub fn ancestor(&self, count: usize) -> Name {
        let total = self.label_count();
        if count >= total {
            return self.clone();
        }
        let mut name = self.clone();
        for _ in 0..total - count {
            name = name.parent();
        }
        name
    }

    /// True when `self` is equal to `zone` or below it on a label boundary.
    pub fn is_subdomain_of(&self, zone: &Name) -> bool {
        if zone.is_root() {
            return true;
        }
        if self == zone {
            return true;
        }
        self.0
            .to_ascii_lowercase()
            .ends_with(&format!(".{}", zone.0.to_ascii_lowercase()))
    }

    /// Prepend a label, e.g. wildcards: `"*"` + `"example.com."`.
    pub fn prepend(label: &str, base: &Name) -> Name {
        if base.is_root() {
            Name(format!("{}.", label))
        } else {
            Name(format!("{}.{}", label, base.0))
        }
    }

    /// Number of trailing labels shared by both names.
    pub fn common_suffix_len(&self, other: &Name) -> usize {
        let a: Vec<&str> = self.labels().collect();
        let b: Vec<&str> = other.labels().collect();
        let mut shared = 0;
        for (la, lb) in a.iter().rev().zip(b.iter().rev()) {
            if !la.eq_ignore_ascii_case(lb) {
                break;
            }
            shared += 1;
        }
        shared
    }

    /// Canonical DNSSEC ordering, RFC 4034 section 6.1: compare label
    /// sequences right to left, case-folded; a missing label sorts
    /// first.
    pub fn canonical_cmp(&self, other: &Name) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        let fold = |l: &str| l.bytes().map(|b| b.to_ascii_lowercase()).collect::<Vec<u8>>();
        let a: Vec<Vec<u8>> = self.labels().map(fold).collect();
        let b: Vec<Vec<u8>> = other.labels().map(fold).collect();
        let mut ia = a.iter().rev();
        let mut ib = b.iter().rev();
        loop {
            match (ia.next(), ib.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(la), Some(lb)) => match la.cmp(lb) {
                    Ordering::Equal => continue,
                    ord => return ord,
                },
            }
        }
    }

    /// Append the wire form to `buf`: uncompressed, labels case-folded
    /// to the canonical lowercase.
    pub fn to_wire(&self, buf: &mut Vec<u8>) {
        for label in self.labels() {
            buf.push(label.len() as u8);
            buf.extend(label.bytes().map(|b| b.to_ascii_lowercase()));
        }
        buf.push(0);
    }

    /// Wire length of the uncompressed form.
    pub fn wire_len(&self) -> usize {
        1 + self.labels().map(|l| l.len() + 1).sum::<usize>()
    }

    /// Decode a possibly-compressed name from `msg` starting at `off`.
    ///
    /// Returns the name and the offset just past its in-place encoding
    /// (pointers are followed but do not advance the cursor past the
    /// pointer itself).
    pub fn from_wire(msg: &[u8], off: usize) -> Result<(Name, usize), WireError> {
        let mut labels: Vec<String> = Vec::new();
        let mut pos = off;
        let mut cursor_end: Option<usize> = None;
        let mut hops = 0;
        let mut total = 1;

        loop {
            let len = *msg.get(pos).ok_or(WireError::Truncated)? as usize;
            match len {
                0 => {
                    pos += 1;
                    break;
                }
                1..=MAX_LABEL_LEN => {
                    let start = pos + 1;
                    let end = start + len;
                    let raw = msg.get(start..end).ok_or(WireError::Truncated)?;
                    if !raw.iter().all(|b| b.is_ascii()) {
                        return Err(WireError::BadLabel);
                    }
                    total += len + 1;
                    if total > MAX_NAME_WIRE_LEN {
                        return Err(WireError::NameTooLong);
                    }
                    labels.push(String::from_utf8_lossy(raw).into_owned());
                    pos = end;
                }
                l if l & 0xC0 == 0xC0 => {
                    let second = *msg.get(pos + 1).ok_or(WireError::Truncated)? as usize;
                    let target = ((len & 0x3F) << 8) | second;
                    if cursor_end.is_none() {
                        cursor_end = Some(pos + 2);
                    }
                    hops += 1;
                    if hops > MAX_POINTER_HOPS || target >= pos {
                        return Err(WireError::BadPointer);
                    }
                    pos = target;
                }
                _ => return Err(WireError::BadLabel),
            }
        }

        let name = if labels.is_empty() {
            Name::root()
        } else {
            let mut s = labels.join(".");
            s.push('.');
            Name(s)
        };
        Ok((name, cursor_end.unwrap_or(pos)))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Name {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Name::parse(s)
    }
}
