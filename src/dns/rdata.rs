//! Resource record data: the RR variants the resolver and validator work
//! with, plus opaque carry-through for everything else

use crate::dns::name::Name;
use crate::error::WireError;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Resource record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RrType {
    A,
    Ns,
    Cname,
    Soa,
    Null,
    Ptr,
    Hinfo,
    Txt,
    Aaaa,
    Dname,
    Opt,
    Ds,
    Rrsig,
    Nsec,
    Dnskey,
    Nsec3,
    Unknown(u16),
}

impl RrType {
    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => RrType::A,
            2 => RrType::Ns,
            5 => RrType::Cname,
            6 => RrType::Soa,
            10 => RrType::Null,
            12 => RrType::Ptr,
            13 => RrType::Hinfo,
            16 => RrType::Txt,
            28 => RrType::Aaaa,
            39 => RrType::Dname,
            41 => RrType::Opt,
            43 => RrType::Ds,
            46 => RrType::Rrsig,
            47 => RrType::Nsec,
            48 => RrType::Dnskey,
            50 => RrType::Nsec3,
            other => RrType::Unknown(other),
        }
    }

    /// Parse a type mnemonic, case-insensitive, with the generic
    /// `TYPEnnn` form as a fallback.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Some(RrType::A),
            "NS" => Some(RrType::Ns),
            "CNAME" => Some(RrType::Cname),
            "SOA" => Some(RrType::Soa),
            "NULL" => Some(RrType::Null),
            "PTR" => Some(RrType::Ptr),
            "HINFO" => Some(RrType::Hinfo),
            "TXT" => Some(RrType::Txt),
            "AAAA" => Some(RrType::Aaaa),
            "DNAME" => Some(RrType::Dname),
            "OPT" => Some(RrType::Opt),
            "DS" => Some(RrType::Ds),
            "RRSIG" => Some(RrType::Rrsig),
            "NSEC" => Some(RrType::Nsec),
            "DNSKEY" => Some(RrType::Dnskey),
            "NSEC3" => Some(RrType::Nsec3),
            other => other
                .strip_prefix("TYPE")
                .and_then(|n| n.parse().ok())
                .map(RrType::from_u16),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            RrType::A => 1,
            RrType::Ns => 2,
            RrType::Cname => 5,
            RrType::Soa => 6,
            RrType::Null => 10,
            RrType::Ptr => 12,
            RrType::Hinfo => 13,
            RrType::Txt => 16,
            RrType::Aaaa => 28,
            RrType::Dname => 39,
            RrType::Opt => 41,
            RrType::Ds => 43,
            RrType::Rrsig => 46,
            RrType::Nsec => 47,
            RrType::Dnskey => 48,
            RrType::Nsec3 => 50,
            RrType::Unknown(v) => v,
        }
    }
}

impl fmt::Display for RrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RrType::Unknown(v) => write!(f, "TYPE{}", v),
            other => write!(f, "{}", format!("{:?}", other).to_uppercase()),
        }
    }
}

/// Record classes. Only IN and CHAOS are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    In,
    Chaos,
    Unknown(u16),
}

impl Class {
    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => Class::In,
            3 => Class::Chaos,
            other => Class::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Class::In => 1,
            Class::Chaos => 3,
            Class::Unknown(v) => v,
        }
    }
}

/// SOA record data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Soa {
    pub mname: Name,
    pub rname: Name,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

/// DNSKEY record data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dnskey {
    pub flags: u16,
    pub protocol: u8,
    pub algorithm: u8,
    pub public_key: Vec<u8>,
}

impl Dnskey {
    /// The zone-key flag bit. Keys without it never sign record sets.
    pub fn is_zone_key(&self) -> bool {
        self.flags & 0x0100 != 0
    }

    /// The secure-entry-point flag marks key-signing keys.
    pub fn is_sep(&self) -> bool {
        self.flags & 0x0001 != 0
    }

    /// The revoke flag, RFC 5011.
    pub fn is_revoked(&self) -> bool {
        self.flags & 0x0080 != 0
    }
}

/// DS record data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ds {
    pub key_tag: u16,
    pub algorithm: u8,
    pub digest_type: u8,
    pub digest: Vec<u8>,
}

/// RRSIG record data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rrsig {
    pub type_covered: RrType,
    pub algorithm: u8,
    pub labels: u8,
    pub orig_ttl: u32,
    pub expiration: u32,
    pub inception: u32,
    pub key_tag: u16,
    pub signer: Name,
    pub signature: Vec<u8>,
}

/// NSEC record data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nsec {
    pub next: Name,
    pub types: Vec<RrType>,
}

impl Nsec {
    pub fn has_type(&self, t: RrType) -> bool {
        self.types.contains(&t)
    }
}

/// NSEC3 record data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nsec3 {
    pub hash_alg: u8,
    pub flags: u8,
    pub iterations: u16,
    pub salt: Vec<u8>,
    pub next_hashed: Vec<u8>,
    pub types: Vec<RrType>,
}

impl Nsec3 {
    /// Opt-Out flag: unsigned delegations may exist inside this span.
    pub fn opt_out(&self) -> bool {
        self.flags & 0x01 != 0
    }

    pub fn has_type(&self, t: RrType) -> bool {
        self.types.contains(&t)
    }
}

/// A single EDNS(0) option (code, opaque payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdnsOption {
    pub code: u16,
    pub data: Vec<u8>,
}

/// Record data as a closed union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ns(Name),
    Cname(Name),
    Dname(Name),
    Ptr(Name),
    Soa(Soa),
    Txt(Vec<String>),
    Hinfo { cpu: String, os: String },
    Dnskey(Dnskey),
    Ds(Ds),
    Rrsig(Rrsig),
    Nsec(Nsec),
    Nsec3(Nsec3),
    Opt(Vec<EdnsOption>),
    Null(Vec<u8>),
    Unknown(Vec<u8>),
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn read_u16(msg: &[u8], off: usize) -> Result<u16, WireError> {
    let b = msg.get(off..off + 2).ok_or(WireError::Truncated)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

fn read_u32(msg: &[u8], off: usize) -> Result<u32, WireError> {
    let b = msg.get(off..off + 4).ok_or(WireError::Truncated)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn put_char_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(255);
    buf.push(len as u8);
    buf.extend_from_slice(&bytes[..len]);
}

fn read_char_string(msg: &[u8], off: usize) -> Result<(String, usize), WireError> {
    let len = *msg.get(off).ok_or(WireError::Truncated)? as usize;
    let raw = msg.get(off + 1..off + 1 + len).ok_or(WireError::Truncated)?;
    Ok((String::from_utf8_lossy(raw).into_owned(), off + 1 + len))
}

/// Encode a sorted set of types as NSEC/NSEC3 window blocks.
pub fn encode_type_bitmap(types: &[RrType], buf: &mut Vec<u8>) {
    let mut values: Vec<u16> = types.iter().map(|t| t.to_u16()).collect();
    values.sort_unstable();
    values.dedup();

    let mut idx = 0;
    while idx < values.len() {
        let window = (values[idx] >> 8) as u8;
        let mut bitmap = [0u8; 32];
        let mut max_octet = 0usize;
        while idx < values.len() && (values[idx] >> 8) as u8 == window {
            let low = (values[idx] & 0xFF) as usize;
            bitmap[low / 8] |= 0x80 >> (low % 8);
            max_octet = low / 8;
            idx += 1;
        }
        buf.push(window);
        buf.push((max_octet + 1) as u8);
        buf.extend_from_slice(&bitmap[..=max_octet]);
    }
}

/// Decode NSEC/NSEC3 window blocks.
pub fn decode_type_bitmap(data: &[u8]) -> Result<Vec<RrType>, WireError> {
    let mut types = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        if pos + 2 > data.len() {
            return Err(WireError::Truncated);
        }
        let window = data[pos] as u16;
        let len = data[pos + 1] as usize;
        pos += 2;
        if len == 0 || len > 32 || pos + len > data.len() {
            return Err(WireError::BadBitmap);
        }
        for (octet, &byte) in data[pos..pos + len].iter().enumerate() {
            for bit in 0..8 {
                if byte & (0x80 >> bit) != 0 {
                    types.push(RrType::from_u16((window << 8) | (octet as u16 * 8 + bit)));
                }
            }
        }
        pos += len;
    }
    Ok(types)
}

impl RData {
    /// Append the wire form (uncompressed, names lowercase) to `buf`.
    /// This is also the DNSSEC canonical form.
    pub fn to_wire(&self, buf: &mut Vec<u8>) {
        match self {
            RData::A(ip) => buf.extend_from_slice(&ip.octets()),
            RData::Aaaa(ip) => buf.extend_from_slice(&ip.octets()),
            RData::Ns(n) | RData::Cname(n) | RData::Dname(n) | RData::Ptr(n) => n.to_wire(buf),
            RData::Soa(soa) => {
                soa.mname.to_wire(buf);
                soa.rname.to_wire(buf);
                put_u32(buf, soa.serial);
                put_u32(buf, soa.refresh);
                put_u32(buf, soa.retry);
                put_u32(buf, soa.expire);
                put_u32(buf, soa.minimum);
            }
            RData::Txt(strings) => {
                for s in strings {
                    put_char_string(buf, s);
                }
            }
            RData::Hinfo { cpu, os } => {
                put_char_string(buf, cpu);
                put_char_string(buf, os);
            }
            RData::Dnskey(k) => {
                put_u16(buf, k.flags);
                buf.push(k.protocol);
                buf.push(k.algorithm);
                buf.extend_from_slice(&k.public_key);
            }
            RData::Ds(ds) => {
                put_u16(buf, ds.key_tag);
                buf.push(ds.algorithm);
                buf.push(ds.digest_type);
                buf.extend_from_slice(&ds.digest);
            }
            RData::Rrsig(sig) => {
                put_u16(buf, sig.type_covered.to_u16());
                buf.push(sig.algorithm);
                buf.push(sig.labels);
                put_u32(buf, sig.orig_ttl);
                put_u32(buf, sig.expiration);
                put_u32(buf, sig.inception);
                put_u16(buf, sig.key_tag);
                sig.signer.to_wire(buf);
                buf.extend_from_slice(&sig.signature);
            }
            RData::Nsec(nsec) => {
                nsec.next.to_wire(buf);
                encode_type_bitmap(&nsec.types, buf);
            }
            RData::Nsec3(n3) => {
                buf.push(n3.hash_alg);
                buf.push(n3.flags);
                put_u16(buf, n3.iterations);
                buf.push(n3.salt.len() as u8);
                buf.extend_from_slice(&n3.salt);
                buf.push(n3.next_hashed.len() as u8);
                buf.extend_from_slice(&n3.next_hashed);
                encode_type_bitmap(&n3.types, buf);
            }
            RData::Opt(options) => {
                for opt in options {
                    put_u16(buf, opt.code);
                    put_u16(buf, opt.data.len() as u16);
                    buf.extend_from_slice(&opt.data);
                }
            }
            RData::Null(raw) | RData::Unknown(raw) => buf.extend_from_slice(raw),
        }
    }

    /// Decode rdata of the given type. `msg` is the entire message so
    /// compressed names inside rdata resolve; the payload spans
    /// `[off, off + rdlen)`.
    pub fn from_wire(
        rrtype: RrType,
        msg: &[u8],
        off: usize,
        rdlen: usize,
    ) -> Result<RData, WireError> {
        let end = off + rdlen;
        let raw = msg.get(off..end).ok_or(WireError::Truncated)?;
        let data = match rrtype {
            RrType::A => {
                if rdlen != 4 {
                    return Err(WireError::BadRdata);
                }
                RData::A(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
            }
            RrType::Aaaa => {
                if rdlen != 16 {
                    return Err(WireError::BadRdata);
                }
                let mut o = [0u8; 16];
                o.copy_from_slice(raw);
                RData::Aaaa(Ipv6Addr::from(o))
            }
            RrType::Ns => RData::Ns(Name::from_wire(msg, off)?.0),
            RrType::Cname => RData::Cname(Name::from_wire(msg, off)?.0),
            RrType::Dname => RData::Dname(Name::from_wire(msg, off)?.0),
            RrType::Ptr => RData::Ptr(Name::from_wire(msg, off)?.0),
            RrType::Soa => {
                let (mname, p) = Name::from_wire(msg, off)?;
                let (rname, p) = Name::from_wire(msg, p)?;
                if p + 20 > end {
                    return Err(WireError::Truncated);
                }
                RData::Soa(Soa {
                    mname,
                    rname,
                    serial: read_u32(msg, p)?,
                    refresh: read_u32(msg, p + 4)?,
                    retry: read_u32(msg, p + 8)?,
                    expire: read_u32(msg, p + 12)?,
                    minimum: read_u32(msg, p + 16)?,
                })
            }
            RrType::Txt => {
                let mut strings = Vec::new();
                let mut pos = off;
                while pos < end {
                    let (s, next) = read_char_string(msg, pos)?;
                    if next > end {
                        return Err(WireError::Truncated);
                    }
                    strings.push(s);
                    pos = next;
                }
                RData::Txt(strings)
            }
            RrType::Hinfo => {
                let (cpu, p) = read_char_string(msg, off)?;
                let (os, p) = read_char_string(msg, p)?;
                if p > end {
                    return Err(WireError::Truncated);
                }
                RData::Hinfo { cpu, os }
            }
            RrType::Dnskey => {
                if rdlen < 4 {
                    return Err(WireError::BadRdata);
                }
                RData::Dnskey(Dnskey {
                    flags: u16::from_be_bytes([raw[0], raw[1]]),
                    protocol: raw[2],
                    algorithm: raw[3],
                    public_key: raw[4..].to_vec(),
                })
            }
            RrType::Ds => {
                if rdlen < 4 {
                    return Err(WireError::BadRdata);
                }
                RData::Ds(Ds {
                    key_tag: u16::from_be_bytes([raw[0], raw[1]]),
                    algorithm: raw[2],
                    digest_type: raw[3],
                    digest: raw[4..].to_vec(),
                })
            }
            RrType::Rrsig => {
                if rdlen < 18 {
                    return Err(WireError::BadRdata);
                }
                let type_covered = RrType::from_u16(read_u16(msg, off)?);
                let (signer, p) = Name::from_wire(msg, off + 18)?;
                if p > end {
                    return Err(WireError::Truncated);
                }
                RData::Rrsig(Rrsig {
                    type_covered,
                    algorithm: raw[2],
                    labels: raw[3],
                    orig_ttl: read_u32(msg, off + 4)?,
                    expiration: read_u32(msg, off + 8)?,
                    inception: read_u32(msg, off + 12)?,
                    key_tag: read_u16(msg, off + 16)?,
                    signer,
                    signature: msg.get(p..end).ok_or(WireError::Truncated)?.to_vec(),
                })
            }
            RrType::Nsec => {
                let (next, p) = Name::from_wire(msg, off)?;
                if p > end {
                    return Err(WireError::Truncated);
                }
                RData::Nsec(Nsec {
                    next,
                    types: decode_type_bitmap(&msg[p..end])?,
                })
            }
            RrType::Nsec3 => {
                if rdlen < 5 {
                    return Err(WireError::BadRdata);
                }
                let salt_len = raw[4] as usize;
                let mut pos = 5 + salt_len;
                if pos + 1 > raw.len() {
                    return Err(WireError::Truncated);
                }
                let salt = raw[5..pos].to_vec();
                let hash_len = raw[pos] as usize;
                pos += 1;
                if pos + hash_len > raw.len() {
                    return Err(WireError::Truncated);
                }
                let next_hashed = raw[pos..pos + hash_len].to_vec();
                pos += hash_len;
                RData::Nsec3(Nsec3 {
                    hash_alg: raw[0],
                    flags: raw[1],
                    iterations: u16::from_be_bytes([raw[2], raw[3]]),
                    salt,
                    next_hashed,
                    types: decode_type_bitmap(&raw[pos..])?,
                })
            }
            RrType::Opt => {
                let mut options = Vec::new();
                let mut pos = 0;
                while pos + 4 <= raw.len() {
                    let code = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
                    let len = u16::from_be_bytes([raw[pos + 2], raw[pos + 3]]) as usize;
                    pos += 4;
                    if pos + len > raw.len() {
                        return Err(WireError::Truncated);
                    }
                    options.push(EdnsOption {
                        code,
                        data: raw[pos..pos + len].to_vec(),
                    });
                    pos += len;
                }
                RData::Opt(options)
            }
            RrType::Null => RData::Null(raw.to_vec()),
            _ => RData::Unknown(raw.to_vec()),
        };
        Ok(data)
    }
}
