//! DNS message model and wire codec

use crate::dns::name::Name;
use crate::dns::rdata::{Class, RData, RrType};
use crate::error::WireError;
use std::fmt;

/// Response codes the resolver interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    Success,
    FormErr,
    ServFail,
    NameError,
    NotImpl,
    Refused,
    NotZone,
    Unknown(u8),
}

impl Rcode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Rcode::Success,
            1 => Rcode::FormErr,
            2 => Rcode::ServFail,
            3 => Rcode::NameError,
            4 => Rcode::NotImpl,
            5 => Rcode::Refused,
            10 => Rcode::NotZone,
            other => Rcode::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Rcode::Success => 0,
            Rcode::FormErr => 1,
            Rcode::ServFail => 2,
            Rcode::NameError => 3,
            Rcode::NotImpl => 4,
            Rcode::Refused => 5,
            Rcode::NotZone => 10,
            Rcode::Unknown(v) => v,
        }
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Rcode::Success => "NOERROR",
            Rcode::FormErr => "FORMERR",
            Rcode::ServFail => "SERVFAIL",
            Rcode::NameError => "NXDOMAIN",
            Rcode::NotImpl => "NOTIMP",
            Rcode::Refused => "REFUSED",
            Rcode::NotZone => "NOTZONE",
            Rcode::Unknown(v) => return write!(f, "RCODE{}", v),
        };
        f.write_str(s)
    }
}

/// The unit of lookup: name, type, class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    pub name: Name,
    pub qtype: RrType,
    pub qclass: Class,
}

impl Question {
    pub fn new(name: Name, qtype: RrType) -> Self {
        Question {
            name,
            qtype,
            qclass: Class::In,
        }
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.qtype)
    }
}

/// One resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: Name,
    pub rrtype: RrType,
    pub class: Class,
    pub ttl: u32,
    pub data: RData,
}

impl Record {
    pub fn new(name: Name, rrtype: RrType, ttl: u32, data: RData) -> Self {
        Record {
            name,
            rrtype,
            class: Class::In,
            ttl,
            data,
        }
    }

    /// Append the full record wire form (owner, type, class, ttl, rdata).
    pub fn to_wire(&self, buf: &mut Vec<u8>) {
        self.name.to_wire(buf);
        buf.extend_from_slice(&self.rrtype.to_u16().to_be_bytes());
        buf.extend_from_slice(&self.class.to_u16().to_be_bytes());
        buf.extend_from_slice(&self.ttl.to_be_bytes());
        let rdlen_at = buf.len();
        buf.extend_from_slice(&[0, 0]);
        self.data.to_wire(buf);
        let rdlen = (buf.len() - rdlen_at - 2) as u16;
        buf[rdlen_at..rdlen_at + 2].copy_from_slice(&rdlen.to_be_bytes());
    }
}

/// A full DNS message. Reusable: `reset` clears every field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub response: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub authenticated_data: bool,
    pub checking_disabled: bool,
    pub rcode: Rcode,
    pub question: Vec<Question>,
    pub answer: Vec<Record>,
    pub ns: Vec<Record>,
    pub extra: Vec<Record>,
}

impl Default for Rcode {
    fn default() -> Self {
        Rcode::Success
    }
}

impl Message {
    pub fn new() -> Self {
        Message::default()
    }

    /// Build a query for one question.
    pub fn query(name: Name, qtype: RrType) -> Self {
        let mut m = Message::new();
        m.recursion_desired = true;
        m.question.push(Question::new(name, qtype));
        m
    }

    /// Clear every field so the message can be reused from a pool.
    pub fn reset(&mut self) {
        self.id = 0;
        self.response = false;
        self.opcode = 0;
        self.authoritative = false;
        self.truncated = false;
        self.recursion_desired = false;
        self.recursion_available = false;
        self.authenticated_data = false;
        self.checking_disabled = false;
        self.rcode = Rcode::Success;
        self.question.clear();
        self.answer.clear();
        self.ns.clear();
        self.extra.clear();
    }

    /// Turn this message into a reply skeleton for `req`.
    pub fn set_reply(&mut self, req: &Message) {
        self.reset();
        self.id = req.id;
        self.response = true;
        self.opcode = req.opcode;
        self.recursion_desired = req.recursion_desired;
        self.checking_disabled = req.checking_disabled;
        self.question = req.question.clone();
    }

    /// The first (and in practice only) question, if any.
    pub fn q(&self) -> Option<&Question> {
        self.question.first()
    }

    /// Serialize to wire form. Owner names are emitted uncompressed.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(512);
        buf.extend_from_slice(&self.id.to_be_bytes());

        let mut flags: u16 = 0;
        if self.response {
            flags |= 0x8000;
        }
        flags |= ((self.opcode & 0x0F) as u16) << 11;
        if self.authoritative {
            flags |= 0x0400;
        }
        if self.truncated {
            flags |= 0x0200;
        }
        if self.recursion_desired {
            flags |= 0x0100;
        }
        if self.recursion_available {
            flags |= 0x0080;
        }
        if self.authenticated_data {
            flags |= 0x0020;
        }
        if self.checking_disabled {
            flags |= 0x0010;
        }
        flags |= (self.rcode.to_u8() & 0x0F) as u16;
        buf.extend_from_slice(&flags.to_be_bytes());

        buf.extend_from_slice(&(self.question.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.answer.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.ns.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.extra.len() as u16).to_be_bytes());

        for q in &self.question {
            q.name.to_wire(&mut buf);
            buf.extend_from_slice(&q.qtype.to_u16().to_be_bytes());
            buf.extend_from_slice(&q.qclass.to_u16().to_be_bytes());
        }
        for rr in self.answer.iter().chain(&self.ns).chain(&self.extra) {
            rr.to_wire(&mut buf);
        }
        buf
    }

    /// Parse a message from wire form.
    pub fn unpack(data: &[u8]) -> Result<Message, WireError> {
        if data.len() < 12 {
            return Err(WireError::Truncated);
        }
        let mut m = Message::new();
        m.id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        m.response = flags & 0x8000 != 0;
        m.opcode = ((flags >> 11) & 0x0F) as u8;
        m.authoritative = flags & 0x0400 != 0;
        m.truncated = flags & 0x0200 != 0;
        m.recursion_desired = flags & 0x0100 != 0;
        m.recursion_available = flags & 0x0080 != 0;
        m.authenticated_data = flags & 0x0020 != 0;
        m.checking_disabled = flags & 0x0010 != 0;
        m.rcode = Rcode::from_u8((flags & 0x0F) as u8);

        let qd = u16::from_be_bytes([data[4], data[5]]) as usize;
        let an = u16::from_be_bytes([data[6], data[7]]) as usize;
        let au = u16::from_be_bytes([data[8], data[9]]) as usize;
        let ad = u16::from_be_bytes([data[10], data[11]]) as usize;

        let mut pos = 12;
        for _ in 0..qd {
            let (name, p) = Name::from_wire(data, pos)?;
            let qtype = data
                .get(p..p + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or(WireError::Truncated)?;
            let qclass = data
                .get(p + 2..p + 4)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or(WireError::Truncated)?;
            m.question.push(Question {
                name,
                qtype: RrType::from_u16(qtype),
                qclass: Class::from_u16(qclass),
            });
            pos = p + 4;
        }

        for section in 0..3 {
            let count = match section {
                0 => an,
                1 => au,
                _ => ad,
            };
            for _ in 0..count {
                let (rr, p) = Self::unpack_record(data, pos)?;
                pos = p;
                match section {
                    0 => m.answer.push(rr),
                    1 => m.ns.push(rr),
                    _ => m.extra.push(rr),
                }
            }
        }
        Ok(m)
    }

    fn unpack_record(data: &[u8], off: usize) -> Result<(Record, usize), WireError> {
        let (name, p) = Name::from_wire(data, off)?;
        let fixed = data.get(p..p + 10).ok_or(WireError::Truncated)?;
        let rrtype = RrType::from_u16(u16::from_be_bytes([fixed[0], fixed[1]]));
        let class = Class::from_u16(u16::from_be_bytes([fixed[2], fixed[3]]));
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rdlen = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        let rdata_off = p + 10;
        if data.len() < rdata_off + rdlen {
            return Err(WireError::Truncated);
        }
        let rdata = RData::from_wire(rrtype, data, rdata_off, rdlen)?;
        Ok((
            Record {
                name,
                rrtype,
                class,
                ttl,
                data: rdata,
            },
            rdata_off + rdlen,
        ))
    }
}
