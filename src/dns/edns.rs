//! EDNS(0) handling: OPT pseudo-record, DO bit, extended errors,
//! TCP keepalive option

use crate::dns::message::{Message, Record};
use crate::dns::name::Name;
use crate::dns::rdata::{Class, EdnsOption, RData, RrType};
use std::time::Duration;

/// EDNS option code: TCP keepalive, RFC 7828.
pub const OPT_CODE_KEEPALIVE: u16 = 11;

/// EDNS option code: extended DNS error, RFC 8914.
pub const OPT_CODE_EDE: u16 = 15;

/// Smallest receive size a peer may advertise.
pub const MIN_UDP_SIZE: u16 = 512;

/// DO flag bit inside the OPT TTL field.
const DO_BIT: u32 = 0x0000_8000;

impl Message {
    /// The OPT pseudo-record, when present.
    pub fn opt(&self) -> Option<&Record> {
        self.extra.iter().find(|rr| rr.rrtype == RrType::Opt)
    }

    fn opt_mut(&mut self) -> Option<&mut Record> {
        self.extra.iter_mut().find(|rr| rr.rrtype == RrType::Opt)
    }

    pub fn is_edns(&self) -> bool {
        self.opt().is_some()
    }

    /// Attach (or replace) an OPT record advertising `udp_size`.
    pub fn set_edns(&mut self, udp_size: u16, do_bit: bool) {
        self.strip_opt();
        let ttl = if do_bit { DO_BIT } else { 0 };
        self.extra.push(Record {
            name: Name::root(),
            rrtype: RrType::Opt,
            class: Class::Unknown(udp_size),
            ttl,
            data: RData::Opt(Vec::new()),
        });
    }

    /// Remove the OPT record, if any.
    pub fn strip_opt(&mut self) {
        self.extra.retain(|rr| rr.rrtype != RrType::Opt);
    }

    /// Advertised UDP payload size, clamped to the protocol minimum.
    pub fn udp_size(&self) -> u16 {
        match self.opt() {
            Some(rr) => rr.class.to_u16().max(MIN_UDP_SIZE),
            None => MIN_UDP_SIZE,
        }
    }

    /// The DNSSEC-OK flag from the OPT TTL field.
    pub fn do_bit(&self) -> bool {
        self.opt().map(|rr| rr.ttl & DO_BIT != 0).unwrap_or(false)
    }

    fn push_option(&mut self, option: EdnsOption) {
        if let Some(rr) = self.opt_mut() {
            if let RData::Opt(options) = &mut rr.data {
                options.push(option);
            }
        }
    }

    fn find_option(&self, code: u16) -> Option<&EdnsOption> {
        match self.opt() {
            Some(Record {
                data: RData::Opt(options),
                ..
            }) => options.iter().find(|o| o.code == code),
            _ => None,
        }
    }

    /// Attach an extended DNS error to an existing OPT record.
    pub fn add_ede(&mut self, code: u16, text: &str) {
        let mut data = code.to_be_bytes().to_vec();
        data.extend_from_slice(text.as_bytes());
        self.push_option(EdnsOption {
            code: OPT_CODE_EDE,
            data,
        });
    }

    /// Ask the server to keep the TCP connection open (empty payload).
    pub fn request_keepalive(&mut self) {
        if self.find_option(OPT_CODE_KEEPALIVE).is_none() {
            self.push_option(EdnsOption {
                code: OPT_CODE_KEEPALIVE,
                data: Vec::new(),
            });
        }
    }

    /// The server-advertised keepalive timeout (units of 100 ms).
    pub fn keepalive_timeout(&self) -> Option<Duration> {
        let opt = self.find_option(OPT_CODE_KEEPALIVE)?;
        if opt.data.len() != 2 {
            return None;
        }
        let units = u16::from_be_bytes([opt.data[0], opt.data[1]]);
        Some(Duration::from_millis(units as u64 * 100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_edns_and_do() {
        let mut m = Message::query(Name::parse("example.com.").unwrap(), RrType::A);
        assert!(!m.is_edns());
        assert_eq!(m.udp_size(), MIN_UDP_SIZE);
        m.set_edns(1232, true);
        assert!(m.is_edns());
        assert!(m.do_bit());
        assert_eq!(m.udp_size(), 1232);
        m.set_edns(100, false);
        // below protocol minimum clamps up
        assert_eq!(m.udp_size(), MIN_UDP_SIZE);
        assert!(!m.do_bit());
    }

    #[test]
    fn test_edns_survives_wire() {
        let mut m = Message::query(Name::root(), RrType::Dnskey);
        m.set_edns(4096, true);
        m.add_ede(9, "no dnskey");
        let back = Message::unpack(&m.pack()).unwrap();
        assert!(back.do_bit());
        assert_eq!(back.udp_size(), 4096);
        let ede = back.find_option(OPT_CODE_EDE).unwrap();
        assert_eq!(&ede.data[..2], &9u16.to_be_bytes());
    }

    #[test]
    fn test_keepalive_roundtrip() {
        let mut m = Message::new();
        m.set_edns(1232, false);
        m.push_option(EdnsOption {
            code: OPT_CODE_KEEPALIVE,
            data: 50u16.to_be_bytes().to_vec(),
        });
        assert_eq!(m.keepalive_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_strip_opt() {
        let mut m = Message::new();
        m.set_edns(1232, true);
        m.strip_opt();
        assert!(!m.is_edns());
    }
}
