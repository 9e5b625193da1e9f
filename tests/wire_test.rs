//! Wire-format and cache-behavior properties

use ironroot::dns::{Class, Message, Name, RData, Rcode, Record, RrType};
use ironroot::{AuthServerSet, NsCache, NsEntry};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn rr(name: &str, rrtype: RrType, data: RData) -> Record {
    Record::new(Name::parse(name).unwrap(), rrtype, 3600, data)
}

fn full_message() -> Message {
    let mut m = Message::query(Name::parse("www.example.com.").unwrap(), RrType::A);
    m.id = 0xBEEF;
    m.response = true;
    m.authoritative = true;
    m.answer.push(rr(
        "www.example.com.",
        RrType::Cname,
        RData::Cname(Name::parse("web.example.com.").unwrap()),
    ));
    m.answer.push(rr(
        "web.example.com.",
        RrType::A,
        RData::A("93.184.216.34".parse().unwrap()),
    ));
    m.ns.push(rr(
        "example.com.",
        RrType::Soa,
        RData::Soa(ironroot::dns::rdata::Soa {
            mname: Name::parse("ns1.example.com.").unwrap(),
            rname: Name::parse("hostmaster.example.com.").unwrap(),
            serial: 2024061800,
            refresh: 7200,
            retry: 3600,
            expire: 1209600,
            minimum: 300,
        }),
    ));
    m.extra.push(rr(
        "ns1.example.com.",
        RrType::Aaaa,
        RData::Aaaa("2001:db8::53".parse().unwrap()),
    ));
    m
}

#[test]
fn test_pack_unpack_preserves_question_and_section_counts() {
    let m = full_message();
    let back = Message::unpack(&m.pack()).unwrap();

    assert_eq!(back.q().unwrap().name, m.q().unwrap().name);
    assert_eq!(back.q().unwrap().qtype, m.q().unwrap().qtype);
    assert_eq!(back.q().unwrap().qclass, m.q().unwrap().qclass);
    assert_eq!(back.answer.len(), m.answer.len());
    assert_eq!(back.ns.len(), m.ns.len());
    assert_eq!(back.extra.len(), m.extra.len());
    assert_eq!(back, m);
}

#[test]
fn test_pack_unpack_dnssec_records() {
    let mut m = Message::query(Name::parse("example.com.").unwrap(), RrType::Dnskey);
    m.response = true;
    m.answer.push(rr(
        "example.com.",
        RrType::Dnskey,
        RData::Dnskey(ironroot::dns::rdata::Dnskey {
            flags: 257,
            protocol: 3,
            algorithm: 13,
            public_key: vec![7u8; 64],
        }),
    ));
    m.answer.push(rr(
        "example.com.",
        RrType::Rrsig,
        RData::Rrsig(ironroot::dns::rdata::Rrsig {
            type_covered: RrType::Dnskey,
            algorithm: 13,
            labels: 2,
            orig_ttl: 3600,
            expiration: 1767225600,
            inception: 1764633600,
            key_tag: 12345,
            signer: Name::parse("example.com.").unwrap(),
            signature: vec![9u8; 64],
        }),
    ));
    m.ns.push(rr(
        "a.example.com.",
        RrType::Nsec,
        RData::Nsec(ironroot::dns::rdata::Nsec {
            next: Name::parse("c.example.com.").unwrap(),
            types: vec![RrType::A, RrType::Rrsig, RrType::Nsec],
        }),
    ));

    let back = Message::unpack(&m.pack()).unwrap();
    assert_eq!(back, m);
}

#[test]
fn test_unpack_handles_compressed_names() {
    // hand-built response with the answer owner compressed to the
    // question name
    let mut wire = Vec::new();
    wire.extend_from_slice(&0x1234u16.to_be_bytes());
    wire.extend_from_slice(&0x8180u16.to_be_bytes());
    wire.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0, 0]);
    let question_at = wire.len();
    Name::parse("example.org.").unwrap().to_wire(&mut wire);
    wire.extend_from_slice(&RrType::A.to_u16().to_be_bytes());
    wire.extend_from_slice(&Class::In.to_u16().to_be_bytes());
    // answer: pointer to the question name
    wire.extend_from_slice(&[0xC0, question_at as u8]);
    wire.extend_from_slice(&RrType::A.to_u16().to_be_bytes());
    wire.extend_from_slice(&Class::In.to_u16().to_be_bytes());
    wire.extend_from_slice(&300u32.to_be_bytes());
    wire.extend_from_slice(&4u16.to_be_bytes());
    wire.extend_from_slice(&[192, 0, 2, 1]);

    let m = Message::unpack(&wire).unwrap();
    assert_eq!(m.answer.len(), 1);
    assert_eq!(m.answer[0].name, Name::parse("example.org.").unwrap());
    assert!(matches!(m.answer[0].data, RData::A(ip) if ip.octets() == [192, 0, 2, 1]));
}

#[test]
fn test_reply_rcodes_roundtrip() {
    for rcode in [
        Rcode::Success,
        Rcode::FormErr,
        Rcode::ServFail,
        Rcode::NameError,
        Rcode::Refused,
        Rcode::NotZone,
    ] {
        let mut m = Message::query(Name::root(), RrType::Ns);
        m.response = true;
        m.rcode = rcode;
        assert_eq!(Message::unpack(&m.pack()).unwrap().rcode, rcode);
    }
}

fn entry() -> NsEntry {
    NsEntry::new(
        Arc::new(AuthServerSet::new(Name::parse("example.com.").unwrap(), false)),
        Vec::new(),
    )
}

#[test]
fn test_ns_cache_ttl_clamping() {
    let cache = NsCache::new(8);
    let now = Instant::now();

    // one minute clamps up to one hour
    cache.set(1, entry(), Duration::from_secs(60));
    assert!(cache.get_at(1, now + Duration::from_secs(59 * 60)).is_ok());
    assert!(cache.get_at(1, now + Duration::from_secs(61 * 60)).is_err());

    // six hours is stored as-is
    cache.set(2, entry(), Duration::from_secs(6 * 3600));
    assert!(cache
        .get_at(2, now + Duration::from_secs(6 * 3600 - 60))
        .is_ok());
    assert!(cache
        .get_at(2, now + Duration::from_secs(6 * 3600 + 60))
        .is_err());

    // a day clamps down to twelve hours
    cache.set(3, entry(), Duration::from_secs(24 * 3600));
    assert!(cache
        .get_at(3, now + Duration::from_secs(12 * 3600 - 60))
        .is_ok());
    assert!(cache
        .get_at(3, now + Duration::from_secs(12 * 3600 + 60))
        .is_err());
}

#[test]
fn test_ns_cache_expired_is_not_missing() {
    use ironroot::cache::CacheMiss;
    let cache = NsCache::new(8);
    let now = Instant::now();
    cache.set(9, entry(), Duration::from_secs(3600));
    assert_eq!(
        cache.get_at(7, now).err(),
        Some(CacheMiss::NotFound)
    );
    assert_eq!(
        cache.get_at(9, now + Duration::from_secs(2 * 3600)).err(),
        Some(CacheMiss::Expired)
    );
}
