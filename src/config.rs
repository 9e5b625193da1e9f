//! Resolver configuration: defaults, TOML loading, root hints

use crate::dns::message::Record;
use crate::dns::name::Name;
use crate::dns::rdata::{Dnskey, RData, RrType};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// The 13 root server IPv4 hints.
pub const ROOT_SERVERS: [&str; 13] = [
    "198.41.0.4:53",
    "170.247.170.2:53",
    "192.33.4.12:53",
    "199.7.91.13:53",
    "192.203.230.10:53",
    "192.5.5.241:53",
    "192.112.36.4:53",
    "198.97.190.53:53",
    "192.36.148.17:53",
    "192.58.128.30:53",
    "193.0.14.129:53",
    "199.7.83.42:53",
    "202.12.27.33:53",
];

/// The 13 root server IPv6 hints.
pub const ROOT6_SERVERS: [&str; 13] = [
    "[2001:503:ba3e::2:30]:53",
    "[2801:1b8:10::b]:53",
    "[2001:500:2::c]:53",
    "[2001:500:2d::d]:53",
    "[2001:500:a8::e]:53",
    "[2001:500:2f::f]:53",
    "[2001:500:12::d0d]:53",
    "[2001:500:1::53]:53",
    "[2001:7fe::53]:53",
    "[2001:503:c27::2:30]:53",
    "[2001:7fd::1]:53",
    "[2001:500:9f::42]:53",
    "[2001:dc3::35]:53",
];

/// The active root key-signing key (tag 20326). Successors are learned
/// through the automated rollover machinery and persisted.
pub const ROOT_KEYS: [&str; 1] = [
    ". 172800 IN DNSKEY 257 3 8 AwEAAaz/tAm8yTn4Mfeh5eyI96WSVexTBAvkMgJzkKTOiW1vkIbzxeF3+/4RgWOq7HrxRixHlFlExOLAJr5emLvN7SWXgnLh4+B5xQlNVz8Og8kvArMtNROxVQuCaSnIDdD5LKyWbRd2n9WGe2R8PzgCmr3EgVLrjyBxWezF0jLHwVN8efS3rCj/EWgvIWgb9tarpVUDK/b58Da+sqqls3eNbuv7pr+eoZG+SrDK6nWeL3c6H5Apxz7LjVc1uTIdsIXxuOLYA4/ilBmSVIzuDWfdRUfhHdY6+cn8HFRm+2hM8AnXGXws9555KrUB5qihylGa8subX2Nn6UwNR1AkUTV74bU=",
];

/// Everything the core reads. Unknown TOML keys are rejected so typos
/// surface at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub root_servers: Vec<String>,
    pub root6_servers: Vec<String>,
    pub root_keys: Vec<String>,
    pub dnssec: bool,
    pub maxdepth: u32,
    /// Whole-resolution budget, seconds.
    pub query_timeout: u64,
    /// Per-server exchange budget, seconds.
    pub timeout: u64,
    /// Label depth up to which qname minimization applies; 0 disables.
    pub qname_min_level: usize,
    pub outbound_ips: Vec<IpAddr>,
    pub outbound_ip6s: Vec<IpAddr>,
    pub ipv6_access: bool,
    pub tcp_keepalive: bool,
    pub root_tcp_timeout: u64,
    pub tld_tcp_timeout: u64,
    pub tcp_max_connections: usize,
    pub max_concurrent_queries: usize,
    /// Data directory for persisted state.
    pub directory: PathBuf,
    /// Listen address for the bundled UDP/TCP front end.
    pub bind: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root_servers: ROOT_SERVERS.iter().map(|s| s.to_string()).collect(),
            root6_servers: ROOT6_SERVERS.iter().map(|s| s.to_string()).collect(),
            root_keys: ROOT_KEYS.iter().map(|s| s.to_string()).collect(),
            dnssec: true,
            maxdepth: 30,
            query_timeout: 10,
            timeout: 2,
            qname_min_level: 5,
            outbound_ips: Vec::new(),
            outbound_ip6s: Vec::new(),
            ipv6_access: false,
            tcp_keepalive: true,
            root_tcp_timeout: 5,
            tld_tcp_timeout: 10,
            tcp_max_connections: 100,
            max_concurrent_queries: 1000,
            directory: PathBuf::from("./data"),
            bind: "127.0.0.1:53".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Config, std::io::Error> {
        let data = std::fs::read_to_string(path)?;
        toml::from_str(&data).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }

    pub fn net_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn root_tcp_timeout(&self) -> Duration {
        Duration::from_secs(self.root_tcp_timeout)
    }

    pub fn tld_tcp_timeout(&self) -> Duration {
        Duration::from_secs(self.tld_tcp_timeout)
    }

    /// Parse the configured root keys, skipping lines that do not parse.
    pub fn root_key_records(&self) -> Vec<Record> {
        self.root_keys
            .iter()
            .filter_map(|line| match parse_dnskey_line(line) {
                Some(rr) => Some(rr),
                None => {
                    warn!("ignoring unparseable root key line: {}", line);
                    None
                }
            })
            .collect()
    }
}

/// Parse one presentation-format DNSKEY line:
/// `<owner> <ttl> IN DNSKEY <flags> <protocol> <algorithm> <base64...>`.
pub fn parse_dnskey_line(line: &str) -> Option<Record> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 || !fields[3].eq_ignore_ascii_case("dnskey") {
        return None;
    }
    let owner = Name::parse(fields[0]).ok()?;
    let ttl: u32 = fields[1].parse().ok()?;
    if !fields[2].eq_ignore_ascii_case("in") {
        return None;
    }
    let flags: u16 = fields[4].parse().ok()?;
    let protocol: u8 = fields[5].parse().ok()?;
    let algorithm: u8 = fields[6].parse().ok()?;
    let b64: String = fields[7..].concat();
    let public_key = base64::engine::general_purpose::STANDARD
        .decode(b64.as_bytes())
        .ok()?;
    Some(Record::new(
        owner,
        RrType::Dnskey,
        ttl,
        RData::Dnskey(Dnskey {
            flags,
            protocol,
            algorithm,
            public_key,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnssec::sig::key_tag;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.root_servers.len(), 13);
        assert_eq!(cfg.root6_servers.len(), 13);
        assert_eq!(cfg.maxdepth, 30);
        assert_eq!(cfg.query_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.net_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.qname_min_level, 5);
        assert_eq!(cfg.max_concurrent_queries, 1000);
        assert!(cfg.dnssec);
    }

    #[test]
    fn test_default_root_key_parses_to_ksk() {
        let keys = Config::default().root_key_records();
        assert_eq!(keys.len(), 1);
        match &keys[0].data {
            RData::Dnskey(key) => {
                assert_eq!(key.flags, 257);
                assert_eq!(key_tag(key), 20326);
            }
            other => panic!("expected DNSKEY, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_dnskey_line("not a key").is_none());
        assert!(parse_dnskey_line(". 172800 IN A 1.2.3.4").is_none());
    }

    #[test]
    fn test_toml_roundtrip() {
        let cfg = Config::default();
        let text = toml::to_string(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.maxdepth, cfg.maxdepth);
        assert_eq!(back.root_servers, cfg.root_servers);
    }
}
