//! Address candidates: the ways a contact can be reached.
//!
//! A candidate is an IP address, a scoped IPv6 link-local address, a MAC
//! address (resolved at connect time) or a domain name. Candidates are kept
//! normalized: IPs and domains lowercase, MACs uppercase with colons.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("empty address")]
    Empty,

    #[error("link-local address {0} needs an interface, e.g. fe80::1%wlan0")]
    MissingScope(String),

    #[error("not an IP, MAC or domain: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Candidate {
    Ip(IpAddr),
    /// IPv6 link-local address, only meaningful together with its interface.
    LinkLocal { ip: Ipv6Addr, interface: String },
    Mac([u8; 6]),
    Domain(String),
}

impl Candidate {
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }

        if let Some(mac) = parse_mac(s) {
            return Ok(Candidate::Mac(mac));
        }

        let unbracketed = s
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(s);

        if let Some((ip, interface)) = unbracketed.split_once('%') {
            let ip: Ipv6Addr = ip
                .parse()
                .map_err(|_| AddressError::Invalid(s.to_string()))?;
            if interface.is_empty() || !is_link_local(&ip) {
                return Err(AddressError::Invalid(s.to_string()));
            }
            return Ok(Candidate::LinkLocal {
                ip,
                interface: interface.to_string(),
            });
        }

        if let Ok(ip) = unbracketed.parse::<IpAddr>() {
            return match ip {
                IpAddr::V6(v6) if is_link_local(&v6) => Err(AddressError::MissingScope(s.to_string())),
                ip => Ok(Candidate::Ip(ip)),
            };
        }

        if is_domain(s) {
            return Ok(Candidate::Domain(s.to_ascii_lowercase()));
        }

        Err(AddressError::Invalid(s.to_string()))
    }

    /// Candidate describing where a connected socket's peer sits.
    ///
    /// Scoped link-local peers need the interface name, looked up by
    /// `interface_name` from the scope id. `None` when that lookup fails,
    /// since a link-local address without its interface can't be dialed.
    pub fn from_socket_addr(
        addr: SocketAddr,
        interface_name: impl Fn(u32) -> Option<String>,
    ) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => Some(Candidate::Ip(IpAddr::V4(*v4.ip()))),
            SocketAddr::V6(v6) => {
                if let Some(v4) = v6.ip().to_ipv4_mapped() {
                    return Some(Candidate::Ip(IpAddr::V4(v4)));
                }
                if !is_link_local(v6.ip()) {
                    return Some(Candidate::Ip(IpAddr::V6(*v6.ip())));
                }
                match interface_name(v6.scope_id()) {
                    Some(interface) => Some(Candidate::LinkLocal {
                        ip: *v6.ip(),
                        interface,
                    }),
                    None => {
                        debug!(peer = %addr, "no interface for link-local peer");
                        None
                    }
                }
            }
        }
    }

    pub fn is_mac(&self) -> bool {
        matches!(self, Candidate::Mac(_))
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Candidate::Ip(ip) => write!(f, "{ip}"),
            Candidate::LinkLocal { ip, interface } => write!(f, "{ip}%{interface}"),
            Candidate::Mac(mac) => f.write_str(&format_mac(mac)),
            Candidate::Domain(name) => f.write_str(name),
        }
    }
}

impl FromStr for Candidate {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Candidate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Candidate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Drop duplicates, keeping the first occurrence.
pub fn dedup_candidates(candidates: impl IntoIterator<Item = Candidate>) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}

/// Serde helper for address lists: invalid entries are skipped with a log
/// line instead of failing the whole document, and duplicates are dropped.
pub fn deserialize_candidates<'de, D>(deserializer: D) -> Result<Vec<Candidate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    let parsed = raw.iter().filter_map(|s| match Candidate::parse(s) {
        Ok(c) => Some(c),
        Err(e) => {
            debug!(address = %s, "dropping address: {}", e);
            None
        }
    });
    Ok(dedup_candidates(parsed))
}

/// Serde helper for a single optional address: an entry that no longer
/// parses reads back as `None`.
pub fn deserialize_optional_candidate<'de, D>(
    deserializer: D,
) -> Result<Option<Candidate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| match Candidate::parse(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            debug!(address = %s, "dropping address: {}", e);
            None
        }
    }))
}

pub fn is_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

fn is_domain(s: &str) -> bool {
    if s.len() > 253 || !s.contains(|c: char| c.is_ascii_alphabetic()) {
        return false;
    }
    s.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Parse `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`.
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let sep = if s.contains(':') { ':' } else { '-' };
    let mut mac = [0u8; 6];
    let mut parts = s.split(sep);
    for byte in mac.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// The link-local address a host with this MAC assigns itself via
/// modified EUI-64 (RFC 4291 appendix A).
pub fn eui64_link_local(mac: &[u8; 6]) -> Ipv6Addr {
    Ipv6Addr::from([
        0xfe, 0x80, 0, 0, 0, 0, 0, 0,
        mac[0] ^ 0x02, mac[1], mac[2], 0xff, 0xfe, mac[3], mac[4], mac[5],
    ])
}

/// Recover the MAC from an EUI-64 derived IPv6 address, if it is one.
pub fn mac_from_eui64(ip: &Ipv6Addr) -> Option<[u8; 6]> {
    let o = ip.octets();
    if o[11] != 0xff || o[12] != 0xfe {
        return None;
    }
    Some([o[8] ^ 0x02, o[9], o[10], o[13], o[14], o[15]])
}

/// One entry of the kernel neighbor table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub ip: IpAddr,
    pub interface: String,
    pub mac: [u8; 6],
}

impl Neighbor {
    /// Connectable candidate for this neighbor.
    pub fn candidate(&self) -> Candidate {
        match self.ip {
            IpAddr::V6(v6) if is_link_local(&v6) => Candidate::LinkLocal {
                ip: v6,
                interface: self.interface.clone(),
            },
            ip => Candidate::Ip(ip),
        }
    }
}

/// Parse the output of `ip neigh show`.
///
/// Lines look like `fe80::1 dev wlan0 lladdr aa:bb:cc:dd:ee:ff REACHABLE`.
/// Entries without a link-layer address or in FAILED state are skipped.
pub fn parse_neighbor_table(output: &str) -> Vec<Neighbor> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let ip: IpAddr = fields.first()?.parse().ok()?;
            let field_after = |key: &str| {
                fields
                    .iter()
                    .position(|f| *f == key)
                    .and_then(|i| fields.get(i + 1))
                    .copied()
            };
            let interface = field_after("dev")?.to_string();
            let mac = parse_mac(field_after("lladdr")?)?;
            if fields.last() == Some(&"FAILED") {
                return None;
            }
            Some(Neighbor { ip, interface, mac })
        })
        .collect()
}
