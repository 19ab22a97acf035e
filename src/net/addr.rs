//! NIC address literal: `scheme://ip:port[/subnet]`.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

/// Transport scheme of a NIC address.
///
/// Only `Tcp` is meaningful for the RDMA data path; `Udp` and `Ipc` are
/// accepted because the rendezvous literal must still parse them, even
/// though this crate's socket fabric only ever binds `Tcp` listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NicScheme {
    Tcp,
    Udp,
    Ipc,
}

impl fmt::Display for NicScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NicScheme::Tcp => "tcp",
            NicScheme::Udp => "udp",
            NicScheme::Ipc => "ipc",
        })
    }
}

/// A parsed `scheme://ip:port` NIC address, with an optional `/N` subnet
/// prefix kept only so the rendezvous client can round-trip it; the subnet
/// has no bearing on RDMA transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NicAddr {
    pub scheme: NicScheme,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub subnet: Option<u8>,
}

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(tcp|udp|ipc)://(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})(?:/(\d{1,2}))?:(\d{1,5})$")
            .expect("static NIC address regex is valid")
    })
}

impl FromStr for NicAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let caps = pattern()
            .captures(s)
            .ok_or_else(|| Error::InvalidParam(format!("malformed NIC address: {s:?}")))?;

        let scheme = match &caps[1] {
            "tcp" => NicScheme::Tcp,
            "udp" => NicScheme::Udp,
            "ipc" => NicScheme::Ipc,
            _ => unreachable!("regex only matches tcp|udp|ipc"),
        };
        let ip: Ipv4Addr = caps[2]
            .parse()
            .map_err(|_| Error::InvalidParam(format!("malformed IPv4 address in {s:?}")))?;
        let subnet = caps
            .get(3)
            .map(|m| m.as_str().parse::<u8>())
            .transpose()
            .map_err(|_| Error::InvalidParam(format!("malformed subnet prefix in {s:?}")))?;
        let port: u16 = caps[4]
            .parse()
            .map_err(|_| Error::InvalidParam(format!("port out of range in {s:?}")))?;

        Ok(Self {
            scheme,
            ip,
            port,
            subnet,
        })
    }
}

impl fmt::Display for NicAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subnet {
            Some(subnet) => write!(f, "{}://{}/{}:{}", self.scheme, self.ip, subnet, self.port),
            None => write!(f, "{}://{}:{}", self.scheme, self.ip, self.port),
        }
    }
}

impl NicAddr {
    /// The socket address this NIC address resolves to on the data path.
    pub fn socket_addr(&self) -> std::net::SocketAddrV4 {
        std::net::SocketAddrV4::new(self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_tcp() {
        let a: NicAddr = "tcp://127.0.0.1:10050".parse().unwrap();
        assert_eq!(a.scheme, NicScheme::Tcp);
        assert_eq!(a.ip, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(a.port, 10050);
        assert_eq!(a.subnet, None);
    }

    #[test]
    fn parses_with_subnet() {
        let a: NicAddr = "tcp://10.0.0.1/24:13337".parse().unwrap();
        assert_eq!(a.subnet, Some(24));
        assert_eq!(a.port, 13337);
    }

    #[test]
    fn zero_port_parses_but_is_a_higher_layer_concern() {
        // parsing succeeds; `open_device` is the one that must reject port 0.
        let a: NicAddr = "tcp://0.0.0.0:0".parse().unwrap();
        assert_eq!(a.port, 0);
    }

    #[test]
    fn rejects_missing_port() {
        assert!("tcp://127.0.0.1".parse::<NicAddr>().is_err());
    }

    #[test]
    fn rejects_out_of_range_octet() {
        // malformed NIC address (octet > 255) is an invalid-parameter error.
        assert!("udp://256.0.0.0:1".parse::<NicAddr>().is_err());
    }

    #[test]
    fn rejects_missing_port_entirely() {
        assert!("udp://256.0.0.0".parse::<NicAddr>().is_err());
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!("http://127.0.0.1:80".parse::<NicAddr>().is_err());
    }

    #[test]
    fn display_round_trips() {
        let a: NicAddr = "tcp://127.0.0.1/16:9000".parse().unwrap();
        let s = a.to_string();
        let b: NicAddr = s.parse().unwrap();
        assert_eq!(a, b);
    }
}
