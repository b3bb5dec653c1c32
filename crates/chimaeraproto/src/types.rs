//! Value types shared by the wire format and the daemon.

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// How a device obtained its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lease {
    Dhcp,
    Ipv4ll,
    Static,
}

impl Lease {
    /// Devices report "dhcp" or "ipv4ll"; anything else is a static address.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "dhcp" => Lease::Dhcp,
            "ipv4ll" => Lease::Ipv4ll,
            _ => Lease::Static,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lease::Dhcp => "dhcp",
            Lease::Ipv4ll => "ipv4ll",
            Lease::Static => "static",
        }
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport of the device's data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }

    /// Value of `/engines/mode` selecting this transport on the device.
    pub fn engine_mode(&self) -> &'static str {
        match self {
            Transport::Udp => "osc.udp",
            Transport::Tcp => "osc.tcp",
        }
    }
}

impl FromStr for Transport {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            other => Err(ProtocolError::InvalidValue {
                field: "mode",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An IPv4 address with its prefix length, as devices report it ("a.b.c.d/nn").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, ProtocolError> {
        if prefix > 32 {
            return Err(ProtocolError::InvalidValue {
                field: "prefix",
                value: prefix.to_string(),
            });
        }
        Ok(Self { addr, prefix })
    }

    /// Netmask as a host-order integer.
    pub fn mask(&self) -> u32 {
        match self.prefix {
            0 => 0,
            p => u32::MAX << (32 - u32::from(p)),
        }
    }

    pub fn network(&self) -> u32 {
        u32::from(self.addr) & self.mask()
    }

    /// True when `other`'s address falls in this network under this mask.
    pub fn shares_subnet(&self, addr: Ipv4Addr, mask: u32) -> bool {
        (u32::from(self.addr) & self.mask()) == (u32::from(addr) & mask)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidValue {
            field: "ip",
            value: s.to_string(),
        };
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Ipv4Cidr::new(addr, prefix).map_err(|_| invalid())
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_from_wire() {
        assert_eq!(Lease::from_wire("dhcp"), Lease::Dhcp);
        assert_eq!(Lease::from_wire("ipv4ll"), Lease::Ipv4ll);
        assert_eq!(Lease::from_wire("static"), Lease::Static);
        assert_eq!(Lease::from_wire("manual"), Lease::Static);
    }

    #[test]
    fn test_cidr_parse_and_mask() {
        let cidr: Ipv4Cidr = "192.168.1.177/24".parse().unwrap();
        assert_eq!(cidr.addr, Ipv4Addr::new(192, 168, 1, 177));
        assert_eq!(cidr.mask(), 0xffff_ff00);
        assert_eq!(cidr.network(), 0xc0a8_0100);
        assert_eq!(cidr.to_string(), "192.168.1.177/24");
    }

    #[test]
    fn test_cidr_edge_prefixes() {
        let any: Ipv4Cidr = "10.0.0.1/0".parse().unwrap();
        assert_eq!(any.mask(), 0);
        let host: Ipv4Cidr = "10.0.0.1/32".parse().unwrap();
        assert_eq!(host.mask(), u32::MAX);
    }

    #[test]
    fn test_cidr_rejects_garbage() {
        assert!("192.168.1.1".parse::<Ipv4Cidr>().is_err());
        assert!("192.168.1.1/33".parse::<Ipv4Cidr>().is_err());
        assert!("300.1.1.1/24".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_shares_subnet() {
        let device: Ipv4Cidr = "192.168.1.177/24".parse().unwrap();
        assert!(device.shares_subnet(Ipv4Addr::new(192, 168, 1, 10), 0xffff_ff00));
        assert!(!device.shares_subnet(Ipv4Addr::new(192, 168, 2, 10), 0xffff_ff00));
    }

    #[test]
    fn test_transport_engine_mode() {
        assert_eq!(Transport::Udp.engine_mode(), "osc.udp");
        assert_eq!("TCP".parse::<Transport>().unwrap(), Transport::Tcp);
        assert!("serial".parse::<Transport>().is_err());
    }
}
