//! Local IPv4 interfaces, used to decide whether a device's address is
//! reachable and which local address to give it for its data stream.

use std::net::{IpAddr, Ipv4Addr};

use chimaeraproto::Ipv4Cidr;
use serde::Serialize;
use sysinfo::Networks;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interface {
    pub name: String,
    pub cidr: Ipv4Cidr,
}

impl Interface {
    pub fn new(name: impl Into<String>, cidr: Ipv4Cidr) -> Self {
        Self {
            name: name.into(),
            cidr,
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.cidr.addr
    }

    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.cidr.mask())
    }

    /// Whether `device` sits on the same subnet as this interface.
    pub fn reaches(&self, device: &Ipv4Cidr) -> bool {
        device.network() == self.cidr.network()
    }
}

/// Non-loopback IPv4 interfaces of this host.
pub fn snapshot() -> Vec<Interface> {
    let networks = Networks::new_with_refreshed_list();
    let mut ifaces: Vec<Interface> = networks
        .iter()
        .flat_map(|(name, data)| {
            data.ip_networks().iter().filter_map(move |net| match net.addr {
                IpAddr::V4(addr) if !addr.is_loopback() => Ipv4Cidr::new(addr, net.prefix)
                    .ok()
                    .map(|cidr| Interface::new(name.as_str(), cidr)),
                _ => None,
            })
        })
        .collect();
    ifaces.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(count = ifaces.len(), "interfaces captured");
    ifaces
}

/// First interface on the device's subnet.
pub fn route<'a>(ifaces: &'a [Interface], device: &Ipv4Cidr) -> Option<&'a Interface> {
    ifaces.iter().find(|iface| iface.reaches(device))
}
