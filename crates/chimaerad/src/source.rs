//! Discovered devices.

use chimaeraproto::{Announcement, ComSettings, Ipv4Cidr, Lease, Transport};
use serde::Serialize;

use crate::iface::{self, Interface};
use crate::worker::WorkerHandle;

/// One device as known to the session machine. Only the main loop mutates it.
#[derive(Debug)]
pub struct Source {
    pub uid: String,
    pub name: String,
    pub ip: Ipv4Cidr,
    pub lease: Lease,
    /// Reason the device gave for its last reset.
    pub reset: String,
    pub mode: Transport,
    pub rate: u32,
    /// Local interface sharing the device's subnet.
    pub iface: Option<Interface>,
    worker: Option<WorkerHandle>,
}

impl Source {
    pub fn discovered(
        announcement: Announcement,
        mode: Transport,
        rate: u32,
        ifaces: &[Interface],
    ) -> Self {
        let mut source = Self {
            uid: announcement.uid.clone(),
            name: String::new(),
            ip: announcement.ip,
            lease: announcement.lease,
            reset: String::new(),
            mode,
            rate,
            iface: None,
            worker: None,
        };
        source.refresh(announcement, ifaces);
        source
    }

    /// Take the device's latest self-report and recompute reachability.
    pub fn refresh(&mut self, announcement: Announcement, ifaces: &[Interface]) {
        self.name = announcement.name;
        self.ip = announcement.ip;
        self.lease = announcement.lease;
        self.reset = announcement.reset;
        self.iface = iface::route(ifaces, &self.ip).cloned();
    }

    pub fn reachable(&self) -> bool {
        self.iface.is_some()
    }

    pub fn is_claimed(&self) -> bool {
        self.worker.is_some()
    }

    pub fn com_settings(&self) -> ComSettings {
        ComSettings {
            name: self.name.clone(),
            lease: self.lease,
            ip: self.ip,
        }
    }

    pub(crate) fn attach(&mut self, worker: WorkerHandle) {
        self.worker = Some(worker);
    }

    pub(crate) fn detach(&mut self) -> Option<WorkerHandle> {
        self.worker.take()
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            uid: self.uid.clone(),
            name: self.name.clone(),
            lease: self.lease.as_str(),
            ip: self.ip.to_string(),
            reachable: self.reachable(),
            claimed: self.is_claimed(),
            mode: self.mode.as_str(),
            rate: self.rate,
            sync: "none",
        }
    }
}

/// Source description handed to API consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub uid: String,
    pub name: String,
    pub lease: &'static str,
    pub ip: String,
    pub reachable: bool,
    pub claimed: bool,
    pub mode: &'static str,
    pub rate: u32,
    pub sync: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(ip: &str) -> Announcement {
        Announcement {
            name: "chimaera".to_string(),
            uid: "00:11:22:33:44:55".to_string(),
            ip: ip.parse().unwrap(),
            lease: Lease::Dhcp,
            reset: "hard".to_string(),
        }
    }

    fn ifaces() -> Vec<Interface> {
        vec![Interface::new("eth0", "192.168.1.10/24".parse().unwrap())]
    }

    #[test]
    fn test_reachability_follows_announcements() {
        let mut source = Source::discovered(
            announcement("10.0.0.7/8"),
            Transport::Udp,
            2000,
            &ifaces(),
        );
        assert!(!source.reachable());

        source.refresh(announcement("192.168.1.177/24"), &ifaces());
        assert!(source.reachable());
        assert_eq!(source.iface.as_ref().map(|i| i.name.as_str()), Some("eth0"));
    }

    #[test]
    fn test_info_json_fields() {
        let source = Source::discovered(
            announcement("192.168.1.177/24"),
            Transport::Tcp,
            3000,
            &ifaces(),
        );
        let json = serde_json::to_value(source.info()).unwrap();
        assert_eq!(json["lease"], "dhcp");
        assert_eq!(json["ip"], "192.168.1.177/24");
        assert_eq!(json["mode"], "tcp");
        assert_eq!(json["rate"], 3000);
        assert_eq!(json["claimed"], false);
        assert_eq!(json["sync"], "none");
    }
}
