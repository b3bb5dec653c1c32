//! Commands sent to devices.
//!
//! Every command carries a request id as its first argument; the device echoes
//! it with the command path in `/success` or `/fail`. Bundles are always sent
//! with the immediate time tag so the device applies them as one step.

use crate::inbound::DISCOVER_PATH;
use crate::time::IMMEDIATE;
use crate::types::{Ipv4Cidr, Lease, Transport};
use crate::ProtocolError;
use rosc::{OscBundle, OscMessage, OscPacket, OscType};

/// Sensor rate at and above which the device runs its engines in parallel.
pub const PARALLEL_RATE_THRESHOLD: u32 = 2000;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Discover,
    /// Where the device should send its data stream ("a.b.c.d:port").
    EnginesAddress(String),
    SensorsRate(u32),
    EnginesParallel(bool),
    EnginesEnabled(bool),
    EnginesReset,
    Tuio2Enabled(bool),
    DummyEnabled(bool),
    DummyRedundancy(bool),
    EnginesMode(Transport),
    EnginesServer(bool),
    InfoName(String),
    DhcpEnabled(bool),
    Ipv4llEnabled(bool),
    CommIp(Ipv4Cidr),
    ConfigSave,
    ResetSoft,
}

impl Command {
    pub fn path(&self) -> &'static str {
        match self {
            Command::Discover => DISCOVER_PATH,
            Command::EnginesAddress(_) => "/engines/address",
            Command::SensorsRate(_) => "/sensors/rate",
            Command::EnginesParallel(_) => "/engines/parallel",
            Command::EnginesEnabled(_) => "/engines/enabled",
            Command::EnginesReset => "/engines/reset",
            Command::Tuio2Enabled(_) => "/engines/tuio2/enabled",
            Command::DummyEnabled(_) => "/engines/dummy/enabled",
            Command::DummyRedundancy(_) => "/engines/dummy/redundancy",
            Command::EnginesMode(_) => "/engines/mode",
            Command::EnginesServer(_) => "/engines/server",
            Command::InfoName(_) => "/info/name",
            Command::DhcpEnabled(_) => "/dhcp/enabled",
            Command::Ipv4llEnabled(_) => "/ipv4ll/enabled",
            Command::CommIp(_) => "/comm/ip",
            Command::ConfigSave => "/config/save",
            Command::ResetSoft => "/reset/soft",
        }
    }

    pub fn to_message(&self, id: i32) -> OscMessage {
        let flag = |b: bool| OscType::Int(i32::from(b));
        let mut args = vec![OscType::Int(id)];
        match self {
            Command::Discover | Command::EnginesReset | Command::ConfigSave | Command::ResetSoft => {}
            Command::EnginesAddress(addr) => args.push(OscType::String(addr.clone())),
            Command::SensorsRate(rate) => args.push(OscType::Int(*rate as i32)),
            Command::EnginesParallel(b)
            | Command::EnginesEnabled(b)
            | Command::Tuio2Enabled(b)
            | Command::DummyEnabled(b)
            | Command::DummyRedundancy(b)
            | Command::EnginesServer(b)
            | Command::DhcpEnabled(b)
            | Command::Ipv4llEnabled(b) => args.push(flag(*b)),
            Command::EnginesMode(transport) => {
                args.push(OscType::String(transport.engine_mode().to_string()))
            }
            Command::InfoName(name) => args.push(OscType::String(name.clone())),
            Command::CommIp(cidr) => args.push(OscType::String(cidr.to_string())),
        }
        OscMessage {
            addr: self.path().to_string(),
            args,
        }
    }

    /// Encode as a single message.
    pub fn encode(&self, id: i32) -> Result<Vec<u8>, ProtocolError> {
        Ok(rosc::encoder::encode(&OscPacket::Message(self.to_message(id)))?)
    }
}

/// Hands out request ids for one command stream.
#[derive(Debug, Default)]
pub struct RequestIds {
    next: i32,
}

impl RequestIds {
    pub fn new(start: i32) -> Self {
        Self { next: start }
    }

    pub fn next_id(&mut self) -> i32 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

/// Commands applied by the device as one atomic step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandBundle {
    pub commands: Vec<Command>,
}

impl CommandBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn paths(&self) -> Vec<&'static str> {
        self.commands.iter().map(Command::path).collect()
    }

    /// Build the immediate bundle, drawing one request id per command.
    pub fn to_packet(&self, ids: &mut RequestIds) -> OscPacket {
        OscPacket::Bundle(OscBundle {
            timetag: IMMEDIATE,
            content: self
                .commands
                .iter()
                .map(|cmd| OscPacket::Message(cmd.to_message(ids.next_id())))
                .collect(),
        })
    }

    pub fn encode(&self, ids: &mut RequestIds) -> Result<Vec<u8>, ProtocolError> {
        Ok(rosc::encoder::encode(&self.to_packet(ids))?)
    }
}

/// Engine setup sent once the device acknowledges the data address.
pub fn engine_bundle(transport: Transport, rate: u32) -> CommandBundle {
    let mut bundle = CommandBundle::new();
    bundle
        .push(Command::SensorsRate(rate))
        .push(Command::EnginesParallel(rate >= PARALLEL_RATE_THRESHOLD))
        .push(Command::EnginesEnabled(false))
        .push(Command::EnginesReset);

    match transport {
        Transport::Udp => {
            bundle
                .push(Command::Tuio2Enabled(true))
                .push(Command::EnginesMode(Transport::Udp));
        }
        Transport::Tcp => {
            bundle
                .push(Command::DummyEnabled(true))
                .push(Command::DummyRedundancy(false))
                .push(Command::EnginesMode(Transport::Tcp));
        }
    }

    bundle
        .push(Command::EnginesServer(false))
        .push(Command::EnginesEnabled(true));
    bundle
}

/// Best-effort shutdown sent on release.
pub fn release_bundle() -> CommandBundle {
    let mut bundle = CommandBundle::new();
    bundle
        .push(Command::EnginesEnabled(false))
        .push(Command::EnginesReset);
    bundle
}

/// Identity and addressing of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct ComSettings {
    pub name: String,
    pub lease: Lease,
    /// Address assigned when `lease` is static.
    pub ip: Ipv4Cidr,
}

/// Commands that move a device from `current` to `desired` com settings,
/// followed by save and soft reset. `None` when nothing differs.
pub fn com_bundle(current: &ComSettings, desired: &ComSettings) -> Option<CommandBundle> {
    let mut bundle = CommandBundle::new();

    if current.name != desired.name {
        bundle.push(Command::InfoName(desired.name.clone()));
    }

    let static_changed = desired.lease == Lease::Static && current.ip != desired.ip;
    if current.lease != desired.lease || static_changed {
        if current.lease != desired.lease {
            match current.lease {
                Lease::Dhcp => {
                    bundle.push(Command::DhcpEnabled(false));
                }
                Lease::Ipv4ll => {
                    bundle.push(Command::Ipv4llEnabled(false));
                }
                Lease::Static => {}
            }
        }
        match desired.lease {
            Lease::Dhcp => bundle.push(Command::DhcpEnabled(true)),
            Lease::Ipv4ll => bundle.push(Command::Ipv4llEnabled(true)),
            Lease::Static => bundle.push(Command::CommIp(desired.ip)),
        };
    }

    if bundle.is_empty() {
        return None;
    }

    bundle.push(Command::ConfigSave).push(Command::ResetSoft);
    Some(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::flatten;
    use pretty_assertions::assert_eq;

    fn settings(name: &str, lease: Lease) -> ComSettings {
        ComSettings {
            name: name.to_string(),
            lease,
            ip: "192.168.1.177/24".parse().unwrap(),
        }
    }

    #[test]
    fn test_every_command_has_distinct_path() {
        let all = vec![
            Command::Discover,
            Command::EnginesAddress(String::new()),
            Command::SensorsRate(0),
            Command::EnginesParallel(false),
            Command::EnginesEnabled(false),
            Command::EnginesReset,
            Command::Tuio2Enabled(false),
            Command::DummyEnabled(false),
            Command::DummyRedundancy(false),
            Command::EnginesMode(Transport::Udp),
            Command::EnginesServer(false),
            Command::InfoName(String::new()),
            Command::DhcpEnabled(false),
            Command::Ipv4llEnabled(false),
            Command::CommIp("0.0.0.0/0".parse().unwrap()),
            Command::ConfigSave,
            Command::ResetSoft,
        ];
        let mut paths: Vec<_> = all.iter().map(Command::path).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), all.len());
    }

    #[test]
    fn test_discover_query_bytes() {
        let bytes = Command::Discover.encode(0).unwrap();
        assert_eq!(bytes, b"/chimaera/discover\0\0,i\0\0\0\0\0\0".to_vec());
    }

    #[test]
    fn test_message_arguments() {
        let msg = Command::EnginesMode(Transport::Tcp).to_message(15);
        assert_eq!(
            msg.args,
            vec![OscType::Int(15), OscType::String("osc.tcp".to_string())]
        );
        let msg = Command::EnginesReset.to_message(13);
        assert_eq!(msg.args, vec![OscType::Int(13)]);
    }

    #[test]
    fn test_engine_bundle_udp() {
        let bundle = engine_bundle(Transport::Udp, 2000);
        assert_eq!(
            bundle.paths(),
            vec![
                "/sensors/rate",
                "/engines/parallel",
                "/engines/enabled",
                "/engines/reset",
                "/engines/tuio2/enabled",
                "/engines/mode",
                "/engines/server",
                "/engines/enabled",
            ]
        );
        assert_eq!(bundle.commands[1], Command::EnginesParallel(true));
        assert_eq!(bundle.commands[2], Command::EnginesEnabled(false));
        assert_eq!(bundle.commands[7], Command::EnginesEnabled(true));
    }

    #[test]
    fn test_engine_bundle_tcp_low_rate() {
        let bundle = engine_bundle(Transport::Tcp, 1000);
        assert!(bundle.paths().contains(&"/engines/dummy/enabled"));
        assert!(bundle.paths().contains(&"/engines/dummy/redundancy"));
        assert!(!bundle.paths().contains(&"/engines/tuio2/enabled"));
        assert_eq!(bundle.commands[1], Command::EnginesParallel(false));
    }

    #[test]
    fn test_bundle_is_immediate_with_sequential_ids() {
        let mut ids = RequestIds::new(10);
        let bytes = release_bundle().encode(&mut ids).unwrap();
        let (_, packet) = rosc::decoder::decode_udp(&bytes).unwrap();

        let OscPacket::Bundle(bundle) = &packet else {
            panic!("expected bundle");
        };
        assert_eq!(bundle.timetag, IMMEDIATE);

        let flat = flatten(packet);
        let ids: Vec<_> = flat
            .iter()
            .map(|(_, m)| m.args[0].clone())
            .collect();
        assert_eq!(ids, vec![OscType::Int(10), OscType::Int(11)]);
    }

    #[test]
    fn test_com_bundle_dhcp_to_static() {
        let current = settings("chimaera", Lease::Dhcp);
        let desired = settings("chimaera", Lease::Static);

        let bundle = com_bundle(&current, &desired).unwrap();
        assert_eq!(
            bundle.commands,
            vec![
                Command::DhcpEnabled(false),
                Command::CommIp(desired.ip),
                Command::ConfigSave,
                Command::ResetSoft,
            ]
        );
    }

    #[test]
    fn test_com_bundle_rename_only() {
        let current = settings("chimaera", Lease::Ipv4ll);
        let desired = settings("stage-left", Lease::Ipv4ll);

        let bundle = com_bundle(&current, &desired).unwrap();
        assert_eq!(
            bundle.paths(),
            vec!["/info/name", "/config/save", "/reset/soft"]
        );
    }

    #[test]
    fn test_com_bundle_ipv4ll_to_dhcp() {
        let bundle = com_bundle(
            &settings("c", Lease::Ipv4ll),
            &settings("c", Lease::Dhcp),
        )
        .unwrap();
        assert_eq!(
            bundle.commands[..2],
            [Command::Ipv4llEnabled(false), Command::DhcpEnabled(true)]
        );
    }

    #[test]
    fn test_com_bundle_static_address_change() {
        let current = settings("c", Lease::Static);
        let mut desired = current.clone();
        desired.ip = "10.0.0.5/8".parse().unwrap();

        let bundle = com_bundle(&current, &desired).unwrap();
        assert_eq!(bundle.paths(), vec!["/comm/ip", "/config/save", "/reset/soft"]);
    }

    #[test]
    fn test_com_bundle_unchanged() {
        let current = settings("c", Lease::Dhcp);
        assert_eq!(com_bundle(&current, &current.clone()), None);
    }
}
