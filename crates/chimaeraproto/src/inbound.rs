//! Messages received from devices.
//!
//! Every path a device can send is a variant of [`ConfigReply`] or
//! [`DataMessage`]; anything else is rejected with [`ProtocolError::UnknownPath`].

use crate::time::IMMEDIATE;
use crate::types::{Ipv4Cidr, Lease};
use crate::ProtocolError;
use rosc::{OscMessage, OscPacket, OscTime, OscType};

/// Path of the discovery query, echoed back in `/success` replies.
pub const DISCOVER_PATH: &str = "/chimaera/discover";

/// What a device reports about itself when answering discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub name: String,
    pub uid: String,
    pub ip: Ipv4Cidr,
    pub lease: Lease,
    pub reset: String,
}

/// Replies on the discovery and command streams.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigReply {
    /// `/success i s ...` acknowledging request `id` sent to `path`.
    Success {
        id: i32,
        path: String,
        extra: Vec<OscType>,
    },
    /// `/fail i s s`
    Fail { id: i32, path: String, reason: String },
    /// `/stream/resolve`: the stream is connected and can carry requests.
    StreamResolved,
}

impl ConfigReply {
    pub fn parse(msg: &OscMessage) -> Result<Self, ProtocolError> {
        let mut args = Args::new(msg);
        match msg.addr.as_str() {
            "/success" => {
                let id = args.int()?;
                let path = args.string()?;
                Ok(ConfigReply::Success {
                    id,
                    path,
                    extra: args.rest(),
                })
            }
            "/fail" => Ok(ConfigReply::Fail {
                id: args.int()?,
                path: args.string()?,
                reason: args.string()?,
            }),
            "/stream/resolve" => Ok(ConfigReply::StreamResolved),
            other => Err(ProtocolError::UnknownPath(other.to_string())),
        }
    }

    /// Decode the announcement carried by a `/success` for the discovery query.
    pub fn announcement(&self) -> Result<Option<Announcement>, ProtocolError> {
        let ConfigReply::Success { path, extra, .. } = self else {
            return Ok(None);
        };
        if path != DISCOVER_PATH {
            return Ok(None);
        }

        let strings: Vec<&str> = extra
            .iter()
            .map(|arg| match arg {
                OscType::String(s) => Ok(s.as_str()),
                _ => Err(ProtocolError::ArgumentType {
                    path: "/success".to_string(),
                    expected: 's',
                }),
            })
            .collect::<Result<_, _>>()?;

        let [name, uid, ip, lease, reset] = strings[..] else {
            return Err(ProtocolError::MissingArgument {
                path: "/success".to_string(),
                index: strings.len(),
            });
        };

        Ok(Some(Announcement {
            name: name.to_string(),
            uid: uid.to_string(),
            ip: ip.parse()?,
            lease: Lease::from_wire(lease),
            reset: reset.to_string(),
        }))
    }
}

/// Touch and frame events on a device's data stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DataMessage {
    /// `/on iiiff`: session id, group id, pad id, position, pressure.
    On {
        sid: i32,
        gid: i32,
        pid: i32,
        x: f32,
        z: f32,
    },
    /// `/off i`
    Off { sid: i32 },
    /// `/set iff`
    Set { sid: i32, x: f32, z: f32 },
    /// `/idle`: no touches this frame.
    Idle,
    /// `/tuio2/frm it`
    Frame { fid: i32, time: OscTime },
    /// `/tuio2/tok iiifff`
    Token {
        sid: i32,
        tuid: i32,
        gid: i32,
        x: f32,
        z: f32,
        angle: f32,
    },
    /// `/tuio2/alv i*`
    Alive { sids: Vec<i32> },
    /// `/stream/resolve`
    StreamResolved,
}

impl DataMessage {
    pub fn parse(msg: &OscMessage) -> Result<Self, ProtocolError> {
        let mut args = Args::new(msg);
        let parsed = match msg.addr.as_str() {
            "/on" => DataMessage::On {
                sid: args.int()?,
                gid: args.int()?,
                pid: args.int()?,
                x: args.float()?,
                z: args.float()?,
            },
            "/off" => DataMessage::Off { sid: args.int()? },
            "/set" => DataMessage::Set {
                sid: args.int()?,
                x: args.float()?,
                z: args.float()?,
            },
            "/idle" => DataMessage::Idle,
            "/tuio2/frm" => DataMessage::Frame {
                fid: args.int()?,
                time: args.time()?,
            },
            "/tuio2/tok" => DataMessage::Token {
                sid: args.int()?,
                tuid: args.int()?,
                gid: args.int()?,
                x: args.float()?,
                z: args.float()?,
                angle: args.float()?,
            },
            "/tuio2/alv" => {
                let mut sids = Vec::with_capacity(msg.args.len());
                while args.remaining() > 0 {
                    sids.push(args.int()?);
                }
                DataMessage::Alive { sids }
            }
            "/stream/resolve" => DataMessage::StreamResolved,
            other => return Err(ProtocolError::UnknownPath(other.to_string())),
        };
        Ok(parsed)
    }
}

/// Flatten a packet into its messages, each paired with the time tag of its
/// innermost enclosing bundle. Bare messages get the immediate tag.
pub fn flatten(packet: OscPacket) -> Vec<(OscTime, OscMessage)> {
    let mut out = Vec::new();
    flatten_into(packet, IMMEDIATE, &mut out);
    out
}

fn flatten_into(packet: OscPacket, time: OscTime, out: &mut Vec<(OscTime, OscMessage)>) {
    match packet {
        OscPacket::Message(msg) => out.push((time, msg)),
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                flatten_into(inner, bundle.timetag, out);
            }
        }
    }
}

/// Decode one datagram into time-tagged messages.
pub fn decode_datagram(buf: &[u8]) -> Result<Vec<(OscTime, OscMessage)>, ProtocolError> {
    let (_, packet) = rosc::decoder::decode_udp(buf)?;
    Ok(flatten(packet))
}

/// Positional argument reader with typed accessors.
struct Args<'a> {
    msg: &'a OscMessage,
    index: usize,
}

impl<'a> Args<'a> {
    fn new(msg: &'a OscMessage) -> Self {
        Self { msg, index: 0 }
    }

    fn remaining(&self) -> usize {
        self.msg.args.len().saturating_sub(self.index)
    }

    fn next(&mut self) -> Result<&'a OscType, ProtocolError> {
        let arg = self
            .msg
            .args
            .get(self.index)
            .ok_or_else(|| ProtocolError::MissingArgument {
                path: self.msg.addr.clone(),
                index: self.index,
            })?;
        self.index += 1;
        Ok(arg)
    }

    fn mismatch(&self, expected: char) -> ProtocolError {
        ProtocolError::ArgumentType {
            path: self.msg.addr.clone(),
            expected,
        }
    }

    fn int(&mut self) -> Result<i32, ProtocolError> {
        match self.next()? {
            OscType::Int(v) => Ok(*v),
            _ => Err(self.mismatch('i')),
        }
    }

    fn float(&mut self) -> Result<f32, ProtocolError> {
        match self.next()? {
            OscType::Float(v) => Ok(*v),
            _ => Err(self.mismatch('f')),
        }
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        match self.next()? {
            OscType::String(v) => Ok(v.clone()),
            _ => Err(self.mismatch('s')),
        }
    }

    fn time(&mut self) -> Result<OscTime, ProtocolError> {
        match self.next()? {
            OscType::Time(v) => Ok(*v),
            _ => Err(self.mismatch('t')),
        }
    }

    fn rest(&mut self) -> Vec<OscType> {
        let rest = self.msg.args[self.index.min(self.msg.args.len())..].to_vec();
        self.index = self.msg.args.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rosc::OscBundle;

    fn msg(addr: &str, args: Vec<OscType>) -> OscMessage {
        OscMessage {
            addr: addr.to_string(),
            args,
        }
    }

    fn s(v: &str) -> OscType {
        OscType::String(v.to_string())
    }

    #[test]
    fn test_parse_discovery_success() {
        let reply = ConfigReply::parse(&msg(
            "/success",
            vec![
                OscType::Int(0),
                s(DISCOVER_PATH),
                s("chimaera"),
                s("CHIMAERA-S0128-0042"),
                s("192.168.1.177/24"),
                s("dhcp"),
                s("soft"),
            ],
        ))
        .unwrap();

        let announcement = reply.announcement().unwrap().unwrap();
        assert_eq!(announcement.uid, "CHIMAERA-S0128-0042");
        assert_eq!(announcement.lease, Lease::Dhcp);
        assert_eq!(announcement.ip.prefix, 24);
        assert_eq!(announcement.reset, "soft");
    }

    #[test]
    fn test_success_for_other_path_has_no_announcement() {
        let reply = ConfigReply::parse(&msg(
            "/success",
            vec![OscType::Int(7), s("/engines/address")],
        ))
        .unwrap();
        assert_eq!(reply.announcement().unwrap(), None);
        assert!(matches!(reply, ConfigReply::Success { id: 7, .. }));
    }

    #[test]
    fn test_short_announcement_is_an_error() {
        let reply = ConfigReply::parse(&msg(
            "/success",
            vec![OscType::Int(0), s(DISCOVER_PATH), s("chimaera")],
        ))
        .unwrap();
        assert!(matches!(
            reply.announcement(),
            Err(ProtocolError::MissingArgument { index: 1, .. })
        ));
    }

    #[test]
    fn test_parse_fail() {
        let reply = ConfigReply::parse(&msg(
            "/fail",
            vec![OscType::Int(3), s("/comm/ip"), s("invalid address")],
        ))
        .unwrap();
        assert_eq!(
            reply,
            ConfigReply::Fail {
                id: 3,
                path: "/comm/ip".to_string(),
                reason: "invalid address".to_string(),
            }
        );
    }

    #[test]
    fn test_fail_with_wrong_types_is_rejected() {
        let err = ConfigReply::parse(&msg("/fail", vec![s("3"), s("/x"), s("y")])).unwrap_err();
        assert!(matches!(err, ProtocolError::ArgumentType { expected: 'i', .. }));
    }

    #[test]
    fn test_every_data_path_parses() {
        let time = OscTime {
            seconds: 5,
            fractional: 6,
        };
        let cases = vec![
            (
                msg(
                    "/on",
                    vec![
                        OscType::Int(1),
                        OscType::Int(2),
                        OscType::Int(3),
                        OscType::Float(0.5),
                        OscType::Float(0.25),
                    ],
                ),
                DataMessage::On {
                    sid: 1,
                    gid: 2,
                    pid: 3,
                    x: 0.5,
                    z: 0.25,
                },
            ),
            (msg("/off", vec![OscType::Int(1)]), DataMessage::Off { sid: 1 }),
            (
                msg(
                    "/set",
                    vec![OscType::Int(1), OscType::Float(0.1), OscType::Float(0.2)],
                ),
                DataMessage::Set {
                    sid: 1,
                    x: 0.1,
                    z: 0.2,
                },
            ),
            (msg("/idle", vec![]), DataMessage::Idle),
            (
                msg("/tuio2/frm", vec![OscType::Int(9), OscType::Time(time)]),
                DataMessage::Frame { fid: 9, time },
            ),
            (
                msg(
                    "/tuio2/tok",
                    vec![
                        OscType::Int(1),
                        OscType::Int(0),
                        OscType::Int(2),
                        OscType::Float(0.3),
                        OscType::Float(0.4),
                        OscType::Float(0.0),
                    ],
                ),
                DataMessage::Token {
                    sid: 1,
                    tuid: 0,
                    gid: 2,
                    x: 0.3,
                    z: 0.4,
                    angle: 0.0,
                },
            ),
            (
                msg("/tuio2/alv", vec![OscType::Int(4), OscType::Int(5)]),
                DataMessage::Alive { sids: vec![4, 5] },
            ),
            (msg("/tuio2/alv", vec![]), DataMessage::Alive { sids: vec![] }),
            (msg("/stream/resolve", vec![]), DataMessage::StreamResolved),
        ];

        for (input, expected) in cases {
            assert_eq!(DataMessage::parse(&input).unwrap(), expected, "{}", input.addr);
        }
    }

    #[test]
    fn test_unknown_data_path() {
        let err = DataMessage::parse(&msg("/dump", vec![])).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownPath(p) if p == "/dump"));
    }

    #[test]
    fn test_flatten_propagates_bundle_time() {
        let outer = OscTime {
            seconds: 100,
            fractional: 0,
        };
        let inner = OscTime {
            seconds: 200,
            fractional: 0,
        };
        let packet = OscPacket::Bundle(OscBundle {
            timetag: outer,
            content: vec![
                OscPacket::Message(msg("/idle", vec![])),
                OscPacket::Bundle(OscBundle {
                    timetag: inner,
                    content: vec![OscPacket::Message(msg("/off", vec![OscType::Int(1)]))],
                }),
            ],
        });

        let flat = flatten(packet);
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].0, outer);
        assert_eq!(flat[1].0, inner);
        assert_eq!(flat[1].1.addr, "/off");
    }

    #[test]
    fn test_bare_message_is_immediate() {
        let flat = flatten(OscPacket::Message(msg("/idle", vec![])));
        assert_eq!(flat[0].0, IMMEDIATE);
    }
}
