//! chimaeraproto - wire protocol spoken by Chimaera sensor devices
//!
//! Devices are driven with path-addressed OSC messages:
//!
//! - **Discovery**: `/chimaera/discover` broadcast to the device config port;
//!   devices answer `/success` with name, uid, address, lease and reset reason.
//! - **Configuration**: request/acknowledge commands (`/engines/*`,
//!   `/info/name`, `/dhcp/enabled`, `/comm/ip`, ...) grouped into immediate
//!   bundles the device applies atomically.
//! - **Data**: touch events (`/on`, `/off`, `/set`, `/idle`) and TUIO2 frames
//!   over UDP datagrams or length-prefixed TCP.
//!
//! Inbound paths form closed enums ([`ConfigReply`], [`DataMessage`]) so that
//! dispatch is an exhaustive `match`, never a string lookup at the call site.

pub mod framing;
pub mod inbound;
pub mod outbound;
pub mod time;
pub mod types;

pub use inbound::{decode_datagram, flatten, Announcement, ConfigReply, DataMessage, DISCOVER_PATH};
pub use outbound::{
    com_bundle, engine_bundle, release_bundle, ComSettings, Command, CommandBundle, RequestIds,
};
pub use types::{Ipv4Cidr, Lease, Transport};

pub use rosc::{OscMessage, OscPacket, OscTime, OscType};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("OSC codec error: {0:?}")]
    Codec(rosc::OscError),

    #[error("unknown path {0}")]
    UnknownPath(String),

    #[error("{path}: missing argument {index}")]
    MissingArgument { path: String, index: usize },

    #[error("{path}: expected argument of type '{expected}'")]
    ArgumentType { path: String, expected: char },

    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

impl From<rosc::OscError> for ProtocolError {
    fn from(err: rosc::OscError) -> Self {
        ProtocolError::Codec(err)
    }
}
