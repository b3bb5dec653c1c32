//! Time-stamped output events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of real-time output target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Midi,
    Osc,
    Cv,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Midi => "midi",
            SinkKind::Osc => "osc",
            SinkKind::Cv => "cv",
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            SinkKind::Midi => 1,
            SinkKind::Osc => 2,
            SinkKind::Cv => 3,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(SinkKind::Midi),
            2 => Some(SinkKind::Osc),
            3 => Some(SinkKind::Cv),
            _ => None,
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "midi" => Ok(SinkKind::Midi),
            "osc" => Ok(SinkKind::Osc),
            "cv" => Ok(SinkKind::Cv),
            other => Err(format!("unknown sink kind '{}'", other)),
        }
    }
}

/// Event body, borrowed from the producer or from a channel's scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventPayload<'a> {
    /// Raw MIDI bytes of one message.
    Midi(&'a [u8]),
    /// One encoded OSC packet.
    Osc(&'a [u8]),
    /// One sample value held until the next CV event.
    Cv(f32),
}

impl EventPayload<'_> {
    pub fn kind(&self) -> SinkKind {
        match self {
            EventPayload::Midi(_) => SinkKind::Midi,
            EventPayload::Osc(_) => SinkKind::Osc,
            EventPayload::Cv(_) => SinkKind::Cv,
        }
    }
}

/// An event addressed to an absolute audio frame. Frame 0 means "as soon as
/// possible".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledEvent<'a> {
    pub frame: u64,
    pub payload: EventPayload<'a>,
}

impl<'a> ScheduledEvent<'a> {
    pub fn midi(frame: u64, bytes: &'a [u8]) -> Self {
        Self {
            frame,
            payload: EventPayload::Midi(bytes),
        }
    }

    pub fn osc(frame: u64, packet: &'a [u8]) -> Self {
        Self {
            frame,
            payload: EventPayload::Osc(packet),
        }
    }

    pub fn cv(frame: u64, value: f32) -> Self {
        Self {
            frame,
            payload: EventPayload::Cv(value),
        }
    }

    pub fn kind(&self) -> SinkKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_round_trip() {
        for kind in [SinkKind::Midi, SinkKind::Osc, SinkKind::Cv] {
            assert_eq!(SinkKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(SinkKind::from_tag(0), None);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("MIDI".parse::<SinkKind>(), Ok(SinkKind::Midi));
        assert!("audio".parse::<SinkKind>().is_err());
    }

    #[test]
    fn test_payload_kind() {
        assert_eq!(ScheduledEvent::cv(10, 0.5).kind(), SinkKind::Cv);
        assert_eq!(ScheduledEvent::midi(0, &[0x90, 60, 100]).kind(), SinkKind::Midi);
    }
}
