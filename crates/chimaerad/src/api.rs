//! Collaborator API.
//!
//! Requests travel to the main loop over an mpsc channel and are answered on
//! a oneshot. Mutations answer with a plain success flag; failures are logged
//! by the main loop, not returned.

use chimaeraproto::{Ipv4Cidr, Lease, OscTime, Transport};
use tokio::sync::{mpsc, oneshot};

use crate::event::{ScheduledEvent, SinkKind};
use crate::midi_out::MidiPortInfo;
use crate::registry::SinkInfo;
use crate::source::SourceInfo;

/// Event body owned by a request.
#[derive(Debug, Clone, PartialEq)]
pub enum OwnedPayload {
    Midi(Vec<u8>),
    Osc(Vec<u8>),
    Cv(f32),
}

impl OwnedPayload {
    pub fn kind(&self) -> SinkKind {
        match self {
            OwnedPayload::Midi(_) => SinkKind::Midi,
            OwnedPayload::Osc(_) => SinkKind::Osc,
            OwnedPayload::Cv(_) => SinkKind::Cv,
        }
    }

    pub fn at(&self, frame: u64) -> ScheduledEvent<'_> {
        match self {
            OwnedPayload::Midi(bytes) => ScheduledEvent::midi(frame, bytes),
            OwnedPayload::Osc(packet) => ScheduledEvent::osc(frame, packet),
            OwnedPayload::Cv(value) => ScheduledEvent::cv(frame, *value),
        }
    }
}

/// Partial com settings; `None` fields keep the device's current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComUpdate {
    pub name: Option<String>,
    pub lease: Option<Lease>,
    pub ip: Option<Ipv4Cidr>,
}

#[derive(Debug)]
pub enum Request {
    ListSources {
        reply: oneshot::Sender<Vec<SourceInfo>>,
    },
    SourceInfo {
        uid: String,
        reply: oneshot::Sender<Option<SourceInfo>>,
    },
    SetClaimed {
        uid: String,
        claimed: bool,
        reply: oneshot::Sender<bool>,
    },
    SetMode {
        uid: String,
        mode: Transport,
        reply: oneshot::Sender<bool>,
    },
    SetRate {
        uid: String,
        rate: u32,
        reply: oneshot::Sender<bool>,
    },
    SetCom {
        uid: String,
        update: ComUpdate,
        reply: oneshot::Sender<bool>,
    },
    ListInterfaces {
        reply: oneshot::Sender<Vec<String>>,
    },
    Enqueue {
        sink: String,
        time: OscTime,
        payload: OwnedPayload,
        reply: oneshot::Sender<bool>,
    },
    RegisterSink {
        name: String,
        kind: SinkKind,
        reply: oneshot::Sender<bool>,
    },
    DeregisterSink {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    SinkStats {
        reply: oneshot::Sender<Vec<SinkInfo>>,
    },
    MidiPorts {
        reply: oneshot::Sender<Vec<MidiPortInfo>>,
    },
    /// Send bytes straight to the direct MIDI output.
    SendMidi {
        bytes: Vec<u8>,
        reply: oneshot::Sender<bool>,
    },
    Keepalive {
        reply: oneshot::Sender<bool>,
    },
}

pub fn channel(capacity: usize) -> (ApiHandle, mpsc::Receiver<Request>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ApiHandle { tx }, rx)
}

/// Cloneable client of the main loop.
#[derive(Debug, Clone)]
pub struct ApiHandle {
    tx: mpsc::Sender<Request>,
}

impl ApiHandle {
    /// `None` when the main loop has gone away.
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.ok()?;
        rx.await.ok()
    }

    async fn flag(&self, make: impl FnOnce(oneshot::Sender<bool>) -> Request) -> bool {
        self.call(make).await.unwrap_or(false)
    }

    pub async fn sources(&self) -> Vec<SourceInfo> {
        self.call(|reply| Request::ListSources { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn source_info(&self, uid: &str) -> Option<SourceInfo> {
        let uid = uid.to_string();
        self.call(|reply| Request::SourceInfo { uid, reply })
            .await
            .flatten()
    }

    /// Source description as a JSON object.
    pub async fn source_info_json(&self, uid: &str) -> Option<String> {
        let info = self.source_info(uid).await?;
        serde_json::to_string(&info).ok()
    }

    pub async fn claimed(&self, uid: &str) -> bool {
        self.source_info(uid).await.is_some_and(|s| s.claimed)
    }

    pub async fn set_claimed(&self, uid: &str, claimed: bool) -> bool {
        let uid = uid.to_string();
        self.flag(|reply| Request::SetClaimed {
            uid,
            claimed,
            reply,
        })
        .await
    }

    pub async fn set_mode(&self, uid: &str, mode: Transport) -> bool {
        let uid = uid.to_string();
        self.flag(|reply| Request::SetMode { uid, mode, reply }).await
    }

    pub async fn set_rate(&self, uid: &str, rate: u32) -> bool {
        let uid = uid.to_string();
        self.flag(|reply| Request::SetRate { uid, rate, reply }).await
    }

    pub async fn set_name(&self, uid: &str, name: &str) -> bool {
        self.set_com(
            uid,
            ComUpdate {
                name: Some(name.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    /// Change the lease; `ip` is only meaningful for a static lease.
    pub async fn set_lease(&self, uid: &str, lease: Lease, ip: Option<Ipv4Cidr>) -> bool {
        self.set_com(
            uid,
            ComUpdate {
                lease: Some(lease),
                ip,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn set_com(&self, uid: &str, update: ComUpdate) -> bool {
        let uid = uid.to_string();
        self.flag(|reply| Request::SetCom { uid, update, reply })
            .await
    }

    /// Local interfaces as CIDR strings.
    pub async fn interfaces(&self) -> Vec<String> {
        self.call(|reply| Request::ListInterfaces { reply })
            .await
            .unwrap_or_default()
    }

    /// Queue an event on a named sink for the frame matching `time`.
    pub async fn enqueue(&self, sink: &str, time: OscTime, payload: OwnedPayload) -> bool {
        let sink = sink.to_string();
        self.flag(|reply| Request::Enqueue {
            sink,
            time,
            payload,
            reply,
        })
        .await
    }

    pub async fn register_sink(&self, name: &str, kind: SinkKind) -> bool {
        let name = name.to_string();
        self.flag(|reply| Request::RegisterSink { name, kind, reply })
            .await
    }

    pub async fn deregister_sink(&self, name: &str) -> bool {
        let name = name.to_string();
        self.flag(|reply| Request::DeregisterSink { name, reply })
            .await
    }

    pub async fn sink_stats(&self) -> Vec<SinkInfo> {
        self.call(|reply| Request::SinkStats { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn midi_ports(&self) -> Vec<MidiPortInfo> {
        self.call(|reply| Request::MidiPorts { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn send_midi(&self, bytes: &[u8]) -> bool {
        let bytes = bytes.to_vec();
        self.flag(|reply| Request::SendMidi { bytes, reply }).await
    }

    pub async fn keepalive(&self) -> bool {
        self.flag(|reply| Request::Keepalive { reply }).await
    }
}
