//! Device behavior hooks.
//!
//! A worker hands every data-stream message to its [`ScriptHost`] together
//! with a [`ScriptContext`]. Hosts run on the worker thread only; whatever
//! they emit reaches the audio thread as plain events copied through a sink's
//! ring buffer.

use std::collections::HashMap;
use std::sync::Arc;

use chimaeraproto::{DataMessage, OscMessage, OscPacket, OscTime, OscType};
use tracing::{debug, trace};

use crate::arena::Arena;
use crate::channel::{ChannelError, EventSink};
use crate::clock::Desync;
use crate::event::ScheduledEvent;
use crate::midi_out::DirectMidiOut;

/// Sink handles a worker may write to.
#[derive(Debug, Clone, Default)]
pub struct SinkSet {
    pub midi: Option<EventSink>,
    pub osc: Option<EventSink>,
    pub cv: Option<EventSink>,
}

pub struct ScriptContext<'a> {
    pub arena: &'a mut Arena,
    pub sinks: &'a SinkSet,
    pub desync: &'a Desync,
    pub midi_out: Option<&'a DirectMidiOut>,
    /// Time tag of the message being handled.
    pub time: OscTime,
}

impl ScriptContext<'_> {
    /// Audio frame for the current message's time tag.
    pub fn frame(&self) -> u64 {
        self.desync.frame_for(&self.time)
    }

    pub fn midi(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        let frame = self.frame();
        enqueue(&self.sinks.midi, &ScheduledEvent::midi(frame, bytes))
    }

    pub fn osc(&self, msg: OscMessage) -> Result<(), ChannelError> {
        let packet = rosc::encoder::encode(&OscPacket::Message(msg))
            .map_err(|e| ChannelError::Encode(format!("{:?}", e)))?;
        let frame = self.frame();
        enqueue(&self.sinks.osc, &ScheduledEvent::osc(frame, &packet))
    }

    pub fn cv(&self, value: f32) -> Result<(), ChannelError> {
        let frame = self.frame();
        enqueue(&self.sinks.cv, &ScheduledEvent::cv(frame, value))
    }

    /// Send straight to the direct MIDI output, if one is open.
    pub fn midi_direct(&self, bytes: &[u8]) {
        if let Some(out) = self.midi_out {
            if let Err(e) = out.send(bytes) {
                debug!("direct MIDI send failed: {}", e);
            }
        }
    }
}

fn enqueue(sink: &Option<EventSink>, event: &ScheduledEvent<'_>) -> Result<(), ChannelError> {
    match sink {
        Some(sink) => sink.enqueue(event),
        None => Ok(()),
    }
}

/// Callbacks for one device's data stream. All default to doing nothing.
#[allow(unused_variables)]
pub trait ScriptHost: Send {
    fn on(&mut self, ctx: &mut ScriptContext<'_>, sid: i32, gid: i32, pid: i32, x: f32, z: f32) {}

    fn off(&mut self, ctx: &mut ScriptContext<'_>, sid: i32) {}

    fn set(&mut self, ctx: &mut ScriptContext<'_>, sid: i32, x: f32, z: f32) {}

    fn idle(&mut self, ctx: &mut ScriptContext<'_>) {}

    fn frame(&mut self, ctx: &mut ScriptContext<'_>, fid: i32, time: OscTime) {}

    fn token(&mut self, ctx: &mut ScriptContext<'_>, sid: i32, tuid: i32, gid: i32, x: f32, z: f32, angle: f32) {}

    fn alive(&mut self, ctx: &mut ScriptContext<'_>, sids: &[i32]) {}

    /// Housekeeping point, called right after `idle`.
    fn collect(&mut self, ctx: &mut ScriptContext<'_>) {}
}

/// Builds a host for each newly claimed device.
pub type ScriptFactory = Arc<dyn Fn(&str) -> Box<dyn ScriptHost> + Send + Sync>;

pub fn note_mapper_factory() -> ScriptFactory {
    Arc::new(|uid: &str| {
        debug!(uid, "using note mapper");
        Box::new(NoteMapper::default()) as Box<dyn ScriptHost>
    })
}

/// Route one data message to the host.
pub fn deliver(host: &mut dyn ScriptHost, ctx: &mut ScriptContext<'_>, msg: &DataMessage) {
    match msg {
        DataMessage::On { sid, gid, pid, x, z } => host.on(ctx, *sid, *gid, *pid, *x, *z),
        DataMessage::Off { sid } => host.off(ctx, *sid),
        DataMessage::Set { sid, x, z } => host.set(ctx, *sid, *x, *z),
        DataMessage::Idle => {
            host.idle(ctx);
            host.collect(ctx);
        }
        DataMessage::Frame { fid, time } => host.frame(ctx, *fid, *time),
        DataMessage::Token {
            sid,
            tuid,
            gid,
            x,
            z,
            angle,
        } => host.token(ctx, *sid, *tuid, *gid, *x, *z, *angle),
        DataMessage::Alive { sids } => host.alive(ctx, sids),
        DataMessage::StreamResolved => trace!("data stream resolved"),
    }
}

const NOTE_ON: u8 = 0x90;
const NOTE_OFF: u8 = 0x80;
const PITCH_BEND: u8 = 0xe0;

/// Maps touches to MIDI notes with pitch bend, mirrors them as OSC and
/// drives CV with pressure.
#[derive(Debug)]
pub struct NoteMapper {
    /// Lowest note across the sensor.
    pub base_note: u8,
    /// Semitones covered from x = 0 to x = 1.
    pub range: f32,
    active: HashMap<i32, Voice>,
}

#[derive(Debug, Clone, Copy)]
struct Voice {
    channel: u8,
    note: u8,
}

impl Default for NoteMapper {
    fn default() -> Self {
        Self {
            base_note: 36,
            range: 48.0,
            active: HashMap::new(),
        }
    }
}

impl NoteMapper {
    fn pitch(&self, x: f32) -> f32 {
        f32::from(self.base_note) + x.clamp(0.0, 1.0) * self.range
    }

    /// 14-bit bend for `offset` semitones, assuming a ±2 semitone range.
    fn bend(channel: u8, offset: f32) -> [u8; 3] {
        let value = (8192.0 + offset.clamp(-2.0, 2.0) / 2.0 * 8191.0) as u16;
        [PITCH_BEND | channel, (value & 0x7f) as u8, ((value >> 7) & 0x7f) as u8]
    }

    fn velocity(z: f32) -> u8 {
        (z.clamp(0.0, 1.0) * 126.0) as u8 + 1
    }

    fn report(result: Result<(), ChannelError>) {
        if let Err(e) = result {
            trace!("event not queued: {}", e);
        }
    }
}

impl ScriptHost for NoteMapper {
    fn on(&mut self, ctx: &mut ScriptContext<'_>, sid: i32, gid: i32, pid: i32, x: f32, z: f32) {
        let channel = (gid & 0x0f) as u8;
        let pitch = self.pitch(x);
        let note = pitch.round().clamp(0.0, 127.0) as u8;
        self.active.insert(sid, Voice { channel, note });

        let on = [NOTE_ON | channel, note, Self::velocity(z)];
        Self::report(ctx.midi(&on));
        ctx.midi_direct(&on);
        Self::report(ctx.osc(OscMessage {
            addr: "/on".to_string(),
            args: vec![
                OscType::Int(sid),
                OscType::Int(gid),
                OscType::Int(pid),
                OscType::Float(x),
                OscType::Float(z),
            ],
        }));
        Self::report(ctx.cv(z));
    }

    fn set(&mut self, ctx: &mut ScriptContext<'_>, sid: i32, x: f32, z: f32) {
        let Some(voice) = self.active.get(&sid).copied() else {
            return;
        };
        let bend = Self::bend(voice.channel, self.pitch(x) - f32::from(voice.note));

        Self::report(ctx.midi(&bend));
        Self::report(ctx.osc(OscMessage {
            addr: "/set".to_string(),
            args: vec![OscType::Int(sid), OscType::Float(x), OscType::Float(z)],
        }));
        Self::report(ctx.cv(z));
    }

    fn off(&mut self, ctx: &mut ScriptContext<'_>, sid: i32) {
        let Some(voice) = self.active.remove(&sid) else {
            return;
        };
        let off = [NOTE_OFF | voice.channel, voice.note, 0];
        Self::report(ctx.midi(&off));
        ctx.midi_direct(&off);
        Self::report(ctx.osc(OscMessage {
            addr: "/off".to_string(),
            args: vec![OscType::Int(sid)],
        }));
        if self.active.is_empty() {
            Self::report(ctx.cv(0.0));
        }
    }

    fn alive(&mut self, ctx: &mut ScriptContext<'_>, sids: &[i32]) {
        let stale: Vec<i32> = self
            .active
            .keys()
            .filter(|sid| !sids.contains(sid))
            .copied()
            .collect();
        for sid in stale {
            self.off(ctx, sid);
        }
    }

    fn collect(&mut self, ctx: &mut ScriptContext<'_>) {
        let stats = ctx.arena.stats();
        trace!(
            used = stats.used_bytes,
            live = stats.live_blocks,
            voices = self.active.len(),
            "collect"
        );
    }
}
