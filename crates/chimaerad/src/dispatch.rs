//! Per-cycle dispatch of scheduled events into output port buffers.
//!
//! Runs inside the audio callback: no locks, no heap allocation. Payloads
//! waiting for a later cycle are copied into the engine's [`Arena`], and each
//! slave's pending list is preallocated.

use std::sync::atomic::Ordering;

use crate::arena::{Arena, ArenaStats};
use crate::event::EventPayload;
use crate::registry::{PendingEvent, PendingPayload, Slave, SlaveSet};

/// Event-carrying port buffer (MIDI, or OSC over a MIDI-typed port).
pub trait EventPort {
    /// Largest event that still fits this cycle.
    fn max_event_size(&self) -> usize;

    /// Write `bytes` at frame `offset` within the cycle.
    fn write(&mut self, offset: u32, bytes: &[u8]) -> bool;
}

/// One port's buffer for the current cycle.
pub enum PortBuffer<'a> {
    Events(&'a mut dyn EventPort),
    Signal(&'a mut [f32]),
}

/// Gives access to the buffers of the ports owned by slaves.
pub trait PortScope {
    type Port;

    /// Frames in the current cycle.
    fn nframes(&self) -> u32;

    fn with_buffer(&mut self, port: &mut Self::Port, f: &mut dyn FnMut(PortBuffer<'_>));
}

pub struct DispatchEngine<P> {
    slaves: SlaveSet<P>,
    arena: Arena,
}

impl<P> DispatchEngine<P> {
    pub fn new(slaves: SlaveSet<P>, arena: Arena) -> Self {
        Self { slaves, arena }
    }

    /// Run one cycle starting at absolute frame `cycle_start`.
    pub fn process<S>(&mut self, scope: &mut S, cycle_start: u64)
    where
        S: PortScope<Port = P>,
    {
        let nframes = scope.nframes();
        let Self { slaves, arena } = self;

        slaves.apply_jobs(|slave| release_pending(slave, arena));

        for slave in slaves.slaves_mut() {
            drain(slave, arena);

            let Slave {
                pending,
                stats,
                last_cv,
                port,
                ..
            } = &mut **slave;

            scope.with_buffer(port, &mut |buffer| {
                let mut cycle = Cycle {
                    pending: &mut *pending,
                    arena: &mut *arena,
                    stats: &**stats,
                    cycle_start,
                    nframes,
                };
                match buffer {
                    PortBuffer::Events(port) => cycle.emit_events(port),
                    PortBuffer::Signal(samples) => cycle.emit_signal(samples, last_cv),
                }
            });
        }
    }

    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    pub fn slaves(&self) -> &SlaveSet<P> {
        &self.slaves
    }
}

/// Move everything waiting in the slave's ring into its pending list.
fn drain<P>(slave: &mut Slave<P>, arena: &mut Arena) {
    let Slave {
        source,
        pending,
        stats,
        ..
    } = slave;

    while let Some(event) = source.pop() {
        if pending.len() == pending.capacity() {
            stats.exhausted.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        let payload = match event.payload {
            EventPayload::Midi(bytes) | EventPayload::Osc(bytes) => match arena.alloc_copy(bytes) {
                Ok(block) => PendingPayload::Bytes(block),
                Err(_) => {
                    stats.exhausted.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            },
            EventPayload::Cv(value) => PendingPayload::Cv(value),
        };
        let at = pending.partition_point(|p| p.frame <= event.frame);
        pending.insert(
            at,
            PendingEvent {
                frame: event.frame,
                payload,
            },
        );
    }
}

fn release_pending<P>(slave: &mut Slave<P>, arena: &mut Arena) {
    for event in slave.pending.drain(..) {
        free_payload(arena, event.payload);
    }
}

/// Every pending block is owned by exactly one pending event.
fn free_payload(arena: &mut Arena, payload: PendingPayload) {
    if let PendingPayload::Bytes(block) = payload {
        let freed = arena.free(block);
        debug_assert!(freed.is_ok(), "pending payload freed twice: {:?}", freed);
    }
}

struct Cycle<'a> {
    pending: &'a mut Vec<PendingEvent>,
    arena: &'a mut Arena,
    stats: &'a crate::channel::SinkStats,
    cycle_start: u64,
    nframes: u32,
}

impl Cycle<'_> {
    fn cycle_end(&self) -> u64 {
        self.cycle_start + u64::from(self.nframes)
    }

    /// Offset within the cycle; immediate and late events land at 0.
    fn offset(&self, frame: u64) -> u32 {
        if frame != 0 && frame < self.cycle_start {
            self.stats.late.fetch_add(1, Ordering::Relaxed);
        }
        frame.saturating_sub(self.cycle_start) as u32
    }

    fn due(&self) -> usize {
        let end = self.cycle_end();
        self.pending.partition_point(|p| p.frame < end)
    }

    fn emit_events(&mut self, port: &mut dyn EventPort) {
        let due = self.due();
        for i in 0..due {
            let frame = self.pending[i].frame;
            let offset = self.offset(frame);
            let written = match &self.pending[i].payload {
                PendingPayload::Bytes(block) => match self.arena.bytes(block) {
                    Some(bytes) if bytes.len() <= port.max_event_size() => {
                        port.write(offset, bytes)
                    }
                    _ => false,
                },
                PendingPayload::Cv(_) => false,
            };
            self.count(written);
        }
        self.retire(due);
    }

    /// Sample-and-hold: each value holds until the next event's offset.
    fn emit_signal(&mut self, samples: &mut [f32], last_cv: &mut f32) {
        let due = self.due();
        let mut pos = 0usize;
        for i in 0..due {
            let frame = self.pending[i].frame;
            let offset = (self.offset(frame) as usize).min(samples.len());
            match self.pending[i].payload {
                PendingPayload::Cv(value) => {
                    samples[pos..offset].fill(*last_cv);
                    pos = offset;
                    *last_cv = value;
                    self.count(true);
                }
                PendingPayload::Bytes(_) => self.count(false),
            }
        }
        samples[pos..].fill(*last_cv);
        self.stats.last_cv.store(*last_cv, Ordering::Relaxed);
        self.retire(due);
    }

    fn count(&self, written: bool) {
        let counter = if written {
            &self.stats.emitted
        } else {
            &self.stats.overflow
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn retire(&mut self, due: usize) {
        for event in self.pending.drain(..due) {
            free_payload(self.arena, event.payload);
        }
    }
}
