//! Registry of active output sinks ("slaves").
//!
//! The control side ([`SinkRegistry`]) builds each [`Slave`] (ring buffer,
//! pending list, port) and submits it through a job ring. The audio thread
//! ([`SlaveSet`]) applies jobs at the start of a cycle, before draining any
//! events, and hands removed slaves back through a garbage ring so that their
//! memory is released on the control side.

use std::sync::Arc;

use rtrb::{Consumer, Producer, PushError, RingBuffer};
use serde::Serialize;
use thiserror::Error;

use crate::arena::Block;
use crate::channel::{channel, EventSink, EventSource, SinkCounters, SinkStats};
use crate::event::SinkKind;

pub type SinkId = u32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("sink '{0}' already registered")]
    Duplicate(String),

    #[error("no sink named '{0}'")]
    NotFound(String),

    #[error("sink registry full ({0} sinks)")]
    Full(usize),

    #[error("job ring full")]
    JobRingFull,
}

/// Ring and queue sizes for new slaves.
#[derive(Debug, Clone, Copy)]
pub struct SlaveLimits {
    pub midi_ring_bytes: usize,
    pub osc_ring_bytes: usize,
    pub cv_ring_bytes: usize,
    pub pending_capacity: usize,
}

impl SlaveLimits {
    pub fn ring_bytes(&self, kind: SinkKind) -> usize {
        match kind {
            SinkKind::Midi => self.midi_ring_bytes,
            SinkKind::Osc => self.osc_ring_bytes,
            SinkKind::Cv => self.cv_ring_bytes,
        }
    }
}

impl Default for SlaveLimits {
    fn default() -> Self {
        Self {
            midi_ring_bytes: 4096,
            osc_ring_bytes: 0x8000,
            cv_ring_bytes: 4096,
            pending_capacity: 1024,
        }
    }
}

impl From<&chimaeraconf::RealtimeConfig> for SlaveLimits {
    fn from(rt: &chimaeraconf::RealtimeConfig) -> Self {
        Self {
            midi_ring_bytes: rt.midi_ring_bytes,
            osc_ring_bytes: rt.osc_ring_bytes,
            cv_ring_bytes: rt.cv_ring_bytes,
            pending_capacity: rt.pending_capacity.max(1),
        }
    }
}

#[derive(Debug)]
pub(crate) enum PendingPayload {
    Bytes(Block),
    Cv(f32),
}

#[derive(Debug)]
pub(crate) struct PendingEvent {
    pub(crate) frame: u64,
    pub(crate) payload: PendingPayload,
}

/// One sink as seen by the audio thread.
pub struct Slave<P> {
    pub(crate) id: SinkId,
    pub(crate) kind: SinkKind,
    pub(crate) source: EventSource,
    pub(crate) stats: Arc<SinkStats>,
    /// Sorted ascending by frame; ties keep arrival order.
    pub(crate) pending: Vec<PendingEvent>,
    pub(crate) last_cv: f32,
    pub(crate) port: P,
}

impl<P> Slave<P> {
    pub fn id(&self) -> SinkId {
        self.id
    }

    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Value a CV slave holds until its next event.
    pub fn last_cv(&self) -> f32 {
        self.last_cv
    }

    pub fn into_port(self) -> P {
        self.port
    }
}

pub(crate) enum Job<P> {
    Add(Box<Slave<P>>),
    Remove(SinkId),
}

/// Control-side view of one registered sink.
#[derive(Debug, Clone)]
pub struct SinkEntry {
    pub id: SinkId,
    pub name: String,
    pub kind: SinkKind,
    pub sink: EventSink,
}

/// Serializable description of a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkInfo {
    pub name: String,
    pub kind: SinkKind,
    pub counters: SinkCounters,
}

impl SinkEntry {
    pub fn info(&self) -> SinkInfo {
        SinkInfo {
            name: self.name.clone(),
            kind: self.kind,
            counters: self.sink.stats().snapshot(),
        }
    }
}

/// Create the two halves of a registry holding at most `capacity` sinks.
pub fn registry<P: Send>(capacity: usize, limits: SlaveLimits) -> (SinkRegistry<P>, SlaveSet<P>) {
    let capacity = capacity.max(1);
    let (job_tx, job_rx) = RingBuffer::new(capacity * 2);
    let (garbage_tx, garbage_rx) = RingBuffer::new(capacity);

    let control = SinkRegistry {
        jobs: job_tx,
        garbage: garbage_rx,
        entries: Vec::with_capacity(capacity),
        outstanding: 0,
        capacity,
        next_id: 1,
        limits,
    };
    let rt = SlaveSet {
        jobs: job_rx,
        garbage: garbage_tx,
        slaves: Vec::with_capacity(capacity),
    };
    (control, rt)
}

/// Control half: owned by whoever manages the audio backend.
pub struct SinkRegistry<P> {
    jobs: Producer<Job<P>>,
    garbage: Consumer<Box<Slave<P>>>,
    entries: Vec<SinkEntry>,
    /// Registered sinks plus removed ones not yet collected.
    outstanding: usize,
    capacity: usize,
    next_id: SinkId,
    limits: SlaveLimits,
}

impl<P: Send> SinkRegistry<P> {
    /// Check that `name` could be registered now.
    pub fn check_available(&self, name: &str) -> Result<(), RegistryError> {
        if self.entries.iter().any(|e| e.name == name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        if self.outstanding >= self.capacity {
            return Err(RegistryError::Full(self.capacity));
        }
        Ok(())
    }

    /// Build a slave around `port` and submit it to the audio thread.
    pub fn register(
        &mut self,
        name: &str,
        kind: SinkKind,
        port: P,
    ) -> Result<EventSink, RegistryError> {
        self.check_available(name)?;

        let (sink, source) = channel(kind, self.limits.ring_bytes(kind));
        let id = self.next_id;
        let slave = Box::new(Slave {
            id,
            kind,
            stats: Arc::clone(source.stats()),
            source,
            pending: Vec::with_capacity(self.limits.pending_capacity),
            last_cv: 0.0,
            port,
        });

        self.jobs
            .push(Job::Add(slave))
            .map_err(|PushError::Full(_)| RegistryError::JobRingFull)?;

        self.next_id = self.next_id.wrapping_add(1);
        self.outstanding += 1;
        self.entries.push(SinkEntry {
            id,
            name: name.to_string(),
            kind,
            sink: sink.clone(),
        });
        Ok(sink)
    }

    /// Ask the audio thread to drop the sink. Its port comes back through
    /// [`collect_garbage`](Self::collect_garbage).
    pub fn deregister(&mut self, name: &str) -> Result<(), RegistryError> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        self.jobs
            .push(Job::Remove(self.entries[pos].id))
            .map_err(|PushError::Full(_)| RegistryError::JobRingFull)?;
        self.entries.remove(pos);
        Ok(())
    }

    /// Reclaim slaves the audio thread has released, returning their ports.
    pub fn collect_garbage(&mut self) -> Vec<P> {
        let mut ports = Vec::new();
        while let Ok(slave) = self.garbage.pop() {
            self.outstanding -= 1;
            ports.push(slave.into_port());
        }
        ports
    }

    pub fn get(&self, name: &str) -> Option<&SinkEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn entries(&self) -> &[SinkEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sinks whose slaves have not yet been reclaimed.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

/// Audio-thread half.
pub struct SlaveSet<P> {
    jobs: Consumer<Job<P>>,
    garbage: Producer<Box<Slave<P>>>,
    slaves: Vec<Box<Slave<P>>>,
}

impl<P> SlaveSet<P> {
    /// Apply all queued registrations. `on_remove` runs on each departing
    /// slave before it is handed back.
    pub fn apply_jobs(&mut self, mut on_remove: impl FnMut(&mut Slave<P>)) {
        while let Ok(job) = self.jobs.pop() {
            match job {
                Job::Add(slave) => self.slaves.push(slave),
                Job::Remove(id) => {
                    let Some(pos) = self.slaves.iter().position(|s| s.id == id) else {
                        continue;
                    };
                    let mut slave = self.slaves.remove(pos);
                    on_remove(&mut slave);
                    // Capacity accounting on the control side keeps this from
                    // failing; on failure the slave is freed here.
                    let _ = self.garbage.push(slave);
                }
            }
        }
    }

    pub fn slaves(&self) -> &[Box<Slave<P>>] {
        &self.slaves
    }

    pub(crate) fn slaves_mut(&mut self) -> &mut [Box<Slave<P>>] {
        &mut self.slaves
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelError;
    use crate::event::ScheduledEvent;

    #[test]
    fn test_register_applies_at_next_cycle() {
        let (mut control, mut rt) = registry::<u32>(4, SlaveLimits::default());
        control.register("keys", SinkKind::Midi, 7).unwrap();
        assert_eq!(control.len(), 1);
        assert!(rt.is_empty());

        rt.apply_jobs(|_| {});
        assert_eq!(rt.len(), 1);
        assert_eq!(rt.slaves()[0].kind(), SinkKind::Midi);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (mut control, _rt) = registry::<()>(4, SlaveLimits::default());
        control.register("cv1", SinkKind::Cv, ()).unwrap();
        assert_eq!(
            control.register("cv1", SinkKind::Cv, ()).err(),
            Some(RegistryError::Duplicate("cv1".to_string()))
        );
    }

    #[test]
    fn test_capacity_counts_uncollected_garbage() {
        let (mut control, mut rt) = registry::<()>(1, SlaveLimits::default());
        control.register("a", SinkKind::Osc, ()).unwrap();
        control.deregister("a").unwrap();
        assert_eq!(
            control.register("b", SinkKind::Osc, ()).err(),
            Some(RegistryError::Full(1))
        );

        rt.apply_jobs(|_| {});
        assert_eq!(control.collect_garbage().len(), 1);
        assert!(control.register("b", SinkKind::Osc, ()).is_ok());
    }

    #[test]
    fn test_register_then_deregister_all_leaves_nothing() {
        let (mut control, mut rt) = registry::<usize>(16, SlaveLimits::default());
        let names: Vec<String> = (0..10).map(|i| format!("sink{}", i)).collect();

        let sinks: Vec<EventSink> = names
            .iter()
            .enumerate()
            .map(|(i, name)| control.register(name, SinkKind::Midi, i).unwrap())
            .collect();
        rt.apply_jobs(|_| {});
        assert_eq!(rt.len(), 10);

        for name in &names {
            control.deregister(name).unwrap();
        }
        let mut removed = 0;
        rt.apply_jobs(|_| removed += 1);
        assert_eq!(removed, 10);

        let mut ports = control.collect_garbage();
        ports.sort();
        assert_eq!(ports, (0..10).collect::<Vec<_>>());

        assert!(control.is_empty());
        assert!(rt.is_empty());
        assert_eq!(control.outstanding(), 0);
        for sink in &sinks {
            assert_eq!(
                sink.enqueue(&ScheduledEvent::midi(0, &[0xfe])),
                Err(ChannelError::Closed)
            );
        }
    }

    #[test]
    fn test_deregister_unknown() {
        let (mut control, _rt) = registry::<()>(2, SlaveLimits::default());
        assert_eq!(
            control.deregister("ghost"),
            Err(RegistryError::NotFound("ghost".to_string()))
        );
    }
}
