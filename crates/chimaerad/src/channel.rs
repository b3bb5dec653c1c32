//! Lock-free event channel from producer threads into the audio callback.
//!
//! Each sink owns one `rtrb` byte ring. A record is written with a single
//! chunk commit, so the consumer either sees a whole record or nothing:
//!
//! ```text
//! ┌────────┬────────────────┬──────────────┬─────────────┐
//! │ kind u8│ frame u64 (LE) │ len u32 (LE) │ payload     │
//! └────────┴────────────────┴──────────────┴─────────────┘
//! ```
//!
//! Producers share the write end behind a mutex that is only ever tried, so a
//! contended write is dropped like a full ring. The audio thread owns the read
//! end and never locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use portable_atomic::AtomicF32;
use rtrb::{Consumer, Producer, RingBuffer};
use thiserror::Error;

use crate::event::{EventPayload, ScheduledEvent, SinkKind};

const HEADER_LEN: usize = 1 + 8 + 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel full, event dropped")]
    Full,

    #[error("event of {len} bytes exceeds channel limit of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("{got} event sent to {expected} sink")]
    KindMismatch { expected: SinkKind, got: SinkKind },

    #[error("sink has been deregistered")]
    Closed,

    #[error("failed to encode OSC packet: {0}")]
    Encode(String),
}

/// Counters shared between a sink's producers, the audio callback and the
/// main loop's reporting.
#[derive(Debug, Default)]
pub struct SinkStats {
    pub enqueued: AtomicU64,
    /// Rejected by `enqueue` because the ring was full.
    pub dropped: AtomicU64,
    pub emitted: AtomicU64,
    /// Emitted at cycle start because their frame had already passed.
    pub late: AtomicU64,
    /// Did not fit the port buffer.
    pub overflow: AtomicU64,
    /// Arena or pending list had no room.
    pub exhausted: AtomicU64,
    pub last_cv: AtomicF32,
}

impl SinkStats {
    pub fn snapshot(&self) -> SinkCounters {
        SinkCounters {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            overflow: self.overflow.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`SinkStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SinkCounters {
    pub enqueued: u64,
    pub dropped: u64,
    pub emitted: u64,
    pub late: u64,
    pub overflow: u64,
    pub exhausted: u64,
}

impl SinkCounters {
    /// Counters that grew since `earlier`, as (name, delta) pairs.
    pub fn problems_since(&self, earlier: &SinkCounters) -> Vec<(&'static str, u64)> {
        [
            ("dropped", self.dropped.saturating_sub(earlier.dropped)),
            ("late", self.late.saturating_sub(earlier.late)),
            ("overflow", self.overflow.saturating_sub(earlier.overflow)),
            ("exhausted", self.exhausted.saturating_sub(earlier.exhausted)),
        ]
        .into_iter()
        .filter(|(_, delta)| *delta > 0)
        .collect()
    }
}

/// Create a channel for `kind` events backed by a ring of `capacity` bytes.
pub fn channel(kind: SinkKind, capacity: usize) -> (EventSink, EventSource) {
    let capacity = capacity.max(HEADER_LEN + 4);
    let (producer, consumer) = RingBuffer::new(capacity);
    let stats = Arc::new(SinkStats::default());

    let sink = EventSink {
        kind,
        max_payload: capacity - HEADER_LEN,
        producer: Arc::new(Mutex::new(producer)),
        stats: Arc::clone(&stats),
    };
    let source = EventSource {
        kind,
        consumer,
        scratch: vec![0u8; capacity - HEADER_LEN].into_boxed_slice(),
        stats,
    };
    (sink, source)
}

/// Producer side. Cheap to clone; clones share the ring.
#[derive(Clone)]
pub struct EventSink {
    kind: SinkKind,
    max_payload: usize,
    producer: Arc<Mutex<Producer<u8>>>,
    stats: Arc<SinkStats>,
}

impl EventSink {
    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    pub fn stats(&self) -> &Arc<SinkStats> {
        &self.stats
    }

    /// Largest payload this channel can carry.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Queue an event without waiting on the consumer or on other producers.
    pub fn enqueue(&self, event: &ScheduledEvent<'_>) -> Result<(), ChannelError> {
        if event.kind() != self.kind {
            return Err(ChannelError::KindMismatch {
                expected: self.kind,
                got: event.kind(),
            });
        }

        let cv_bytes;
        let payload: &[u8] = match &event.payload {
            EventPayload::Midi(bytes) | EventPayload::Osc(bytes) => bytes,
            EventPayload::Cv(value) => {
                cv_bytes = value.to_le_bytes();
                &cv_bytes
            }
        };
        if payload.len() > self.max_payload {
            return Err(ChannelError::TooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }

        let mut header = [0u8; HEADER_LEN];
        header[0] = self.kind.tag();
        header[1..9].copy_from_slice(&event.frame.to_le_bytes());
        header[9..13].copy_from_slice(&(payload.len() as u32).to_le_bytes());

        let mut producer = match self.producer.try_lock() {
            Ok(producer) => producer,
            Err(TryLockError::WouldBlock) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(ChannelError::Full);
            }
            Err(TryLockError::Poisoned(_)) => return Err(ChannelError::Closed),
        };
        if producer.is_abandoned() {
            return Err(ChannelError::Closed);
        }

        let Ok(mut chunk) = producer.write_chunk(HEADER_LEN + payload.len()) else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(ChannelError::Full);
        };

        let (first, second) = chunk.as_mut_slices();
        let mut record = header.iter().chain(payload.iter());
        for slot in first.iter_mut().chain(second.iter_mut()) {
            if let Some(byte) = record.next() {
                *slot = *byte;
            }
        }
        chunk.commit_all();

        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("kind", &self.kind)
            .field("max_payload", &self.max_payload)
            .finish()
    }
}

/// Consumer side, owned by the audio thread.
pub struct EventSource {
    kind: SinkKind,
    consumer: Consumer<u8>,
    scratch: Box<[u8]>,
    stats: Arc<SinkStats>,
}

impl EventSource {
    pub fn kind(&self) -> SinkKind {
        self.kind
    }

    pub fn stats(&self) -> &Arc<SinkStats> {
        &self.stats
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }

    /// Take the next record. The payload borrows an internal scratch buffer
    /// and is valid until the next call.
    pub fn pop(&mut self) -> Option<ScheduledEvent<'_>> {
        let (tag, frame, len) = {
            let chunk = self.consumer.read_chunk(HEADER_LEN).ok()?;
            let (a, b) = chunk.as_slices();
            let mut header = [0u8; HEADER_LEN];
            for (dst, src) in header.iter_mut().zip(a.iter().chain(b.iter())) {
                *dst = *src;
            }
            let frame = u64::from_le_bytes(header[1..9].try_into().ok()?);
            let len = u32::from_le_bytes(header[9..13].try_into().ok()?) as usize;
            (header[0], frame, len)
        };

        let chunk = self.consumer.read_chunk(HEADER_LEN + len).ok()?;
        let (a, b) = chunk.as_slices();
        let body = a.iter().chain(b.iter()).skip(HEADER_LEN);
        for (dst, src) in self.scratch.iter_mut().zip(body) {
            *dst = *src;
        }
        chunk.commit_all();

        let payload = match SinkKind::from_tag(tag)? {
            SinkKind::Midi => EventPayload::Midi(&self.scratch[..len]),
            SinkKind::Osc => EventPayload::Osc(&self.scratch[..len]),
            SinkKind::Cv => {
                let raw: [u8; 4] = self.scratch[..4].try_into().ok()?;
                EventPayload::Cv(f32::from_le_bytes(raw))
            }
        };
        Some(ScheduledEvent { frame, payload })
    }
}
