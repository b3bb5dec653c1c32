//! Audio server backends.
//!
//! A backend owns the audio client, the control half of the sink registry and
//! a [`CycleClock`] published from its process callback. The dispatch engine
//! itself lives on the backend's real-time thread.

pub mod dummy;
#[cfg(feature = "jack-backend")]
pub mod jack_backend;

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chimaeraconf::{BackendKind, ChimaeraConfig};
use thiserror::Error;
use tracing::info;

use crate::arena::{Arena, ArenaError};
use crate::channel::EventSink;
use crate::clock::FrameClock;
use crate::event::SinkKind;
use crate::platform::{Platform, PlatformError};
use crate::registry::{RegistryError, SinkInfo, SinkRegistry};

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio server: {0}")]
    Server(String),

    #[error("backend '{0}' not compiled in")]
    Unavailable(&'static str),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("engine arena: {0}")]
    Arena(#[from] ArenaError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("failed to start driver thread: {0}")]
    Thread(#[from] std::io::Error),
}

pub type AudioResult<T> = Result<T, AudioError>;

/// Interface the session machine and API use to manage sinks.
pub trait AudioBackend: Send {
    fn name(&self) -> &'static str;

    fn sample_rate(&self) -> u32;

    fn clock(&self) -> Arc<dyn FrameClock>;

    /// Create an output port and its slave.
    fn register_sink(&mut self, name: &str, kind: SinkKind) -> AudioResult<EventSink>;

    fn deregister_sink(&mut self, name: &str) -> AudioResult<()>;

    /// Release ports of slaves the audio thread has let go. Returns how many.
    fn collect_garbage(&mut self) -> usize;

    fn sink(&self, name: &str) -> Option<EventSink>;

    fn sinks(&self) -> Vec<SinkInfo>;
}

/// Reserve the engine arena and start the configured backend.
pub fn open(config: &ChimaeraConfig, platform: &dyn Platform) -> AudioResult<Box<dyn AudioBackend>> {
    let rt = &config.infra.realtime;
    let region = platform.reserve(rt.arena_bytes, rt.lock_memory)?;
    let arena = Arena::with_region(region)?;
    info!(
        platform = platform.name(),
        bytes = arena.capacity(),
        "engine arena reserved"
    );

    match config.infra.audio.backend {
        BackendKind::Dummy => Ok(Box::new(dummy::DummyBackend::start(config, arena)?)),
        #[cfg(feature = "jack-backend")]
        BackendKind::Jack => Ok(Box::new(jack_backend::JackBackend::start(config, arena)?)),
        #[cfg(not(feature = "jack-backend"))]
        BackendKind::Jack => Err(AudioError::Unavailable("jack")),
    }
}

/// Shared registration path: validate, create the port, hand it to the
/// audio thread.
pub(crate) fn register_with<P: Send>(
    registry: &mut SinkRegistry<P>,
    name: &str,
    kind: SinkKind,
    make_port: impl FnOnce() -> AudioResult<P>,
) -> AudioResult<EventSink> {
    registry.check_available(name)?;
    let port = make_port()?;
    let sink = registry.register(name, kind, port)?;
    info!(sink = name, kind = %kind, "sink registered");
    Ok(sink)
}

/// Widen a 32-bit frame counter reading to the 64-bit value nearest to
/// `reference`.
pub fn extend_frames(reference: u64, low: u32) -> u64 {
    const SPAN: u64 = 1 << 32;
    const HALF: u64 = 1 << 31;
    let candidate = (reference & !(SPAN - 1)) | u64::from(low);
    if candidate + HALF < reference {
        candidate + SPAN
    } else if candidate > reference + HALF && candidate >= SPAN {
        candidate - SPAN
    } else {
        candidate
    }
}

type TickSource = Box<dyn Fn() -> u64 + Send + Sync>;

/// Tick-to-frame mapping anchored at the start of the latest cycle.
///
/// The audio thread publishes (frame, microseconds) at each cycle start; a
/// sequence counter lets readers on other threads see a consistent pair
/// without locking the writer.
pub struct CycleClock {
    seq: AtomicU64,
    frames: AtomicU64,
    usecs: AtomicU64,
    sample_rate: AtomicU32,
    now: TickSource,
}

impl CycleClock {
    pub fn new(sample_rate: u32, now: TickSource) -> Self {
        Self {
            seq: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            usecs: AtomicU64::new(0),
            sample_rate: AtomicU32::new(sample_rate),
            now,
        }
    }

    /// Called from the audio thread only.
    pub fn publish(&self, frames: u64, usecs: u64) {
        self.seq.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
        self.frames.store(frames, Ordering::Relaxed);
        self.usecs.store(usecs, Ordering::Relaxed);
        self.seq.fetch_add(1, Ordering::Release);
    }

    pub fn set_sample_rate(&self, sample_rate: u32) {
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
    }

    fn anchor(&self) -> (u64, u64) {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let frames = self.frames.load(Ordering::Relaxed);
            let usecs = self.usecs.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return (frames, usecs);
            }
        }
    }
}

impl FrameClock for CycleClock {
    fn ticks(&self) -> u64 {
        (self.now)()
    }

    fn ticks_to_frames(&self, ticks: u64) -> u64 {
        let (frames, usecs) = self.anchor();
        let delta = i128::from(ticks) - i128::from(usecs);
        let offset = delta * i128::from(self.sample_rate()) / 1_000_000;
        (i128::from(frames) + offset).max(0) as u64
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CycleClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (frames, usecs) = self.anchor();
        f.debug_struct("CycleClock")
            .field("frames", &frames)
            .field("usecs", &usecs)
            .field("sample_rate", &self.sample_rate())
            .finish()
    }
}
