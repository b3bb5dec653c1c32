//! chimaerad: host daemon for Chimaera touch sensors
//!
//! Discovers devices on the local network, claims them, and turns their
//! time-stamped touch streams into sample-accurate MIDI, OSC and CV output
//! on an audio server.
//!
//! Three kinds of thread cooperate:
//!
//! - **Audio thread**: the backend's process callback runs the
//!   [`DispatchEngine`]. It never blocks, allocates or locks; everything it
//!   sees arrives through lock-free rings.
//! - **Device workers**: one per claimed source, each a single-threaded tokio
//!   runtime owning the device's streams, a private arena and a script host.
//! - **Main loop**: the [`Daemon`] owns the session machine, samples the
//!   clocks and serves the collaborator API.

pub mod api;
pub mod arena;
pub mod audio;
pub mod channel;
pub mod clock;
pub mod daemon;
pub mod dispatch;
pub mod event;
pub mod iface;
pub mod midi_out;
pub mod platform;
pub mod registry;
pub mod script;
pub mod session;
pub mod source;
pub mod stream;
pub mod worker;

pub use api::{ApiHandle, ComUpdate, OwnedPayload};
pub use arena::{Arena, ArenaError, ArenaStats, Block};
pub use audio::{AudioBackend, AudioError};
pub use channel::{channel as event_channel, ChannelError, EventSink, EventSource, SinkCounters};
pub use clock::{ClockError, ClockSync, Desync, FrameClock, IMMEDIATE_FRAME};
pub use daemon::{Daemon, DaemonOptions};
pub use dispatch::{DispatchEngine, EventPort, PortBuffer, PortScope};
pub use event::{EventPayload, ScheduledEvent, SinkKind};
pub use iface::Interface;
pub use platform::{Platform, PlatformError, Region};
pub use registry::{registry, RegistryError, SinkInfo, SinkRegistry, SlaveLimits, SlaveSet};
pub use script::{ScriptContext, ScriptFactory, ScriptHost, SinkSet};
pub use session::{SessionError, SessionMachine, SessionSettings};
pub use source::{Source, SourceInfo};
pub use worker::{WorkerConfig, WorkerDeps, WorkerHandle};
