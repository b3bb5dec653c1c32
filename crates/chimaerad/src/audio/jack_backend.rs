//! JACK backend
//!
//! One client. MIDI sinks get MIDI ports, OSC sinks get MIDI-typed ports that
//! carry raw OSC packets, CV sinks get audio ports. Sinks are created and
//! removed while the client is active; the process handler only ever sees
//! them through the registry's job ring.

use std::sync::Arc;

use chimaeraconf::ChimaeraConfig;
use jack::{
    AudioOut, Client, ClientOptions, Control, MidiOut, MidiWriter, Port, ProcessScope, RawMidi,
};
use tracing::{info, warn};

use super::{extend_frames, register_with, AudioBackend, AudioError, AudioResult, CycleClock};
use crate::arena::Arena;
use crate::channel::EventSink;
use crate::clock::FrameClock;
use crate::dispatch::{DispatchEngine, EventPort, PortBuffer, PortScope};
use crate::event::SinkKind;
use crate::registry::{registry, SinkInfo, SinkRegistry, SlaveLimits};

pub enum JackPort {
    Events(Port<MidiOut>),
    Signal(Port<AudioOut>),
}

struct MidiEvents<'a> {
    writer: MidiWriter<'a>,
}

impl EventPort for MidiEvents<'_> {
    fn max_event_size(&self) -> usize {
        self.writer.max_event_size()
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> bool {
        self.writer
            .write(&RawMidi {
                time: offset,
                bytes,
            })
            .is_ok()
    }
}

struct JackScope<'a> {
    ps: &'a ProcessScope,
}

impl PortScope for JackScope<'_> {
    type Port = JackPort;

    fn nframes(&self) -> u32 {
        self.ps.n_frames()
    }

    fn with_buffer(&mut self, port: &mut JackPort, f: &mut dyn FnMut(PortBuffer<'_>)) {
        match port {
            JackPort::Events(port) => {
                let mut events = MidiEvents {
                    writer: port.writer(self.ps),
                };
                f(PortBuffer::Events(&mut events))
            }
            JackPort::Signal(port) => f(PortBuffer::Signal(port.as_mut_slice(self.ps))),
        }
    }
}

struct Processor {
    engine: DispatchEngine<JackPort>,
    clock: Arc<CycleClock>,
    frames: Option<u64>,
}

impl jack::ProcessHandler for Processor {
    fn process(&mut self, _client: &Client, ps: &ProcessScope) -> Control {
        let low = ps.last_frame_time();
        let frames = match self.frames {
            Some(previous) => extend_frames(previous, low),
            None => u64::from(low),
        };
        self.frames = Some(frames);

        let usecs = ps
            .cycle_times()
            .map(|t| t.current_usecs)
            .unwrap_or_else(|_| jack::get_time());
        self.clock.publish(frames, usecs);

        self.engine.process(&mut JackScope { ps }, frames);
        Control::Continue
    }
}

struct Notifications {
    clock: Arc<CycleClock>,
}

impl jack::NotificationHandler for Notifications {
    fn sample_rate(&mut self, _client: &Client, srate: jack::Frames) -> Control {
        info!(sample_rate = srate, "JACK sample rate changed");
        self.clock.set_sample_rate(srate);
        Control::Continue
    }

    fn xrun(&mut self, _client: &Client) -> Control {
        warn!("JACK xrun");
        Control::Continue
    }
}

pub struct JackBackend {
    client: jack::AsyncClient<Notifications, Processor>,
    registry: SinkRegistry<JackPort>,
    clock: Arc<CycleClock>,
}

impl JackBackend {
    pub fn start(config: &ChimaeraConfig, arena: Arena) -> AudioResult<Self> {
        let (client, _status) =
            Client::new(&config.infra.audio.client_name, ClientOptions::NO_START_SERVER)
                .map_err(|e| AudioError::Server(format!("failed to create JACK client: {}", e)))?;

        let sample_rate = client.sample_rate() as u32;
        info!(
            client = client.name(),
            sample_rate,
            buffer_size = client.buffer_size(),
            "JACK client created"
        );

        let (control, slaves) = registry(
            config.infra.audio.job_capacity,
            SlaveLimits::from(&config.infra.realtime),
        );
        let clock = Arc::new(CycleClock::new(sample_rate, Box::new(jack::get_time)));

        let processor = Processor {
            engine: DispatchEngine::new(slaves, arena),
            clock: Arc::clone(&clock),
            frames: None,
        };
        let notifications = Notifications {
            clock: Arc::clone(&clock),
        };
        let client = client
            .activate_async(notifications, processor)
            .map_err(|e| AudioError::Server(format!("failed to activate JACK client: {}", e)))?;
        info!("JACK client activated");

        Ok(Self {
            client,
            registry: control,
            clock,
        })
    }

    fn release(&self, port: JackPort) {
        let client = self.client.as_client();
        let result = match port {
            JackPort::Events(port) => client.unregister_port(port),
            JackPort::Signal(port) => client.unregister_port(port),
        };
        if let Err(e) = result {
            warn!("failed to unregister JACK port: {}", e);
        }
    }
}

impl AudioBackend for JackBackend {
    fn name(&self) -> &'static str {
        "jack"
    }

    fn sample_rate(&self) -> u32 {
        self.clock.sample_rate()
    }

    fn clock(&self) -> Arc<dyn FrameClock> {
        self.clock.clone()
    }

    fn register_sink(&mut self, name: &str, kind: SinkKind) -> AudioResult<EventSink> {
        let client = self.client.as_client();
        register_with(&mut self.registry, name, kind, || {
            let port = match kind {
                SinkKind::Midi | SinkKind::Osc => {
                    client.register_port(name, MidiOut::default()).map(JackPort::Events)
                }
                SinkKind::Cv => client.register_port(name, AudioOut::default()).map(JackPort::Signal),
            };
            port.map_err(|e| AudioError::Server(format!("failed to register port '{}': {}", name, e)))
        })
    }

    fn deregister_sink(&mut self, name: &str) -> AudioResult<()> {
        self.registry.deregister(name)?;
        Ok(())
    }

    fn collect_garbage(&mut self) -> usize {
        let ports = self.registry.collect_garbage();
        let count = ports.len();
        for port in ports {
            self.release(port);
        }
        count
    }

    fn sink(&self, name: &str) -> Option<EventSink> {
        self.registry.get(name).map(|entry| entry.sink.clone())
    }

    fn sinks(&self) -> Vec<SinkInfo> {
        self.registry.entries().iter().map(|e| e.info()).collect()
    }
}
