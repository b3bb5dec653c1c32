//! The main loop.
//!
//! One cooperative task owns the session machine and the audio backend's
//! control side. It broadcasts discovery, samples the clocks, reclaims ports
//! the audio thread has released, reports real-time counters and answers API
//! requests, all from a single `select!`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chimaeraconf::ChimaeraConfig;
use chimaeraproto::{ComSettings, Transport};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::{self, ApiHandle, ComUpdate, OwnedPayload, Request};
use crate::audio::{self, AudioBackend};
use crate::channel::SinkCounters;
use crate::clock::Desync;
use crate::event::SinkKind;
use crate::iface::{self, Interface};
use crate::midi_out::{self, DirectMidiOut};
use crate::platform::Platform;
use crate::script::{note_mapper_factory, ScriptFactory, SinkSet};
use crate::session::{SessionMachine, SessionSettings};
use crate::worker::WorkerDeps;

/// Port selector prefix that creates a virtual output instead of opening one.
const VIRTUAL_PREFIX: &str = "virtual:";

pub struct Daemon {
    config: ChimaeraConfig,
    session: SessionMachine,
    backend: Box<dyn AudioBackend>,
    desync: Desync,
    requests: mpsc::Receiver<Request>,
    snapshots: HashMap<String, SinkCounters>,
    midi_out: Option<Arc<DirectMidiOut>>,
}

/// Optional overrides for [`Daemon::start_with`].
#[derive(Default)]
pub struct DaemonOptions {
    /// Interface snapshot to use instead of the host's.
    pub interfaces: Option<Vec<Interface>>,
    /// Script host factory; the note mapper when unset.
    pub script: Option<ScriptFactory>,
}

impl Daemon {
    pub async fn start(
        config: ChimaeraConfig,
        platform: Arc<dyn Platform>,
    ) -> Result<(Self, ApiHandle)> {
        Self::start_with(config, platform, DaemonOptions::default()).await
    }

    /// Start the audio backend, register bootstrap sinks and bind the
    /// discovery socket.
    pub async fn start_with(
        config: ChimaeraConfig,
        platform: Arc<dyn Platform>,
        options: DaemonOptions,
    ) -> Result<(Self, ApiHandle)> {
        let settings =
            SessionSettings::from_config(&config).context("invalid session settings")?;

        let mut backend =
            audio::open(&config, platform.as_ref()).context("failed to start audio backend")?;
        let sinks = register_bootstrap_sinks(&config, backend.as_mut());

        let midi_out = open_midi_out(&config);

        let desync = Desync::new(backend.clock());
        if let Err(e) = desync.sample() {
            debug!("initial clock sample: {}", e);
        }

        let ifaces = options.interfaces.unwrap_or_else(iface::snapshot);
        for iface in &ifaces {
            info!(name = %iface.name, cidr = %iface.cidr, "interface");
        }

        let deps = WorkerDeps {
            platform,
            desync: desync.clone(),
            sinks,
            midi_out: midi_out.clone(),
            script: options.script.unwrap_or_else(note_mapper_factory),
        };
        let session = SessionMachine::bind(settings, ifaces, deps)
            .await
            .context("failed to bind discovery socket")?;

        let (api, requests) = api::channel(64);
        info!(
            backend = backend.name(),
            sample_rate = backend.sample_rate(),
            "chimaerad ready"
        );

        Ok((
            Self {
                config,
                session,
                backend,
                desync,
                requests,
                snapshots: HashMap::new(),
                midi_out,
            },
            api,
        ))
    }

    pub fn session(&self) -> &SessionMachine {
        &self.session
    }

    /// Run until `shutdown` resolves or every API handle is dropped, then
    /// release all claimed sources.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let network = &self.config.infra.network;
        let mut discover = tokio::time::interval(Duration::from_millis(network.discover_interval_ms));
        discover.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut clock = tokio::time::interval(Duration::from_millis(
            self.config.infra.audio.clock_interval_ms,
        ));
        clock.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::pin!(shutdown);
        let mut api_open = true;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }

                _ = discover.tick() => {
                    if let Err(e) = self.session.send_discover().await {
                        warn!("discovery broadcast failed: {}", e);
                    }
                }

                _ = clock.tick() => self.on_clock_tick(),

                result = self.session.recv() => {
                    if let Err(e) = result {
                        warn!("discovery socket: {}", e);
                    }
                }

                request = self.requests.recv(), if api_open => match request {
                    Some(request) => self.handle_request(request).await,
                    None => {
                        debug!("all API handles dropped");
                        api_open = false;
                    }
                },
            }
        }

        self.session.release_all();
        info!("all sources released");
    }

    fn on_clock_tick(&mut self) {
        if let Err(e) = self.desync.sample() {
            debug!("clock sample rejected: {}", e);
        }

        let collected = self.backend.collect_garbage();
        if collected > 0 {
            debug!(collected, "released sink ports");
        }

        self.report_counters();
    }

    /// Log counters the audio thread bumped since the last tick.
    fn report_counters(&mut self) {
        let sinks = self.backend.sinks();
        self.snapshots
            .retain(|name, _| sinks.iter().any(|s| &s.name == name));

        for sink in sinks {
            let earlier = self.snapshots.entry(sink.name.clone()).or_default();
            for (counter, delta) in sink.counters.problems_since(earlier) {
                warn!(sink = %sink.name, counter, delta, "real-time events degraded");
            }
            *earlier = sink.counters;
        }
    }

    async fn handle_request(&mut self, request: Request) {
        // A dropped reply receiver only means the caller stopped waiting.
        match request {
            Request::ListSources { reply } => {
                let infos = self.session.sources().iter().map(|s| s.info()).collect();
                let _ = reply.send(infos);
            }
            Request::SourceInfo { uid, reply } => {
                let _ = reply.send(self.session.source(&uid).map(|s| s.info()));
            }
            Request::SetClaimed {
                uid,
                claimed,
                reply,
            } => {
                let ok = match self.session.set_claimed(&uid, claimed) {
                    Ok(changed) => {
                        debug!(uid = %uid, claimed, changed, "claim state");
                        true
                    }
                    Err(e) => {
                        warn!(uid = %uid, claimed, "claim change failed: {}", e);
                        false
                    }
                };
                let _ = reply.send(ok);
            }
            Request::SetMode { uid, mode, reply } => {
                let _ = reply.send(self.set_mode(&uid, mode));
            }
            Request::SetRate { uid, rate, reply } => {
                let ok = match self.session.set_rate(&uid, rate) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(uid = %uid, rate, "rate change failed: {}", e);
                        false
                    }
                };
                let _ = reply.send(ok);
            }
            Request::SetCom { uid, update, reply } => {
                let ok = self.set_com(&uid, update).await;
                let _ = reply.send(ok);
            }
            Request::ListInterfaces { reply } => {
                let cidrs = self
                    .session
                    .interfaces()
                    .iter()
                    .map(|i| i.cidr.to_string())
                    .collect();
                let _ = reply.send(cidrs);
            }
            Request::Enqueue {
                sink,
                time,
                payload,
                reply,
            } => {
                let _ = reply.send(self.enqueue(&sink, &time, &payload));
            }
            Request::RegisterSink { name, kind, reply } => {
                let ok = match self.backend.register_sink(&name, kind) {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(sink = %name, "register failed: {}", e);
                        false
                    }
                };
                let _ = reply.send(ok);
            }
            Request::DeregisterSink { name, reply } => {
                let ok = match self.backend.deregister_sink(&name) {
                    Ok(()) => {
                        info!(sink = %name, "sink deregistered");
                        true
                    }
                    Err(e) => {
                        warn!(sink = %name, "deregister failed: {}", e);
                        false
                    }
                };
                let _ = reply.send(ok);
            }
            Request::SinkStats { reply } => {
                let _ = reply.send(self.backend.sinks());
            }
            Request::MidiPorts { reply } => {
                let ports = midi_out::list_output_ports().unwrap_or_else(|e| {
                    warn!("listing MIDI ports failed: {}", e);
                    Vec::new()
                });
                let _ = reply.send(ports);
            }
            Request::SendMidi { bytes, reply } => {
                let ok = match &self.midi_out {
                    Some(out) => out
                        .send(&bytes)
                        .map_err(|e| warn!("direct MIDI send failed: {}", e))
                        .is_ok(),
                    None => false,
                };
                let _ = reply.send(ok);
            }
            Request::Keepalive { reply } => {
                let _ = reply.send(true);
            }
        }
    }

    fn set_mode(&mut self, uid: &str, mode: Transport) -> bool {
        match self.session.set_mode(uid, mode) {
            Ok(()) => true,
            Err(e) => {
                warn!(uid, mode = mode.as_str(), "mode change failed: {}", e);
                false
            }
        }
    }

    async fn set_com(&mut self, uid: &str, update: ComUpdate) -> bool {
        let Some(current) = self.session.source(uid).map(|s| s.com_settings()) else {
            warn!(uid, "com change for unknown source");
            return false;
        };
        let desired = ComSettings {
            name: update.name.unwrap_or(current.name),
            lease: update.lease.unwrap_or(current.lease),
            ip: update.ip.unwrap_or(current.ip),
        };

        match self.session.reconfigure_com(uid, &desired).await {
            Ok(sent) => {
                if !sent {
                    debug!(uid, "com settings unchanged");
                }
                true
            }
            Err(e) => {
                warn!(uid, "com change failed: {}", e);
                false
            }
        }
    }

    fn enqueue(&self, sink: &str, time: &chimaeraproto::OscTime, payload: &OwnedPayload) -> bool {
        let Some(handle) = self.backend.sink(sink) else {
            debug!(sink, "enqueue on unknown sink");
            return false;
        };
        let frame = self.desync.frame_for(time);
        match handle.enqueue(&payload.at(frame)) {
            Ok(()) => true,
            Err(e) => {
                debug!(sink, kind = %payload.kind(), "enqueue rejected: {}", e);
                false
            }
        }
    }
}

/// Register configured sinks; the first of each kind feeds device workers.
fn register_bootstrap_sinks(config: &ChimaeraConfig, backend: &mut dyn AudioBackend) -> SinkSet {
    let mut set = SinkSet::default();
    for entry in &config.bootstrap.sinks {
        let kind: SinkKind = match entry.kind.parse() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(sink = %entry.name, "skipping sink: {}", e);
                continue;
            }
        };
        let sink = match backend.register_sink(&entry.name, kind) {
            Ok(sink) => sink,
            Err(e) => {
                warn!(sink = %entry.name, "bootstrap sink not registered: {}", e);
                continue;
            }
        };
        let slot = match kind {
            SinkKind::Midi => &mut set.midi,
            SinkKind::Osc => &mut set.osc,
            SinkKind::Cv => &mut set.cv,
        };
        slot.get_or_insert(sink);
    }
    set
}

fn open_midi_out(config: &ChimaeraConfig) -> Option<Arc<DirectMidiOut>> {
    let selector = config.bootstrap.midi_out.port.as_deref()?;
    let opened = match selector.strip_prefix(VIRTUAL_PREFIX) {
        Some(name) => DirectMidiOut::open_virtual(name),
        None => DirectMidiOut::open(selector),
    };
    match opened {
        Ok(out) => Some(Arc::new(out)),
        Err(e) => {
            warn!("direct MIDI output unavailable: {}", e);
            None
        }
    }
}
