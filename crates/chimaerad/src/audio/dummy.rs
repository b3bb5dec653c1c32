//! Headless driver: runs dispatch cycles on a timer thread against ports
//! that discard their output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chimaeraconf::ChimaeraConfig;
use tracing::{debug, info};

use super::{register_with, AudioBackend, AudioResult, CycleClock};
use crate::arena::Arena;
use crate::channel::EventSink;
use crate::clock::FrameClock;
use crate::dispatch::{DispatchEngine, EventPort, PortBuffer, PortScope};
use crate::event::SinkKind;
use crate::registry::{registry, SinkInfo, SinkRegistry, SlaveLimits};

/// Largest event a discarding port accepts per cycle.
const NULL_EVENT_CAPACITY: usize = 4096;

#[derive(Debug)]
pub struct NullPort {
    kind: SinkKind,
}

struct Discard {
    room: usize,
}

impl EventPort for Discard {
    fn max_event_size(&self) -> usize {
        self.room
    }

    fn write(&mut self, _offset: u32, bytes: &[u8]) -> bool {
        if bytes.len() > self.room {
            return false;
        }
        self.room -= bytes.len();
        true
    }
}

struct NullScope {
    nframes: u32,
    signal: Vec<f32>,
}

impl PortScope for NullScope {
    type Port = NullPort;

    fn nframes(&self) -> u32 {
        self.nframes
    }

    fn with_buffer(&mut self, port: &mut NullPort, f: &mut dyn FnMut(PortBuffer<'_>)) {
        match port.kind {
            SinkKind::Cv => f(PortBuffer::Signal(&mut self.signal[..])),
            SinkKind::Midi | SinkKind::Osc => {
                let mut discard = Discard {
                    room: NULL_EVENT_CAPACITY,
                };
                f(PortBuffer::Events(&mut discard))
            }
        }
    }
}

pub struct DummyBackend {
    registry: SinkRegistry<NullPort>,
    clock: Arc<CycleClock>,
    running: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
}

impl DummyBackend {
    pub fn start(config: &ChimaeraConfig, arena: Arena) -> AudioResult<Self> {
        let audio = &config.infra.audio;
        let sample_rate = audio.sample_rate.max(1);
        let buffer_size = audio.buffer_size.max(1);

        let (control, slaves) = registry(
            audio.job_capacity,
            SlaveLimits::from(&config.infra.realtime),
        );
        let mut engine = DispatchEngine::new(slaves, arena);

        let epoch = Instant::now();
        let clock = Arc::new(CycleClock::new(
            sample_rate,
            Box::new(move || epoch.elapsed().as_micros() as u64),
        ));
        let running = Arc::new(AtomicBool::new(true));

        let period = Duration::from_secs_f64(f64::from(buffer_size) / f64::from(sample_rate));
        let driver = {
            let clock = Arc::clone(&clock);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("dummy-audio".to_string())
                .spawn(move || {
                    let mut scope = NullScope {
                        nframes: buffer_size,
                        signal: vec![0.0; buffer_size as usize],
                    };
                    let mut frame: u64 = u64::from(buffer_size);
                    let mut cycles: u32 = 0;
                    while running.load(Ordering::Acquire) {
                        let usecs = epoch.elapsed().as_micros() as u64;
                        clock.publish(frame, usecs);
                        engine.process(&mut scope, frame);
                        frame += u64::from(buffer_size);

                        // Deadlines come from the epoch so sleep error does not accumulate.
                        cycles = cycles.wrapping_add(1);
                        let deadline = epoch + period * cycles;
                        if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
                            thread::sleep(wait);
                        }
                    }
                    debug!("dummy driver stopped");
                })?
        };

        info!(sample_rate, buffer_size, "dummy audio driver started");
        Ok(Self {
            registry: control,
            clock,
            running,
            driver: Some(driver),
        })
    }
}

impl AudioBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn sample_rate(&self) -> u32 {
        self.clock.sample_rate()
    }

    fn clock(&self) -> Arc<dyn FrameClock> {
        self.clock.clone()
    }

    fn register_sink(&mut self, name: &str, kind: SinkKind) -> AudioResult<EventSink> {
        register_with(&mut self.registry, name, kind, || Ok(NullPort { kind }))
    }

    fn deregister_sink(&mut self, name: &str) -> AudioResult<()> {
        self.registry.deregister(name)?;
        Ok(())
    }

    fn collect_garbage(&mut self) -> usize {
        self.registry.collect_garbage().len()
    }

    fn sink(&self, name: &str) -> Option<EventSink> {
        self.registry.get(name).map(|entry| entry.sink.clone())
    }

    fn sinks(&self) -> Vec<SinkInfo> {
        self.registry.entries().iter().map(|e| e.info()).collect()
    }
}

impl Drop for DummyBackend {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ScheduledEvent;

    fn config() -> ChimaeraConfig {
        let mut config = ChimaeraConfig::default();
        config.infra.audio.buffer_size = 64;
        config
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + Duration::from_secs(2);
        while Instant::now() < until {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_immediate_event_is_emitted() {
        let mut backend = DummyBackend::start(&config(), Arena::on_heap(1 << 20).unwrap()).unwrap();
        let sink = backend.register_sink("midi_out", SinkKind::Midi).unwrap();
        sink.enqueue(&ScheduledEvent::midi(0, &[0x90, 64, 100])).unwrap();

        assert!(wait_for(|| sink.stats().snapshot().emitted == 1));
        assert_eq!(sink.stats().snapshot().late, 0);
    }

    #[test]
    fn test_deregistered_ports_come_back() {
        let mut backend = DummyBackend::start(&config(), Arena::on_heap(1 << 20).unwrap()).unwrap();
        backend.register_sink("cv", SinkKind::Cv).unwrap();
        assert_eq!(backend.sinks().len(), 1);

        backend.deregister_sink("cv").unwrap();
        assert!(backend.sinks().is_empty());

        let mut collected = 0;
        assert!(wait_for(|| {
            collected += backend.collect_garbage();
            collected == 1
        }));
    }

    #[test]
    fn test_clock_advances_with_cycles() {
        let backend = DummyBackend::start(&config(), Arena::on_heap(1 << 20).unwrap()).unwrap();
        let clock = backend.clock();
        let first = clock.ticks_to_frames(clock.ticks());
        thread::sleep(Duration::from_millis(50));
        let later = clock.ticks_to_frames(clock.ticks());
        assert!(later > first);
    }
}
