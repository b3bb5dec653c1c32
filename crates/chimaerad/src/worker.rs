//! Per-device worker thread.
//!
//! A claimed device gets its own thread running a single-threaded tokio
//! runtime. The thread owns the device's command and data streams, a private
//! arena and a [`ScriptHost`]; it negotiates the data address, configures the
//! engines, and feeds every data message to the host.
//!
//! ```text
//! spawn ──► /engines/address ──► /success ──► engine bundle ──► data ...
//!                 ▲                 │
//!                 └── ack timeout ──┘            shutdown ──► release bundle
//! ```

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chimaeraproto::{
    decode_datagram, engine_bundle, release_bundle, Command, ConfigReply, DataMessage,
    ProtocolError, Transport,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::arena::Arena;
use crate::clock::Desync;
use crate::midi_out::DirectMidiOut;
use crate::platform::Platform;
use crate::script::{deliver, ScriptContext, ScriptFactory, ScriptHost, SinkSet};
use crate::session::SessionError;
use crate::stream::{BoundData, CommandStream, DataStream};

const ADDRESS_PATH: &str = "/engines/address";

/// Everything a worker needs to know about its device.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub uid: String,
    /// Device configuration endpoint.
    pub device: SocketAddrV4,
    /// Local address on the device's subnet.
    pub local_ip: Ipv4Addr,
    pub transport: Transport,
    pub rate: u32,
    pub ack_timeout: Duration,
    pub priority: i32,
    pub arena_bytes: usize,
    pub lock_memory: bool,
}

/// Shared services handed to every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub platform: Arc<dyn Platform>,
    pub desync: Desync,
    pub sinks: SinkSet,
    pub midi_out: Option<Arc<DirectMidiOut>>,
    pub script: ScriptFactory,
}

/// Owner's side of a running worker. Dropping it stops the worker.
#[derive(Debug)]
pub struct WorkerHandle {
    uid: String,
    data_port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Reserve memory, bind sockets and start the thread. Returns once the
    /// thread has its runtime and streams; any failure up to that point is
    /// reported here and leaves nothing running.
    pub fn spawn(config: WorkerConfig, deps: WorkerDeps) -> Result<Self, SessionError> {
        let region = deps.platform.reserve(config.arena_bytes, config.lock_memory)?;
        let arena = Arena::with_region(region)?;
        let data = BoundData::bind(config.transport, config.local_ip)?;
        let data_port = data.local_addr()?.port();
        let command = CommandStream::bind(config.device)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let uid = config.uid.clone();

        let thread = thread::Builder::new()
            .name(format!("chimaera-{}", uid))
            .spawn(move || run_thread(config, deps, arena, data, command, ready_tx, shutdown_rx))?;

        let mut handle = Self {
            uid,
            data_port,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                handle.stop();
                return Err(e.into());
            }
            Err(_) => {
                handle.stop();
                return Err(SessionError::WorkerExited(handle.uid.clone()));
            }
        }

        info!(uid = %handle.uid, data_port, "worker started");
        Ok(handle)
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Local port the device streams data to.
    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    /// Signal the worker and wait for it to release the device.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            // The worker may already have exited on its own.
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(uid = %self.uid, "worker thread panicked");
            } else {
                info!(uid = %self.uid, "worker stopped");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_thread(
    config: WorkerConfig,
    deps: WorkerDeps,
    arena: Arena,
    data: BoundData,
    command: std::net::UdpSocket,
    ready: mpsc::SyncSender<io::Result<()>>,
    shutdown: oneshot::Receiver<()>,
) {
    if let Err(e) = deps.platform.promote_current_thread(config.priority) {
        warn!(uid = %config.uid, "running worker at normal priority: {}", e);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    runtime.block_on(async move {
        let worker = match Worker::attach(config, deps, arena, data, command) {
            Ok(worker) => worker,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        if ready.send(Ok(())).is_err() {
            return;
        }
        worker.run(shutdown).await
    });
}

/// Where the address handshake stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Negotiation {
    Idle,
    AwaitingAck { id: i32, since: Instant },
}

struct Worker {
    config: WorkerConfig,
    deps: WorkerDeps,
    arena: Arena,
    host: Box<dyn ScriptHost>,
    commands: CommandStream,
    data: DataStream,
    data_port: u16,
    negotiation: Negotiation,
}

impl Worker {
    fn attach(
        config: WorkerConfig,
        deps: WorkerDeps,
        arena: Arena,
        data: BoundData,
        command: std::net::UdpSocket,
    ) -> io::Result<Self> {
        let data_port = data.local_addr()?.port();
        let host = (deps.script)(&config.uid);
        Ok(Self {
            commands: CommandStream::attach(command, 1)?,
            data: data.attach()?,
            data_port,
            host,
            arena,
            deps,
            config,
            negotiation: Negotiation::Idle,
        })
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        self.request_address().await;

        let mut retry = tokio::time::interval(self.config.ack_timeout);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                reply = self.commands.recv() => match reply {
                    Ok(packet) => self.on_command_packet(&packet).await,
                    Err(e) => warn!(uid = %self.config.uid, "command stream: {}", e),
                },

                packet = self.data.recv() => match packet {
                    Ok(packet) => self.on_data_packet(packet),
                    Err(e) => warn!(uid = %self.config.uid, "data stream: {}", e),
                },

                _ = retry.tick() => self.check_ack().await,
            }
        }

        if let Err(e) = self.commands.send_bundle(&release_bundle()).await {
            debug!(uid = %self.config.uid, "release bundle not sent: {}", e);
        }
    }

    async fn request_address(&mut self) {
        let address = format!("{}:{}", self.config.local_ip, self.data_port);
        match self.commands.request(&Command::EnginesAddress(address)).await {
            Ok(id) => {
                self.negotiation = Negotiation::AwaitingAck {
                    id,
                    since: Instant::now(),
                };
            }
            Err(e) => {
                warn!(uid = %self.config.uid, "address request failed: {}", e);
                self.negotiation = Negotiation::Idle;
            }
        }
    }

    async fn check_ack(&mut self) {
        if let Negotiation::AwaitingAck { since, .. } = self.negotiation {
            if since.elapsed() >= self.config.ack_timeout {
                debug!(uid = %self.config.uid, "no acknowledgement, resending address");
                self.request_address().await;
            }
        }
    }

    async fn on_command_packet(&mut self, packet: &[u8]) {
        let messages = match decode_datagram(packet) {
            Ok(messages) => messages,
            Err(e) => {
                debug!(uid = %self.config.uid, "undecodable reply: {}", e);
                return;
            }
        };

        for (_, msg) in messages {
            match ConfigReply::parse(&msg) {
                Ok(reply) => self.on_reply(reply).await,
                Err(e) => debug!(uid = %self.config.uid, "ignoring reply: {}", e),
            }
        }
    }

    async fn on_reply(&mut self, reply: ConfigReply) {
        let awaited = match self.negotiation {
            Negotiation::AwaitingAck { id, .. } => Some(id),
            Negotiation::Idle => None,
        };

        match reply {
            ConfigReply::Success { id, path, .. } if Some(id) == awaited && path == ADDRESS_PATH => {
                self.negotiation = Negotiation::Idle;
                let bundle = engine_bundle(self.config.transport, self.config.rate);
                match self.commands.send_bundle(&bundle).await {
                    Ok(()) => info!(
                        uid = %self.config.uid,
                        mode = self.config.transport.as_str(),
                        rate = self.config.rate,
                        "engines configured"
                    ),
                    Err(e) => warn!(uid = %self.config.uid, "engine bundle not sent: {}", e),
                }
            }
            ConfigReply::Success { id, path, .. } => {
                trace!(uid = %self.config.uid, id, path = %path, "acknowledged");
            }
            ConfigReply::Fail { id, path, reason } => {
                warn!(uid = %self.config.uid, id, path = %path, "device refused: {}", reason);
                if Some(id) == awaited {
                    self.negotiation = Negotiation::Idle;
                }
            }
            ConfigReply::StreamResolved => self.request_address().await,
        }
    }

    fn on_data_packet(&mut self, packet: Bytes) {
        let messages = match decode_datagram(&packet) {
            Ok(messages) => messages,
            Err(e) => {
                debug!(uid = %self.config.uid, "undecodable data: {}", e);
                return;
            }
        };

        for (time, msg) in messages {
            let event = match DataMessage::parse(&msg) {
                Ok(event) => event,
                Err(ProtocolError::UnknownPath(path)) => {
                    trace!(uid = %self.config.uid, path = %path, "unhandled data path");
                    continue;
                }
                Err(e) => {
                    debug!(uid = %self.config.uid, "malformed data message: {}", e);
                    continue;
                }
            };

            let mut ctx = ScriptContext {
                arena: &mut self.arena,
                sinks: &self.deps.sinks,
                desync: &self.deps.desync,
                midi_out: self.deps.midi_out.as_deref(),
                time,
            };
            deliver(self.host.as_mut(), &mut ctx, &event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaError;
    use crate::channel::{channel, EventSource};
    use crate::clock::FrameClock;
    use crate::event::SinkKind;
    use crate::platform::{self, PortablePlatform};
    use crate::script::note_mapper_factory;
    use chimaeraproto::{OscMessage, OscPacket, OscType};
    use std::net::{SocketAddr, UdpSocket};

    const UID: &str = "00:00:00:00:00:01";

    struct StillClock;

    impl FrameClock for StillClock {
        fn ticks(&self) -> u64 {
            0
        }
        fn ticks_to_frames(&self, _ticks: u64) -> u64 {
            0
        }
        fn sample_rate(&self) -> u32 {
            48_000
        }
    }

    struct Device {
        socket: UdpSocket,
        addr: SocketAddrV4,
    }

    impl Device {
        fn bind() -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let SocketAddr::V4(addr) = socket.local_addr().unwrap() else {
                panic!("expected v4");
            };
            Self { socket, addr }
        }

        fn recv(&self) -> (SocketAddr, Vec<OscMessage>) {
            let mut buf = [0u8; 2048];
            let (n, from) = self.socket.recv_from(&mut buf).unwrap();
            let messages = decode_datagram(&buf[..n])
                .unwrap()
                .into_iter()
                .map(|(_, m)| m)
                .collect();
            (from, messages)
        }

        /// Wait for an address request and return its id and sender.
        fn recv_address_request(&self, data_port: u16) -> (SocketAddr, i32) {
            let (from, messages) = self.recv();
            assert_eq!(messages[0].addr, ADDRESS_PATH);
            assert_eq!(
                messages[0].args[1],
                OscType::String(format!("127.0.0.1:{}", data_port))
            );
            let OscType::Int(id) = messages[0].args[0] else {
                panic!("missing request id");
            };
            (from, id)
        }

        fn is_silent_for(&self, wait: Duration) -> bool {
            self.socket.set_read_timeout(Some(wait)).unwrap();
            let mut buf = [0u8; 2048];
            let silent = self.socket.recv_from(&mut buf).is_err();
            self.socket
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            silent
        }

        fn send(&self, to: SocketAddr, msg: OscMessage) {
            let packet = rosc::encoder::encode(&OscPacket::Message(msg)).unwrap();
            self.socket.send_to(&packet, to).unwrap();
        }
    }

    fn config(device: SocketAddrV4, ack_timeout: Duration) -> WorkerConfig {
        WorkerConfig {
            uid: UID.to_string(),
            device,
            local_ip: Ipv4Addr::LOCALHOST,
            transport: Transport::Udp,
            rate: 2000,
            ack_timeout,
            priority: 0,
            arena_bytes: 256 * 1024,
            lock_memory: false,
        }
    }

    fn deps() -> (WorkerDeps, EventSource) {
        let (midi, midi_rx) = channel(SinkKind::Midi, 4096);
        let deps = WorkerDeps {
            platform: platform::native(),
            desync: Desync::new(Arc::new(StillClock)),
            sinks: SinkSet {
                midi: Some(midi),
                ..Default::default()
            },
            midi_out: None,
            script: note_mapper_factory(),
        };
        (deps, midi_rx)
    }

    fn paths(messages: &[OscMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.addr.as_str()).collect()
    }

    #[test]
    fn test_handshake_data_and_release() {
        let device = Device::bind();
        let (deps, mut midi_rx) = deps();
        let mut handle = WorkerHandle::spawn(config(device.addr, Duration::from_secs(2)), deps).unwrap();
        let data_port = handle.data_port();

        let (worker_addr, id) = device.recv_address_request(data_port);
        device.send(
            worker_addr,
            OscMessage {
                addr: "/success".to_string(),
                args: vec![OscType::Int(id), OscType::String(ADDRESS_PATH.to_string())],
            },
        );

        let (_, bundle) = device.recv();
        assert_eq!(paths(&bundle), engine_bundle(Transport::Udp, 2000).paths());

        let on = OscMessage {
            addr: "/on".to_string(),
            args: vec![
                OscType::Int(1),
                OscType::Int(0),
                OscType::Int(0),
                OscType::Float(0.0),
                OscType::Float(0.5),
            ],
        };
        device.send(SocketAddr::from((Ipv4Addr::LOCALHOST, data_port)), on);

        let deadline = Instant::now() + Duration::from_secs(5);
        let event = loop {
            if let Some(event) = midi_rx.pop() {
                break event.frame;
            }
            assert!(Instant::now() < deadline, "no MIDI event from worker");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(event, 0);

        handle.stop();
        let (_, release) = device.recv();
        assert_eq!(paths(&release), vec!["/engines/enabled", "/engines/reset"]);
    }

    #[test]
    fn test_unanswered_address_is_resent() {
        let device = Device::bind();
        let (deps, _midi_rx) = deps();
        let handle = WorkerHandle::spawn(config(device.addr, Duration::from_millis(100)), deps).unwrap();

        let (_, first) = device.recv_address_request(handle.data_port());
        let (_, second) = device.recv_address_request(handle.data_port());
        assert!(second > first);
    }

    #[test]
    fn test_refused_address_stops_negotiation() {
        let device = Device::bind();
        let (deps, _midi_rx) = deps();
        let mut handle =
            WorkerHandle::spawn(config(device.addr, Duration::from_millis(100)), deps).unwrap();

        let (worker_addr, id) = device.recv_address_request(handle.data_port());
        device.send(
            worker_addr,
            OscMessage {
                addr: "/fail".to_string(),
                args: vec![
                    OscType::Int(id),
                    OscType::String(ADDRESS_PATH.to_string()),
                    OscType::String("engines busy".to_string()),
                ],
            },
        );

        // Several ack timeouts pass without a resend or an engine bundle.
        assert!(device.is_silent_for(Duration::from_millis(500)));

        handle.stop();
        let (_, release) = device.recv();
        assert_eq!(paths(&release), vec!["/engines/enabled", "/engines/reset"]);
    }

    #[test]
    fn test_stream_resolve_renegotiates_address() {
        let device = Device::bind();
        let (deps, _midi_rx) = deps();
        let handle = WorkerHandle::spawn(config(device.addr, Duration::from_secs(2)), deps).unwrap();
        let data_port = handle.data_port();

        let (worker_addr, id) = device.recv_address_request(data_port);
        device.send(
            worker_addr,
            OscMessage {
                addr: "/success".to_string(),
                args: vec![OscType::Int(id), OscType::String(ADDRESS_PATH.to_string())],
            },
        );
        let (_, bundle) = device.recv();
        assert_eq!(paths(&bundle), engine_bundle(Transport::Udp, 2000).paths());

        device.send(
            worker_addr,
            OscMessage {
                addr: "/stream/resolve".to_string(),
                args: vec![],
            },
        );
        let (_, again) = device.recv_address_request(data_port);
        assert!(again > id);
    }

    #[test]
    fn test_spawn_fails_without_arena() {
        let device = Device::bind();
        let (mut deps, _midi_rx) = deps();
        deps.platform = Arc::new(PortablePlatform);
        let mut config = config(device.addr, Duration::from_secs(2));
        config.arena_bytes = 8;

        let result = WorkerHandle::spawn(config, deps);
        assert!(matches!(
            result,
            Err(SessionError::Arena(ArenaError::EmptyRegion))
        ));
        assert!(device.is_silent_for(Duration::from_millis(200)));
    }
}
