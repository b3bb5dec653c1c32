//! Device session state machine.
//!
//! Owns the discovery socket and every [`Source`]. Runs on the main loop
//! only; nothing else mutates source state.
//!
//! ```text
//!              claim                      address ack
//! Discovered ────────► Active/AwaitingAck ───────────► Active/Idle
//!     ▲                                                    │
//!     └──────────────────────── release ───────────────────┘
//! ```

use std::net::{AddrParseError, SocketAddr, SocketAddrV4};
use std::time::Duration;

use chimaeraconf::ChimaeraConfig;
use chimaeraproto::{
    com_bundle, decode_datagram, Announcement, Command, ComSettings, ConfigReply, ProtocolError,
    RequestIds, Transport,
};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::arena::ArenaError;
use crate::iface::Interface;
use crate::platform::PlatformError;
use crate::source::Source;
use crate::worker::{WorkerConfig, WorkerDeps, WorkerHandle};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown source {0}")]
    UnknownSource(String),

    #[error("source {0} is not on a local subnet")]
    Unreachable(String),

    #[error("invalid address: {0}")]
    Address(#[from] AddrParseError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("worker arena: {0}")]
    Arena(#[from] ArenaError),

    #[error("worker for {0} exited during setup")]
    WorkerExited(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Session and worker settings drawn from the configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub discover_addr: SocketAddr,
    pub device_port: u16,
    pub default_mode: Transport,
    pub default_rate: u32,
    pub ack_timeout: Duration,
    pub worker_priority: i32,
    pub worker_arena_bytes: usize,
    pub lock_memory: bool,
}

impl SessionSettings {
    pub fn from_config(config: &ChimaeraConfig) -> Result<Self, SessionError> {
        let network = &config.infra.network;
        let realtime = &config.infra.realtime;
        Ok(Self {
            discover_addr: network.discover_addr.parse()?,
            device_port: network.device_port,
            default_mode: config.bootstrap.defaults.mode.parse()?,
            default_rate: config.bootstrap.defaults.rate,
            ack_timeout: Duration::from_millis(network.ack_timeout_ms),
            worker_priority: realtime.worker_priority,
            worker_arena_bytes: realtime.worker_arena_bytes,
            lock_memory: realtime.lock_memory,
        })
    }
}

pub struct SessionMachine {
    socket: UdpSocket,
    settings: SessionSettings,
    ids: RequestIds,
    sources: Vec<Source>,
    ifaces: Vec<Interface>,
    deps: WorkerDeps,
    buf: Vec<u8>,
}

impl SessionMachine {
    /// Bind the discovery socket. `ifaces` is the interface snapshot used for
    /// reachability for the lifetime of the machine.
    pub async fn bind(
        settings: SessionSettings,
        ifaces: Vec<Interface>,
        deps: WorkerDeps,
    ) -> Result<Self, SessionError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        info!(
            local = %socket.local_addr()?,
            discover = %settings.discover_addr,
            interfaces = ifaces.len(),
            "discovery socket bound"
        );

        Ok(Self {
            socket,
            settings,
            ids: RequestIds::new(1),
            sources: Vec::new(),
            ifaces,
            deps,
            buf: vec![0; 2048],
        })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.ifaces
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn source(&self, uid: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.uid == uid)
    }

    /// Broadcast one discovery query.
    pub async fn send_discover(&mut self) -> Result<(), SessionError> {
        let packet = Command::Discover.encode(self.ids.next_id())?;
        self.socket
            .send_to(&packet, self.settings.discover_addr)
            .await?;
        trace!("discovery query sent");
        Ok(())
    }

    /// Receive and handle one datagram on the discovery socket. Cancel safe.
    pub async fn recv(&mut self) -> Result<(), SessionError> {
        let (n, from) = self.socket.recv_from(&mut self.buf).await?;
        let messages = match decode_datagram(&self.buf[..n]) {
            Ok(messages) => messages,
            Err(e) => {
                debug!(%from, "undecodable discovery reply: {}", e);
                return Ok(());
            }
        };

        for (_, msg) in messages {
            let reply = match ConfigReply::parse(&msg) {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(%from, "ignoring discovery reply: {}", e);
                    continue;
                }
            };
            match reply.announcement() {
                Ok(Some(announcement)) => {
                    self.observe(announcement);
                }
                Ok(None) => match reply {
                    ConfigReply::Fail { id, path, reason } => {
                        warn!(%from, id, path = %path, "device refused: {}", reason)
                    }
                    other => trace!(%from, ?other, "reply"),
                },
                Err(e) => debug!(%from, "malformed announcement: {}", e),
            }
        }
        Ok(())
    }

    /// Record an announcement. Returns true when the device is new.
    pub fn observe(&mut self, announcement: Announcement) -> bool {
        if let Some(source) = self.sources.iter_mut().find(|s| s.uid == announcement.uid) {
            source.refresh(announcement, &self.ifaces);
            return false;
        }

        let source = Source::discovered(
            announcement,
            self.settings.default_mode,
            self.settings.default_rate,
            &self.ifaces,
        );
        info!(
            uid = %source.uid,
            name = %source.name,
            ip = %source.ip,
            lease = source.lease.as_str(),
            reachable = source.reachable(),
            "discovered source"
        );
        self.sources.push(source);
        true
    }

    fn index(&self, uid: &str) -> Result<usize, SessionError> {
        self.sources
            .iter()
            .position(|s| s.uid == uid)
            .ok_or_else(|| SessionError::UnknownSource(uid.to_string()))
    }

    /// Start a worker for the source. `Ok(false)` if it was already claimed.
    pub fn claim(&mut self, uid: &str) -> Result<bool, SessionError> {
        let idx = self.index(uid)?;
        let source = &mut self.sources[idx];
        if source.is_claimed() {
            return Ok(false);
        }

        let iface = source
            .iface
            .as_ref()
            .ok_or_else(|| SessionError::Unreachable(uid.to_string()))?;
        let config = WorkerConfig {
            uid: source.uid.clone(),
            device: SocketAddrV4::new(source.ip.addr, self.settings.device_port),
            local_ip: iface.ip(),
            transport: source.mode,
            rate: source.rate,
            ack_timeout: self.settings.ack_timeout,
            priority: self.settings.worker_priority,
            arena_bytes: self.settings.worker_arena_bytes,
            lock_memory: self.settings.lock_memory,
        };

        let worker = WorkerHandle::spawn(config, self.deps.clone())?;
        info!(uid, iface = %iface.name, data_port = worker.data_port(), "claimed");
        source.attach(worker);
        Ok(true)
    }

    /// Stop the source's worker. `Ok(false)` if it was not claimed.
    pub fn release(&mut self, uid: &str) -> Result<bool, SessionError> {
        let idx = self.index(uid)?;
        match self.sources[idx].detach() {
            Some(mut worker) => {
                worker.stop();
                info!(uid, "released");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn set_claimed(&mut self, uid: &str, claimed: bool) -> Result<bool, SessionError> {
        if claimed {
            self.claim(uid)
        } else {
            self.release(uid)
        }
    }

    /// Change the data transport; a claimed source renegotiates.
    pub fn set_mode(&mut self, uid: &str, mode: Transport) -> Result<(), SessionError> {
        let idx = self.index(uid)?;
        if self.sources[idx].mode == mode {
            return Ok(());
        }
        self.sources[idx].mode = mode;
        self.restart_if_claimed(uid)
    }

    /// Change the sensor rate; a claimed source renegotiates.
    pub fn set_rate(&mut self, uid: &str, rate: u32) -> Result<(), SessionError> {
        let idx = self.index(uid)?;
        if self.sources[idx].rate == rate {
            return Ok(());
        }
        self.sources[idx].rate = rate;
        self.restart_if_claimed(uid)
    }

    fn restart_if_claimed(&mut self, uid: &str) -> Result<(), SessionError> {
        if self.release(uid)? {
            self.claim(uid)?;
        }
        Ok(())
    }

    /// Send the commands that move the device to `desired`. The local record
    /// keeps the device's own report until it announces itself again.
    ///
    /// Returns false when nothing differs.
    pub async fn reconfigure_com(
        &mut self,
        uid: &str,
        desired: &ComSettings,
    ) -> Result<bool, SessionError> {
        let idx = self.index(uid)?;
        let source = &self.sources[idx];
        let Some(bundle) = com_bundle(&source.com_settings(), desired) else {
            return Ok(false);
        };

        // A device on a foreign subnet can still hear a broadcast.
        let target = if source.reachable() {
            SocketAddr::V4(SocketAddrV4::new(source.ip.addr, self.settings.device_port))
        } else {
            self.settings.discover_addr
        };

        let packet = bundle.encode(&mut self.ids)?;
        self.socket.send_to(&packet, target).await?;
        info!(uid, %target, paths = ?bundle.paths(), "com settings sent");
        Ok(true)
    }

    /// Release every claimed source. Always completes.
    pub fn release_all(&mut self) {
        for source in &mut self.sources {
            if let Some(mut worker) = source.detach() {
                worker.stop();
                info!(uid = %source.uid, "released");
            }
        }
    }
}

impl Drop for SessionMachine {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Desync, FrameClock};
    use crate::platform::{self, PortablePlatform};
    use crate::script::{note_mapper_factory, SinkSet};
    use chimaeraproto::Lease;
    use std::sync::Arc;

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

    fn settings() -> SessionSettings {
        SessionSettings::from_config(&ChimaeraConfig::default()).unwrap()
    }

    async fn machine() -> SessionMachine {
        let deps = WorkerDeps {
            platform: platform::native(),
            desync: Desync::new(Arc::new(StillClock)),
            sinks: SinkSet::default(),
            midi_out: None,
            script: note_mapper_factory(),
        };
        let ifaces = vec![Interface::new("eth0", "192.168.1.10/24".parse().unwrap())];
        SessionMachine::bind(settings(), ifaces, deps).await.unwrap()
    }

    fn announcement(uid: &str, ip: &str) -> Announcement {
        Announcement {
            name: "chimaera".to_string(),
            uid: uid.to_string(),
            ip: ip.parse().unwrap(),
            lease: Lease::Dhcp,
            reset: "soft".to_string(),
        }
    }

    #[test]
    fn test_settings_from_defaults() {
        let settings = settings();
        assert_eq!(settings.discover_addr, "255.255.255.255:4444".parse().unwrap());
        assert_eq!(settings.default_mode, Transport::Udp);
        assert_eq!(settings.default_rate, 2000);
    }

    #[tokio::test]
    async fn test_rediscovery_updates_in_place() {
        let mut session = machine().await;
        assert!(session.observe(announcement("a", "10.1.1.1/8")));
        assert!(!session.source("a").unwrap().reachable());

        assert!(!session.observe(announcement("a", "192.168.1.50/24")));
        assert_eq!(session.sources().len(), 1);
        assert!(session.source("a").unwrap().reachable());
    }

    #[tokio::test]
    async fn test_claim_errors() {
        let mut session = machine().await;
        session.observe(announcement("far", "10.1.1.1/8"));

        assert!(matches!(
            session.claim("missing"),
            Err(SessionError::UnknownSource(_))
        ));
        assert!(matches!(
            session.claim("far"),
            Err(SessionError::Unreachable(_))
        ));
        assert!(!session.source("far").unwrap().is_claimed());
    }

    #[tokio::test]
    async fn test_failed_claim_leaves_source_claimable() {
        let deps = WorkerDeps {
            platform: Arc::new(PortablePlatform),
            desync: Desync::new(Arc::new(StillClock)),
            sinks: SinkSet::default(),
            midi_out: None,
            script: note_mapper_factory(),
        };
        let mut settings = settings();
        settings.worker_arena_bytes = 8;
        settings.lock_memory = false;
        let ifaces = vec![Interface::new("lo", "127.0.0.1/8".parse().unwrap())];
        let mut session = SessionMachine::bind(settings, ifaces, deps).await.unwrap();
        session.observe(announcement("a", "127.0.0.2/8"));

        assert!(matches!(session.claim("a"), Err(SessionError::Arena(_))));
        assert!(!session.source("a").unwrap().is_claimed());

        session.settings.worker_arena_bytes = 256 * 1024;
        assert!(session.set_claimed("a", true).unwrap());
        assert!(session.source("a").unwrap().is_claimed());
        assert!(session.release("a").unwrap());
    }

    #[tokio::test]
    async fn test_release_unclaimed_is_noop() {
        let mut session = machine().await;
        session.observe(announcement("a", "192.168.1.50/24"));
        assert!(!session.release("a").unwrap());
    }

    #[tokio::test]
    async fn test_mode_and_rate_on_released_source() {
        let mut session = machine().await;
        session.observe(announcement("a", "192.168.1.50/24"));

        session.set_mode("a", Transport::Tcp).unwrap();
        session.set_rate("a", 3000).unwrap();

        let source = session.source("a").unwrap();
        assert_eq!(source.mode, Transport::Tcp);
        assert_eq!(source.rate, 3000);
        assert!(!source.is_claimed());
    }

    #[tokio::test]
    async fn test_unchanged_com_settings_send_nothing() {
        let mut session = machine().await;
        session.observe(announcement("a", "192.168.1.50/24"));
        let current = session.source("a").unwrap().com_settings();
        assert!(!session.reconfigure_com("a", &current).await.unwrap());
    }
}
