//! Infrastructure configuration - sockets, audio server, memory. Fixed after startup.

use serde::{Deserialize, Serialize};

/// Discovery and device socket settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Where discovery queries are broadcast.
    /// Default: 255.255.255.255:4444
    #[serde(default = "NetworkConfig::default_discover_addr")]
    pub discover_addr: String,

    /// Port devices listen on for configuration commands.
    /// Default: 4444
    #[serde(default = "NetworkConfig::default_device_port")]
    pub device_port: u16,

    /// Interval between discovery broadcasts.
    /// Default: 1000
    #[serde(default = "NetworkConfig::default_discover_interval_ms")]
    pub discover_interval_ms: u64,

    /// How long a worker waits for an acknowledgement before resending.
    /// Default: 2000
    #[serde(default = "NetworkConfig::default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

impl NetworkConfig {
    fn default_discover_addr() -> String {
        "255.255.255.255:4444".to_string()
    }

    fn default_device_port() -> u16 {
        4444
    }

    fn default_discover_interval_ms() -> u64 {
        1000
    }

    fn default_ack_timeout_ms() -> u64 {
        2000
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discover_addr: Self::default_discover_addr(),
            device_port: Self::default_device_port(),
            discover_interval_ms: Self::default_discover_interval_ms(),
            ack_timeout_ms: Self::default_ack_timeout_ms(),
        }
    }
}

/// Which audio server drives the dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Jack,
    Dummy,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Jack => "jack",
            BackendKind::Dummy => "dummy",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jack" => Ok(BackendKind::Jack),
            "dummy" => Ok(BackendKind::Dummy),
            other => Err(format!("unknown audio backend '{}'", other)),
        }
    }
}

/// Audio server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Default: jack
    #[serde(default = "AudioConfig::default_backend")]
    pub backend: BackendKind,

    /// Client name registered with the audio server.
    #[serde(default = "AudioConfig::default_client_name")]
    pub client_name: String,

    /// Sample rate of the dummy driver. JACK reports its own.
    #[serde(default = "AudioConfig::default_sample_rate")]
    pub sample_rate: u32,

    /// Frames per cycle of the dummy driver.
    #[serde(default = "AudioConfig::default_buffer_size")]
    pub buffer_size: u32,

    /// Clock sampling cadence.
    /// Default: 500
    #[serde(default = "AudioConfig::default_clock_interval_ms")]
    pub clock_interval_ms: u64,

    /// Slots in the sink registration job ring.
    #[serde(default = "AudioConfig::default_job_capacity")]
    pub job_capacity: usize,
}

impl AudioConfig {
    fn default_backend() -> BackendKind {
        BackendKind::Jack
    }

    fn default_client_name() -> String {
        "chimaerad".to_string()
    }

    fn default_sample_rate() -> u32 {
        48_000
    }

    fn default_buffer_size() -> u32 {
        256
    }

    fn default_clock_interval_ms() -> u64 {
        500
    }

    fn default_job_capacity() -> usize {
        64
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: Self::default_backend(),
            client_name: Self::default_client_name(),
            sample_rate: Self::default_sample_rate(),
            buffer_size: Self::default_buffer_size(),
            clock_interval_ms: Self::default_clock_interval_ms(),
            job_capacity: Self::default_job_capacity(),
        }
    }
}

/// Memory and scheduling limits for the real-time path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Arena owned by the audio callback.
    /// Default: 32 MiB
    #[serde(default = "RealtimeConfig::default_arena_bytes")]
    pub arena_bytes: usize,

    /// Private arena of each device worker.
    /// Default: 4 MiB
    #[serde(default = "RealtimeConfig::default_worker_arena_bytes")]
    pub worker_arena_bytes: usize,

    /// Scheduling priority requested for device workers.
    #[serde(default = "RealtimeConfig::default_worker_priority")]
    pub worker_priority: i32,

    #[serde(default = "RealtimeConfig::default_midi_ring_bytes")]
    pub midi_ring_bytes: usize,

    #[serde(default = "RealtimeConfig::default_osc_ring_bytes")]
    pub osc_ring_bytes: usize,

    #[serde(default = "RealtimeConfig::default_cv_ring_bytes")]
    pub cv_ring_bytes: usize,

    /// Events each sink can hold waiting for their cycle.
    #[serde(default = "RealtimeConfig::default_pending_capacity")]
    pub pending_capacity: usize,

    /// Pin arena pages in RAM.
    #[serde(default = "RealtimeConfig::default_lock_memory")]
    pub lock_memory: bool,
}

impl RealtimeConfig {
    fn default_arena_bytes() -> usize {
        32 * 1024 * 1024
    }

    fn default_worker_arena_bytes() -> usize {
        4 * 1024 * 1024
    }

    fn default_worker_priority() -> i32 {
        50
    }

    fn default_midi_ring_bytes() -> usize {
        4096
    }

    fn default_osc_ring_bytes() -> usize {
        0x8000
    }

    fn default_cv_ring_bytes() -> usize {
        4096
    }

    fn default_pending_capacity() -> usize {
        1024
    }

    fn default_lock_memory() -> bool {
        true
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            arena_bytes: Self::default_arena_bytes(),
            worker_arena_bytes: Self::default_worker_arena_bytes(),
            worker_priority: Self::default_worker_priority(),
            midi_ring_bytes: Self::default_midi_ring_bytes(),
            osc_ring_bytes: Self::default_osc_ring_bytes(),
            cv_ring_bytes: Self::default_cv_ring_bytes(),
            pending_capacity: Self::default_pending_capacity(),
            lock_memory: Self::default_lock_memory(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter used when RUST_LOG is unset.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// All infrastructure sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub realtime: RealtimeConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_defaults() {
        let network = NetworkConfig::default();
        assert_eq!(network.discover_addr, "255.255.255.255:4444");
        assert_eq!(network.device_port, 4444);
    }

    #[test]
    fn test_realtime_defaults() {
        let rt = RealtimeConfig::default();
        assert_eq!(rt.midi_ring_bytes, 4096);
        assert_eq!(rt.osc_ring_bytes, 0x8000);
        assert_eq!(rt.worker_priority, 50);
        assert!(rt.arena_bytes >= 16 * 1024 * 1024);
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("JACK".parse::<BackendKind>(), Ok(BackendKind::Jack));
        assert_eq!("dummy".parse::<BackendKind>(), Ok(BackendKind::Dummy));
        assert!("alsa".parse::<BackendKind>().is_err());
    }
}
