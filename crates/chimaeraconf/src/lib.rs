//! Configuration loading for chimaerad.
//!
//! # Configuration Philosophy
//!
//! - **Infrastructure** (`InfraConfig`): sockets, audio server, arena sizes.
//!   Read once at startup.
//!
//! - **Bootstrap** (`BootstrapConfig`): sinks to register and defaults for newly
//!   discovered devices. After startup the collaborator API owns this state.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/chimaerad/config.toml` (system)
//! 2. `~/.config/chimaerad/config.toml` (user)
//! 3. `./chimaerad.toml` or the `--config` path (local override)
//! 4. Environment variables (`CHIMAERAD_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [network]
//! discover_addr = "255.255.255.255:4444"
//!
//! [audio]
//! backend = "jack"
//! client_name = "chimaerad"
//!
//! [realtime]
//! arena_bytes = 33554432
//!
//! [bootstrap.defaults]
//! rate = 2000
//! mode = "udp"
//!
//! [[bootstrap.sinks]]
//! name = "midi_out"
//! kind = "midi"
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{BootstrapConfig, DefaultsConfig, MidiOutConfig, SinkSpec};
pub use infra::{
    AudioConfig, BackendKind, InfraConfig, NetworkConfig, RealtimeConfig, TelemetryConfig,
};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete chimaerad configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChimaeraConfig {
    #[serde(flatten)]
    pub infra: InfraConfig,

    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

impl ChimaeraConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load with an optional CLI path replacing `./chimaerad.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table_from_file(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::table_to_config(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();
        let infra = &self.infra;

        output.push_str("# chimaerad configuration\n\n");

        output.push_str("[network]\n");
        output.push_str(&format!("discover_addr = \"{}\"\n", infra.network.discover_addr));
        output.push_str(&format!("device_port = {}\n", infra.network.device_port));
        output.push_str(&format!(
            "discover_interval_ms = {}\n",
            infra.network.discover_interval_ms
        ));
        output.push_str(&format!("ack_timeout_ms = {}\n", infra.network.ack_timeout_ms));

        output.push_str("\n[audio]\n");
        output.push_str(&format!("backend = \"{}\"\n", infra.audio.backend.as_str()));
        output.push_str(&format!("client_name = \"{}\"\n", infra.audio.client_name));
        output.push_str(&format!("sample_rate = {}\n", infra.audio.sample_rate));
        output.push_str(&format!("buffer_size = {}\n", infra.audio.buffer_size));
        output.push_str(&format!(
            "clock_interval_ms = {}\n",
            infra.audio.clock_interval_ms
        ));
        output.push_str(&format!("job_capacity = {}\n", infra.audio.job_capacity));

        output.push_str("\n[realtime]\n");
        output.push_str(&format!("arena_bytes = {}\n", infra.realtime.arena_bytes));
        output.push_str(&format!(
            "worker_arena_bytes = {}\n",
            infra.realtime.worker_arena_bytes
        ));
        output.push_str(&format!(
            "worker_priority = {}\n",
            infra.realtime.worker_priority
        ));
        output.push_str(&format!(
            "midi_ring_bytes = {}\n",
            infra.realtime.midi_ring_bytes
        ));
        output.push_str(&format!("osc_ring_bytes = {}\n", infra.realtime.osc_ring_bytes));
        output.push_str(&format!("cv_ring_bytes = {}\n", infra.realtime.cv_ring_bytes));
        output.push_str(&format!(
            "pending_capacity = {}\n",
            infra.realtime.pending_capacity
        ));
        output.push_str(&format!("lock_memory = {}\n", infra.realtime.lock_memory));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("log_level = \"{}\"\n", infra.telemetry.log_level));

        output.push_str("\n[bootstrap.defaults]\n");
        output.push_str(&format!("rate = {}\n", self.bootstrap.defaults.rate));
        output.push_str(&format!("mode = \"{}\"\n", self.bootstrap.defaults.mode));

        if let Some(port) = &self.bootstrap.midi_out.port {
            output.push_str("\n[bootstrap.midi_out]\n");
            output.push_str(&format!("port = \"{}\"\n", port));
        }

        for sink in &self.bootstrap.sinks {
            output.push_str("\n[[bootstrap.sinks]]\n");
            output.push_str(&format!("name = \"{}\"\n", sink.name));
            output.push_str(&format!("kind = \"{}\"\n", sink.kind));
        }

        output
    }
}
