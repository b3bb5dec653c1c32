//! Config file discovery, loading, and environment variable overlay.

use crate::{ChimaeraConfig, ConfigError};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files that
/// exist. If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/chimaerad/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("chimaerad/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("chimaerad.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_table_from_file(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Deserialize a merged table, filling unset keys with defaults.
pub fn table_to_config(table: toml::Table, path: &Path) -> Result<ChimaeraConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Parse config from TOML string.
pub fn parse_toml(contents: &str, path: &Path) -> Result<ChimaeraConfig, ConfigError> {
    table_to_config(parse_table(contents, path)?, path)
}

/// Merge `overlay` into `base`. Tables merge key by key; any other value,
/// arrays included, replaces what was there.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut ChimaeraConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("CHIMAERAD_DISCOVER_ADDR") {
        config.infra.network.discover_addr = v;
        sources.env_overrides.push("CHIMAERAD_DISCOVER_ADDR".to_string());
    }
    if let Ok(v) = env::var("CHIMAERAD_DEVICE_PORT") {
        if let Ok(port) = v.parse() {
            config.infra.network.device_port = port;
            sources.env_overrides.push("CHIMAERAD_DEVICE_PORT".to_string());
        }
    }

    if let Ok(v) = env::var("CHIMAERAD_BACKEND") {
        if let Ok(backend) = v.parse() {
            config.infra.audio.backend = backend;
            sources.env_overrides.push("CHIMAERAD_BACKEND".to_string());
        }
    }
    if let Ok(v) = env::var("CHIMAERAD_CLIENT_NAME") {
        config.infra.audio.client_name = v;
        sources.env_overrides.push("CHIMAERAD_CLIENT_NAME".to_string());
    }

    if let Ok(v) = env::var("CHIMAERAD_ARENA_BYTES") {
        if let Ok(bytes) = v.parse() {
            config.infra.realtime.arena_bytes = bytes;
            sources.env_overrides.push("CHIMAERAD_ARENA_BYTES".to_string());
        }
    }

    if let Ok(v) = env::var("CHIMAERAD_RATE") {
        if let Ok(rate) = v.parse() {
            config.bootstrap.defaults.rate = rate;
            sources.env_overrides.push("CHIMAERAD_RATE".to_string());
        }
    }
    if let Ok(v) = env::var("CHIMAERAD_MODE") {
        config.bootstrap.defaults.mode = v;
        sources.env_overrides.push("CHIMAERAD_MODE".to_string());
    }

    if let Ok(v) = env::var("CHIMAERAD_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("CHIMAERAD_LOG_LEVEL".to_string());
    }
    if let Ok(v) = env::var("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackendKind;

    #[test]
    fn test_discover_config_files() {
        // Just verify it doesn't panic
        let _files = discover_config_files_with_override(None);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[network]
device_port = 5555
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.infra.network.device_port, 5555);
        // Other values should be defaults
        assert_eq!(config.infra.network.discover_addr, "255.255.255.255:4444");
        assert_eq!(config.bootstrap.defaults.rate, 2000);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
[network]
discover_addr = "192.168.1.255:4444"
ack_timeout_ms = 500

[audio]
backend = "dummy"
sample_rate = 44100
buffer_size = 128

[realtime]
arena_bytes = 1048576
lock_memory = false

[bootstrap.defaults]
rate = 1000
mode = "tcp"

[[bootstrap.sinks]]
name = "pressure"
kind = "cv"
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();

        assert_eq!(config.infra.network.discover_addr, "192.168.1.255:4444");
        assert_eq!(config.infra.network.ack_timeout_ms, 500);
        assert_eq!(config.infra.audio.backend, BackendKind::Dummy);
        assert_eq!(config.infra.audio.sample_rate, 44100);
        assert_eq!(config.infra.realtime.arena_bytes, 1048576);
        assert!(!config.infra.realtime.lock_memory);
        assert_eq!(config.bootstrap.defaults.mode, "tcp");
        assert_eq!(config.bootstrap.sinks.len(), 1);
        assert_eq!(config.bootstrap.sinks[0].kind, "cv");
    }

    #[test]
    fn test_parse_rejects_bad_backend() {
        let toml = r#"
[audio]
backend = "coreaudio"
"#;
        let err = parse_toml(toml, Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_merge_tables_keeps_unrelated_keys() {
        let mut base: toml::Table = r#"
[network]
device_port = 5000
ack_timeout_ms = 100
"#
        .parse()
        .unwrap();
        let overlay: toml::Table = r#"
[network]
ack_timeout_ms = 900
"#
        .parse()
        .unwrap();

        merge_tables(&mut base, overlay);
        let config = table_to_config(base, Path::new("merged")).unwrap();
        assert_eq!(config.infra.network.device_port, 5000);
        assert_eq!(config.infra.network.ack_timeout_ms, 900);
    }
}
