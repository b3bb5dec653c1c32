//! Bootstrap configuration - initial values that seed runtime state.
//!
//! Sinks listed here are registered at startup; the collaborator API can add
//! and remove more afterwards. Source defaults apply to newly discovered devices.

use serde::{Deserialize, Serialize};

/// Settings applied to a device when it is first discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Sensor sample rate requested on claim.
    /// Default: 2000
    #[serde(default = "DefaultsConfig::default_rate")]
    pub rate: u32,

    /// Data transport, "udp" or "tcp".
    #[serde(default = "DefaultsConfig::default_mode")]
    pub mode: String,
}

impl DefaultsConfig {
    fn default_rate() -> u32 {
        2000
    }

    fn default_mode() -> String {
        "udp".to_string()
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            rate: Self::default_rate(),
            mode: Self::default_mode(),
        }
    }
}

/// One output sink registered at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSpec {
    pub name: String,
    /// "midi", "osc" or "cv".
    pub kind: String,
}

fn default_sinks() -> Vec<SinkSpec> {
    vec![
        SinkSpec {
            name: "midi_out".to_string(),
            kind: "midi".to_string(),
        },
        SinkSpec {
            name: "osc_out".to_string(),
            kind: "osc".to_string(),
        },
    ]
}

/// Direct (non-scheduled) MIDI output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MidiOutConfig {
    /// Substring of the port name to open at startup.
    #[serde(default)]
    pub port: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default = "default_sinks")]
    pub sinks: Vec<SinkSpec>,

    #[serde(default)]
    pub midi_out: MidiOutConfig,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            sinks: default_sinks(),
            midi_out: MidiOutConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_config() {
        let defaults = DefaultsConfig::default();
        assert_eq!(defaults.rate, 2000);
        assert_eq!(defaults.mode, "udp");
    }

    #[test]
    fn test_default_sinks() {
        let bootstrap = BootstrapConfig::default();
        let kinds: Vec<_> = bootstrap.sinks.iter().map(|s| s.kind.as_str()).collect();
        assert_eq!(kinds, vec!["midi", "osc"]);
        assert!(bootstrap.midi_out.port.is_none());
    }
}
