//! Direct MIDI output through midir, bypassing the audio server.
//!
//! Sends are immediate; nothing here is scheduled against audio frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use midir::{MidiOutput, MidiOutputConnection};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

const CLIENT_NAME: &str = "chimaerad";

#[derive(Debug, Error)]
pub enum MidiError {
    #[error("failed to initialize MIDI: {0}")]
    InitFailed(String),

    #[error("port not found: {0}")]
    PortNotFound(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MidiPortInfo {
    pub index: usize,
    pub name: String,
}

pub fn list_output_ports() -> Result<Vec<MidiPortInfo>, MidiError> {
    let midi_out =
        MidiOutput::new("chimaerad-scan").map_err(|e| MidiError::InitFailed(e.to_string()))?;

    Ok(midi_out
        .ports()
        .iter()
        .enumerate()
        .filter_map(|(index, port)| {
            midi_out
                .port_name(port)
                .ok()
                .map(|name| MidiPortInfo { index, name })
        })
        .collect())
}

/// An open output connection. Shared between workers behind its own lock.
pub struct DirectMidiOut {
    connection: Mutex<Option<MidiOutputConnection>>,
    pub port_name: String,
    pub messages_sent: AtomicU64,
}

impl DirectMidiOut {
    /// Open an output by index or name substring.
    pub fn open(selector: &str) -> Result<Self, MidiError> {
        let midi_out =
            MidiOutput::new(CLIENT_NAME).map_err(|e| MidiError::InitFailed(e.to_string()))?;

        let ports = midi_out.ports();
        let by_index = selector.parse::<usize>().ok().and_then(|i| ports.get(i));
        let port = by_index
            .or_else(|| {
                ports.iter().find(|p| {
                    midi_out
                        .port_name(p)
                        .map(|n| n.contains(selector))
                        .unwrap_or(false)
                })
            })
            .ok_or_else(|| MidiError::PortNotFound(selector.to_string()))?;

        let port_name = midi_out
            .port_name(port)
            .map_err(|e| MidiError::ConnectionFailed(e.to_string()))?;
        let connection = midi_out
            .connect(port, "chimaerad-output")
            .map_err(|e| MidiError::ConnectionFailed(e.to_string()))?;

        info!("opened MIDI output: {}", port_name);
        Ok(Self::from_connection(connection, port_name))
    }

    /// Create a virtual output other applications can connect to.
    #[cfg(unix)]
    pub fn open_virtual(name: &str) -> Result<Self, MidiError> {
        use midir::os::unix::VirtualOutput;

        let midi_out =
            MidiOutput::new(CLIENT_NAME).map_err(|e| MidiError::InitFailed(e.to_string()))?;
        let connection = midi_out
            .create_virtual(name)
            .map_err(|e| MidiError::ConnectionFailed(e.to_string()))?;

        info!("created virtual MIDI output: {}", name);
        Ok(Self::from_connection(connection, name.to_string()))
    }

    #[cfg(not(unix))]
    pub fn open_virtual(name: &str) -> Result<Self, MidiError> {
        Err(MidiError::PortNotFound(format!(
            "virtual port '{}' unsupported on this platform",
            name
        )))
    }

    fn from_connection(connection: MidiOutputConnection, port_name: String) -> Self {
        Self {
            connection: Mutex::new(Some(connection)),
            port_name,
            messages_sent: AtomicU64::new(0),
        }
    }

    pub fn send(&self, data: &[u8]) -> Result<(), MidiError> {
        let mut guard = self
            .connection
            .lock()
            .map_err(|_| MidiError::SendFailed("output lock poisoned".to_string()))?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| MidiError::SendFailed("connection closed".to_string()))?;
        conn.send(data)
            .map_err(|e| MidiError::SendFailed(e.to_string()))?;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn close(&self) {
        if let Ok(mut guard) = self.connection.lock() {
            if let Some(conn) = guard.take() {
                conn.close();
                info!("closed MIDI output: {}", self.port_name);
            }
        }
    }
}

impl Drop for DirectMidiOut {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DirectMidiOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectMidiOut")
            .field("port_name", &self.port_name)
            .field("messages_sent", &self.messages_sent.load(Ordering::Relaxed))
            .finish()
    }
}
