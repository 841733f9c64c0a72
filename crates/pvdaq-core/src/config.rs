//! Instrument configuration.
//!
//! Loaded from TOML through the `config` crate. One [`InstrumentConfig`] per
//! physical connection; firmware-specific details such as the status-byte
//! bitmasks live here rather than as hard-coded constants, because they vary
//! between firmware revisions.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::connection::ConnectionSettings;
use crate::error::{EngineError, EngineResult};
use crate::scheduler::ChannelId;
use crate::status::ChannelStatus;

/// Status-byte bit assignments of the instrument firmware.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct StatusBits {
    /// Bit(s) set while a sweep is still running.
    pub running_mask: u8,
    /// Bit(s) set once all requested work has completed.
    pub done_mask: u8,
}

impl Default for StatusBits {
    fn default() -> Self {
        Self {
            running_mask: 0x01,
            done_mask: 0x02,
        }
    }
}

/// Configuration of one instrument connection.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentConfig {
    /// Stable identifier used in events and logs.
    pub id: String,
    /// Instrument kind, e.g. "tracker".
    pub kind: String,
    /// Serial device path, e.g. "/dev/ttyUSB0".
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_timeout_ms")]
    pub reconnect_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Post-write settle delay applied to configuration writes.
    #[serde(default)]
    pub settle_ms: u64,
    /// Whether a hardware reset line is wired up for this instrument.
    #[serde(default)]
    pub has_reset_line: bool,
    /// Channels declared on this instrument.
    pub channels: Vec<ChannelId>,
    #[serde(default)]
    pub status_bits: StatusBits,
    /// Template merged into newly created channel records.
    #[serde(default)]
    pub channel_defaults: ChannelStatus,
}

fn default_baud() -> u32 {
    115_200
}

fn default_connect_timeout_ms() -> u64 {
    1_000
}

fn default_reconnect_timeout_ms() -> u64 {
    2_000
}

fn default_command_timeout_ms() -> u64 {
    1_000
}

impl InstrumentConfig {
    /// Semantic validation beyond what serde enforces.
    pub fn validate(&self) -> EngineResult<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::Config("instrument id must not be empty".into()));
        }
        if self.port.trim().is_empty() {
            return Err(EngineError::Config(format!(
                "instrument '{}' has no serial port configured",
                self.id
            )));
        }
        if self.channels.is_empty() {
            return Err(EngineError::Config(format!(
                "instrument '{}' declares no channels",
                self.id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for &ch in &self.channels {
            if !seen.insert(ch) {
                return Err(EngineError::Config(format!(
                    "instrument '{}' declares channel {} twice",
                    self.id, ch
                )));
            }
        }
        if self.baud == 0 {
            return Err(EngineError::Config(format!(
                "instrument '{}' has baud rate 0",
                self.id
            )));
        }
        Ok(())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_timeout: Duration::from_millis(self.reconnect_timeout_ms),
            ..ConnectionSettings::default()
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Path of the durable channel-status file.
    #[serde(default = "default_status_file")]
    pub status_file: String,
    pub instruments: Vec<InstrumentConfig>,
}

fn default_status_file() -> String {
    "pvdaq-status.json".to_string()
}

impl AppConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        for instrument in &cfg.instruments {
            instrument.validate()?;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(id: &str) -> InstrumentConfig {
        InstrumentConfig {
            id: id.into(),
            kind: "tracker".into(),
            port: "/dev/ttyUSB0".into(),
            baud: default_baud(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_timeout_ms: default_reconnect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            settle_ms: 0,
            has_reset_line: false,
            channels: vec![1, 2],
            status_bits: StatusBits::default(),
            channel_defaults: ChannelStatus::default(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(minimal("trk1").validate().is_ok());
    }

    #[test]
    fn duplicate_channels_are_rejected() {
        let mut cfg = minimal("trk1");
        cfg.channels = vec![1, 1];
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn empty_channel_list_is_rejected() {
        let mut cfg = minimal("trk1");
        cfg.channels.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_defaults_apply() {
        let toml = r#"
            id = "trk1"
            kind = "tracker"
            port = "/dev/ttyACM0"
            channels = [1, 2, 3, 4]
        "#;
        let cfg: InstrumentConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.baud, 115_200);
        assert_eq!(cfg.connect_timeout_ms, 1_000);
        assert_eq!(cfg.status_bits.running_mask, 0x01);
        assert!(!cfg.has_reset_line);
    }
}
