// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Wirelift Contributors

// Operator configuration
//
// Loaded from ~/.config/wirelift/config.toml when present; every field has
// a working default so a missing file is not an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::network::{PORT_RANGE_HIGH, PORT_RANGE_LOW};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Remote listen-port window reserved for wirelift sessions
    pub port_range_low: u16,
    pub port_range_high: u16,

    /// Grace period between starting the remote server and registering the
    /// client peer, so we do not race the server's listener bind. A tuning
    /// knob, not a protocol constant.
    pub settle_delay_secs: u64,

    /// Health monitor tick interval
    pub health_interval_secs: u64,

    /// Interval between heartbeat touches on the remote host
    pub heartbeat_interval_secs: u64,

    /// Missed-heartbeat window after which the remote server exits on its own
    pub heartbeat_timeout_secs: u64,

    /// Bounded timeout for individual remote commands
    pub command_timeout_secs: u64,

    /// SSH connect timeout
    pub connect_timeout_secs: u64,

    /// Local path of the tunnel-server artifact uploaded to the remote host
    pub server_artifact: PathBuf,

    /// Base directory for session-scoped remote working directories
    pub remote_base_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port_range_low: PORT_RANGE_LOW,
            port_range_high: PORT_RANGE_HIGH,
            settle_delay_secs: 3,
            health_interval_secs: 5,
            heartbeat_interval_secs: 5,
            heartbeat_timeout_secs: 30,
            command_timeout_secs: 15,
            connect_timeout_secs: 15,
            server_artifact: PathBuf::from("/usr/lib/wirelift/wirelift-server"),
            remote_base_dir: "/tmp".to_string(),
        }
    }
}

impl Settings {
    /// Path of the operator config file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("could not determine config directory".to_string()))?;
        Ok(config_dir.join("wirelift").join("config.toml"))
    }

    /// Load the settings file, falling back to defaults when it is missing
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&contents)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.port_range_low == 0 || self.port_range_low > self.port_range_high {
            return Err(Error::Config(format!(
                "invalid port range {}..={}",
                self.port_range_low, self.port_range_high
            )));
        }
        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(Error::Config(
                "heartbeat timeout must exceed the heartbeat interval".to_string(),
            ));
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_cover_the_reserved_port_window() {
        let s = Settings::default();
        assert_eq!(s.port_range_high - s.port_range_low + 1, 100);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(settings.settle_delay_secs, Settings::default().settle_delay_secs);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "settle_delay_secs = 1").unwrap();
        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.settle_delay_secs, 1);
        assert_eq!(settings.port_range_low, PORT_RANGE_LOW);
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port_range_low = 6000\nport_range_high = 5000\n").unwrap();
        assert!(Settings::load_from(&path).is_err());
    }
}
