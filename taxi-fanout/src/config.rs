//! Configuration management for taxi-fanout.
//!
//! Configuration is read from a TOML file. Every field has a default that
//! matches the production TAXI fanout board, so a missing file is not an
//! error. The file is located, in order, by the `--config` flag, the
//! `TAXI_FANOUT_CONFIG` environment variable, and `/etc/taxi/fanout.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Environment variable naming an alternative configuration file.
pub const CONFIG_ENV: &str = "TAXI_FANOUT_CONFIG";

/// System-wide configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/taxi/fanout.toml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Register block behind the I2C master
    pub smc: SmcConfig,

    /// Expander addresses
    pub board: BoardConfig,

    /// Sequencing delays
    pub timing: TimingConfig,

    /// Serial bootloader connection
    pub bootloader: BootloaderConfig,
}

/// Memory-mapped register block configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SmcConfig {
    /// Device node exposing the register window
    pub device: PathBuf,

    /// Length of the register window in bytes
    pub map_len: usize,

    /// Interval between completion-flag polls (µs)
    pub poll_interval_us: u64,

    /// Give up on a transaction after this long (ms)
    pub poll_timeout_ms: u64,
}

impl Default for SmcConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/uio0"),
            map_len: 0x2000,
            poll_interval_us: 100,
            poll_timeout_ms: 50,
        }
    }
}

impl SmcConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Fanout board wiring.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Expander carrying power enable (port 0) and power fault (port 1)
    pub power_expander: u8,

    /// Expander carrying programming select (port 0) and supply monitor (port 1)
    pub program_expander: u8,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            power_expander: 0x40,
            program_expander: 0x42,
        }
    }
}

/// Delays between sequencing steps.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait after removing power before re-applying it (ms)
    pub discharge_delay_ms: u64,

    /// Programming-select settle time before flashing (ms)
    pub program_settle_ms: u64,

    /// Programming-select settle time before a power-cycle boot (ms)
    pub power_settle_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            discharge_delay_ms: 6000,
            program_settle_ms: 50,
            power_settle_ms: 100,
        }
    }
}

impl TimingConfig {
    pub fn discharge_delay(&self) -> Duration {
        Duration::from_millis(self.discharge_delay_ms)
    }

    pub fn program_settle(&self) -> Duration {
        Duration::from_millis(self.program_settle_ms)
    }

    pub fn power_settle(&self) -> Duration {
        Duration::from_millis(self.power_settle_ms)
    }
}

/// Serial bootloader configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BootloaderConfig {
    /// Serial port routed to the selected channel
    pub port: String,

    /// Baud rate
    pub baud_rate: u32,

    /// Flash base address firmware is written to and started from
    pub flash_address: u32,

    /// Timeout for each bootloader response (ms)
    pub response_timeout_ms: u64,

    /// Drive reset on RTS and BOOT0 on DTR
    pub swap_rts_dtr: bool,

    /// Reset is asserted with the reset line cleared
    pub reset_active_high: bool,

    /// BOOT0 is high with the BOOT0 line cleared
    pub boot0_active_low: bool,
}

impl Default for BootloaderConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyS2".to_string(),
            baud_rate: 115200,
            flash_address: 0x0800_0000,
            response_timeout_ms: 1000,
            swap_rts_dtr: false,
            reset_active_high: false,
            boot0_active_low: false,
        }
    }
}

impl BootloaderConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// An explicitly named file (`path`, then [`CONFIG_ENV`]) must exist. The
    /// system-wide file is optional; defaults are used when it is absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }
        let default = Path::new(DEFAULT_CONFIG_PATH);
        if default.exists() {
            Self::load_from(default)
        } else {
            debug!(path = DEFAULT_CONFIG_PATH, "No configuration file, using defaults");
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config = Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_default() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn test_defaults_match_board() {
        let config = Config::default();
        assert_eq!(config.board.power_expander, 0x40);
        assert_eq!(config.board.program_expander, 0x42);
        assert_eq!(config.bootloader.flash_address, 0x0800_0000);
        assert_eq!(config.timing.discharge_delay(), Duration::from_secs(6));
        assert_eq!(config.smc.poll_interval(), Duration::from_micros(100));
    }

    #[test]
    fn test_partial_override() {
        let config = Config::parse(
            r#"
            [timing]
            discharge_delay_ms = 10000

            [bootloader]
            port = "/dev/ttyUSB0"
            "#,
        )
        .unwrap();
        assert_eq!(config.timing.discharge_delay_ms, 10000);
        assert_eq!(config.timing.program_settle_ms, 50);
        assert_eq!(config.bootloader.port, "/dev/ttyUSB0");
        assert_eq!(config.bootloader.baud_rate, 115200);
        assert_eq!(config.smc, SmcConfig::default());
    }

    #[test]
    fn test_control_line_wiring() {
        let config = Config::parse(
            r#"
            [bootloader]
            swap_rts_dtr = true
            reset_active_high = true
            "#,
        )
        .unwrap();
        assert!(config.bootloader.swap_rts_dtr);
        assert!(config.bootloader.reset_active_high);
        assert!(!config.bootloader.boot0_active_low);
        assert!(!Config::default().bootloader.swap_rts_dtr);
    }

    #[test]
    fn test_rejects_wrong_type() {
        assert!(Config::parse("[board]\npower_expander = \"0x40\"\n").is_err());
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = Config::load(Some(Path::new("/nonexistent/fanout.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
