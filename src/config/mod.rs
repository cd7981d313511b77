//! # Configuration Management Module
//!
//! Typed TOML configuration for a controller unit's radio core, with defaults
//! for every value and a [`Config::validate`] pass run after loading.
//!
//! ## Configuration Structure
//!
//! - [`UnitConfig`] - this unit's role, PAN and the MACs of its peers
//! - [`RadioConfig`] - module init, AT retry and loopback timing
//! - [`ExpansionConfig`] - expansion bus liveness and config distribution
//! - [`ConcentratorConfig`] - sensor concentrator sleep and timeout policy
//! - [`TransferConfig`] - bulk transfer options
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use woisradio::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("config.toml").await?;
//!     let config = Config::load("config.toml").await?;
//!     println!("PAN: {:#06x}", config.unit.pan_id);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [unit]
//! role = "master"
//! pan_id = 8193
//! master_mac = "0000000000000000"
//! expansion_macs = ["0013A20040A1B2C3", "0000000000000000", "0000000000000000"]
//!
//! [expansion]
//! response_timeout_ms = 15000
//! keepalive_interval_ms = 45000
//! ```
//!
//! MACs are 16 hex digits; all zeros marks an absent unit. Timing values are
//! policy constants tuned for a given radio link and may be adjusted per site.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::protocol::{UnitId, MAC_UNCONFIGURED};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("pan_id must be non-zero")]
    ZeroPan,
    #[error("{0} shares the master's MAC")]
    SharesMasterMac(UnitId),
    #[error("expansion units {0} and {1} share MAC {2:016X}")]
    DuplicateMac(UnitId, UnitId, u64),
    #[error("an expansion unit needs master_mac")]
    MissingMaster,
    #[error("zones_per_unit must be between 1 and 64, got {0}")]
    ZonesPerUnit(u8),
    #[error("{name} must be non-zero")]
    Zero { name: &'static str },
    #[error("loopback_window_ms ({window}) must be shorter than loopback_interval_ms ({interval})")]
    LoopbackWindow { window: u32, interval: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    pub role: UnitId,
    pub pan_id: u16,
    /// Only used by expansion units.
    #[serde(with = "mac_hex")]
    pub master_mac: u64,
    #[serde(with = "mac_hex::array")]
    pub expansion_macs: [u64; 3],
    pub zones_per_unit: u8,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            role: UnitId::Master,
            pan_id: 0x2001,
            master_mac: MAC_UNCONFIGURED,
            expansion_macs: [MAC_UNCONFIGURED; 3],
            zones_per_unit: 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub retry_threshold_ms: u32,
    pub init_timeout_ms: u32,
    /// Consecutive failed initialisations before the radio is left in FAILURE.
    pub max_radio_resets: u8,
    pub loopback_interval_ms: u32,
    /// Loopback period once the link is ONLINE.
    pub online_check_interval_ms: u32,
    pub loopback_window_ms: u32,
    pub loopback_fail_limit: u8,
    /// Loopback probe destination; 0 is the network coordinator.
    #[serde(with = "mac_hex")]
    pub loopback_destination: u64,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            retry_threshold_ms: 5_000,
            init_timeout_ms: 15_000,
            max_radio_resets: 3,
            loopback_interval_ms: 10_000,
            online_check_interval_ms: 60_000,
            loopback_window_ms: 3_000,
            loopback_fail_limit: 3,
            loopback_destination: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionConfig {
    pub response_timeout_ms: u32,
    pub keepalive_interval_ms: u32,
    pub put_restart_limit: u8,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 15_000,
            keepalive_interval_ms: 45_000,
            put_restart_limit: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcentratorConfig {
    /// SC_ASSOC messages without an SC_STATUS before the radio is reset.
    pub reassociation_limit: u8,
    pub irrigating_sleep_s: u16,
    pub idle_sleep_s: u16,
    pub inhibit_sleep_s: u16,
    pub hibernate_threshold_mv: u16,
    pub hibernate_sleep_s: u16,
    pub status_timeout_s: u32,
}

impl Default for ConcentratorConfig {
    fn default() -> Self {
        Self {
            reassociation_limit: 6,
            irrigating_sleep_s: 10,
            idle_sleep_s: 300,
            inhibit_sleep_s: 900,
            hibernate_threshold_mv: 3_300,
            hibernate_sleep_s: 3_600,
            status_timeout_s: 1_800,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Serve the raw EEPROM resource (debug only).
    pub eeprom_access: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub unit: UnitConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub expansion: ExpansionConfig,
    #[serde(default)]
    pub concentrator: ConcentratorConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate a configuration file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config
            .validate()
            .map_err(|e| anyhow!("Invalid config file {}: {}", path, e))?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = &self.unit;
        if unit.pan_id == 0 {
            return Err(ConfigError::ZeroPan);
        }
        if unit.zones_per_unit == 0 || unit.zones_per_unit > 64 {
            return Err(ConfigError::ZonesPerUnit(unit.zones_per_unit));
        }
        if unit.role.is_expansion() && unit.master_mac == MAC_UNCONFIGURED {
            return Err(ConfigError::MissingMaster);
        }
        for (i, &a) in unit.expansion_macs.iter().enumerate() {
            if a == MAC_UNCONFIGURED {
                continue;
            }
            if a == unit.master_mac {
                return Err(ConfigError::SharesMasterMac(UnitId::EXPANSIONS[i]));
            }
            for (j, &b) in unit.expansion_macs.iter().enumerate().skip(i + 1) {
                if a == b {
                    return Err(ConfigError::DuplicateMac(
                        UnitId::EXPANSIONS[i],
                        UnitId::EXPANSIONS[j],
                        a,
                    ));
                }
            }
        }

        let nonzero = [
            ("retry_threshold_ms", self.radio.retry_threshold_ms),
            ("init_timeout_ms", self.radio.init_timeout_ms),
            ("loopback_interval_ms", self.radio.loopback_interval_ms),
            ("online_check_interval_ms", self.radio.online_check_interval_ms),
            ("response_timeout_ms", self.expansion.response_timeout_ms),
            ("keepalive_interval_ms", self.expansion.keepalive_interval_ms),
            ("status_timeout_s", self.concentrator.status_timeout_s),
            ("max_radio_resets", u32::from(self.radio.max_radio_resets)),
            ("loopback_fail_limit", u32::from(self.radio.loopback_fail_limit)),
            ("reassociation_limit", u32::from(self.concentrator.reassociation_limit)),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { name: *name });
        }
        if self.radio.loopback_window_ms >= self.radio.loopback_interval_ms {
            return Err(ConfigError::LoopbackWindow {
                window: self.radio.loopback_window_ms,
                interval: self.radio.loopback_interval_ms,
            });
        }
        Ok(())
    }

    /// Configured expansion units, in baton order.
    pub fn configured_expansions(&self) -> Vec<UnitId> {
        UnitId::EXPANSIONS
            .into_iter()
            .zip(self.unit.expansion_macs)
            .filter(|(_, mac)| *mac != MAC_UNCONFIGURED)
            .map(|(unit, _)| unit)
            .collect()
    }
}

/// MACs as 16-digit hex strings.
pub mod mac_hex {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(mac: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:016X}", mac))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let text = String::deserialize(d)?;
        parse(&text).map_err(D::Error::custom)
    }

    pub fn parse(text: &str) -> Result<u64, String> {
        let digits = text.trim().trim_start_matches("0x").replace([':', '-'], "");
        if digits.is_empty() || digits.len() > 16 {
            return Err(format!("invalid MAC '{}'", text));
        }
        u64::from_str_radix(&digits, 16).map_err(|_| format!("invalid MAC '{}'", text))
    }

    pub mod array {
        use serde::{de::Error, ser::SerializeSeq, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(macs: &[u64; 3], s: S) -> Result<S::Ok, S::Error> {
            let mut seq = s.serialize_seq(Some(macs.len()))?;
            for mac in macs {
                seq.serialize_element(&format!("{:016X}", mac))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u64; 3], D::Error> {
            let texts = Vec::<String>::deserialize(d)?;
            if texts.len() > 3 {
                return Err(D::Error::custom("at most 3 expansion MACs"));
            }
            let mut macs = [0u64; 3];
            for (slot, text) in macs.iter_mut().zip(&texts) {
                *slot = super::parse(text).map_err(D::Error::custom)?;
            }
            Ok(macs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.unit.role, UnitId::Master);
        assert_eq!(config.expansion.response_timeout_ms, 15_000);
        assert_eq!(config.concentrator.reassociation_limit, 6);
        assert!(config.configured_expansions().is_empty());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let text = r#"
            [unit]
            role = "exp2"
            master_mac = "0013A200400A0B0C"
            expansion_macs = ["0013A20040000001"]

            [radio]
            retry_threshold_ms = 2000
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.unit.role, UnitId::Exp2);
        assert_eq!(config.unit.master_mac, 0x0013_A200_400A_0B0C);
        assert_eq!(config.unit.expansion_macs, [0x0013_A200_4000_0001, 0, 0]);
        assert_eq!(config.radio.retry_threshold_ms, 2000);
        assert_eq!(config.radio.init_timeout_ms, 15_000);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_mac_parsing_variants() {
        assert_eq!(mac_hex::parse("0x0013a20040a1b2c3"), Ok(0x0013_A200_40A1_B2C3));
        assert_eq!(mac_hex::parse("00:13:A2:00:40:A1:B2:C3"), Ok(0x0013_A200_40A1_B2C3));
        assert!(mac_hex::parse("").is_err());
        assert!(mac_hex::parse("0013A20040A1B2C3FF").is_err());
        assert!(mac_hex::parse("zz").is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.unit.expansion_macs = [5, 5, 0];
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateMac(UnitId::Exp1, UnitId::Exp2, 5))
        );

        let mut config = Config::default();
        config.unit.role = UnitId::Exp1;
        assert_eq!(config.validate(), Err(ConfigError::MissingMaster));

        let mut config = Config::default();
        config.expansion.response_timeout_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                name: "response_timeout_ms"
            })
        );

        let mut config = Config::default();
        config.radio.loopback_window_ms = config.radio.loopback_interval_ms;
        assert!(matches!(config.validate(), Err(ConfigError::LoopbackWindow { .. })));
    }

    #[tokio::test]
    async fn test_create_default_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();

        Config::create_default(path).await.unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("expansion_macs"));
        assert!(text.contains("0000000000000000"));

        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[tokio::test]
    async fn test_load_reports_missing_file() {
        let err = Config::load("/nonexistent/woisradio.toml").await.unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
