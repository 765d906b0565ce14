//! Dissector configuration
//!
//! Loaded from a JSON file and/or environment variables:
//! - `TRIGGER_DISSECT_VARIANT`: `t5` | `t6`
//! - `TRIGGER_DISSECT_T6_PLATFORM`: `lite` | `superlite` | a base clock in MHz

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::packet::ProtocolVariant;

/// Environment variable selecting the protocol variant
pub const ENV_VARIANT: &str = "TRIGGER_DISSECT_VARIANT";
/// Environment variable selecting the Trigger 6 hardware platform
pub const ENV_T6_PLATFORM: &str = "TRIGGER_DISSECT_T6_PLATFORM";

const DEFAULT_MAX_PAYLOAD_LEN: u64 = 64 * 1024 * 1024;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for [`DissectorConfig`].
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Trigger 6 hardware platform, which fixes the PLL reference clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HardwarePlatform {
    /// 48 MHz reference
    #[default]
    Lite,
    /// 40 MHz reference
    SuperLite,
    /// Explicit reference clock in MHz
    CustomMhz(u32),
}

impl HardwarePlatform {
    /// PLL reference clock in MHz
    pub fn base_clock_mhz(self) -> u32 {
        match self {
            Self::Lite => 48,
            Self::SuperLite => 40,
            Self::CustomMhz(mhz) => mhz,
        }
    }

    /// Parse from environment variable string
    pub fn from_env_str(s: &str) -> Self {
        let normalized = s.to_lowercase().replace(['-', '_', ' '], "");
        match normalized.as_str() {
            "lite" => Self::Lite,
            "superlite" => Self::SuperLite,
            other => match other.trim_end_matches("mhz").parse::<u32>() {
                Ok(mhz) if mhz > 0 => Self::CustomMhz(mhz),
                _ => {
                    log::warn!("Unknown T6 platform '{}', defaulting to 'lite'", s);
                    Self::Lite
                }
            },
        }
    }
}

/// Tunables for the dissector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DissectorConfig {
    /// Protocol variant assumed for new conversations
    pub variant: ProtocolVariant,
    /// Trigger 6 hardware platform for PLL clock reconstruction
    pub t6_platform: HardwarePlatform,
    /// Treat a checksum-valid Trigger 5 header inside an unfinished payload as a new header
    pub t5_resync_on_header: bool,
    /// Declared payload lengths above this are treated as malformed framing
    pub max_payload_len: u64,
}

impl Default for DissectorConfig {
    fn default() -> Self {
        Self {
            variant: ProtocolVariant::default(),
            t6_platform: HardwarePlatform::default(),
            t5_resync_on_header: true,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

impl DissectorConfig {
    /// Default configuration for a variant
    pub fn for_variant(variant: ProtocolVariant) -> Self {
        Self {
            variant,
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file
    ///
    /// Missing fields fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read.
    /// Returns `ConfigError::Json` if the file is not valid configuration JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        log::debug!("Loaded dissector config from {}", path.display());
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var(ENV_VARIANT).ok().as_deref(),
            std::env::var(ENV_T6_PLATFORM).ok().as_deref(),
        )
    }

    fn with_overrides(mut self, variant: Option<&str>, platform: Option<&str>) -> Self {
        if let Some(v) = variant {
            match ProtocolVariant::from_name(v) {
                Some(variant) => self.variant = variant,
                None => log::warn!("Unknown protocol variant '{}', keeping {}", v, self.variant),
            }
        }
        if let Some(p) = platform {
            self.t6_platform = HardwarePlatform::from_env_str(p);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DissectorConfig::default();
        assert_eq!(config.variant, ProtocolVariant::Trigger6);
        assert_eq!(config.t6_platform.base_clock_mhz(), 48);
        assert!(config.t5_resync_on_header);
        assert_eq!(config.max_payload_len, 64 * 1024 * 1024);
    }

    #[test]
    fn test_platform_from_env_str() {
        assert_eq!(HardwarePlatform::from_env_str("Lite"), HardwarePlatform::Lite);
        assert_eq!(
            HardwarePlatform::from_env_str("super-lite"),
            HardwarePlatform::SuperLite
        );
        assert_eq!(
            HardwarePlatform::from_env_str("27MHz"),
            HardwarePlatform::CustomMhz(27)
        );
        assert_eq!(HardwarePlatform::from_env_str("bogus"), HardwarePlatform::Lite);
        assert_eq!(HardwarePlatform::from_env_str("0"), HardwarePlatform::Lite);
    }

    #[test]
    fn test_overrides() {
        let config = DissectorConfig::default().with_overrides(Some("t5"), Some("superlite"));
        assert_eq!(config.variant, ProtocolVariant::Trigger5);
        assert_eq!(config.t6_platform, HardwarePlatform::SuperLite);

        let config = config.with_overrides(Some("nonsense"), None);
        assert_eq!(config.variant, ProtocolVariant::Trigger5);
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dissector.json");
        std::fs::write(&path, r#"{"variant":"Trigger5","t6_platform":{"CustomMhz":27}}"#).unwrap();

        let config = DissectorConfig::load(&path).unwrap();
        assert_eq!(config.variant, ProtocolVariant::Trigger5);
        assert_eq!(config.t6_platform.base_clock_mhz(), 27);
        assert!(config.t5_resync_on_header);
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            DissectorConfig::load(&path),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            DissectorConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
