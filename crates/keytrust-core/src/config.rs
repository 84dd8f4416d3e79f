//! Verification configuration

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, VerifyError};
use crate::negotiation::SupportedAlgorithms;

/// Default name of the verified-state file
pub const DEFAULT_STATE_FILE_NAME: &str = "verification-state.json";

/// Tunables for the verification manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Hard upper bound on one verification attempt; activity never extends it
    #[serde(with = "duration_secs")]
    pub session_timeout: Duration,
    /// How long a key directory snapshot is reused
    #[serde(with = "duration_secs")]
    pub key_cache_ttl: Duration,
    /// Inbound requests beyond this many open sessions are ignored
    pub max_concurrent_sessions: usize,
    /// Keep offering the padded `hkdf-hmac-sha256` MAC
    pub allow_legacy_mac: bool,
    /// Send a request to another own device on start
    pub bootstrap_on_start: bool,
    pub state_file_name: String,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(15 * 60),
            key_cache_ttl: Duration::from_secs(30),
            max_concurrent_sessions: 16,
            allow_legacy_mac: true,
            bootstrap_on_start: true,
            state_file_name: DEFAULT_STATE_FILE_NAME.to_string(),
        }
    }
}

impl VerificationConfig {
    /// Unpadded MAC only, shorter attempts
    pub fn strict() -> Self {
        Self {
            session_timeout: Duration::from_secs(5 * 60),
            allow_legacy_mac: false,
            ..Self::default()
        }
    }

    /// Short timers and no bootstrap, for tests
    pub fn testing() -> Self {
        Self {
            session_timeout: Duration::from_secs(5),
            key_cache_ttl: Duration::from_millis(100),
            bootstrap_on_start: false,
            ..Self::default()
        }
    }

    pub fn supported_algorithms(&self) -> SupportedAlgorithms {
        SupportedAlgorithms::with_legacy_mac(self.allow_legacy_mac)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_timeout.is_zero() {
            return Err(VerifyError::config_error("session_timeout must be positive"));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(VerifyError::config_error(
                "max_concurrent_sessions must be at least 1",
            ));
        }
        if self.state_file_name.trim().is_empty() {
            return Err(VerifyError::config_error("state_file_name must not be empty"));
        }
        Ok(())
    }
}

mod duration_secs {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VerificationConfig::default();
        assert_eq!(config.session_timeout, Duration::from_secs(900));
        assert_eq!(config.key_cache_ttl, Duration::from_secs(30));
        assert_eq!(config.state_file_name, "verification-state.json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        let strict = VerificationConfig::strict();
        assert!(!strict.allow_legacy_mac);
        assert_eq!(strict.supported_algorithms().macs.len(), 1);
        assert!(!VerificationConfig::testing().bootstrap_on_start);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = VerificationConfig {
            max_concurrent_sessions: 0,
            ..VerificationConfig::default()
        };
        assert!(config.validate().is_err());

        let config = VerificationConfig {
            session_timeout: Duration::ZERO,
            ..VerificationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: VerificationConfig =
            serde_json::from_str(r#"{"session_timeout": 60, "allow_legacy_mac": false}"#).unwrap();
        assert_eq!(config.session_timeout, Duration::from_secs(60));
        assert!(!config.allow_legacy_mac);
        assert_eq!(config.max_concurrent_sessions, 16);
    }
}
