//! Rekey and reject thresholds.
//!
//! The defaults are the protocol's advisory values. All of them can be
//! overridden through configuration, which the tests use to exercise rekey
//! paths without sending 2^60 packets.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CoreError;

pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const COOKIE_REFRESH_TIME: Duration = Duration::from_secs(120);
pub const HANDSHAKE_INITIATION_RATE: Duration = Duration::from_millis(50);

/// Session lifetime policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RekeyConfig {
    /// Start a new handshake once this many packets were sent on a keypair.
    pub rekey_after_messages: u64,
    /// Never encrypt or decrypt with a counter at or past this value.
    pub reject_after_messages: u64,
    pub rekey_after_time_secs: u64,
    pub reject_after_time_secs: u64,
    /// Give up on a handshake attempt after this long.
    pub rekey_attempt_time_secs: u64,
    /// Retransmit an unanswered initiation after this long.
    pub rekey_timeout_secs: u64,
    pub keepalive_timeout_secs: u64,
    pub cookie_refresh_time_secs: u64,
    /// Minimum spacing between initiations accepted from one peer.
    pub handshake_initiation_rate_ms: u64,
}

impl Default for RekeyConfig {
    fn default() -> Self {
        Self {
            rekey_after_messages: REKEY_AFTER_MESSAGES,
            reject_after_messages: REJECT_AFTER_MESSAGES,
            rekey_after_time_secs: REKEY_AFTER_TIME.as_secs(),
            reject_after_time_secs: REJECT_AFTER_TIME.as_secs(),
            rekey_attempt_time_secs: REKEY_ATTEMPT_TIME.as_secs(),
            rekey_timeout_secs: REKEY_TIMEOUT.as_secs(),
            keepalive_timeout_secs: KEEPALIVE_TIMEOUT.as_secs(),
            cookie_refresh_time_secs: COOKIE_REFRESH_TIME.as_secs(),
            handshake_initiation_rate_ms: HANDSHAKE_INITIATION_RATE.as_millis() as u64,
        }
    }
}

impl RekeyConfig {
    pub fn rekey_after_time(&self) -> Duration {
        Duration::from_secs(self.rekey_after_time_secs)
    }

    pub fn reject_after_time(&self) -> Duration {
        Duration::from_secs(self.reject_after_time_secs)
    }

    pub fn rekey_attempt_time(&self) -> Duration {
        Duration::from_secs(self.rekey_attempt_time_secs)
    }

    pub fn rekey_timeout(&self) -> Duration {
        Duration::from_secs(self.rekey_timeout_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn cookie_refresh_time(&self) -> Duration {
        Duration::from_secs(self.cookie_refresh_time_secs)
    }

    pub fn handshake_initiation_rate(&self) -> Duration {
        Duration::from_millis(self.handshake_initiation_rate_ms)
    }

    /// Check that every rekey threshold fires before its reject threshold.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.rekey_after_messages >= self.reject_after_messages {
            return Err(CoreError::InvalidConfig(format!(
                "rekey_after_messages ({}) must be below reject_after_messages ({})",
                self.rekey_after_messages, self.reject_after_messages
            )));
        }
        if self.rekey_after_time_secs >= self.reject_after_time_secs {
            return Err(CoreError::InvalidConfig(format!(
                "rekey_after_time_secs ({}) must be below reject_after_time_secs ({})",
                self.rekey_after_time_secs, self.reject_after_time_secs
            )));
        }
        if self.rekey_timeout_secs == 0 {
            return Err(CoreError::InvalidConfig(
                "rekey_timeout_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RekeyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reject_after_messages, u64::MAX - 8192);
        assert_eq!(config.handshake_initiation_rate(), Duration::from_millis(50));
    }

    #[test]
    fn test_partial_override() {
        let config: RekeyConfig =
            serde_json::from_str(r#"{ "rekey_after_messages": 10 }"#).unwrap();
        assert_eq!(config.rekey_after_messages, 10);
        assert_eq!(config.reject_after_time(), REJECT_AFTER_TIME);
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let config = RekeyConfig {
            rekey_after_time_secs: 200,
            ..RekeyConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfig(msg)) if msg.contains("rekey_after_time_secs")
        ));

        let config = RekeyConfig {
            rekey_timeout_secs: 0,
            ..RekeyConfig::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::InvalidConfig(_))));
    }
}
