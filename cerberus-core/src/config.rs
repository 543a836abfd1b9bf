//! Security configuration.
//!
//! Compiled-in defaults can be overridden by a JSON document shipped with
//! the board configuration or the emulator profile.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Smallest accepted auto-lock delay.
pub const MIN_LOCK_DELAY_MS: u32 = 10_000;
/// Largest accepted auto-lock delay.
pub const MAX_LOCK_DELAY_MS: u32 = 536_870_911;
/// Auto-lock delay used when none is configured.
pub const DEFAULT_LOCK_DELAY_MS: u32 = 600_000;

/// What happens once the PIN attempt limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WipePolicy {
    /// Wipe storage as soon as the limit is reached.
    #[default]
    Immediate,
    /// Refuse every further attempt until the wipe is confirmed.
    RequireConfirmation,
}

/// Tunables of the security core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    /// Product directory name on removable media.
    pub product: String,
    /// Auto-lock delay used until the user picks one.
    pub default_lock_delay_ms: u32,
    /// Failed PIN attempts allowed before the wipe policy applies.
    pub max_pin_attempts: u32,
    /// PBKDF2 iterations for newly sealed key envelopes.
    pub pin_kdf_iterations: u32,
    /// Behaviour once the attempt limit is reached.
    pub wipe_policy: WipePolicy,
    /// Interval between attestation progress frames.
    pub progress_frame_ms: u64,
    /// Granularity of the PIN backoff wait.
    pub backoff_poll_ms: u64,
    /// Secure element slot holding the attestation key.
    pub attestation_key_slot: u8,
    /// Secure element slot holding the certificate chain.
    pub attestation_cert_slot: u8,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            product: "cerberus".to_string(),
            default_lock_delay_ms: DEFAULT_LOCK_DELAY_MS,
            max_pin_attempts: 16,
            pin_kdf_iterations: 20_000,
            wipe_policy: WipePolicy::Immediate,
            progress_frame_ms: 60,
            backoff_poll_ms: 100,
            attestation_key_slot: 0,
            attestation_cert_slot: 0,
        }
    }
}

impl SecurityConfig {
    /// Parses and validates a JSON configuration. Missing fields take their
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ProcessError`] if the document does not parse or
    /// a value is out of range.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| CoreError::process(format!("invalid configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ProcessError`] naming the first bad field.
    pub fn validate(&self) -> CoreResult<()> {
        if self.product.is_empty()
            || !self
                .product
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CoreError::process("product must be a plain directory name"));
        }
        if !(MIN_LOCK_DELAY_MS..=MAX_LOCK_DELAY_MS).contains(&self.default_lock_delay_ms) {
            return Err(CoreError::process("default_lock_delay_ms out of range"));
        }
        // The backoff is 2^n - 1 seconds; keep n within a u32 shift.
        if !(1..=32).contains(&self.max_pin_attempts) {
            return Err(CoreError::process("max_pin_attempts must be in 1..=32"));
        }
        if self.pin_kdf_iterations == 0 {
            return Err(CoreError::process("pin_kdf_iterations must be positive"));
        }
        if self.backoff_poll_ms == 0 {
            return Err(CoreError::process("backoff_poll_ms must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SecurityConfig::default();
        config.validate().expect("valid");
        assert_eq!(config.default_lock_delay_ms, 600_000);
        assert_eq!(config.max_pin_attempts, 16);
        assert_eq!(config.wipe_policy, WipePolicy::Immediate);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = SecurityConfig::from_json(
            r#"{ "max_pin_attempts": 5, "wipe_policy": "require_confirmation" }"#,
        )
        .expect("parse");
        assert_eq!(config.max_pin_attempts, 5);
        assert_eq!(config.wipe_policy, WipePolicy::RequireConfirmation);
        assert_eq!(config.product, "cerberus");
    }

    #[test]
    fn test_rejects_unknown_fields() {
        assert!(matches!(
            SecurityConfig::from_json(r#"{ "autolock": 1 }"#),
            Err(CoreError::ProcessError(_))
        ));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        for json in [
            r#"{ "default_lock_delay_ms": 9999 }"#,
            r#"{ "default_lock_delay_ms": 536870912 }"#,
            r#"{ "max_pin_attempts": 0 }"#,
            r#"{ "max_pin_attempts": 33 }"#,
            r#"{ "pin_kdf_iterations": 0 }"#,
            r#"{ "product": "../etc" }"#,
        ] {
            match SecurityConfig::from_json(json) {
                Err(CoreError::ProcessError(_)) => {}
                Err(err) => panic!("unexpected error for {json}: {err}"),
                Ok(_) => panic!("expected error for {json}"),
            }
        }
    }
}
