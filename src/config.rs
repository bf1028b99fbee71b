//! Bridge configuration types and defaults.
//!
//! This module defines the configuration options for the bridge, including
//! the application session port, link and call timeouts, and loop checks.

use serde::{Deserialize, Serialize};

/// Session port the application binds and auto-accepts on
pub const DEFAULT_APP_PORT: u16 = 2;

/// Default bus link timeout in seconds
pub const DEFAULT_LINK_TIMEOUT_SECS: u32 = 120;

/// Smallest link timeout the bus accepts, in seconds
pub const MIN_LINK_TIMEOUT_SECS: u32 = 40;

/// Default method call timeout in milliseconds
pub const DEFAULT_CALL_TIMEOUT_MS: u32 = 10_000;

/// Default time-to-live for sessionless signals in seconds
pub const DEFAULT_SESSIONLESS_TTL_SECS: u16 = 30;

/// Default idle wait before any timers are registered
pub const DEFAULT_MAX_WAIT_MS: u32 = 0x7FFF_FFFF;

/// Default cap on method calls awaiting a script reply
pub const DEFAULT_MAX_PENDING_REPLY_CONTEXTS: usize = 64;

/// Configuration for the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Application session port (default: 2)
    #[serde(default = "default_app_port")]
    pub app_port: u16,

    /// Bus link timeout in seconds, 0 disables link probing (default: 120)
    #[serde(default = "default_link_timeout")]
    pub link_timeout_secs: u32,

    /// Timeout for method calls that do not specify one (default: 10s)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u32,

    /// TTL applied to sessionless signals that do not specify one
    #[serde(default = "default_sessionless_ttl")]
    pub sessionless_ttl_secs: u16,

    /// Maximum idle wait for the next message
    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u32,

    /// Maximum number of received method calls awaiting a script reply
    #[serde(default = "default_max_pending_reply_contexts")]
    pub max_pending_reply_contexts: usize,

    /// Verify the script stack is balanced after every loop iteration
    #[serde(default = "default_true")]
    pub check_stack_balance: bool,

    /// Device name used to seed the property store
    #[serde(default)]
    pub device_name: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            app_port: DEFAULT_APP_PORT,
            link_timeout_secs: DEFAULT_LINK_TIMEOUT_SECS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            sessionless_ttl_secs: DEFAULT_SESSIONLESS_TTL_SECS,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
            max_pending_reply_contexts: DEFAULT_MAX_PENDING_REPLY_CONTEXTS,
            check_stack_balance: true,
            device_name: None,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application port
    pub fn with_app_port(mut self, port: u16) -> Self {
        self.app_port = port;
        self
    }

    /// Set the link timeout
    pub fn with_link_timeout(mut self, secs: u32) -> Self {
        self.link_timeout_secs = secs;
        self
    }

    /// Set the default method call timeout
    pub fn with_call_timeout(mut self, ms: u32) -> Self {
        self.call_timeout_ms = ms;
        self
    }

    /// Set the default sessionless signal TTL
    pub fn with_sessionless_ttl(mut self, secs: u16) -> Self {
        self.sessionless_ttl_secs = secs;
        self
    }

    /// Set the maximum idle wait
    pub fn with_max_wait(mut self, ms: u32) -> Self {
        self.max_wait_ms = ms;
        self
    }

    /// Set the pending reply context cap
    pub fn with_max_pending_reply_contexts(mut self, max: usize) -> Self {
        self.max_pending_reply_contexts = max;
        self
    }

    /// Enable or disable the per-iteration stack check
    pub fn with_stack_check(mut self, enable: bool) -> Self {
        self.check_stack_balance = enable;
        self
    }

    /// Set the device name
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    /// Load a configuration from JSON text
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "app_port".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.link_timeout_secs != 0 && self.link_timeout_secs < MIN_LINK_TIMEOUT_SECS {
            return Err(ConfigError::InvalidValue {
                field: "link_timeout_secs".into(),
                reason: format!("must be 0 or at least {}", MIN_LINK_TIMEOUT_SECS),
            });
        }

        if self.max_pending_reply_contexts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_pending_reply_contexts".into(),
                reason: "must be greater than 0".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_app_port() -> u16 {
    DEFAULT_APP_PORT
}

fn default_link_timeout() -> u32 {
    DEFAULT_LINK_TIMEOUT_SECS
}

fn default_call_timeout() -> u32 {
    DEFAULT_CALL_TIMEOUT_MS
}

fn default_sessionless_ttl() -> u16 {
    DEFAULT_SESSIONLESS_TTL_SECS
}

fn default_max_wait() -> u32 {
    DEFAULT_MAX_WAIT_MS
}

fn default_max_pending_reply_contexts() -> usize {
    DEFAULT_MAX_PENDING_REPLY_CONTEXTS
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.app_port, DEFAULT_APP_PORT);
        assert_eq!(config.link_timeout_secs, DEFAULT_LINK_TIMEOUT_SECS);
        assert!(config.check_stack_balance);
        assert!(config.device_name.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = BridgeConfig::new()
            .with_app_port(7)
            .with_call_timeout(500)
            .with_device_name("lamp");

        assert_eq!(config.app_port, 7);
        assert_eq!(config.call_timeout_ms, 500);
        assert_eq!(config.device_name.as_deref(), Some("lamp"));
    }

    #[test]
    fn test_config_validation() {
        assert!(BridgeConfig::new().with_app_port(0).validate().is_err());
        assert!(BridgeConfig::new().with_link_timeout(10).validate().is_err());
        assert!(BridgeConfig::new().with_link_timeout(0).validate().is_ok());
        assert!(BridgeConfig::new()
            .with_max_pending_reply_contexts(0)
            .validate()
            .is_err());
        assert!(BridgeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_from_json_applies_defaults() {
        let config = BridgeConfig::from_json(r#"{"appPort": 5}"#).unwrap();
        assert_eq!(config.app_port, 5);
        assert_eq!(config.call_timeout_ms, DEFAULT_CALL_TIMEOUT_MS);
        assert_eq!(config.sessionless_ttl_secs, DEFAULT_SESSIONLESS_TTL_SECS);
    }

    #[test]
    fn test_config_serialization() {
        let config = BridgeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: BridgeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.app_port, config.app_port);
        assert_eq!(parsed.max_wait_ms, config.max_wait_ms);
    }
}
