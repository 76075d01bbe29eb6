//! Core tunables for discovery and sessions.

use std::time::Duration;

use crate::protocol::DEFAULT_SERVICE_TYPE;

/// Default invitation window before `connect` gives up.
pub const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default length of a discovery burst after a shake.
pub const DEFAULT_BURST_DURATION: Duration = Duration::from_secs(4);
/// Disconnected records older than this are evicted.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);

const MAX_SERVICE_TYPE_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Token identifying the protocol to the discovery layer.
    pub service_type: String,
    pub invite_timeout: Duration,
    pub burst_duration: Duration,
    pub disconnect_timeout: Duration,
    pub housekeeping_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            invite_timeout: DEFAULT_INVITE_TIMEOUT,
            burst_duration: DEFAULT_BURST_DURATION,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            housekeeping_interval: DEFAULT_HOUSEKEEPING_INTERVAL,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_service_type(&self.service_type)?;
        if self.invite_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("invite_timeout"));
        }
        if self.housekeeping_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("housekeeping_interval"));
        }
        Ok(())
    }
}

/// 1-15 chars of lowercase ASCII letters, digits or '-', not starting or ending with '-'.
pub fn validate_service_type(s: &str) -> Result<(), ConfigError> {
    if s.is_empty() || s.len() > MAX_SERVICE_TYPE_LEN {
        return Err(ConfigError::ServiceTypeLength(s.len()));
    }
    let valid_chars = s
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if !valid_chars || s.starts_with('-') || s.ends_with('-') {
        return Err(ConfigError::ServiceTypeChars(s.to_string()));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("service type must be 1-15 characters, got {0}")]
    ServiceTypeLength(usize),
    #[error("service type {0:?} may only use a-z, 0-9 and inner hyphens")]
    ServiceTypeChars(String),
    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),
}
