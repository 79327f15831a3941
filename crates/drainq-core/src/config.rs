//! Run configuration, validated before any remote call is made.

use crate::error::{invalid, EngineError};
use std::fmt;
use std::time::Duration;

/// Messages requested per fetch when nothing else is configured.
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Upper bound on how long a destructive fetch waits for the first message.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5);

/// Longest accepted queue name, URLs excluded.
pub const MAX_QUEUE_NAME_LEN: usize = 80;

/// Batch sizing and wait settings shared by every run of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of messages requested per fetch
    pub batch_size: u32,
    /// Maximum time a destructive fetch blocks waiting for messages
    pub max_wait: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.batch_size == 0 {
            return Err(invalid("batch size must be at least 1"));
        }
        if self.max_wait.is_zero() {
            return Err(invalid("max wait must be greater than zero"));
        }
        Ok(())
    }
}

/// A queue name (or full queue URL) that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName(String);

impl QueueName {
    pub fn new<S: Into<String>>(name: S) -> Result<Self, EngineError> {
        let name = name.into();
        if name.is_empty() {
            return Err(invalid("queue name cannot be empty"));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(invalid(format!(
                "queue name cannot contain whitespace: '{name}'"
            )));
        }
        if Self::is_url(&name) {
            return Ok(Self(name));
        }
        if name.len() > MAX_QUEUE_NAME_LEN {
            return Err(invalid(format!(
                "queue name exceeds maximum length: {} > {MAX_QUEUE_NAME_LEN} characters",
                name.len()
            )));
        }
        for c in name.chars() {
            if !c.is_alphanumeric() && !matches!(c, '-' | '_' | '.') {
                return Err(invalid(format!(
                    "invalid character in queue name: '{c}'. Allowed: alphanumeric, '-', '_', '.'"
                )));
            }
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the name is already a fully qualified queue URL.
    pub fn is_url(name: &str) -> bool {
        name.starts_with("http://") || name.starts_with("https://")
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
