//! Runtime configuration.
//!
//! [`RuntimeConfig`] holds the few knobs the plugin runtime exposes. It
//! accepts both `snake_case` and `camelCase` field names via
//! `#[serde(alias)]`, and can be read from JSON or TOML.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Default soft limit for appended listeners per event.
pub const DEFAULT_MAX_LISTENERS: usize = 64;

/// Default soft limit for prepended listeners per event.
pub const DEFAULT_MAX_PREPENDED_LISTENERS: usize = 64;

/// Default middleware continuation depth.
pub const DEFAULT_MAX_MIDDLEWARE_DEPTH: usize = 64;

/// Tunable limits for a chorus runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Soft limit for appended listeners per event name.
    ///
    /// Exceeding it logs a warning; see [`trim_on_overflow`](Self::trim_on_overflow).
    #[serde(default = "default_max_listeners", alias = "maxListeners")]
    pub max_listeners: usize,

    /// Soft limit for prepended listeners per event name.
    #[serde(
        default = "default_max_prepended_listeners",
        alias = "maxPrependedListeners"
    )]
    pub max_prepended_listeners: usize,

    /// When set, the oldest appended listener is removed once the soft
    /// limit is exceeded instead of only warning.
    #[serde(default, alias = "trimOnOverflow")]
    pub trim_on_overflow: bool,

    /// Maximum number of middleware steps a single dispatch may run.
    #[serde(
        default = "default_max_middleware_depth",
        alias = "maxMiddlewareDepth"
    )]
    pub max_middleware_depth: usize,
}

fn default_max_listeners() -> usize {
    DEFAULT_MAX_LISTENERS
}

fn default_max_prepended_listeners() -> usize {
    DEFAULT_MAX_PREPENDED_LISTENERS
}

fn default_max_middleware_depth() -> usize {
    DEFAULT_MAX_MIDDLEWARE_DEPTH
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_listeners: default_max_listeners(),
            max_prepended_listeners: default_max_prepended_listeners(),
            trim_on_overflow: false,
            max_middleware_depth: default_max_middleware_depth(),
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a config from a JSON string.
    pub fn from_json_str(input: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a config from a TOML string.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would make the runtime unusable.
    pub fn validate(&self) -> Result<()> {
        if self.max_listeners == 0 {
            return Err(RuntimeError::ConfigInvalid {
                reason: "max_listeners must be at least 1".into(),
            });
        }
        if self.max_prepended_listeners == 0 {
            return Err(RuntimeError::ConfigInvalid {
                reason: "max_prepended_listeners must be at least 1".into(),
            });
        }
        if self.max_middleware_depth == 0 {
            return Err(RuntimeError::ConfigInvalid {
                reason: "max_middleware_depth must be at least 1".into(),
            });
        }
        Ok(())
    }
}
