//! Error types for the chorus runtime.
//!
//! Provides [`RuntimeError`] for configuration and lifecycle failures,
//! [`HookError`] for failures raised by listeners and middleware, and
//! [`AdapterError`] for the platform adapter seam. All are non-exhaustive
//! to allow future extension without breaking downstream.

use thiserror::Error;

/// Configuration and lifecycle errors.
///
/// These are surfaced synchronously at the call that caused them. None of
/// them is fatal to the process; the worst case is that one plugin does
/// not get installed.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RuntimeError {
    // ── Configuration ────────────────────────────────────────────────

    /// An event name was empty or otherwise unusable.
    #[error("invalid event name: {0:?}")]
    InvalidEventName(String),

    /// A service name was empty or contained whitespace.
    #[error("invalid service name: {0:?}")]
    InvalidServiceName(String),

    /// Runtime configuration is malformed or semantically invalid.
    #[error("invalid config: {reason}")]
    ConfigInvalid {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// TOML configuration could not be parsed.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON configuration could not be parsed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // ── Lifecycle ────────────────────────────────────────────────────

    /// The referenced fork does not exist in this runtime.
    #[error("fork not found: {0}")]
    ForkNotFound(u64),

    /// The referenced fork has already been disposed.
    #[error("fork {0} is disposed")]
    ForkDisposed(u64),

    /// The referenced fork is waiting for services and cannot own
    /// resources right now.
    #[error("fork {0} is not active")]
    ForkInactive(u64),

    /// A plugin's setup callback failed.
    #[error("plugin {plugin} failed to start: {reason}")]
    PluginSetup {
        /// Name of the plugin whose setup failed.
        plugin: String,
        /// Failure reported by the setup callback.
        reason: String,
    },

    /// An operation needed a tokio runtime but none was running.
    #[error("no async runtime available for {operation}")]
    NoAsyncRuntime {
        /// What was being attempted.
        operation: String,
    },
}

/// Failures raised by a single listener or middleware step.
///
/// A `HookError` only ever affects the dispatch it happened in: the
/// owning fork stays active for future dispatches.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HookError {
    /// The listener returned an error.
    #[error("listener failed: {0}")]
    Failed(String),

    /// The listener panicked; the panic was caught at the dispatch boundary.
    #[error("listener panicked: {0}")]
    Panicked(String),

    /// An asynchronous listener was reached by a synchronous dispatch.
    #[error("listener for {event:?} is asynchronous and cannot run in a synchronous dispatch")]
    NotSynchronous {
        /// The event being dispatched.
        event: String,
    },

    /// The middleware continuation depth limit was exceeded.
    #[error("middleware depth limit of {limit} exceeded")]
    DepthExceeded {
        /// The configured limit.
        limit: usize,
    },
}

impl HookError {
    /// Build a [`HookError::Failed`] from anything printable.
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        Self::Failed(msg.to_string())
    }
}

/// Errors on the adapter seam.
///
/// Used by platform adapters (and the host that manages them) to report
/// failures in building, starting, or talking to a platform.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AdapterError {
    /// No adapter or factory is registered under this platform name.
    #[error("adapter not found: {0}")]
    NotFound(String),

    /// The adapter could not be built from its configuration.
    #[error("adapter config invalid: {0}")]
    ConfigInvalid(String),

    /// A delivered session was missing required identity fields.
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// Sending a message failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The adapter is not currently connected.
    #[error("not connected")]
    NotConnected,

    /// A runtime error bubbled up while delivering a session.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The middleware chain failed while handling a delivered session.
    #[error(transparent)]
    Hook(#[from] HookError),

    /// Catch-all for errors that do not fit other variants.
    #[error("{0}")]
    Other(String),
}

/// Convenience alias for results in the runtime.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_error_display() {
        let err = RuntimeError::InvalidEventName(String::new());
        assert_eq!(err.to_string(), "invalid event name: \"\"");

        let err = RuntimeError::InvalidServiceName("data base".into());
        assert_eq!(err.to_string(), "invalid service name: \"data base\"");

        let err = RuntimeError::ForkNotFound(7);
        assert_eq!(err.to_string(), "fork not found: 7");

        let err = RuntimeError::ForkInactive(2);
        assert_eq!(err.to_string(), "fork 2 is not active");

        let err = RuntimeError::PluginSetup {
            plugin: "echo".into(),
            reason: "boom".into(),
        };
        assert_eq!(err.to_string(), "plugin echo failed to start: boom");
    }

    #[test]
    fn hook_error_display() {
        assert_eq!(
            HookError::failed("bad input").to_string(),
            "listener failed: bad input"
        );
        assert_eq!(
            HookError::DepthExceeded { limit: 64 }.to_string(),
            "middleware depth limit of 64 exceeded"
        );
        assert!(
            HookError::NotSynchronous {
                event: "message".into()
            }
            .to_string()
            .contains("\"message\"")
        );
    }

    #[test]
    fn runtime_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{{bad}}").unwrap_err();
        let err: RuntimeError = json_err.into();
        assert!(matches!(err, RuntimeError::Json(_)));
    }

    #[test]
    fn adapter_error_wraps_runtime_error() {
        let err: AdapterError = RuntimeError::ForkDisposed(3).into();
        assert!(matches!(err, AdapterError::Runtime(_)));
        assert_eq!(err.to_string(), "fork 3 is disposed");
    }
}
