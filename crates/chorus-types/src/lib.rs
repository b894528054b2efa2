//! # chorus-types
//!
//! Core type definitions for the chorus chat-bot runtime.
//!
//! This crate is the foundation of the dependency graph -- every other
//! chorus crate depends on it. It contains:
//!
//! - **[`error`]** -- [`RuntimeError`], [`HookError`] and [`AdapterError`]
//! - **[`config`]** -- [`RuntimeConfig`], the runtime's tunable limits
//! - **[`session`]** -- the normalized inbound [`Session`] value

pub mod config;
pub mod error;
pub mod session;

pub use config::RuntimeConfig;
pub use error::{AdapterError, HookError, Result, RuntimeError};
pub use session::{Session, SessionKind};
