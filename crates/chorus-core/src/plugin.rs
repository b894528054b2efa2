//! Plugin definitions.
//!
//! A [`Plugin`] is a named setup function plus a few declarations the
//! runtime needs before calling it: whether it may be installed more
//! than once, and which services it requires or optionally uses.
//! [`PluginFn`] builds one from a closure.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use chorus_types::error::Result;

use crate::context::Context;

/// A unit of bot functionality.
///
/// `apply` registers hooks, middleware, timers and services through the
/// given [`Context`]; everything registered that way is owned by the
/// plugin's fork and released when the fork is torn down. `apply` may run
/// more than once for the same fork: every time a required service comes
/// back after disappearing.
pub trait Plugin: Send + Sync + 'static {
    /// Plugin name, used in logs and to detect duplicate installs.
    fn name(&self) -> &str;

    /// Set the plugin up inside `ctx`.
    fn apply(&self, ctx: &Context, config: &Value) -> Result<()>;

    /// Whether installing the plugin again under the same parent creates
    /// another independent instance (`true`) or reuses the existing one.
    fn forkable(&self) -> bool {
        false
    }

    /// Services that must be present before `apply` runs.
    fn required_services(&self) -> Vec<String> {
        Vec::new()
    }

    /// Services the plugin uses when present.
    fn optional_services(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether a change to an optional service re-runs `apply`.
    fn reload_on_optional_change(&self) -> bool {
        false
    }
}

type ApplyFn = dyn Fn(&Context, &Value) -> Result<()> + Send + Sync;

/// A [`Plugin`] built from a closure.
///
/// ```
/// use chorus_core::{Listener, PluginFn};
///
/// let plugin = PluginFn::new("greeter", |ctx, _config| {
///     ctx.on("member-joined", Listener::sync(|_| Ok("welcome".into())))?;
///     Ok(())
/// })
/// .requires("database");
/// # let _ = plugin;
/// ```
#[derive(Clone)]
pub struct PluginFn {
    name: String,
    apply: Arc<ApplyFn>,
    forkable: bool,
    required: Vec<String>,
    optional: Vec<String>,
    reload_on_optional_change: bool,
}

impl PluginFn {
    /// A non-forkable plugin without dependencies.
    pub fn new<F>(name: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&Context, &Value) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            apply: Arc::new(apply),
            forkable: false,
            required: Vec::new(),
            optional: Vec::new(),
            reload_on_optional_change: false,
        }
    }

    /// Allow multiple independent instances.
    pub fn forkable(mut self) -> Self {
        self.forkable = true;
        self
    }

    /// Require a service.
    pub fn requires(mut self, service: impl Into<String>) -> Self {
        self.required.push(service.into());
        self
    }

    /// Use a service when it is present.
    pub fn optional(mut self, service: impl Into<String>) -> Self {
        self.optional.push(service.into());
        self
    }

    /// Re-run setup when an optional service changes.
    pub fn reload_on_optional_change(mut self) -> Self {
        self.reload_on_optional_change = true;
        self
    }
}

impl Plugin for PluginFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, ctx: &Context, config: &Value) -> Result<()> {
        (self.apply)(ctx, config)
    }

    fn forkable(&self) -> bool {
        self.forkable
    }

    fn required_services(&self) -> Vec<String> {
        self.required.clone()
    }

    fn optional_services(&self) -> Vec<String> {
        self.optional.clone()
    }

    fn reload_on_optional_change(&self) -> bool {
        self.reload_on_optional_change
    }
}

impl fmt::Debug for PluginFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginFn")
            .field("name", &self.name)
            .field("forkable", &self.forkable)
            .field("required", &self.required)
            .field("optional", &self.optional)
            .finish()
    }
}
