//! Scoped plugin runtime for chorus.
//!
//! Plugins are installed into a [`Runtime`] as *forks*. Each fork gets a
//! [`Context`] through which it registers event listeners, middleware,
//! timers and services; all of them are owned by the fork and released
//! when it is torn down, recursively for everything it installed.
//!
//! # Architecture
//!
//! ```text
//! Adapter ──deliver(session)──> Runtime
//!                                  │
//!               ┌──────────────────┴──────────────────┐
//!        Dispatcher.parallel(event)          MiddlewareChain.run
//!               │                                     │
//!     HookRegistry<Listener>               HookRegistry<Middleware>
//!               └──────── filtered by Scope ──────────┘
//!
//! Context.plugin() ──> PluginGraph (fork) ──gated by──> ServiceContainer
//! ```
//!
//! # Error handling
//!
//! Configuration and lifecycle calls return
//! [`RuntimeError`](chorus_types::error::RuntimeError). Listener failures
//! are [`HookError`](chorus_types::error::HookError)s, caught at the
//! dispatch boundary and logged with the owning plugin's name.

pub mod context;
pub mod disposable;
pub mod fork;
pub mod hooks;
pub mod middleware;
pub mod plugin;
pub mod runtime;
pub mod scope;
pub mod services;
pub mod timer;

pub use context::Context;
pub use disposable::{Disposable, DisposeFn, HookHandle, ListenerHandle, MiddlewareHandle};
pub use fork::{ForkId, ForkState, PluginGraph};
pub use hooks::{
    Dispatcher, EventArgs, HookEntry, HookId, HookOwner, HookRegistry, HookResult, Listener,
    ListenerOutcome, ParallelReport, is_truthy,
};
pub use middleware::{MIDDLEWARE_EVENT, Middleware, MiddlewareChain, Next};
pub use plugin::{Plugin, PluginFn};
pub use runtime::{Runtime, RuntimeId};
pub use scope::Scope;
pub use services::{Dependents, ProviderToken, ServiceContainer, ServiceHandle};
pub use timer::TimerHandle;

// Re-export the shared types so plugin crates only need this one.
pub use chorus_types::{HookError, RuntimeConfig, RuntimeError, Session, SessionKind};
