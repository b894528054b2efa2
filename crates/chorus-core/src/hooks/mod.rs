//! Event hooks: registration and dispatch.
//!
//! Listeners are registered per event name together with the [`Scope`]
//! they apply to and the fork that owns them. Dispatch takes a snapshot
//! of the matching listeners and runs them in one of several modes:
//!
//! | Mode | Order | Result |
//! |------|-------|--------|
//! | [`emit`](Dispatcher::emit) | registration | none, fire-and-forget |
//! | [`parallel`](Dispatcher::parallel) | concurrent | per-listener report |
//! | [`bail`](Dispatcher::bail) | sequential | first non-null, non-false value |
//! | [`waterfall`](Dispatcher::waterfall) | sequential | accumulator |
//! | [`chain`](Dispatcher::chain) | sequential, sync only | accumulator |
//!
//! Prepended listeners always run before appended ones; within each
//! class, registration order is kept.
//!
//! [`Scope`]: crate::scope::Scope

mod dispatch;
mod listener;
mod registry;

pub use dispatch::{Dispatcher, ListenerOutcome, ParallelReport, is_truthy};
pub use listener::{EventArgs, HookResult, Listener, ListenerFuture};
pub(crate) use listener::{panic_error, panic_message};
pub use registry::{HookEntry, HookId, HookLimits, HookOwner, HookRegistry};
