//! Platform adapter seam for chorus.
//!
//! A platform integration (Telegram, Discord, QQ...) implements the
//! [`Adapter`] trait and is registered via an [`AdapterFactory`]. The
//! [`AdapterManager`] builds adapters from JSON config, runs each one in
//! its own task, and publishes every adapter's [`Bot`] to a runtime as
//! the service `bot:<platform>`.
//!
//! # Architecture
//!
//! ```text
//! AdapterFactory ──build()──> Arc<dyn Adapter>
//!                                  │
//!                     AdapterManager.init_adapter()
//!                                  │
//!                     AdapterManager.start_adapter()
//!                           │              │
//!                   CancellationToken   Arc<dyn AdapterHost>  (a Runtime)
//!                           │              │
//!                     Adapter::start(host, cancel)
//!                                  │
//!                        host.deliver(session)
//! ```
//!
//! # Error handling
//!
//! Adapter operations return
//! [`AdapterError`](chorus_types::error::AdapterError), re-exported here.

pub mod host;
pub mod traits;

pub use host::AdapterManager;
pub use traits::*;

pub use chorus_types::error::AdapterError;
