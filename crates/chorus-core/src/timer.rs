//! Fork-owned timers.
//!
//! Timers run as tokio tasks raced against a [`CancellationToken`]. The
//! token is the disposable: tearing the owning fork down cancels the
//! timer, and a timer that already fired cancels as a no-op. Each task
//! runs a completion callback once it is done, fired or cancelled, which
//! the owning context uses to drop the timer from its fork.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use chorus_types::error::{Result, RuntimeError};

use crate::disposable::Disposable;

/// Handle to a running timeout or interval.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
    label: &'static str,
}

impl TimerHandle {
    pub(crate) fn new(label: &'static str) -> Self {
        Self {
            token: CancellationToken::new(),
            label,
        }
    }

    /// Stop the timer. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the timer was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Disposable for TimerHandle {
    fn describe(&self) -> String {
        self.label.to_string()
    }

    fn dispose(self: Box<Self>) -> Result<()> {
        self.cancel();
        Ok(())
    }
}

fn current_handle(operation: &str) -> Result<Handle> {
    Handle::try_current().map_err(|_| RuntimeError::NoAsyncRuntime {
        operation: operation.to_string(),
    })
}

/// Run `task` once after `delay`, unless cancelled first.
pub fn set_timeout<F>(delay: Duration, task: F) -> Result<TimerHandle>
where
    F: Future<Output = ()> + Send + 'static,
{
    let timer = TimerHandle::new("timeout");
    timer.start_timeout(delay, task, || {})?;
    Ok(timer)
}

/// Run `tick` every `period` until cancelled. The first run happens one
/// full period after the call.
///
/// A panicking tick is logged and the interval keeps running.
pub fn set_interval<F, Fut>(period: Duration, tick: F) -> Result<TimerHandle>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let timer = TimerHandle::new("interval");
    timer.start_interval(period, tick, || {})?;
    Ok(timer)
}

impl TimerHandle {
    pub(crate) fn start_timeout<F, D>(&self, delay: Duration, task: F, on_done: D) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        let handle = current_handle("set_timeout")?;
        let cancel = self.token.clone();

        handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(?delay, "timeout cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                        error!(?delay, "timeout task panicked");
                    }
                }
            }
            on_done();
        });
        Ok(())
    }

    pub(crate) fn start_interval<F, Fut, D>(
        &self,
        period: Duration,
        mut tick: F,
        on_done: D,
    ) -> Result<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        if period.is_zero() {
            return Err(RuntimeError::ConfigInvalid {
                reason: "interval period must be non-zero".into(),
            });
        }
        let handle = current_handle("set_interval")?;
        let cancel = self.token.clone();

        handle.spawn(async move {
            let mut timer = tokio::time::interval(period);
            // First tick fires immediately.
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(?period, "interval cancelled");
                        break;
                    }
                    _ = timer.tick() => {
                        let run = AssertUnwindSafe(async { tick().await }).catch_unwind();
                        if run.await.is_err() {
                            error!(?period, "interval tick panicked");
                        }
                    }
                }
            }
            on_done();
        });
        Ok(())
    }
}
