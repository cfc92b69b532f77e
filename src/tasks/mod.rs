pub mod gc;
pub mod monitor;

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::Result;

// Re-export common types
pub use gc::GarbageCollector;
pub use monitor::{AggregationResult, Monitor};

/// One tick of work, boxed so tasks can be built from closures
pub type TickFuture = BoxFuture<'static, Result<()>>;

/// When the first tick of a periodic task fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstTick {
    Immediately,
    AfterInterval,
}

/// A background loop running one tick per interval.
///
/// The next sleep only starts once the previous tick has finished, so ticks of
/// the same task never overlap. Stopping cancels the pending sleep; a tick that
/// is already running is left to complete.
pub struct PeriodicTask {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &'static str, interval: Duration, first_tick: FirstTick, mut tick: F) -> Self
    where
        F: FnMut() -> TickFuture + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut wait = first_tick == FirstTick::AfterInterval;
            loop {
                if wait {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = stop_rx.changed() => break,
                    }
                }
                wait = true;

                if *stop_rx.borrow() {
                    break;
                }

                // a failed tick never ends the loop
                if let Err(e) = tick().await {
                    error!("{} tick failed: {}", name, e);
                }
            }
            debug!("{} stopped", name);
        });

        debug!("{} scheduled every {:?}", name, interval);
        Self { name, stop_tx, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Cancel the pending tick
    pub fn stop(&self) {
        // the loop may already be gone, nothing to cancel then
        let _ = self.stop_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to exit, including a tick that was in flight at `stop`
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!("{} ended abnormally: {}", self.name, e);
        }
    }
}
