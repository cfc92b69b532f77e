use std::sync::Arc;
use std::time::Duration;

use mongodb::bson::doc;
use tracing::{debug, info};

use crate::cli::config::GcSettings;
use crate::error::Result;
use crate::queue::engine::count_progress;
use crate::queue::item::QueueItemStatus;
use crate::storage::DocumentCollection;
use crate::tasks::{FirstTick, PeriodicTask, TickFuture};
use crate::utils::now_millis;

/// Returns items abandoned by crashed workers to the queue.
///
/// An item that is neither fetched nor queued and has not been written for
/// longer than `stale_after` is assumed to belong to a worker that died, and
/// is reset to `queued` so another worker can claim it.
pub struct GarbageCollector {
    collection: Arc<dyn DocumentCollection>,
    interval: Duration,
    stale_after: Duration,
    task: Option<PeriodicTask>,
}

impl GarbageCollector {
    /// Collector whose staleness threshold equals its interval
    pub fn new(collection: Arc<dyn DocumentCollection>, interval: Duration) -> Self {
        Self {
            collection,
            interval,
            stale_after: interval,
            task: None,
        }
    }

    pub fn from_settings(collection: Arc<dyn DocumentCollection>, settings: &GcSettings) -> Self {
        let collector = Self::new(collection, Duration::from_millis(settings.interval_ms));
        match settings.stale_after_ms {
            Some(ms) => collector.with_stale_after(Duration::from_millis(ms)),
            None => collector,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Run one sweep as of `now` (epoch millis); returns how many items were requeued
    pub async fn collect(&self, now: i64) -> Result<u64> {
        sweep(self.collection.as_ref(), self.stale_after, now).await
    }

    /// Start sweeping every interval, the first sweep one interval from now
    pub fn start(&mut self) {
        if self.is_running() {
            debug!("Garbage collector already running");
            return;
        }

        let collection = self.collection.clone();
        let stale_after = self.stale_after;
        self.task = Some(PeriodicTask::spawn(
            "garbage collector",
            self.interval,
            FirstTick::AfterInterval,
            move || -> TickFuture {
                let collection = collection.clone();
                Box::pin(async move {
                    sweep(collection.as_ref(), stale_after, now_millis()).await?;
                    Ok(())
                })
            },
        ));
        info!(
            "Garbage collector started (interval {:?}, stale after {:?})",
            self.interval, self.stale_after
        );
    }

    /// Cancel the pending sweep; a sweep already running is left to finish
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop();
            info!("Garbage collector stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Sweep every interval until the queue has been fully fetched for
    /// `idle_ticks` consecutive ticks. Returns the number of ticks run.
    pub async fn run_until_idle(&self, idle_ticks: u32) -> Result<u32> {
        let idle_ticks = idle_ticks.max(1);
        let mut ticks = 0;
        let mut idle = 0;

        loop {
            let (total, fetched) = count_progress(self.collection.as_ref()).await?;
            self.collect(now_millis()).await?;
            ticks += 1;

            idle = if total == fetched { idle + 1 } else { 0 };
            if idle >= idle_ticks {
                info!("Queue idle for {} ticks, garbage collector done", idle);
                return Ok(ticks);
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweep(collection: &dyn DocumentCollection, stale_after: Duration, now: i64) -> Result<u64> {
    let cutoff = now - i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);

    let filter = doc! {
        "$and": [
            { "fetched": { "$ne": true } },
            { "status": { "$ne": QueueItemStatus::Queued.as_str() } },
            { "modificationTimestamp": { "$lt": cutoff } },
        ]
    };
    let update = doc! {
        "$set": {
            "status": QueueItemStatus::Queued.as_str(),
            "modificationTimestamp": now,
        }
    };

    let outcome = collection.update_many(filter, update).await?;
    if outcome.modified_count > 0 {
        info!("Requeued {} stale items", outcome.modified_count);
    } else {
        debug!("No stale items to requeue");
    }
    Ok(outcome.modified_count)
}
