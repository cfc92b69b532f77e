use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use mongodb::bson::{self, doc, Bson, Document};
use serde::Serialize;
use tracing::{debug, info};

use crate::cli::config::MonitorSettings;
use crate::error::Result;
use crate::queue::engine::as_f64;
use crate::queue::item::{Aggregator, AllowedStatistic};
use crate::storage::{DocumentCollection, StoreError};
use crate::tasks::{FirstTick, PeriodicTask, TickFuture};
use crate::utils::now_millis;

/// One statistics snapshot as written to the statistics collection.
///
/// Metric fields are named `<statistic><Max|Min|Avg>`, e.g. `downloadTimeAvg`,
/// and status counts are keyed by the status name. Absent metrics and statuses
/// with no items are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationResult {
    #[serde(flatten)]
    pub metrics: BTreeMap<String, f64>,

    #[serde(flatten)]
    pub statuses: BTreeMap<String, u64>,

    pub total_count: u64,
    pub fetched_count: u64,

    /// Epoch millis when the snapshot started
    pub timestamp: i64,
    pub timestamp_finish: i64,
}

impl AggregationResult {
    pub fn metric(&self, statistic: AllowedStatistic, aggregator: Aggregator) -> Option<f64> {
        self.metrics.get(&metric_name(statistic, aggregator)).copied()
    }

    pub fn status_count(&self, status: &str) -> u64 {
        self.statuses.get(status).copied().unwrap_or(0)
    }

    /// Every item has been fetched
    pub fn is_idle(&self) -> bool {
        self.total_count == self.fetched_count
    }
}

fn metric_name(statistic: AllowedStatistic, aggregator: Aggregator) -> String {
    format!("{}{}", statistic.as_str(), aggregator.suffix())
}

/// Periodically records queue statistics into a separate collection
pub struct Monitor {
    queue: Arc<dyn DocumentCollection>,
    statistics: Arc<dyn DocumentCollection>,
    interval: Duration,
    task: Option<PeriodicTask>,
}

impl Monitor {
    pub fn new(
        queue: Arc<dyn DocumentCollection>,
        statistics: Arc<dyn DocumentCollection>,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            statistics,
            interval,
            task: None,
        }
    }

    pub fn from_settings(
        queue: Arc<dyn DocumentCollection>,
        statistics: Arc<dyn DocumentCollection>,
        settings: &MonitorSettings,
    ) -> Self {
        Self::new(queue, statistics, Duration::from_millis(settings.interval_ms))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Compute a snapshot, insert it into the statistics collection and return it
    pub async fn snapshot(&self) -> Result<AggregationResult> {
        take_snapshot(self.queue.as_ref(), self.statistics.as_ref()).await
    }

    /// Start recording, the first snapshot right away
    pub fn start(&mut self) {
        if self.is_running() {
            debug!("Monitor already running");
            return;
        }

        let queue = self.queue.clone();
        let statistics = self.statistics.clone();
        self.task = Some(PeriodicTask::spawn(
            "monitor",
            self.interval,
            FirstTick::Immediately,
            move || -> TickFuture {
                let queue = queue.clone();
                let statistics = statistics.clone();
                Box::pin(async move {
                    take_snapshot(queue.as_ref(), statistics.as_ref()).await?;
                    Ok(())
                })
            },
        ));
        info!("Monitor started (interval {:?})", self.interval);
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop();
            info!("Monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Snapshot every interval until the queue has been fully fetched for
    /// `idle_ticks` consecutive snapshots. Returns the number taken.
    pub async fn run_until_idle(&self, idle_ticks: u32) -> Result<u32> {
        let idle_ticks = idle_ticks.max(1);
        let mut ticks = 0;
        let mut idle = 0;

        loop {
            let snapshot = self.snapshot().await?;
            ticks += 1;

            idle = if snapshot.is_idle() { idle + 1 } else { 0 };
            if idle >= idle_ticks {
                info!("Queue idle for {} snapshots, monitor done", idle);
                return Ok(ticks);
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn take_snapshot(
    queue: &dyn DocumentCollection,
    statistics: &dyn DocumentCollection,
) -> Result<AggregationResult> {
    let timestamp = now_millis();

    // each statistic only aggregates items where that field is numeric
    let metric_pipelines = AllowedStatistic::ALL.into_iter().map(move |statistic| {
        let path = statistic.field_path();

        let mut matcher = doc! { "fetched": true };
        matcher.insert(path.clone(), doc! { "$type": ["number"] });

        let mut group = doc! { "_id": Bson::Null };
        for aggregator in Aggregator::ALL {
            let mut accumulator = Document::new();
            accumulator.insert(aggregator.operator(), format!("${path}"));
            group.insert(metric_name(statistic, aggregator), accumulator);
        }

        queue.aggregate(vec![doc! { "$match": matcher }, doc! { "$group": group }])
    });
    let status_pipeline = vec![doc! { "$group": { "_id": "$status", "total": { "$sum": 1 } } }];

    let (total_count, fetched_count, metric_rows, status_rows) = futures::try_join!(
        queue.count_documents(Document::new()),
        queue.count_documents(doc! { "fetched": true }),
        future::try_join_all(metric_pipelines),
        queue.aggregate(status_pipeline),
    )?;

    let mut result = AggregationResult {
        total_count,
        fetched_count,
        timestamp,
        ..Default::default()
    };

    for row in metric_rows.iter().filter_map(|rows| rows.first()) {
        for (field, value) in row.iter().filter(|(field, _)| *field != "_id") {
            if let Some(value) = as_f64(value) {
                result.metrics.insert(field.clone(), value);
            }
        }
    }

    for row in &status_rows {
        if let (Ok(status), Some(total)) = (row.get_str("_id"), row.get("total").and_then(as_f64)) {
            result.statuses.insert(status.to_string(), total as u64);
        }
    }

    result.timestamp_finish = now_millis();

    let document = bson::to_document(&result).map_err(StoreError::from)?;
    statistics.insert_one(document).await?;
    debug!(
        "Recorded queue snapshot: {}/{} fetched",
        result.fetched_count, result.total_count
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::storage::MemoryCollection;

    fn item(url: &str, status: &str, fetched: bool, download_time: Option<f64>) -> Document {
        let mut doc = doc! { "url": url, "status": status, "fetched": fetched };
        if let Some(time) = download_time {
            doc.insert("stateData", doc! { "downloadTime": time, "contentLength": 100_i64 });
        }
        doc
    }

    async fn seeded() -> Arc<MemoryCollection> {
        let queue = Arc::new(MemoryCollection::new());
        for doc in [
            item("a", "downloaded", true, Some(2.0)),
            item("b", "downloaded", true, Some(4.0)),
            item("c", "notfound", false, Some(50.0)),
            item("d", "queued", false, None),
        ] {
            queue.insert_one(doc).await.unwrap();
        }
        queue
    }

    #[tokio::test]
    async fn test_snapshot_counts_and_metrics() {
        let queue = seeded().await;
        let statistics = Arc::new(MemoryCollection::new());
        let monitor = Monitor::new(queue, statistics.clone(), Duration::from_secs(60));

        let snapshot = monitor.snapshot().await.unwrap();

        assert_eq!(snapshot.total_count, 4);
        assert_eq!(snapshot.fetched_count, 2);
        assert_eq!(snapshot.status_count("downloaded"), 2);
        assert_eq!(snapshot.status_count("notfound"), 1);
        assert_eq!(snapshot.status_count("queued"), 1);
        assert_eq!(snapshot.status_count("failed"), 0);

        assert_eq!(snapshot.metric(AllowedStatistic::DownloadTime, Aggregator::Max), Some(4.0));
        assert_eq!(snapshot.metric(AllowedStatistic::DownloadTime, Aggregator::Min), Some(2.0));
        assert_eq!(snapshot.metric(AllowedStatistic::DownloadTime, Aggregator::Avg), Some(3.0));
        assert_eq!(snapshot.metric(AllowedStatistic::ContentLength, Aggregator::Avg), Some(100.0));
        assert_eq!(snapshot.metric(AllowedStatistic::RequestTime, Aggregator::Max), None);
        assert!(snapshot.timestamp_finish >= snapshot.timestamp);
        assert!(!snapshot.is_idle());
    }

    #[tokio::test]
    async fn test_snapshot_is_stored_flat() {
        let queue = seeded().await;
        let statistics = Arc::new(MemoryCollection::new());
        let monitor = Monitor::new(queue, statistics.clone(), Duration::from_secs(60));

        monitor.snapshot().await.unwrap();

        let stored = statistics.documents().await;
        assert_eq!(stored.len(), 1);
        let snapshot = &stored[0];
        assert_eq!(snapshot.get_i64("totalCount").unwrap(), 4);
        assert_eq!(snapshot.get_i64("fetchedCount").unwrap(), 2);
        assert_eq!(snapshot.get_i64("downloaded").unwrap(), 2);
        assert_eq!(snapshot.get_f64("downloadTimeMax").unwrap(), 4.0);
        assert!(snapshot.get("requestTimeMax").is_none());
        assert!(snapshot.get("timestampFinish").is_some());
    }

    #[tokio::test]
    async fn test_snapshot_of_empty_queue() {
        let statistics = Arc::new(MemoryCollection::new());
        let monitor = Monitor::new(Arc::new(MemoryCollection::new()), statistics, Duration::from_secs(60));

        let snapshot = monitor.snapshot().await.unwrap();

        assert_eq!(snapshot.total_count, 0);
        assert!(snapshot.metrics.is_empty());
        assert!(snapshot.statuses.is_empty());
        assert!(snapshot.is_idle());
    }

    #[tokio::test]
    async fn test_non_numeric_values_are_skipped_per_statistic() {
        let queue = Arc::new(MemoryCollection::new());
        queue
            .insert_one(doc! { "url": "a", "status": "downloaded", "fetched": true, "stateData": { "downloadTime": "n/a" } })
            .await
            .unwrap();
        queue.insert_one(item("b", "downloaded", true, Some(4.0))).await.unwrap();
        let monitor = Monitor::new(queue, Arc::new(MemoryCollection::new()), Duration::from_secs(60));

        let snapshot = monitor.snapshot().await.unwrap();

        assert_eq!(snapshot.metric(AllowedStatistic::DownloadTime, Aggregator::Max), Some(4.0));
        assert_eq!(snapshot.metric(AllowedStatistic::DownloadTime, Aggregator::Min), Some(4.0));
        assert_eq!(snapshot.metric(AllowedStatistic::DownloadTime, Aggregator::Avg), Some(4.0));
        assert_eq!(snapshot.metric(AllowedStatistic::ContentLength, Aggregator::Max), Some(100.0));
        assert_eq!(snapshot.metric(AllowedStatistic::RequestTime, Aggregator::Min), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_monitor_records_immediately() {
        let statistics = Arc::new(MemoryCollection::new());
        let mut monitor = Monitor::new(seeded().await, statistics.clone(), Duration::from_secs(60));

        monitor.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(statistics.documents().await.len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(statistics.documents().await.len(), 2);

        monitor.stop();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(statistics.documents().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_idle() {
        let queue = Arc::new(MemoryCollection::new());
        queue.insert_one(item("a", "downloaded", true, Some(1.0))).await.unwrap();
        let statistics = Arc::new(MemoryCollection::new());
        let monitor = Monitor::new(queue, statistics.clone(), Duration::from_secs(1));

        assert_eq!(monitor.run_until_idle(3).await.unwrap(), 3);
        assert_eq!(statistics.documents().await.len(), 3);
    }
}
