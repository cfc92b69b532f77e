use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::cli::config::QueueConfig;
use crate::queue::{Aggregator, AllowedStatistic, CrawlQueue, FetchQueue, QueueItemStatus};
use crate::storage::{create_store, DocumentStore};
use crate::tasks::{GarbageCollector, Monitor};

/// Point-in-time view of a queue, as printed by `stats`
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total_count: u64,
    pub fetched_count: u64,
    pub statuses: BTreeMap<String, u64>,
    pub metrics: BTreeMap<String, f64>,
}

async fn connect(config: &QueueConfig) -> Result<Arc<dyn DocumentStore>> {
    let store = create_store(&config.store);
    store
        .connect()
        .await
        .context(format!("Failed to connect to {}", config.store.url))?;
    Ok(store)
}

/// Drop the queue and statistics collections
pub async fn drop_collections(config: &QueueConfig) -> Result<()> {
    let store = connect(config).await?;
    drop_all(store.as_ref(), config).await?;
    store.close().await?;
    Ok(())
}

async fn drop_all(store: &dyn DocumentStore, config: &QueueConfig) -> Result<()> {
    for name in [
        &config.store.collection_name,
        &config.monitor.statistic_collection_name,
    ] {
        store
            .collection(name)
            .await?
            .drop_collection()
            .await
            .context(format!("Failed to drop collection {}", name))?;
        info!("Dropped collection {}", name);
    }
    Ok(())
}

/// Run the garbage collector in the foreground until the queue goes idle
pub async fn run_gc(config: &QueueConfig, idle_ticks: u32) -> Result<()> {
    let store = connect(config).await?;
    let collection = store.collection(&config.store.collection_name).await?;

    let gc = GarbageCollector::from_settings(collection, &config.gc);
    let ticks = gc.run_until_idle(idle_ticks).await?;
    println!("Garbage collector finished after {} ticks", ticks);

    store.close().await?;
    Ok(())
}

/// Run the monitor in the foreground until the queue goes idle
pub async fn run_monitor(config: &QueueConfig, idle_ticks: u32) -> Result<()> {
    let store = connect(config).await?;
    let queue = store.collection(&config.store.collection_name).await?;
    let statistics = store.collection(&config.monitor.statistic_collection_name).await?;

    let monitor = Monitor::from_settings(queue, statistics, &config.monitor);
    let snapshots = monitor.run_until_idle(idle_ticks).await?;
    println!("Monitor finished after {} snapshots", snapshots);

    store.close().await?;
    Ok(())
}

/// Gather counts and every statistic of an initialized queue
pub async fn collect_stats(queue: &CrawlQueue) -> Result<QueueStats> {
    let engine = queue.engine()?;
    let (total_count, fetched_count) = engine.counts().await?;

    let mut statuses = BTreeMap::new();
    for status in QueueItemStatus::ALL {
        let spec = mongodb::bson::doc! { "status": status.as_str() };
        let count = engine.count_items(&spec).await?;
        if count > 0 {
            statuses.insert(status.to_string(), count);
        }
    }

    let mut metrics = BTreeMap::new();
    for statistic in AllowedStatistic::ALL {
        for aggregator in Aggregator::ALL {
            if let Some(value) = engine.statistic_of(statistic, aggregator).await? {
                metrics.insert(format!("{}{}", statistic, aggregator.suffix()), value);
            }
        }
    }

    Ok(QueueStats {
        total_count,
        fetched_count,
        statuses,
        metrics,
    })
}

/// Print current queue statistics
pub async fn show_stats(config: &QueueConfig, json: bool) -> Result<()> {
    let mut config = config.clone();
    config.gc.enabled = false;
    config.monitor.enabled = false;

    let mut queue = CrawlQueue::new(config);
    queue.init().await.context("Failed to open queue")?;
    let stats = collect_stats(&queue).await?;
    queue.finalize().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Items: {} ({} fetched)", stats.total_count, stats.fetched_count);
    println!("By status:");
    for (status, count) in &stats.statuses {
        println!("  {:<18} {}", status, count);
    }
    if !stats.metrics.is_empty() {
        println!("Metrics:");
        for (name, value) in &stats.metrics {
            println!("  {:<18} {:.2}", name, value);
        }
    }
    Ok(())
}

/// Show the effective configuration
pub fn show_config(config: &QueueConfig) -> Result<()> {
    println!("Current configuration:");
    print!("{}", config.to_yaml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::StoreBackend;
    use crate::queue::QueueItem;
    use crate::storage::{DocumentCollection, MemoryStore};
    use mongodb::bson::doc;

    fn memory_config() -> QueueConfig {
        let mut config = QueueConfig::default();
        config.store.backend = StoreBackend::Memory;
        config
    }

    #[tokio::test]
    async fn test_collect_stats() {
        let mut queue = CrawlQueue::new(memory_config());
        queue.init().await.unwrap();

        let mut done = QueueItem::from_url("http://example.com/a", 1, None).unwrap();
        done.fetched = true;
        done.state_data.request_time = Some(30.0);
        let done = queue.add(done, false).await.unwrap();
        queue
            .update(&done.id.unwrap(), &doc! { "status": "downloaded" })
            .await
            .unwrap();
        queue
            .add(QueueItem::from_url("http://example.com/b", 2, None).unwrap(), false)
            .await
            .unwrap();

        let stats = collect_stats(&queue).await.unwrap();

        assert_eq!(stats.total_count, 2);
        assert_eq!(stats.fetched_count, 1);
        assert_eq!(stats.statuses.get("downloaded"), Some(&1));
        assert_eq!(stats.statuses.get("queued"), Some(&1));
        assert_eq!(stats.statuses.len(), 2);
        assert_eq!(stats.metrics.get("requestTimeMax"), Some(&30.0));
        assert!(!stats.metrics.contains_key("downloadTimeMax"));

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["totalCount"], 2);
        assert_eq!(json["statuses"]["queued"], 1);
    }

    #[tokio::test]
    async fn test_drop_all_drops_both_collections() {
        let config = memory_config();
        let store = MemoryStore::new();
        let queue = store.handle("queue").await;
        let statistics = store.handle("statistic").await;
        queue.insert_one(doc! { "url": "http://example.com/" }).await.unwrap();
        statistics.insert_one(doc! { "totalCount": 1_i64 }).await.unwrap();

        drop_all(&store, &config).await.unwrap();

        assert!(queue.documents().await.is_empty());
        assert!(statistics.documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_foreground_tasks_finish_on_idle_queue() {
        let config = memory_config();
        tokio_test::assert_ok!(run_gc(&config, 1).await);
        tokio_test::assert_ok!(run_monitor(&config, 1).await);
    }
}
