pub mod callback;
pub mod engine;
pub mod filter;
pub mod item;

use std::sync::Arc;

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::Document;
use tracing::{debug, info};

use crate::cli::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::storage::{create_store, DocumentStore};
use crate::tasks::{GarbageCollector, Monitor};

// Re-export common types
pub use callback::WithCallback;
pub use engine::QueueEngine;
pub use item::{Aggregator, AllowedStatistic, QueueItem, QueueItemStatus, StateData};

/// The contract a crawler drives its fetch queue through
#[async_trait]
pub trait FetchQueue: Send + Sync {
    /// Connect to the store and start background maintenance
    async fn init(&mut self) -> Result<()>;

    /// Stop background maintenance and release the store connection
    async fn finalize(&mut self) -> Result<()>;

    async fn add(&self, item: QueueItem, force: bool) -> Result<QueueItem>;

    async fn exists(&self, url: &str) -> Result<bool>;

    /// Item at a store-ordered position
    async fn get(&self, index: u64) -> Result<QueueItem>;

    async fn update(&self, id: &ObjectId, updates: &Document) -> Result<QueueItem>;

    /// Claim the next queued item
    async fn oldest_unfetched_item(&self) -> Result<Option<QueueItem>>;

    async fn max(&self, statistic: &str) -> Result<Option<f64>>;

    async fn min(&self, statistic: &str) -> Result<Option<f64>>;

    async fn avg(&self, statistic: &str) -> Result<Option<f64>>;

    async fn count_items(&self, spec: &Document) -> Result<u64>;

    async fn filter_items(&self, spec: &Document) -> Result<Vec<QueueItem>>;

    async fn get_length(&self) -> Result<u64>;

    /// Drop every item; the queue stays usable and starts out empty
    async fn drop_queue(&self) -> Result<()>;

    /// The queue already lives in the store, there is nothing to persist
    async fn freeze(&self, _filename: &str) -> Result<bool> {
        Ok(true)
    }

    async fn defrost(&self, _filename: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Store-backed fetch queue with optional garbage collection and monitoring
pub struct CrawlQueue {
    config: QueueConfig,
    store: Arc<dyn DocumentStore>,
    engine: Option<QueueEngine>,
    garbage_collector: Option<GarbageCollector>,
    monitor: Option<Monitor>,
}

impl CrawlQueue {
    /// Queue over the store selected in `config`; call `init` before use
    pub fn new(config: QueueConfig) -> Self {
        let store = create_store(&config.store);
        Self::with_store(config, store)
    }

    pub fn with_store(config: QueueConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            config,
            store,
            engine: None,
            garbage_collector: None,
            monitor: None,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The engine behind an initialized queue
    pub fn engine(&self) -> Result<&QueueEngine> {
        self.engine.as_ref().ok_or_else(QueueError::not_initialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    pub fn is_gc_running(&self) -> bool {
        self.garbage_collector.as_ref().is_some_and(GarbageCollector::is_running)
    }

    pub fn is_monitor_running(&self) -> bool {
        self.monitor.as_ref().is_some_and(Monitor::is_running)
    }

    fn stop_tasks(&mut self) {
        if let Some(mut gc) = self.garbage_collector.take() {
            gc.stop();
        }
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
    }
}

#[async_trait]
impl FetchQueue for CrawlQueue {
    async fn init(&mut self) -> Result<()> {
        if self.engine.is_some() {
            debug!("Queue already initialized");
            return Ok(());
        }

        self.store.connect().await?;
        let collection = self.store.collection(&self.config.store.collection_name).await?;
        let engine = QueueEngine::new(collection.clone(), self.config.crawler_name.clone());
        engine.ensure_indexes().await?;

        if self.config.gc.enabled {
            let mut gc = GarbageCollector::from_settings(collection.clone(), &self.config.gc);
            gc.start();
            self.garbage_collector = Some(gc);
        }

        if self.config.monitor.enabled {
            let statistics = self
                .store
                .collection(&self.config.monitor.statistic_collection_name)
                .await?;
            let mut monitor = Monitor::from_settings(collection, statistics, &self.config.monitor);
            monitor.start();
            self.monitor = Some(monitor);
        }

        self.engine = Some(engine);
        info!(
            "Queue initialized on collection {} as {}",
            self.config.store.collection_name, self.config.crawler_name
        );
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        self.stop_tasks();
        self.engine = None;
        self.store.close().await?;
        info!("Queue finalized");
        Ok(())
    }

    async fn add(&self, item: QueueItem, force: bool) -> Result<QueueItem> {
        self.engine()?.add(item, force).await
    }

    async fn exists(&self, url: &str) -> Result<bool> {
        self.engine()?.exists(url).await
    }

    #[allow(deprecated)]
    async fn get(&self, index: u64) -> Result<QueueItem> {
        self.engine()?.get(index).await
    }

    async fn update(&self, id: &ObjectId, updates: &Document) -> Result<QueueItem> {
        self.engine()?.update(id, updates).await
    }

    async fn oldest_unfetched_item(&self) -> Result<Option<QueueItem>> {
        self.engine()?.oldest_unfetched_item().await
    }

    async fn max(&self, statistic: &str) -> Result<Option<f64>> {
        self.engine()?.max(statistic).await
    }

    async fn min(&self, statistic: &str) -> Result<Option<f64>> {
        self.engine()?.min(statistic).await
    }

    async fn avg(&self, statistic: &str) -> Result<Option<f64>> {
        self.engine()?.avg(statistic).await
    }

    async fn count_items(&self, spec: &Document) -> Result<u64> {
        self.engine()?.count_items(spec).await
    }

    async fn filter_items(&self, spec: &Document) -> Result<Vec<QueueItem>> {
        self.engine()?.filter_items(spec).await
    }

    async fn get_length(&self) -> Result<u64> {
        self.engine()?.get_length().await
    }

    async fn drop_queue(&self) -> Result<()> {
        self.engine()?.drop_queue().await?;
        info!("Dropped queue collection {}", self.config.store.collection_name);
        Ok(())
    }
}
