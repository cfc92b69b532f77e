use std::sync::Arc;

use mongodb::bson::oid::ObjectId;
use mongodb::bson::{self, doc, Bson, Document};
use tracing::{debug, warn};

use crate::error::{QueueError, Result};
use crate::queue::filter::{flatten_for_filter, flatten_for_update};
use crate::queue::item::{Aggregator, AllowedStatistic, QueueItem, QueueItemStatus};
use crate::storage::{DocumentCollection, IndexSpec, ReturnDocument, StoreError};
use crate::utils::now_millis;

/// Queue operations over a shared collection.
///
/// Holds no coordination state of its own: claims and duplicate checks rely
/// entirely on the atomic upsert and find-and-update primitives of the store,
/// so any number of engines in any number of processes can share a collection.
pub struct QueueEngine {
    /// Queue collection
    collection: Arc<dyn DocumentCollection>,

    /// Written to `modifiedBy` on every mutation
    worker_name: String,
}

impl QueueEngine {
    pub fn new(collection: Arc<dyn DocumentCollection>, worker_name: impl Into<String>) -> Self {
        Self {
            collection,
            worker_name: worker_name.into(),
        }
    }

    pub fn collection(&self) -> &Arc<dyn DocumentCollection> {
        &self.collection
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Create the claim index (partial on queued items) and the url lookup index
    pub async fn ensure_indexes(&self) -> Result<()> {
        self.collection
            .create_index(
                IndexSpec::new(doc! { "status": 1 })
                    .with_partial_filter(doc! { "status": { "$eq": QueueItemStatus::Queued.as_str() } }),
            )
            .await?;
        self.collection
            .create_index(IndexSpec::new(doc! { "url": "hashed" }))
            .await?;

        debug!("Ensured queue indexes exist");
        Ok(())
    }

    /// Add an item in the queued state.
    ///
    /// Without `force` the insert is keyed on the url. With `force` it is keyed
    /// on the whole record as given, with the caller's status and the stamps,
    /// so several items may share a url but a stored record cannot be added
    /// again.
    pub async fn add(&self, item: QueueItem, force: bool) -> Result<QueueItem> {
        let mut candidate = item;
        candidate.id = None;
        candidate.modification_timestamp.get_or_insert_with(now_millis);
        candidate
            .modified_by
            .get_or_insert_with(|| self.worker_name.clone());

        let filter = if force {
            bson::to_document(&candidate).map_err(StoreError::from)?
        } else {
            doc! { "url": candidate.url.as_str() }
        };

        candidate.status = QueueItemStatus::Queued;
        let payload = bson::to_document(&candidate).map_err(StoreError::from)?;

        let outcome = self
            .collection
            .update_one(filter, doc! { "$setOnInsert": payload }, true)
            .await?;

        let Some(id) = outcome.upserted_id else {
            debug!("Rejected duplicate queue item: {}", candidate.url);
            return Err(if force {
                QueueError::duplicate(
                    "Can't add a queue item twice. You may create a new one from the same URL however.",
                )
            } else {
                QueueError::duplicate(format!("Resource already exists in queue: {}", candidate.url))
            });
        };

        let stored = self
            .collection
            .find_one(doc! { "_id": id }, None)
            .await?
            .ok_or_else(|| QueueError::unexpected("inserted queue item could not be read back"))?;

        debug!("Added queue item: {}", candidate.url);
        decode(stored)
    }

    pub async fn exists(&self, url: &str) -> Result<bool> {
        let found = self.collection.find_one(doc! { "url": url }, None).await?;
        Ok(found.is_some())
    }

    /// Item at an arbitrary store-ordered position
    #[deprecated(note = "positional access over an unordered collection")]
    pub async fn get(&self, index: u64) -> Result<QueueItem> {
        match self.collection.find_one(Document::new(), Some(index)).await? {
            Some(doc) => decode(doc),
            None => Err(QueueError::not_found("out of range")),
        }
    }

    /// Overwrite the given (possibly nested) fields of an item
    pub async fn update(&self, id: &ObjectId, updates: &Document) -> Result<QueueItem> {
        let mut assignments = flatten_for_update(updates)?;
        // the identifier is immutable once assigned
        if assignments.remove("_id").is_some() {
            warn!("Ignoring _id in update of queue item {}", id);
        }
        assignments.insert("modificationTimestamp", now_millis());
        assignments.insert("modifiedBy", self.worker_name.as_str());

        let updated = self
            .collection
            .find_one_and_update(
                doc! { "_id": *id },
                doc! { "$set": assignments },
                ReturnDocument::After,
            )
            .await?
            .ok_or_else(|| QueueError::not_found(format!("No queue item found with id {id}")))?;

        decode(updated)
    }

    /// Claim one queued item by moving it to `pulled`; `None` when nothing is queued
    pub async fn oldest_unfetched_item(&self) -> Result<Option<QueueItem>> {
        let claim = doc! {
            "$set": {
                "status": QueueItemStatus::Pulled.as_str(),
                "modificationTimestamp": now_millis(),
                "modifiedBy": self.worker_name.as_str(),
            }
        };

        let claimed = self
            .collection
            .find_one_and_update(
                doc! { "status": QueueItemStatus::Queued.as_str() },
                claim,
                ReturnDocument::After,
            )
            .await?;

        match claimed {
            Some(doc) => {
                let item = decode(doc)?;
                debug!("Claimed queue item: {}", item.url);
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    pub async fn get_length(&self) -> Result<u64> {
        Ok(self.collection.count_documents(Document::new()).await?)
    }

    pub async fn count_items(&self, spec: &Document) -> Result<u64> {
        let filter = flatten_for_filter(spec)?;
        Ok(self.collection.count_documents(filter).await?)
    }

    pub async fn filter_items(&self, spec: &Document) -> Result<Vec<QueueItem>> {
        let filter = flatten_for_filter(spec)?;
        self.collection
            .find(filter)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Total and fetched item counts
    pub async fn counts(&self) -> Result<(u64, u64)> {
        count_progress(self.collection.as_ref()).await
    }

    /// Aggregate a named statistic; the name is validated before touching the store
    pub async fn statistic(&self, name: &str, aggregator: Aggregator) -> Result<Option<f64>> {
        let statistic: AllowedStatistic = name.parse()?;
        self.statistic_of(statistic, aggregator).await
    }

    /// Aggregate over fetched items whose field is numeric; `None` when there are none
    pub async fn statistic_of(&self, statistic: AllowedStatistic, aggregator: Aggregator) -> Result<Option<f64>> {
        let path = statistic.field_path();

        let mut matcher = doc! { "fetched": true };
        matcher.insert(path.clone(), doc! { "$type": ["number"] });

        let mut accumulator = Document::new();
        accumulator.insert(aggregator.operator(), format!("${path}"));
        let group = doc! { "_id": path, "value": accumulator };

        let results = self
            .collection
            .aggregate(vec![doc! { "$match": matcher }, doc! { "$group": group }])
            .await?;

        Ok(results
            .first()
            .and_then(|doc| doc.get("value"))
            .and_then(as_f64))
    }

    pub async fn max(&self, name: &str) -> Result<Option<f64>> {
        self.statistic(name, Aggregator::Max).await
    }

    pub async fn min(&self, name: &str) -> Result<Option<f64>> {
        self.statistic(name, Aggregator::Min).await
    }

    pub async fn avg(&self, name: &str) -> Result<Option<f64>> {
        self.statistic(name, Aggregator::Avg).await
    }

    /// Drop the whole queue collection
    pub async fn drop_queue(&self) -> Result<()> {
        self.collection.drop_collection().await?;
        debug!("Dropped queue collection");
        Ok(())
    }
}

/// Total and fetched item counts of a queue collection, queried concurrently
pub(crate) async fn count_progress(collection: &dyn DocumentCollection) -> Result<(u64, u64)> {
    let (total, fetched) = futures::try_join!(
        collection.count_documents(Document::new()),
        collection.count_documents(doc! { "fetched": true }),
    )?;
    Ok((total, fetched))
}

fn decode(doc: Document) -> Result<QueueItem> {
    Ok(bson::from_document(doc).map_err(StoreError::from)?)
}

/// Numeric value of an aggregation output, whatever its stored width
pub(crate) fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

#[cfg(test)]
#[allow(deprecated)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::{MemoryCollection, MockDocumentCollection};
    use futures::future::join_all;
    use std::collections::HashSet;

    fn engine() -> (Arc<MemoryCollection>, QueueEngine) {
        let collection = Arc::new(MemoryCollection::new());
        let engine = QueueEngine::new(collection.clone(), "worker-1");
        (collection, engine)
    }

    fn item(url: &str) -> QueueItem {
        QueueItem::from_url(url, 1, None).unwrap()
    }

    fn fetched(url: &str, download_time: f64) -> QueueItem {
        let mut item = item(url);
        item.fetched = true;
        item.state_data.download_time = Some(download_time);
        item
    }

    async fn seed(engine: &QueueEngine, items: Vec<QueueItem>) {
        for item in items {
            engine.add(item, false).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_add_queues_and_stamps() {
        let (_, engine) = engine();
        let mut candidate = item("http://example.com/a");
        candidate.status = QueueItemStatus::Created;

        let added = engine.add(candidate, false).await.unwrap();

        assert!(added.id.is_some());
        assert_eq!(added.status, QueueItemStatus::Queued);
        assert_eq!(added.modified_by.as_deref(), Some("worker-1"));
        assert!(added.modification_timestamp.is_some());
        assert!(engine.exists("http://example.com/a").await.unwrap());
        assert!(!engine.exists("http://example.com/b").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_url() {
        let (collection, engine) = engine();
        engine.add(item("http://example.com/a"), false).await.unwrap();

        let err = engine.add(item("http://example.com/a"), false).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DuplicateResource);
        assert_eq!(collection.documents().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds() {
        let (_, engine) = engine();
        let engine = Arc::new(engine);

        let tasks: Vec<_> = ["http://example.com/a", "http://example.com/a", "http://example.com/b"]
            .into_iter()
            .map(|url| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.add(item(url), false).await })
            })
            .collect();
        let results: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

        assert!(results[2].is_ok());
        let same_url = &results[..2];
        assert_eq!(same_url.iter().filter(|r| r.is_ok()).count(), 1);
        let failed = same_url.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(failed.kind(), ErrorKind::DuplicateResource);
        assert_eq!(engine.get_length().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_forced_add_allows_same_url_but_not_same_record() {
        let (_, engine) = engine();

        let first = engine.add(item("http://127.0.0.1/example"), false).await.unwrap();
        let err = engine.add(item("http://127.0.0.1/example"), false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateResource);

        let mut rediscovered = item("http://127.0.0.1/example");
        rediscovered.depth = 2;
        engine.add(rediscovered, true).await.unwrap();
        assert_eq!(engine.get_length().await.unwrap(), 2);

        // re-adding the stored record itself matches field for field
        let err = engine.add(first, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateResource);
        assert!(err.to_string().contains("twice"));
        assert_eq!(engine.get_length().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_forced_add_is_keyed_on_the_given_status() {
        let (_, engine) = engine();
        let mut candidate = item("http://127.0.0.1/example");
        candidate.status = QueueItemStatus::Created;
        candidate.modification_timestamp = Some(1);

        let added = engine.add(candidate.clone(), true).await.unwrap();
        assert_eq!(added.status, QueueItemStatus::Queued);

        // the stored copy is queued, so a created record never matches it
        engine.add(candidate.clone(), true).await.unwrap();
        assert_eq!(engine.get_length().await.unwrap(), 2);

        candidate.status = QueueItemStatus::Queued;
        let err = engine.add(candidate, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateResource);
        assert_eq!(engine.get_length().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_to_unknown_status_reads_back() {
        let (_, engine) = engine();
        let added = engine.add(item("http://example.com/a"), false).await.unwrap();

        let updated = engine
            .update(&added.id.unwrap(), &doc! { "status": "blablba" })
            .await
            .unwrap();
        assert_eq!(updated.status, QueueItemStatus::Other("blablba".into()));

        let all = engine.filter_items(&doc! {}).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status.as_str(), "blablba");
    }

    #[tokio::test]
    async fn test_claim_of_foreign_record_is_not_lost() {
        let (collection, engine) = engine();
        collection
            .insert_one(doc! { "url": "http://example.com/a", "status": "queued", "fetched": false, "depth": 2.0 })
            .await
            .unwrap();

        let claimed = engine.oldest_unfetched_item().await.unwrap().expect("a claimed item");

        assert_eq!(claimed.depth, 2);
        assert_eq!(claimed.status, QueueItemStatus::Pulled);
        assert_eq!(claimed.modified_by.as_deref(), Some("worker-1"));
        assert!(engine.oldest_unfetched_item().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_disjoint() {
        let (_, engine) = engine();
        let engine = Arc::new(engine);
        for i in 0..20 {
            engine.add(item(&format!("http://example.com/{i}")), false).await.unwrap();
        }

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.oldest_unfetched_item().await })
            })
            .collect();

        let mut ids = HashSet::new();
        for result in join_all(tasks).await {
            let claimed = result.unwrap().unwrap().expect("an item per claim");
            assert_eq!(claimed.status, QueueItemStatus::Pulled);
            assert!(ids.insert(claimed.id.unwrap()));
        }

        assert_eq!(ids.len(), 20);
        assert_eq!(engine.count_items(&doc! { "status": "queued" }).await.unwrap(), 0);
        assert!(engine.oldest_unfetched_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_nested_leaf_keeps_siblings() {
        let (_, engine) = engine();
        let mut candidate = item("http://example.com/a");
        candidate.state_data.content_type = Some("text/html".into());
        candidate.state_data.request_time = Some(10.0);
        let added = engine.add(candidate, false).await.unwrap();
        let id = added.id.unwrap();

        let updated = engine
            .update(&id, &doc! { "stateData": { "downloadTime": 4.0 } })
            .await
            .unwrap();

        assert_eq!(updated.state_data.download_time, Some(4.0));
        assert_eq!(updated.state_data.content_type.as_deref(), Some("text/html"));
        assert_eq!(updated.state_data.request_time, Some(10.0));
        assert_eq!(updated.url, added.url);
        assert_eq!(updated.status, added.status);
        assert!(updated.modification_timestamp >= added.modification_timestamp);
    }

    #[tokio::test]
    async fn test_update_cannot_reassign_id() {
        let (_, engine) = engine();
        let added = engine.add(item("http://example.com/a"), false).await.unwrap();
        let id = added.id.unwrap();

        let updated = engine
            .update(&id, &doc! { "_id": ObjectId::new(), "status": "spooled" })
            .await
            .unwrap();

        assert_eq!(updated.id, Some(id));
        assert_eq!(updated.status, QueueItemStatus::Spooled);
    }

    #[tokio::test]
    async fn test_update_unknown_id() {
        let (_, engine) = engine();
        let err = engine
            .update(&ObjectId::new(), &doc! { "fetched": true })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_statistic_ignores_unfetched_items() {
        let (_, engine) = engine();
        let mut unfetched = item("http://example.com/c");
        unfetched.state_data.download_time = Some(99.0);
        seed(
            &engine,
            vec![fetched("http://example.com/a", 2.0), fetched("http://example.com/b", 1.0), unfetched],
        )
        .await;

        assert_eq!(engine.max("downloadTime").await.unwrap(), Some(2.0));
        assert_eq!(engine.min("downloadTime").await.unwrap(), Some(1.0));
        assert_eq!(engine.avg("downloadTime").await.unwrap(), Some(1.5));
        assert_eq!(engine.max("requestTime").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_statistic_makes_no_store_call() {
        // a mock with no expectations panics on any call
        let engine = QueueEngine::new(Arc::new(MockDocumentCollection::new()), "worker-1");

        let err = engine.statistic("unknown", Aggregator::Avg).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStatistic);
    }

    #[tokio::test]
    async fn test_get_by_position() {
        let (_, engine) = engine();
        for url in ["http://example.com/a", "http://example.com/b"] {
            engine.add(item(url), false).await.unwrap();
        }

        let second = engine.get(1).await.unwrap();
        assert!(second.id.is_some());
        assert_eq!(second.url, "http://example.com/b");

        let length = engine.get_length().await.unwrap();
        let err = engine.get(length).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "out of range");
    }

    #[tokio::test]
    async fn test_count_and_filter_items() {
        let (_, engine) = engine();
        let a = engine.add(item("http://example.com/a"), false).await.unwrap();
        let mut deeper = item("http://example.com/b");
        deeper.depth = 2;
        engine.add(deeper, false).await.unwrap();
        engine
            .update(&a.id.unwrap(), &doc! { "fetched": true, "stateData": { "code": 200 } })
            .await
            .unwrap();

        assert_eq!(engine.count_items(&doc! { "fetched": true }).await.unwrap(), 1);
        assert_eq!(engine.count_items(&doc! { "stateData": { "code": 200 } }).await.unwrap(), 1);

        let deep = engine.filter_items(&doc! { "depth": 2 }).await.unwrap();
        assert_eq!(deep.len(), 1);
        assert_eq!(deep[0].url, "http://example.com/b");

        let by_id = engine
            .filter_items(&doc! { "id": a.id.unwrap().to_hex() })
            .await
            .unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].url, a.url);

        let err = engine.count_items(&doc! { "_id": "nope" }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidIdentifier);

        assert_eq!(engine.counts().await.unwrap(), (2, 1));
    }

    #[tokio::test]
    async fn test_ensure_indexes() {
        let (collection, engine) = engine();
        engine.ensure_indexes().await.unwrap();

        let indexes = collection.indexes().await;
        assert_eq!(indexes.len(), 2);
        assert_eq!(
            indexes[0].partial_filter,
            Some(doc! { "status": { "$eq": "queued" } })
        );
        assert_eq!(indexes[1].keys, doc! { "url": "hashed" });
    }

    #[tokio::test]
    async fn test_store_failures_propagate() {
        let mut mock = MockDocumentCollection::new();
        mock.expect_find_one()
            .returning(|_, _| Err(StoreError::Backend("connection reset".into())));
        let engine = QueueEngine::new(Arc::new(mock), "worker-1");

        let err = engine.exists("http://example.com").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    }
}
