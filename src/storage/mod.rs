pub mod memory;
pub mod mongo;

use std::sync::Arc;

use async_trait::async_trait;
use mongodb::bson::{Bson, Document};
use thiserror::Error;
use tracing::debug;

use crate::cli::config::{StoreBackend, StoreSettings};

// Re-export common types
pub use memory::{MemoryCollection, MemoryStore};
pub use mongo::{MongoCollection, MongoStore};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures reported by a document store backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("Failed to encode document: {0}")]
    Encode(#[from] mongodb::bson::ser::Error),

    #[error("Failed to decode document: {0}")]
    Decode(#[from] mongodb::bson::de::Error),

    #[error("store is not connected")]
    NotConnected,

    #[error("{0}")]
    Backend(String),
}

/// Which version of a document `find_one_and_update` hands back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnDocument {
    Before,
    After,
}

/// Counters reported by update operations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub matched_count: u64,
    pub modified_count: u64,
    /// Id of the inserted document when an upsert created one
    pub upserted_id: Option<Bson>,
}

/// Index definition passed to `create_index`
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub keys: Document,
    pub partial_filter: Option<Document>,
}

impl IndexSpec {
    pub fn new(keys: Document) -> Self {
        Self {
            keys,
            partial_filter: None,
        }
    }

    pub fn with_partial_filter(mut self, filter: Document) -> Self {
        self.partial_filter = Some(filter);
        self
    }
}

/// A single document collection. Every mutating call must be atomic at the
/// store level: the queue relies on it instead of in-process locks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentCollection: Send + Sync {
    /// First document matching `filter`, optionally after skipping `skip` matches
    async fn find_one(&self, filter: Document, skip: Option<u64>) -> StoreResult<Option<Document>>;

    /// All documents matching `filter`
    async fn find(&self, filter: Document) -> StoreResult<Vec<Document>>;

    async fn count_documents(&self, filter: Document) -> StoreResult<u64>;

    /// Insert a document and return its id
    async fn insert_one(&self, document: Document) -> StoreResult<Bson>;

    async fn update_one(&self, filter: Document, update: Document, upsert: bool) -> StoreResult<UpdateOutcome>;

    async fn update_many(&self, filter: Document, update: Document) -> StoreResult<UpdateOutcome>;

    async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        return_document: ReturnDocument,
    ) -> StoreResult<Option<Document>>;

    /// Run an aggregation pipeline and collect every output document
    async fn aggregate(&self, pipeline: Vec<Document>) -> StoreResult<Vec<Document>>;

    async fn create_index(&self, index: IndexSpec) -> StoreResult<()>;

    async fn drop_collection(&self) -> StoreResult<()>;
}

/// Connection to a document database
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn connect(&self) -> StoreResult<()>;

    async fn collection(&self, name: &str) -> StoreResult<Arc<dyn DocumentCollection>>;

    async fn close(&self) -> StoreResult<()>;
}

/// Build the store selected by the settings; nothing connects until `connect()`
pub fn create_store(settings: &StoreSettings) -> Arc<dyn DocumentStore> {
    match settings.backend {
        StoreBackend::MongoDb => {
            debug!("Using MongoDB store at {}", settings.url);
            Arc::new(MongoStore::new(&settings.url, &settings.database_name))
        }
        StoreBackend::Memory => {
            debug!("Using in-memory store");
            Arc::new(MemoryStore::new())
        }
    }
}
