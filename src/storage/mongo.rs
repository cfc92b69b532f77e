use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{
    ClientOptions, FindOneAndUpdateOptions, FindOneOptions, IndexOptions, UpdateOptions,
};
use mongodb::{Client, Collection, Cursor, IndexModel};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{DocumentCollection, DocumentStore, IndexSpec, ReturnDocument, StoreError, StoreResult, UpdateOutcome};

/// MongoDB implementation of DocumentStore
pub struct MongoStore {
    /// Connection string
    url: String,

    /// Database holding the queue and statistics collections
    database_name: String,

    /// Live client, present between `connect` and `close`
    client: RwLock<Option<Client>>,
}

impl MongoStore {
    pub fn new(url: impl Into<String>, database_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database_name: database_name.into(),
            client: RwLock::new(None),
        }
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn connect(&self) -> StoreResult<()> {
        let mut slot = self.client.write().await;
        if slot.is_some() {
            return Ok(());
        }

        // Parse connection options
        let client_options = ClientOptions::parse(&self.url).await?;

        // Create the client
        let client = Client::with_options(client_options)?;

        // Test connection, the driver connects lazily
        client
            .database(&self.database_name)
            .run_command(doc! { "ping": 1 }, None)
            .await?;

        info!("Connected to MongoDB database: {}", self.database_name);

        *slot = Some(client);
        Ok(())
    }

    async fn collection(&self, name: &str) -> StoreResult<Arc<dyn DocumentCollection>> {
        let slot = self.client.read().await;
        let client = slot.as_ref().ok_or(StoreError::NotConnected)?;
        let collection = client.database(&self.database_name).collection::<Document>(name);

        Ok(Arc::new(MongoCollection::new(collection)))
    }

    async fn close(&self) -> StoreResult<()> {
        if let Some(client) = self.client.write().await.take() {
            client.shutdown().await;
            debug!("Closed MongoDB connection");
        }
        Ok(())
    }
}

/// Pass-through collection handle over the MongoDB driver
#[derive(Clone)]
pub struct MongoCollection {
    inner: Collection<Document>,
}

impl MongoCollection {
    pub fn new(inner: Collection<Document>) -> Self {
        Self { inner }
    }

    async fn drain(mut cursor: Cursor<Document>) -> StoreResult<Vec<Document>> {
        let mut documents = Vec::new();
        while let Some(doc) = cursor.next().await {
            documents.push(doc?);
        }
        Ok(documents)
    }
}

#[async_trait]
impl DocumentCollection for MongoCollection {
    async fn find_one(&self, filter: Document, skip: Option<u64>) -> StoreResult<Option<Document>> {
        let options = FindOneOptions::builder().skip(skip).build();
        Ok(self.inner.find_one(filter, options).await?)
    }

    async fn find(&self, filter: Document) -> StoreResult<Vec<Document>> {
        let cursor = self.inner.find(filter, None).await?;
        Self::drain(cursor).await
    }

    async fn count_documents(&self, filter: Document) -> StoreResult<u64> {
        Ok(self.inner.count_documents(filter, None).await?)
    }

    async fn insert_one(&self, document: Document) -> StoreResult<Bson> {
        let result = self.inner.insert_one(document, None).await?;
        Ok(result.inserted_id)
    }

    async fn update_one(&self, filter: Document, update: Document, upsert: bool) -> StoreResult<UpdateOutcome> {
        let options = UpdateOptions::builder().upsert(upsert).build();
        let result = self.inner.update_one(filter, update, options).await?;

        Ok(UpdateOutcome {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    async fn update_many(&self, filter: Document, update: Document) -> StoreResult<UpdateOutcome> {
        let result = self.inner.update_many(filter, update, None).await?;

        Ok(UpdateOutcome {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        return_document: ReturnDocument,
    ) -> StoreResult<Option<Document>> {
        let return_document = match return_document {
            ReturnDocument::Before => mongodb::options::ReturnDocument::Before,
            ReturnDocument::After => mongodb::options::ReturnDocument::After,
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(return_document)
            .build();

        Ok(self.inner.find_one_and_update(filter, update, options).await?)
    }

    async fn aggregate(&self, pipeline: Vec<Document>) -> StoreResult<Vec<Document>> {
        let cursor = self.inner.aggregate(pipeline, None).await?;
        Self::drain(cursor).await
    }

    async fn create_index(&self, index: IndexSpec) -> StoreResult<()> {
        let options = index
            .partial_filter
            .map(|filter| IndexOptions::builder().partial_filter_expression(filter).build());
        let model = IndexModel::builder().keys(index.keys).options(options).build();

        self.inner.create_index(model, None).await?;
        Ok(())
    }

    async fn drop_collection(&self) -> StoreResult<()> {
        self.inner.drop(None).await?;
        debug!("Dropped collection: {}", self.inner.name());
        Ok(())
    }
}
