use async_trait::async_trait;
use bson::Document;
use futures::{stream::iter, StreamExt, TryStreamExt};
use mongodb::{
    Client, Collection as MongoCollection,
    options::{ClientOptions, ReturnDocument},
};
use tracing::debug;

use doclink_core::{
    backend::{
        BulkWriteOutcome, FindOptions, StoreBackend, StoreBackendBuilder, UpdateOutcome, WriteOp,
    },
    error::{DocumentStoreError, DocumentStoreResult},
};

fn backend_error(error: mongodb::error::Error) -> DocumentStoreError {
    DocumentStoreError::Backend(error.to_string())
}

#[derive(Debug)]
pub struct MongoDbStore {
    client: Client,
    database: String,
}

impl MongoDbStore {
    pub fn new(client: Client, database: String) -> Self {
        Self { client, database }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    fn get_collection(&self, collection_name: &str) -> MongoCollection<Document> {
        self.client
            .database(&self.database)
            .collection(collection_name)
    }

    async fn write(
        &self,
        collection: &MongoCollection<Document>,
        operation: WriteOp,
    ) -> DocumentStoreResult<BulkWriteOutcome> {
        let mut outcome = BulkWriteOutcome::default();

        match operation {
            WriteOp::InsertOne { document } => {
                collection.insert_one(document).await.map_err(backend_error)?;
                outcome.inserted = 1;
            }
            WriteOp::UpdateOne { filter, update, upsert } => {
                let result = collection
                    .update_one(filter, update)
                    .upsert(upsert)
                    .await
                    .map_err(backend_error)?;
                outcome.matched = result.matched_count;
                outcome.modified = result.modified_count;
                outcome.upserted = u64::from(result.upserted_id.is_some());
            }
            WriteOp::UpdateMany { filter, update } => {
                let result = collection
                    .update_many(filter, update)
                    .await
                    .map_err(backend_error)?;
                outcome.matched = result.matched_count;
                outcome.modified = result.modified_count;
            }
            WriteOp::DeleteMany { filter } => {
                let result = collection.delete_many(filter).await.map_err(backend_error)?;
                outcome.deleted = result.deleted_count;
            }
        }

        Ok(outcome)
    }

    async fn shutdown(self) -> DocumentStoreResult<()> {
        self.client.shutdown().await;

        Ok(())
    }
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    async fn find_documents(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> DocumentStoreResult<Vec<Document>> {
        let mut find_options = mongodb::options::FindOptions::default();
        find_options.sort = options.sort;
        find_options.skip = options.skip;
        find_options.limit = options.limit;

        self.get_collection(collection)
            .find(filter)
            .with_options(find_options)
            .await
            .map_err(backend_error)?
            .try_collect::<Vec<Document>>()
            .await
            .map_err(backend_error)
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> DocumentStoreResult<Vec<Document>> {
        debug!(collection, stages = pipeline.len(), "running aggregation pipeline");

        self.get_collection(collection)
            .aggregate(pipeline)
            .await
            .map_err(backend_error)?
            .try_collect::<Vec<Document>>()
            .await
            .map_err(backend_error)
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: Document,
    ) -> DocumentStoreResult<u64> {
        self.get_collection(collection)
            .count_documents(filter)
            .await
            .map_err(backend_error)
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        sort: Option<Document>,
    ) -> DocumentStoreResult<Option<Document>> {
        let coll = self.get_collection(collection);
        let action = coll
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After);

        let result = match sort {
            Some(sort) => action.sort(sort).await,
            None => action.await,
        };

        result.map_err(backend_error)
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> DocumentStoreResult<u64> {
        Ok(
            self.get_collection(collection)
                .delete_one(filter)
                .await
                .map_err(backend_error)?
                .deleted_count
        )
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> DocumentStoreResult<UpdateOutcome> {
        let result = self
            .get_collection(collection)
            .update_one(filter, update)
            .upsert(upsert)
            .await
            .map_err(backend_error)?;

        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    async fn bulk_write(
        &self,
        collection: &str,
        operations: Vec<WriteOp>,
    ) -> DocumentStoreResult<BulkWriteOutcome> {
        if operations.is_empty() {
            return Ok(BulkWriteOutcome::default());
        }

        let target = self.get_collection(collection);
        let results = iter(operations)
            .then(|operation| self.write(&target, operation))
            .collect::<Vec<_>>()
            .await;

        let mut outcome = BulkWriteOutcome::default();
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(written) => {
                    outcome.inserted += written.inserted;
                    outcome.matched += written.matched;
                    outcome.modified += written.modified;
                    outcome.upserted += written.upserted;
                    outcome.deleted += written.deleted;
                }
                Err(error) => errors.push(error.to_string()),
            }
        }

        if errors.is_empty() {
            Ok(outcome)
        } else {
            Err(DocumentStoreError::Backend(format!(
                "bulk write on {collection} failed: {}",
                errors.join("; ")
            )))
        }
    }

    async fn shutdown(self) -> DocumentStoreResult<()> {
        self.shutdown().await
    }
}

pub struct MongoDbStoreBuilder {
    dsn: String,
    database: String,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl StoreBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    async fn build(self) -> DocumentStoreResult<Self::Backend> {
        Ok(MongoDbStore::new(
            Client::with_options(
                ClientOptions::parse(&self.dsn)
                    .await
                    .map_err(|e| DocumentStoreError::Initialization(e.to_string()))?,
            )
            .map_err(|e| DocumentStoreError::Initialization(e.to_string()))?,
            self.database,
        ))
    }
}
