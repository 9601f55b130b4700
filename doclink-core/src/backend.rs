//! Storage backend abstraction for the document store.
//!
//! The [`StoreBackend`] trait is the only seam between the access layer and an
//! actual document database. It speaks storage representation throughout:
//! filters, updates, pipeline stages and results are all BSON documents.
//! Implementations are required to be thread-safe (`Send + Sync`).
//!
//! - [`StoreBackend`]: The core trait for storage backends
//! - [`StoreBackendBuilder`]: Factory trait for creating backend instances
//!
//! # Examples
//!
//! ```ignore
//! use doclink::backend::{FindOptions, StoreBackend};
//! use bson::doc;
//!
//! let backend = MyBackendImpl::new();
//!
//! let adults = backend
//!     .find_documents("users", doc! { "age": { "$gte": 18 } }, FindOptions::default())
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use async_trait::async_trait;
use bson::{Bson, Document};
use std::fmt::Debug;

use crate::error::DocumentStoreResult;

/// Options of a plain `find`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
}

/// One write of an unordered bulk write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    InsertOne {
        document: Document,
    },
    UpdateOne {
        filter: Document,
        update: Document,
        upsert: bool,
    },
    UpdateMany {
        filter: Document,
        update: Document,
    },
    DeleteMany {
        filter: Document,
    },
}

/// Result of a single-document update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    /// Identifier of the inserted document when the update upserted.
    pub upserted_id: Option<Bson>,
}

/// Aggregated counts of a bulk write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteOutcome {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
    pub deleted: u64,
}

/// Abstract interface for document storage backends.
///
/// # Error Handling
///
/// Operations return [`DocumentStoreResult<T>`](crate::error::DocumentStoreResult).
/// Driver failures are reported as
/// [`DocumentStoreError::Backend`](crate::error::DocumentStoreError::Backend).
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Returns the documents of `collection` matching `filter`.
    async fn find_documents(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> DocumentStoreResult<Vec<Document>>;

    /// Runs an aggregation pipeline against `collection`.
    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> DocumentStoreResult<Vec<Document>>;

    async fn count_documents(&self, collection: &str, filter: Document) -> DocumentStoreResult<u64>;

    /// Updates the first document matching `filter` in `sort` order.
    ///
    /// Returns the document as it is after the update, or `None` when nothing matched.
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        sort: Option<Document>,
    ) -> DocumentStoreResult<Option<Document>>;

    /// Deletes at most one document. Returns the number of removed documents.
    async fn delete_one(&self, collection: &str, filter: Document) -> DocumentStoreResult<u64>;

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> DocumentStoreResult<UpdateOutcome>;

    /// Executes `operations` without ordering guarantees.
    ///
    /// Every operation is attempted; if any failed, an error is returned after
    /// the remaining operations ran.
    async fn bulk_write(
        &self,
        collection: &str,
        operations: Vec<WriteOp>,
    ) -> DocumentStoreResult<BulkWriteOutcome>;

    /// Cleanly shuts down the backend, releasing all resources.
    ///
    /// The default implementation is a no-op, but backends with external
    /// connections should override this.
    async fn shutdown(self) -> DocumentStoreResult<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

#[async_trait]
impl<B> StoreBackend for &B
where
    B: StoreBackend,
{
    async fn find_documents(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> DocumentStoreResult<Vec<Document>> {
        (*self)
            .find_documents(collection, filter, options)
            .await
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> DocumentStoreResult<Vec<Document>> {
        (*self).aggregate(collection, pipeline).await
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: Document,
    ) -> DocumentStoreResult<u64> {
        (*self).count_documents(collection, filter).await
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        sort: Option<Document>,
    ) -> DocumentStoreResult<Option<Document>> {
        (*self)
            .find_one_and_update(collection, filter, update, sort)
            .await
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> DocumentStoreResult<u64> {
        (*self).delete_one(collection, filter).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> DocumentStoreResult<UpdateOutcome> {
        (*self)
            .update_one(collection, filter, update, upsert)
            .await
    }

    async fn bulk_write(
        &self,
        collection: &str,
        operations: Vec<WriteOp>,
    ) -> DocumentStoreResult<BulkWriteOutcome> {
        (*self).bulk_write(collection, operations).await
    }
}

#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> DocumentStoreResult<Self::Backend>;
}
