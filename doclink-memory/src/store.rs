//! In-memory storage implementation for document stores.
//!
//! This module provides a simple in-memory backend that keeps each collection
//! as a vector of BSON documents behind an async-safe read-write lock.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bson::{oid::ObjectId, Bson, Document};
use mea::rwlock::RwLock;
use tracing::debug;

use doclink_core::{
    backend::{
        BulkWriteOutcome, FindOptions, StoreBackend, StoreBackendBuilder, UpdateOutcome, WriteOp,
    },
    error::{DocumentStoreError, DocumentStoreResult},
};

use crate::{
    aggregate::{run, sort_documents},
    evaluator::{matches, Vars},
};

pub(crate) type StoreMap = HashMap<String, Vec<Document>>;

/// Thread-safe in-memory document storage backend.
///
/// # Thread Safety
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state, allowing
/// it to be safely shared across async tasks. Multiple clones of the same instance
/// share the same underlying data.
///
/// # Performance
///
/// Every operation scans the whole collection (no indexing). It is meant for
/// tests and small data sets.
///
/// # Example
///
/// ```ignore
/// use doclink_memory::InMemoryStore;
/// use doclink::backend::{FindOptions, StoreBackend, WriteOp};
/// use bson::doc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = InMemoryStore::new();
///
///     store
///         .bulk_write("users", vec![WriteOp::InsertOne { document: doc! { "name": "Alice" } }])
///         .await?;
///
///     let docs = store.find_documents("users", doc! {}, FindOptions::default()).await?;
///     assert_eq!(docs.len(), 1);
///
///     Ok(())
/// }
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    /// collection name -> documents, in insertion order
    store: Arc<RwLock<StoreMap>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory document store.
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(StoreMap::new())),
        }
    }

    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }
}

fn filter_documents<'a>(
    documents: impl IntoIterator<Item = &'a Document>,
    filter: &Document,
) -> DocumentStoreResult<Vec<Document>> {
    let vars = Vars::new();
    let mut matched = Vec::new();
    for document in documents {
        if matches(document, filter, &vars)? {
            matched.push(document.clone());
        }
    }
    Ok(matched)
}

fn first_match(documents: &[Document], filter: &Document) -> DocumentStoreResult<Option<usize>> {
    let vars = Vars::new();
    for (position, document) in documents.iter().enumerate() {
        if matches(document, filter, &vars)? {
            return Ok(Some(position));
        }
    }
    Ok(None)
}

fn set_path(document: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(document.get(head), Some(Bson::Document(_))) {
                document.insert(head, Document::new());
            }
            if let Ok(nested) = document.get_document_mut(head) {
                set_path(nested, rest, value);
            }
        }
    }
}

fn unset_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => {
            if let Ok(nested) = document.get_document_mut(head) {
                unset_path(nested, rest);
            }
        }
    }
}

fn checked_sum(a: i64, b: i64) -> DocumentStoreResult<i64> {
    a.checked_add(b).ok_or_else(|| {
        DocumentStoreError::Backend(format!("$inc overflows a 64-bit integer ({a} + {b})"))
    })
}

fn increment(current: Option<&Bson>, by: &Bson) -> DocumentStoreResult<Bson> {
    let sum = match (current, by) {
        (None, by) => by.clone(),
        // 32-bit overflow widens to 64 bits; 64-bit overflow is an error.
        (Some(Bson::Int32(a)), Bson::Int32(b)) => match a.checked_add(*b) {
            Some(sum) => Bson::Int32(sum),
            None => Bson::Int64(i64::from(*a) + i64::from(*b)),
        },
        (Some(Bson::Int32(a)), Bson::Int64(b)) => Bson::Int64(checked_sum(i64::from(*a), *b)?),
        (Some(Bson::Int64(a)), Bson::Int32(b)) => Bson::Int64(checked_sum(*a, i64::from(*b))?),
        (Some(Bson::Int64(a)), Bson::Int64(b)) => Bson::Int64(checked_sum(*a, *b)?),
        (Some(Bson::Double(a)), Bson::Int32(b)) => Bson::Double(a + f64::from(*b)),
        (Some(Bson::Double(a)), Bson::Int64(b)) => Bson::Double(a + *b as f64),
        (Some(Bson::Double(a)), Bson::Double(b)) => Bson::Double(a + b),
        (Some(Bson::Int32(a)), Bson::Double(b)) => Bson::Double(f64::from(*a) + b),
        (Some(Bson::Int64(a)), Bson::Double(b)) => Bson::Double(*a as f64 + b),
        _ => return Err(DocumentStoreError::Backend("$inc requires numeric values".to_string())),
    };
    Ok(sum)
}

/// Applies an update to `document`, returning whether it changed.
///
/// Updates without operators replace every field but `_id`. A failing
/// operator leaves `document` untouched.
fn apply_update(
    document: &mut Document,
    update: &Document,
    inserting: bool,
) -> DocumentStoreResult<bool> {
    let mut updated = document.clone();
    apply_operators(&mut updated, update, inserting)?;
    let changed = updated != *document;
    *document = updated;
    Ok(changed)
}

fn apply_operators(
    document: &mut Document,
    update: &Document,
    inserting: bool,
) -> DocumentStoreResult<()> {
    if !update.keys().any(|key| key.starts_with('$')) {
        let id = document.get("_id").cloned();
        *document = update.clone();
        if let Some(id) = id {
            document.insert("_id", id);
        }
        return Ok(());
    }

    for (operator, fields) in update {
        let fields = fields
            .as_document()
            .ok_or_else(|| DocumentStoreError::Backend(format!("{operator} expects a document")))?;

        match operator.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(document, path, value.clone());
                }
            }
            "$setOnInsert" => {
                if inserting {
                    for (path, value) in fields {
                        set_path(document, path, value.clone());
                    }
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    unset_path(document, path);
                }
            }
            "$inc" => {
                for (path, by) in fields {
                    let sum = increment(document.get(path), by)?;
                    set_path(document, path, sum);
                }
            }
            other => {
                return Err(DocumentStoreError::Backend(format!(
                    "unsupported update operator {other}"
                )));
            }
        }
    }

    Ok(())
}

/// Seeds an upserted document with the equality fields of its filter.
fn upsert_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (key, value) in filter {
        if key.starts_with('$') {
            continue;
        }
        let is_operator = matches!(
            value,
            Bson::Document(inner) if inner.keys().next().is_some_and(|key| key.starts_with('$'))
        );
        if !is_operator {
            set_path(&mut seed, key, value.clone());
        }
    }
    seed
}

fn insert_document(
    documents: &mut Vec<Document>,
    mut document: Document,
    collection: &str,
) -> DocumentStoreResult<Bson> {
    let id = match document.get("_id") {
        Some(id) => id.clone(),
        None => {
            let id = Bson::ObjectId(ObjectId::new());
            document.insert("_id", id.clone());
            id
        }
    };

    if documents.iter().any(|existing| existing.get("_id") == Some(&id)) {
        return Err(DocumentStoreError::Backend(format!(
            "duplicate key {id} in collection {collection}"
        )));
    }

    documents.push(document);
    Ok(id)
}

fn update_one_in(
    documents: &mut Vec<Document>,
    collection: &str,
    filter: &Document,
    update: &Document,
    upsert: bool,
) -> DocumentStoreResult<UpdateOutcome> {
    if let Some(position) = first_match(documents, filter)? {
        let modified = apply_update(&mut documents[position], update, false)?;
        return Ok(UpdateOutcome {
            matched: 1,
            modified: u64::from(modified),
            upserted_id: None,
        });
    }

    if !upsert {
        return Ok(UpdateOutcome::default());
    }

    let mut document = upsert_seed(filter);
    apply_update(&mut document, update, true)?;
    let id = insert_document(documents, document, collection)?;

    Ok(UpdateOutcome {
        matched: 0,
        modified: 0,
        upserted_id: Some(id),
    })
}

/// Returns the matched and modified counts.
fn update_many_in(
    documents: &mut [Document],
    filter: &Document,
    update: &Document,
) -> DocumentStoreResult<(u64, u64)> {
    let vars = Vars::new();
    let (mut matched, mut modified) = (0, 0);
    for document in documents.iter_mut() {
        if matches(document, filter, &vars)? {
            matched += 1;
            modified += u64::from(apply_update(document, update, false)?);
        }
    }
    Ok((matched, modified))
}

fn delete_many_in(documents: &mut Vec<Document>, filter: &Document) -> DocumentStoreResult<u64> {
    let vars = Vars::new();
    let mut kept = Vec::with_capacity(documents.len());
    for document in documents.iter() {
        if !matches(document, filter, &vars)? {
            kept.push(document.clone());
        }
    }
    let deleted = (documents.len() - kept.len()) as u64;
    *documents = kept;
    Ok(deleted)
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn find_documents(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> DocumentStoreResult<Vec<Document>> {
        let store = self.store.read().await;
        let Some(documents) = store.get(collection) else {
            return Ok(vec![]);
        };

        let mut found = filter_documents(documents, &filter)?;
        if let Some(sort) = &options.sort {
            sort_documents(&mut found, sort);
        }

        let skip = usize::try_from(options.skip.unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = match options.limit {
            Some(limit) if limit != 0 => {
                usize::try_from(limit.unsigned_abs()).unwrap_or(usize::MAX)
            }
            _ => usize::MAX,
        };

        Ok(found.into_iter().skip(skip).take(limit).collect())
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> DocumentStoreResult<Vec<Document>> {
        let store = self.store.read().await;
        let documents = store.get(collection).cloned().unwrap_or_default();

        debug!(collection, stages = pipeline.len(), "running pipeline in memory");
        run(&store, documents, &pipeline, &Vars::new())
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: Document,
    ) -> DocumentStoreResult<u64> {
        let store = self.store.read().await;
        let Some(documents) = store.get(collection) else {
            return Ok(0);
        };

        let vars = Vars::new();
        let mut count = 0;
        for document in documents {
            if matches(document, &filter, &vars)? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        sort: Option<Document>,
    ) -> DocumentStoreResult<Option<Document>> {
        let mut store = self.store.write().await;
        let Some(documents) = store.get_mut(collection) else {
            return Ok(None);
        };

        let mut candidates = filter_documents(documents.iter(), &filter)?;
        if let Some(sort) = &sort {
            sort_documents(&mut candidates, sort);
        }
        let target = candidates
            .first()
            .and_then(|document| document.get("_id"))
            .cloned();
        let Some(target) = target else {
            return Ok(None);
        };

        let Some(position) = documents
            .iter()
            .position(|document| document.get("_id") == Some(&target))
        else {
            return Ok(None);
        };

        apply_update(&mut documents[position], &update, false)?;
        Ok(Some(documents[position].clone()))
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> DocumentStoreResult<u64> {
        let mut store = self.store.write().await;
        let Some(documents) = store.get_mut(collection) else {
            return Ok(0);
        };

        match first_match(documents, &filter)? {
            Some(position) => {
                documents.remove(position);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> DocumentStoreResult<UpdateOutcome> {
        let mut store = self.store.write().await;
        let documents = store.entry(collection.to_string()).or_default();

        update_one_in(documents, collection, &filter, &update, upsert)
    }

    async fn bulk_write(
        &self,
        collection: &str,
        operations: Vec<WriteOp>,
    ) -> DocumentStoreResult<BulkWriteOutcome> {
        let mut store = self.store.write().await;
        let documents = store.entry(collection.to_string()).or_default();

        let mut outcome = BulkWriteOutcome::default();
        let mut errors = Vec::new();

        for operation in operations {
            let result = match operation {
                WriteOp::InsertOne { document } => {
                    insert_document(documents, document, collection).map(|_| outcome.inserted += 1)
                }
                WriteOp::UpdateOne { filter, update, upsert } => {
                    update_one_in(documents, collection, &filter, &update, upsert).map(|updated| {
                        outcome.matched += updated.matched;
                        outcome.modified += updated.modified;
                        outcome.upserted += u64::from(updated.upserted_id.is_some());
                    })
                }
                WriteOp::UpdateMany { filter, update } => {
                    update_many_in(documents, &filter, &update).map(|(matched, modified)| {
                        outcome.matched += matched;
                        outcome.modified += modified;
                    })
                }
                WriteOp::DeleteMany { filter } => {
                    delete_many_in(documents, &filter).map(|deleted| outcome.deleted += deleted)
                }
            };

            if let Err(error) = result {
                debug!(collection, error = %error, "bulk write operation failed");
                errors.push(error.to_string());
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
}

/// Builder for constructing [`InMemoryStore`] instances.
///
/// # Example
///
/// ```ignore
/// use doclink_memory::InMemoryStore;
/// use doclink::backend::StoreBackendBuilder;
///
/// #[tokio::main]
/// async fn main() {
///     let store = InMemoryStore::builder().build().await.unwrap();
/// }
/// ```
#[derive(Default)]
pub struct InMemoryStoreBuilder;

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    /// Builds and returns a new [`InMemoryStore`] instance.
    async fn build(self) -> DocumentStoreResult<Self::Backend> {
        Ok(InMemoryStore::new())
    }
}
