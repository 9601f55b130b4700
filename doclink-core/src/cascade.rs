//! Propagation of parent writes to related collections.
//!
//! Nested input is coerced into a `CascadePlan` before the parent is written.
//! Running the plan is best effort: a failing bulk write is reported back to
//! the caller instead of aborting the parent operation, which has already been
//! persisted by then.

use std::collections::HashMap;

use bson::{doc, oid::ObjectId, Bson, DateTime, Document};
use serde_json::Value;

use crate::{
    backend::{FindOptions, StoreBackend, WriteOp},
    coerce::{coerce_value, preparse, represent},
    error::{DocumentStoreError, DocumentStoreResult},
    redact::redact,
    relation::{Relation, RelationKind},
    schema::{FieldType, Schema, CREATED_AT, DELETED_AT, ID_FIELD, UPDATED_AT},
};

/// A cascade that did not complete.
#[derive(Debug)]
pub struct CascadeFailure {
    /// Name of the relation whose write failed.
    pub relation: String,
    pub error: DocumentStoreError,
}

/// The result of a parent write together with the cascades that failed.
#[derive(Debug)]
pub struct Cascaded<T> {
    pub value: T,
    pub failures: Vec<CascadeFailure>,
}

impl<T> Cascaded<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            failures: Vec::new(),
        }
    }

    /// Whether every cascade succeeded.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

fn write_failure(
    relation: &Relation,
    collection: &str,
    error: DocumentStoreError,
) -> DocumentStoreError {
    DocumentStoreError::CascadeWriteFailure {
        relation: relation.name().to_string(),
        collection: collection.to_string(),
        message: error.to_string(),
    }
}

fn nested_items<'v>(relation: &Relation, nested: &'v Value) -> DocumentStoreResult<Vec<&'v Value>> {
    match (relation.kind().is_list(), nested) {
        (true, Value::Array(items)) => Ok(items.iter().collect()),
        (false, Value::Object(_)) => Ok(vec![nested]),
        _ => Err(DocumentStoreError::InvalidValue {
            field: relation.name().to_string(),
            expected: if relation.kind().is_list() { "array" } else { "object" }.to_string(),
        }),
    }
}

/// Builds the write for one nested record, returning its identifier.
///
/// Records carrying an identifier are upserted by it; others are inserted
/// under a fresh identifier with both timestamps set.
fn child_write(
    related: &Schema,
    item: &Value,
    foreign: Option<(&str, &Bson)>,
    now: DateTime,
) -> DocumentStoreResult<(ObjectId, WriteOp)> {
    let Value::Object(item) = item else {
        return Err(DocumentStoreError::InvalidValue {
            field: related.collection_name().to_string(),
            expected: "object".to_string(),
        });
    };

    let mut document = preparse(related, item)?;
    document.remove(DELETED_AT);
    if let Some((key, value)) = foreign {
        document.insert(key, value.clone());
    }
    document.insert(UPDATED_AT, now);

    match document.get_object_id(ID_FIELD) {
        Ok(id) => {
            document.remove(ID_FIELD);
            document.remove(CREATED_AT);
            let update = doc! {
                "$set": document,
                "$setOnInsert": { CREATED_AT: now },
            };
            Ok((
                id,
                WriteOp::UpdateOne {
                    filter: doc! { ID_FIELD: id },
                    update,
                    upsert: true,
                },
            ))
        }
        Err(_) => {
            let id = ObjectId::new();
            document.insert(ID_FIELD, id);
            document.insert(CREATED_AT, now);
            Ok((id, WriteOp::InsertOne { document }))
        }
    }
}

/// Reads the key linking a nested many-to-many item to its target.
fn target_key(
    related: &Schema,
    relation: &Relation,
    item: &Value,
) -> DocumentStoreResult<Option<Bson>> {
    let key = relation.foreign_key();
    let field_type = related.field_type(key).unwrap_or(FieldType::ObjectId);

    let value = match item {
        Value::Object(record) => record.get(key),
        other => Some(other),
    };

    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => coerce_value(key, field_type, value).map(Some),
    }
}

/// The writes a save cascades through one relation, built before anything is stored.
#[derive(Debug)]
pub(crate) enum CascadePlan {
    /// Nested records written to the related collection and re-fetched by identifier.
    Records {
        ids: Vec<ObjectId>,
        operations: Vec<WriteOp>,
    },
    /// Join rows replaced for a many-to-many relation. `clear` runs before `links`.
    Links {
        join_collection: String,
        clear: WriteOp,
        links: Vec<WriteOp>,
        keys: Vec<Bson>,
    },
}

/// Coerces the nested input of `relation` into the writes its cascade will issue.
///
/// Returns `None` when the relation kind does not cascade on save. Malformed
/// nested input fails here, so callers can reject a save before touching the store.
pub(crate) fn plan_related(
    relation: &Relation,
    parent: &Document,
    nested: &Value,
    now: DateTime,
) -> DocumentStoreResult<Option<CascadePlan>> {
    let related = relation.related_schema();
    let local = parent.get(relation.local_key()).cloned().unwrap_or(Bson::Null);
    let items = nested_items(relation, nested)?;

    let plan = match relation.kind() {
        RelationKind::HasMany
        | RelationKind::BelongsToMany
        | RelationKind::HasOne
        | RelationKind::BelongsTo => {
            let foreign = match relation.kind() {
                RelationKind::BelongsTo => None,
                _ => Some((relation.foreign_key(), &local)),
            };

            let mut ids = Vec::with_capacity(items.len());
            let mut operations = Vec::with_capacity(items.len());
            for item in items {
                let (id, operation) = child_write(&related, item, foreign, now)?;
                ids.push(id);
                operations.push(operation);
            }
            CascadePlan::Records { ids, operations }
        }
        RelationKind::ManyToMany {
            join_collection,
            local_join_key,
            foreign_join_key,
        } => {
            let mut keys = Vec::with_capacity(items.len());
            for item in items {
                if let Some(key) = target_key(&related, relation, item)? {
                    keys.push(key);
                }
            }

            let links = keys
                .iter()
                .map(|key| {
                    let pair = doc! {
                        local_join_key.as_str(): local.clone(),
                        foreign_join_key.as_str(): key.clone(),
                    };
                    WriteOp::UpdateOne {
                        filter: pair.clone(),
                        update: doc! { "$set": pair },
                        upsert: true,
                    }
                })
                .collect();

            CascadePlan::Links {
                join_collection: join_collection.clone(),
                clear: WriteOp::DeleteMany {
                    filter: doc! { local_join_key.as_str(): local },
                },
                links,
                keys,
            }
        }
        RelationKind::HasManyLocally => return Ok(None),
    };

    Ok(Some(plan))
}

/// Runs a planned cascade and returns the stored related records in wire form.
pub(crate) async fn save_related<B: StoreBackend>(
    backend: &B,
    relation: &Relation,
    plan: CascadePlan,
) -> DocumentStoreResult<Value> {
    let related = relation.related_schema();
    let collection = related.collection_name().to_string();

    let fetched = match plan {
        CascadePlan::Records { ids, operations } => {
            backend
                .bulk_write(&collection, operations)
                .await
                .map_err(|e| write_failure(relation, &collection, e))?;

            let documents = backend
                .find_documents(
                    &collection,
                    doc! { ID_FIELD: { "$in": ids.clone() } },
                    FindOptions::default(),
                )
                .await?;

            let mut by_id: HashMap<ObjectId, Document> = documents
                .into_iter()
                .filter_map(|document| Some((document.get_object_id(ID_FIELD).ok()?, document)))
                .collect();
            ids.iter()
                .filter_map(|id| by_id.remove(id))
                .collect::<Vec<_>>()
        }
        CascadePlan::Links {
            join_collection,
            clear,
            links,
            keys,
        } => {
            // Two batches: an unordered batch could clear the rows it just linked.
            backend
                .bulk_write(&join_collection, vec![clear])
                .await
                .map_err(|e| write_failure(relation, &join_collection, e))?;
            backend
                .bulk_write(&join_collection, links)
                .await
                .map_err(|e| write_failure(relation, &join_collection, e))?;

            backend
                .find_documents(
                    &collection,
                    doc! { relation.foreign_key(): { "$in": keys } },
                    FindOptions::default(),
                )
                .await?
        }
    };

    let mut records = fetched
        .iter()
        .map(|document| Value::Object(redact(&related, &represent(&related, document), &[])));

    let attached = if relation.kind().is_list() {
        Value::Array(records.collect())
    } else {
        records.next().unwrap_or(Value::Null)
    };

    Ok(attached)
}

/// Removes or soft-deletes the records related to a parent being removed.
///
/// Many-to-many relations only lose their join rows; the targets are shared.
pub(crate) async fn delete_related<B: StoreBackend>(
    backend: &B,
    relation: &Relation,
    parent: &Document,
    now: DateTime,
) -> DocumentStoreResult<()> {
    let local = parent
        .get(relation.local_key())
        .filter(|value| !matches!(value, Bson::Null));
    let Some(local) = local else {
        return Ok(());
    };

    let (collection, filter) = match relation.kind() {
        RelationKind::ManyToMany {
            join_collection,
            local_join_key,
            ..
        } => {
            let operations = vec![WriteOp::DeleteMany {
                filter: doc! { local_join_key.as_str(): local.clone() },
            }];
            return backend
                .bulk_write(join_collection, operations)
                .await
                .map(|_| ())
                .map_err(|e| write_failure(relation, join_collection, e));
        }
        RelationKind::HasManyLocally => (
            relation.related_schema().collection_name().to_string(),
            doc! { relation.foreign_key(): { "$in": local.clone() } },
        ),
        RelationKind::HasOne
        | RelationKind::HasMany
        | RelationKind::BelongsTo
        | RelationKind::BelongsToMany => (
            relation.related_schema().collection_name().to_string(),
            doc! { relation.foreign_key(): local.clone() },
        ),
    };

    let operation = if relation.uses_soft_deletes() {
        let mut filter = filter;
        filter.insert(DELETED_AT, Bson::Null);
        WriteOp::UpdateMany {
            filter,
            update: doc! { "$set": { DELETED_AT: now, UPDATED_AT: now } },
        }
    } else {
        WriteOp::DeleteMany { filter }
    };

    backend
        .bulk_write(&collection, vec![operation])
        .await
        .map(|_| ())
        .map_err(|e| write_failure(relation, &collection, e))
}
