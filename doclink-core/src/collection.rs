//! Schema-aware access to one collection.
//!
//! A [`Collection`] binds a record kind's [`Schema`] to a backend. Reads compile
//! request parameters into a native filter, resolve requested relations with a
//! single aggregation round trip and return redacted wire records. Writes coerce
//! wire records to storage form, stamp timestamps, run lifecycle hooks and
//! cascade to related collections.
//!
//! # Example
//!
//! ```ignore
//! use bson::doc;
//! use doclink::collection::ReadOptions;
//!
//! # use doclink::{backend::StoreBackend, error::DocumentStoreResult, store::DocumentStore};
//! # async fn example(store: &DocumentStore<impl StoreBackend>) -> DocumentStoreResult<()> {
//! let orders = store.collection::<Order>();
//! let open = orders
//!     .find(&doc! { "status": "open" }, &ReadOptions::default().with_relations(["items"]))
//!     .await?;
//! # Ok(()) }
//! ```

use std::{fmt, sync::Arc};

use bson::{doc, oid::ObjectId, Bson, DateTime, Document};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    backend::{FindOptions, StoreBackend},
    cascade::{delete_related, plan_related, save_related, CascadeFailure, Cascaded},
    coerce::{parse_object_id, preparse, represent, Record},
    error::{DocumentStoreError, DocumentStoreResult},
    filter::{compile_filter, compile_relation_filters, list_param, Params},
    hooks::{HookPoint, ModelHooks},
    page::{paginate, sort_spec, Page},
    pipeline::PipelineBuilder,
    redact::{redact, redact_all},
    relation::{CascadeOp, Relation},
    schema::{Schema, CREATED_AT, DELETED_AT, ID_FIELD, UPDATED_AT},
};

/// Per-call read settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Relations to resolve, in addition to those named by the `relations` parameter.
    pub relations: Vec<String>,
    /// Protected fields to return anyway.
    pub protected_whitelist: Vec<String>,
    /// Stop after the first matching record.
    pub force_single_result: bool,
    /// Include soft-deleted records.
    pub with_deleted: bool,
}

impl ReadOptions {
    pub fn with_relations<I, S>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relations.extend(relations.into_iter().map(Into::into));
        self
    }

    pub fn with_protected_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protected_whitelist.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn with_single_result(mut self) -> Self {
        self.force_single_result = true;
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.with_deleted = true;
        self
    }
}

/// A record kind bound to a storage backend.
pub struct Collection<'a, B: StoreBackend> {
    schema: Schema,
    backend: &'a B,
    hooks: Option<Arc<dyn ModelHooks>>,
}

impl<B: StoreBackend> fmt::Debug for Collection<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("collection", &self.schema.collection_name())
            .field("backend", &self.backend)
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

impl<'a, B: StoreBackend> Collection<'a, B> {
    pub(crate) fn new(schema: Schema, backend: &'a B) -> Self {
        Self {
            schema,
            backend,
            hooks: None,
        }
    }

    /// Attaches lifecycle hooks. Only the points enabled in the schema run.
    pub fn with_hooks(mut self, hooks: Arc<dyn ModelHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn name(&self) -> &str {
        self.schema.collection_name()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn hooks_for(&self, point: HookPoint) -> Option<&dyn ModelHooks> {
        if self.schema.hooks().contains(point) {
            self.hooks.as_deref()
        } else {
            None
        }
    }

    /// Compiles the base filter, excluding soft-deleted records unless asked not to.
    fn base_filter(&self, params: &Params, with_deleted: bool) -> DocumentStoreResult<Document> {
        let mut filter = compile_filter(&self.schema, params)?;
        if !with_deleted && !filter.contains_key(DELETED_AT) {
            filter.insert(DELETED_AT, Bson::Null);
        }
        Ok(filter)
    }

    fn requested_relations(
        &self,
        params: &Params,
        options: &ReadOptions,
        scoped: Vec<String>,
    ) -> Vec<String> {
        let mut relations = options.relations.clone();
        relations.extend(list_param(params, "relations"));
        relations.extend(scoped);
        relations.sort_unstable();
        relations.dedup();
        relations
    }

    fn to_records(&self, documents: &[Document], whitelist: &[String]) -> Vec<Record> {
        let records: Vec<Record> = documents
            .iter()
            .map(|document| represent(&self.schema, document))
            .collect();
        redact_all(&self.schema, &records, whitelist)
    }

    /// Returns the records matching `params`, by ascending `_id` unless the
    /// parameters name a sort.
    ///
    /// Without relations this is a plain find; otherwise relations are resolved
    /// by one aggregation, and dotted `relation.field` parameters filter on them.
    pub async fn find(
        &self,
        params: &Params,
        options: &ReadOptions,
    ) -> DocumentStoreResult<Vec<Record>> {
        let filter = self.base_filter(params, options.with_deleted)?;
        let (scoped, relation_filter) = compile_relation_filters(&self.schema, params)?;
        let relations = self.requested_relations(params, options, scoped);
        let sort = sort_spec(params);

        let documents = if relations.is_empty() {
            let find_options = FindOptions {
                sort: Some(sort.to_document()),
                limit: options.force_single_result.then_some(1),
                ..FindOptions::default()
            };

            self.backend
                .find_documents(self.name(), filter, find_options)
                .await?
        } else {
            let mut stages = PipelineBuilder::new(&self.schema, filter)
                .relations(relations)
                .whitelist(options.protected_whitelist.iter().cloned())
                .sort(sort)
                .relation_filter(relation_filter)
                .build()
                .into_stages();
            if options.force_single_result {
                stages.push(doc! { "$limit": 1_i64 });
            }

            self.backend
                .aggregate(self.name(), stages)
                .await?
        };

        Ok(self.to_records(&documents, &options.protected_whitelist))
    }

    /// Returns the first record matching `params`, if any.
    pub async fn first(
        &self,
        params: &Params,
        options: &ReadOptions,
    ) -> DocumentStoreResult<Option<Record>> {
        let options = ReadOptions {
            force_single_result: true,
            ..options.clone()
        };

        Ok(self
            .find(params, &options)
            .await?
            .into_iter()
            .next())
    }

    /// Counts the live records matching `params`.
    pub async fn count(&self, params: &Params) -> DocumentStoreResult<u64> {
        let filter = self.base_filter(params, false)?;
        self.backend
            .count_documents(self.name(), filter)
            .await
    }

    /// Updates the first live record matching `criteria` and returns it as updated.
    ///
    /// An `update` without operators is applied as `$set`. `updated_at` is always
    /// refreshed. Sort parameters in `criteria` choose which record is first.
    pub async fn find_and_update(
        &self,
        criteria: &Params,
        update: Document,
    ) -> DocumentStoreResult<Option<Record>> {
        let filter = self.base_filter(criteria, false)?;
        let sort = Some(sort_spec(criteria).to_document());

        let mut update = if update.keys().any(|key| key.starts_with('$')) {
            update
        } else {
            doc! { "$set": update }
        };
        if !update.contains_key("$set") {
            update.insert("$set", Document::new());
        }
        if let Ok(set) = update.get_document_mut("$set") {
            set.insert(UPDATED_AT, DateTime::now());
        }

        let document = self
            .backend
            .find_one_and_update(self.name(), filter, update, sort)
            .await?;

        Ok(document.map(|document| redact(&self.schema, &represent(&self.schema, &document), &[])))
    }

    /// Returns one page of the records matching `params`.
    ///
    /// `pagination` carries `page`, `page_size` and the sort keys. The page echoes
    /// the effective page and page size alongside the total count.
    pub async fn paged(
        &self,
        params: &Params,
        pagination: &Params,
        options: &ReadOptions,
    ) -> DocumentStoreResult<Page<Record>> {
        let pagination = paginate(pagination)?;
        let filter = self.base_filter(params, options.with_deleted)?;
        let (scoped, relation_filter) = compile_relation_filters(&self.schema, params)?;
        let relations = self.requested_relations(params, options, scoped);

        let count = if relation_filter.is_empty() {
            self.backend
                .count_documents(self.name(), filter.clone())
                .await?
        } else {
            let mut stages = PipelineBuilder::new(&self.schema, filter.clone())
                .relations(relations.iter().cloned())
                .relation_filter(relation_filter.clone())
                .build()
                .into_stages();
            stages.push(doc! { "$count": "count" });

            let counted = self.backend.aggregate(self.name(), stages).await?;
            counted
                .first()
                .and_then(|document| match document.get("count") {
                    Some(Bson::Int32(count)) => u64::try_from(*count).ok(),
                    Some(Bson::Int64(count)) => u64::try_from(*count).ok(),
                    _ => None,
                })
                .unwrap_or(0)
        };

        let stages = PipelineBuilder::new(&self.schema, filter)
            .relations(relations)
            .whitelist(options.protected_whitelist.iter().cloned())
            .paginate(pagination.clone())
            .relation_filter(relation_filter)
            .build()
            .into_stages();
        let documents = self.backend.aggregate(self.name(), stages).await?;

        Ok(Page::builder(self.to_records(&documents, &options.protected_whitelist))
            .with_count(count)
            .with_page(pagination.page)
            .with_page_size(pagination.page_size)
            .build())
    }

    fn cascading(&self, op: CascadeOp) -> impl Iterator<Item = &Relation> {
        self.schema
            .relations()
            .iter()
            .filter(move |relation| relation.cascade_policy().allows(op))
    }

    /// Creates or updates a record and cascades its nested relations.
    ///
    /// A record without `_id` is created under a fresh identifier. `deleted_at`
    /// in the input is ignored. Nested relation values are written to their
    /// collections when the relation cascades the operation, and the stored
    /// related records are attached to the returned record. Malformed nested
    /// input rejects the whole save before anything is written.
    pub async fn save(&self, record: Record) -> DocumentStoreResult<Cascaded<Record>> {
        let now = DateTime::now();
        let mut document = preparse(&self.schema, &record)?;
        document.remove(DELETED_AT);

        let (id, op) = match document.get_object_id(ID_FIELD) {
            Ok(id) => {
                document.remove(CREATED_AT);
                (id, CascadeOp::Update)
            }
            Err(_) => {
                let id = ObjectId::new();
                document.insert(ID_FIELD, id);
                document.insert(CREATED_AT, now);
                (id, CascadeOp::Create)
            }
        };
        document.insert(UPDATED_AT, now);

        let mut plans = Vec::new();
        for relation in self.cascading(op) {
            let Some(nested) = record.get(relation.name()).filter(|value| !value.is_null()) else {
                continue;
            };
            match plan_related(relation, &document, nested, now)? {
                Some(plan) => plans.push((relation, plan)),
                None => debug!(relation = relation.name(), "relation does not cascade on save"),
            }
        }

        let wire = represent(&self.schema, &document);
        let (pre, post) = match op {
            CascadeOp::Create => (HookPoint::PreCreate, HookPoint::PostCreate),
            _ => (HookPoint::PreUpdate, HookPoint::PostUpdate),
        };
        if let Some(hooks) = self.hooks_for(pre) {
            match op {
                CascadeOp::Create => hooks.pre_create(&wire).await?,
                _ => hooks.pre_update(&wire).await?,
            }
        }

        let mut fields = document.clone();
        fields.remove(ID_FIELD);
        let outcome = self
            .backend
            .update_one(self.name(), doc! { ID_FIELD: id }, doc! { "$set": fields }, true)
            .await?;
        if outcome.matched == 0 && outcome.upserted_id.is_none() {
            return Err(DocumentStoreError::UnexpectedStoreResult(format!(
                "save of {} in {} neither matched nor upserted",
                id,
                self.name()
            )));
        }

        let mut saved = redact(&self.schema, &wire, &[]);
        let mut failures = Vec::new();
        for (relation, plan) in plans {
            match save_related(self.backend, relation, plan).await {
                Ok(attached) => {
                    saved.insert(relation.name().to_string(), attached);
                }
                Err(error) => {
                    warn!(
                        collection = self.name(),
                        relation = relation.name(),
                        error = %error,
                        "cascade on save failed"
                    );
                    failures.push(CascadeFailure {
                        relation: relation.name().to_string(),
                        error,
                    });
                }
            }
        }

        if let Some(hooks) = self.hooks_for(post) {
            match op {
                CascadeOp::Create => hooks.post_create(&saved).await?,
                _ => hooks.post_update(&saved).await?,
            }
        }

        Ok(Cascaded { value: saved, failures })
    }

    async fn cascade_delete(&self, parent: &Document, now: DateTime) -> Vec<CascadeFailure> {
        let mut failures = Vec::new();

        for relation in self.cascading(CascadeOp::Delete) {
            if let Err(error) = delete_related(self.backend, relation, parent, now).await {
                warn!(
                    collection = self.name(),
                    relation = relation.name(),
                    error = %error,
                    "cascade on remove failed"
                );
                failures.push(CascadeFailure {
                    relation: relation.name().to_string(),
                    error,
                });
            }
        }

        failures
    }

    async fn fetch_raw(&self, filter: Document) -> DocumentStoreResult<Option<Document>> {
        let mut options = FindOptions::default();
        options.limit = Some(1);

        Ok(self
            .backend
            .find_documents(self.name(), filter, options)
            .await?
            .into_iter()
            .next())
    }

    /// Removes the record identified by `id`.
    ///
    /// Kinds with soft deletes enabled are marked with `deleted_at` unless
    /// `force` is set; removing a record that is missing or already
    /// soft-deleted then fails with [`DocumentStoreError::DocumentNotFound`].
    /// A hard delete of a missing record returns `false`.
    pub async fn remove(&self, id: &str, force: bool) -> DocumentStoreResult<Cascaded<bool>> {
        let id = parse_object_id(ID_FIELD, id)?;
        if let Some(hooks) = self.hooks_for(HookPoint::PreDelete) {
            hooks.pre_delete(&id).await?;
        }

        let now = DateTime::now();
        let soft = self.schema.soft_deletes() && !force;

        if soft {
            let document = self
                .fetch_raw(doc! { ID_FIELD: id, DELETED_AT: Bson::Null })
                .await?
                .ok_or_else(|| {
                    DocumentStoreError::DocumentNotFound(id.to_hex(), self.name().to_string())
                })?;

            let failures = self.cascade_delete(&document, now).await;

            let mut fields = document;
            fields.remove(ID_FIELD);
            fields.insert(DELETED_AT, now);
            fields.insert(UPDATED_AT, now);
            let outcome = self
                .backend
                .update_one(
                    self.name(),
                    doc! { ID_FIELD: id },
                    doc! { "$set": fields.clone() },
                    false,
                )
                .await?;

            if let Some(hooks) = self.hooks_for(HookPoint::PostDelete) {
                fields.insert(ID_FIELD, id);
                let record = represent(&self.schema, &fields);
                hooks.post_delete(&id, Some(&record), true).await?;
            }

            return Ok(Cascaded {
                value: outcome.modified > 0,
                failures,
            });
        }

        let mut failures = Vec::new();
        if self.cascading(CascadeOp::Delete).next().is_some() {
            if let Some(document) = self.fetch_raw(doc! { ID_FIELD: id }).await? {
                failures = self.cascade_delete(&document, now).await;
            }
        }

        let removed = self
            .backend
            .delete_one(self.name(), doc! { ID_FIELD: id })
            .await?;

        if let Some(hooks) = self.hooks_for(HookPoint::PostDelete) {
            hooks.post_delete(&id, None, false).await?;
        }

        Ok(Cascaded {
            value: removed > 0,
            failures,
        })
    }
}

/// Reads the identifier of a wire record.
pub fn record_id(record: &Record) -> Option<&str> {
    match record.get(ID_FIELD) {
        Some(Value::String(id)) => Some(id),
        _ => None,
    }
}
