use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use doclink::{
    backend::{BulkWriteOutcome, FindOptions, UpdateOutcome, WriteOp},
    bson::{doc, oid::ObjectId, Document},
    collection::record_id,
    memory::InMemoryStore,
    prelude::*,
    serde_json::{json, Value},
};

struct Order;
struct LineItem;
struct Customer;
struct User;
struct Tag;
struct Team;
struct Note;

impl Model for Order {
    fn schema() -> Schema {
        Schema::builder("orders")
            .field("number", FieldType::String)
            .field("total", FieldType::Double)
            .field("customer_id", FieldType::ObjectId)
            .relation(
                Relation::has_many::<LineItem>("items", "_id", "order_id")
                    .cascade(CascadePolicy::ALL)
                    .soft_deletes(true),
            )
            .relation(Relation::belongs_to::<Customer>("customer", "customer_id", "_id"))
            .soft_deletes(true)
            .build()
    }
}

impl Model for LineItem {
    fn schema() -> Schema {
        Schema::builder("line_items")
            .field("order_id", FieldType::ObjectId)
            .field("sku", FieldType::String)
            .field("quantity", FieldType::Integer)
            .soft_deletes(true)
            .build()
    }
}

impl Model for Customer {
    fn schema() -> Schema {
        Schema::builder("customers")
            .field("name", FieldType::String)
            .field("secret", FieldType::String)
            .protected("secret")
            .build()
    }
}

impl Model for User {
    fn schema() -> Schema {
        Schema::builder("users")
            .field("name", FieldType::String)
            .field("password", FieldType::String)
            .field("team_ids", FieldType::ObjectIdList)
            .protected("password")
            .relation(
                Relation::many_to_many::<Tag>(
                    "tags",
                    "_id",
                    "_id",
                    "user_tags",
                    "user_id",
                    "tag_id",
                )
                .cascade(CascadePolicy::ALL),
            )
            .relation(Relation::has_many_locally::<Team>("teams", "team_ids", "_id"))
            .build()
    }
}

impl Model for Tag {
    fn schema() -> Schema {
        Schema::builder("tags").field("label", FieldType::String).build()
    }
}

impl Model for Team {
    fn schema() -> Schema {
        Schema::builder("teams").field("name", FieldType::String).build()
    }
}

impl Model for Note {
    fn schema() -> Schema {
        Schema::builder("notes")
            .field("body", FieldType::String)
            .hook(HookPoint::PreCreate)
            .hook(HookPoint::PostCreate)
            .hook(HookPoint::PostDelete)
            .build()
    }
}

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

fn id_of(record: &Record) -> String {
    record_id(record).expect("record has an identifier").to_string()
}

fn skus(record: &Record) -> Vec<String> {
    record["items"]
        .as_array()
        .expect("items resolved")
        .iter()
        .map(|item| item["sku"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn save_cascades_nested_items_and_find_resolves_them() {
    let store = DocumentStore::new(InMemoryStore::new());
    let orders = store.collection::<Order>();

    let saved = orders
        .save(record(json!({
            "number": "A-1",
            "total": 12.5,
            "items": [{ "sku": "X", "quantity": 1 }, { "sku": "Y", "quantity": "2" }],
        })))
        .await
        .unwrap();
    assert!(saved.is_complete());

    let order_id = id_of(&saved.value);
    let items = saved.value["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|item| item["order_id"] == json!(order_id)));
    assert_eq!(items[1]["quantity"], json!(2));

    let found = orders
        .find(&doc! { "number": "A-1" }, &ReadOptions::default().with_relations(["items"]))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(skus(&found[0]), vec!["X", "Y"]);
    assert!(found[0].contains_key("created_at"));
}

#[tokio::test]
async fn updating_a_record_upserts_its_items_by_identifier() {
    let store = DocumentStore::new(InMemoryStore::new());
    let orders = store.collection::<Order>();

    let saved = orders
        .save(record(json!({ "number": "A-2", "items": [{ "sku": "X" }] })))
        .await
        .unwrap()
        .into_value();
    let order_id = id_of(&saved);
    let item_id = saved["items"][0]["_id"].as_str().unwrap().to_string();
    let created_at = saved["created_at"].clone();

    let updated = orders
        .save(record(json!({
            "_id": order_id,
            "number": "A-2b",
            "items": [{ "_id": item_id, "sku": "X2" }, { "sku": "Z" }],
        })))
        .await
        .unwrap();
    assert!(updated.is_complete());
    assert_eq!(skus(&updated.value), vec!["X2", "Z"]);

    let line_items = store.collection::<LineItem>();
    assert_eq!(line_items.count(&doc! {}).await.unwrap(), 2);

    let found = orders
        .first(&doc! { "_id": order_id.as_str() }, &ReadOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found["number"], json!("A-2b"));
    assert_eq!(found["created_at"], created_at);
}

#[tokio::test]
async fn dotted_parameters_filter_on_related_records() {
    let store = DocumentStore::new(InMemoryStore::new());
    let orders = store.collection::<Order>();

    for (number, sku) in [("B-1", "X"), ("B-2", "Y")] {
        orders
            .save(record(json!({ "number": number, "items": [{ "sku": sku }] })))
            .await
            .unwrap();
    }

    let found = orders
        .find(&doc! { "items.sku": "Y" }, &ReadOptions::default())
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["number"], json!("B-2"));
    assert_eq!(skus(&found[0]), vec!["Y"]);
}

#[tokio::test]
async fn belongs_to_resolves_a_single_redacted_record() {
    let store = DocumentStore::new(InMemoryStore::new());
    let customer = store
        .collection::<Customer>()
        .save(record(json!({ "name": "Ada", "secret": "s3cret" })))
        .await
        .unwrap()
        .into_value();
    assert!(!customer.contains_key("secret"));

    let orders = store.collection::<Order>();
    orders
        .save(record(json!({ "number": "C-1", "customer_id": id_of(&customer) })))
        .await
        .unwrap();
    orders
        .save(record(json!({ "number": "C-2" })))
        .await
        .unwrap();

    let found = orders
        .find(
            &doc! { "relations": "customer", "sort_asc": "number" },
            &ReadOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0]["customer"]["name"], json!("Ada"));
    assert!(found[0]["customer"].get("secret").is_none());
    assert_eq!(found[1]["customer"], Value::Null);
}

#[tokio::test]
async fn protected_fields_are_returned_only_when_whitelisted() {
    let store = DocumentStore::new(InMemoryStore::new());
    let users = store.collection::<User>();

    let saved = users
        .save(record(json!({ "name": "ada", "password": "hunter2" })))
        .await
        .unwrap()
        .into_value();
    assert!(!saved.contains_key("password"));

    let found = users.find(&doc! {}, &ReadOptions::default()).await.unwrap();
    assert!(!found[0].contains_key("password"));

    let found = users
        .find(&doc! {}, &ReadOptions::default().with_protected_fields(["password"]))
        .await
        .unwrap();
    assert_eq!(found[0]["password"], json!("hunter2"));
}

#[tokio::test]
async fn soft_remove_hides_the_record_and_cascades() {
    let store = DocumentStore::new(InMemoryStore::new());
    let orders = store.collection::<Order>();
    let line_items = store.collection::<LineItem>();

    let saved = orders
        .save(record(json!({ "number": "D-1", "items": [{ "sku": "X" }, { "sku": "Y" }] })))
        .await
        .unwrap()
        .into_value();
    let order_id = id_of(&saved);

    let removed = orders.remove(&order_id, false).await.unwrap();
    assert!(removed.is_complete());
    assert!(removed.value);

    assert_eq!(orders.count(&doc! {}).await.unwrap(), 0);
    assert_eq!(line_items.count(&doc! {}).await.unwrap(), 0);

    let hidden = orders
        .find(&doc! {}, &ReadOptions::default().with_deleted())
        .await
        .unwrap();
    assert_eq!(hidden.len(), 1);
    assert!(hidden[0]["deleted_at"].is_string());

    let again = orders.remove(&order_id, false).await;
    assert!(matches!(again, Err(DocumentStoreError::DocumentNotFound(..))));
}

#[tokio::test]
async fn forced_remove_deletes_the_record_and_its_items() {
    let store = DocumentStore::new(InMemoryStore::new());
    let orders = store.collection::<Order>();
    let line_items = store.collection::<LineItem>();

    let saved = orders
        .save(record(json!({ "number": "E-1", "items": [{ "sku": "X" }] })))
        .await
        .unwrap()
        .into_value();
    let order_id = id_of(&saved);

    assert!(orders.remove(&order_id, true).await.unwrap().value);
    assert!(!orders.remove(&order_id, true).await.unwrap().value);

    let everything = ReadOptions::default().with_deleted();
    assert!(orders.find(&doc! {}, &everything).await.unwrap().is_empty());

    // the relation marks its items instead of deleting them
    assert_eq!(line_items.count(&doc! {}).await.unwrap(), 0);
    assert_eq!(line_items.find(&doc! {}, &everything).await.unwrap().len(), 1);
}

#[tokio::test]
async fn removing_with_a_malformed_identifier_fails() {
    let store = DocumentStore::new(InMemoryStore::new());
    let result = store.collection::<Order>().remove("not-an-id", false).await;

    assert!(matches!(result, Err(DocumentStoreError::InvalidIdentifier { .. })));
}

#[tokio::test]
async fn paged_echoes_bounds_and_counts_all_matches() {
    let store = DocumentStore::new(InMemoryStore::new());
    let orders = store.collection::<Order>();

    for total in 1..=5 {
        orders
            .save(record(json!({ "number": format!("P-{total}"), "total": total })))
            .await
            .unwrap();
    }

    let page = orders
        .paged(
            &doc! {},
            &doc! { "page": 1, "page_size": "2", "sort_desc": "total" },
            &ReadOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(page.count, 5);
    assert_eq!(page.page, 1);
    assert_eq!(page.page_size, 2);
    let totals: Vec<f64> = page
        .results
        .iter()
        .map(|order| order["total"].as_f64().unwrap())
        .collect();
    assert_eq!(totals, vec![3.0, 2.0]);

    let defaults = orders
        .paged(&doc! { "number": "P-4" }, &doc! {}, &ReadOptions::default())
        .await
        .unwrap();
    assert_eq!(defaults.count, 1);
    assert_eq!((defaults.page, defaults.page_size), (0, 50));

    let invalid = orders
        .paged(&doc! {}, &doc! { "page": -1 }, &ReadOptions::default())
        .await;
    assert!(matches!(invalid, Err(DocumentStoreError::InvalidValue { .. })));
}

#[tokio::test]
async fn paged_counts_through_relation_filters() {
    let store = DocumentStore::new(InMemoryStore::new());
    let orders = store.collection::<Order>();

    for (number, sku) in [("Q-1", "X"), ("Q-2", "Y"), ("Q-3", "Y")] {
        orders
            .save(record(json!({ "number": number, "items": [{ "sku": sku }] })))
            .await
            .unwrap();
    }

    let page = orders
        .paged(&doc! { "items.sku": "Y" }, &doc! { "page_size": 1 }, &ReadOptions::default())
        .await
        .unwrap();
    assert_eq!(page.count, 2);
    assert_eq!(page.results.len(), 1);
}

#[tokio::test]
async fn find_and_update_refreshes_the_first_match() {
    let store = DocumentStore::new(InMemoryStore::new());
    let orders = store.collection::<Order>();

    for (number, total) in [("F-1", 1.0), ("F-2", 2.0)] {
        orders
            .save(record(json!({ "number": number, "total": total })))
            .await
            .unwrap();
    }

    let updated = orders
        .find_and_update(&doc! { "sort_desc": "total" }, doc! { "total": 20.0 })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated["number"], json!("F-2"));
    assert_eq!(updated["total"], json!(20.0));

    let missing = orders
        .find_and_update(&doc! { "number": "nope" }, doc! { "$set": { "total": 0.0 } })
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn many_to_many_save_rewrites_join_rows() {
    let store = DocumentStore::new(InMemoryStore::new());
    let tags = store.collection::<Tag>();
    let users = store.collection::<User>();

    let mut tag_ids = Vec::new();
    for label in ["red", "green", "blue"] {
        let tag = tags.save(record(json!({ "label": label }))).await.unwrap().into_value();
        tag_ids.push(id_of(&tag));
    }

    let saved = users
        .save(record(json!({
            "name": "ada",
            "tags": [{ "_id": tag_ids[0] }, tag_ids[1]],
        })))
        .await
        .unwrap();
    assert!(saved.is_complete());
    assert_eq!(saved.value["tags"].as_array().unwrap().len(), 2);
    assert_eq!(store.backend().count_documents("user_tags", doc! {}).await.unwrap(), 2);

    let user_id = id_of(&saved.value);
    users
        .save(record(json!({ "_id": user_id, "tags": [tag_ids[2]] })))
        .await
        .unwrap();
    assert_eq!(store.backend().count_documents("user_tags", doc! {}).await.unwrap(), 1);

    let found = users
        .first(&doc! { "relations": "tags" }, &ReadOptions::default())
        .await
        .unwrap()
        .unwrap();
    let labels: Vec<&str> = found["tags"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|tag| tag["label"].as_str())
        .collect();
    assert_eq!(labels, vec!["blue"]);
    assert_eq!(found["name"], json!("ada"));
    assert!(!found.contains_key("password"));
}

#[tokio::test]
async fn locally_held_references_resolve_in_any_order() {
    let store = DocumentStore::new(InMemoryStore::new());
    let teams = store.collection::<Team>();

    let mut team_ids = Vec::new();
    for name in ["core", "infra", "docs"] {
        let team = teams.save(record(json!({ "name": name }))).await.unwrap().into_value();
        team_ids.push(id_of(&team));
    }

    let users = store.collection::<User>();
    users
        .save(record(json!({
            "name": "ada",
            "team_ids": format!("{},{}", team_ids[2], team_ids[0]),
        })))
        .await
        .unwrap();
    users
        .save(record(json!({ "name": "bob" })))
        .await
        .unwrap();

    let found = users
        .find(
            &doc! { "sort_asc": "name" },
            &ReadOptions::default().with_relations(["teams"]),
        )
        .await
        .unwrap();
    let names: Vec<&str> = found[0]["teams"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|team| team["name"].as_str())
        .collect();
    assert_eq!(names, vec!["core", "docs"]);
    assert_eq!(found[1]["teams"], json!([]));
}

#[tokio::test]
async fn filters_reject_malformed_values() {
    let store = DocumentStore::new(InMemoryStore::new());
    let orders = store.collection::<Order>();

    let bad_id = orders
        .find(&doc! { "customer_id": "zzz" }, &ReadOptions::default())
        .await;
    assert!(matches!(bad_id, Err(DocumentStoreError::InvalidIdentifier { .. })));

    let bad_number = orders
        .find(&doc! { "total": "lots" }, &ReadOptions::default())
        .await;
    assert!(matches!(bad_number, Err(DocumentStoreError::InvalidValue { .. })));
}

#[tokio::test]
async fn text_fields_match_case_insensitive_substrings() {
    let store = DocumentStore::new(InMemoryStore::new());
    let orders = store.collection::<Order>();

    for number in ["north-1", "NORTH-2", "south-1"] {
        orders.save(record(json!({ "number": number }))).await.unwrap();
    }

    let found = orders
        .find(
            &doc! { "number": "north", "text_fields": "number", "sort_asc": "number" },
            &ReadOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
}

#[tokio::test]
async fn malformed_nested_items_reject_the_whole_save() {
    let store = DocumentStore::new(InMemoryStore::new());
    let orders = store.collection::<Order>();
    let line_items = store.collection::<LineItem>();

    let bad_id = orders
        .save(record(json!({ "number": "X", "items": [{ "_id": "bad-id", "sku": "A" }] })))
        .await;
    assert!(matches!(bad_id, Err(DocumentStoreError::InvalidIdentifier { .. })));

    let bad_shape = orders
        .save(record(json!({ "number": "Y", "items": { "sku": "A" } })))
        .await;
    assert!(matches!(bad_shape, Err(DocumentStoreError::InvalidValue { .. })));

    let everything = ReadOptions::default().with_deleted();
    assert!(orders.find(&doc! {}, &everything).await.unwrap().is_empty());
    assert!(line_items.find(&doc! {}, &everything).await.unwrap().is_empty());
}

#[tokio::test]
async fn reads_default_to_ascending_identifiers() {
    let store = DocumentStore::new(InMemoryStore::new());
    let orders = store.collection::<Order>();

    for (id, number) in [
        ("bbbbbbbbbbbbbbbbbbbbbbbb", "B"),
        ("aaaaaaaaaaaaaaaaaaaaaaaa", "A"),
        ("cccccccccccccccccccccccc", "C"),
    ] {
        orders
            .save(record(json!({ "_id": id, "number": number, "items": [{ "sku": number }] })))
            .await
            .unwrap();
    }

    let numbers = |records: &[Record]| -> Vec<String> {
        records
            .iter()
            .map(|order| order["number"].as_str().unwrap_or_default().to_string())
            .collect()
    };

    let plain = orders.find(&doc! {}, &ReadOptions::default()).await.unwrap();
    assert_eq!(numbers(&plain), vec!["A", "B", "C"]);

    let resolved = orders
        .find(&doc! {}, &ReadOptions::default().with_relations(["items"]))
        .await
        .unwrap();
    assert_eq!(numbers(&resolved), vec!["A", "B", "C"]);

    let first = orders
        .first(&doc! {}, &ReadOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first["number"], json!("A"));

    let updated = orders
        .find_and_update(&doc! {}, doc! { "total": 1.0 })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated["number"], json!("A"));

    let descending = orders
        .find(&doc! { "sort_desc": "number" }, &ReadOptions::default())
        .await
        .unwrap();
    assert_eq!(numbers(&descending), vec!["C", "B", "A"]);
}

#[tokio::test]
async fn reads_with_relations_issue_a_single_aggregate() {
    let store = DocumentStore::new(Recording::default());
    let orders = store.collection::<Order>();

    orders
        .save(record(json!({ "number": "H-1", "items": [{ "sku": "X" }, { "sku": "Y" }] })))
        .await
        .unwrap();
    store.backend().take_calls();

    let found = orders
        .find(
            &doc! {},
            &ReadOptions::default().with_relations(["items", "customer"]),
        )
        .await
        .unwrap();
    assert_eq!(skus(&found[0]), vec!["X", "Y"]);
    assert_eq!(found[0]["customer"], Value::Null);
    assert_eq!(store.backend().take_calls(), vec!["aggregate orders".to_string()]);

    orders
        .paged(
            &doc! {},
            &doc! { "page_size": 1 },
            &ReadOptions::default().with_relations(["items"]),
        )
        .await
        .unwrap();
    assert_eq!(
        store.backend().take_calls(),
        vec!["count_documents orders".to_string(), "aggregate orders".to_string()]
    );

    orders.find(&doc! {}, &ReadOptions::default()).await.unwrap();
    assert_eq!(store.backend().take_calls(), vec!["find_documents orders".to_string()]);
}

#[tokio::test]
async fn many_to_many_save_clears_join_rows_before_linking() {
    let store = DocumentStore::new(Recording::default());
    let tags = store.collection::<Tag>();
    let users = store.collection::<User>();

    let mut tag_ids = Vec::new();
    for label in ["red", "green"] {
        let tag = tags.save(record(json!({ "label": label }))).await.unwrap().into_value();
        tag_ids.push(id_of(&tag));
    }
    store.backend().take_calls();

    let saved = users
        .save(record(json!({ "name": "ada", "tags": [tag_ids[0], tag_ids[1]] })))
        .await
        .unwrap();
    assert!(saved.is_complete());

    let batches: Vec<String> = store
        .backend()
        .take_calls()
        .into_iter()
        .filter(|call| call.starts_with("bulk_write"))
        .collect();
    assert_eq!(
        batches,
        vec![
            "bulk_write user_tags [delete_many]".to_string(),
            "bulk_write user_tags [update_one, update_one]".to_string(),
        ]
    );
    assert_eq!(store.backend().count_documents("user_tags", doc! {}).await.unwrap(), 2);
}

#[derive(Debug, Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelHooks for Recorder {
    async fn pre_create(&self, record: &Record) -> DocumentStoreResult<()> {
        self.push(format!("pre_create:{}", record["body"]));
        Ok(())
    }

    async fn post_create(&self, record: &Record) -> DocumentStoreResult<()> {
        self.push(format!("post_create:{}", record_id(record).is_some()));
        Ok(())
    }

    async fn pre_update(&self, _record: &Record) -> DocumentStoreResult<()> {
        self.push("pre_update".to_string());
        Ok(())
    }

    async fn post_delete(
        &self,
        _id: &ObjectId,
        record: Option<&Record>,
        soft: bool,
    ) -> DocumentStoreResult<()> {
        self.push(format!("post_delete:{}:{soft}", record.is_some()));
        Ok(())
    }
}

#[tokio::test]
async fn hooks_run_only_at_enabled_points() {
    let store = DocumentStore::new(InMemoryStore::new());
    let recorder = Arc::new(Recorder::default());
    let notes = store.collection::<Note>().with_hooks(recorder.clone());

    let saved = notes
        .save(record(json!({ "body": "hello" })))
        .await
        .unwrap()
        .into_value();
    notes
        .save(record(json!({ "_id": id_of(&saved), "body": "edited" })))
        .await
        .unwrap();
    notes.remove(&id_of(&saved), false).await.unwrap();

    assert_eq!(
        recorder.events(),
        vec![
            "pre_create:\"hello\"".to_string(),
            "post_create:true".to_string(),
            "post_delete:false:false".to_string(),
        ]
    );
}

struct Veto;

#[async_trait]
impl ModelHooks for Veto {
    async fn pre_create(&self, _record: &Record) -> DocumentStoreResult<()> {
        Err(DocumentStoreError::Hook("notes are read only".to_string()))
    }
}

#[tokio::test]
async fn failing_pre_hook_aborts_the_write() {
    let store = DocumentStore::new(InMemoryStore::new());
    let notes = store.collection::<Note>().with_hooks(Arc::new(Veto));

    let result = notes.save(record(json!({ "body": "hello" }))).await;
    assert!(matches!(result, Err(DocumentStoreError::Hook(_))));
    assert_eq!(notes.count(&doc! {}).await.unwrap(), 0);
}

/// Memory backend whose bulk writes always fail.
#[derive(Debug, Default)]
struct FailingBulkWrites(InMemoryStore);

#[async_trait]
impl StoreBackend for FailingBulkWrites {
    async fn find_documents(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> DocumentStoreResult<Vec<Document>> {
        self.0.find_documents(collection, filter, options).await
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> DocumentStoreResult<Vec<Document>> {
        self.0.aggregate(collection, pipeline).await
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: Document,
    ) -> DocumentStoreResult<u64> {
        self.0.count_documents(collection, filter).await
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        sort: Option<Document>,
    ) -> DocumentStoreResult<Option<Document>> {
        self.0.find_one_and_update(collection, filter, update, sort).await
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> DocumentStoreResult<u64> {
        self.0.delete_one(collection, filter).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> DocumentStoreResult<UpdateOutcome> {
        self.0.update_one(collection, filter, update, upsert).await
    }

    async fn bulk_write(
        &self,
        collection: &str,
        _operations: Vec<WriteOp>,
    ) -> DocumentStoreResult<BulkWriteOutcome> {
        Err(DocumentStoreError::Backend(format!("{collection} is unavailable")))
    }
}

#[tokio::test]
async fn cascade_failures_are_reported_without_undoing_the_parent() {
    let store = DocumentStore::new(FailingBulkWrites::default());
    let orders = store.collection::<Order>();

    let saved = orders
        .save(record(json!({ "number": "G-1", "items": [{ "sku": "X" }] })))
        .await
        .unwrap();
    assert!(!saved.is_complete());
    assert_eq!(saved.failures.len(), 1);
    assert_eq!(saved.failures[0].relation, "items");
    assert!(matches!(
        saved.failures[0].error,
        DocumentStoreError::CascadeWriteFailure { ref collection, .. } if collection == "line_items"
    ));
    assert!(!saved.value.contains_key("items"));
    assert_eq!(orders.count(&doc! {}).await.unwrap(), 1);

    let removed = orders.remove(&id_of(&saved.value), false).await.unwrap();
    assert!(removed.value);
    assert_eq!(removed.failures.len(), 1);
}

/// Memory backend that logs every call it receives.
#[derive(Debug, Default)]
struct Recording {
    inner: InMemoryStore,
    calls: Mutex<Vec<String>>,
}

impl Recording {
    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn take_calls(&self) -> Vec<String> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }
}

fn op_name(operation: &WriteOp) -> &'static str {
    match operation {
        WriteOp::InsertOne { .. } => "insert_one",
        WriteOp::UpdateOne { .. } => "update_one",
        WriteOp::UpdateMany { .. } => "update_many",
        WriteOp::DeleteMany { .. } => "delete_many",
    }
}

#[async_trait]
impl StoreBackend for Recording {
    async fn find_documents(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> DocumentStoreResult<Vec<Document>> {
        self.log(format!("find_documents {collection}"));
        self.inner.find_documents(collection, filter, options).await
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> DocumentStoreResult<Vec<Document>> {
        self.log(format!("aggregate {collection}"));
        self.inner.aggregate(collection, pipeline).await
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: Document,
    ) -> DocumentStoreResult<u64> {
        self.log(format!("count_documents {collection}"));
        self.inner.count_documents(collection, filter).await
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        sort: Option<Document>,
    ) -> DocumentStoreResult<Option<Document>> {
        self.log(format!("find_one_and_update {collection}"));
        self.inner.find_one_and_update(collection, filter, update, sort).await
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> DocumentStoreResult<u64> {
        self.log(format!("delete_one {collection}"));
        self.inner.delete_one(collection, filter).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> DocumentStoreResult<UpdateOutcome> {
        self.log(format!("update_one {collection}"));
        self.inner.update_one(collection, filter, update, upsert).await
    }

    async fn bulk_write(
        &self,
        collection: &str,
        operations: Vec<WriteOp>,
    ) -> DocumentStoreResult<BulkWriteOutcome> {
        let names: Vec<&str> = operations.iter().map(op_name).collect();
        self.log(format!("bulk_write {collection} [{}]", names.join(", ")));
        self.inner.bulk_write(collection, operations).await
    }
}
