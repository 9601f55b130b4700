//! Main doclink crate providing a unified interface over document databases.
//!
//! This crate is the primary entry point for users of the doclink framework.
//! It re-exports the core types from the sub-crates and provides access to the
//! storage backends.
//!
//! # Features
//!
//! - **Declarative schemas** - Typed fields, protected fields and soft deletes per record kind
//! - **Relations** - One-to-one, one-to-many, many-to-many and locally held references
//! - **Request-driven reads** - Flat parameter maps compiled to native filters and pipelines
//! - **Cascading writes** - Nested related records persisted alongside their parent
//! - **Multiple backends** - In-memory and MongoDB storage behind one trait
//!
//! # Quick Start
//!
//! ```ignore
//! use doclink::{prelude::*, memory::InMemoryStore};
//! use bson::doc;
//! use serde_json::json;
//!
//! struct Order;
//! struct LineItem;
//!
//! impl Model for Order {
//!     fn schema() -> Schema {
//!         Schema::builder("orders")
//!             .field("number", FieldType::String)
//!             .relation(
//!                 Relation::has_many::<LineItem>("items", "_id", "order_id")
//!                     .cascade(CascadePolicy::ALL),
//!             )
//!             .build()
//!     }
//! }
//!
//! impl Model for LineItem {
//!     fn schema() -> Schema {
//!         Schema::builder("line_items")
//!             .field("order_id", FieldType::ObjectId)
//!             .field("sku", FieldType::String)
//!             .build()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> DocumentStoreResult<()> {
//!     let store = DocumentStore::new(InMemoryStore::builder().build().await?);
//!     let orders = store.collection::<Order>();
//!
//!     let input = json!({ "number": "A-1", "items": [{ "sku": "X" }, { "sku": "Y" }] });
//!     let saved = orders.save(input.as_object().cloned().unwrap_or_default()).await?;
//!     assert!(saved.is_complete());
//!
//!     let found = orders
//!         .find(&doc! { "number": "A-1" }, &ReadOptions::default().with_relations(["items"]))
//!         .await?;
//!     println!("{found:?}");
//!
//!     store.shutdown().await
//! }
//! ```
//!
//! # Backends
//!
//! - [`memory`] - In-memory storage for development and testing
//! - [`mongodb`] - Persistent MongoDB backend (requires `mongodb` feature)

pub mod prelude;

pub use doclink_core::{
    backend, cascade, coerce, collection, error, filter, hooks, page, pipeline, redact, relation,
    schema, store,
};

// Re-export BSON and JSON types for convenience
pub use bson;
pub use serde_json;

/// In-memory storage backend implementations.
pub mod memory {
    pub use doclink_memory::{InMemoryStore, InMemoryStoreBuilder};
}

/// MongoDB storage backend implementations.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use doclink_mongodb::{MongoDbStore, MongoDbStoreBuilder};
}
