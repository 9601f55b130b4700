//! In-memory document storage backend for doclink.
//!
//! This crate provides a thread-safe, in-memory implementation of the `StoreBackend` trait.
//! Collections are kept as vectors of BSON documents behind an async-aware read-write
//! lock, which makes it a good fit for development and testing.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using async-aware RwLock
//! - **Filter evaluation** - Comparison, set and logical query operators
//! - **Aggregation** - The pipeline stages doclink emits, including `$lookup` joins
//! - **Unordered bulk writes** - Every operation is attempted before errors are reported
//!
//! # Quick Start
//!
//! ```ignore
//! use doclink::{prelude::*, memory::InMemoryStore};
//! use serde_json::json;
//!
//! struct User;
//!
//! impl Model for User {
//!     fn schema() -> Schema {
//!         Schema::builder("users").field("name", FieldType::String).build()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = DocumentStore::new(InMemoryStore::builder().build().await?);
//!     let users = store.collection::<User>();
//!
//!     let record = json!({ "name": "Alice" }).as_object().cloned().unwrap_or_default();
//!     users.save(record).await?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as doclink_memory;

mod aggregate;
mod evaluator;
pub mod store;

pub use store::{InMemoryStore, InMemoryStoreBuilder};
