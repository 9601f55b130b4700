//! MongoDB backend implementation for doclink.
//!
//! This crate provides a MongoDB-based implementation of the `StoreBackend` trait.
//! Filters, updates and aggregation pipelines built by doclink are handed to the
//! server unchanged, so relation resolution runs inside MongoDB.
//!
//! To use this backend, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! doclink = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use doclink::{backend::StoreBackendBuilder, mongodb::MongoDbStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoDbStore::builder("mongodb://localhost:27017", "my_database")
//!         .build()
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as doclink_mongodb;

pub mod store;

pub use store::{MongoDbStore, MongoDbStoreBuilder};
