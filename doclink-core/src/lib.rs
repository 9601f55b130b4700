//! A schema-driven, relation-aware access layer over document databases.
//!
//! This crate is the core of the doclink project and provides:
//!
//! - **Schemas** ([`schema`], [`relation`]) - Field registries, relations and per-kind policy
//! - **Type coercion** ([`coerce`]) - Conversion between wire records and storage documents
//! - **Filter compilation** ([`filter`]) - Request parameters to native filters
//! - **Sorting and pagination** ([`page`]) - Sort specs, page bounds and result pages
//! - **Pipeline synthesis** ([`pipeline`]) - Aggregation stages resolving relations
//! - **Redaction** ([`redact`]) - Removal of protected fields
//! - **Store backend abstraction** ([`backend`]) - Traits for implementing storage backends
//! - **Collections interface** ([`collection`], [`cascade`]) - Reads, saves and cascading removals
//! - **Lifecycle hooks** ([`hooks`]) - Callbacks around writes
//! - **Document store** ([`store`]) - Entry point binding schemas to a backend
//! - **Error handling** ([`error`]) - Error types and result types
//!
//! # Example
//!
//! ```ignore
//! use doclink::prelude::*;
//!
//! struct User;
//!
//! impl Model for User {
//!     fn schema() -> Schema {
//!         Schema::builder("users")
//!             .field("name", FieldType::String)
//!             .field("password", FieldType::String)
//!             .protected("password")
//!             .build()
//!     }
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as doclink_core;

pub mod backend;
pub mod cascade;
pub mod coerce;
pub mod collection;
pub mod error;
pub mod filter;
pub mod hooks;
pub mod page;
pub mod pipeline;
pub mod redact;
pub mod relation;
pub mod schema;
pub mod store;
