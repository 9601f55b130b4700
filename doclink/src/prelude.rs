//! Convenient re-exports of commonly used types from doclink.
//!
//! Import this prelude module to quickly access the most frequently used types
//! and traits without needing to import from multiple sub-modules:
//!
//! ```ignore
//! use doclink::prelude::*;
//! ```
//!
//! This provides access to:
//! - Schema, field and relation declarations
//! - Store backends and builders
//! - Collection interfaces and read options
//! - Pagination and sorting
//! - Error types

pub use doclink_core::{
    backend::{StoreBackend, StoreBackendBuilder},
    cascade::{CascadeFailure, Cascaded},
    coerce::Record,
    collection::{Collection, ReadOptions},
    error::{DocumentStoreError, DocumentStoreResult},
    filter::Params,
    hooks::{HookPoint, ModelHooks},
    page::{Page, Pagination, SortDirection, SortSpec},
    relation::{CascadeOp, CascadePolicy, Relation, RelationKind},
    schema::{FieldType, Model, Schema},
    store::DocumentStore,
};
