//! Main document store interface.
//!
//! # Example
//!
//! ```ignore
//! use doclink::store::DocumentStore;
//!
//! let store = DocumentStore::new(backend);
//! let users = store.collection::<User>();
//! ```

use crate::{
    backend::StoreBackend,
    collection::Collection,
    error::DocumentStoreResult,
    schema::{Model, Schema},
};

/// A document store bound to a specific backend implementation.
///
/// # Example
///
/// ```ignore
/// let store = DocumentStore::new(my_backend);
/// let users = store.collection::<User>();
/// ```
#[derive(Debug)]
pub struct DocumentStore<B: StoreBackend> {
    backend: B,
}

impl<B: StoreBackend> DocumentStore<B> {
    /// Creates a new document store with the given backend.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Gets the collection of record kind `M`.
    pub fn collection<M: Model>(&self) -> Collection<'_, B> {
        Collection::new(M::schema(), &self.backend)
    }

    /// Gets a collection described by an explicit schema.
    pub fn collection_for(&self, schema: Schema) -> Collection<'_, B> {
        Collection::new(schema, &self.backend)
    }

    /// Shuts the backend down.
    pub async fn shutdown(self) -> DocumentStoreResult<()> {
        self.backend.shutdown().await
    }
}
