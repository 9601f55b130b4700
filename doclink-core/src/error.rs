//! Error types and result types for document store operations.
//!
//! Coercion and filter errors are raised while compiling a request, before any
//! round trip to the store. Use [`DocumentStoreResult<T>`] as the return type
//! for fallible operations.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors that can occur when interacting with a document store.
#[derive(Error, Debug)]
pub enum DocumentStoreError {
    /// A value declared as an identifier could not be parsed.
    #[error("Invalid identifier for field {field}: {value}")]
    InvalidIdentifier { field: String, value: String },
    /// A value declared as an ISO date could not be parsed.
    #[error("Invalid date for field {field}: {value}")]
    InvalidDate { field: String, value: String },
    /// A value could not be coerced to the declared field type.
    #[error("Invalid value for field {field}: expected {expected}")]
    InvalidValue { field: String, expected: String },
    /// A filter value has a shape the compiler does not understand for the field's type.
    #[error("Unsupported filter shape for field {field}: {shape}")]
    UnsupportedFilterShape { field: String, shape: String },
    /// The requested document was not found in the collection.
    /// The first argument is the document ID, the second is the collection name.
    #[error("Document not found {0} in collection {1}")]
    DocumentNotFound(String, String),
    /// The backend answered with a result the orchestrator cannot interpret.
    #[error("Unexpected store result: {0}")]
    UnexpectedStoreResult(String),
    /// A bulk write against a related collection failed.
    #[error("Cascade write for relation {relation} on collection {collection} failed: {message}")]
    CascadeWriteFailure {
        relation: String,
        collection: String,
        message: String,
    },
    /// A lifecycle hook rejected the operation.
    #[error("Hook error: {0}")]
    Hook(String),
    /// Serialization/deserialization error when converting between document formats (BSON, JSON).
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Error during store initialization or connection setup.
    #[error("Initialization error: {0}")]
    Initialization(String),
    /// An error occurred in the underlying storage backend.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// A specialized `Result` type for document store operations.
pub type DocumentStoreResult<T> = Result<T, DocumentStoreError>;

impl From<BsonError> for DocumentStoreError {
    fn from(err: BsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for DocumentStoreError {
    fn from(err: SerdeJsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}
