//! # blogd-storage
//!
//! Document storage backend for blogd.
//!
//! This crate provides:
//! - `ObjectId`, the backend-native document identifier, and its hex encoding
//! - JSON documents and query filters
//! - The `DocumentStore` trait consumed by the request handlers
//! - An in-memory `Collection` with lazy, self-releasing cursors
//! - A `Database` that persists collections to disk on close

pub mod collection;
pub mod database;
pub mod document;
pub mod error;
pub mod object_id;
pub mod store;

pub use collection::Collection;
pub use database::{Database, StorageConfig};
pub use document::{document_id, from_document, to_document, Document, Filter, ID_FIELD};
pub use error::StorageError;
pub use object_id::{ObjectId, ObjectIdError};
pub use store::{Cursor, DeleteResult, DocumentStore, InsertOneResult, UpdateResult};
