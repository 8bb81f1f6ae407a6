//! The document store abstraction consumed by request handlers.

use crate::document::{Document, Filter};
use crate::error::StorageError;
use serde_json::Value;
use std::fmt;

/// Outcome of `insert_one`.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    /// Identifier of the inserted document, in document representation.
    ///
    /// Backends are expected to return an `ObjectId` here, but callers must
    /// not assume it.
    pub inserted_id: Value,
}

/// Outcome of `replace_one`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
}

/// Outcome of `delete_one`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// A single collection of documents.
///
/// Implementations must be safe to call from many connections at once. Each
/// call is atomic on its own; no multi-call transactions are offered.
pub trait DocumentStore: Send + Sync {
    /// Collection name.
    fn name(&self) -> &str;

    /// Inserts a document, assigning `_id` when absent.
    fn insert_one(&self, document: Document) -> Result<InsertOneResult, StorageError>;

    /// Returns the first document matching the filter.
    fn find_one(&self, filter: &Filter) -> Result<Option<Document>, StorageError>;

    /// Replaces the first document matching the filter, keeping its `_id`.
    fn replace_one(&self, filter: &Filter, replacement: Document)
        -> Result<UpdateResult, StorageError>;

    /// Deletes the first document matching the filter.
    fn delete_one(&self, filter: &Filter) -> Result<DeleteResult, StorageError>;

    /// Opens a cursor over all documents matching the filter.
    fn find(&self, filter: &Filter) -> Result<Cursor, StorageError>;

    /// Returns the number of stored documents.
    fn count_documents(&self) -> u64;
}

type DocumentIter = Box<dyn Iterator<Item = Result<Document, StorageError>> + Send>;
type CloseHook = Box<dyn FnOnce() + Send>;

/// A server-side cursor over query results.
///
/// Documents are produced lazily. The cursor is released exactly once: on an
/// explicit `close`, or when it is dropped, whichever comes first. After
/// release it yields nothing.
pub struct Cursor {
    inner: Option<DocumentIter>,
    on_close: Option<CloseHook>,
}

impl Cursor {
    pub fn new<I>(iter: I) -> Self
    where
        I: Iterator<Item = Result<Document, StorageError>> + Send + 'static,
    {
        Self {
            inner: Some(Box::new(iter)),
            on_close: None,
        }
    }

    /// Creates a cursor over an already materialized result set.
    pub fn from_documents(documents: Vec<Document>) -> Self {
        Self::new(documents.into_iter().map(Ok))
    }

    /// Registers a hook run when the cursor is released.
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Releases the cursor. Further calls are no-ops.
    pub fn close(&mut self) {
        self.inner = None;
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl Iterator for Cursor {
    type Item = Result<Document, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.as_mut()?.next()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("closed", &self.is_closed())
            .finish()
    }
}
