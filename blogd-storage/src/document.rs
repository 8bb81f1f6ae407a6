//! Documents and query filters.

use crate::error::StorageError;
use crate::object_id::ObjectId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// Field holding a document's identifier.
pub const ID_FIELD: &str = "_id";

/// A stored document: a JSON object keyed by field name.
pub type Document = Map<String, Value>;

/// Selects documents in a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Every document.
    All,
    /// The document whose `_id` equals the given identifier.
    Id(ObjectId),
}

impl Filter {
    pub fn by_id(id: ObjectId) -> Self {
        Filter::Id(id)
    }

    /// Returns whether a document stored under `id` is selected.
    pub fn matches(&self, id: &ObjectId) -> bool {
        match self {
            Filter::All => true,
            Filter::Id(wanted) => wanted == id,
        }
    }
}

/// Serializes a value into a document. Fails unless the value is an object.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StorageError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StorageError::InvalidDocument(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

/// Deserializes a document into a typed value.
pub fn from_document<T: DeserializeOwned>(document: Document) -> Result<T, StorageError> {
    Ok(serde_json::from_value(Value::Object(document))?)
}

/// Returns the identifier of a document, if it carries a valid one.
pub fn document_id(document: &Document) -> Option<ObjectId> {
    document.get(ID_FIELD).and_then(ObjectId::from_value)
}
