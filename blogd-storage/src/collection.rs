//! In-memory collection.

use crate::document::{document_id, Document, Filter, ID_FIELD};
use crate::error::StorageError;
use crate::object_id::ObjectId;
use crate::store::{Cursor, DeleteResult, DocumentStore, InsertOneResult, UpdateResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type DocumentMap = BTreeMap<ObjectId, Document>;

/// A collection of documents held in memory, ordered by `_id`.
///
/// Natural order is `_id` order, which for server-generated identifiers is
/// insertion order.
pub struct Collection {
    name: String,
    documents: Arc<RwLock<DocumentMap>>,
    open_cursors: Arc<AtomicUsize>,
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: Arc::new(RwLock::new(BTreeMap::new())),
            open_cursors: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Builds a collection from previously stored documents.
    pub(crate) fn from_documents(
        name: impl Into<String>,
        documents: Vec<Document>,
    ) -> Result<Self, StorageError> {
        let collection = Self::new(name);
        {
            let mut map = collection.documents.write();
            for document in documents {
                let id = document_id(&document).ok_or_else(|| {
                    StorageError::Corruption(format!(
                        "document without a valid _id in collection {}",
                        collection.name
                    ))
                })?;
                if map.insert(id, document).is_some() {
                    return Err(StorageError::Corruption(format!(
                        "duplicate _id {} in collection {}",
                        id, collection.name
                    )));
                }
            }
        }
        Ok(collection)
    }

    /// Returns a copy of all documents in natural order.
    pub(crate) fn snapshot(&self) -> Vec<Document> {
        self.documents.read().values().cloned().collect()
    }

    /// Number of cursors not yet released.
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    fn first_match(map: &DocumentMap, filter: &Filter) -> Option<ObjectId> {
        match filter {
            Filter::Id(id) => map.contains_key(id).then_some(*id),
            Filter::All => map.keys().next().copied(),
        }
    }
}

impl DocumentStore for Collection {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert_one(&self, mut document: Document) -> Result<InsertOneResult, StorageError> {
        let id = match document.get(ID_FIELD) {
            None => {
                let id = ObjectId::new();
                document.insert(ID_FIELD.to_string(), id.to_value());
                id
            }
            Some(value) => ObjectId::from_value(value).ok_or_else(|| {
                StorageError::InvalidDocument(format!("_id must be an ObjectId, got {}", value))
            })?,
        };

        let mut map = self.documents.write();
        if map.contains_key(&id) {
            return Err(StorageError::DuplicateKey(id));
        }
        map.insert(id, document);

        tracing::trace!("{}: inserted {}", self.name, id);
        Ok(InsertOneResult {
            inserted_id: id.to_value(),
        })
    }

    fn find_one(&self, filter: &Filter) -> Result<Option<Document>, StorageError> {
        let map = self.documents.read();
        Ok(Self::first_match(&map, filter).and_then(|id| map.get(&id).cloned()))
    }

    fn replace_one(
        &self,
        filter: &Filter,
        mut replacement: Document,
    ) -> Result<UpdateResult, StorageError> {
        let mut map = self.documents.write();
        let Some(id) = Self::first_match(&map, filter) else {
            return Ok(UpdateResult::default());
        };

        if let Some(value) = replacement.get(ID_FIELD) {
            if ObjectId::from_value(value) != Some(id) {
                return Err(StorageError::InvalidDocument(format!(
                    "_id is immutable: cannot replace {} with {}",
                    id, value
                )));
            }
        }
        replacement.insert(ID_FIELD.to_string(), id.to_value());

        let modified = match map.insert(id, replacement) {
            Some(previous) => previous != map[&id],
            None => true,
        };

        tracing::trace!("{}: replaced {} (modified={})", self.name, id, modified);
        Ok(UpdateResult {
            matched_count: 1,
            modified_count: modified as u64,
        })
    }

    fn delete_one(&self, filter: &Filter) -> Result<DeleteResult, StorageError> {
        let mut map = self.documents.write();
        let deleted = match Self::first_match(&map, filter) {
            Some(id) => map.remove(&id).is_some(),
            None => false,
        };
        Ok(DeleteResult {
            deleted_count: deleted as u64,
        })
    }

    fn find(&self, filter: &Filter) -> Result<Cursor, StorageError> {
        self.open_cursors.fetch_add(1, Ordering::SeqCst);
        let open_cursors = Arc::clone(&self.open_cursors);

        let scan = Scan {
            documents: Arc::clone(&self.documents),
            filter: *filter,
            last: None,
            done: false,
        };
        Ok(Cursor::new(scan).on_close(move || {
            open_cursors.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    fn count_documents(&self) -> u64 {
        self.len() as u64
    }
}

/// Lazy scan in `_id` order.
///
/// Only the read lock for a single step is held at a time, so writers are
/// never blocked by an idle cursor. Documents inserted behind the scan
/// position are not seen; those ahead of it are.
struct Scan {
    documents: Arc<RwLock<DocumentMap>>,
    filter: Filter,
    last: Option<ObjectId>,
    done: bool,
}

impl Iterator for Scan {
    type Item = Result<Document, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let map = self.documents.read();
        let lower = match self.last {
            Some(last) => Bound::Excluded(last),
            None => Bound::Unbounded,
        };
        let next = map
            .range((lower, Bound::Unbounded))
            .find(|(id, _)| self.filter.matches(id))
            .map(|(id, document)| (*id, document.clone()));

        match next {
            Some((id, document)) => {
                self.last = Some(id);
                Some(Ok(document))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn inserted(collection: &Collection, value: serde_json::Value) -> ObjectId {
        let result = collection.insert_one(doc(value)).unwrap();
        ObjectId::from_value(&result.inserted_id).unwrap()
    }

    #[test]
    fn test_insert_assigns_id() {
        let collection = Collection::new("blog");
        let id = inserted(&collection, json!({"title": "a"}));

        let found = collection.find_one(&Filter::by_id(id)).unwrap().unwrap();
        assert_eq!(document_id(&found), Some(id));
        assert_eq!(found["title"], json!("a"));
        assert_eq!(collection.count_documents(), 1);
    }

    #[test]
    fn test_insert_keeps_given_id_and_rejects_duplicates() {
        let collection = Collection::new("blog");
        let id = ObjectId::new();
        let first = collection
            .insert_one(doc(json!({"_id": id, "n": 1})))
            .unwrap();
        assert_eq!(first.inserted_id, id.to_value());

        let second = collection.insert_one(doc(json!({"_id": id, "n": 2})));
        assert!(matches!(second, Err(StorageError::DuplicateKey(dup)) if dup == id));

        let bad = collection.insert_one(doc(json!({"_id": "not-an-oid"})));
        assert!(matches!(bad, Err(StorageError::InvalidDocument(_))));
    }

    #[test]
    fn test_find_one_missing() {
        let collection = Collection::new("blog");
        assert!(collection
            .find_one(&Filter::by_id(ObjectId::new()))
            .unwrap()
            .is_none());
        assert!(collection.find_one(&Filter::All).unwrap().is_none());
    }

    #[test]
    fn test_replace_one() {
        let collection = Collection::new("blog");
        let id = inserted(&collection, json!({"title": "old"}));

        let result = collection
            .replace_one(&Filter::by_id(id), doc(json!({"title": "new"})))
            .unwrap();
        assert_eq!(result.matched_count, 1);
        assert_eq!(result.modified_count, 1);

        let found = collection.find_one(&Filter::by_id(id)).unwrap().unwrap();
        assert_eq!(found["title"], json!("new"));
        assert_eq!(document_id(&found), Some(id));

        // Identical replacement matches but does not modify.
        let result = collection
            .replace_one(&Filter::by_id(id), doc(json!({"_id": id, "title": "new"})))
            .unwrap();
        assert_eq!(result.matched_count, 1);
        assert_eq!(result.modified_count, 0);
    }

    #[test]
    fn test_replace_one_no_match() {
        let collection = Collection::new("blog");
        let result = collection
            .replace_one(&Filter::by_id(ObjectId::new()), doc(json!({"title": "x"})))
            .unwrap();
        assert_eq!(result, UpdateResult::default());
        assert!(collection.is_empty());
    }

    #[test]
    fn test_replace_cannot_change_id() {
        let collection = Collection::new("blog");
        let id = inserted(&collection, json!({"title": "old"}));
        let other = ObjectId::new();
        let result =
            collection.replace_one(&Filter::by_id(id), doc(json!({"_id": other, "title": "x"})));
        assert!(matches!(result, Err(StorageError::InvalidDocument(_))));
    }

    #[test]
    fn test_delete_one() {
        let collection = Collection::new("blog");
        let id = inserted(&collection, json!({"title": "a"}));

        assert_eq!(
            collection.delete_one(&Filter::by_id(id)).unwrap().deleted_count,
            1
        );
        assert_eq!(
            collection.delete_one(&Filter::by_id(id)).unwrap().deleted_count,
            0
        );
        assert!(collection.is_empty());
    }

    #[test]
    fn test_find_in_natural_order() {
        let collection = Collection::new("blog");
        for n in 0..5 {
            inserted(&collection, json!({ "n": n }));
        }

        let ns: Vec<i64> = collection
            .find(&Filter::All)
            .unwrap()
            .map(|d| d.unwrap()["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_find_by_id() {
        let collection = Collection::new("blog");
        inserted(&collection, json!({"n": 0}));
        let id = inserted(&collection, json!({"n": 1}));

        let docs: Vec<Document> = collection
            .find(&Filter::by_id(id))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["n"], json!(1));
    }

    #[test]
    fn test_cursor_is_lazy() {
        let collection = Collection::new("blog");
        let first = inserted(&collection, json!({"n": 0}));
        let mut cursor = collection.find(&Filter::All).unwrap();

        assert_eq!(cursor.next().unwrap().unwrap()["n"], json!(0));

        // Writers are not blocked by an open cursor.
        collection.delete_one(&Filter::by_id(first)).unwrap();
        inserted(&collection, json!({"n": 1}));

        assert_eq!(cursor.next().unwrap().unwrap()["n"], json!(1));
        assert!(cursor.next().is_none());
    }

    #[test]
    fn test_open_cursors_released() {
        let collection = Collection::new("blog");
        inserted(&collection, json!({"n": 0}));
        inserted(&collection, json!({"n": 1}));

        let mut exhausted = collection.find(&Filter::All).unwrap();
        let mut partial = collection.find(&Filter::All).unwrap();
        assert_eq!(collection.open_cursors(), 2);

        while exhausted.next().is_some() {}
        exhausted.close();
        assert_eq!(collection.open_cursors(), 1);

        partial.next();
        drop(partial);
        assert_eq!(collection.open_cursors(), 0);

        drop(exhausted);
        assert_eq!(collection.open_cursors(), 0);
    }

    #[test]
    fn test_from_documents_rejects_missing_id() {
        let result = Collection::from_documents("blog", vec![doc(json!({"title": "x"}))]);
        assert!(matches!(result, Err(StorageError::Corruption(_))));
    }
}
