//! Database: a named set of collections with optional on-disk persistence.
//!
//! With a data directory configured, each collection is stored as
//! `<data_dir>/<database>/<collection>.json`. Files are loaded when the
//! collection is first opened and written back on `flush`/`close` through a
//! temp file and rename, so a crash never leaves a half-written collection.

use crate::collection::Collection;
use crate::document::Document;
use crate::error::StorageError;
use crate::store::DocumentStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Base directory. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Database name.
    pub database: String,
}

impl StorageConfig {
    /// In-memory database; nothing survives a restart.
    pub fn memory(database: impl Into<String>) -> Self {
        Self {
            data_dir: None,
            database: database.into(),
        }
    }

    /// Database persisted under `dir`.
    pub fn persistent(dir: impl AsRef<Path>, database: impl Into<String>) -> Self {
        Self {
            data_dir: Some(dir.as_ref().to_path_buf()),
            database: database.into(),
        }
    }

    fn database_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(&self.database))
    }
}

/// On-disk collection envelope.
#[derive(Debug, Serialize, Deserialize)]
struct CollectionFile {
    collection: String,
    checksum: String,
    documents: Vec<Document>,
}

fn checksum(documents: &[Document]) -> Result<String, StorageError> {
    let data = serde_json::to_vec(documents)?;
    Ok(format!("{:08x}", crc32c::crc32c(&data)))
}

/// Names end up in file paths.
fn validate_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

/// A named set of collections.
pub struct Database {
    config: StorageConfig,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    closed: AtomicBool,
}

impl Database {
    /// Opens or creates a database.
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        validate_name(&config.database)?;

        match config.database_dir() {
            Some(dir) => {
                fs::create_dir_all(&dir)?;
                tracing::info!("Opened database {} at {}", config.database, dir.display());
            }
            None => tracing::info!("Opened in-memory database {}", config.database),
        }

        Ok(Self {
            config,
            collections: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.database
    }

    pub fn is_persistent(&self) -> bool {
        self.config.data_dir.is_some()
    }

    /// Returns a handle to a collection, loading it from disk on first use.
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>, StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        validate_name(name)?;

        if let Some(collection) = self.collections.read().get(name) {
            return Ok(Arc::clone(collection));
        }

        let mut collections = self.collections.write();
        if let Some(collection) = collections.get(name) {
            return Ok(Arc::clone(collection));
        }
        let collection = Arc::new(self.load_collection(name)?);
        collections.insert(name.to_string(), Arc::clone(&collection));
        Ok(collection)
    }

    fn collection_path(&self, name: &str) -> Option<PathBuf> {
        self.config
            .database_dir()
            .map(|dir| dir.join(format!("{}.json", name)))
    }

    fn load_collection(&self, name: &str) -> Result<Collection, StorageError> {
        let path = match self.collection_path(name) {
            Some(path) if path.exists() => path,
            _ => return Ok(Collection::new(name)),
        };

        let file = File::open(&path)?;
        let stored: CollectionFile = serde_json::from_reader(BufReader::new(file))?;

        if stored.collection != name {
            return Err(StorageError::Corruption(format!(
                "{} holds collection {}, expected {}",
                path.display(),
                stored.collection,
                name
            )));
        }
        let actual = checksum(&stored.documents)?;
        if actual != stored.checksum {
            return Err(StorageError::Corruption(format!(
                "collection {} checksum mismatch: expected {}, got {}",
                name, stored.checksum, actual
            )));
        }

        let collection = Collection::from_documents(name, stored.documents)?;
        tracing::info!("Loaded collection {}: {} documents", name, collection.len());
        Ok(collection)
    }

    fn write_collection(path: &Path, collection: &Collection) -> Result<(), StorageError> {
        let documents = collection.snapshot();
        let stored = CollectionFile {
            collection: collection.name().to_string(),
            checksum: checksum(&documents)?,
            documents,
        };

        let tmp_path = path.with_extension("json.tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &stored)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Writes every opened collection to disk. No-op for in-memory databases.
    pub fn flush(&self) -> Result<(), StorageError> {
        for (name, collection) in self.collections.read().iter() {
            if let Some(path) = self.collection_path(name) {
                Self::write_collection(&path, collection)?;
                tracing::debug!("Flushed collection {} ({} documents)", name, collection.len());
            }
        }
        Ok(())
    }

    /// Flushes and closes the database. Subsequent `collection` calls fail.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for (name, collection) in self.collections.read().iter() {
            let open = collection.open_cursors();
            if open > 0 {
                tracing::warn!("Closing collection {} with {} open cursors", name, open);
            }
        }

        self.flush()?;
        tracing::info!("Closed database {}", self.config.database);
        Ok(())
    }
}
