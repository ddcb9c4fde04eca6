//! Key/value persistence for the ring and ownership records.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Durable byte store. Writes must be atomic per key.
pub trait Db: Send + Sync {
    /// Reads a key; `Ok(None)` when it was never written.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, DbError>;

    /// Writes a key, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn save(&self, key: &str, value: &[u8]) -> Result<(), DbError>;
}

/// One file per key under a directory; writes go through a temp file and
/// a rename.
#[derive(Debug, Clone)]
pub struct FileDb {
    dir: PathBuf,
}

impl FileDb {
    /// Opens (and creates) the directory.
    ///
    /// # Errors
    ///
    /// The directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, DbError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| DbError::Io {
            key: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> Result<PathBuf, DbError> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(DbError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }
}

impl Db for FileDb {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        let path = self.path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(DbError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<(), DbError> {
        let path = self.path(key)?;
        let tmp = path.with_extension("tmp");
        let io = |source| DbError::Io {
            key: key.to_string(),
            source,
        };
        let mut file = fs::File::create(&tmp).map_err(io)?;
        file.write_all(value).map_err(io)?;
        file.sync_all().map_err(io)?;
        fs::rename(&tmp, &path).map_err(io)
    }
}

/// In-memory store; clones share contents, so a test can "restart" an
/// allocator over the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryDb {
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryDb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Db for MemoryDb {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        let data = self.data.lock().map_err(|_| DbError::Poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<(), DbError> {
        let mut data = self.data.lock().map_err(|_| DbError::Poisoned)?;
        data.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
