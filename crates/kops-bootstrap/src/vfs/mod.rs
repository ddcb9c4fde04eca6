//! State-store access addressed by URI scheme.
//!
//! Backends are registered explicitly on a [`VfsContext`]; nothing is
//! registered implicitly. [`VfsContext::with_default_stores`] wires the
//! backends this crate ships: `file://`, `http(s)://`, `memfs://`, and the
//! object stores `s3://` and `gs://` read anonymously over HTTPS.
//! `do://` (DigitalOcean Spaces) needs a regional endpoint and is added with
//! [`VfsContext::with_object_endpoint`].

mod file;
mod http;
mod memory;
mod object;
mod registry;

pub use file::FileStore;
pub use http::HttpStore;
pub use memory::MemoryStore;
pub use object::{GCS_ENDPOINT, ObjectStore, S3_ENDPOINT};
pub use registry::StateStoreRegistry;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors raised by state-store backends.
#[derive(Debug, Error)]
pub enum VfsError {
    /// No backend is registered for the path's scheme
    #[error("unsupported state store scheme: {0}")]
    UnsupportedScheme(String),

    /// The object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Local filesystem failure
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Remote fetch failure
    #[error("HTTP error fetching {url}: {message}")]
    Http { url: String, message: String },

    /// The path is not `<scheme>://<rest>`
    #[error("invalid state store path: {0}")]
    InvalidPath(String),

    /// The object exists but could not be decoded
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
}

/// A parsed `<scheme>://<rest>` location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VfsPath {
    scheme: String,
    rest: String,
}

impl VfsPath {
    /// Parses a path.
    ///
    /// # Errors
    ///
    /// [`VfsError::InvalidPath`] when the scheme separator is missing or the
    /// scheme is empty.
    pub fn parse(path: &str) -> Result<Self, VfsError> {
        let (scheme, rest) = path
            .split_once("://")
            .ok_or_else(|| VfsError::InvalidPath(path.to_string()))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
            return Err(VfsError::InvalidPath(path.to_string()));
        }
        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            rest: rest.trim_end_matches('/').to_string(),
        })
    }

    /// Lower-cased scheme.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Everything after `://`.
    #[must_use]
    pub fn rest(&self) -> &str {
        &self.rest
    }

    /// Appends path segments separated by `/`.
    #[must_use]
    pub fn join(&self, relative: &str) -> Self {
        let relative = relative.trim_matches('/');
        if relative.is_empty() {
            return self.clone();
        }
        Self {
            scheme: self.scheme.clone(),
            rest: format!("{}/{}", self.rest, relative),
        }
    }
}

impl fmt::Display for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.rest)
    }
}

/// Read-only access to one kind of state store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads the whole object at `path`.
    async fn read_file(&self, path: &VfsPath) -> Result<Vec<u8>, VfsError>;
}

/// Scheme → backend dispatch table.
#[derive(Clone, Default)]
pub struct VfsContext {
    stores: HashMap<String, Arc<dyn StateStore>>,
}

impl fmt::Debug for VfsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<&String> = self.stores.keys().collect();
        schemes.sort();
        f.debug_struct("VfsContext").field("schemes", &schemes).finish()
    }
}

impl VfsContext {
    /// Empty context; every read fails with `UnsupportedScheme`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with the file, HTTP(S), in-memory, S3 and GCS backends
    /// registered.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be built.
    pub fn with_default_stores() -> Result<Self, VfsError> {
        let http: Arc<dyn StateStore> = Arc::new(HttpStore::new()?);
        let mut ctx = Self::new();
        ctx.register("file", Arc::new(FileStore));
        ctx.register("http", Arc::clone(&http));
        ctx.register("s3", Arc::new(ObjectStore::new(S3_ENDPOINT, Arc::clone(&http))));
        ctx.register("gs", Arc::new(ObjectStore::new(GCS_ENDPOINT, Arc::clone(&http))));
        ctx.register("https", http);
        ctx.register("memfs", Arc::new(MemoryStore::new()));
        Ok(ctx)
    }

    /// Serves `scheme` from an S3-compatible `endpoint`, reading through the
    /// registered `https` backend.
    ///
    /// # Errors
    ///
    /// [`VfsError::UnsupportedScheme`] when no `https` backend is registered.
    pub fn with_object_endpoint(mut self, scheme: &str, endpoint: &str) -> Result<Self, VfsError> {
        let http = self
            .stores
            .get("https")
            .cloned()
            .ok_or_else(|| VfsError::UnsupportedScheme("https".to_string()))?;
        self.register(scheme, Arc::new(ObjectStore::new(endpoint, http)));
        Ok(self)
    }

    /// Registers (or replaces) the backend for a scheme.
    pub fn register(&mut self, scheme: &str, store: Arc<dyn StateStore>) {
        self.stores.insert(scheme.to_ascii_lowercase(), store);
    }

    /// Whether a backend serves `scheme`.
    #[must_use]
    pub fn supports(&self, scheme: &str) -> bool {
        self.stores.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Reads an object, dispatching on its scheme.
    ///
    /// # Errors
    ///
    /// Propagates backend errors; unknown schemes yield `UnsupportedScheme`.
    pub async fn read_file(&self, path: &VfsPath) -> Result<Vec<u8>, VfsError> {
        let store = self
            .stores
            .get(path.scheme())
            .ok_or_else(|| VfsError::UnsupportedScheme(path.scheme().to_string()))?;
        debug!("Reading state store object {}", path);
        store.read_file(path).await
    }

    /// Parses `path` and reads it.
    ///
    /// # Errors
    ///
    /// See [`Self::read_file`].
    pub async fn read_path(&self, path: &str) -> Result<Vec<u8>, VfsError> {
        self.read_file(&VfsPath::parse(path)?).await
    }
}
