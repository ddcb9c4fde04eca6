use super::{StateStore, VfsError, VfsPath};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Public AWS S3 endpoint.
pub const S3_ENDPOINT: &str = "https://s3.amazonaws.com";

/// Google Cloud Storage XML API endpoint.
pub const GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// Object-store backend (`s3://`, `gs://`, `do://`) reading through HTTPS.
///
/// `<scheme>://<bucket>/<key>` is fetched path-style from
/// `<endpoint>/<bucket>/<key>` by the wrapped HTTP backend. Access is
/// anonymous, so the bucket (or the state-store objects) must be readable
/// without credentials, e.g. through a bucket policy or a VPC endpoint.
#[derive(Clone)]
pub struct ObjectStore {
    endpoint: String,
    http: Arc<dyn StateStore>,
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore").field("endpoint", &self.endpoint).finish()
    }
}

impl ObjectStore {
    /// Store reading from `endpoint` (scheme and host, e.g.
    /// `https://nyc3.digitaloceanspaces.com`) through `http`.
    pub fn new(endpoint: &str, http: Arc<dyn StateStore>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// HTTPS location of an object path.
    ///
    /// # Errors
    ///
    /// [`VfsError::InvalidPath`] when the path names no bucket or no key.
    pub fn url_for(&self, path: &VfsPath) -> Result<VfsPath, VfsError> {
        let (bucket, key) = path
            .rest()
            .split_once('/')
            .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
            .ok_or_else(|| VfsError::InvalidPath(path.to_string()))?;
        VfsPath::parse(&format!("{}/{}/{}", self.endpoint, bucket, key))
    }
}

#[async_trait]
impl StateStore for ObjectStore {
    async fn read_file(&self, path: &VfsPath) -> Result<Vec<u8>, VfsError> {
        let url = self.url_for(path)?;
        debug!("Reading {} from {}", path, url);
        match self.http.read_file(&url).await {
            Err(VfsError::NotFound(_)) => Err(VfsError::NotFound(path.to_string())),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryStore;

    #[test]
    fn test_path_style_urls() {
        let store = ObjectStore::new("https://nyc3.digitaloceanspaces.com/", Arc::new(MemoryStore::new()));
        let url = store
            .url_for(&VfsPath::parse("do://kops-state/dev.example.com/config").expect("path"))
            .expect("url");
        assert_eq!(
            url.to_string(),
            "https://nyc3.digitaloceanspaces.com/kops-state/dev.example.com/config"
        );

        let bucket_only = VfsPath::parse("s3://kops-state").expect("path");
        assert!(matches!(store.url_for(&bucket_only), Err(VfsError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_reads_through_http_backend() {
        let http = MemoryStore::new();
        http.insert("https://s3.amazonaws.com/kops-state/c1/config", "hello");
        let store = ObjectStore::new(S3_ENDPOINT, Arc::new(http));

        let path = VfsPath::parse("s3://kops-state/c1/config").expect("path");
        assert_eq!(store.read_file(&path).await.expect("read"), b"hello");

        let missing = VfsPath::parse("s3://kops-state/c2/config").expect("path");
        let err = store.read_file(&missing).await.expect_err("missing");
        assert!(matches!(err, VfsError::NotFound(p) if p == "s3://kops-state/c2/config"));
    }
}
