use super::{StateStore, VfsError, VfsPath};
use async_trait::async_trait;

/// `file://` backend over the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStore;

#[async_trait]
impl StateStore for FileStore {
    async fn read_file(&self, path: &VfsPath) -> Result<Vec<u8>, VfsError> {
        let local = path.rest();
        if !local.starts_with('/') {
            return Err(VfsError::InvalidPath(path.to_string()));
        }
        tokio::fs::read(local).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VfsError::NotFound(path.to_string())
            } else {
                VfsError::Io {
                    path: path.to_string(),
                    source: e,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_and_reports_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("config");
        std::fs::write(&file, b"spec: {}").expect("write");

        let path = VfsPath::parse(&format!("file://{}", file.display())).expect("path");
        assert_eq!(FileStore.read_file(&path).await.expect("read"), b"spec: {}");

        let missing = path.join("nope");
        assert!(matches!(FileStore.read_file(&missing).await, Err(VfsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_relative_path_rejected() {
        let path = VfsPath::parse("file://relative/config").expect("path");
        assert!(matches!(FileStore.read_file(&path).await, Err(VfsError::InvalidPath(_))));
    }
}
