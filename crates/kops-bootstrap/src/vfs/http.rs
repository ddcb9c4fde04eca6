use super::{StateStore, VfsError, VfsPath};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// `http://` / `https://` backend.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: Client,
}

impl HttpStore {
    /// Builds a client with a 30 second timeout.
    ///
    /// # Errors
    ///
    /// Fails when the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, VfsError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VfsError::Http {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StateStore for HttpStore {
    async fn read_file(&self, path: &VfsPath) -> Result<Vec<u8>, VfsError> {
        let url = path.to_string();
        debug!("GET {}", url);
        let http_err = |message: String| VfsError::Http {
            url: url.clone(),
            message,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| http_err(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(VfsError::NotFound(url));
        }
        if !status.is_success() {
            return Err(http_err(format!("unexpected status {status}")));
        }
        let body = response.bytes().await.map_err(|e| http_err(e.to_string()))?;
        Ok(body.to_vec())
    }
}
