//! Secrets kept under `<base>/<cluster>/secrets/<name>`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Secret holding the encryption-at-rest configuration.
pub const ENCRYPTION_CONFIG_SECRET: &str = "encryptionconfig";

/// A stored secret: `{"Data": "<base64>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSecret {
    #[serde(rename = "Data")]
    data: String,
}

impl StoredSecret {
    /// Wraps raw secret bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self { data: STANDARD.encode(bytes) }
    }

    /// Decodes the secret payload.
    ///
    /// # Errors
    ///
    /// Fails when `Data` is not valid base64.
    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.data.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_secret_json() {
        let secret: StoredSecret = serde_json::from_str(r#"{"Data":"c2VjcmV0"}"#).expect("json");
        assert_eq!(secret.bytes().expect("decode"), b"secret");
        assert_eq!(StoredSecret::from_bytes(b"secret"), secret);
    }
}
