//! Asset resolution: locating the `nodeup` binary per architecture.
//!
//! A [`MirroredAsset`] carries the ordered mirror list and the SHA-256 hash
//! the first-boot script verifies downloads against. Mirrors come from the
//! cluster's `spec.assets` overrides and the compiled-in [`AssetDefaults`];
//! hashes come from `spec.assets.hashes` and then a pluggable [`HashSource`].

use crate::model::Cluster;
use crate::vfs::{VfsContext, VfsError, VfsPath};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Release used in the compiled-in mirror URLs.
pub const DEFAULT_RELEASE: &str = "1.28.4";

/// Compiled-in mirror templates; `{release}` is substituted.
pub const DEFAULT_BASE_URL_TEMPLATES: [&str; 2] = [
    "https://artifacts.k8s.io/binaries/kops/{release}/linux",
    "https://kubeupv2.s3.amazonaws.com/kops/{release}/linux",
];

/// Name of the resolved binary.
pub const NODEUP: &str = "nodeup";

/// Errors raised while resolving an asset.
#[derive(Debug, Error)]
pub enum AssetError {
    /// No base URL is configured for the asset
    #[error("asset {0} is not configured: no mirror base URL")]
    NotConfigured(String),

    /// No hash could be found for the asset
    #[error("no sha256 hash available for asset {0}")]
    HashMissing(String),

    /// A hash was found but is not 64 hex characters
    #[error("invalid sha256 hash {value:?} for asset {asset}")]
    InvalidHash { asset: String, value: String },

    /// Reading a hash file failed
    #[error("failed to read asset hash: {0}")]
    Source(#[from] VfsError),
}

/// Supported CPU architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// x86-64
    Amd64,
    /// 64-bit ARM
    Arm64,
}

impl Architecture {
    /// Every architecture the pipeline renders for.
    pub const ALL: [Architecture; 2] = [Architecture::Amd64, Architecture::Arm64];

    /// Canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
        }
    }

    /// Canonicalizes `uname -m` style names.
    #[must_use]
    pub fn canonicalize(machine: &str) -> Option<Self> {
        match machine {
            "x86_64" | "amd64" => Some(Architecture::Amd64),
            "aarch64" | "arm64" => Some(Architecture::Arm64),
            _ => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A binary artifact with ordered mirrors and an integrity hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirroredAsset {
    /// Asset name, e.g. "nodeup"
    pub name: String,

    /// Target architecture
    pub arch: Architecture,

    /// Canonical URL first, then fallbacks; never empty
    pub urls: Vec<String>,

    /// Lowercase hex SHA-256
    pub sha256: String,
}

impl MirroredAsset {
    /// The canonical (first) URL.
    #[must_use]
    pub fn canonical_url(&self) -> &str {
        self.urls.first().map_or("", String::as_str)
    }

    /// Fallback URLs after the canonical one.
    #[must_use]
    pub fn fallback_urls(&self) -> &[String] {
        self.urls.get(1..).unwrap_or_default()
    }
}

/// Compiled-in mirror configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDefaults {
    /// Release substituted into the templates
    pub release: String,

    /// Base URLs, without the `<arch>/nodeup` suffix
    pub base_urls: Vec<String>,
}

impl Default for AssetDefaults {
    fn default() -> Self {
        Self::for_release(DEFAULT_RELEASE)
    }
}

impl AssetDefaults {
    /// Defaults for a specific release.
    #[must_use]
    pub fn for_release(release: &str) -> Self {
        Self {
            release: release.to_string(),
            base_urls: DEFAULT_BASE_URL_TEMPLATES
                .iter()
                .map(|t| t.replace("{release}", release))
                .collect(),
        }
    }
}

/// Supplies hashes for assets not pinned in the cluster spec.
#[async_trait]
pub trait HashSource: Send + Sync {
    /// Looks up the hash of `asset_path` (e.g. "amd64/nodeup") whose primary
    /// download location is `primary_url`. `Ok(None)` means unknown.
    async fn lookup(&self, asset_path: &str, primary_url: &str)
    -> Result<Option<String>, AssetError>;
}

/// Fixed hashes keyed by asset path.
#[derive(Debug, Clone, Default)]
pub struct StaticHashes(pub BTreeMap<String, String>);

#[async_trait]
impl HashSource for StaticHashes {
    async fn lookup(&self, asset_path: &str, _primary_url: &str) -> Result<Option<String>, AssetError> {
        Ok(self.0.get(asset_path).cloned())
    }
}

/// Reads `<primary-url>.sha256` through the VFS.
#[derive(Debug, Clone)]
pub struct RemoteHashSource {
    vfs: VfsContext,
    attempts: u32,
    retry_delay: Duration,
}

impl RemoteHashSource {
    /// Three attempts, one second apart.
    #[must_use]
    pub fn new(vfs: VfsContext) -> Self {
        Self {
            vfs,
            attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Overrides the delay between attempts.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[async_trait]
impl HashSource for RemoteHashSource {
    async fn lookup(&self, asset_path: &str, primary_url: &str) -> Result<Option<String>, AssetError> {
        let path = VfsPath::parse(&format!("{primary_url}.sha256"))?;
        let mut attempt = 1;
        loop {
            match self.vfs.read_file(&path).await {
                Ok(raw) => {
                    let text = String::from_utf8_lossy(&raw);
                    return Ok(text.split_whitespace().next().map(str::to_string));
                }
                Err(VfsError::NotFound(_)) => {
                    debug!("No hash file for {} at {}", asset_path, path);
                    return Ok(None);
                }
                Err(e) if attempt < self.attempts => {
                    warn!("Failed to read hash for {} (attempt {}/{}): {}", asset_path, attempt, self.attempts, e);
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Translates (cluster, architecture) into a [`MirroredAsset`].
pub struct AssetResolver {
    defaults: AssetDefaults,
    hashes: Box<dyn HashSource>,
}

impl fmt::Debug for AssetResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetResolver")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl AssetResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new(defaults: AssetDefaults, hashes: Box<dyn HashSource>) -> Self {
        Self { defaults, hashes }
    }

    /// Resolves `nodeup` for one architecture.
    ///
    /// # Errors
    ///
    /// `NotConfigured` when no base URL exists, `HashMissing` when no source
    /// knows the hash, `InvalidHash` for malformed hashes.
    pub async fn resolve(&self, cluster: &Cluster, arch: Architecture) -> Result<MirroredAsset, AssetError> {
        let asset_path = format!("{}/{}", arch.as_str(), NODEUP);
        let urls = self.mirror_urls(cluster, &asset_path);
        let Some(primary) = urls.first() else {
            return Err(AssetError::NotConfigured(asset_path));
        };

        let pinned = cluster
            .spec
            .assets
            .as_ref()
            .and_then(|a| a.hashes.get(&asset_path))
            .cloned();
        let raw = match pinned {
            Some(h) => h,
            None => self
                .hashes
                .lookup(&asset_path, primary)
                .await?
                .ok_or_else(|| AssetError::HashMissing(asset_path.clone()))?,
        };
        let sha256 = normalize_hash(&asset_path, &raw)?;

        debug!("Resolved {} with {} mirror(s)", asset_path, urls.len());
        Ok(MirroredAsset {
            name: NODEUP.to_string(),
            arch,
            urls,
            sha256,
        })
    }

    /// Resolves every supported architecture, in [`Architecture::ALL`] order.
    ///
    /// # Errors
    ///
    /// The first failure aborts.
    pub async fn resolve_all(&self, cluster: &Cluster) -> Result<Vec<MirroredAsset>, AssetError> {
        let mut assets = Vec::with_capacity(Architecture::ALL.len());
        for arch in Architecture::ALL {
            assets.push(self.resolve(cluster, arch).await?);
        }
        Ok(assets)
    }

    /// fileRepository replaces the defaults; extra mirrors follow; first
    /// occurrence wins.
    fn mirror_urls(&self, cluster: &Cluster, asset_path: &str) -> Vec<String> {
        let assets = cluster.spec.assets.as_ref();
        let primary: Vec<&str> = match assets.and_then(|a| a.file_repository.as_deref()) {
            Some(repo) if !repo.trim().is_empty() => vec![repo],
            _ => self.defaults.base_urls.iter().map(String::as_str).collect(),
        };
        let extra = assets.map(|a| a.mirrors.as_slice()).unwrap_or_default();

        let mut urls: Vec<String> = Vec::new();
        for base in primary.into_iter().chain(extra.iter().map(String::as_str)) {
            let base = base.trim().trim_end_matches('/');
            if base.is_empty() {
                continue;
            }
            let url = format!("{base}/{asset_path}");
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        urls
    }
}

/// Takes the first whitespace field and checks it is 64 hex characters.
fn normalize_hash(asset: &str, raw: &str) -> Result<String, AssetError> {
    let value = raw.split_whitespace().next().unwrap_or_default();
    if value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(value.to_ascii_lowercase())
    } else {
        Err(AssetError::InvalidHash {
            asset: asset.to_string(),
            value: raw.to_string(),
        })
    }
}
