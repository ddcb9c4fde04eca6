//! End-to-end driver: state store → assets → boot config → user data.

use crate::assets::{AssetDefaults, AssetResolver, RemoteHashSource};
use crate::config::{ConfigBuilder, Keysets};
use crate::error::BootstrapError;
use crate::model::{
    ENCRYPTION_CONFIG_SECRET, InstanceGroup, KUBERNETES_CA, Role, WellKnownAddresses,
};
use crate::render::{RenderOptions, ScriptRenderer};
use crate::vfs::{StateStoreRegistry, VfsContext};
use tracing::{debug, info};

/// Where the instance group comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceGroupSource {
    /// Read `<base>/<cluster>/instancegroup/<name>`
    Named(String),
    /// Use the given group as-is
    Embedded(InstanceGroup),
}

/// One bootstrap request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapRequest {
    pub cluster_name: String,
    pub instance_group: InstanceGroupSource,
    pub well_known_addresses: WellKnownAddresses,
}

/// Runs the resolver, builder and renderer strictly in sequence.
#[derive(Debug)]
pub struct BootstrapPipeline {
    registry: StateStoreRegistry,
    resolver: AssetResolver,
    builder: ConfigBuilder,
    renderer: ScriptRenderer,
    base_options: RenderOptions,
}

impl BootstrapPipeline {
    /// Pipeline reading from `state_store` with default mirrors and
    /// `.sha256` hash files fetched through `vfs`.
    ///
    /// # Errors
    ///
    /// Fails when `state_store` is not a `<scheme>://` path or `vfs` has no
    /// backend for its scheme.
    pub fn new(vfs: VfsContext, state_store: &str) -> Result<Self, BootstrapError> {
        let resolver = AssetResolver::new(
            AssetDefaults::default(),
            Box::new(RemoteHashSource::new(vfs.clone())),
        );
        Ok(Self {
            registry: StateStoreRegistry::new(vfs, state_store)?,
            resolver,
            builder: ConfigBuilder::new(),
            renderer: ScriptRenderer::new(),
            base_options: RenderOptions::default(),
        })
    }

    /// Replaces the asset resolver.
    #[must_use]
    pub fn with_asset_resolver(mut self, resolver: AssetResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Options applied to every render (env, sysctls, paths). Proxy,
    /// compression and additional user data still come from the cluster and
    /// instance group.
    #[must_use]
    pub fn with_base_options(mut self, options: RenderOptions) -> Self {
        self.base_options = options;
        self
    }

    /// State-store access used by the pipeline.
    #[must_use]
    pub fn registry(&self) -> &StateStoreRegistry {
        &self.registry
    }

    /// Produces the user-data payload for `request`.
    ///
    /// # Errors
    ///
    /// Any stage failure aborts the build; see [`BootstrapError::kind`].
    pub async fn build(&self, request: &BootstrapRequest) -> Result<Vec<u8>, BootstrapError> {
        let cluster_name = request.cluster_name.as_str();
        info!("Building bootstrap data for cluster {}", cluster_name);

        let cluster = self.registry.read_cluster(cluster_name).await?;
        let instance_group = match &request.instance_group {
            InstanceGroupSource::Named(name) => {
                self.registry.read_instance_group(cluster_name, name).await?
            }
            InstanceGroupSource::Embedded(ig) => ig.clone(),
        };

        let mut keysets = Keysets::new();
        if let Some(keyset) = self.registry.read_keyset(cluster_name, KUBERNETES_CA).await? {
            keysets.insert(KUBERNETES_CA.to_string(), keyset);
        }

        let encryption_secret = if cluster.encryption_enabled() {
            self.registry
                .read_secret(cluster_name, ENCRYPTION_CONFIG_SECRET)
                .await?
        } else {
            None
        };

        let assets = if instance_group.spec.role == Some(Role::Bastion) {
            Vec::new()
        } else {
            self.resolver.resolve_all(&cluster).await?
        };

        let config = self.builder.build(
            &cluster,
            &instance_group,
            &request.well_known_addresses,
            &keysets,
            encryption_secret.as_deref(),
        )?;

        let derived = RenderOptions::for_instance_group(&cluster, &instance_group);
        let options = RenderOptions {
            proxy: derived.proxy,
            compress: derived.compress,
            additional_user_data: derived.additional_user_data,
            ..self.base_options.clone()
        };
        let user_data = self.renderer.render(&config, &assets, &options)?;
        debug!(
            "Bootstrap data for {}/{} is {} bytes",
            cluster_name,
            instance_group.name(),
            user_data.len()
        );
        Ok(user_data)
    }
}
