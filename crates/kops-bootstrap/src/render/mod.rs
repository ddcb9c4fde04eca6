//! First-boot script rendering.
//!
//! [`ScriptRenderer::render`] is pure: it turns a [`BootConfig`] and the
//! resolved [`MirroredAsset`]s into user-data bytes and never touches the
//! network or the filesystem. The machine-side script runs the stages
//! sysctls → proxy → env → download/verify → write config → exec nodeup,
//! logging everything to the startup log.
//!
//! Exit codes of the rendered script:
//!
//! | code | meaning |
//! |------|---------|
//! | 0 | success |
//! | 1 | every mirror failed to download (or unsupported arch) |
//! | 2 | at least one mirror served bytes with the wrong hash |
//! | 3 | nodeup failed |

mod compress;
mod mime;
mod proxy;

pub use proxy::ProxySettings;

use crate::assets::{Architecture, MirroredAsset};
use crate::config::BootConfig;
use crate::model::{Cluster, InstanceGroup, Role, UserData};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Sysctls applied before download when [`RenderOptions::set_sysctls`] is on.
pub const EARLY_SYSCTLS: [&str; 4] = [
    "net.core.rmem_max=16777216",
    "net.core.wmem_max=16777216",
    "net.ipv4.tcp_rmem='4096 87380 16777216'",
    "net.ipv4.tcp_wmem='4096 87380 16777216'",
];

const CONFIG_HEREDOC: &str = "__EOF_BOOT_CONFIG";

/// Errors raised while rendering.
#[derive(Debug, Error)]
pub enum RenderError {
    /// A non-bastion script needs at least one asset with mirrors
    #[error("no nodeup assets to render: {0}")]
    MissingAssets(String),

    /// Env keys must be valid shell identifiers
    #[error("invalid environment variable name {0:?}")]
    InvalidEnvKey(String),

    /// Boot configuration could not be encoded
    #[error("failed to encode boot configuration: {0}")]
    Serialization(#[from] serde_yaml::Error),

    /// The boot configuration contains the heredoc terminator
    #[error("boot configuration contains the heredoc terminator {0:?}")]
    HeredocCollision(String),

    /// Gzip failure
    #[error("failed to compress user data: {0}")]
    Compression(#[from] std::io::Error),
}

/// On-disk locations used by the rendered script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootPaths {
    pub log_file: String,
    pub nodeup_binary: String,
    pub config_file: String,
}

impl Default for BootPaths {
    fn default() -> Self {
        Self {
            log_file: "/var/log/startup.log".to_string(),
            nodeup_binary: "/opt/kops/bin/nodeup".to_string(),
            config_file: "/etc/kubernetes/kops/nodeup.yaml".to_string(),
        }
    }
}

/// Caller-controlled rendering inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Exported in ascending key order
    pub env: BTreeMap<String, String>,

    /// Egress proxy, exported before download
    pub proxy: Option<ProxySettings>,

    /// Apply [`EARLY_SYSCTLS`] before download
    pub set_sysctls: bool,

    /// Extra `key=value` sysctls applied after the defaults
    pub extra_sysctls: Vec<String>,

    /// Wrap the script in a self-decompressing gzip+base64 stub
    pub compress: bool,

    /// Extra parts; when non-empty the output is MIME multipart
    pub additional_user_data: Vec<UserData>,

    pub paths: BootPaths,
}

impl RenderOptions {
    /// Options derived from the cluster (proxy) and instance group
    /// (compression, additional user data).
    #[must_use]
    pub fn for_instance_group(cluster: &Cluster, instance_group: &InstanceGroup) -> Self {
        Self {
            proxy: cluster
                .spec
                .networking
                .egress_proxy
                .as_ref()
                .and_then(ProxySettings::from_spec),
            compress: instance_group.compress_user_data(),
            additional_user_data: instance_group.spec.additional_user_data.clone(),
            ..Self::default()
        }
    }
}

/// Renders user-data payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptRenderer;

impl ScriptRenderer {
    /// Creates a renderer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Renders the complete user-data payload.
    ///
    /// # Errors
    ///
    /// See [`RenderError`].
    pub fn render(
        &self,
        config: &BootConfig,
        assets: &[MirroredAsset],
        options: &RenderOptions,
    ) -> Result<Vec<u8>, RenderError> {
        let script = self.render_script(config, assets, options)?;
        let script = if options.compress {
            compress::self_extracting(&script)?
        } else {
            script
        };
        let payload = if options.additional_user_data.is_empty() {
            script
        } else {
            mime::multipart(&script, &options.additional_user_data)
        };
        debug!(
            "Rendered {} bytes of user data for {}/{}",
            payload.len(),
            config.cluster_name,
            config.instance_group_name
        );
        Ok(payload.into_bytes())
    }

    /// Renders the uncompressed shell script alone.
    ///
    /// # Errors
    ///
    /// See [`RenderError`].
    pub fn render_script(
        &self,
        config: &BootConfig,
        assets: &[MirroredAsset],
        options: &RenderOptions,
    ) -> Result<String, RenderError> {
        let paths = &options.paths;
        let mut out = Script::default();

        out.line("#!/bin/bash");
        out.line("set -e -o pipefail");
        out.blank();
        out.line(format!("exec > >(tee -a {}) 2>&1", shell_quote(&paths.log_file)));
        out.line("echo \"== kops bootstrap starting at $(date -u) ==\"");
        out.blank();

        let bastion = config.instance_group_role == Role::Bastion;
        if !bastion {
            write_asset_variables(&mut out, assets)?;
        }

        if options.set_sysctls || !options.extra_sysctls.is_empty() {
            write_sysctls(&mut out, options);
        }

        if let Some(proxy) = &options.proxy {
            proxy.write(&mut out);
            out.blank();
        }

        write_env(&mut out, &options.env)?;

        if bastion {
            out.line("echo \"== bastion bootstrap complete ==\"");
            return Ok(out.finish());
        }

        write_download(&mut out, assets, paths);
        write_config(&mut out, config, paths)?;

        out.line("echo \"== running nodeup ==\"");
        out.line(format!(
            "if ! {} --conf={} --cloud-provider={} --v=8; then",
            shell_quote(&paths.nodeup_binary),
            shell_quote(&paths.config_file),
            config.cloud_provider.as_str()
        ));
        out.line("  echo \"== nodeup failed ==\"");
        out.line("  exit 3");
        out.line("fi");
        out.line("echo \"== kops bootstrap complete ==\"");
        Ok(out.finish())
    }
}

/// Line-oriented script buffer.
#[derive(Debug, Default)]
pub(crate) struct Script(String);

impl Script {
    pub(crate) fn line(&mut self, line: impl AsRef<str>) {
        self.0.push_str(line.as_ref());
        self.0.push('\n');
    }

    pub(crate) fn blank(&mut self) {
        self.0.push('\n');
    }

    fn raw(&mut self, text: &str) {
        self.0.push_str(text);
    }

    fn finish(self) -> String {
        self.0
    }
}

fn arch_suffix(arch: Architecture) -> String {
    arch.as_str().to_ascii_uppercase()
}

fn write_asset_variables(out: &mut Script, assets: &[MirroredAsset]) -> Result<(), RenderError> {
    if assets.is_empty() {
        return Err(RenderError::MissingAssets("no architectures resolved".to_string()));
    }
    for asset in assets {
        if asset.urls.is_empty() || asset.sha256.is_empty() {
            return Err(RenderError::MissingAssets(format!(
                "{} for {} has no mirrors or hash",
                asset.name, asset.arch
            )));
        }
        let urls: Vec<String> = asset.urls.iter().map(|u| shell_quote(u)).collect();
        let suffix = arch_suffix(asset.arch);
        out.line(format!("NODEUP_URL_{suffix}=({})", urls.join(" ")));
        out.line(format!("NODEUP_HASH_{suffix}={}", shell_quote(&asset.sha256)));
    }
    out.blank();
    Ok(())
}

fn write_sysctls(out: &mut Script, options: &RenderOptions) {
    out.line("echo \"== applying early sysctls ==\"");
    if options.set_sysctls {
        for sysctl in EARLY_SYSCTLS {
            out.line(format!("sysctl -w {sysctl} || true"));
        }
    }
    for sysctl in &options.extra_sysctls {
        out.line(format!("sysctl -w {} || true", shell_quote(sysctl)));
    }
    out.blank();
}

fn write_env(out: &mut Script, env: &BTreeMap<String, String>) -> Result<(), RenderError> {
    for (key, value) in env {
        if !is_env_key(key) {
            return Err(RenderError::InvalidEnvKey(key.clone()));
        }
        out.line(format!("export {key}={}", shell_quote(value)));
    }
    if !env.is_empty() {
        out.blank();
    }
    Ok(())
}

fn write_download(out: &mut Script, assets: &[MirroredAsset], paths: &BootPaths) {
    out.raw(DOWNLOAD_FUNCTION);
    out.blank();

    out.line("case \"$(uname -m)\" in");
    for asset in assets {
        let pattern = match asset.arch {
            Architecture::Amd64 => "x86_64*|amd64*",
            Architecture::Arm64 => "aarch64*|arm64*",
        };
        let suffix = arch_suffix(asset.arch);
        out.line(format!("{pattern})"));
        out.line(format!("  NODEUP_URL=(\"${{NODEUP_URL_{suffix}[@]}}\")"));
        out.line(format!("  NODEUP_HASH=\"${{NODEUP_HASH_{suffix}}}\""));
        out.line("  ;;");
    }
    out.line("*)");
    out.line("  echo \"unsupported host arch: $(uname -m)\" >&2");
    out.line("  exit 1");
    out.line("  ;;");
    out.line("esac");
    out.blank();

    out.line(format!(
        "download_or_bust {} \"${{NODEUP_HASH}}\" \"${{NODEUP_URL[@]}}\"",
        shell_quote(&paths.nodeup_binary)
    ));
    out.blank();
}

const DOWNLOAD_FUNCTION: &str = r#"# args: destination, sha256, mirror urls...
download_or_bust() {
  local -r dest="$1"
  local -r hash="$2"
  shift 2
  local hash_failed=0
  local url
  mkdir -p "$(dirname "${dest}")"
  for url in "$@"; do
    rm -f "${dest}.download"
    echo "== downloading ${url} =="
    if ! curl -sSL --max-time 300 -o "${dest}.download" "${url}"; then
      echo "== download of ${url} failed =="
      continue
    fi
    if ! echo "${hash}  ${dest}.download" | sha256sum -c --status -; then
      echo "== hash mismatch for ${url} =="
      hash_failed=1
      continue
    fi
    install -m 0755 "${dest}.download" "${dest}"
    rm -f "${dest}.download"
    echo "== downloaded ${url} =="
    return 0
  done
  rm -f "${dest}.download"
  if [[ "${hash_failed}" -eq 1 ]]; then
    echo "== no mirror served ${dest} with hash ${hash} ==" >&2
    exit 2
  fi
  echo "== all mirrors failed for ${dest} ==" >&2
  exit 1
}
"#;

fn write_config(out: &mut Script, config: &BootConfig, paths: &BootPaths) -> Result<(), RenderError> {
    let mut yaml = serde_yaml::to_string(config)?;
    if !yaml.ends_with('\n') {
        yaml.push('\n');
    }
    if yaml.lines().any(|l| l == CONFIG_HEREDOC) {
        return Err(RenderError::HeredocCollision(CONFIG_HEREDOC.to_string()));
    }
    let digest = hex::encode(Sha256::digest(yaml.as_bytes()));
    let config_file = shell_quote(&paths.config_file);
    let digest_file = shell_quote(&format!("{}.sha256", paths.config_file));

    out.line(format!("mkdir -p \"$(dirname {config_file})\""));
    out.line(format!("cat > {config_file} << '{CONFIG_HEREDOC}'"));
    out.raw(&yaml);
    out.line(CONFIG_HEREDOC);
    out.line(format!(
        "echo {} > {digest_file}",
        shell_quote(&format!("{digest}  {}", paths.config_file))
    ));
    out.line(format!("sha256sum -c --status {digest_file}"));
    out.blank();
    Ok(())
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Leaves safe words bare and single-quotes everything else.
pub(crate) fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./:,@%+=-".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
