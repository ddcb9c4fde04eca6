use super::{Script, shell_quote};
use crate::model::EgressProxySpec;

/// Resolved egress proxy for the first-boot script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    /// Full proxy URL, e.g. `http://proxy.internal:3128`
    pub url: String,

    /// Comma-separated exclusions
    pub exclude: String,
}

impl ProxySettings {
    /// Normalizes the cluster's proxy spec; `None` when no host is set.
    #[must_use]
    pub fn from_spec(spec: &EgressProxySpec) -> Option<Self> {
        let host = spec.http_proxy.trim();
        if host.is_empty() {
            return None;
        }
        let mut url = if host.contains("://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };
        if let Some(port) = spec.port {
            let start = url.find("://").map_or(0, |i| i + 3);
            let end = url[start..].find('/').map_or(url.len(), |i| start + i);
            if !authority_has_port(&url[start..end]) {
                url.insert_str(end, &format!(":{port}"));
            }
        }
        Some(Self {
            url,
            exclude: spec.exclude.clone().unwrap_or_default(),
        })
    }

    pub(crate) fn write(&self, out: &mut Script) {
        let url = shell_quote(&self.url);
        let exclude = shell_quote(&self.exclude);

        out.line("echo \"== configuring egress proxy ==\"");
        for (key, value) in [
            ("http_proxy", &url),
            ("https_proxy", &url),
            ("NO_PROXY", &exclude),
            ("no_proxy", &exclude),
        ] {
            out.line(format!("echo {key}={value} >> /etc/environment"));
            out.line(format!("export {key}={value}"));
        }
        out.line("case \"$(cat /proc/version)\" in");
        out.line("*[Dd]ebian*|*[Uu]buntu*)");
        out.line(r#"  echo "Acquire::http::Proxy \"${http_proxy}\";" > /etc/apt/apt.conf.d/30proxy ;;"#);
        out.line("*[Rr]ed[Hh]at*)");
        out.line(r#"  echo "proxy=${http_proxy}" >> /etc/yum.conf ;;"#);
        out.line("esac");
        out.line(
            r#"echo "DefaultEnvironment=\"http_proxy=${http_proxy}\" \"https_proxy=${http_proxy}\" \"NO_PROXY=${no_proxy}\" \"no_proxy=${no_proxy}\"" >> /etc/systemd/system.conf"#,
        );
        out.line("systemctl daemon-reload");
        out.line("systemctl daemon-reexec");
    }
}

/// Whether `host[:port]` (IPv6 hosts bracketed) already names a port.
fn authority_has_port(authority: &str) -> bool {
    let host_end = authority.rfind(']').unwrap_or(0);
    authority[host_end..]
        .rsplit_once(':')
        .is_some_and(|(_, port)| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_spec_adds_scheme_and_port() {
        let spec = EgressProxySpec {
            http_proxy: "proxy.internal".to_string(),
            port: Some(3128),
            exclude: Some("10.0.0.0/8,.internal".to_string()),
        };
        let proxy = ProxySettings::from_spec(&spec).expect("proxy");
        assert_eq!(proxy.url, "http://proxy.internal:3128");

        let spec = EgressProxySpec {
            http_proxy: "https://proxy.internal".to_string(),
            ..Default::default()
        };
        assert_eq!(ProxySettings::from_spec(&spec).expect("proxy").url, "https://proxy.internal");

        assert!(ProxySettings::from_spec(&EgressProxySpec::default()).is_none());
    }

    #[test]
    fn test_from_spec_keeps_explicit_port() {
        let url = |host: &str| {
            let spec = EgressProxySpec {
                http_proxy: host.to_string(),
                port: Some(3128),
                exclude: None,
            };
            ProxySettings::from_spec(&spec).expect("proxy").url
        };
        assert_eq!(url("proxy.internal:8080"), "http://proxy.internal:8080");
        assert_eq!(url("http://proxy.internal:8080/"), "http://proxy.internal:8080/");
        assert_eq!(url("http://proxy.internal/"), "http://proxy.internal:3128/");
        assert_eq!(url("[fd00::10]:8080"), "http://[fd00::10]:8080");
        assert_eq!(url("[fd00::10]"), "http://[fd00::10]:3128");
    }

    #[test]
    fn test_write_exports_and_reloads_systemd() {
        let proxy = ProxySettings {
            url: "http://proxy.internal:3128".to_string(),
            exclude: "localhost".to_string(),
        };
        let mut out = Script::default();
        proxy.write(&mut out);
        let text = out.finish();
        assert!(text.contains("export http_proxy=http://proxy.internal:3128\n"));
        assert!(text.contains("export no_proxy=localhost\n"));
        assert!(text.contains("/etc/apt/apt.conf.d/30proxy"));
        assert!(text.ends_with("systemctl daemon-reload\nsystemctl daemon-reexec\n"));
    }
}
