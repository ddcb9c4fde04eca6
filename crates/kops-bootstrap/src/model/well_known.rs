//! Well-known addresses used for first-boot discovery.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Service kind under which endpoints are registered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WellKnownService {
    /// kops-controller (node identity / config server)
    #[serde(rename = "kops-controller")]
    KopsController,
    /// Internal API server endpoint
    #[serde(rename = "kube-apiserver-internal", alias = "kube-apiserver")]
    KubeApiServerInternal,
    /// Public API server endpoint
    #[serde(rename = "kube-apiserver-external")]
    KubeApiServerExternal,
}

impl WellKnownService {
    /// Tag used on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WellKnownService::KopsController => "kops-controller",
            WellKnownService::KubeApiServerInternal => "kube-apiserver-internal",
            WellKnownService::KubeApiServerExternal => "kube-apiserver-external",
        }
    }

    /// Parses a tag; `kube-apiserver` is accepted for the internal endpoint.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "kops-controller" => Some(WellKnownService::KopsController),
            "kube-apiserver" | "kube-apiserver-internal" => {
                Some(WellKnownService::KubeApiServerInternal)
            }
            "kube-apiserver-external" => Some(WellKnownService::KubeApiServerExternal),
            _ => None,
        }
    }
}

impl fmt::Display for WellKnownService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A DNS name or IP literal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    /// Wraps an endpoint string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the endpoint text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the endpoint is an IP literal.
    #[must_use]
    pub fn is_ip(&self) -> bool {
        self.0.parse::<IpAddr>().is_ok()
    }

    /// Host form for URLs (IPv6 literals are bracketed).
    #[must_use]
    pub fn url_host(&self) -> String {
        match self.0.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{v6}]"),
            _ => self.0.clone(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered endpoints per service kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WellKnownAddresses(BTreeMap<WellKnownService, Vec<Endpoint>>);

impl WellKnownAddresses {
    /// Appends an endpoint, preserving insertion order within the service.
    pub fn add(&mut self, service: WellKnownService, endpoint: impl Into<String>) {
        self.0.entry(service).or_default().push(Endpoint::new(endpoint));
    }

    /// Builder form of [`Self::add`].
    #[must_use]
    pub fn with(mut self, service: WellKnownService, endpoint: impl Into<String>) -> Self {
        self.add(service, endpoint);
        self
    }

    /// Endpoints for a service (empty slice when none).
    #[must_use]
    pub fn get(&self, service: WellKnownService) -> &[Endpoint] {
        self.0.get(&service).map_or(&[], Vec::as_slice)
    }

    /// Iterates services in tag order.
    pub fn iter(&self) -> impl Iterator<Item = (&WellKnownService, &Vec<Endpoint>)> {
        self.0.iter()
    }

    /// True when no service has an endpoint.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }
}
