//! Controller configuration.
//!
//! Bootstrap settings come from environment variables; plugin configuration
//! is YAML stored under the `config` key of a ConfigMap.

use crate::error::ControllerError;
use opnsense_client::Row;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Default controller name, also used as the controller id in derived names
pub const DEFAULT_CONTROLLER_NAME: &str = "kubernetes-opnsense-controller";
/// ConfigMap key holding the plugin configuration
pub const CONFIG_KEY: &str = "config";

/// Settings read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub opnsense_url: String,
    pub opnsense_api_key: String,
    pub opnsense_api_secret: String,
    pub opnsense_insecure_tls: bool,
    pub opnsense_timeout: Duration,
    pub controller_name: String,
    pub namespace: String,
    pub config_map: String,
    pub store_config_map: String,
    pub metrics_addr: SocketAddr,
}

impl ControllerSettings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| {
                ControllerError::InvalidConfig(format!("{key} environment variable is required"))
            })
        };

        let opnsense_timeout = match get("OPNSENSE_TIMEOUT_SECONDS") {
            Some(raw) => Duration::from_secs(raw.parse::<u64>().map_err(|e| {
                ControllerError::InvalidConfig(format!("OPNSENSE_TIMEOUT_SECONDS={raw}: {e}"))
            })?),
            None => Duration::from_secs(10),
        };

        let metrics_addr = get("METRICS_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_addr = metrics_addr
            .parse::<SocketAddr>()
            .map_err(|e| ControllerError::InvalidConfig(format!("METRICS_ADDR={metrics_addr}: {e}")))?;

        let controller_name = get("CONTROLLER_NAME").unwrap_or_else(|| DEFAULT_CONTROLLER_NAME.to_string());

        Ok(Self {
            opnsense_url: required("OPNSENSE_URL")?,
            opnsense_api_key: required("OPNSENSE_API_KEY")?,
            opnsense_api_secret: required("OPNSENSE_API_SECRET")?,
            opnsense_insecure_tls: get("OPNSENSE_INSECURE_TLS").is_some_and(|v| is_truthy(&v)),
            opnsense_timeout,
            namespace: get("CONTROLLER_NAMESPACE").unwrap_or_else(|| "kube-system".to_string()),
            config_map: get("CONTROLLER_CONFIGMAP").unwrap_or_else(|| controller_name.clone()),
            store_config_map: get("CONTROLLER_STORE_CONFIGMAP")
                .unwrap_or_else(|| format!("{controller_name}-store")),
            metrics_addr,
            controller_name,
        })
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Debounce and resync timing shared by every plugin.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub settle_seconds: Option<u64>,
    pub resync_seconds: Option<u64>,
}

impl Schedule {
    pub fn settle(&self, default_seconds: u64) -> Duration {
        Duration::from_secs(self.settle_seconds.unwrap_or(default_seconds))
    }

    /// `None` when periodic resync is disabled.
    pub fn resync(&self) -> Option<Duration> {
        match self.resync_seconds.unwrap_or(300) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Plugin configuration as stored in the controller ConfigMap.
///
/// Unknown plugin ids are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PluginsConfig {
    pub controller_id: Option<String>,
    pub metallb: Option<MetalLbConfig>,
    pub haproxy_ingress_proxy: Option<HaproxyIngressProxyConfig>,
    pub haproxy_declarative: Option<HaproxyDeclarativeConfig>,
    pub opnsense_dns_services: Option<DnsServicesConfig>,
    pub opnsense_dns_ingresses: Option<DnsIngressesConfig>,
    pub opnsense_dns_haproxy_ingress_proxy: Option<DnsHaproxyIngressProxyConfig>,
}

impl PluginsConfig {
    /// Parse the YAML document found under the `config` key.
    pub fn from_yaml(yaml: &str) -> Result<Self, ControllerError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetalLbConfig {
    #[serde(default)]
    pub enabled: bool,
    pub node_label_selector: Option<String>,
    pub node_field_selector: Option<String>,
    #[serde(rename = "bgp-implementation")]
    pub bgp_implementation: Option<String>,
    /// Per-implementation options (`openbgp`, `frr`)
    #[serde(default)]
    pub options: BTreeMap<String, BgpOptions>,
    #[serde(flatten)]
    pub schedule: Schedule,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BgpOptions {
    /// Neighbor fields merged into every desired neighbor
    #[serde(default)]
    pub template: Row,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HaproxyIngressProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    pub ingress_label_selector: Option<String>,
    pub ingress_field_selector: Option<String>,
    pub default_enabled: Option<bool>,
    /// Shared frontend name(s), comma separated
    pub default_frontend: Option<String>,
    pub default_backend: Option<String>,
    pub allowed_host_regex: Option<String>,
    #[serde(flatten)]
    pub schedule: Schedule,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HaproxyDeclarativeConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Defaults to `pfsense.org/type=declarative`
    pub config_map_label_selector: Option<String>,
    pub config_map_field_selector: Option<String>,
    #[serde(flatten)]
    pub schedule: Schedule,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendToggle {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DnsBackends {
    pub dnsmasq: Option<BackendToggle>,
    pub unbound: Option<BackendToggle>,
}

impl DnsBackends {
    pub fn dnsmasq_enabled(&self) -> bool {
        self.dnsmasq.as_ref().is_some_and(|b| b.enabled)
    }

    pub fn unbound_enabled(&self) -> bool {
        self.unbound.as_ref().is_some_and(|b| b.enabled)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsServicesConfig {
    #[serde(default)]
    pub enabled: bool,
    pub service_label_selector: Option<String>,
    pub service_field_selector: Option<String>,
    #[serde(default)]
    pub dns_backends: DnsBackends,
    #[serde(flatten)]
    pub schedule: Schedule,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsIngressesConfig {
    #[serde(default)]
    pub enabled: bool,
    pub ingress_label_selector: Option<String>,
    pub ingress_field_selector: Option<String>,
    pub default_enabled: Option<bool>,
    pub allowed_host_regex: Option<String>,
    #[serde(default)]
    pub dns_backends: DnsBackends,
    #[serde(flatten)]
    pub schedule: Schedule,
}

/// DNS entry published for a shared HAProxy frontend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrontendDns {
    pub hostname: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsHaproxyIngressProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub dns_backends: DnsBackends,
    /// Keyed by shared frontend name
    #[serde(default)]
    pub frontends: BTreeMap<String, FrontendDns>,
    #[serde(flatten)]
    pub schedule: Schedule,
}
