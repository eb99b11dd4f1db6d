//! Desired-State Builders.
//!
//! A builder maps a snapshot of watched cluster objects to the appliance
//! records that should exist. `build` is pure; anything the builder needs to
//! know about appliance records it does not manage (shared HAProxy frontends
//! and backends) is looked up beforehand by `inventory`.

pub mod bgp;
pub mod declarative;
pub mod dns;
pub mod haproxy;
#[cfg(test)]
mod haproxy_test;

use crate::error::ControllerError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use opnsense_client::{Endpoint, OpnSenseClientTrait, Row};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// An appliance collection managed by a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collection {
    /// Stable id used in the ownership store and metrics
    pub id: &'static str,
    pub endpoint: Endpoint,
}

impl Collection {
    pub const HAPROXY_ACL: Self = Self { id: "haproxy-acl", endpoint: Endpoint::HAPROXY_ACL };
    pub const HAPROXY_ACTION: Self = Self { id: "haproxy-action", endpoint: Endpoint::HAPROXY_ACTION };
    pub const HAPROXY_FRONTEND: Self = Self { id: "haproxy-frontend", endpoint: Endpoint::HAPROXY_FRONTEND };
    pub const HAPROXY_BACKEND: Self = Self { id: "haproxy-backend", endpoint: Endpoint::HAPROXY_BACKEND };
    pub const HAPROXY_SERVER: Self = Self { id: "haproxy-server", endpoint: Endpoint::HAPROXY_SERVER };
    pub const OPENBGPD_NEIGHBOR: Self = Self { id: "openbgpd-neighbor", endpoint: Endpoint::OPENBGPD_NEIGHBOR };
    pub const FRR_NEIGHBOR: Self = Self { id: "frr-neighbor", endpoint: Endpoint::FRR_NEIGHBOR };
    pub const DNSMASQ_HOST: Self = Self { id: "dnsmasq-host", endpoint: Endpoint::DNSMASQ_HOST };
    pub const UNBOUND_HOST_OVERRIDE: Self =
        Self { id: "unbound-host-override", endpoint: Endpoint::UNBOUND_HOST_OVERRIDE };
}

/// The cluster object that caused a record to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ResourceRef {
    pub fn from_meta(kind: &str, meta: &ObjectMeta) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
            uid: meta.uid.clone(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A field whose value is the list of appliance ids of other records,
/// given here by record name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub field: &'static str,
    /// Collection id the names belong to
    pub target: &'static str,
    pub names: Vec<String>,
}

/// A record this controller wants to exist on the appliance.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredRecord {
    /// Join key (`name`, `description` or `host.domain` depending on the collection)
    pub name: String,
    pub source: ResourceRef,
    pub body: Row,
    pub links: Vec<Link>,
}

/// Desired records of one pass, per collection id, keyed by record name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredState {
    collections: BTreeMap<String, BTreeMap<String, DesiredRecord>>,
}

impl DesiredState {
    /// Add a record. The first record with a given name wins; returns false
    /// when the name was already taken.
    pub fn insert(&mut self, collection: &str, record: DesiredRecord) -> bool {
        let records = self.collections.entry(collection.to_string()).or_default();
        if records.contains_key(&record.name) {
            return false;
        }
        records.insert(record.name.clone(), record);
        true
    }

    pub fn collection(&self, id: &str) -> Option<&BTreeMap<String, DesiredRecord>> {
        self.collections.get(id)
    }

    #[cfg(test)]
    pub fn get(&self, collection: &str, name: &str) -> Option<&DesiredRecord> {
        self.collections.get(collection)?.get(name)
    }

    /// Total number of desired records.
    pub fn len(&self) -> usize {
        self.collections.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Watched cluster objects, each list ordered by namespace/name.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub ingresses: Vec<Arc<Ingress>>,
    pub services: Vec<Arc<Service>>,
    pub nodes: Vec<Arc<Node>>,
    pub config_maps: Vec<Arc<ConfigMap>>,
}

impl Snapshot {
    pub fn new(mut ingresses: Vec<Arc<Ingress>>, mut services: Vec<Arc<Service>>, mut nodes: Vec<Arc<Node>>) -> Self {
        ingresses.sort_by_key(|i| (i.namespace(), i.name_any()));
        services.sort_by_key(|s| (s.namespace(), s.name_any()));
        nodes.sort_by_key(|n| n.name_any());
        Self { ingresses, services, nodes, config_maps: Vec::new() }
    }

    pub fn with_config_maps(mut self, mut config_maps: Vec<Arc<ConfigMap>>) -> Self {
        config_maps.sort_by_key(|c| (c.namespace(), c.name_any()));
        self.config_maps = config_maps;
        self
    }
}

/// Shared HAProxy frontend as referenced by ingresses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedFrontend {
    pub uuid: String,
    pub mode: String,
    pub bind: String,
    pub ssl_enabled: String,
    pub ssl_certificates: String,
}

/// Appliance records a builder reads but does not manage.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    /// Shared frontends by name
    pub frontends: BTreeMap<String, SharedFrontend>,
    /// Backend uuids by name
    pub backends: BTreeMap<String, String>,
}

/// Builds the desired records of one plugin.
#[async_trait]
pub trait DesiredStateBuilder: Send + Sync {
    /// Collections written by this builder, in apply order.
    fn collections(&self) -> Vec<Collection>;

    /// Look up unmanaged appliance records the build depends on.
    async fn inventory(
        &self,
        _snapshot: &Snapshot,
        _client: &dyn OpnSenseClientTrait,
    ) -> Result<Inventory, ControllerError> {
        Ok(Inventory::default())
    }

    /// Compute the desired records. No I/O.
    fn build(&self, snapshot: &Snapshot, inventory: &Inventory) -> DesiredState;
}

/// Compile a host allow-list pattern.
///
/// PCRE-style delimiters are accepted: `/pattern/flags` becomes the pattern
/// with the `i`, `m`, `s` and `x` flags applied inline.
pub fn compile_host_regex(pattern: Option<&str>) -> Result<Option<Regex>, ControllerError> {
    let Some(pattern) = pattern.map(str::trim).filter(|p| !p.is_empty()) else {
        return Ok(None);
    };

    let source = match pattern.strip_prefix('/').and_then(|rest| rest.rsplit_once('/')) {
        Some((body, flags)) => {
            let flags: String = flags.chars().filter(|c| matches!(c, 'i' | 'm' | 's' | 'x')).collect();
            if flags.is_empty() { body.to_string() } else { format!("(?{flags}){body}") }
        }
        None => pattern.to_string(),
    };

    Regex::new(&source)
        .map(Some)
        .map_err(|e| ControllerError::InvalidConfig(format!("allowedHostRegex {pattern}: {e}")))
}

/// Split a hostname into host label and domain. Dotless names have no domain.
pub fn split_hostname(hostname: &str) -> Option<(&str, &str)> {
    let (host, domain) = hostname.trim().trim_end_matches('.').split_once('.')?;
    if host.is_empty() || domain.is_empty() {
        return None;
    }
    Some((host, domain))
}

pub(crate) fn row(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Row::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(name: &str) -> DesiredRecord {
        DesiredRecord {
            name: name.to_string(),
            source: ResourceRef { kind: "Service".to_string(), namespace: None, name: "a".to_string(), uid: None },
            body: row(json!({"name": name})),
            links: Vec::new(),
        }
    }

    #[test]
    fn test_first_record_wins() {
        let mut state = DesiredState::default();
        assert!(state.insert("c", record("a")));
        assert!(!state.insert("c", record("a")));
        assert!(state.insert("d", record("a")));
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_compile_host_regex_delimiters() {
        let re = compile_host_regex(Some("/.*\\.example\\.com$/i")).unwrap().unwrap();
        assert!(re.is_match("WWW.EXAMPLE.COM"));
        assert!(!re.is_match("www.example.org"));

        let re = compile_host_regex(Some("^api\\.")).unwrap().unwrap();
        assert!(re.is_match("api.example.com"));

        assert!(compile_host_regex(None).unwrap().is_none());
        assert!(compile_host_regex(Some("/[/")).is_err());
    }

    #[test]
    fn test_split_hostname() {
        assert_eq!(split_hostname("www.example.com"), Some(("www", "example.com")));
        assert_eq!(split_hostname("localhost"), None);
        assert_eq!(split_hostname(".example.com"), None);
    }
}
