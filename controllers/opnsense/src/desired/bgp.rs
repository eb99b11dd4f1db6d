//! Nodes to BGP neighbors (MetalLB peering).

use super::{Collection, DesiredRecord, DesiredState, DesiredStateBuilder, Inventory, ResourceRef, Snapshot};
use crate::settings::MetalLbConfig;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use opnsense_client::Row;
use serde_json::json;
use tracing::warn;

/// Routing daemon the neighbors are written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgpImplementation {
    OpenBgpd,
    Frr,
}

impl BgpImplementation {
    /// Parse the `bgp-implementation` config value.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openbgp" | "openbgpd" => Some(Self::OpenBgpd),
            "frr" => Some(Self::Frr),
            _ => None,
        }
    }

    /// Key of the implementation under `options`
    pub fn option_key(self) -> &'static str {
        match self {
            Self::OpenBgpd => "openbgp",
            Self::Frr => "frr",
        }
    }

    pub fn collection(self) -> Collection {
        match self {
            Self::OpenBgpd => Collection::OPENBGPD_NEIGHBOR,
            Self::Frr => Collection::FRR_NEIGHBOR,
        }
    }
}

/// Desired-State Builder for the `metallb` plugin.
#[derive(Debug, Clone)]
pub struct BgpBuilder {
    implementation: Option<BgpImplementation>,
    template: Row,
}

impl BgpBuilder {
    pub fn new(config: &MetalLbConfig) -> Self {
        let raw = config.bgp_implementation.as_deref().unwrap_or_default();
        let implementation = BgpImplementation::parse(raw);
        if implementation.is_none() {
            warn!("Unsupported BGP implementation {:?}, no neighbors will be managed", raw);
        }

        let template = implementation
            .and_then(|imp| config.options.get(imp.option_key()))
            .map(|options| options.template.clone())
            .unwrap_or_default();

        Self { implementation, template }
    }
}

/// Node address used for peering: first InternalIP, else first ExternalIP.
pub fn node_ip(node: &Node) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    ["InternalIP", "ExternalIP"].iter().find_map(|kind| {
        addresses
            .iter()
            .find(|a| a.type_ == *kind && !a.address.is_empty())
            .map(|a| a.address.clone())
    })
}

#[async_trait]
impl DesiredStateBuilder for BgpBuilder {
    fn collections(&self) -> Vec<Collection> {
        self.implementation.map(BgpImplementation::collection).into_iter().collect()
    }

    fn build(&self, snapshot: &Snapshot, _inventory: &Inventory) -> DesiredState {
        let mut state = DesiredState::default();
        let Some(implementation) = self.implementation else {
            return state;
        };
        let collection = implementation.collection();

        for node in &snapshot.nodes {
            let Some(ip) = node_ip(node) else {
                warn!("Could not find IP for node {}", node.name_any());
                continue;
            };
            let description = format!("kpc-{ip}");

            let mut body = self.template.clone();
            body.insert("address".to_string(), json!(ip));
            body.insert("description".to_string(), json!(description));

            let record = DesiredRecord {
                name: description.clone(),
                source: ResourceRef::from_meta("Node", &node.metadata),
                body,
                links: Vec::new(),
            };
            if !state.insert(collection.id, record) {
                warn!("Node {} shares address {} with another node, skipping", node.name_any(), ip);
            }
        }

        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::BgpOptions;
    use crate::test_utils::*;
    use std::collections::BTreeMap;

    fn config(implementation: &str) -> MetalLbConfig {
        let mut options = BTreeMap::new();
        options.insert(
            "openbgp".to_string(),
            BgpOptions { template: row(json!({"remoteas": "64512", "enabled": "1", "address": "overwritten"})) },
        );
        options.insert("frr".to_string(), BgpOptions { template: row(json!({"remoteas": "64513"})) });
        MetalLbConfig {
            enabled: true,
            bgp_implementation: Some(implementation.to_string()),
            options,
            ..MetalLbConfig::default()
        }
    }

    #[test]
    fn test_neighbors_from_nodes() {
        let builder = BgpBuilder::new(&config("openbgp"));
        let snap = Snapshot::new(
            Vec::new(),
            Vec::new(),
            vec![
                node("worker-1", &[("Hostname", "worker-1"), ("ExternalIP", "203.0.113.1"), ("InternalIP", "10.0.0.1")]),
                node("worker-2", &[("ExternalIP", "203.0.113.2")]),
                node("worker-3", &[("Hostname", "worker-3")]),
            ],
        );

        let state = builder.build(&snap, &Inventory::default());
        let neighbors = state.collection("openbgpd-neighbor").unwrap();
        assert_eq!(neighbors.len(), 2);

        let first = &neighbors["kpc-10.0.0.1"];
        assert_eq!(first.body["address"], "10.0.0.1");
        assert_eq!(first.body["description"], "kpc-10.0.0.1");
        assert_eq!(first.body["remoteas"], "64512");
        assert_eq!(first.source.kind, "Node");
        assert_eq!(first.source.name, "worker-1");

        assert!(neighbors.contains_key("kpc-203.0.113.2"));
    }

    #[test]
    fn test_frr_uses_frr_collection_and_template() {
        let builder = BgpBuilder::new(&config("frr"));
        assert_eq!(builder.collections(), vec![Collection::FRR_NEIGHBOR]);

        let snap = Snapshot::new(Vec::new(), Vec::new(), vec![node("n", &[("InternalIP", "10.0.0.9")])]);
        let state = builder.build(&snap, &Inventory::default());
        assert_eq!(state.get("frr-neighbor", "kpc-10.0.0.9").unwrap().body["remoteas"], "64513");
    }

    #[test]
    fn test_unsupported_implementation_yields_nothing() {
        let builder = BgpBuilder::new(&config("bird"));
        assert!(builder.implementation.is_none());
        assert!(builder.collections().is_empty());

        let snap = Snapshot::new(Vec::new(), Vec::new(), vec![node("n", &[("InternalIP", "10.0.0.9")])]);
        assert!(builder.build(&snap, &Inventory::default()).is_empty());
    }
}
