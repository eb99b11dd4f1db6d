//! Declarative HAProxy builder.
//!
//! Labelled ConfigMaps carry a YAML document under the `data` key listing
//! HAProxy backends and frontends by their appliance definition:
//!
//! ```yaml
//! resources:
//!   - type: backend
//!     definition: { name: traefik, mode: http }
//!     ha_servers:
//!       - type: node-static
//!         definition: { name: edge-1, address: 192.0.2.10, port: "80" }
//!       - type: node-service
//!         serviceName: traefik
//!         servicePort: 80
//!         definition: { ssl: "0" }
//!   - type: frontend
//!     definition: { name: public-http, bind: "0.0.0.0:80", defaultBackend: traefik }
//! ```
//!
//! `node-service` servers expand into one server per node, addressed by node
//! IP and the service's nodePort. Backends link their servers by name and
//! frontends name their default backend; the reconciler turns both into
//! appliance ids.

use super::bgp::node_ip;
use super::haproxy::{MANAGED_DESCRIPTION, insert};
use super::{Collection, DesiredRecord, DesiredState, DesiredStateBuilder, Inventory, Link, ResourceRef, Snapshot};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::ResourceExt;
use opnsense_client::{Row, field_string};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

/// Label selector used when none is configured
pub const DEFAULT_LABEL_SELECTOR: &str = "pfsense.org/type=declarative";
/// ConfigMap key holding the resource document
pub const DATA_KEY: &str = "data";

#[derive(Debug, Default, Deserialize)]
struct Document {
    #[serde(default)]
    resources: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    definition: Row,
    ha_servers: Option<Vec<ServerSpec>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerSpec {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    definition: Row,
    service_name: Option<String>,
    service_port: Option<i32>,
    service_namespace: Option<String>,
}

/// Desired-State Builder for the `haproxy-declarative` plugin.
#[derive(Debug, Clone, Default)]
pub struct DeclarativeBuilder;

impl DeclarativeBuilder {
    pub fn new() -> Self {
        Self
    }

    fn build_config_map(&self, config_map: &ConfigMap, snapshot: &Snapshot, state: &mut DesiredState) {
        let source = ResourceRef::from_meta("ConfigMap", &config_map.metadata);
        let Some(raw) = config_map.data.as_ref().and_then(|data| data.get(DATA_KEY)).filter(|d| !d.trim().is_empty())
        else {
            debug!("{} has no {} key, skipping", source, DATA_KEY);
            return;
        };
        let document: Document = match serde_yaml::from_str::<Option<Document>>(raw) {
            Ok(document) => document.unwrap_or_default(),
            Err(e) => {
                warn!("Invalid resource document in {}: {}", source, e);
                return;
            }
        };

        let namespace = config_map.namespace().unwrap_or_default();
        for resource in document.resources {
            let Some(name) = field_string(&resource.definition, "name").filter(|n| !n.is_empty()) else {
                warn!("{} resource without a name in {}, skipping", resource.kind, source);
                continue;
            };
            match resource.kind.as_str() {
                "backend" => self.backend(name, resource, &namespace, snapshot, &source, state),
                "frontend" => frontend(name, resource.definition, &source, state),
                other => warn!("Unknown resource type {:?} for {} in {}, skipping", other, name, source),
            }
        }
    }

    fn backend(
        &self,
        name: String,
        resource: Resource,
        namespace: &str,
        snapshot: &Snapshot,
        source: &ResourceRef,
        state: &mut DesiredState,
    ) {
        let mut body = managed(resource.definition);
        let mut links = Vec::new();

        // Without ha_servers the definition's own linkedServers is left untouched.
        if let Some(specs) = resource.ha_servers {
            body.remove("linkedServers");
            let mut server_names = Vec::new();
            for spec in specs {
                for server in resolve_server(&name, spec, namespace, snapshot, source) {
                    server_names.push(server.name.clone());
                    insert(state, Collection::HAPROXY_SERVER.id, server);
                }
            }
            links.push(Link { field: "linkedServers", target: Collection::HAPROXY_SERVER.id, names: server_names });
        }

        insert(state, Collection::HAPROXY_BACKEND.id, DesiredRecord { name, source: source.clone(), body, links });
    }
}

fn frontend(name: String, definition: Row, source: &ResourceRef, state: &mut DesiredState) {
    let mut body = managed(definition);
    let mut links = Vec::new();
    let default_backend = body.remove("defaultBackend");
    if let Some(backend) = default_backend.as_ref().and_then(|v| v.as_str()).map(str::trim).filter(|b| !b.is_empty()) {
        let names = vec![backend.to_string()];
        links.push(Link { field: "defaultBackend", target: Collection::HAPROXY_BACKEND.id, names });
    }
    insert(state, Collection::HAPROXY_FRONTEND.id, DesiredRecord { name, source: source.clone(), body, links });
}

fn managed(mut definition: Row) -> Row {
    definition.entry("description").or_insert_with(|| json!(MANAGED_DESCRIPTION));
    definition
}

/// Servers a backend entry stands for. Unresolvable entries yield none.
fn resolve_server(
    backend: &str,
    spec: ServerSpec,
    namespace: &str,
    snapshot: &Snapshot,
    source: &ResourceRef,
) -> Vec<DesiredRecord> {
    match spec.kind.as_str() {
        "node-static" => {
            let Some(name) = field_string(&spec.definition, "name").filter(|n| !n.is_empty()) else {
                warn!("Static server without a name in backend {} of {}, skipping", backend, source);
                return Vec::new();
            };
            vec![DesiredRecord { name, source: source.clone(), body: managed(spec.definition), links: Vec::new() }]
        }
        "node-service" => node_service_servers(backend, spec, namespace, snapshot, source),
        other => {
            warn!("Unknown server type {:?} in backend {} of {}, skipping", other, backend, source);
            Vec::new()
        }
    }
}

fn node_service_servers(
    backend: &str,
    spec: ServerSpec,
    namespace: &str,
    snapshot: &Snapshot,
    source: &ResourceRef,
) -> Vec<DesiredRecord> {
    let namespace = spec.service_namespace.as_deref().filter(|ns| !ns.is_empty()).unwrap_or(namespace);
    let (Some(service_name), Some(service_port)) = (spec.service_name.as_deref(), spec.service_port) else {
        warn!("node-service server in backend {} of {} lacks serviceName or servicePort, skipping", backend, source);
        return Vec::new();
    };

    let found = snapshot.services.iter().find(|s| s.namespace().as_deref() == Some(namespace) && s.name_any() == service_name);
    let Some(service) = found else {
        warn!("Service {}/{} for backend {} not found", namespace, service_name, backend);
        return Vec::new();
    };
    let Some(node_port) = node_port(service, service_port) else {
        warn!("Service {}/{} has no nodePort for port {}", namespace, service_name, service_port);
        return Vec::new();
    };

    snapshot
        .nodes
        .iter()
        .filter_map(|node| {
            let address = node_ip(node)?;
            let name = format!("{}-{}-{}", backend, node.name_any(), service_port);
            let mut body = managed(spec.definition.clone());
            body.insert("name".to_string(), json!(name));
            body.insert("address".to_string(), json!(address));
            body.insert("port".to_string(), json!(node_port.to_string()));
            Some(DesiredRecord { name, source: source.clone(), body, links: Vec::new() })
        })
        .collect()
}

fn node_port(service: &Service, port: i32) -> Option<i32> {
    service.spec.as_ref()?.ports.as_ref()?.iter().find(|p| p.port == port).and_then(|p| p.node_port)
}

#[async_trait]
impl DesiredStateBuilder for DeclarativeBuilder {
    fn collections(&self) -> Vec<Collection> {
        vec![Collection::HAPROXY_SERVER, Collection::HAPROXY_BACKEND, Collection::HAPROXY_FRONTEND]
    }

    fn build(&self, snapshot: &Snapshot, _inventory: &Inventory) -> DesiredState {
        let mut state = DesiredState::default();
        for config_map in &snapshot.config_maps {
            self.build_config_map(config_map, snapshot, &mut state);
        }
        state
    }
}
