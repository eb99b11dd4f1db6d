//! Test utilities for unit testing builders and the reconciler
//!
//! Cluster objects are built from JSON so tests read like the manifests
//! they stand in for.

use k8s_openapi::api::core::v1::{ConfigMap, Node, Service};
use k8s_openapi::api::networking::v1::Ingress;
use opnsense_client::Row;
use serde_json::{Value, json};
use std::sync::Arc;

/// Turn a JSON object literal into a record body
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Helper to create a test Ingress
pub fn ingress(namespace: &str, name: &str, annotations: &[(&str, &str)], rules: Value) -> Arc<Ingress> {
    let annotations: serde_json::Map<String, Value> =
        annotations.iter().map(|(k, v)| ((*k).to_string(), json!(v))).collect();
    Arc::new(
        serde_json::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "uid": format!("uid-{namespace}-{name}"),
                "annotations": annotations,
            },
            "spec": { "rules": rules },
            "status": { "loadBalancer": { "ingress": [{ "ip": "192.0.2.80" }] } }
        }))
        .expect("valid ingress"),
    )
}

/// Single host rule with one `Prefix` path routed to `web:80`
pub fn host_rule(host: &str, path: &str) -> Value {
    json!({
        "host": host,
        "http": { "paths": [{
            "path": path,
            "pathType": "Prefix",
            "backend": { "service": { "name": "web", "port": { "number": 80 } } }
        }]}
    })
}

/// Helper to create a test Service
pub fn service(
    namespace: &str,
    name: &str,
    service_type: &str,
    annotations: &[(&str, &str)],
    lb_ip: Option<&str>,
) -> Arc<Service> {
    let annotations: serde_json::Map<String, Value> =
        annotations.iter().map(|(k, v)| ((*k).to_string(), json!(v))).collect();
    let ingress = lb_ip.map(|ip| vec![json!({ "ip": ip })]).unwrap_or_default();
    Arc::new(
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "uid": format!("uid-{namespace}-{name}"),
                "annotations": annotations,
            },
            "spec": { "type": service_type, "ports": [{ "port": 80 }] },
            "status": { "loadBalancer": { "ingress": ingress } }
        }))
        .expect("valid service"),
    )
}

/// Helper to create a test Node
pub fn node(name: &str, addresses: &[(&str, &str)]) -> Arc<Node> {
    let addresses: Vec<Value> =
        addresses.iter().map(|(kind, address)| json!({ "type": kind, "address": address })).collect();
    Arc::new(
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": { "name": name, "uid": format!("uid-{name}") },
            "status": { "addresses": addresses }
        }))
        .expect("valid node"),
    )
}

/// Helper to create a test Service exposing `port` on `node_port`
pub fn node_port_service(namespace: &str, name: &str, port: i32, node_port: i32) -> Arc<Service> {
    Arc::new(
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": name, "namespace": namespace, "uid": format!("uid-{namespace}-{name}") },
            "spec": { "type": "NodePort", "ports": [{ "port": port, "nodePort": node_port }] }
        }))
        .expect("valid service"),
    )
}

/// Helper to create a test ConfigMap carrying `data` under the `data` key
pub fn config_map(namespace: &str, name: &str, data: &str) -> Arc<ConfigMap> {
    Arc::new(
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "uid": format!("uid-{namespace}-{name}"),
                "labels": { "pfsense.org/type": "declarative" },
            },
            "data": { "data": data }
        }))
        .expect("valid config map"),
    )
}
