//! Ingress to HAProxy builder.
//!
//! Every enabled ingress gets one derived frontend per shared frontend it
//! targets. The derived frontend copies the listener of the shared frontend
//! and carries one ACL and one `use_backend` action per rule path.

use super::{
    Collection, DesiredRecord, DesiredState, DesiredStateBuilder, Inventory, Link, ResourceRef, SharedFrontend,
    Snapshot, compile_host_regex, row,
};
use crate::annotations;
use crate::error::ControllerError;
use crate::settings::HaproxyIngressProxyConfig;
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::{HTTPIngressPath, Ingress};
use kube::ResourceExt;
use opnsense_client::{Endpoint, OpnSenseClientTrait, Row, field_string};
use regex::Regex;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use tracing::{debug, warn};

pub const ENABLED_ANNOTATION: &str = "haproxy-ingress-proxy.opnsense.org/enabled";
pub const FRONTEND_ANNOTATION: &str = "haproxy-ingress-proxy.opnsense.org/frontend";
pub const BACKEND_ANNOTATION: &str = "haproxy-ingress-proxy.opnsense.org/backend";
pub const FRONTEND_TEMPLATE_ANNOTATION: &str = "haproxy-ingress-proxy.opnsense.org/frontendDefinitionTemplate";

/// Description written on every record created by this builder
pub const MANAGED_DESCRIPTION: &str = "created by kpc - do not edit";

/// Which ingresses are proxied through HAProxy, and where to.
///
/// Shared with the DNS builder that publishes records for proxied hosts.
#[derive(Debug, Clone)]
pub struct IngressProxyPolicy {
    config: HaproxyIngressProxyConfig,
    allowed_hosts: Option<Regex>,
}

impl IngressProxyPolicy {
    pub fn new(config: HaproxyIngressProxyConfig) -> Result<Self, ControllerError> {
        let allowed_hosts = compile_host_regex(config.allowed_host_regex.as_deref())?;
        Ok(Self { config, allowed_hosts })
    }

    pub fn enabled(&self, ingress: &Ingress) -> bool {
        annotations::enabled(&ingress.metadata, ENABLED_ANNOTATION, self.config.default_enabled, true)
    }

    /// Shared frontend names targeted by the ingress.
    pub fn frontends(&self, ingress: &Ingress) -> Vec<String> {
        annotations::list(&ingress.metadata, FRONTEND_ANNOTATION, self.config.default_frontend.as_deref())
    }

    pub fn backend(&self, ingress: &Ingress) -> Option<String> {
        annotations::string(&ingress.metadata, BACKEND_ANNOTATION, self.config.default_backend.as_deref())
    }

    pub fn host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts.as_ref().is_none_or(|re| re.is_match(host))
    }
}

/// Desired-State Builder for the `haproxy-ingress-proxy` plugin.
#[derive(Debug, Clone)]
pub struct HaproxyBuilder {
    controller_id: String,
    policy: IngressProxyPolicy,
}

impl HaproxyBuilder {
    pub fn new(controller_id: impl Into<String>, config: HaproxyIngressProxyConfig) -> Result<Self, ControllerError> {
        Ok(Self { controller_id: controller_id.into(), policy: IngressProxyPolicy::new(config)? })
    }

    fn referenced_frontends(&self, snapshot: &Snapshot) -> BTreeSet<String> {
        snapshot
            .ingresses
            .iter()
            .filter(|ingress| self.policy.enabled(ingress))
            .flat_map(|ingress| self.policy.frontends(ingress))
            .collect()
    }

    fn build_ingress(&self, ingress: &Ingress, inventory: &Inventory, state: &mut DesiredState) {
        let source = ResourceRef::from_meta("Ingress", &ingress.metadata);
        let namespace = ingress.namespace().unwrap_or_default();
        let base_name = format!("{}-{}-{}", namespace, ingress.name_any(), self.controller_id);

        let frontends = self.policy.frontends(ingress);
        let Some(backend) = self.policy.backend(ingress).filter(|_| !frontends.is_empty()) else {
            warn!("Missing frontend or backend configuration for {}, skipping", source);
            return;
        };

        let template = frontend_template(ingress, &source);

        for shared_name in &frontends {
            let frontend_name = format!("{shared_name}-{base_name}");

            let Some(shared) = inventory.frontends.get(shared_name) else {
                warn!("Frontend {} must exist: {}", shared_name, frontend_name);
                continue;
            };
            if !matches!(shared.mode.as_str(), "http" | "ssl") {
                warn!("HAProxy frontend {} has unsupported mode {:?}: {}", shared_name, shared.mode, frontend_name);
                continue;
            }
            let Some(backend_uuid) = inventory.backends.get(&backend) else {
                warn!("Backend {} must exist: {}", backend, frontend_name);
                continue;
            };

            debug!("Deriving {} from shared frontend {} ({})", frontend_name, shared_name, shared.uuid);
            let (acls, actions) = self.rule_records(ingress, &frontend_name, backend_uuid, &source);
            if actions.is_empty() {
                debug!("No routable rules for {}, skipping frontend {}", source, frontend_name);
                continue;
            }

            let action_names = actions.iter().map(|a| a.name.clone()).collect();
            for acl in acls {
                insert(state, Collection::HAPROXY_ACL.id, acl);
            }
            for action in actions {
                insert(state, Collection::HAPROXY_ACTION.id, action);
            }

            let body = frontend_body(&frontend_name, shared, backend_uuid, template.as_ref());
            insert(
                state,
                Collection::HAPROXY_FRONTEND.id,
                DesiredRecord {
                    name: frontend_name,
                    source: source.clone(),
                    body,
                    links: vec![Link {
                        field: "linkedActions",
                        target: Collection::HAPROXY_ACTION.id,
                        names: action_names,
                    }],
                },
            );
        }
    }

    fn rule_records(
        &self,
        ingress: &Ingress,
        frontend_name: &str,
        backend_uuid: &str,
        source: &ResourceRef,
    ) -> (Vec<DesiredRecord>, Vec<DesiredRecord>) {
        let mut acls = Vec::new();
        let mut actions = Vec::new();

        let rules = ingress.spec.as_ref().and_then(|spec| spec.rules.as_ref());
        for (r, rule) in rules.into_iter().flatten().enumerate() {
            let host = rule.host.as_deref().map(str::trim).filter(|h| !h.is_empty());
            // A hostless rule is checked as an empty host.
            if !self.policy.host_allowed(host.unwrap_or_default()) {
                debug!("Host {:?} of {} not allowed, skipping rule", host.unwrap_or_default(), source);
                continue;
            }

            let paths = rule.http.as_ref().map(|http| http.paths.as_slice()).unwrap_or_default();
            for (p, path) in paths.iter().enumerate() {
                let acl_name = format!("{frontend_name}-rule-{r}-path-{p}");
                let action_name = format!("{frontend_name}-action-{r}-{p}");

                acls.push(DesiredRecord {
                    name: acl_name.clone(),
                    source: source.clone(),
                    body: acl_body(&acl_name, host, path),
                    links: Vec::new(),
                });
                actions.push(DesiredRecord {
                    name: action_name.clone(),
                    source: source.clone(),
                    body: row(json!({
                        "name": action_name,
                        "description": MANAGED_DESCRIPTION,
                        "testType": "if",
                        "operator": "and",
                        "type": "use_backend",
                        "use_backend": backend_uuid,
                    })),
                    links: vec![Link {
                        field: "linkedAcls",
                        target: Collection::HAPROXY_ACL.id,
                        names: vec![acl_name],
                    }],
                });
            }
        }

        (acls, actions)
    }
}

pub(super) fn insert(state: &mut DesiredState, collection: &str, record: DesiredRecord) {
    let name = record.name.clone();
    let source = record.source.clone();
    if !state.insert(collection, record) {
        warn!("Duplicate {} record {} from {}, keeping the first", collection, name, source);
    }
}

fn frontend_template(ingress: &Ingress, source: &ResourceRef) -> Option<Row> {
    let raw = annotations::string(&ingress.metadata, FRONTEND_TEMPLATE_ANNOTATION, None)?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(template)) => Some(template),
        Ok(_) => {
            warn!("{} on {} is not a JSON object, ignoring", FRONTEND_TEMPLATE_ANNOTATION, source);
            None
        }
        Err(e) => {
            warn!("Invalid {} on {}: {}", FRONTEND_TEMPLATE_ANNOTATION, source, e);
            None
        }
    }
}

/// HAProxy host header expression and value for a rule host.
///
/// `*.example.com` matches exactly one extra label, with an optional port.
/// Any other host, `*example.com` included, is matched literally.
pub fn host_match(host: &str) -> (&'static str, String) {
    match host.strip_prefix("*.") {
        Some(rest) => {
            let escaped = format!(".{rest}").replace('.', "\\.").replace('-', "\\-");
            ("hdr_reg", format!("^[^\\.]+{escaped}(:[0-9]+)?$"))
        }
        None => ("hdr", host.to_string()),
    }
}

fn acl_body(name: &str, host: Option<&str>, path: &HTTPIngressPath) -> Row {
    let path_field = match path.path_type.as_str() {
        "Exact" => "path_end",
        _ => "path_beg",
    };
    let path_value = path.path.as_deref().map(str::trim).filter(|p| !p.is_empty()).unwrap_or("/");

    let mut body = row(json!({"name": name, "description": MANAGED_DESCRIPTION}));
    match host {
        Some(host) => {
            let (expression, value) = host_match(host);
            body.insert("expression".to_string(), json!(expression));
            body.insert("value".to_string(), json!(value));
            body.insert(path_field.to_string(), json!(path_value));
        }
        None => {
            body.insert("expression".to_string(), json!(path_field));
            body.insert(path_field.to_string(), json!(path_value));
        }
    }
    body
}

fn frontend_body(name: &str, shared: &SharedFrontend, backend_uuid: &str, template: Option<&Row>) -> Row {
    let mut body = row(json!({
        "enabled": "1",
        "name": name,
        "description": MANAGED_DESCRIPTION,
        "bind": shared.bind,
        "mode": shared.mode,
        "ssl_enabled": shared.ssl_enabled,
        "ssl_certificates": shared.ssl_certificates,
        "defaultBackend": backend_uuid,
    }));
    if let Some(template) = template {
        for (field, value) in template {
            body.insert(field.clone(), value.clone());
        }
        body.insert("name".to_string(), json!(name));
    }
    body
}

#[async_trait]
impl DesiredStateBuilder for HaproxyBuilder {
    fn collections(&self) -> Vec<Collection> {
        vec![Collection::HAPROXY_ACL, Collection::HAPROXY_ACTION, Collection::HAPROXY_FRONTEND]
    }

    async fn inventory(
        &self,
        snapshot: &Snapshot,
        client: &dyn OpnSenseClientTrait,
    ) -> Result<Inventory, ControllerError> {
        let referenced = self.referenced_frontends(snapshot);
        let mut inventory = Inventory::default();
        if referenced.is_empty() {
            return Ok(inventory);
        }

        for backend in client.search(&Endpoint::HAPROXY_BACKEND).await? {
            if let (Some(name), Some(uuid)) = (field_string(&backend, "name"), field_string(&backend, "uuid")) {
                inventory.backends.insert(name, uuid);
            }
        }

        for frontend in client.search(&Endpoint::HAPROXY_FRONTEND).await? {
            let (Some(name), Some(uuid)) = (field_string(&frontend, "name"), field_string(&frontend, "uuid")) else {
                continue;
            };
            if !referenced.contains(&name) {
                continue;
            }
            let detail = client.get_item(&Endpoint::HAPROXY_FRONTEND, &uuid).await?;
            let field = |key: &str| field_string(&detail, key).unwrap_or_default();
            inventory.frontends.insert(
                name,
                SharedFrontend {
                    mode: field("mode"),
                    bind: field("bind"),
                    ssl_enabled: field("ssl_enabled"),
                    ssl_certificates: field("ssl_certificates"),
                    uuid,
                },
            );
        }

        Ok(inventory)
    }

    fn build(&self, snapshot: &Snapshot, inventory: &Inventory) -> DesiredState {
        let mut state = DesiredState::default();
        for ingress in &snapshot.ingresses {
            if !self.policy.enabled(ingress) {
                debug!("Ingress {}/{} not enabled for HAProxy", ingress.namespace().unwrap_or_default(), ingress.name_any());
                continue;
            }
            self.build_ingress(ingress, inventory, &mut state);
        }
        state
    }
}
