//! Services and Ingresses to DNS host overrides.
//!
//! All three DNS plugins reduce their resources to a list of
//! `hostname -> ip` entries and share the record construction below. Every
//! enabled backend (dnsmasq, unbound) receives the same set.

use super::haproxy::IngressProxyPolicy;
use super::{
    Collection, DesiredRecord, DesiredState, DesiredStateBuilder, Inventory, ResourceRef, Snapshot,
    compile_host_regex, row, split_hostname,
};
use crate::annotations;
use crate::error::ControllerError;
use crate::settings::{DnsBackends, DnsHaproxyIngressProxyConfig, DnsIngressesConfig, DnsServicesConfig, FrontendDns};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LoadBalancerIngress, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressLoadBalancerIngress};
use opnsense_client::Row;
use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const HOSTNAME_ANNOTATION: &str = "dns.opnsense.org/hostname";
pub const ENABLED_ANNOTATION: &str = "dns.opnsense.org/enabled";

/// One hostname that should resolve to `ip`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub hostname: String,
    pub ip: String,
    pub source: ResourceRef,
}

/// Enabled DNS backends, in apply order.
pub fn dns_collections(backends: &DnsBackends) -> Vec<Collection> {
    let mut collections = Vec::new();
    if backends.dnsmasq_enabled() {
        collections.push(Collection::DNSMASQ_HOST);
    }
    if backends.unbound_enabled() {
        collections.push(Collection::UNBOUND_HOST_OVERRIDE);
    }
    collections
}

fn description(source: &ResourceRef) -> String {
    format!("created by kpc for {source}")
}

fn dnsmasq_body(host: &str, domain: &str, entry: &HostEntry) -> Row {
    row(json!({
        "host": host,
        "domain": domain,
        "ip": entry.ip,
        "descr": description(&entry.source),
    }))
}

fn unbound_body(host: &str, domain: &str, entry: &HostEntry) -> Row {
    let rr = if entry.ip.contains(':') { "AAAA" } else { "A" };
    row(json!({
        "enabled": "1",
        "hostname": host,
        "domain": domain,
        "rr": rr,
        "server": entry.ip,
        "description": description(&entry.source),
    }))
}

/// Turn host entries into desired records for every enabled backend.
///
/// Entries are expected in resource order; on a duplicate hostname the first
/// entry wins.
pub fn host_records(entries: Vec<HostEntry>, backends: &DnsBackends) -> DesiredState {
    let mut state = DesiredState::default();
    let collections = dns_collections(backends);
    let mut seen: BTreeMap<String, HostEntry> = BTreeMap::new();

    for entry in entries {
        let hostname = entry.hostname.trim().trim_end_matches('.').to_ascii_lowercase();
        let Some((host, domain)) = split_hostname(&hostname) else {
            warn!("Hostname {:?} of {} is not a valid FQDN, skipping", entry.hostname, entry.source);
            continue;
        };
        if let Some(owner) = seen.get(&hostname) {
            if owner.ip == entry.ip {
                debug!("Hostname {} of {} already published by {}", hostname, entry.source, owner.source);
            } else {
                warn!(
                    "Hostname {} of {} ({}) already claimed by {} ({}), skipping",
                    hostname, entry.source, entry.ip, owner.source, owner.ip
                );
            }
            continue;
        }
        seen.insert(hostname.clone(), entry.clone());

        for collection in &collections {
            let body = if *collection == Collection::DNSMASQ_HOST {
                dnsmasq_body(host, domain, &entry)
            } else {
                unbound_body(host, domain, &entry)
            };
            state.insert(
                collection.id,
                DesiredRecord { name: hostname.clone(), source: entry.source.clone(), body, links: Vec::new() },
            );
        }
    }

    state
}

fn first_service_ip(ingress: Option<&Vec<LoadBalancerIngress>>) -> Option<String> {
    ingress?.iter().find_map(|i| i.ip.clone().filter(|ip| !ip.is_empty()))
}

fn first_ingress_ip(ingress: Option<&Vec<IngressLoadBalancerIngress>>) -> Option<String> {
    ingress?.iter().find_map(|i| i.ip.clone().filter(|ip| !ip.is_empty()))
}

/// Non-wildcard rule hosts of an ingress.
fn rule_hosts(ingress: &Ingress) -> Vec<String> {
    ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|rule| rule.host.as_deref().map(str::trim))
        .filter(|host| !host.is_empty() && !host.starts_with('*'))
        .map(str::to_string)
        .collect()
}

/// Desired-State Builder for the `opnsense-dns-services` plugin.
#[derive(Debug, Clone)]
pub struct DnsServicesBuilder {
    backends: DnsBackends,
}

impl DnsServicesBuilder {
    pub fn new(config: &DnsServicesConfig) -> Self {
        Self { backends: config.dns_backends.clone() }
    }

    fn entries(&self, service: &Service) -> Vec<HostEntry> {
        let is_load_balancer = service.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("LoadBalancer");
        if !is_load_balancer {
            return Vec::new();
        }
        let hostnames = annotations::list(&service.metadata, HOSTNAME_ANNOTATION, None);
        if hostnames.is_empty() {
            return Vec::new();
        }

        let source = ResourceRef::from_meta("Service", &service.metadata);
        let lb = service.status.as_ref().and_then(|s| s.load_balancer.as_ref());
        let Some(ip) = first_service_ip(lb.and_then(|lb| lb.ingress.as_ref())) else {
            warn!("{} has no load balancer IP yet, skipping", source);
            return Vec::new();
        };

        hostnames
            .into_iter()
            .map(|hostname| HostEntry { hostname, ip: ip.clone(), source: source.clone() })
            .collect()
    }
}

#[async_trait]
impl DesiredStateBuilder for DnsServicesBuilder {
    fn collections(&self) -> Vec<Collection> {
        dns_collections(&self.backends)
    }

    fn build(&self, snapshot: &Snapshot, _inventory: &Inventory) -> DesiredState {
        let entries = snapshot.services.iter().flat_map(|service| self.entries(service)).collect();
        host_records(entries, &self.backends)
    }
}

/// Desired-State Builder for the `opnsense-dns-ingresses` plugin.
#[derive(Debug, Clone)]
pub struct DnsIngressesBuilder {
    backends: DnsBackends,
    default_enabled: Option<bool>,
    allowed_hosts: Option<Regex>,
}

impl DnsIngressesBuilder {
    pub fn new(config: &DnsIngressesConfig) -> Result<Self, ControllerError> {
        Ok(Self {
            backends: config.dns_backends.clone(),
            default_enabled: config.default_enabled,
            allowed_hosts: compile_host_regex(config.allowed_host_regex.as_deref())?,
        })
    }

    fn entries(&self, ingress: &Ingress) -> Vec<HostEntry> {
        if !annotations::enabled(&ingress.metadata, ENABLED_ANNOTATION, self.default_enabled, true) {
            return Vec::new();
        }

        let source = ResourceRef::from_meta("Ingress", &ingress.metadata);
        let lb = ingress.status.as_ref().and_then(|s| s.load_balancer.as_ref());
        let Some(ip) = first_ingress_ip(lb.and_then(|lb| lb.ingress.as_ref())) else {
            debug!("{} has no load balancer IP yet, skipping", source);
            return Vec::new();
        };

        rule_hosts(ingress)
            .into_iter()
            .filter(|host| self.allowed_hosts.as_ref().is_none_or(|re| re.is_match(host)))
            .map(|hostname| HostEntry { hostname, ip: ip.clone(), source: source.clone() })
            .collect()
    }
}

#[async_trait]
impl DesiredStateBuilder for DnsIngressesBuilder {
    fn collections(&self) -> Vec<Collection> {
        dns_collections(&self.backends)
    }

    fn build(&self, snapshot: &Snapshot, _inventory: &Inventory) -> DesiredState {
        let entries = snapshot.ingresses.iter().flat_map(|ingress| self.entries(ingress)).collect();
        host_records(entries, &self.backends)
    }
}

/// Desired-State Builder for the `opnsense-dns-haproxy-ingress-proxy` plugin.
///
/// Hosts of ingresses proxied through a shared HAProxy frontend resolve to
/// the address configured for that frontend. The frontend's own `hostname`
/// is published as well, attributed to the first ingress using it.
#[derive(Debug, Clone)]
pub struct DnsHaproxyBuilder {
    backends: DnsBackends,
    frontends: BTreeMap<String, FrontendDns>,
    policy: IngressProxyPolicy,
}

impl DnsHaproxyBuilder {
    pub fn new(config: &DnsHaproxyIngressProxyConfig, policy: IngressProxyPolicy) -> Self {
        Self { backends: config.dns_backends.clone(), frontends: config.frontends.clone(), policy }
    }

    fn entries(&self, ingress: &Ingress) -> Vec<HostEntry> {
        if !self.policy.enabled(ingress) {
            return Vec::new();
        }
        let source = ResourceRef::from_meta("Ingress", &ingress.metadata);
        let hosts: Vec<String> =
            rule_hosts(ingress).into_iter().filter(|host| self.policy.host_allowed(host)).collect();

        let mut entries = Vec::new();
        for frontend in self.policy.frontends(ingress) {
            let Some(dns) = self.frontends.get(&frontend) else {
                debug!("Frontend {} has no DNS configuration, skipping for {}", frontend, source);
                continue;
            };
            let Some(address) = dns.address.as_deref().map(str::trim).filter(|a| !a.is_empty()) else {
                warn!("Frontend {} has no address configured, skipping for {}", frontend, source);
                continue;
            };

            if let Some(hostname) = dns.hostname.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
                entries.push(HostEntry { hostname: hostname.to_string(), ip: address.to_string(), source: source.clone() });
            }
            entries.extend(
                hosts
                    .iter()
                    .map(|host| HostEntry { hostname: host.clone(), ip: address.to_string(), source: source.clone() }),
            );
        }
        entries
    }
}

#[async_trait]
impl DesiredStateBuilder for DnsHaproxyBuilder {
    fn collections(&self) -> Vec<Collection> {
        dns_collections(&self.backends)
    }

    fn build(&self, snapshot: &Snapshot, _inventory: &Inventory) -> DesiredState {
        let entries = snapshot.ingresses.iter().flat_map(|ingress| self.entries(ingress)).collect();
        host_records(entries, &self.backends)
    }
}
