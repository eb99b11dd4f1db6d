//! Plugins.
//!
//! A plugin pairs a watched kind with a Desired-State Builder. Each enabled
//! plugin gets its own reconciler, ownership store key and pass loop; plugins
//! never share state.

use crate::backoff::FibonacciBackoff;
use crate::debounce::Debouncer;
use crate::desired::DesiredStateBuilder;
use crate::desired::bgp::BgpBuilder;
use crate::desired::declarative::{self, DeclarativeBuilder};
use crate::desired::dns::{DnsHaproxyBuilder, DnsIngressesBuilder, DnsServicesBuilder};
use crate::desired::haproxy::{HaproxyBuilder, IngressProxyPolicy};
use crate::error::ControllerError;
use crate::metrics::Readiness;
use crate::reconciler::Reconciler;
use crate::settings::{HaproxyIngressProxyConfig, PluginsConfig, Schedule};
use crate::watcher::{Selectors, SnapshotSource, WatchedKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

pub const METALLB: &str = "metallb";
pub const HAPROXY_INGRESS_PROXY: &str = "haproxy-ingress-proxy";
pub const HAPROXY_DECLARATIVE: &str = "haproxy-declarative";
pub const DNS_SERVICES: &str = "opnsense-dns-services";
pub const DNS_INGRESSES: &str = "opnsense-dns-ingresses";
pub const DNS_HAPROXY_INGRESS_PROXY: &str = "opnsense-dns-haproxy-ingress-proxy";

const INGRESS_SETTLE_SECONDS: u64 = 10;
const DEFAULT_SETTLE_SECONDS: u64 = 5;

/// An enabled plugin, ready to be wired to a watch and a reconciler.
pub struct PluginDefinition {
    pub id: &'static str,
    pub kind: WatchedKind,
    pub selectors: Selectors,
    pub settle: Duration,
    pub resync: Option<Duration>,
    pub builder: Box<dyn DesiredStateBuilder>,
}

impl PluginDefinition {
    fn new(
        id: &'static str,
        kind: WatchedKind,
        selectors: Selectors,
        schedule: &Schedule,
        builder: Box<dyn DesiredStateBuilder>,
    ) -> Self {
        let default_settle = match kind {
            WatchedKind::Ingress => INGRESS_SETTLE_SECONDS,
            WatchedKind::Service | WatchedKind::Node | WatchedKind::ConfigMap => DEFAULT_SETTLE_SECONDS,
        };
        Self { id, kind, selectors, settle: schedule.settle(default_settle), resync: schedule.resync(), builder }
    }
}

impl std::fmt::Debug for PluginDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDefinition")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("selectors", &self.selectors)
            .field("settle", &self.settle)
            .field("resync", &self.resync)
            .finish_non_exhaustive()
    }
}

/// Enabled plugins of a configuration. Disabled and absent plugins are skipped.
pub fn definitions(config: &PluginsConfig, controller_id: &str) -> Result<Vec<PluginDefinition>, ControllerError> {
    let mut plugins = Vec::new();

    if let Some(metallb) = config.metallb.as_ref().filter(|c| c.enabled) {
        plugins.push(PluginDefinition::new(
            METALLB,
            WatchedKind::Node,
            Selectors::new(metallb.node_label_selector.as_deref(), metallb.node_field_selector.as_deref()),
            &metallb.schedule,
            Box::new(BgpBuilder::new(metallb)),
        ));
    }

    if let Some(haproxy) = config.haproxy_ingress_proxy.as_ref().filter(|c| c.enabled) {
        plugins.push(PluginDefinition::new(
            HAPROXY_INGRESS_PROXY,
            WatchedKind::Ingress,
            ingress_selectors(haproxy),
            &haproxy.schedule,
            Box::new(HaproxyBuilder::new(controller_id, haproxy.clone())?),
        ));
    }

    if let Some(haproxy) = config.haproxy_declarative.as_ref().filter(|c| c.enabled) {
        let label = haproxy.config_map_label_selector.as_deref().unwrap_or(declarative::DEFAULT_LABEL_SELECTOR);
        plugins.push(PluginDefinition::new(
            HAPROXY_DECLARATIVE,
            WatchedKind::ConfigMap,
            Selectors::new(Some(label), haproxy.config_map_field_selector.as_deref()),
            &haproxy.schedule,
            Box::new(DeclarativeBuilder::new()),
        ));
    }

    if let Some(dns) = config.opnsense_dns_services.as_ref().filter(|c| c.enabled) {
        plugins.push(PluginDefinition::new(
            DNS_SERVICES,
            WatchedKind::Service,
            Selectors::new(dns.service_label_selector.as_deref(), dns.service_field_selector.as_deref()),
            &dns.schedule,
            Box::new(DnsServicesBuilder::new(dns)),
        ));
    }

    if let Some(dns) = config.opnsense_dns_ingresses.as_ref().filter(|c| c.enabled) {
        plugins.push(PluginDefinition::new(
            DNS_INGRESSES,
            WatchedKind::Ingress,
            Selectors::new(dns.ingress_label_selector.as_deref(), dns.ingress_field_selector.as_deref()),
            &dns.schedule,
            Box::new(DnsIngressesBuilder::new(dns)?),
        ));
    }

    if let Some(dns) = config.opnsense_dns_haproxy_ingress_proxy.as_ref().filter(|c| c.enabled) {
        // Proxied ingresses are decided by the HAProxy plugin's settings, enabled or not.
        let haproxy = config.haproxy_ingress_proxy.clone().unwrap_or_default();
        plugins.push(PluginDefinition::new(
            DNS_HAPROXY_INGRESS_PROXY,
            WatchedKind::Ingress,
            ingress_selectors(&haproxy),
            &dns.schedule,
            Box::new(DnsHaproxyBuilder::new(dns, IngressProxyPolicy::new(haproxy)?)),
        ));
    }

    Ok(plugins)
}

fn ingress_selectors(config: &HaproxyIngressProxyConfig) -> Selectors {
    Selectors::new(config.ingress_label_selector.as_deref(), config.ingress_field_selector.as_deref())
}

/// Pass loop of one plugin.
///
/// A pass runs when the debouncer settles, when the resync interval elapses
/// without one, or when a failed pass is due for a retry.
pub struct PluginRunner {
    reconciler: Reconciler,
    source: Box<dyn SnapshotSource>,
    debouncer: Debouncer,
    resync: Option<Duration>,
    readiness: Arc<Readiness>,
    backoff: FibonacciBackoff,
}

impl PluginRunner {
    pub fn new(
        reconciler: Reconciler,
        source: Box<dyn SnapshotSource>,
        debouncer: Debouncer,
        resync: Option<Duration>,
        readiness: Arc<Readiness>,
    ) -> Self {
        Self { reconciler, source, debouncer, resync, readiness, backoff: FibonacciBackoff::default() }
    }

    /// Run passes until the watch feeding the debouncer goes away.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        let plugin = self.reconciler.plugin().to_string();
        self.source.ready().await?;
        info!("{} watch synced", plugin);

        let mut retry: Option<Duration> = None;
        loop {
            let wait = retry.or(self.resync);
            tokio::select! {
                alive = self.debouncer.settled() => {
                    if !alive {
                        info!("{} watch closed, stopping", plugin);
                        return Ok(());
                    }
                }
                () = sleep_for(wait) => {
                    if retry.is_some() {
                        info!("Retrying {} pass", plugin);
                    } else {
                        debug!("Periodic resync of {}", plugin);
                    }
                }
            }
            retry = self.pass().await;
        }
    }

    /// Run one pass. Returns the retry delay when it failed.
    async fn pass(&mut self) -> Option<Duration> {
        let snapshot = self.source.snapshot();
        let result = self.reconciler.run_pass(&snapshot).await;
        self.readiness.attempted(self.reconciler.plugin());

        match result {
            Ok(_) => {
                self.backoff.reset();
                None
            }
            Err(e) => {
                let delay = self.backoff.next_backoff();
                error!(
                    plugin = self.reconciler.plugin(),
                    status_code = ?e.status_code(),
                    "Pass failed: {}, retrying in {}s",
                    e,
                    delay.as_secs()
                );
                Some(delay)
            }
        }
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}
