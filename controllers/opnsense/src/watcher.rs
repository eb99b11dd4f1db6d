//! Kubernetes resource watchers.
//!
//! Each plugin watches one kind of object through a kube-runtime reflector.
//! Declarative ConfigMaps also need the Services and Nodes they resolve
//! servers against, so that watch runs three reflectors.
//! The reflector keeps the authoritative snapshot; the watch stream itself
//! only fires the plugin's debounce trigger.

use crate::debounce::Trigger;
use crate::desired::Snapshot;
use crate::error::ControllerError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Node, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client};
use kube_runtime::reflector::{self, Store};
use kube_runtime::{WatchStreamExt, watcher};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use tracing::{info, warn};

/// Label and field selectors of a watch. Empty selectors are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selectors {
    pub label: Option<String>,
    pub field: Option<String>,
}

impl Selectors {
    pub fn new(label: Option<&str>, field: Option<&str>) -> Self {
        let clean = |s: Option<&str>| s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        Self { label: clean(label), field: clean(field) }
    }

    pub fn watcher_config(&self) -> watcher::Config {
        let mut config = watcher::Config::default();
        if let Some(labels) = &self.label {
            config = config.labels(labels);
        }
        if let Some(fields) = &self.field {
            config = config.fields(fields);
        }
        config
    }
}

/// Kind of cluster object a plugin watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedKind {
    Ingress,
    Service,
    Node,
    ConfigMap,
}

impl std::fmt::Display for WatchedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ingress => write!(f, "Ingress"),
            Self::Service => write!(f, "Service"),
            Self::Node => write!(f, "Node"),
            Self::ConfigMap => write!(f, "ConfigMap"),
        }
    }
}

/// Where a plugin reads its snapshot from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Resolves once the initial list has been received.
    async fn ready(&self) -> Result<(), ControllerError>;

    fn snapshot(&self) -> Snapshot;
}

/// Reader side of a plugin's reflector.
#[derive(Clone)]
pub enum Reflection {
    Ingresses(Store<Ingress>),
    Services(Store<Service>),
    Nodes(Store<Node>),
    ConfigMaps { config_maps: Store<ConfigMap>, services: Store<Service>, nodes: Store<Node> },
}

#[async_trait]
impl SnapshotSource for Reflection {
    async fn ready(&self) -> Result<(), ControllerError> {
        let result = match self {
            Self::Ingresses(store) => store.wait_until_ready().await,
            Self::Services(store) => store.wait_until_ready().await,
            Self::Nodes(store) => store.wait_until_ready().await,
            Self::ConfigMaps { config_maps, services, nodes } => {
                futures::try_join!(config_maps.wait_until_ready(), services.wait_until_ready(), nodes.wait_until_ready())
                    .map(|_| ())
            }
        };
        result.map_err(|e| ControllerError::Watch(e.to_string()))
    }

    fn snapshot(&self) -> Snapshot {
        match self {
            Self::Ingresses(store) => Snapshot::new(store.state(), Vec::new(), Vec::new()),
            Self::Services(store) => Snapshot::new(Vec::new(), store.state(), Vec::new()),
            Self::Nodes(store) => Snapshot::new(Vec::new(), Vec::new(), store.state()),
            Self::ConfigMaps { config_maps, services, nodes } => {
                Snapshot::new(Vec::new(), services.state(), nodes.state()).with_config_maps(config_maps.state())
            }
        }
    }
}

/// Start watching `kind` for `plugin`.
///
/// Returns the reflection and the future that drives the watch; the future
/// only ends if the watch stream does.
pub fn watch(
    client: Client,
    plugin: &str,
    kind: WatchedKind,
    selectors: &Selectors,
    trigger: Trigger,
) -> (Reflection, BoxFuture<'static, ()>) {
    info!(
        plugin = plugin,
        label_selector = selectors.label.as_deref().unwrap_or(""),
        field_selector = selectors.field.as_deref().unwrap_or(""),
        "Starting {} watcher",
        kind
    );

    match kind {
        WatchedKind::Ingress => {
            let (store, driver) = reflect(Api::<Ingress>::all(client), plugin, selectors, trigger);
            (Reflection::Ingresses(store), driver)
        }
        WatchedKind::Service => {
            let (store, driver) = reflect(Api::<Service>::all(client), plugin, selectors, trigger);
            (Reflection::Services(store), driver)
        }
        WatchedKind::Node => {
            let (store, driver) = reflect(Api::<Node>::all(client), plugin, selectors, trigger);
            (Reflection::Nodes(store), driver)
        }
        WatchedKind::ConfigMap => {
            let (config_maps, config_map_driver) =
                reflect(Api::<ConfigMap>::all(client.clone()), plugin, selectors, trigger.clone());
            let everything = Selectors::default();
            let (services, service_driver) =
                reflect(Api::<Service>::all(client.clone()), plugin, &everything, trigger.clone());
            let (nodes, node_driver) = reflect(Api::<Node>::all(client), plugin, &everything, trigger);
            let driver = futures::future::select_all([config_map_driver, service_driver, node_driver])
                .map(|_| ())
                .boxed();
            (Reflection::ConfigMaps { config_maps, services, nodes }, driver)
        }
    }
}

fn reflect<K>(api: Api<K>, plugin: &str, selectors: &Selectors, trigger: Trigger) -> (Store<K>, BoxFuture<'static, ()>)
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let plugin = plugin.to_string();
    let (reader, writer) = reflector::store();

    let driver = watcher(api, selectors.watcher_config())
        .default_backoff()
        .reflect(writer)
        .for_each(move |event| {
            match event {
                // Deletions included: every change can alter the desired state.
                Ok(_) => trigger.fire(),
                Err(e) => warn!("{} watch error: {}", plugin, e),
            }
            futures::future::ready(())
        })
        .boxed();

    (reader, driver)
}
