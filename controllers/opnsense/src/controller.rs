//! Main controller implementation.
//!
//! This module contains the `Controller` struct that starts one watch and
//! one pass loop per enabled plugin, plus the probe server, and waits for
//! any of them to stop.

use crate::debounce;
use crate::error::ControllerError;
use crate::metrics::{self, Metrics, Readiness};
use crate::plugin::{self, PluginRunner};
use crate::reconciler::Reconciler;
use crate::settings::{ControllerSettings, PluginsConfig};
use crate::store::ConfigMapStore;
use crate::watcher;
use kube::Client;
use opnsense_client::OpnSenseClientTrait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Main controller for OPNsense reconciliation.
#[derive(Debug)]
pub struct Controller {
    plugins: Vec<(&'static str, JoinHandle<Result<(), ControllerError>>)>,
    watches: Vec<JoinHandle<()>>,
    probes: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Spawns the watches, pass loops and probe server.
    pub fn new(
        settings: &ControllerSettings,
        config: &PluginsConfig,
        kube_client: Client,
        opnsense: Arc<dyn OpnSenseClientTrait>,
    ) -> Result<Self, ControllerError> {
        let controller_id = config.controller_id.clone().unwrap_or_else(|| settings.controller_name.clone());
        let definitions = plugin::definitions(config, &controller_id)?;
        if definitions.is_empty() {
            warn!("No plugins enabled, only the probe server will run");
        }

        let metrics = Metrics::new()?;
        let readiness = Arc::new(Readiness::new(definitions.iter().map(|d| d.id)));

        let mut plugins = Vec::new();
        let mut watches = Vec::new();
        for definition in definitions {
            info!(
                plugin = definition.id,
                settle_seconds = definition.settle.as_secs(),
                resync_seconds = definition.resync.map(|r| r.as_secs()),
                "Enabling plugin"
            );

            let (trigger, debouncer) = debounce::channel(definition.settle);
            let (reflection, driver) =
                watcher::watch(kube_client.clone(), definition.id, definition.kind, &definition.selectors, trigger);

            let store = Arc::new(ConfigMapStore::new(
                kube_client.clone(),
                &settings.namespace,
                &settings.store_config_map,
                definition.id,
                &settings.controller_name,
            ));
            let reconciler =
                Reconciler::new(definition.id, definition.builder, Arc::clone(&opnsense), store, metrics.clone());
            let runner =
                PluginRunner::new(reconciler, Box::new(reflection), debouncer, definition.resync, Arc::clone(&readiness));

            watches.push(tokio::spawn(driver));
            plugins.push((definition.id, tokio::spawn(runner.run())));
        }

        let probes = tokio::spawn(metrics::serve(settings.metrics_addr, metrics, readiness));

        Ok(Self { plugins, watches, probes })
    }

    /// Runs the controller until a task stops or the process is interrupted.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("OPNsense controller running with {} plugin(s)", self.plugins.len());

        let plugins = &mut self.plugins;
        let first_plugin_exit = async move {
            if plugins.is_empty() {
                return std::future::pending().await;
            }
            let (result, index, rest) =
                futures::future::select_all(plugins.iter_mut().map(|(_, handle)| handle)).await;
            drop(rest);
            (plugins[index].0, result)
        };

        let outcome = tokio::select! {
            (plugin, result) = first_plugin_exit => match result {
                Err(e) => Err(ControllerError::Watch(format!("{plugin} pass loop panicked: {e}"))),
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) => Err(ControllerError::Watch(format!("{plugin} watch ended"))),
            },
            result = &mut self.probes => match result {
                Err(e) => Err(ControllerError::Watch(format!("Probe server panicked: {e}"))),
                Ok(result) => result,
            },
            signal = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                signal.map_err(ControllerError::from)
            }
        };

        self.shutdown();
        outcome
    }

    fn shutdown(&self) {
        for handle in &self.watches {
            handle.abort();
        }
        for (_, handle) in &self.plugins {
            handle.abort();
        }
        self.probes.abort();
    }
}
