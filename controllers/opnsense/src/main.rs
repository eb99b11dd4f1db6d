//! OPNsense Controller
//!
//! Mirrors Kubernetes state into an OPNsense appliance:
//! - Nodes become BGP neighbors (OpenBGPD or FRR) for MetalLB peering
//! - Ingresses become HAProxy frontends, ACLs and actions on shared frontends
//! - Labelled ConfigMaps declare HAProxy backends, servers and frontends
//! - Services and Ingresses become dnsmasq / Unbound host overrides
//!
//! Only records this controller created are ever updated or deleted.

mod annotations;
mod backoff;
mod controller;
mod debounce;
mod desired;
mod error;
mod metrics;
mod plugin;
mod reconciler;
mod remote;
mod settings;
mod store;
#[cfg(test)]
mod test_utils;
mod watcher;

use anyhow::{Context, Result, bail};
use controller::Controller;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use opnsense_client::OpnSenseClient;
use settings::{CONFIG_KEY, ControllerSettings, PluginsConfig};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Failed to install rustls crypto provider: {e:?}");
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting OPNsense Controller");

    let settings = ControllerSettings::from_env()?;
    info!("Configuration:");
    info!("  OPNsense URL: {}", settings.opnsense_url);
    info!("  Controller: {} in {}", settings.controller_name, settings.namespace);
    info!("  Config ConfigMap: {}", settings.config_map);
    info!("  Store ConfigMap: {}", settings.store_config_map);
    if settings.opnsense_insecure_tls {
        warn!("  TLS certificate verification disabled for the appliance");
    }

    let opnsense = OpnSenseClient::builder(&settings.opnsense_url, &settings.opnsense_api_key, &settings.opnsense_api_secret)
        .timeout(settings.opnsense_timeout)
        .danger_accept_invalid_certs(settings.opnsense_insecure_tls)
        .build()
        .context("building OPNsense client")?;

    let kube_client = Client::try_default().await.context("connecting to Kubernetes")?;
    let config = load_plugins_config(kube_client.clone(), &settings).await?;

    let controller = Controller::new(&settings, &config, kube_client, Arc::new(opnsense))?;
    controller.run().await?;

    info!("OPNsense Controller stopped");
    Ok(())
}

/// Read the plugin configuration from the controller ConfigMap.
async fn load_plugins_config(client: Client, settings: &ControllerSettings) -> Result<PluginsConfig> {
    let api: Api<ConfigMap> = Api::namespaced(client, &settings.namespace);
    let Some(config_map) = api
        .get_opt(&settings.config_map)
        .await
        .with_context(|| format!("reading ConfigMap {}/{}", settings.namespace, settings.config_map))?
    else {
        bail!("ConfigMap {}/{} not found", settings.namespace, settings.config_map);
    };

    let raw = config_map.data.as_ref().and_then(|data| data.get(CONFIG_KEY)).map(String::as_str).unwrap_or_default();
    if raw.trim().is_empty() {
        warn!("ConfigMap {}/{} has no {} key, no plugins enabled", settings.namespace, settings.config_map, CONFIG_KEY);
    }
    Ok(PluginsConfig::from_yaml(raw)?)
}
