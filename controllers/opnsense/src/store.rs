//! Ownership Store.
//!
//! The store is the only record of what this controller created on the
//! appliance, and so the only thing deletions are computed from. It is read
//! once at the start of a pass and written once, after apply and reload
//! succeeded.

use crate::desired::{DesiredState, ResourceRef};
use crate::error::ControllerError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
#[cfg(test)]
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Why a record was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipEntry {
    pub resource: ResourceRef,
}

/// Records created by one plugin, per collection id, keyed by record name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ownership {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub collections: BTreeMap<String, BTreeMap<String, OwnershipEntry>>,
}

impl Ownership {
    /// Ownership matching a desired state, restricted to `collections`.
    pub fn from_desired<'a>(desired: &DesiredState, collections: impl IntoIterator<Item = &'a str>) -> Self {
        let mut ownership = Self { updated_at: Some(chrono::Utc::now().to_rfc3339()), ..Self::default() };
        for id in collections {
            let entries = desired
                .collection(id)
                .into_iter()
                .flatten()
                .map(|(name, record)| (name.clone(), OwnershipEntry { resource: record.source.clone() }))
                .collect();
            ownership.collections.insert(id.to_string(), entries);
        }
        ownership
    }

    /// Names owned in a collection.
    pub fn names(&self, collection: &str) -> BTreeSet<String> {
        self.collections.get(collection).map(|c| c.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.collections.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Persistence of one plugin's [`Ownership`].
#[async_trait]
pub trait OwnershipStore: Send + Sync {
    /// Last saved ownership, empty when nothing was saved yet.
    async fn get(&self) -> Result<Ownership, ControllerError>;

    /// Replace the saved ownership.
    async fn save(&self, ownership: &Ownership) -> Result<(), ControllerError>;
}

/// Ownership kept under one data key of a shared ConfigMap.
///
/// Each plugin applies only its own key with its own field manager, so
/// server-side apply never has two plugins fight over a field.
#[derive(Clone)]
pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
    key: String,
    field_manager: String,
}

impl ConfigMapStore {
    pub fn new(client: kube::Client, namespace: &str, name: &str, key: &str, controller_name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
            key: key.to_string(),
            field_manager: format!("{controller_name}-{key}"),
        }
    }
}

#[async_trait]
impl OwnershipStore for ConfigMapStore {
    async fn get(&self) -> Result<Ownership, ControllerError> {
        let Some(config_map) = self.api.get_opt(&self.name).await? else {
            debug!("Store ConfigMap {}/{} does not exist yet", self.namespace, self.name);
            return Ok(Ownership::default());
        };
        match config_map.data.as_ref().and_then(|data| data.get(&self.key)) {
            Some(raw) => decode(raw),
            None => Ok(Ownership::default()),
        }
    }

    async fn save(&self, ownership: &Ownership) -> Result<(), ControllerError> {
        let raw = serde_json::to_string(ownership)?;
        let patch = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": self.name, "namespace": self.namespace },
            "data": { self.key.clone(): raw },
        });
        let params = PatchParams::apply(&self.field_manager).force();
        self.api.patch(&self.name, &params, &Patch::Apply(&patch)).await?;
        Ok(())
    }
}

fn decode(raw: &str) -> Result<Ownership, ControllerError> {
    if raw.trim().is_empty() {
        return Ok(Ownership::default());
    }
    serde_json::from_str(raw).map_err(|e| ControllerError::Store(format!("corrupt ownership data: {e}")))
}

/// In-memory [`OwnershipStore`] holding the serialized form.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStore {
    raw: Mutex<Option<String>>,
    fail_saves: Mutex<bool>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exactly what the last save wrote.
    pub fn raw(&self) -> Option<String> {
        self.raw.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().unwrap_or_else(PoisonError::into_inner) = fail;
    }
}

#[cfg(test)]
#[async_trait]
impl OwnershipStore for MemoryStore {
    async fn get(&self) -> Result<Ownership, ControllerError> {
        match self.raw() {
            Some(raw) => decode(&raw),
            None => Ok(Ownership::default()),
        }
    }

    async fn save(&self, ownership: &Ownership) -> Result<(), ControllerError> {
        if *self.fail_saves.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(ControllerError::Store("save rejected".to_string()));
        }
        let raw = serde_json::to_string(ownership)?;
        *self.raw.lock().unwrap_or_else(PoisonError::into_inner) = Some(raw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::DesiredRecord;
    use crate::test_utils::row;
    use serde_json::json;

    fn source(name: &str) -> ResourceRef {
        ResourceRef {
            kind: "Service".to_string(),
            namespace: Some("default".to_string()),
            name: name.to_string(),
            uid: Some(format!("uid-{name}")),
        }
    }

    #[test]
    fn test_from_desired_covers_every_listed_collection() {
        let mut desired = DesiredState::default();
        desired.insert(
            "dnsmasq-host",
            DesiredRecord { name: "www.example.com".to_string(), source: source("web"), body: row(json!({})), links: Vec::new() },
        );

        let ownership = Ownership::from_desired(&desired, ["dnsmasq-host", "unbound-host-override"]);
        assert_eq!(ownership.names("dnsmasq-host"), BTreeSet::from(["www.example.com".to_string()]));
        assert!(ownership.collections["unbound-host-override"].is_empty());
        assert_eq!(ownership.len(), 1);
        assert!(ownership.updated_at.is_some());
    }

    #[test]
    fn test_wire_format() {
        let raw = r#"{"collections":{"haproxy-acl":{"a":{"resource":{"kind":"Ingress","namespace":"default","name":"web"}}}}}"#;
        let ownership = decode(raw).unwrap();
        assert_eq!(ownership.collections["haproxy-acl"]["a"].resource.name, "web");
        assert_eq!(ownership.collections["haproxy-acl"]["a"].resource.uid, None);
        assert_eq!(serde_json::to_string(&ownership).unwrap(), raw);

        assert!(decode("").unwrap().is_empty());
        assert!(matches!(decode("{not json"), Err(ControllerError::Store(_))));
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.get().await.unwrap().is_empty());
        assert!(store.raw().is_none());

        let mut ownership = Ownership::default();
        ownership
            .collections
            .entry("frr-neighbor".to_string())
            .or_default()
            .insert("kpc-10.0.0.1".to_string(), OwnershipEntry { resource: source("n") });
        store.save(&ownership).await.unwrap();
        assert_eq!(store.get().await.unwrap(), ownership);

        store.fail_saves(true);
        let before = store.raw();
        assert!(store.save(&Ownership::default()).await.is_err());
        assert_eq!(store.raw(), before);
    }
}
