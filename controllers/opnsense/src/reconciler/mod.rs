//! Reconciliation passes.
//!
//! A [`Reconciler`] owns everything one plugin needs for a pass: its
//! Desired-State Builder, one Remote State Adapter per collection, the
//! reloaders of the subsystems those collections live in, and its ownership
//! store. A pass:
//!
//! 1. looks up the builder's inventory and builds the desired state
//! 2. reads the previous ownership
//! 3. per collection, in order: searches the appliance, resolves links,
//!    creates missing records and updates drifted ones
//! 4. deletes owned records that are no longer desired, collections in
//!    reverse order
//! 5. reloads the affected subsystems
//! 6. saves the new ownership
//!
//! Any error aborts the pass before step 6, leaving the store untouched.

pub mod plan;

use crate::desired::{Collection, DesiredRecord, DesiredState, DesiredStateBuilder, Snapshot};
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::remote::{EndpointAdapter, RemoteAdapter, RemoteRecord, ServiceReload, SubsystemReloader};
use crate::store::{Ownership, OwnershipStore};
use opnsense_client::{OpnSenseClientTrait, Row};
use plan::{Plan, drifted, plan};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counts of one finished pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Owned records that were already gone from the appliance
    pub dropped: usize,
    pub unchanged: usize,
    pub reloaded: bool,
    /// Records owned after the pass
    pub owned: usize,
}

impl PassSummary {
    pub fn changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

struct Binding {
    collection: Collection,
    adapter: Arc<dyn RemoteAdapter>,
}

/// Runs passes for one plugin.
pub struct Reconciler {
    plugin: String,
    builder: Box<dyn DesiredStateBuilder>,
    client: Arc<dyn OpnSenseClientTrait>,
    bindings: Vec<Binding>,
    reloaders: Vec<Arc<dyn ServiceReload>>,
    store: Arc<dyn OwnershipStore>,
    metrics: Metrics,
    /// Set once a change reached the appliance, cleared when the reload after it succeeded.
    /// Starts set: a previous process may have exited between apply and reload.
    reload_pending: bool,
}

impl Reconciler {
    pub fn new(
        plugin: impl Into<String>,
        builder: Box<dyn DesiredStateBuilder>,
        client: Arc<dyn OpnSenseClientTrait>,
        store: Arc<dyn OwnershipStore>,
        metrics: Metrics,
    ) -> Self {
        let collections = builder.collections();

        let bindings = collections
            .iter()
            .map(|collection| Binding {
                collection: *collection,
                adapter: Arc::new(EndpointAdapter::new(client.clone(), collection.endpoint)) as Arc<dyn RemoteAdapter>,
            })
            .collect();

        let mut subsystems = Vec::new();
        for collection in &collections {
            if !subsystems.contains(&collection.endpoint.subsystem) {
                subsystems.push(collection.endpoint.subsystem);
            }
        }
        let reloaders = subsystems
            .into_iter()
            .map(|subsystem| Arc::new(SubsystemReloader::new(client.clone(), subsystem)) as Arc<dyn ServiceReload>)
            .collect();

        Self { plugin: plugin.into(), builder, client, bindings, reloaders, store, metrics, reload_pending: true }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    #[cfg(test)]
    pub fn reload_pending(&self) -> bool {
        self.reload_pending
    }

    /// Run one pass and record its outcome.
    pub async fn run_pass(&mut self, snapshot: &Snapshot) -> Result<PassSummary, ControllerError> {
        info!("Starting {} reconciliation pass", self.plugin);
        let result = self.pass(snapshot).await;

        match &result {
            Ok(summary) => {
                self.metrics.record_pass(&self.plugin, "success");
                self.metrics.set_managed(&self.plugin, summary.owned);
                info!(
                    "{} pass complete: changes={} created={} updated={} deleted={} dropped={} unchanged={} reloaded={}",
                    self.plugin,
                    summary.changes(),
                    summary.created,
                    summary.updated,
                    summary.deleted,
                    summary.dropped,
                    summary.unchanged,
                    summary.reloaded
                );
            }
            Err(_) => self.metrics.record_pass(&self.plugin, "failure"),
        }

        result
    }

    async fn pass(&mut self, snapshot: &Snapshot) -> Result<PassSummary, ControllerError> {
        let inventory = self.builder.inventory(snapshot, self.client.as_ref()).await?;
        let desired = self.builder.build(snapshot, &inventory);
        let previous = self.store.get().await?;
        debug!("{}: {} desired records, {} previously owned", self.plugin, desired.len(), previous.len());
        if desired.is_empty() && !previous.is_empty() {
            info!("{}: nothing desired, removing every owned record", self.plugin);
        }

        let mut summary = PassSummary::default();
        // Appliance ids by collection and name, for link resolution
        let mut ids: BTreeMap<&'static str, BTreeMap<String, String>> = BTreeMap::new();
        let mut deletions: Vec<(usize, Plan)> = Vec::new();

        for (index, binding) in self.bindings.iter().enumerate() {
            let collection = binding.collection;
            let remote = binding.adapter.search().await?;
            ids.insert(collection.id, remote_ids(&remote));

            let empty = BTreeMap::new();
            let records = desired.collection(collection.id).unwrap_or(&empty);
            let bodies = resolve_links(collection.id, records, &ids)?;
            let diff = plan(&bodies, &remote, &previous.names(collection.id));
            if diff.is_noop() {
                debug!("{} in sync", collection.id);
            }

            for name in &diff.creates {
                let id = binding.adapter.create(&bodies[name]).await?;
                self.reload_pending = true;
                self.metrics.record_change(&self.plugin, collection.id, "create");
                info!("Created {} record {} ({})", collection.id, name, id);
                summary.created += 1;
            }

            for (name, id) in &diff.updates {
                // Search rows carry display values; confirm against the full record.
                let current = binding.adapter.get(id).await?;
                if !drifted(&bodies[name], &current) {
                    summary.unchanged += 1;
                    continue;
                }
                binding.adapter.update(id, &bodies[name]).await?;
                self.reload_pending = true;
                self.metrics.record_change(&self.plugin, collection.id, "update");
                info!("Updated {} record {} ({})", collection.id, name, id);
                summary.updated += 1;
            }

            if !diff.creates.is_empty() {
                ids.insert(collection.id, remote_ids(&binding.adapter.search().await?));
            }

            summary.unchanged += diff.unchanged.len();
            summary.dropped += diff.dropped.len();
            for name in &diff.dropped {
                debug!("Owned {} record {} already gone from the appliance", collection.id, name);
            }
            deletions.push((index, diff));
        }

        for (index, diff) in deletions.iter().rev() {
            let binding = &self.bindings[*index];
            for (name, id) in &diff.deletes {
                binding.adapter.delete(id).await?;
                self.reload_pending = true;
                self.metrics.record_change(&self.plugin, binding.collection.id, "delete");
                info!("Deleted {} record {} ({})", binding.collection.id, name, id);
                summary.deleted += 1;
            }
        }

        if self.reload_pending {
            for reloader in &self.reloaders {
                reloader.reload().await?;
                info!("Reloaded {}", reloader.subsystem());
            }
            self.reload_pending = false;
            summary.reloaded = true;
        }

        let ownership = self.next_ownership(&desired, previous);
        summary.owned = ownership.len();
        self.store.save(&ownership).await?;

        Ok(summary)
    }

    /// Ownership after a successful pass. Collections this plugin no longer
    /// manages keep their previous entries.
    fn next_ownership(&self, desired: &DesiredState, previous: Ownership) -> Ownership {
        let mut ownership = Ownership::from_desired(desired, self.bindings.iter().map(|b| b.collection.id));
        for (collection, entries) in previous.collections {
            if entries.is_empty() || ownership.collections.contains_key(&collection) {
                continue;
            }
            warn!("{}: keeping {} owned {} records of a collection no longer managed", self.plugin, entries.len(), collection);
            ownership.collections.insert(collection, entries);
        }
        ownership
    }
}

fn remote_ids(remote: &BTreeMap<String, RemoteRecord>) -> BTreeMap<String, String> {
    remote.iter().map(|(name, record)| (name.clone(), record.id.clone())).collect()
}

/// Desired bodies of a collection with link fields replaced by appliance ids.
fn resolve_links(
    collection: &str,
    records: &BTreeMap<String, DesiredRecord>,
    ids: &BTreeMap<&'static str, BTreeMap<String, String>>,
) -> Result<BTreeMap<String, Row>, ControllerError> {
    let mut bodies = BTreeMap::new();

    for (name, record) in records {
        let mut body = record.body.clone();
        for link in &record.links {
            let target = ids.get(link.target);
            let resolved = link
                .names
                .iter()
                .map(|linked| {
                    target.and_then(|t| t.get(linked)).cloned().ok_or_else(|| ControllerError::UnresolvedLink {
                        collection: collection.to_string(),
                        record: name.clone(),
                        target: link.target.to_string(),
                        name: linked.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            body.insert(link.field.to_string(), json!(resolved.join(",")));
        }
        bodies.insert(name.clone(), body);
    }

    Ok(bodies)
}
