//! Remote State Adapter.
//!
//! One adapter per appliance collection. A pass searches each collection once
//! and looks records up by name in the resulting map; nothing is cached
//! between passes.

use crate::error::ControllerError;
use async_trait::async_trait;
use opnsense_client::{Endpoint, OpnSenseClientTrait, Row, Subsystem, field_string};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// The appliance's copy of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    /// Appliance-assigned identifier
    pub id: String,
    pub name: String,
    pub body: Row,
}

/// Read and write access to one appliance collection.
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Current records keyed by name.
    async fn search(&self) -> Result<BTreeMap<String, RemoteRecord>, ControllerError>;

    /// Full record by id. Option fields come back as selection maps rather
    /// than the display values of a search row.
    async fn get(&self, id: &str) -> Result<Row, ControllerError>;

    /// Create a record and return its appliance id.
    async fn create(&self, record: &Row) -> Result<String, ControllerError>;

    async fn update(&self, id: &str, record: &Row) -> Result<(), ControllerError>;

    async fn delete(&self, id: &str) -> Result<(), ControllerError>;
}

/// Applies saved configuration of an appliance subsystem.
#[async_trait]
pub trait ServiceReload: Send + Sync {
    fn subsystem(&self) -> Subsystem;

    async fn reload(&self) -> Result<(), ControllerError>;
}

/// [`RemoteAdapter`] over one OPNsense API endpoint.
#[derive(Clone)]
pub struct EndpointAdapter {
    client: Arc<dyn OpnSenseClientTrait>,
    endpoint: Endpoint,
}

impl EndpointAdapter {
    pub fn new(client: Arc<dyn OpnSenseClientTrait>, endpoint: Endpoint) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl RemoteAdapter for EndpointAdapter {
    async fn search(&self) -> Result<BTreeMap<String, RemoteRecord>, ControllerError> {
        let rows = self.client.search(&self.endpoint).await?;
        let mut records = BTreeMap::new();

        for row in rows {
            let (Some(name), Some(id)) = (self.endpoint.key.key_of(&row), field_string(&row, "uuid")) else {
                debug!("Ignoring {} row without key or uuid", self.endpoint);
                continue;
            };
            if records.contains_key(&name) {
                warn!("{} has more than one record named {}, using the first", self.endpoint, name);
                continue;
            }
            records.insert(name.clone(), RemoteRecord { id, name, body: row });
        }

        Ok(records)
    }

    async fn get(&self, id: &str) -> Result<Row, ControllerError> {
        Ok(self.client.get_item(&self.endpoint, id).await?)
    }

    async fn create(&self, record: &Row) -> Result<String, ControllerError> {
        Ok(self.client.add_item(&self.endpoint, record).await?)
    }

    async fn update(&self, id: &str, record: &Row) -> Result<(), ControllerError> {
        Ok(self.client.set_item(&self.endpoint, id, record).await?)
    }

    async fn delete(&self, id: &str) -> Result<(), ControllerError> {
        Ok(self.client.del_item(&self.endpoint, id).await?)
    }
}

/// [`ServiceReload`] for one OPNsense subsystem.
#[derive(Clone)]
pub struct SubsystemReloader {
    client: Arc<dyn OpnSenseClientTrait>,
    subsystem: Subsystem,
}

impl SubsystemReloader {
    pub fn new(client: Arc<dyn OpnSenseClientTrait>, subsystem: Subsystem) -> Self {
        Self { client, subsystem }
    }
}

#[async_trait]
impl ServiceReload for SubsystemReloader {
    fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    async fn reload(&self) -> Result<(), ControllerError> {
        Ok(self.client.reload(self.subsystem).await?)
    }
}
