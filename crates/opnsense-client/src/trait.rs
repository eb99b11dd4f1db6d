//! OpnSenseClient trait for mocking
//!
//! The controller talks to the appliance only through this trait, so unit
//! tests can run reconciliation passes against an in-memory mock.

use crate::endpoint::{Endpoint, Subsystem};
use crate::error::OpnSenseError;
use crate::models::Row;

/// Trait for OPNsense API client operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait OpnSenseClientTrait: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// List every row of a collection.
    async fn search(&self, endpoint: &Endpoint) -> Result<Vec<Row>, OpnSenseError>;

    /// Fetch a single record, unwrapped from its `<wrapper>` key.
    async fn get_item(&self, endpoint: &Endpoint, uuid: &str) -> Result<Row, OpnSenseError>;

    /// Create a record and return the appliance-assigned uuid.
    async fn add_item(&self, endpoint: &Endpoint, record: &Row) -> Result<String, OpnSenseError>;

    /// Replace the fields of an existing record.
    async fn set_item(&self, endpoint: &Endpoint, uuid: &str, record: &Row) -> Result<(), OpnSenseError>;

    /// Delete a record. Deleting a record that is already gone succeeds.
    async fn del_item(&self, endpoint: &Endpoint, uuid: &str) -> Result<(), OpnSenseError>;

    /// Ask a subsystem to apply its saved configuration.
    async fn reload(&self, subsystem: Subsystem) -> Result<(), OpnSenseError>;
}
