//! Mock OpnSenseClient for unit testing
//!
//! Collections are kept in memory, keyed by their search path, and every call
//! is recorded so tests can assert on what a reconciliation pass sent to the
//! appliance.

use crate::endpoint::{Endpoint, Subsystem};
use crate::error::OpnSenseError;
use crate::models::Row;
use crate::opnsense_trait::OpnSenseClientTrait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A call received by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `search_*`
    Search(String),
    /// `get_*`
    Get(String, String),
    /// `add_*` with the natural key of the record
    Add(String, Option<String>),
    /// `set_*`
    Set(String, String),
    /// `del_*`
    Del(String, String),
    /// `service/reload`
    Reload(Subsystem),
}

impl MockCall {
    /// Whether the call changed appliance state.
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Add(..) | Self::Set(..) | Self::Del(..))
    }
}

type Collection = BTreeMap<String, Row>;

/// Mock OpnSenseClient for testing
#[derive(Debug, Clone)]
pub struct MockOpnSenseClient {
    base_url: String,
    collections: Arc<Mutex<HashMap<String, Collection>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    failing_reloads: Arc<Mutex<HashSet<Subsystem>>>,
    failing_mutations: Arc<Mutex<HashSet<String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockOpnSenseClient {
    /// Create an empty mock appliance
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            collections: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            failing_reloads: Arc::new(Mutex::new(HashSet::new())),
            failing_mutations: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Insert a record directly (for test setup) and return its uuid
    pub fn seed(&self, endpoint: &Endpoint, record: Row) -> String {
        let uuid = uuid::Uuid::new_v4().to_string();
        lock(&self.collections)
            .entry(endpoint.search_path())
            .or_default()
            .insert(uuid.clone(), record);
        uuid
    }

    /// Current records of a collection, each carrying its `uuid`
    pub fn rows(&self, endpoint: &Endpoint) -> Vec<Row> {
        lock(&self.collections)
            .get(&endpoint.search_path())
            .map(|collection| {
                collection
                    .iter()
                    .map(|(uuid, record)| with_uuid(uuid, record))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Current record of a collection by natural key
    pub fn find(&self, endpoint: &Endpoint, key: &str) -> Option<Row> {
        self.rows(endpoint)
            .into_iter()
            .find(|row| endpoint.key.key_of(row).as_deref() == Some(key))
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    /// Calls that changed appliance state
    pub fn mutations(&self) -> Vec<MockCall> {
        self.calls().into_iter().filter(MockCall::is_mutation).collect()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Make reloads of a subsystem fail
    pub fn fail_reload(&self, subsystem: Subsystem, fail: bool) {
        let mut failing = lock(&self.failing_reloads);
        if fail {
            failing.insert(subsystem);
        } else {
            failing.remove(&subsystem);
        }
    }

    /// Make add/set/del on a collection fail with a validation error
    pub fn fail_mutations_on(&self, endpoint: &Endpoint, fail: bool) {
        let mut failing = lock(&self.failing_mutations);
        if fail {
            failing.insert(endpoint.search_path());
        } else {
            failing.remove(&endpoint.search_path());
        }
    }

    fn record(&self, call: MockCall) {
        lock(&self.calls).push(call);
    }

    fn check_mutation(&self, endpoint: &Endpoint) -> Result<(), OpnSenseError> {
        if lock(&self.failing_mutations).contains(&endpoint.search_path()) {
            return Err(OpnSenseError::Validation(format!("{endpoint}: rejected by mock")));
        }
        Ok(())
    }
}

fn with_uuid(uuid: &str, record: &Row) -> Row {
    let mut row = record.clone();
    row.insert("uuid".to_string(), Value::String(uuid.to_string()));
    row
}

fn without_uuid(record: &Row) -> Row {
    let mut row = record.clone();
    row.remove("uuid");
    row
}

#[async_trait::async_trait]
impl OpnSenseClientTrait for MockOpnSenseClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn search(&self, endpoint: &Endpoint) -> Result<Vec<Row>, OpnSenseError> {
        self.record(MockCall::Search(endpoint.search_path()));
        Ok(self.rows(endpoint))
    }

    async fn get_item(&self, endpoint: &Endpoint, uuid: &str) -> Result<Row, OpnSenseError> {
        self.record(MockCall::Get(endpoint.search_path(), uuid.to_string()));
        lock(&self.collections)
            .get(&endpoint.search_path())
            .and_then(|collection| collection.get(uuid))
            .cloned()
            .ok_or_else(|| OpnSenseError::NotFound(format!("{endpoint} {uuid}")))
    }

    async fn add_item(&self, endpoint: &Endpoint, record: &Row) -> Result<String, OpnSenseError> {
        self.record(MockCall::Add(endpoint.search_path(), endpoint.key.key_of(record)));
        self.check_mutation(endpoint)?;
        Ok(self.seed(endpoint, without_uuid(record)))
    }

    async fn set_item(&self, endpoint: &Endpoint, uuid: &str, record: &Row) -> Result<(), OpnSenseError> {
        self.record(MockCall::Set(endpoint.search_path(), uuid.to_string()));
        self.check_mutation(endpoint)?;
        let mut collections = lock(&self.collections);
        let existing = collections
            .get_mut(&endpoint.search_path())
            .and_then(|collection| collection.get_mut(uuid))
            .ok_or_else(|| OpnSenseError::NotFound(format!("{endpoint} {uuid}")))?;
        for (field, value) in without_uuid(record) {
            existing.insert(field, value);
        }
        Ok(())
    }

    async fn del_item(&self, endpoint: &Endpoint, uuid: &str) -> Result<(), OpnSenseError> {
        self.record(MockCall::Del(endpoint.search_path(), uuid.to_string()));
        self.check_mutation(endpoint)?;
        if let Some(collection) = lock(&self.collections).get_mut(&endpoint.search_path()) {
            collection.remove(uuid);
        }
        Ok(())
    }

    async fn reload(&self, subsystem: Subsystem) -> Result<(), OpnSenseError> {
        self.record(MockCall::Reload(subsystem));
        if lock(&self.failing_reloads).contains(&subsystem) {
            return Err(OpnSenseError::Api { status: 500, message: format!("{subsystem} reload failed") });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    #[tokio::test]
    async fn test_add_search_set_delete() {
        let mock = MockOpnSenseClient::new("https://mock");
        let ep = Endpoint::HAPROXY_ACL;

        let uuid = mock.add_item(&ep, &row(json!({"name": "acl-1", "value": "a"}))).await.unwrap();
        let rows = mock.search(&ep).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["uuid"], json!(uuid));

        mock.set_item(&ep, &uuid, &row(json!({"value": "b"}))).await.unwrap();
        assert_eq!(mock.find(&ep, "acl-1").unwrap()["value"], json!("b"));

        mock.del_item(&ep, &uuid).await.unwrap();
        assert!(mock.rows(&ep).is_empty());
        // already gone
        mock.del_item(&ep, &uuid).await.unwrap();

        assert_eq!(mock.mutations().len(), 4);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let mock = MockOpnSenseClient::new("https://mock");
        mock.fail_reload(Subsystem::Haproxy, true);
        assert!(mock.reload(Subsystem::Haproxy).await.is_err());
        assert!(mock.reload(Subsystem::Unbound).await.is_ok());

        mock.fail_mutations_on(&Endpoint::DNSMASQ_HOST, true);
        let err = mock
            .add_item(&Endpoint::DNSMASQ_HOST, &row(json!({"host": "a", "domain": "b"})))
            .await
            .unwrap_err();
        assert!(matches!(err, OpnSenseError::Validation(_)));
        assert!(mock.rows(&Endpoint::DNSMASQ_HOST).is_empty());
    }
}
