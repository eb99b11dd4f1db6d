//! The diff of one collection.
//!
//! Presence on the appliance decides create vs update; the ownership store
//! decides what may be deleted. A record that exists remotely but is not
//! owned is adopted through an update.

use crate::remote::RemoteRecord;
use opnsense_client::{Row, field_string};
use std::collections::{BTreeMap, BTreeSet};

/// Operations for one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Names to create
    pub creates: Vec<String>,
    /// `(name, id)` of remote records that drifted from the desired body
    pub updates: Vec<(String, String)>,
    /// `(name, id)` of owned records no longer desired
    pub deletes: Vec<(String, String)>,
    /// Owned names no longer desired and already gone from the appliance
    pub dropped: Vec<String>,
    /// Desired names already matching the appliance
    pub unchanged: Vec<String>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Diff desired bodies against the appliance and the previous ownership.
pub fn plan(
    desired: &BTreeMap<String, Row>,
    remote: &BTreeMap<String, RemoteRecord>,
    previously_owned: &BTreeSet<String>,
) -> Plan {
    let mut plan = Plan::default();

    for (name, body) in desired {
        match remote.get(name) {
            Some(existing) if drifted(body, &existing.body) => plan.updates.push((name.clone(), existing.id.clone())),
            Some(_) => plan.unchanged.push(name.clone()),
            None => plan.creates.push(name.clone()),
        }
    }

    for name in previously_owned.iter().filter(|name| !desired.contains_key(*name)) {
        match remote.get(name) {
            Some(existing) => plan.deletes.push((name.clone(), existing.id.clone())),
            None => plan.dropped.push(name.clone()),
        }
    }

    plan
}

/// Whether any desired field differs from the remote record.
///
/// Both sides are compared in the appliance's string form. Fields the
/// appliance does not report count as drift.
pub fn drifted(desired: &Row, remote: &Row) -> bool {
    desired.keys().any(|field| {
        let wanted = field_string(desired, field).unwrap_or_default();
        match field_string(remote, field) {
            Some(actual) => !same_value(&wanted, &actual),
            None => !wanted.is_empty(),
        }
    })
}

/// List fields come back in appliance order; compare them as sets.
fn same_value(wanted: &str, actual: &str) -> bool {
    if wanted == actual {
        return true;
    }
    if !wanted.contains(',') && !actual.contains(',') {
        return false;
    }
    fn split(s: &str) -> BTreeSet<&str> {
        s.split(',').map(str::trim).filter(|v| !v.is_empty()).collect()
    }
    split(wanted) == split(actual)
}
