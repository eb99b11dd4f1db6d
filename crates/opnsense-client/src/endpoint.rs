//! Endpoint descriptions for the managed OPNsense collections.

use crate::models::{Row, field_string};
use std::fmt;

/// Appliance subsystem that owns a set of collections and can be reloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subsystem {
    /// `os-haproxy` plugin
    Haproxy,
    /// dnsmasq DNS forwarder
    Dnsmasq,
    /// Unbound DNS resolver
    Unbound,
    /// `os-openbgpd` plugin
    OpenBgpd,
    /// `os-frr` plugin
    Frr,
}

impl Subsystem {
    /// Module segment used in API paths.
    #[must_use]
    pub fn module(self) -> &'static str {
        match self {
            Self::Haproxy => "haproxy",
            Self::Dnsmasq => "dnsmasq",
            Self::Unbound => "unbound",
            Self::OpenBgpd => "openbgpd",
            Self::Frr => "frr",
        }
    }

    /// Path of the service reload endpoint.
    #[must_use]
    pub fn reload_path(self) -> String {
        format!("/api/{}/service/reload", self.module())
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.module())
    }
}

/// How the natural key of a row is derived.
///
/// The key is what the controller joins desired records on; it is never the
/// appliance-assigned `uuid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyField {
    /// A single field (`name`, `description`, ...)
    Field(&'static str),
    /// `<host>.<domain>` assembled from two fields, lowercased
    HostAndDomain {
        /// Field carrying the host label
        host: &'static str,
        /// Field carrying the domain
        domain: &'static str,
    },
}

impl KeyField {
    /// Extract the key from a row, if the row carries it.
    #[must_use]
    pub fn key_of(&self, row: &Row) -> Option<String> {
        match self {
            Self::Field(field) => field_string(row, field).filter(|k| !k.is_empty()),
            Self::HostAndDomain { host, domain } => {
                let host = field_string(row, host)?;
                let domain = field_string(row, domain)?;
                if host.is_empty() || domain.is_empty() {
                    return None;
                }
                Some(format!("{host}.{domain}").to_ascii_lowercase())
            }
        }
    }
}

/// A collection of records on the appliance following the uniform
/// `search_/get_/add_/set_/del_` pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Subsystem (and API module) owning the collection
    pub subsystem: Subsystem,
    /// API controller segment, usually `settings`
    pub controller: &'static str,
    /// Singular item name used by `get_`/`add_`/`set_`/`del_`
    pub item: &'static str,
    /// Search action name
    pub search: &'static str,
    /// Key wrapping the record in request and response bodies
    pub wrapper: &'static str,
    /// Natural key of a row
    pub key: KeyField,
}

impl Endpoint {
    /// HAProxy frontends (public services)
    pub const HAPROXY_FRONTEND: Self = Self {
        subsystem: Subsystem::Haproxy,
        controller: "settings",
        item: "frontend",
        search: "search_frontends",
        wrapper: "frontend",
        key: KeyField::Field("name"),
    };

    /// HAProxy backends (pools)
    pub const HAPROXY_BACKEND: Self = Self {
        subsystem: Subsystem::Haproxy,
        controller: "settings",
        item: "backend",
        search: "search_backends",
        wrapper: "backend",
        key: KeyField::Field("name"),
    };

    /// HAProxy servers, referenced by backends through `linkedServers`
    pub const HAPROXY_SERVER: Self = Self {
        subsystem: Subsystem::Haproxy,
        controller: "settings",
        item: "server",
        search: "search_servers",
        wrapper: "server",
        key: KeyField::Field("name"),
    };

    /// HAProxy ACLs (conditions)
    pub const HAPROXY_ACL: Self = Self {
        subsystem: Subsystem::Haproxy,
        controller: "settings",
        item: "acl",
        search: "search_acls",
        wrapper: "acl",
        key: KeyField::Field("name"),
    };

    /// HAProxy actions (rules)
    pub const HAPROXY_ACTION: Self = Self {
        subsystem: Subsystem::Haproxy,
        controller: "settings",
        item: "action",
        search: "search_actions",
        wrapper: "action",
        key: KeyField::Field("name"),
    };

    /// OpenBGPD neighbors, keyed by description
    pub const OPENBGPD_NEIGHBOR: Self = Self {
        subsystem: Subsystem::OpenBgpd,
        controller: "settings",
        item: "neighbor",
        search: "search_neighbor",
        wrapper: "neighbor",
        key: KeyField::Field("description"),
    };

    /// FRR BGP neighbors, keyed by description
    pub const FRR_NEIGHBOR: Self = Self {
        subsystem: Subsystem::Frr,
        controller: "settings",
        item: "bgp_neighbor",
        search: "search_bgp_neighbor",
        wrapper: "neighbor",
        key: KeyField::Field("description"),
    };

    /// dnsmasq host overrides
    pub const DNSMASQ_HOST: Self = Self {
        subsystem: Subsystem::Dnsmasq,
        controller: "settings",
        item: "host",
        search: "search_host",
        wrapper: "host",
        key: KeyField::HostAndDomain { host: "host", domain: "domain" },
    };

    /// Unbound host overrides
    pub const UNBOUND_HOST_OVERRIDE: Self = Self {
        subsystem: Subsystem::Unbound,
        controller: "settings",
        item: "host_override",
        search: "search_host_override",
        wrapper: "host",
        key: KeyField::HostAndDomain { host: "hostname", domain: "domain" },
    };

    fn base(&self) -> String {
        format!("/api/{}/{}", self.subsystem.module(), self.controller)
    }

    /// `search_<items>` path
    #[must_use]
    pub fn search_path(&self) -> String {
        format!("{}/{}", self.base(), self.search)
    }

    /// `get_<item>/<uuid>` path
    #[must_use]
    pub fn get_path(&self, uuid: &str) -> String {
        format!("{}/get_{}/{}", self.base(), self.item, uuid)
    }

    /// `add_<item>` path
    #[must_use]
    pub fn add_path(&self) -> String {
        format!("{}/add_{}", self.base(), self.item)
    }

    /// `set_<item>/<uuid>` path
    #[must_use]
    pub fn set_path(&self, uuid: &str) -> String {
        format!("{}/set_{}/{}", self.base(), self.item, uuid)
    }

    /// `del_<item>/<uuid>` path
    #[must_use]
    pub fn del_path(&self, uuid: &str) -> String {
        format!("{}/del_{}/{}", self.base(), self.item, uuid)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.subsystem, self.item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    #[test]
    fn test_paths_follow_uniform_pattern() {
        let ep = Endpoint::HAPROXY_FRONTEND;
        assert_eq!(ep.search_path(), "/api/haproxy/settings/search_frontends");
        assert_eq!(ep.get_path("abc"), "/api/haproxy/settings/get_frontend/abc");
        assert_eq!(ep.add_path(), "/api/haproxy/settings/add_frontend");
        assert_eq!(ep.set_path("abc"), "/api/haproxy/settings/set_frontend/abc");
        assert_eq!(ep.del_path("abc"), "/api/haproxy/settings/del_frontend/abc");

        let server = Endpoint::HAPROXY_SERVER;
        assert_eq!(server.search_path(), "/api/haproxy/settings/search_servers");
        assert_eq!(server.del_path("abc"), "/api/haproxy/settings/del_server/abc");

        let frr = Endpoint::FRR_NEIGHBOR;
        assert_eq!(frr.search_path(), "/api/frr/settings/search_bgp_neighbor");
        assert_eq!(frr.add_path(), "/api/frr/settings/add_bgp_neighbor");

        assert_eq!(Subsystem::OpenBgpd.reload_path(), "/api/openbgpd/service/reload");
    }

    #[test]
    fn test_key_of_field() {
        let key = KeyField::Field("description");
        assert_eq!(
            key.key_of(&row(json!({"uuid": "1", "description": "kpc-10.0.0.1"}))),
            Some("kpc-10.0.0.1".to_string())
        );
        assert_eq!(key.key_of(&row(json!({"uuid": "1", "description": ""}))), None);
        assert_eq!(key.key_of(&row(json!({"uuid": "1"}))), None);
    }

    #[test]
    fn test_key_of_host_and_domain() {
        let key = Endpoint::UNBOUND_HOST_OVERRIDE.key;
        assert_eq!(
            key.key_of(&row(json!({"hostname": "www", "domain": "example.com"}))),
            Some("www.example.com".to_string())
        );
        assert_eq!(key.key_of(&row(json!({"hostname": "www"}))), None);
        assert_eq!(
            key.key_of(&row(json!({"hostname": "WWW", "domain": "Example.COM"}))),
            Some("www.example.com".to_string())
        );
    }
}
