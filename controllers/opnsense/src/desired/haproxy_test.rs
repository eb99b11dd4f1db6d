//! Unit tests for the Ingress to HAProxy builder

#[cfg(test)]
mod tests {
    use crate::desired::haproxy::*;
    use crate::desired::{Collection, DesiredStateBuilder, Inventory, SharedFrontend, Snapshot};
    use crate::settings::HaproxyIngressProxyConfig;
    use crate::test_utils::*;
    use opnsense_client::{Endpoint, MockOpnSenseClient};
    use regex::Regex;
    use serde_json::json;

    fn config() -> HaproxyIngressProxyConfig {
        HaproxyIngressProxyConfig {
            enabled: true,
            default_frontend: Some("http-80".to_string()),
            default_backend: Some("traefik".to_string()),
            ..HaproxyIngressProxyConfig::default()
        }
    }

    fn inventory() -> Inventory {
        let mut inventory = Inventory::default();
        inventory.frontends.insert(
            "http-80".to_string(),
            SharedFrontend {
                uuid: "fe-http".to_string(),
                mode: "http".to_string(),
                bind: "0.0.0.0:80".to_string(),
                ssl_enabled: "0".to_string(),
                ssl_certificates: String::new(),
            },
        );
        inventory.frontends.insert(
            "https-443".to_string(),
            SharedFrontend {
                uuid: "fe-https".to_string(),
                mode: "ssl".to_string(),
                bind: "0.0.0.0:443".to_string(),
                ssl_enabled: "1".to_string(),
                ssl_certificates: "cert-1".to_string(),
            },
        );
        inventory.frontends.insert(
            "tcp-22".to_string(),
            SharedFrontend { uuid: "fe-tcp".to_string(), mode: "tcp".to_string(), ..SharedFrontend::default() },
        );
        inventory.backends.insert("traefik".to_string(), "be-traefik".to_string());
        inventory
    }

    fn snapshot(ingresses: Vec<std::sync::Arc<k8s_openapi::api::networking::v1::Ingress>>) -> Snapshot {
        Snapshot::new(ingresses, Vec::new(), Vec::new())
    }

    #[test]
    fn test_wildcard_host_acl() {
        let builder = HaproxyBuilder::new("kpc", config()).unwrap();
        let snap = snapshot(vec![ingress("default", "web", &[], json!([host_rule("*.example.com", "/api")]))]);

        let state = builder.build(&snap, &inventory());
        let acl = state.get(Collection::HAPROXY_ACL.id, "http-80-default-web-kpc-rule-0-path-0").unwrap();

        assert_eq!(acl.body["expression"], "hdr_reg");
        assert_eq!(acl.body["path_beg"], "/api");

        let value = acl.body["value"].as_str().unwrap();
        let re = Regex::new(value).unwrap();
        assert!(re.is_match("foo.example.com"));
        assert!(re.is_match("foo-bar.example.com:8443"));
        assert!(!re.is_match("example.com"));
        assert!(!re.is_match("a.b.example.com"));
        assert!(!re.is_match("fooexample.com"));
    }

    #[test]
    fn test_plain_host_exact_path() {
        let builder = HaproxyBuilder::new("kpc", config()).unwrap();
        let rules = json!([{
            "host": "www.example.com",
            "http": { "paths": [
                { "path": "/login", "pathType": "Exact",
                  "backend": { "service": { "name": "web", "port": { "number": 80 } } } },
                { "pathType": "ImplementationSpecific",
                  "backend": { "service": { "name": "web", "port": { "number": 80 } } } }
            ]}
        }]);
        let snap = snapshot(vec![ingress("default", "web", &[], rules)]);
        let state = builder.build(&snap, &inventory());

        let exact = state.get(Collection::HAPROXY_ACL.id, "http-80-default-web-kpc-rule-0-path-0").unwrap();
        assert_eq!(exact.body["expression"], "hdr");
        assert_eq!(exact.body["value"], "www.example.com");
        assert_eq!(exact.body["path_end"], "/login");
        assert!(exact.body.get("path_beg").is_none());

        let implicit = state.get(Collection::HAPROXY_ACL.id, "http-80-default-web-kpc-rule-0-path-1").unwrap();
        assert_eq!(implicit.body["path_beg"], "/");
    }

    #[test]
    fn test_hostless_rule_is_path_only() {
        let builder = HaproxyBuilder::new("kpc", config()).unwrap();
        let rules = json!([{
            "http": { "paths": [{ "path": "/static", "pathType": "Prefix",
                "backend": { "service": { "name": "web", "port": { "number": 80 } } } }] }
        }]);
        let state = builder.build(&snapshot(vec![ingress("default", "web", &[], rules)]), &inventory());

        let acl = state.get(Collection::HAPROXY_ACL.id, "http-80-default-web-kpc-rule-0-path-0").unwrap();
        assert_eq!(acl.body["expression"], "path_beg");
        assert_eq!(acl.body["path_beg"], "/static");
        assert!(acl.body.get("value").is_none());
    }

    #[test]
    fn test_frontend_action_records_and_links() {
        let builder = HaproxyBuilder::new("kpc", config()).unwrap();
        let rules = json!([host_rule("a.example.com", "/"), host_rule("b.example.com", "/")]);
        let state = builder.build(&snapshot(vec![ingress("shop", "store", &[], rules)]), &inventory());

        let frontend = state.get(Collection::HAPROXY_FRONTEND.id, "http-80-shop-store-kpc").unwrap();
        assert_eq!(frontend.body["enabled"], "1");
        assert_eq!(frontend.body["bind"], "0.0.0.0:80");
        assert_eq!(frontend.body["mode"], "http");
        assert_eq!(frontend.body["defaultBackend"], "be-traefik");
        assert_eq!(frontend.body["description"], MANAGED_DESCRIPTION);
        assert_eq!(frontend.source.namespace.as_deref(), Some("shop"));
        assert_eq!(frontend.links.len(), 1);
        assert_eq!(frontend.links[0].field, "linkedActions");
        assert_eq!(
            frontend.links[0].names,
            vec!["http-80-shop-store-kpc-action-0-0", "http-80-shop-store-kpc-action-1-0"]
        );

        let action = state.get(Collection::HAPROXY_ACTION.id, "http-80-shop-store-kpc-action-1-0").unwrap();
        assert_eq!(action.body["type"], "use_backend");
        assert_eq!(action.body["use_backend"], "be-traefik");
        assert_eq!(action.links[0].target, Collection::HAPROXY_ACL.id);
        assert_eq!(action.links[0].names, vec!["http-80-shop-store-kpc-rule-1-path-0"]);

        assert_eq!(state.len(), 5);
    }

    #[test]
    fn test_enabled_annotation_overrides_default() {
        let builder = HaproxyBuilder::new("kpc", config()).unwrap();
        let snap = snapshot(vec![
            ingress("default", "off", &[(ENABLED_ANNOTATION, "0")], json!([host_rule("off.example.com", "/")])),
            ingress("default", "on", &[], json!([host_rule("on.example.com", "/")])),
        ]);
        let state = builder.build(&snap, &inventory());

        assert!(state.get(Collection::HAPROXY_FRONTEND.id, "http-80-default-off-kpc").is_none());
        assert!(state.get(Collection::HAPROXY_FRONTEND.id, "http-80-default-on-kpc").is_some());
    }

    #[test]
    fn test_missing_backend_excludes_only_that_ingress() {
        let mut cfg = config();
        cfg.default_backend = None;
        let builder = HaproxyBuilder::new("kpc", cfg).unwrap();
        let snap = snapshot(vec![
            ingress("default", "a", &[], json!([host_rule("a.example.com", "/")])),
            ingress("default", "b", &[(BACKEND_ANNOTATION, "traefik")], json!([host_rule("b.example.com", "/")])),
            ingress("default", "c", &[(BACKEND_ANNOTATION, "missing")], json!([host_rule("c.example.com", "/")])),
        ]);
        let state = builder.build(&snap, &inventory());

        assert!(state.get(Collection::HAPROXY_FRONTEND.id, "http-80-default-a-kpc").is_none());
        assert!(state.get(Collection::HAPROXY_FRONTEND.id, "http-80-default-b-kpc").is_some());
        assert!(state.get(Collection::HAPROXY_FRONTEND.id, "http-80-default-c-kpc").is_none());
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn test_frontend_annotation_list_and_unsupported_mode() {
        let builder = HaproxyBuilder::new("kpc", config()).unwrap();
        let snap = snapshot(vec![ingress(
            "default",
            "web",
            &[(FRONTEND_ANNOTATION, "https-443, tcp-22, nope")],
            json!([host_rule("www.example.com", "/")]),
        )]);
        let state = builder.build(&snap, &inventory());

        let https = state.get(Collection::HAPROXY_FRONTEND.id, "https-443-default-web-kpc").unwrap();
        assert_eq!(https.body["ssl_enabled"], "1");
        assert_eq!(https.body["ssl_certificates"], "cert-1");
        assert!(state.get(Collection::HAPROXY_FRONTEND.id, "tcp-22-default-web-kpc").is_none());
        assert!(state.get(Collection::HAPROXY_FRONTEND.id, "nope-default-web-kpc").is_none());
        assert!(state.get(Collection::HAPROXY_FRONTEND.id, "http-80-default-web-kpc").is_none());
    }

    #[test]
    fn test_allowed_host_regex_filters_rules() {
        let mut cfg = config();
        cfg.allowed_host_regex = Some("/\\.example\\.com$/i".to_string());
        let builder = HaproxyBuilder::new("kpc", cfg).unwrap();
        let snap = snapshot(vec![
            ingress("default", "mixed", &[], json!([host_rule("evil.test", "/"), host_rule("OK.EXAMPLE.COM", "/")])),
            ingress("default", "denied", &[], json!([host_rule("evil.test", "/")])),
        ]);
        let state = builder.build(&snap, &inventory());

        let acls = state.collection(Collection::HAPROXY_ACL.id).unwrap();
        assert_eq!(acls.len(), 1);
        assert!(acls.contains_key("http-80-default-mixed-kpc-rule-1-path-0"));
        // a frontend needs at least one action
        assert!(state.get(Collection::HAPROXY_FRONTEND.id, "http-80-default-denied-kpc").is_none());
    }

    #[test]
    fn test_allowed_host_regex_rejects_hostless_rules() {
        let mut cfg = config();
        cfg.allowed_host_regex = Some("/\\.example\\.com$/".to_string());
        let builder = HaproxyBuilder::new("kpc", cfg).unwrap();
        let rules = json!([{
            "http": { "paths": [{ "path": "/", "pathType": "Prefix",
                "backend": { "service": { "name": "web", "port": { "number": 80 } } } }] }
        }]);
        let state = builder.build(&snapshot(vec![ingress("default", "catchall", &[], rules)]), &inventory());

        assert!(state.is_empty());
    }

    #[test]
    fn test_star_without_dot_is_literal_host() {
        assert_eq!(host_match("*foo.com"), ("hdr", "*foo.com".to_string()));
        assert_eq!(host_match("foo.com"), ("hdr", "foo.com".to_string()));

        let (expression, value) = host_match("*.foo.com");
        assert_eq!(expression, "hdr_reg");
        assert_eq!(value, "^[^\\.]+\\.foo\\.com(:[0-9]+)?$");
    }

    #[test]
    fn test_frontend_template_merged() {
        let builder = HaproxyBuilder::new("kpc", config()).unwrap();
        let template = r#"{"http2Enabled": "1", "description": "custom", "name": "ignored"}"#;
        let snap = snapshot(vec![ingress(
            "default",
            "web",
            &[(FRONTEND_TEMPLATE_ANNOTATION, template)],
            json!([host_rule("www.example.com", "/")]),
        )]);
        let state = builder.build(&snap, &inventory());

        let frontend = state.get(Collection::HAPROXY_FRONTEND.id, "http-80-default-web-kpc").unwrap();
        assert_eq!(frontend.body["http2Enabled"], "1");
        assert_eq!(frontend.body["description"], "custom");
        assert_eq!(frontend.body["name"], "http-80-default-web-kpc");
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = HaproxyBuilder::new("kpc", config()).unwrap();
        let a = ingress("b", "two", &[], json!([host_rule("two.example.com", "/")]));
        let b = ingress("a", "one", &[], json!([host_rule("one.example.com", "/")]));
        let first = builder.build(&snapshot(vec![a.clone(), b.clone()]), &inventory());
        let second = builder.build(&snapshot(vec![b, a]), &inventory());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_inventory_reads_shared_frontends_and_backends() {
        let mock = MockOpnSenseClient::new("https://mock");
        mock.seed(&Endpoint::HAPROXY_BACKEND, row(json!({"name": "traefik"})));
        mock.seed(
            &Endpoint::HAPROXY_FRONTEND,
            row(json!({"name": "http-80", "mode": "http", "bind": "0.0.0.0:80", "ssl_enabled": "0"})),
        );
        mock.seed(&Endpoint::HAPROXY_FRONTEND, row(json!({"name": "unrelated", "mode": "tcp"})));

        let builder = HaproxyBuilder::new("kpc", config()).unwrap();
        let snap = snapshot(vec![ingress("default", "web", &[], json!([host_rule("www.example.com", "/")]))]);
        let inventory = builder.inventory(&snap, &mock).await.unwrap();

        assert!(inventory.backends.contains_key("traefik"));
        assert_eq!(inventory.frontends.len(), 1);
        assert_eq!(inventory.frontends["http-80"].bind, "0.0.0.0:80");

        let state = builder.build(&snap, &inventory);
        assert!(state.get(Collection::HAPROXY_FRONTEND.id, "http-80-default-web-kpc").is_some());
    }

    #[tokio::test]
    async fn test_inventory_skipped_without_enabled_ingresses() {
        let mock = MockOpnSenseClient::new("https://mock");
        let builder = HaproxyBuilder::new("kpc", config()).unwrap();
        let snap = snapshot(vec![ingress("default", "off", &[(ENABLED_ANNOTATION, "false")], json!([]))]);

        builder.inventory(&snap, &mock).await.unwrap();
        assert!(mock.calls().is_empty());
    }
}
