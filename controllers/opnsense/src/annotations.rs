//! Per-resource overrides read from object annotations.
//!
//! Precedence is always: explicit annotation, then plugin config default,
//! then the hard-coded fallback passed by the caller.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

fn raw<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations.as_ref()?.get(key).map(String::as_str)
}

/// Parse a boolean annotation value. Only `true` and `1` (any case) are true.
pub fn parse_bool(value: &str) -> bool {
    let value = value.trim();
    value.eq_ignore_ascii_case("true") || value == "1"
}

/// Resolve an enable flag.
pub fn enabled(meta: &ObjectMeta, key: &str, config_default: Option<bool>, fallback: bool) -> bool {
    match raw(meta, key) {
        Some(value) => parse_bool(value),
        None => config_default.unwrap_or(fallback),
    }
}

/// Resolve a single string value. Blank annotations count as absent.
pub fn string(meta: &ObjectMeta, key: &str, config_default: Option<&str>) -> Option<String> {
    raw(meta, key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| config_default.map(str::trim).filter(|v| !v.is_empty()))
        .map(str::to_string)
}

/// Resolve a comma-separated list, trimmed, empty items dropped.
pub fn list(meta: &ObjectMeta, key: &str, config_default: Option<&str>) -> Vec<String> {
    string(meta, key, config_default)
        .map(|value| split_list(&value))
        .unwrap_or_default()
}

pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn meta(annotations: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("default".to_string()),
            annotations: Some(
                annotations.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect::<BTreeMap<_, _>>(),
            ),
            ..ObjectMeta::default()
        }
    }

    #[test]
    fn test_enabled_annotation_wins_over_default() {
        let m = meta(&[("x/enabled", "0")]);
        assert!(!enabled(&m, "x/enabled", Some(true), true));

        let m = meta(&[("x/enabled", "TRUE")]);
        assert!(enabled(&m, "x/enabled", Some(false), false));

        let m = meta(&[("x/enabled", "yes")]);
        assert!(!enabled(&m, "x/enabled", Some(true), true));
    }

    #[test]
    fn test_enabled_falls_back() {
        let m = meta(&[]);
        assert!(!enabled(&m, "x/enabled", Some(false), true));
        assert!(enabled(&m, "x/enabled", None, true));
        assert!(!enabled(&ObjectMeta::default(), "x/enabled", None, false));
    }

    #[test]
    fn test_string_and_list() {
        let m = meta(&[("x/frontend", " http-80 , ,https-443 "), ("x/backend", "  ")]);
        assert_eq!(list(&m, "x/frontend", Some("ignored")), vec!["http-80", "https-443"]);
        assert_eq!(string(&m, "x/backend", Some("traefik")).as_deref(), Some("traefik"));
        assert_eq!(string(&m, "x/missing", None), None);
        assert!(list(&m, "x/missing", None).is_empty());
    }
}
