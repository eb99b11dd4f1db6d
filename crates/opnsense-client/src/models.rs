//! OPNsense API data models
//!
//! Records are kept as loose JSON objects: every plugin ships its own schema
//! and the controller only ever compares and forwards fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single record as returned by `search_*` or sent to `add_*`/`set_*`.
pub type Row = Map<String, Value>;

/// Response of a `search_*` call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Matching records
    #[serde(default)]
    pub rows: Vec<Row>,
    /// Total number of records in the collection
    #[serde(default)]
    pub total: Option<u64>,
    /// Number of rows per page (`-1` when unbounded)
    #[serde(default, rename = "rowCount")]
    pub row_count: Option<i64>,
    /// Current page
    #[serde(default)]
    pub current: Option<u64>,
}

/// Request body of a `search_*` call asking for every row
#[derive(Debug, Clone, Serialize)]
pub struct SearchRequest {
    /// Page number
    pub current: u64,
    /// Rows per page, `-1` for all
    #[serde(rename = "rowCount")]
    pub row_count: i64,
    /// Free text filter
    #[serde(rename = "searchPhrase")]
    pub search_phrase: String,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self { current: 1, row_count: -1, search_phrase: String::new() }
    }
}

/// Response of an `add_*`, `set_*` or `del_*` call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutationResponse {
    /// `saved`, `deleted`, `failed` or `not found`
    #[serde(default)]
    pub result: String,
    /// Identifier of a newly created record
    #[serde(default)]
    pub uuid: Option<String>,
    /// Field validation messages, keyed by `<wrapper>.<field>`
    #[serde(default)]
    pub validations: Option<Map<String, Value>>,
}

impl MutationResponse {
    /// Whether the appliance refused the request.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.result.eq_ignore_ascii_case("failed")
    }

    /// Whether the record targeted by the request does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.result.eq_ignore_ascii_case("not found")
    }

    /// Human readable summary of the validation messages.
    #[must_use]
    pub fn validation_summary(&self) -> String {
        match &self.validations {
            Some(validations) if !validations.is_empty() => validations
                .iter()
                .map(|(field, message)| match message {
                    Value::String(s) => format!("{field}: {s}"),
                    other => format!("{field}: {other}"),
                })
                .collect::<Vec<_>>()
                .join("; "),
            _ => format!("result={}", self.result),
        }
    }
}

/// Response of a `service/reload` call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceResponse {
    /// `ok` on success
    #[serde(default)]
    pub status: String,
}

impl ServiceResponse {
    /// Whether the service accepted the reload.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case("ok")
    }
}

/// Read a field of a row as a string.
///
/// Numbers and booleans are rendered the way the appliance stores them
/// (`"1"`/`"0"` for booleans). Option objects returned by `get_*` calls
/// (`{"key": {"value": .., "selected": 1}}`) are reduced to their selected keys.
#[must_use]
pub fn field_string(row: &Row, field: &str) -> Option<String> {
    match row.get(field)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => Some(n.to_string()),
        value @ Value::Object(_) => Some(selected_value(value)),
        Value::Array(items) => Some(
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(","),
        ),
    }
}

/// Reduce an option object to the comma-joined keys whose `selected` flag is set.
///
/// Any other value is rendered as a plain string.
#[must_use]
pub fn selected_value(value: &Value) -> String {
    match value {
        Value::Object(options) => options
            .iter()
            .filter(|(_, option)| is_selected(option))
            .map(|(key, _)| key.as_str())
            .collect::<Vec<_>>()
            .join(","),
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_selected(option: &Value) -> bool {
    match option.get("selected") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => s == "1",
        _ => false,
    }
}
