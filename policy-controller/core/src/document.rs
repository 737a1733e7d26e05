//! A schema-agnostic view of policy documents.
//!
//! Policy bodies are held as a generic [`Value`] tree so that the same code
//! can inspect every schema variant of a policy kind. Object keys are kept in
//! a map keyed by name, so two trees compare equal regardless of the order in
//! which their fields were written.
//!
//! The accessors in this module never coerce: a node with an unexpected shape
//! yields a [`MalformedField`] naming the path that was being read.

use serde_json::{Map, Value};
use thiserror::Error;

/// The field holding a single rule-set.
pub const SPEC: &str = "spec";

/// The field holding a list of rule-sets.
pub const SPECS: &str = "specs";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MalformedField {
    #[error("{path}: expected {expected}, found {found}")]
    Shape {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid CIDR {value:?}: {source}")]
    Cidr {
        value: String,
        #[source]
        source: ipnet::AddrParseError,
    },
}

/// The controller-owned portion of a policy document.
///
/// Only `spec` and `specs` are compared and replaced when a generated
/// document is brought in line with its template; everything else on the
/// stored object (metadata, status) is left as the store has it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleContent {
    pub spec: Option<Value>,
    pub specs: Option<Value>,
}

// === impl MalformedField ===

impl MalformedField {
    fn shape(path: &str, expected: &'static str, found: &Value) -> Self {
        Self::Shape {
            path: path.to_string(),
            expected,
            found: type_name(found),
        }
    }
}

// === impl RuleContent ===

impl RuleContent {
    /// Reads the rule content from the top-level fields of a document.
    pub fn of(data: &Value) -> Self {
        let get = |key: &str| data.as_object().and_then(|m| field(m, key)).cloned();
        Self {
            spec: get(SPEC),
            specs: get(SPECS),
        }
    }

    /// Writes this rule content into a document, removing any rule field that
    /// is absent here. Other top-level fields are preserved.
    pub fn apply_to(self, data: &mut Value) {
        if !data.is_object() {
            *data = Value::Object(Map::new());
        }

        if let Value::Object(map) = data {
            for (key, value) in [(SPEC, self.spec), (SPECS, self.specs)] {
                match value {
                    Some(value) => {
                        map.insert(key.to_string(), value);
                    }
                    None => {
                        map.remove(key);
                    }
                }
            }
        }
    }
}

/// Returns the value of `key` in `map`, treating an explicit `null` the same
/// as an absent field.
pub fn field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key).filter(|v| !v.is_null())
}

pub fn as_map<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>, MalformedField> {
    value
        .as_object()
        .ok_or_else(|| MalformedField::shape(path, "object", value))
}

pub fn as_list<'a>(value: &'a Value, path: &str) -> Result<&'a [Value], MalformedField> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| MalformedField::shape(path, "array", value))
}

pub fn as_str<'a>(value: &'a Value, path: &str) -> Result<&'a str, MalformedField> {
    value
        .as_str()
        .ok_or_else(|| MalformedField::shape(path, "string", value))
}

/// Collects the rule-sets of a policy document: `spec` when it is set,
/// followed by each element of `specs`. A document may set both.
pub fn rule_sets(data: &Value) -> Result<Vec<&Map<String, Value>>, MalformedField> {
    let root = as_map(data, "")?;

    let mut sets = Vec::new();
    if let Some(spec) = field(root, SPEC) {
        sets.push(as_map(spec, SPEC)?);
    }
    if let Some(specs) = field(root, SPECS) {
        for (i, spec) in as_list(specs, SPECS)?.iter().enumerate() {
            sets.push(as_map(spec, &format!("{SPECS}[{i}]"))?);
        }
    }
    Ok(sets)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
