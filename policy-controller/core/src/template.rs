//! Compiles policy templates into policy documents.
//!
//! A template is rendered against the metadata of a single namespace, the
//! output is decoded as YAML (which accepts JSON as well), and the decoded
//! document must declare the expected `apiVersion` and `kind`. Compilation
//! is pure; callers decide what to do with failures.

use crate::document;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

/// The values a template is rendered against.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NamespaceMeta {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// An `apiVersion`/`kind` pair.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeRef {
    pub api_version: String,
    pub kind: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to parse template: {0}")]
    Parse(#[source] minijinja::Error),

    #[error("failed to execute template: {0}")]
    Execute(#[source] minijinja::Error),

    #[error("failed to decode rendered template: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("invalid schema: expected {expected}, found {found}")]
    SchemaMismatch { expected: TypeRef, found: TypeRef },
}

// === impl TypeRef ===

impl TypeRef {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    fn of(doc: &Value) -> Self {
        let get = |key: &str| {
            doc.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            api_version: get("apiVersion"),
            kind: get("kind"),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version, self.kind)
    }
}

/// Renders `text` against `ns` and decodes the result into a document of the
/// `expected` type.
///
/// The returned document always has an object-valued `metadata` field.
pub fn compile(text: &str, ns: &NamespaceMeta, expected: &TypeRef) -> Result<Value, Error> {
    let rendered = render(text, ns)?;

    let mut doc: Value =
        serde_yaml::from_str(&rendered).map_err(|error| Error::Decode(Box::new(error)))?;

    let found = TypeRef::of(&doc);
    if found != *expected {
        return Err(Error::SchemaMismatch {
            expected: expected.clone(),
            found,
        });
    }

    // A document with a matching type is necessarily an object.
    if let Value::Object(map) = &mut doc {
        match map.get("metadata").filter(|m| !m.is_null()) {
            Some(metadata) => {
                document::as_map(metadata, "metadata")
                    .map_err(|error| Error::Decode(Box::new(error)))?;
            }
            None => {
                map.insert("metadata".to_string(), Value::Object(Map::new()));
            }
        }
    }

    Ok(doc)
}

fn render(text: &str, ns: &NamespaceMeta) -> Result<String, Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    let template = env.template_from_str(text).map_err(Error::Parse)?;
    template.render(ns).map_err(Error::Execute)
}
