//! Extraction of requested address ranges and entities from policy documents.
//!
//! Field names are never hard-coded in the walking logic. Each traffic
//! direction has a [`RuleType`] that maps a [`ValueKind`] to the field holding
//! values of that kind, so supporting another schema shape only requires a
//! new table entry.

use crate::{
    document::{self, MalformedField},
    network,
};
use ipnet::IpNet;
use serde_json::{Map, Value};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Egress,
    Ingress,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// A list of CIDR strings.
    Cidr,
    /// A list of objects carrying an optional `cidr` field.
    CidrSet,
    /// A list of entity names.
    Entity,
}

/// Lookup table entry for one traffic direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RuleType {
    pub direction: Direction,
    /// The rule-set field holding this direction's rules.
    pub field: &'static str,
    cidr: &'static str,
    cidr_set: &'static str,
    entity: &'static str,
}

pub const EGRESS: RuleType = RuleType {
    direction: Direction::Egress,
    field: "egress",
    cidr: "toCIDR",
    cidr_set: "toCIDRSet",
    entity: "toEntities",
};

pub const INGRESS: RuleType = RuleType {
    direction: Direction::Ingress,
    field: "ingress",
    cidr: "fromCIDR",
    cidr_set: "fromCIDRSet",
    entity: "fromEntities",
};

pub const RULE_TYPES: [RuleType; 2] = [EGRESS, INGRESS];

/// Values partitioned by traffic direction. Order is not meaningful and
/// duplicates are kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByDirection<T> {
    pub egress: Vec<T>,
    pub ingress: Vec<T>,
}

/// Pulls string values out of the value field of a single rule. `None` means
/// the field is absent.
pub type Extract = fn(Option<&Value>, &str) -> Result<Vec<String>, MalformedField>;

// === impl Direction ===

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Egress => "egress",
            Self::Ingress => "ingress",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl RuleType ===

impl RuleType {
    pub fn key(&self, kind: ValueKind) -> &'static str {
        match kind {
            ValueKind::Cidr => self.cidr,
            ValueKind::CidrSet => self.cidr_set,
            ValueKind::Entity => self.entity,
        }
    }
}

// === impl ByDirection ===

impl<T> Default for ByDirection<T> {
    fn default() -> Self {
        Self {
            egress: Vec::new(),
            ingress: Vec::new(),
        }
    }
}

impl<T> ByDirection<T> {
    pub fn get(&self, direction: Direction) -> &[T] {
        match direction {
            Direction::Egress => &self.egress,
            Direction::Ingress => &self.ingress,
        }
    }

    pub fn get_mut(&mut self, direction: Direction) -> &mut Vec<T> {
        match direction {
            Direction::Egress => &mut self.egress,
            Direction::Ingress => &mut self.ingress,
        }
    }

    pub fn append(&mut self, other: Self) {
        self.egress.extend(other.egress);
        self.ingress.extend(other.ingress);
    }

    pub fn try_map<U, E>(self, f: impl Fn(T) -> Result<U, E>) -> Result<ByDirection<U>, E> {
        Ok(ByDirection {
            egress: self.egress.into_iter().map(&f).collect::<Result<_, _>>()?,
            ingress: self.ingress.into_iter().map(&f).collect::<Result<_, _>>()?,
        })
    }
}

/// Walks every rule-set of a document and extracts the values of `kind` for
/// each direction.
pub fn gather(
    data: &Value,
    kind: ValueKind,
    extract: Extract,
) -> Result<ByDirection<String>, MalformedField> {
    let mut values = ByDirection::default();
    for set in document::rule_sets(data)? {
        for rule_type in RULE_TYPES.iter() {
            let found = gather_rule_type(set, rule_type, kind, extract)?;
            values.get_mut(rule_type.direction).extend(found);
        }
    }
    Ok(values)
}

fn gather_rule_type(
    set: &Map<String, Value>,
    rule_type: &RuleType,
    kind: ValueKind,
    extract: Extract,
) -> Result<Vec<String>, MalformedField> {
    let Some(rules) = document::field(set, rule_type.field) else {
        return Ok(Vec::new());
    };

    let key = rule_type.key(kind);
    let mut values = Vec::new();
    for (i, rule) in document::as_list(rules, rule_type.field)?.iter().enumerate() {
        let path = format!("{}[{}]", rule_type.field, i);
        let rule = document::as_map(rule, &path)?;
        values.extend(extract(rule.get(key), &format!("{path}.{key}"))?);
    }
    Ok(values)
}

/// Extracts a list of bare strings, skipping `null` entries.
pub fn strings(value: Option<&Value>, path: &str) -> Result<Vec<String>, MalformedField> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(Vec::new());
    };

    let mut values = Vec::new();
    for (i, item) in document::as_list(value, path)?.iter().enumerate() {
        if item.is_null() {
            continue;
        }
        let s = document::as_str(item, &format!("{path}[{i}]"))?;
        values.push(s.to_string());
    }
    Ok(values)
}

/// Extracts the `cidr` field of each object in a list, skipping objects that
/// do not set it.
pub fn cidr_sets(value: Option<&Value>, path: &str) -> Result<Vec<String>, MalformedField> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(Vec::new());
    };

    let mut values = Vec::new();
    for (i, item) in document::as_list(value, path)?.iter().enumerate() {
        let item_path = format!("{path}[{i}]");
        let set = document::as_map(item, &item_path)?;
        if let Some(cidr) = document::field(set, "cidr") {
            let s = document::as_str(cidr, &format!("{item_path}.cidr"))?;
            values.push(s.to_string());
        }
    }
    Ok(values)
}

/// Returns every address range a document requests, from both direct CIDR
/// lists and CIDR sets.
pub fn gather_cidrs(data: &Value) -> Result<ByDirection<IpNet>, MalformedField> {
    let mut cidrs = gather(data, ValueKind::Cidr, strings)?;
    cidrs.append(gather(data, ValueKind::CidrSet, cidr_sets)?);
    cidrs.try_map(|s| network::parse_cidr(&s))
}

pub fn gather_entities(data: &Value) -> Result<ByDirection<String>, MalformedField> {
    gather(data, ValueKind::Entity, strings)
}
