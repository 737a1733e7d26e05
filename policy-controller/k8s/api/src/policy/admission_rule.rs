use crate::labels::{Labels, Selector};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Forbids network policies from requesting certain address ranges or
/// entities, except in the namespaces its selector matches.
#[derive(Clone, Debug, Default, kube::CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "netplate.io",
    version = "v1beta1",
    kind = "NetworkPolicyAdmissionRule"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyAdmissionRuleSpec {
    /// Namespaces matching this selector are exempt from the rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<Selector>,

    #[serde(default, rename = "forbiddenIPRanges")]
    pub forbidden_ip_ranges: Vec<ForbiddenIpRange>,

    #[serde(default)]
    pub forbidden_entities: Vec<ForbiddenEntity>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ForbiddenIpRange {
    pub cidr: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub direction: Option<RuleDirection>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ForbiddenEntity {
    pub entity: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub direction: Option<RuleDirection>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Egress,
    Ingress,
    All,
}

// === impl NetworkPolicyAdmissionRuleSpec ===

impl NetworkPolicyAdmissionRuleSpec {
    /// Indicates whether a namespace with the given labels is exempt from this
    /// rule. An absent or empty selector exempts nothing.
    pub fn excludes(&self, labels: &Labels) -> bool {
        self.namespace_selector
            .as_ref()
            .map_or(false, |s| !s.is_empty() && s.matches(labels))
    }
}

// === impl RuleDirection ===

impl RuleDirection {
    pub fn includes_egress(&self) -> bool {
        matches!(self, Self::Egress | Self::All)
    }

    pub fn includes_ingress(&self) -> bool {
        matches!(self, Self::Ingress | Self::All)
    }
}
