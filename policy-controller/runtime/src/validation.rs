use crate::{
    core::{
        network,
        rules::{self, Direction},
        ByDirection, IpNet, MalformedField, Value,
    },
    k8s::{
        generated,
        labels::Labels,
        policy::{NetworkPolicyAdmissionRule, NetworkPolicyAdmissionRuleSpec, RuleDirection},
        ObjectMeta, ResourceExt,
    },
};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    Allow,
    Deny(String),
}

/// Validation could not be performed.
#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("malformed policy: {0}")]
    Policy(#[source] MalformedField),

    #[error("malformed admission rule {rule}: {source}")]
    Rule {
        rule: String,
        #[source]
        source: MalformedField,
    },
}

/// The values forbidden by every admission rule that applies to a namespace.
#[derive(Debug, Default)]
struct Filters {
    cidrs: ByDirection<IpNet>,
    entities: ByDirection<String>,
}

// === impl Filters ===

impl Filters {
    /// Returns `None` when no rule applies to a namespace with the given labels.
    fn build(rules: &[NetworkPolicyAdmissionRule], labels: &Labels) -> Result<Option<Self>, Error> {
        let mut filters = None::<Self>;
        for rule in rules.iter().filter(|r| !r.spec.excludes(labels)) {
            let filters = filters.get_or_insert_with(Default::default);

            for range in rule.spec.forbidden_ip_ranges.iter() {
                let cidr = network::parse_cidr(&range.cidr).map_err(|source| Error::Rule {
                    rule: rule.name_any(),
                    source,
                })?;
                if let Some(direction) = range.direction {
                    filters.cidrs.push(direction, cidr);
                }
            }

            for entity in rule.spec.forbidden_entities.iter() {
                if let Some(direction) = entity.direction {
                    filters.entities.push(direction, entity.entity.clone());
                }
            }
        }
        Ok(filters)
    }
}

trait PushDirection<T> {
    fn push(&mut self, direction: RuleDirection, value: T);
}

impl<T: Clone> PushDirection<T> for ByDirection<T> {
    fn push(&mut self, direction: RuleDirection, value: T) {
        if direction.includes_egress() {
            self.egress.push(value.clone());
        }
        if direction.includes_ingress() {
            self.ingress.push(value);
        }
    }
}

/// Checks a policy document against the admission rules that apply to the
/// namespace it is written to.
///
/// Cluster-wide policies have no namespace and are checked with an empty
/// label set.
pub(crate) fn validate_policy(
    data: &Value,
    rules: &[NetworkPolicyAdmissionRule],
    labels: &Labels,
) -> Result<Verdict, Error> {
    let Some(filters) = Filters::build(rules, labels)? else {
        return Ok(Verdict::Allow);
    };

    let cidrs = rules::gather_cidrs(data).map_err(Error::Policy)?;
    let entities = rules::gather_entities(data).map_err(Error::Policy)?;

    for direction in [Direction::Egress, Direction::Ingress] {
        let forbidden = filters.cidrs.get(direction);
        if cidrs
            .get(direction)
            .iter()
            .any(|net| forbidden.iter().any(|f| network::intersects(net, f)))
        {
            return Ok(Verdict::Deny(format!(
                "an {direction} policy is requesting a forbidden IP range"
            )));
        }
    }

    for direction in [Direction::Egress, Direction::Ingress] {
        let forbidden = filters.entities.get(direction);
        if entities
            .get(direction)
            .iter()
            .any(|entity| forbidden.contains(entity))
        {
            return Ok(Verdict::Deny(format!(
                "an {direction} policy is requesting a forbidden entity"
            )));
        }
    }

    Ok(Verdict::Allow)
}

/// Only the controller may delete a policy generated from a template. Other
/// policies may be deleted by anyone.
pub(crate) fn validate_delete(meta: &ObjectMeta, username: &str, controller: &str) -> Verdict {
    match generated::template_owner(meta) {
        Some(_) if username != controller => Verdict::Deny("user deletion is not allowed".into()),
        _ => Verdict::Allow,
    }
}

pub(crate) fn validate_admission_rule(spec: &NetworkPolicyAdmissionRuleSpec) -> Verdict {
    for range in spec.forbidden_ip_ranges.iter() {
        if network::parse_cidr(&range.cidr).is_err() {
            return Verdict::Deny("a malformed CIDR string was provided".into());
        }
        if range.direction.is_none() {
            return Verdict::Deny("a connection type must be provided".into());
        }
    }

    if spec.forbidden_entities.iter().any(|e| e.direction.is_none()) {
        return Verdict::Deny("a connection type must be provided".into());
    }

    Verdict::Allow
}
