//! Cilium policy documents generated from templates.
//!
//! Generated documents are handled as [`DynamicObject`](kube::api::DynamicObject)s
//! so that every field of the policy schema survives a read-modify-write
//! cycle, including fields this controller does not know about.

use crate::policy::NetworkPolicyTemplate;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{ApiResource, GroupVersionKind, ObjectMeta},
    Resource,
};
use std::fmt;

pub const GROUP: &str = "cilium.io";
pub const VERSION: &str = "v2";
pub const API_VERSION: &str = "cilium.io/v2";

/// Label naming the template that generated a document. Used as an index to
/// find a template's documents without scanning the whole kind.
pub const TEMPLATE_LABEL: &str = "netplate.io/template";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GeneratedKind {
    /// `CiliumNetworkPolicy`, stored in the namespace it was generated for.
    Namespaced,
    /// `CiliumClusterwideNetworkPolicy`, named after the namespace it was
    /// generated for.
    ClusterWide,
}

/// Identifies a generated document. Cluster-wide documents have no namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyId {
    pub namespace: Option<String>,
    pub name: String,
}

// === impl GeneratedKind ===

impl GeneratedKind {
    pub const ALL: [Self; 2] = [Self::Namespaced, Self::ClusterWide];

    pub fn for_template(template: &NetworkPolicyTemplate) -> Self {
        if template.spec.cluster_wide {
            Self::ClusterWide
        } else {
            Self::Namespaced
        }
    }

    /// Matches an admission request's group and kind, ignoring case.
    pub fn from_group_kind(group: &str, kind: &str) -> Option<Self> {
        if !group.eq_ignore_ascii_case(GROUP) {
            return None;
        }
        Self::ALL
            .into_iter()
            .find(|k| kind.eq_ignore_ascii_case(k.kind()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Namespaced => "CiliumNetworkPolicy",
            Self::ClusterWide => "CiliumClusterwideNetworkPolicy",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            Self::Namespaced => "ciliumnetworkpolicies",
            Self::ClusterWide => "ciliumclusterwidenetworkpolicies",
        }
    }

    pub fn is_namespaced(&self) -> bool {
        matches!(self, Self::Namespaced)
    }

    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(GROUP, VERSION, self.kind());
        ApiResource::from_gvk_with_plural(&gvk, self.plural())
    }

    /// Returns the identity of the document generated from `template` for
    /// `namespace`.
    pub fn policy_id(&self, namespace: &str, template: &str) -> PolicyId {
        match self {
            Self::Namespaced => PolicyId {
                namespace: Some(namespace.to_string()),
                name: template.to_string(),
            },
            Self::ClusterWide => PolicyId {
                namespace: None,
                name: format!("{namespace}-{template}"),
            },
        }
    }
}

impl fmt::Display for GeneratedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

// === impl PolicyId ===

impl PolicyId {
    pub fn of(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

fn is_template_ref(owner: &OwnerReference) -> bool {
    owner.api_version == NetworkPolicyTemplate::api_version(&())
        && owner.kind == NetworkPolicyTemplate::kind(&())
}

/// Returns the name of the template that owns a document, if any.
pub fn template_owner(meta: &ObjectMeta) -> Option<&str> {
    meta.owner_references
        .iter()
        .flatten()
        .find(|o| is_template_ref(o))
        .map(|o| o.name.as_str())
}

/// Indicates whether a document is owned by the named template.
pub fn is_owned_by(meta: &ObjectMeta, template: &str) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|o| is_template_ref(o) && o.name == template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::NetworkPolicyTemplateSpec;
    use pretty_assertions::assert_eq;

    fn template(cluster_wide: bool) -> NetworkPolicyTemplate {
        let mut t = NetworkPolicyTemplate::new(
            "allow-dns",
            NetworkPolicyTemplateSpec {
                cluster_wide,
                policy_template: String::new(),
            },
        );
        t.metadata.uid = Some("uid-1".to_string());
        t
    }

    #[test]
    fn policy_ids() {
        assert_eq!(
            GeneratedKind::for_template(&template(false)).policy_id("tenant-a", "allow-dns"),
            PolicyId {
                namespace: Some("tenant-a".to_string()),
                name: "allow-dns".to_string(),
            }
        );
        assert_eq!(
            GeneratedKind::for_template(&template(true)).policy_id("tenant-a", "allow-dns"),
            PolicyId {
                namespace: None,
                name: "tenant-a-allow-dns".to_string(),
            }
        );
    }

    #[test]
    fn api_resources() {
        let ar = GeneratedKind::ClusterWide.api_resource();
        assert_eq!(ar.api_version, API_VERSION);
        assert_eq!(ar.kind, "CiliumClusterwideNetworkPolicy");
        assert_eq!(ar.plural, "ciliumclusterwidenetworkpolicies");
    }

    #[test]
    fn from_group_kind() {
        assert_eq!(
            GeneratedKind::from_group_kind("cilium.io", "ciliumnetworkpolicy"),
            Some(GeneratedKind::Namespaced)
        );
        assert_eq!(
            GeneratedKind::from_group_kind("cilium.io", "CiliumClusterwideNetworkPolicy"),
            Some(GeneratedKind::ClusterWide)
        );
        assert_eq!(
            GeneratedKind::from_group_kind("networking.k8s.io", "NetworkPolicy"),
            None
        );
    }

    #[test]
    fn ownership() {
        let owner = template(false).controller_owner_ref(&()).unwrap();
        assert_eq!(owner.api_version, "netplate.io/v1beta1");
        assert_eq!(owner.kind, "NetworkPolicyTemplate");

        let meta = ObjectMeta {
            owner_references: Some(vec![owner]),
            ..Default::default()
        };
        assert_eq!(template_owner(&meta), Some("allow-dns"));
        assert!(is_owned_by(&meta, "allow-dns"));
        assert!(!is_owned_by(&meta, "deny-host"));
        assert_eq!(template_owner(&ObjectMeta::default()), None);
    }

    #[test]
    fn foreign_owner_is_not_a_template() {
        let meta = ObjectMeta {
            owner_references: Some(vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: "allow-dns".to_string(),
                uid: "uid-2".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(!is_owned_by(&meta, "allow-dns"));
    }
}
