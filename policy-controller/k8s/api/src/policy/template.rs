use kube::api::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer held on every live template until the documents it owns have
/// been deleted.
pub const FINALIZER: &str = "netplate.io/finalizer";

/// Namespace annotation listing, comma-separated, the templates a namespace
/// opts into.
pub const OPT_IN_ANNOTATION: &str = "netplate.io/network-policy-templates";

/// Describes a network policy to be generated in each namespace that opts
/// into it.
#[derive(Clone, Debug, Default, kube::CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "netplate.io",
    version = "v1beta1",
    kind = "NetworkPolicyTemplate",
    status = "TemplateStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status"}"#,
    printcolumn = r#"{"name":"ClusterWide","type":"boolean","jsonPath":".spec.clusterWide"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyTemplateSpec {
    /// Generates a `CiliumClusterwideNetworkPolicy` per namespace instead of
    /// a namespaced `CiliumNetworkPolicy`.
    #[serde(default)]
    pub cluster_wide: bool,

    /// The policy body, rendered against each namespace's metadata.
    pub policy_template: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TemplateStatus {
    Ok,
    Invalid,
}

impl NetworkPolicyTemplate {
    /// Indicates whether the template has been marked for deletion.
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .iter()
            .flatten()
            .any(|f| f == FINALIZER)
    }
}

/// Returns the template names a namespace opts into.
pub fn opted_in(meta: &ObjectMeta) -> impl Iterator<Item = &str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(OPT_IN_ANNOTATION))
        .into_iter()
        .flat_map(|names| names.split(','))
}

/// Indicates whether a namespace opts into the named template. Names are
/// matched exactly.
pub fn is_opted_in(meta: &ObjectMeta, template: &str) -> bool {
    opted_in(meta).any(|name| name == template)
}
