use crate::{
    metrics::{ControllerMetrics, PolicyOp},
    store::{Store, StoreError},
};
use netplate_policy_controller_core::{
    template::{self, NamespaceMeta, TypeRef},
    RuleContent,
};
use netplate_policy_controller_k8s_api::{
    generated::{self, API_VERSION, TEMPLATE_LABEL},
    policy::{template::is_opted_in, NetworkPolicyTemplate, TemplateStatus},
    DynamicObject, GeneratedKind, Namespace, OwnerReference, PolicyId, Resource, ResourceExt,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("template {0} has no uid")]
    MissingUid(String),
}

/// Brings the generated policies of a template in line with the namespaces
/// that opt into it.
pub struct Reconciler<S> {
    store: S,
    metrics: ControllerMetrics,
}

/// The outcome of reconciling a single namespace.
#[derive(Debug, Error)]
enum NamespaceError {
    #[error(transparent)]
    Compile(#[from] template::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// === impl Reconciler ===

impl<S: Store> Reconciler<S> {
    pub fn new(store: S, metrics: ControllerMetrics) -> Self {
        Self { store, metrics }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs a single reconciliation pass for the template.
    ///
    /// A template marked for deletion has its policies deleted and its
    /// finalizer released; otherwise each namespace is reconciled in turn and
    /// the template's status is updated to reflect whether it compiled
    /// everywhere.
    pub async fn reconcile(&self, template: &NetworkPolicyTemplate) -> Result<(), Error> {
        let res = if template.is_deleting() {
            self.finalize(template).await
        } else {
            self.apply(template).await
        };
        self.metrics.reconciled(res.is_ok());
        res
    }

    async fn finalize(&self, template: &NetworkPolicyTemplate) -> Result<(), Error> {
        let name = template.name_any();
        if !template.has_finalizer() {
            debug!(template = %name, "Template deleted without finalizer");
            return Ok(());
        }

        for kind in GeneratedKind::ALL {
            for policy in self.store.owned_policies(kind, &name).await? {
                if policy.metadata.deletion_timestamp.is_some() {
                    continue;
                }
                let id = PolicyId::of(&policy.metadata);
                self.store.delete_policy(kind, &id).await?;
                self.metrics.policy_written(kind, PolicyOp::Delete);
                info!(template = %name, %kind, policy = %id, "Deleted policy");
            }
        }

        self.store.remove_finalizer(template).await?;
        info!(template = %name, "Released template");
        Ok(())
    }

    async fn apply(&self, template: &NetworkPolicyTemplate) -> Result<(), Error> {
        let name = template.name_any();
        if !template.has_finalizer() {
            self.store.add_finalizer(template).await?;
            debug!(template = %name, "Added finalizer");
        }

        let owner = template
            .controller_owner_ref(&())
            .ok_or_else(|| Error::MissingUid(name.clone()))?;
        let kind = GeneratedKind::for_template(template);

        let mut status = TemplateStatus::Ok;
        let mut failure = None;
        for ns in self.store.namespaces().await? {
            match self.reconcile_namespace(template, kind, &owner, &ns).await {
                Ok(()) => {}
                Err(NamespaceError::Compile(error)) => {
                    warn!(template = %name, namespace = %ns.name_any(), %error, "Failed to compile template");
                    self.metrics.compile_failed();
                    status = TemplateStatus::Invalid;
                }
                Err(NamespaceError::Store(error)) => {
                    warn!(template = %name, namespace = %ns.name_any(), %error, "Failed to reconcile namespace");
                    failure.get_or_insert(error);
                }
            }
        }

        if let Err(error) = self.prune_stale_kinds(&name, kind).await {
            warn!(template = %name, %error, "Failed to delete policies of a previous kind");
            failure.get_or_insert(error);
        }

        if template.status != Some(status) {
            self.store.set_status(&name, status).await?;
            info!(template = %name, ?status, "Updated status");
        }

        match failure {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    /// Deletes the policies a template owns of any kind other than the one it
    /// currently generates, left behind when `clusterWide` changes.
    async fn prune_stale_kinds(&self, name: &str, current: GeneratedKind) -> Result<(), StoreError> {
        for kind in GeneratedKind::ALL.into_iter().filter(|k| *k != current) {
            for policy in self.store.owned_policies(kind, name).await? {
                if policy.metadata.deletion_timestamp.is_some() {
                    continue;
                }
                let id = PolicyId::of(&policy.metadata);
                self.store.delete_policy(kind, &id).await?;
                self.metrics.policy_written(kind, PolicyOp::Delete);
                info!(template = %name, %kind, policy = %id, "Deleted policy of a previous kind");
            }
        }
        Ok(())
    }

    async fn reconcile_namespace(
        &self,
        template: &NetworkPolicyTemplate,
        kind: GeneratedKind,
        owner: &OwnerReference,
        ns: &Namespace,
    ) -> Result<(), NamespaceError> {
        let name = owner.name.as_str();
        let ns_name = ns.name_any();
        let id = kind.policy_id(&ns_name, name);

        if !is_opted_in(&ns.metadata, name) {
            let Some(existing) = self.store.get_policy(kind, &id).await? else {
                return Ok(());
            };
            if !generated::is_owned_by(&existing.metadata, name) {
                debug!(template = %name, policy = %id, "Ignoring unmanaged policy");
                return Ok(());
            }
            if existing.metadata.deletion_timestamp.is_some() {
                return Ok(());
            }
            self.store.delete_policy(kind, &id).await?;
            self.metrics.policy_written(kind, PolicyOp::Delete);
            info!(template = %name, %kind, policy = %id, "Deleted policy");
            return Ok(());
        }

        let desired = desired_policy(template, kind, owner, ns)?;

        let Some(mut existing) = self.store.get_policy(kind, &id).await? else {
            self.store.create_policy(kind, desired).await?;
            self.metrics.policy_written(kind, PolicyOp::Create);
            info!(template = %name, %kind, policy = %id, "Created policy");
            return Ok(());
        };

        if !generated::is_owned_by(&existing.metadata, name) {
            warn!(template = %name, %kind, policy = %id, "Policy exists and is not managed by this template");
            return Ok(());
        }

        let content = RuleContent::of(&desired.data);
        let labeled = existing.labels().get(TEMPLATE_LABEL).map(String::as_str) == Some(name);
        if labeled && RuleContent::of(&existing.data) == content {
            debug!(template = %name, policy = %id, "Policy is up to date");
            return Ok(());
        }

        content.apply_to(&mut existing.data);
        existing
            .labels_mut()
            .insert(TEMPLATE_LABEL.to_string(), name.to_string());
        self.store.replace_policy(kind, existing).await?;
        self.metrics.policy_written(kind, PolicyOp::Update);
        info!(template = %name, %kind, policy = %id, "Updated policy");
        Ok(())
    }
}

/// Compiles the policy `template` generates for `ns`, stamped with its
/// identity and ownership.
fn desired_policy(
    template: &NetworkPolicyTemplate,
    kind: GeneratedKind,
    owner: &OwnerReference,
    ns: &Namespace,
) -> Result<DynamicObject, template::Error> {
    let meta = NamespaceMeta {
        name: ns.name_any(),
        labels: ns.labels().clone(),
        annotations: ns.annotations().clone(),
    };
    let expected = TypeRef::new(API_VERSION, kind.kind());
    let data = template::compile(&template.spec.policy_template, &meta, &expected)?;

    let mut policy: DynamicObject =
        serde_json::from_value(data).map_err(|error| template::Error::Decode(Box::new(error)))?;
    let id = kind.policy_id(&meta.name, &owner.name);
    policy.metadata.name = Some(id.name);
    policy.metadata.namespace = id.namespace;
    policy.metadata.owner_references = Some(vec![owner.clone()]);
    policy
        .labels_mut()
        .insert(TEMPLATE_LABEL.to_string(), owner.name.clone());
    Ok(policy)
}
