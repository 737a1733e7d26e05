use netplate_policy_controller_k8s_api::{
    generated::{self, TEMPLATE_LABEL},
    policy::{NetworkPolicyTemplate, TemplateStatus, FINALIZER},
    Api, Client, DeleteParams, DynamicObject, GeneratedKind, ListParams, Namespace, Patch,
    PatchParams, PolicyId, PostParams, ResourceExt,
};
use std::future::Future;
use thiserror::Error;
use tokio::time::{self, Duration};

const FIELD_MANAGER: &str = "netplate-policy-controller";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// The object store operations the reconciler depends on.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn namespaces(&self) -> Result<Vec<Namespace>, StoreError>;

    async fn get_policy(
        &self,
        kind: GeneratedKind,
        id: &PolicyId,
    ) -> Result<Option<DynamicObject>, StoreError>;

    async fn create_policy(
        &self,
        kind: GeneratedKind,
        policy: DynamicObject,
    ) -> Result<(), StoreError>;

    /// Replaces a policy. The policy's resource version guards against
    /// concurrent writers.
    async fn replace_policy(
        &self,
        kind: GeneratedKind,
        policy: DynamicObject,
    ) -> Result<(), StoreError>;

    /// Deletes a policy. Deleting a policy that no longer exists succeeds.
    async fn delete_policy(&self, kind: GeneratedKind, id: &PolicyId) -> Result<(), StoreError>;

    /// Lists the policies of `kind` owned by the named template.
    async fn owned_policies(
        &self,
        kind: GeneratedKind,
        template: &str,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    async fn add_finalizer(&self, template: &NetworkPolicyTemplate) -> Result<(), StoreError>;

    async fn remove_finalizer(&self, template: &NetworkPolicyTemplate) -> Result<(), StoreError>;

    async fn set_status(&self, template: &str, status: TemplateStatus) -> Result<(), StoreError>;
}

/// A [`Store`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    timeout: Duration,
}

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn policies(&self, kind: GeneratedKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn templates(&self) -> Api<NetworkPolicyTemplate> {
        Api::all(self.client.clone())
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, kube::Error>>,
    ) -> Result<T, StoreError> {
        match time::timeout(self.timeout, op).await {
            Ok(res) => res.map_err(Into::into),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    async fn patch_finalizers(
        &self,
        template: &NetworkPolicyTemplate,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError> {
        // The resource version makes the patch fail if the finalizers changed
        // since the template was read.
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": template.resource_version(),
            }
        });
        self.bounded(self.templates().patch(
            &template.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        ))
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Store for KubeStore {
    async fn namespaces(&self) -> Result<Vec<Namespace>, StoreError> {
        let api = Api::<Namespace>::all(self.client.clone());
        let list = self.bounded(api.list(&ListParams::default())).await?;
        Ok(list.items)
    }

    async fn get_policy(
        &self,
        kind: GeneratedKind,
        id: &PolicyId,
    ) -> Result<Option<DynamicObject>, StoreError> {
        let api = self.policies(kind, id.namespace.as_deref());
        self.bounded(api.get_opt(&id.name)).await
    }

    async fn create_policy(
        &self,
        kind: GeneratedKind,
        policy: DynamicObject,
    ) -> Result<(), StoreError> {
        let api = self.policies(kind, policy.metadata.namespace.as_deref());
        self.bounded(api.create(&Self::post_params(), &policy))
            .await?;
        Ok(())
    }

    async fn replace_policy(
        &self,
        kind: GeneratedKind,
        policy: DynamicObject,
    ) -> Result<(), StoreError> {
        let api = self.policies(kind, policy.metadata.namespace.as_deref());
        let name = policy.name_any();
        self.bounded(api.replace(&name, &Self::post_params(), &policy))
            .await?;
        Ok(())
    }

    async fn delete_policy(&self, kind: GeneratedKind, id: &PolicyId) -> Result<(), StoreError> {
        let api = self.policies(kind, id.namespace.as_deref());
        match self
            .bounded(api.delete(&id.name, &DeleteParams::default()))
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::Kube(kube::Error::Api(e))) if e.code == 404 => {
                tracing::debug!(%kind, policy = %id, "Policy already deleted");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn owned_policies(
        &self,
        kind: GeneratedKind,
        template: &str,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let api = self.policies(kind, None);
        let params = ListParams::default().labels(&format!("{TEMPLATE_LABEL}={template}"));
        let list = self.bounded(api.list(&params)).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|p| generated::is_owned_by(&p.metadata, template))
            .collect())
    }

    async fn add_finalizer(&self, template: &NetworkPolicyTemplate) -> Result<(), StoreError> {
        let mut finalizers = template.finalizers().to_vec();
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        finalizers.push(FINALIZER.to_string());
        self.patch_finalizers(template, finalizers).await
    }

    async fn remove_finalizer(&self, template: &NetworkPolicyTemplate) -> Result<(), StoreError> {
        let finalizers = template
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(template, finalizers).await
    }

    async fn set_status(&self, template: &str, status: TemplateStatus) -> Result<(), StoreError> {
        let patch = serde_json::json!({ "status": status });
        self.bounded(self.templates().patch_status(
            template,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        ))
        .await?;
        Ok(())
    }
}
