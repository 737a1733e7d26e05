use crate::{ControllerMetrics, Error, Reconciler, Store, StoreError};
use maplit::btreemap;
use netplate_policy_controller_k8s_api::{
    generated::{self, TEMPLATE_LABEL},
    policy::{
        NetworkPolicyTemplate, NetworkPolicyTemplateSpec, TemplateStatus, FINALIZER,
        OPT_IN_ANNOTATION,
    },
    DynamicObject, GeneratedKind, Namespace, ObjectMeta, PolicyId, ResourceExt, Time,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

const DENY_HOST: &str = r#"
apiVersion: cilium.io/v2
kind: CiliumNetworkPolicy
spec:
  endpointSelector: {}
  egressDeny:
  - toEntities:
    - host
  egress:
  - toCIDRSet:
    - cidr: 10.0.0.0/8
"#;

const TEAM_POLICY: &str = r#"
apiVersion: cilium.io/v2
kind: CiliumNetworkPolicy
spec:
  endpointSelector:
    matchLabels:
      team: {{ labels.team }}
"#;

const CLUSTER_WIDE: &str = r#"
apiVersion: cilium.io/v2
kind: CiliumClusterwideNetworkPolicy
spec:
  endpointSelector:
    matchLabels:
      "k8s:io.kubernetes.pod.namespace": {{ name }}
  ingress:
  - fromEntities:
    - cluster
"#;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Write {
    Create(GeneratedKind, PolicyId),
    Replace(GeneratedKind, PolicyId),
    Delete(GeneratedKind, PolicyId),
    AddFinalizer(String),
    RemoveFinalizer(String),
    Status(String, TemplateStatus),
}

/// An in-memory store that records every write.
#[derive(Default)]
struct FakeStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, Namespace>,
    policies: HashMap<(GeneratedKind, PolicyId), DynamicObject>,
    templates: BTreeMap<String, NetworkPolicyTemplate>,
    writes: Vec<Write>,
    fail_writes_in: Option<String>,
    next_version: u64,
}

// === impl FakeStore ===

impl FakeStore {
    fn add_namespace(&self, name: &str, templates: Option<&str>, labels: BTreeMap<String, String>) {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                annotations: templates
                    .map(|t| btreemap! { OPT_IN_ANNOTATION.to_string() => t.to_string() }),
                ..Default::default()
            },
            ..Default::default()
        };
        self.state.lock().namespaces.insert(name.to_string(), ns);
    }

    fn add_template(&self, name: &str, cluster_wide: bool, text: &str) {
        let mut template = NetworkPolicyTemplate::new(
            name,
            NetworkPolicyTemplateSpec {
                cluster_wide,
                policy_template: text.to_string(),
            },
        );
        template.metadata.uid = Some(format!("uid-{name}"));
        self.state
            .lock()
            .templates
            .insert(name.to_string(), template);
    }

    fn template(&self, name: &str) -> NetworkPolicyTemplate {
        self.state.lock().templates[name].clone()
    }

    fn update_template(&self, name: &str, f: impl FnOnce(&mut NetworkPolicyTemplate)) {
        f(self.state.lock().templates.get_mut(name).unwrap());
    }

    fn policy(&self, kind: GeneratedKind, ns: Option<&str>, name: &str) -> Option<DynamicObject> {
        let id = PolicyId {
            namespace: ns.map(Into::into),
            name: name.to_string(),
        };
        self.state.lock().policies.get(&(kind, id)).cloned()
    }

    fn put_policy(&self, kind: GeneratedKind, policy: DynamicObject) {
        let id = PolicyId::of(&policy.metadata);
        self.state.lock().policies.insert((kind, id), policy);
    }

    fn take_writes(&self) -> Vec<Write> {
        std::mem::take(&mut self.state.lock().writes)
    }

    fn fail_writes_in(&self, namespace: &str) {
        self.state.lock().fail_writes_in = Some(namespace.to_string());
    }

    fn check_write(state: &State, id: &PolicyId) -> Result<(), StoreError> {
        if id.namespace.is_some() && id.namespace == state.fail_writes_in {
            return Err(api_error(500, "InternalError"));
        }
        Ok(())
    }

    fn stamp_version(state: &mut State, policy: &mut DynamicObject) {
        state.next_version += 1;
        policy.metadata.resource_version = Some(state.next_version.to_string());
    }
}

#[async_trait::async_trait]
impl Store for FakeStore {
    async fn namespaces(&self) -> Result<Vec<Namespace>, StoreError> {
        Ok(self.state.lock().namespaces.values().cloned().collect())
    }

    async fn get_policy(
        &self,
        kind: GeneratedKind,
        id: &PolicyId,
    ) -> Result<Option<DynamicObject>, StoreError> {
        Ok(self.state.lock().policies.get(&(kind, id.clone())).cloned())
    }

    async fn create_policy(
        &self,
        kind: GeneratedKind,
        mut policy: DynamicObject,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let id = PolicyId::of(&policy.metadata);
        Self::check_write(&state, &id)?;
        if state.policies.contains_key(&(kind, id.clone())) {
            return Err(api_error(409, "AlreadyExists"));
        }
        Self::stamp_version(&mut state, &mut policy);
        state.writes.push(Write::Create(kind, id.clone()));
        state.policies.insert((kind, id), policy);
        Ok(())
    }

    async fn replace_policy(
        &self,
        kind: GeneratedKind,
        mut policy: DynamicObject,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let id = PolicyId::of(&policy.metadata);
        Self::check_write(&state, &id)?;
        let current = state
            .policies
            .get(&(kind, id.clone()))
            .ok_or_else(|| api_error(404, "NotFound"))?;
        if current.metadata.resource_version != policy.metadata.resource_version {
            return Err(api_error(409, "Conflict"));
        }
        Self::stamp_version(&mut state, &mut policy);
        state.writes.push(Write::Replace(kind, id.clone()));
        state.policies.insert((kind, id), policy);
        Ok(())
    }

    async fn delete_policy(&self, kind: GeneratedKind, id: &PolicyId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        Self::check_write(&state, id)?;
        if state.policies.remove(&(kind, id.clone())).is_some() {
            state.writes.push(Write::Delete(kind, id.clone()));
        }
        Ok(())
    }

    async fn owned_policies(
        &self,
        kind: GeneratedKind,
        template: &str,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let state = self.state.lock();
        let mut policies = state
            .policies
            .iter()
            .filter(|((k, _), p)| {
                *k == kind
                    && p.labels().get(TEMPLATE_LABEL).map(String::as_str) == Some(template)
                    && generated::is_owned_by(&p.metadata, template)
            })
            .map(|(_, p)| p.clone())
            .collect::<Vec<_>>();
        policies.sort_by_key(|p| PolicyId::of(&p.metadata));
        Ok(policies)
    }

    async fn add_finalizer(&self, template: &NetworkPolicyTemplate) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let name = template.name_any();
        state.writes.push(Write::AddFinalizer(name.clone()));
        if let Some(t) = state.templates.get_mut(&name) {
            t.finalizers_mut().push(FINALIZER.to_string());
        }
        Ok(())
    }

    async fn remove_finalizer(&self, template: &NetworkPolicyTemplate) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let name = template.name_any();
        state.writes.push(Write::RemoveFinalizer(name.clone()));
        if let Some(t) = state.templates.get_mut(&name) {
            t.finalizers_mut().retain(|f| f != FINALIZER);
        }
        Ok(())
    }

    async fn set_status(&self, template: &str, status: TemplateStatus) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state
            .writes
            .push(Write::Status(template.to_string(), status));
        if let Some(t) = state.templates.get_mut(template) {
            t.status = Some(status);
        }
        Ok(())
    }
}

fn api_error(code: u16, reason: &str) -> StoreError {
    StoreError::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

fn reconciler(store: FakeStore) -> Reconciler<FakeStore> {
    let _tracing = tracing_subscriber::fmt()
        .with_test_writer()
        .try_init();
    Reconciler::new(store, ControllerMetrics::register(&mut Default::default()))
}

async fn reconcile(rec: &Reconciler<FakeStore>, name: &str) -> Result<(), Error> {
    let template = rec.store().template(name);
    rec.reconcile(&template).await
}

fn cnp(ns: &str) -> PolicyId {
    PolicyId {
        namespace: Some(ns.to_string()),
        name: "deny-host".to_string(),
    }
}

fn spec_of(policy: &DynamicObject) -> serde_json::Value {
    policy.data["spec"].clone()
}

#[tokio::test]
async fn generates_policies_for_opted_in_namespaces() {
    let store = FakeStore::default();
    store.add_template("deny-host", false, DENY_HOST);
    store.add_namespace("tenant-a", Some("deny-host"), Default::default());
    store.add_namespace("tenant-b", Some("allow-dns,deny-host"), Default::default());
    store.add_namespace("tenant-c", Some("allow-dns"), Default::default());
    store.add_namespace("kube-system", None, Default::default());
    let rec = reconciler(store);

    reconcile(&rec, "deny-host").await.unwrap();

    let ns = GeneratedKind::Namespaced;
    assert_eq!(
        rec.store().take_writes(),
        vec![
            Write::AddFinalizer("deny-host".to_string()),
            Write::Create(ns, cnp("tenant-a")),
            Write::Create(ns, cnp("tenant-b")),
            Write::Status("deny-host".to_string(), TemplateStatus::Ok),
        ]
    );

    let policy = rec.store().policy(ns, Some("tenant-a"), "deny-host").unwrap();
    assert_eq!(
        spec_of(&policy),
        json!({
            "endpointSelector": {},
            "egressDeny": [{"toEntities": ["host"]}],
            "egress": [{"toCIDRSet": [{"cidr": "10.0.0.0/8"}]}],
        })
    );
    assert_eq!(
        generated::template_owner(&policy.metadata),
        Some("deny-host")
    );
    let owner = &policy.metadata.owner_references.as_ref().unwrap()[0];
    assert_eq!(owner.uid, "uid-deny-host");
    assert_eq!(owner.controller, Some(true));
    assert_eq!(
        policy.labels().get(TEMPLATE_LABEL).map(String::as_str),
        Some("deny-host")
    );
    assert!(rec.store().policy(ns, Some("tenant-c"), "deny-host").is_none());
    assert!(rec.store().policy(ns, Some("kube-system"), "deny-host").is_none());
}

#[tokio::test]
async fn second_pass_performs_no_writes() {
    let store = FakeStore::default();
    store.add_template("deny-host", false, DENY_HOST);
    store.add_namespace("tenant-a", Some("deny-host"), Default::default());
    store.add_namespace("tenant-b", None, Default::default());
    let rec = reconciler(store);

    reconcile(&rec, "deny-host").await.unwrap();
    assert!(!rec.store().take_writes().is_empty());

    reconcile(&rec, "deny-host").await.unwrap();
    assert_eq!(rec.store().take_writes(), vec![]);
}

#[tokio::test]
async fn cluster_wide_policies_are_named_for_namespace() {
    let store = FakeStore::default();
    store.add_template("intra-cluster", true, CLUSTER_WIDE);
    store.add_namespace("tenant-a", Some("intra-cluster"), Default::default());
    let rec = reconciler(store);

    reconcile(&rec, "intra-cluster").await.unwrap();

    let policy = rec
        .store()
        .policy(GeneratedKind::ClusterWide, None, "tenant-a-intra-cluster")
        .expect("cluster-wide policy must be created");
    assert_eq!(policy.metadata.namespace, None);
    assert_eq!(
        spec_of(&policy)["endpointSelector"],
        json!({"matchLabels": {"k8s:io.kubernetes.pod.namespace": "tenant-a"}})
    );
    assert!(rec
        .store()
        .policy(GeneratedKind::Namespaced, Some("tenant-a"), "intra-cluster")
        .is_none());
}

#[tokio::test]
async fn switching_to_cluster_wide_replaces_namespaced_policies() {
    let store = FakeStore::default();
    store.add_template("deny-host", false, DENY_HOST);
    store.add_namespace("tenant-a", Some("deny-host"), Default::default());
    let rec = reconciler(store);
    reconcile(&rec, "deny-host").await.unwrap();
    rec.store().take_writes();

    rec.store().update_template("deny-host", |t| {
        t.spec.cluster_wide = true;
        t.spec.policy_template = CLUSTER_WIDE.to_string();
    });
    reconcile(&rec, "deny-host").await.unwrap();

    let cluster_wide = PolicyId {
        namespace: None,
        name: "tenant-a-deny-host".to_string(),
    };
    assert_eq!(
        rec.store().take_writes(),
        vec![
            Write::Create(GeneratedKind::ClusterWide, cluster_wide),
            Write::Delete(GeneratedKind::Namespaced, cnp("tenant-a")),
        ]
    );
    assert!(rec
        .store()
        .policy(GeneratedKind::Namespaced, Some("tenant-a"), "deny-host")
        .is_none());

    reconcile(&rec, "deny-host").await.unwrap();
    assert_eq!(rec.store().take_writes(), vec![]);
}

#[tokio::test]
async fn template_changes_propagate_and_preserve_metadata() {
    let store = FakeStore::default();
    store.add_template("deny-host", false, DENY_HOST);
    store.add_namespace("tenant-a", Some("deny-host"), Default::default());
    store.add_namespace("tenant-b", Some("deny-host"), Default::default());
    let rec = reconciler(store);
    reconcile(&rec, "deny-host").await.unwrap();

    // Metadata set by someone else must survive an update.
    let ns = GeneratedKind::Namespaced;
    let mut policy = rec.store().policy(ns, Some("tenant-a"), "deny-host").unwrap();
    policy
        .annotations_mut()
        .insert("example.com/owner".to_string(), "sre".to_string());
    rec.store().put_policy(ns, policy);
    rec.store().take_writes();

    rec.store().update_template("deny-host", |t| {
        t.spec.policy_template = DENY_HOST.replace("10.0.0.0/8", "192.168.0.0/16");
    });
    reconcile(&rec, "deny-host").await.unwrap();

    assert_eq!(
        rec.store().take_writes(),
        vec![
            Write::Replace(ns, cnp("tenant-a")),
            Write::Replace(ns, cnp("tenant-b")),
        ]
    );
    for name in ["tenant-a", "tenant-b"] {
        let policy = rec.store().policy(ns, Some(name), "deny-host").unwrap();
        assert_eq!(
            spec_of(&policy)["egress"],
            json!([{"toCIDRSet": [{"cidr": "192.168.0.0/16"}]}])
        );
    }
    let policy = rec.store().policy(ns, Some("tenant-a"), "deny-host").unwrap();
    assert_eq!(
        policy.annotations().get("example.com/owner").map(String::as_str),
        Some("sre")
    );
}

#[tokio::test]
async fn reverts_edits_to_managed_policies() {
    let store = FakeStore::default();
    store.add_template("deny-host", false, DENY_HOST);
    store.add_namespace("tenant-a", Some("deny-host"), Default::default());
    let rec = reconciler(store);
    reconcile(&rec, "deny-host").await.unwrap();

    let ns = GeneratedKind::Namespaced;
    let original = rec.store().policy(ns, Some("tenant-a"), "deny-host").unwrap();
    let mut edited = original.clone();
    edited.data["spec"] = json!({"endpointSelector": {}, "egress": [{"toEntities": ["world"]}]});
    rec.store().put_policy(ns, edited);
    rec.store().take_writes();

    reconcile(&rec, "deny-host").await.unwrap();

    assert_eq!(
        rec.store().take_writes(),
        vec![Write::Replace(ns, cnp("tenant-a"))]
    );
    let policy = rec.store().policy(ns, Some("tenant-a"), "deny-host").unwrap();
    assert_eq!(spec_of(&policy), spec_of(&original));
}

#[tokio::test]
async fn unmanaged_policies_are_never_touched() {
    let store = FakeStore::default();
    store.add_template("deny-host", false, DENY_HOST);
    store.add_namespace("tenant-a", Some("deny-host"), Default::default());
    store.add_namespace("tenant-b", None, Default::default());

    let ns = GeneratedKind::Namespaced;
    for name in ["tenant-a", "tenant-b"] {
        let mut policy = DynamicObject::new("deny-host", &ns.api_resource()).within(name);
        policy.data = json!({"spec": {"endpointSelector": {}}});
        store.put_policy(ns, policy);
    }
    let rec = reconciler(store);

    reconcile(&rec, "deny-host").await.unwrap();

    assert_eq!(
        rec.store().take_writes(),
        vec![
            Write::AddFinalizer("deny-host".to_string()),
            Write::Status("deny-host".to_string(), TemplateStatus::Ok),
        ]
    );
    for name in ["tenant-a", "tenant-b"] {
        let policy = rec.store().policy(ns, Some(name), "deny-host").unwrap();
        assert_eq!(spec_of(&policy), json!({"endpointSelector": {}}));
    }
}

#[tokio::test]
async fn opting_out_deletes_policy() {
    let store = FakeStore::default();
    store.add_template("deny-host", false, DENY_HOST);
    store.add_namespace("tenant-a", Some("deny-host"), Default::default());
    let rec = reconciler(store);
    reconcile(&rec, "deny-host").await.unwrap();
    rec.store().take_writes();

    rec.store()
        .add_namespace("tenant-a", Some("allow-dns"), Default::default());
    reconcile(&rec, "deny-host").await.unwrap();

    let ns = GeneratedKind::Namespaced;
    assert_eq!(
        rec.store().take_writes(),
        vec![Write::Delete(ns, cnp("tenant-a"))]
    );
    assert!(rec.store().policy(ns, Some("tenant-a"), "deny-host").is_none());
}

#[tokio::test]
async fn compile_failures_mark_template_invalid() {
    let store = FakeStore::default();
    store.add_template("team", false, TEAM_POLICY);
    store.add_namespace(
        "tenant-a",
        Some("team"),
        btreemap! { "team".to_string() => "neco".to_string() },
    );
    store.add_namespace("tenant-b", Some("team"), Default::default());
    let rec = reconciler(store);

    reconcile(&rec, "team").await.unwrap();

    let ns = GeneratedKind::Namespaced;
    let id = |n: &str| PolicyId {
        namespace: Some(n.to_string()),
        name: "team".to_string(),
    };
    assert_eq!(
        rec.store().take_writes(),
        vec![
            Write::AddFinalizer("team".to_string()),
            Write::Create(ns, id("tenant-a")),
            Write::Status("team".to_string(), TemplateStatus::Invalid),
        ]
    );
    assert_eq!(rec.store().template("team").status, Some(TemplateStatus::Invalid));

    // Once the namespace is fixed, the template recovers.
    rec.store().add_namespace(
        "tenant-b",
        Some("team"),
        btreemap! { "team".to_string() => "maneki".to_string() },
    );
    reconcile(&rec, "team").await.unwrap();
    assert_eq!(
        rec.store().take_writes(),
        vec![
            Write::Create(ns, id("tenant-b")),
            Write::Status("team".to_string(), TemplateStatus::Ok),
        ]
    );
}

#[tokio::test]
async fn schema_mismatch_is_a_compile_failure() {
    let store = FakeStore::default();
    // A namespaced template that produces a cluster-wide document.
    store.add_template("intra-cluster", false, CLUSTER_WIDE);
    store.add_namespace("tenant-a", Some("intra-cluster"), Default::default());
    let rec = reconciler(store);

    reconcile(&rec, "intra-cluster").await.unwrap();

    assert_eq!(
        rec.store().template("intra-cluster").status,
        Some(TemplateStatus::Invalid)
    );
    assert!(rec
        .store()
        .policy(GeneratedKind::Namespaced, Some("tenant-a"), "intra-cluster")
        .is_none());
}

#[tokio::test]
async fn store_errors_are_returned_after_status() {
    let store = FakeStore::default();
    store.add_template("deny-host", false, DENY_HOST);
    store.add_namespace("tenant-a", Some("deny-host"), Default::default());
    store.add_namespace("tenant-b", Some("deny-host"), Default::default());
    store.add_namespace("tenant-c", Some("deny-host"), Default::default());
    store.fail_writes_in("tenant-b");
    let rec = reconciler(store);

    let res = reconcile(&rec, "deny-host").await;
    assert!(matches!(res, Err(Error::Store(_))), "{res:?}");

    let ns = GeneratedKind::Namespaced;
    assert_eq!(
        rec.store().take_writes(),
        vec![
            Write::AddFinalizer("deny-host".to_string()),
            Write::Create(ns, cnp("tenant-a")),
            Write::Create(ns, cnp("tenant-c")),
            Write::Status("deny-host".to_string(), TemplateStatus::Ok),
        ]
    );
}

#[tokio::test]
async fn deleting_template_deletes_only_its_policies() {
    let store = FakeStore::default();
    store.add_template("deny-host", false, DENY_HOST);
    store.add_template("intra-cluster", true, CLUSTER_WIDE);
    store.add_namespace(
        "tenant-a",
        Some("deny-host,intra-cluster"),
        Default::default(),
    );
    store.add_namespace("tenant-b", Some("deny-host"), Default::default());
    let rec = reconciler(store);
    reconcile(&rec, "deny-host").await.unwrap();
    reconcile(&rec, "intra-cluster").await.unwrap();
    rec.store().take_writes();

    rec.store().update_template("deny-host", |t| {
        t.metadata.deletion_timestamp = Some(Time(Default::default()));
    });
    reconcile(&rec, "deny-host").await.unwrap();

    let ns = GeneratedKind::Namespaced;
    assert_eq!(
        rec.store().take_writes(),
        vec![
            Write::Delete(ns, cnp("tenant-a")),
            Write::Delete(ns, cnp("tenant-b")),
            Write::RemoveFinalizer("deny-host".to_string()),
        ]
    );
    assert!(rec.store().template("deny-host").finalizers().is_empty());
    assert!(rec
        .store()
        .policy(GeneratedKind::ClusterWide, None, "tenant-a-intra-cluster")
        .is_some());
}

#[tokio::test]
async fn deleting_template_without_finalizer_is_a_noop() {
    let store = FakeStore::default();
    store.add_template("deny-host", false, DENY_HOST);
    store.add_namespace("tenant-a", Some("deny-host"), Default::default());
    store.update_template("deny-host", |t| {
        t.metadata.deletion_timestamp = Some(Time(Default::default()));
    });
    let rec = reconciler(store);

    reconcile(&rec, "deny-host").await.unwrap();
    assert_eq!(rec.store().take_writes(), vec![]);
}

#[tokio::test]
async fn template_without_uid_is_an_error() {
    let store = FakeStore::default();
    store.add_template("deny-host", false, DENY_HOST);
    store.update_template("deny-host", |t| t.metadata.uid = None);
    let rec = reconciler(store);

    assert!(matches!(
        reconcile(&rec, "deny-host").await,
        Err(Error::MissingUid(name)) if name == "deny-host"
    ));
}
