use netplate_policy_controller_k8s_api::GeneratedKind;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    reconciles: Family<ReconcileLabels, Counter>,
    policy_writes: Family<PolicyLabels, Counter>,
    compile_failures: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReconcileLabels {
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PolicyLabels {
    kind: &'static str,
    op: &'static str,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PolicyOp {
    Create,
    Update,
    Delete,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reconciles = Family::default();
        reg.register(
            "reconciles",
            "Count of template reconciliation passes by result",
            reconciles.clone(),
        );

        let policy_writes = Family::default();
        reg.register(
            "policy_writes",
            "Count of generated policies created, updated, or deleted",
            policy_writes.clone(),
        );

        let compile_failures = Counter::default();
        reg.register(
            "compile_failures",
            "Count of templates that failed to compile for a namespace",
            compile_failures.clone(),
        );

        Self {
            reconciles,
            policy_writes,
            compile_failures,
        }
    }

    pub(crate) fn reconciled(&self, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.reconciles
            .get_or_create(&ReconcileLabels { result })
            .inc();
    }

    pub(crate) fn policy_written(&self, kind: GeneratedKind, op: PolicyOp) {
        self.policy_writes
            .get_or_create(&PolicyLabels {
                kind: kind.kind(),
                op: op.as_str(),
            })
            .inc();
    }

    pub(crate) fn compile_failed(&self) {
        self.compile_failures.inc();
    }
}

// === impl PolicyOp ===

impl PolicyOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}
