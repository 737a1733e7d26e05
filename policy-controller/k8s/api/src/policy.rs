pub mod admission_rule;
pub mod template;

pub use self::{
    admission_rule::{
        ForbiddenEntity, ForbiddenIpRange, NetworkPolicyAdmissionRule,
        NetworkPolicyAdmissionRuleSpec, RuleDirection,
    },
    template::{
        NetworkPolicyTemplate, NetworkPolicyTemplateSpec, TemplateStatus, FINALIZER,
        OPT_IN_ANNOTATION,
    },
};

/// The API group of every resource served by the controller.
pub const API_GROUP: &str = "netplate.io";
