pub use netplate_policy_controller_core as core;
pub use netplate_policy_controller_k8s_api as k8s;
pub use netplate_policy_controller_k8s_reconcile as reconcile;

mod admission;
mod args;
mod controller;
mod validation;

pub use self::{admission::Admission, args::Args};
