#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod generated;
pub mod labels;
pub mod policy;

pub use self::{
    generated::{GeneratedKind, PolicyId},
    labels::Labels,
};
pub use k8s_openapi::{
    api::core::v1::Namespace,
    apimachinery::pkg::apis::meta::v1::{OwnerReference, Time},
};
pub use kube::{
    api::{
        Api, ApiResource, DeleteParams, DynamicObject, ListParams, ObjectMeta, Patch,
        PatchParams, PostParams, ResourceExt,
    },
    Client, Error, Resource,
};
