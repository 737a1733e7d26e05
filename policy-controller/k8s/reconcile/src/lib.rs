//! Materializes network policy templates into per-namespace Cilium policies.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;
mod reconcile;
mod store;

#[cfg(test)]
mod tests;

pub use self::{
    metrics::ControllerMetrics,
    reconcile::{Error, Reconciler},
    store::{KubeStore, Store, StoreError},
};
