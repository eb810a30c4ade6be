//! Renders OpenFaaS functions into Kubernetes StatefulSets and keeps them converged.
//!
//! A function is turned into a workload by a fixed sequence of pure transformations in
//! [`workload`]: synthesis of the base StatefulSet, the container security policy, profile
//! fragments, and secret projection. [`runner::Reconciler`] resolves what those steps need
//! from the cluster and writes the result with a single conditional replace.
//!
//! [`runner::ScaleGuard`] runs independently, watching every function workload and
//! clamping its replica count back into `[1, max_replicas]`.
//!
//! ```no_run
//! use faas_reconciler::prelude::*;
//!
//! # async fn deploy() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ReconcilerConfig::new("faas-reconciler").with_non_root_user(true);
//! let running = faas_reconciler::runner::start(config)?;
//!
//! let mut spec = FunctionSpec::new("nodeinfo", "ghcr.io/openfaas/nodeinfo:latest");
//! spec.secrets = vec!["registry-auth".to_owned()];
//! let outcome = running.reconciler.create(&Function::new("openfaas-fn", spec)).await?;
//! println!("nodeinfo: {}", outcome);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod error;
pub mod function;
pub mod k8s_types;
pub mod resolve;
pub mod resource;
pub mod runner;
pub mod store;
pub mod workload;

pub use serde;
pub use serde_json;
pub use serde_yaml;

pub mod prelude {
    pub use crate::config::{ClientConfig, ProbeConfig, ReconcilerConfig};
    pub use crate::error::{ReconcileError, ValidationError};
    pub use crate::function::{Function, FunctionResources, FunctionSpec};
    pub use crate::k8s_types::{self, K8sType};
    pub use crate::resource::{K8sResource, ObjectIdRef};
    pub use crate::runner::{ReconcileOutcome, Reconciler, ScaleGuard};
    pub use crate::store::{ResourceStore, StoreError};
    pub use crate::workload::Workload;
    pub use serde::{Deserialize, Serialize};
}
