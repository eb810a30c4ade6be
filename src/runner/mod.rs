pub mod client;
pub mod guard;
mod informer;
pub mod metrics;
pub mod reconcile;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use self::guard::{GuardDecision, ScaleGuard};
pub use self::informer::{start_scale_guard, GuardHandle};
pub use self::reconcile::{render, ReconcileOutcome, Reconciler, ResolvedInputs};

use crate::config::{ClientConfig, ReconcilerConfig};
use client::Client;
use metrics::Metrics;

use std::sync::Arc;

/// Everything a running reconciler process holds on to. Dropping it stops the scale guard.
pub struct Running {
    pub reconciler: Reconciler<Client>,
    pub guard: GuardHandle,
    pub metrics: Arc<Metrics>,
}

/// Connects to the api server and starts the scale guard on the current tokio runtime.
/// The returned reconciler is driven by whoever receives deploy and update requests.
pub fn start_with_client_config(
    config: ReconcilerConfig,
    client_config: ClientConfig,
) -> Result<Running, std::io::Error> {
    log::debug!("Starting reconciler with configuration: {:?}", config);
    let metrics = Arc::new(Metrics::new());
    let client = Arc::new(Client::new(client_config, metrics.client_metrics())?);

    let guard = ScaleGuard::new(client.clone(), config.max_replicas, metrics.guard_metrics());
    let guard = start_scale_guard(
        client.clone(),
        Some(config.default_namespace.clone()),
        guard,
        metrics.guard_metrics(),
    );
    let reconciler = Reconciler::with_store(client, config, metrics.reconcile_metrics());

    Ok(Running {
        reconciler,
        guard,
        metrics,
    })
}

/// Like `start_with_client_config`, reading the client configuration from the pod's
/// service account
pub fn start(config: ReconcilerConfig) -> Result<Running, std::io::Error> {
    let client_config = ClientConfig::from_service_account(config.operator_name.as_str())?;
    start_with_client_config(config, client_config)
}
