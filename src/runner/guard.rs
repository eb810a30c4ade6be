//! Keeps the replica count of function workloads inside `[1, max_replicas]`.
use crate::function::LABEL_FUNCTION;
use crate::k8s_types;
use crate::resource::K8sResource;
use crate::runner::metrics::GuardMetrics;
use crate::store::{ResourceStore, StoreError};

use serde_json::Value;

use std::sync::Arc;

/// What to do about one observed workload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// not a function workload, or the replica count is unset
    Ignore,
    InBounds,
    Correct { from: i64, to: i64 },
}

/// Decides on a workload as observed. Only the replica count and the pod template's
/// `faas_function` label are looked at.
pub fn evaluate(resource: &K8sResource, max_replicas: i32) -> GuardDecision {
    let value = resource.as_ref();
    let is_function = value
        .pointer("/spec/template/metadata/labels")
        .and_then(|labels| labels.get(LABEL_FUNCTION))
        .is_some();
    if !is_function {
        return GuardDecision::Ignore;
    }
    let replicas = match value.pointer("/spec/replicas").and_then(Value::as_i64) {
        Some(r) => r,
        None => return GuardDecision::Ignore,
    };

    let max = i64::from(max_replicas);
    if replicas == 0 {
        GuardDecision::Correct { from: 0, to: 1 }
    } else if replicas > max {
        GuardDecision::Correct {
            from: replicas,
            to: max,
        }
    } else {
        GuardDecision::InBounds
    }
}

pub struct ScaleGuard<S: ResourceStore> {
    store: Arc<S>,
    max_replicas: i32,
    metrics: GuardMetrics,
}

impl<S: ResourceStore> ScaleGuard<S> {
    pub fn new(store: Arc<S>, max_replicas: i32, metrics: GuardMetrics) -> ScaleGuard<S> {
        ScaleGuard {
            store,
            max_replicas,
            metrics,
        }
    }

    pub fn max_replicas(&self) -> i32 {
        self.max_replicas
    }

    /// Evaluates one observation and issues the corrective write if needed. The write is
    /// conditional on the observed resourceVersion, and losing that race is not an error:
    /// whoever won produced a new revision that will be observed next.
    pub async fn observe(&self, resource: K8sResource) -> Result<GuardDecision, StoreError> {
        let decision = evaluate(&resource, self.max_replicas);
        let (from, to) = match decision {
            GuardDecision::Correct { from, to } => (from, to),
            other => return Ok(other),
        };

        let id = resource.get_object_id().to_owned();
        log::info!("Correcting replicas of '{}' from {} to {}", id, from, to);

        let mut desired = resource.into_value();
        if let Some(spec) = desired.get_mut("spec").and_then(Value::as_object_mut) {
            spec.insert("replicas".to_owned(), Value::from(to));
        }

        match self
            .store
            .replace(k8s_types::apps::v1::StatefulSet, id.as_id_ref(), &desired)
            .await
        {
            Ok(_) => {
                self.metrics.correction();
                Ok(decision)
            }
            Err(err) if err.is_conflict() => {
                log::debug!(
                    "Abandoning replica correction of '{}' because it was modified concurrently",
                    id
                );
                self.metrics.conflict();
                Ok(decision)
            }
            Err(err) => {
                log::error!("Failed to correct replicas of '{}': {}", id, err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn workload(replicas: Option<i64>, marked: bool) -> K8sResource {
        let mut labels = json!({ "app": "echo" });
        if marked {
            labels[LABEL_FUNCTION] = json!("echo");
        }
        let mut value = json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": { "name": "echo", "namespace": "openfaas-fn", "resourceVersion": "7" },
            "spec": { "template": { "metadata": { "labels": labels } } },
        });
        if let Some(r) = replicas {
            value["spec"]["replicas"] = json!(r);
        }
        K8sResource::from_value(value).unwrap()
    }

    #[test]
    fn zero_is_raised_to_one() {
        assert_eq!(
            GuardDecision::Correct { from: 0, to: 1 },
            evaluate(&workload(Some(0), true), 5)
        );
    }

    #[test]
    fn above_the_ceiling_is_lowered_to_it() {
        assert_eq!(
            GuardDecision::Correct { from: 9, to: 5 },
            evaluate(&workload(Some(9), true), 5)
        );
    }

    #[test]
    fn in_bounds_counts_are_left_alone() {
        for replicas in 1..=5 {
            assert_eq!(GuardDecision::InBounds, evaluate(&workload(Some(replicas), true), 5));
        }
    }

    #[test]
    fn unmarked_or_unset_workloads_are_ignored() {
        assert_eq!(GuardDecision::Ignore, evaluate(&workload(Some(0), false), 5));
        assert_eq!(GuardDecision::Ignore, evaluate(&workload(Some(50), false), 5));
        assert_eq!(GuardDecision::Ignore, evaluate(&workload(None, true), 5));
    }
}
