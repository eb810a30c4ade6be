//! Converges the StatefulSet and Service of a function.
//!
//! Every call computes the whole desired workload from a freshly fetched one and issues a
//! single write, conditional on the fetched resourceVersion. There's no locking: if another
//! writer gets there first the write fails with a conflict, and the caller decides whether
//! that matters.
use crate::config::ReconcilerConfig;
use crate::error::ReconcileError;
use crate::function::Function;
use crate::k8s_types;
use crate::resolve::{
    ProfileDescriptor, ProfileResolver, ResolvedSecrets, SecretResolver, StoreProfileResolver,
    StoreSecretResolver,
};
use crate::resource::{K8sResource, ObjectIdRef};
use crate::runner::metrics::ReconcileMetrics;
use crate::store::{ResourceStore, StoreError};
use crate::workload::change::needs_update;
use crate::workload::synthesize::{make_annotations, synthesize, synthesize_service, SynthesisMode};
use crate::workload::{profiles, secrets, security, Workload};

use serde_json::Value;

use std::fmt::{self, Display};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Updated,
    /// the workload was already rendered from an equivalent spec
    Unchanged,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Created => "created",
            ReconcileOutcome::Updated => "updated",
            ReconcileOutcome::Unchanged => "unchanged",
        }
    }
}

impl Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything rendering needs from outside the function itself
#[derive(Debug, Clone, Default)]
pub struct ResolvedInputs {
    pub secrets: ResolvedSecrets,
    /// profiles the function declares now
    pub apply: Vec<ProfileDescriptor>,
    /// profiles the previous workload declared that the function no longer does
    pub remove: Vec<ProfileDescriptor>,
}

/// Renders the full desired workload. Steps run in a fixed order: synthesis, the security
/// policy, profile removal then application, and finally secret projection.
pub fn render(
    function: &Function,
    previous: Option<&Workload>,
    mode: SynthesisMode,
    inputs: &ResolvedInputs,
    config: &ReconcilerConfig,
) -> Result<Workload, ReconcileError> {
    let spec = &function.spec;
    let workload = synthesize(function, previous, mode, config)?;
    let workload = security::configure_read_only_root_filesystem(workload, spec.read_only_root_filesystem);
    let workload = security::configure_user_id(workload, config.set_non_root_user);

    let workload = inputs.remove.iter().fold(workload, profiles::remove);
    let workload = inputs.apply.iter().fold(workload, profiles::apply);

    secrets::project(
        workload,
        function.service_name(),
        &spec.secrets,
        &inputs.secrets,
        &config.secrets_mount_path,
    )
}

fn encode(workload: &Workload) -> Result<Value, ReconcileError> {
    workload.to_value().map_err(|err| {
        ReconcileError::Upstream(StoreError::Upstream(format!(
            "cannot encode workload '{}': {}",
            workload.name(),
            err
        )))
    })
}

fn decode(resource: &K8sResource) -> Result<Workload, ReconcileError> {
    Workload::from_resource(resource)
        .map_err(|err| ReconcileError::Upstream(StoreError::Upstream(err.to_string())))
}

/// Losing a write race is counted next to the other outcomes, not as an error
const CONFLICT_OUTCOME: &str = "conflict";

fn error_kind(err: &ReconcileError) -> &'static str {
    match err {
        ReconcileError::Validation(_) => "validation",
        ReconcileError::NotFound { .. } => "not_found",
        ReconcileError::Conflict(_) => CONFLICT_OUTCOME,
        ReconcileError::Upstream(_) => "upstream",
    }
}

pub struct Reconciler<S: ResourceStore> {
    store: Arc<S>,
    secrets: Arc<dyn SecretResolver>,
    profiles: Arc<dyn ProfileResolver>,
    config: ReconcilerConfig,
    metrics: ReconcileMetrics,
}

impl<S: ResourceStore + 'static> Reconciler<S> {
    /// A reconciler that resolves secrets and profiles from the same store it writes to
    pub fn with_store(store: Arc<S>, config: ReconcilerConfig, metrics: ReconcileMetrics) -> Reconciler<S> {
        let secrets = Arc::new(StoreSecretResolver::new(store.clone()));
        let profiles = Arc::new(StoreProfileResolver::new(store.clone()));
        Reconciler::new(store, secrets, profiles, config, metrics)
    }
}

impl<S: ResourceStore> Reconciler<S> {
    pub fn new(
        store: Arc<S>,
        secrets: Arc<dyn SecretResolver>,
        profiles: Arc<dyn ProfileResolver>,
        config: ReconcilerConfig,
        metrics: ReconcileMetrics,
    ) -> Reconciler<S> {
        Reconciler {
            store,
            secrets,
            profiles,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Deploys a new function. Fails with a conflict if its workload already exists.
    pub async fn create(&self, function: &Function) -> Result<ReconcileOutcome, ReconcileError> {
        let result = self.do_create(function).await;
        self.record(function, &result);
        result
    }

    /// Updates a deployed function. Unlike `create`, malformed resource quantities fail the
    /// update instead of being dropped, and a missing workload is `NotFound`.
    pub async fn update(&self, function: &Function) -> Result<ReconcileOutcome, ReconcileError> {
        let result = self.do_update(function).await;
        self.record(function, &result);
        result
    }

    /// Creates the workload if it's missing, otherwise replaces it when the function changed
    pub async fn reconcile(&self, function: &Function) -> Result<ReconcileOutcome, ReconcileError> {
        let result = self.do_reconcile(function).await;
        self.record(function, &result);
        result
    }

    fn record(&self, function: &Function, result: &Result<ReconcileOutcome, ReconcileError>) {
        match result {
            Ok(outcome) => {
                log::info!("Reconciled function '{}': {}", function.service_name(), outcome);
                self.metrics.outcome(outcome.as_str());
            }
            Err(err) if err.is_conflict() => {
                log::info!("Function '{}' was superseded: {}", function.service_name(), err);
                self.metrics.outcome(CONFLICT_OUTCOME);
            }
            Err(err) => {
                log::error!("Failed to reconcile function '{}': {}", function.service_name(), err);
                self.metrics.error(error_kind(err));
            }
        }
    }

    async fn do_create(&self, function: &Function) -> Result<ReconcileOutcome, ReconcileError> {
        function.spec.validate()?;
        let namespace = function.namespace_or(&self.config.default_namespace);
        let id = ObjectIdRef::new(namespace, function.service_name());

        let existing = self
            .store
            .get_optional(k8s_types::apps::v1::StatefulSet, id)
            .await?;
        if existing.is_some() {
            return Err(ReconcileError::Conflict(format!("function '{}' already exists", id)));
        }
        self.create_workload(function, namespace).await?;
        Ok(ReconcileOutcome::Created)
    }

    async fn do_update(&self, function: &Function) -> Result<ReconcileOutcome, ReconcileError> {
        function.spec.validate()?;
        let namespace = function.namespace_or(&self.config.default_namespace);
        let id = ObjectIdRef::new(namespace, function.service_name());

        let existing = self
            .store
            .get_optional(k8s_types::apps::v1::StatefulSet, id)
            .await?
            .ok_or_else(|| ReconcileError::not_found("StatefulSet", id.to_string()))?;
        let previous = decode(&existing)?;
        if !needs_update(&function.spec, &previous) {
            return Ok(ReconcileOutcome::Unchanged);
        }

        self.replace_workload(function, namespace, &previous, SynthesisMode::Update)
            .await?;
        self.update_service(function, namespace).await?;
        Ok(ReconcileOutcome::Updated)
    }

    async fn do_reconcile(&self, function: &Function) -> Result<ReconcileOutcome, ReconcileError> {
        function.spec.validate()?;
        let namespace = function.namespace_or(&self.config.default_namespace);
        let id = ObjectIdRef::new(namespace, function.service_name());

        let existing = self
            .store
            .get_optional(k8s_types::apps::v1::StatefulSet, id)
            .await?;
        match existing {
            None => {
                self.create_workload(function, namespace).await?;
                Ok(ReconcileOutcome::Created)
            }
            Some(existing) => {
                let previous = decode(&existing)?;
                if !needs_update(&function.spec, &previous) {
                    return Ok(ReconcileOutcome::Unchanged);
                }
                self.replace_workload(function, namespace, &previous, SynthesisMode::Create)
                    .await?;
                Ok(ReconcileOutcome::Updated)
            }
        }
    }

    async fn create_workload(&self, function: &Function, namespace: &str) -> Result<(), ReconcileError> {
        let inputs = self.resolve_inputs(function, namespace, None).await?;
        let workload = render(function, None, SynthesisMode::Create, &inputs, &self.config)?;
        let created = self
            .store
            .create(k8s_types::apps::v1::StatefulSet, &encode(&workload)?)
            .await?;
        log::info!(
            "Created StatefulSet '{}' with resourceVersion: {}",
            created.get_object_id(),
            created.resource_version()
        );

        let service = synthesize_service(function, &self.config);
        match self.store.create(k8s_types::core::v1::Service, &service).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_conflict() => {
                log::warn!(
                    "Service for function '{}' already exists, leaving it as it is",
                    function.service_name()
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn replace_workload(
        &self,
        function: &Function,
        namespace: &str,
        previous: &Workload,
        mode: SynthesisMode,
    ) -> Result<(), ReconcileError> {
        let inputs = self.resolve_inputs(function, namespace, Some(previous)).await?;
        let workload = render(function, Some(previous), mode, &inputs, &self.config)?;
        let id = ObjectIdRef::new(namespace, function.service_name());
        let updated = self
            .store
            .replace(k8s_types::apps::v1::StatefulSet, id, &encode(&workload)?)
            .await?;
        log::info!(
            "Replaced StatefulSet '{}', resourceVersion: {} -> {}",
            id,
            previous.metadata.resource_version.as_deref().unwrap_or(""),
            updated.resource_version()
        );
        Ok(())
    }

    /// Rewrites the Service annotations. Another writer having changed the Service in the
    /// meantime is logged and otherwise ignored.
    async fn update_service(&self, function: &Function, namespace: &str) -> Result<(), ReconcileError> {
        let id = ObjectIdRef::new(namespace, function.service_name());
        let service = match self
            .store
            .get_optional(k8s_types::core::v1::Service, id)
            .await?
        {
            Some(service) => service,
            None => {
                log::warn!("Service '{}' does not exist, not updating its annotations", id);
                return Ok(());
            }
        };

        let mut value = service.into_value();
        if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            let annotations = serde_json::to_value(make_annotations(&function.spec))
                .map_err(|err| ReconcileError::Upstream(StoreError::Upstream(err.to_string())))?;
            metadata.insert("annotations".to_owned(), annotations);
        }

        match self.store.replace(k8s_types::core::v1::Service, id, &value).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_conflict() => {
                log::info!("Service '{}' was modified concurrently, skipping annotation update", id);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn resolve_inputs(
        &self,
        function: &Function,
        namespace: &str,
        previous: Option<&Workload>,
    ) -> Result<ResolvedInputs, ReconcileError> {
        let secrets = self.secrets.resolve(namespace, &function.spec.secrets).await?;
        if let Some(missing) = function
            .spec
            .secrets
            .iter()
            .find(|name| !secrets.contains_key(name.as_str()))
        {
            return Err(ReconcileError::not_found("Secret", missing.as_str()));
        }

        let declared = profiles::profile_names(&function.spec.annotations);
        let apply = self.resolve_profiles(&declared).await?;

        // the previous annotations must be read before rendering overwrites them
        let remove = match previous {
            Some(previous) => {
                let stale = profiles::profiles_to_remove(
                    &function.spec.annotations,
                    &previous.metadata.annotations,
                );
                self.resolve_profiles(&stale).await?
            }
            None => Vec::new(),
        };

        Ok(ResolvedInputs {
            secrets,
            apply,
            remove,
        })
    }

    /// Missing profiles are skipped
    async fn resolve_profiles(&self, names: &[String]) -> Result<Vec<ProfileDescriptor>, ReconcileError> {
        let namespace = self.config.profiles_namespace.as_str();
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            match self.profiles.resolve(namespace, name).await {
                Ok(profile) => resolved.push(profile),
                Err(err) if err.is_not_found() => {
                    log::warn!("Profile '{}/{}' not found, skipping it: {}", namespace, name, err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::function::{FunctionSpec, ANNOTATION_PROFILES};
    use crate::resolve::{ProfileSpec, SecretDescriptor};
    use crate::workload::synthesize::LABEL_UID;
    use crate::workload::Toleration;

    fn function() -> Function {
        let mut spec = FunctionSpec::new("testfunc", "ghcr.io/openfaas/alpine:latest");
        spec.secrets = vec!["pullsecret".to_owned(), "testsecret".to_owned()];
        spec.read_only_root_filesystem = true;
        Function::new("openfaas-fn", spec)
    }

    fn inputs() -> ResolvedInputs {
        let mut secrets = ResolvedSecrets::new();
        secrets.insert("pullsecret".to_owned(), SecretDescriptor::pull("pullsecret"));
        secrets.insert(
            "testsecret".to_owned(),
            SecretDescriptor::generic("testsecret", vec!["filename"]),
        );
        ResolvedInputs {
            secrets,
            ..Default::default()
        }
    }

    fn without_uid(mut workload: Workload) -> Workload {
        workload.spec.template.metadata.labels.remove(LABEL_UID);
        workload
    }

    #[test]
    fn rendering_twice_is_idempotent() {
        let config = ReconcilerConfig::default().with_non_root_user(true);
        let first = render(&function(), None, SynthesisMode::Create, &inputs(), &config).unwrap();
        let second = render(&function(), Some(&first), SynthesisMode::Create, &inputs(), &config).unwrap();

        assert_eq!(without_uid(first), without_uid(second.clone()));
        assert_eq!(1, second.volume_count("testfunc-projected-secrets"));
        assert_eq!(1, second.mount_count("testfunc-projected-secrets"));
        assert_eq!(1, second.volume_count("temp"));
        assert_eq!(
            Some(12000),
            second.container().unwrap().security_context.as_ref().unwrap().run_as_user
        );
    }

    #[test]
    fn missing_secret_fails_the_render() {
        let mut inputs = inputs();
        inputs.secrets.remove("testsecret");
        let err = render(&function(), None, SynthesisMode::Create, &inputs, &ReconcilerConfig::default())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn stale_profiles_are_removed_before_new_ones_apply() {
        let gpu = ProfileDescriptor::new(
            "gpu",
            ProfileSpec {
                tolerations: vec![Toleration {
                    key: Some("gpu".to_owned()),
                    operator: Some("Exists".to_owned()),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        let gvisor = ProfileDescriptor::new(
            "gvisor",
            ProfileSpec {
                runtime_class_name: Some("gvisor".to_owned()),
                ..Default::default()
            },
        );
        let config = ReconcilerConfig::default();

        let mut with_gpu = function();
        with_gpu
            .spec
            .annotations
            .insert(ANNOTATION_PROFILES.to_owned(), "gpu".to_owned());
        let mut gpu_inputs = inputs();
        gpu_inputs.apply = vec![gpu.clone()];
        let first = render(&with_gpu, None, SynthesisMode::Create, &gpu_inputs, &config).unwrap();
        assert_eq!(1, first.pod_spec().tolerations.len());

        let mut with_gvisor = function();
        with_gvisor
            .spec
            .annotations
            .insert(ANNOTATION_PROFILES.to_owned(), "gvisor".to_owned());
        let mut gvisor_inputs = inputs();
        gvisor_inputs.apply = vec![gvisor];
        gvisor_inputs.remove = vec![gpu];
        let second = render(&with_gvisor, Some(&first), SynthesisMode::Update, &gvisor_inputs, &config).unwrap();
        assert!(second.pod_spec().tolerations.is_empty());
        assert_eq!(Some("gvisor"), second.pod_spec().runtime_class_name.as_deref());
    }
}
