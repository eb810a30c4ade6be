//! Renders the workload and companion Service for a function.
//!
//! Rendering is a pure function of the function, the previously observed workload (if any)
//! and the reconciler config. The only input that isn't deterministic is the `uid` label,
//! which changes on every render so that the pods roll.
use crate::config::ReconcilerConfig;
use crate::error::ValidationError;
use crate::function::{
    parse_constraint, Function, FunctionResources, FunctionSpec, Quantity, StringMap,
    ANNOTATION_FUNCTION_SPEC, ANNOTATION_PROMETHEUS_SCRAPE, LABEL_FUNCTION,
};
use crate::k8s_types;
use crate::workload::change::encode_signature;
use crate::workload::probes::{make_probes, WATCHDOG_PORT};
use crate::workload::{
    replicas, Container, ContainerPort, EnvVar, IntOrString, LabelSelector, OwnerReference,
    ResourceRequirements, RollingUpdate, SecurityContext, UpdateStrategy, Workload,
};
use crate::resource::JsonObject;

use serde_json::{json, Value};

pub const ENV_FPROCESS: &str = "fprocess";
pub const LABEL_APP: &str = "app";
pub const LABEL_CONTROLLER: &str = "controller";
pub const LABEL_UID: &str = "uid";
pub const REVISION_HISTORY_LIMIT: i32 = 5;

/// How strict rendering is about malformed resource quantities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisMode {
    /// malformed quantities are logged and the container gets no resource requirements
    Create,
    /// malformed quantities fail the render, so a running function isn't silently changed
    Update,
}

fn make_env(spec: &FunctionSpec) -> Vec<EnvVar> {
    let mut env = Vec::with_capacity(spec.environment.len() + 1);
    if !spec.handler.is_empty() {
        env.push(EnvVar::new(ENV_FPROCESS, spec.handler.as_str()));
    }
    for (name, value) in spec.environment.iter() {
        env.push(EnvVar::new(name.as_str(), value.as_str()));
    }
    env
}

/// User labels first. The selector and the scale guard rely on the reserved keys, so those
/// always carry the function's own values.
fn base_labels(function: &Function) -> StringMap {
    let mut labels = function.spec.labels.clone();
    labels.insert(LABEL_FUNCTION.to_owned(), function.spec.name.clone());
    labels.insert(LABEL_APP.to_owned(), function.spec.name.clone());
    labels.insert(LABEL_CONTROLLER.to_owned(), function.metadata.name.clone());
    labels
}

fn pod_labels(function: &Function) -> StringMap {
    let mut labels = base_labels(function);
    let nanos = chrono::Utc::now().timestamp_subsec_nanos();
    labels.insert(LABEL_UID.to_owned(), nanos.to_string());
    labels
}

/// Function annotations plus the scrape opt-out and the spec signature
pub fn make_annotations(spec: &FunctionSpec) -> StringMap {
    let mut annotations = StringMap::new();
    annotations.insert(ANNOTATION_PROMETHEUS_SCRAPE.to_owned(), "false".to_owned());
    annotations.extend(spec.annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
    match encode_signature(spec) {
        Ok(signature) => {
            annotations.insert(ANNOTATION_FUNCTION_SPEC.to_owned(), signature);
        }
        Err(err) => log::error!("Failed to encode spec of function '{}': {}", spec.name, err),
    }
    annotations
}

fn make_node_selector(constraints: &[String]) -> StringMap {
    let mut selector = StringMap::new();
    for constraint in constraints {
        match parse_constraint(constraint) {
            Ok((key, value)) => {
                selector.insert(key.to_owned(), value.to_owned());
            }
            Err(err) => log::warn!("Ignoring placement constraint: {}", err),
        }
    }
    selector
}

fn add_quantities(
    target: &mut StringMap,
    section: &str,
    resources: Option<&FunctionResources>,
) -> Result<(), ValidationError> {
    let resources = match resources {
        Some(r) => r,
        None => return Ok(()),
    };
    if let Some(memory) = resources.memory.as_ref().filter(|m| !m.is_empty()) {
        let quantity = Quantity::parse(&format!("{}.memory", section), memory)?;
        target.insert("memory".to_owned(), quantity.as_str().to_owned());
    }
    if let Some(cpu) = resources.cpu.as_ref().filter(|c| !c.is_empty()) {
        let quantity = Quantity::parse(&format!("{}.cpu", section), cpu)?;
        target.insert("cpu".to_owned(), quantity.as_str().to_owned());
    }
    Ok(())
}

pub fn make_resources(spec: &FunctionSpec) -> Result<ResourceRequirements, ValidationError> {
    let mut resources = ResourceRequirements::default();
    add_quantities(&mut resources.limits, "limits", spec.limits.as_ref())?;
    add_quantities(&mut resources.requests, "requests", spec.requests.as_ref())?;
    Ok(resources)
}

fn owner_reference(function: &Function) -> Option<OwnerReference> {
    let uid = function.metadata.uid.as_ref()?;
    let function_type = k8s_types::openfaas::v1::Function;
    Some(OwnerReference {
        api_version: function_type.api_version.to_owned(),
        kind: function_type.kind.to_owned(),
        name: function.metadata.name.clone(),
        uid: uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Renders the desired workload. When `previous` is given, rendering starts from it so
/// that fields this crate doesn't manage, the resourceVersion, and the replica count set
/// by an autoscaler carry over.
pub fn synthesize(
    function: &Function,
    previous: Option<&Workload>,
    mode: SynthesisMode,
    config: &ReconcilerConfig,
) -> Result<Workload, ValidationError> {
    let spec = &function.spec;

    let resources = match make_resources(spec) {
        Ok(resources) => resources,
        Err(err) if mode == SynthesisMode::Update => return Err(err),
        Err(err) => {
            log::warn!("Function '{}' resources parsing failed: {}", spec.name, err);
            ResourceRequirements::default()
        }
    };
    let probes = match make_probes(spec, &config.probes) {
        Ok(probes) => Some(probes),
        Err(err) => {
            log::warn!("Function '{}' probes parsing failed: {}", spec.name, err);
            None
        }
    };

    let mut workload = previous.cloned().unwrap_or_default();
    let existing_replicas = previous.and_then(|p| p.spec.replicas);
    let annotations = make_annotations(spec);

    let metadata = &mut workload.metadata;
    metadata.name = spec.name.clone();
    metadata.namespace = Some(function.namespace_or(&config.default_namespace).to_owned());
    metadata.labels = base_labels(function);
    metadata.annotations = annotations.clone();
    if let Some(owner) = owner_reference(function) {
        metadata.owner_references = vec![owner];
    }

    let workload_spec = &mut workload.spec;
    workload_spec.replicas = replicas::resolve(replicas::declared_min(&spec.labels), existing_replicas);
    workload_spec.selector.get_or_insert_with(|| {
        let mut selector = LabelSelector::default();
        selector.match_labels.insert(LABEL_APP.to_owned(), spec.name.clone());
        selector
            .match_labels
            .insert(LABEL_CONTROLLER.to_owned(), function.metadata.name.clone());
        selector
    });
    workload_spec.service_name.get_or_insert_with(|| spec.name.clone());
    workload_spec.update_strategy = Some(UpdateStrategy {
        strategy_type: "RollingUpdate".to_owned(),
        rolling_update: Some(RollingUpdate {
            max_unavailable: Some(IntOrString::Int(0)),
            extra: JsonObject::new(),
        }),
    });
    workload_spec.revision_history_limit = Some(REVISION_HISTORY_LIMIT);

    let template = &mut workload_spec.template;
    template.metadata.labels = pod_labels(function);
    template.metadata.annotations = annotations;

    let pod_spec = &mut template.spec;
    pod_spec.node_selector = make_node_selector(&spec.constraints);
    if pod_spec.containers.is_empty() {
        pod_spec.containers.push(Container::default());
    }

    let container = &mut pod_spec.containers[0];
    container.name = spec.name.clone();
    container.image = spec.image.clone();
    container.ports = vec![ContainerPort {
        container_port: WATCHDOG_PORT,
        protocol: Some("TCP".to_owned()),
        extra: JsonObject::new(),
    }];
    container.image_pull_policy = Some("Always".to_owned());
    container.env = make_env(spec);
    container.resources = resources;
    container.liveness_probe = probes.as_ref().map(|p| p.liveness.clone());
    container.readiness_probe = probes.map(|p| p.readiness);
    container
        .security_context
        .get_or_insert_with(SecurityContext::default)
        .allow_privilege_escalation = Some(false);

    Ok(workload)
}

/// The ClusterIP Service that routes to the function's pods on the watchdog port
pub fn synthesize_service(function: &Function, config: &ReconcilerConfig) -> Value {
    let spec = &function.spec;
    let mut metadata = json!({
        "name": spec.name,
        "namespace": function.namespace_or(&config.default_namespace),
        "annotations": make_annotations(spec),
    });
    if let Some(owner) = owner_reference(function) {
        metadata["ownerReferences"] = json!([owner]);
    }

    json!({
        "apiVersion": k8s_types::core::v1::Service.api_version,
        "kind": k8s_types::core::v1::Service.kind,
        "metadata": metadata,
        "spec": {
            "type": "ClusterIP",
            "selector": { LABEL_FUNCTION: spec.name },
            "ports": [{
                "name": "http",
                "protocol": "TCP",
                "port": WATCHDOG_PORT,
                "targetPort": WATCHDOG_PORT,
            }],
        },
    })
}
