//! The declarative input: an OpenFaaS `Function` and its spec.
//!
//! A `FunctionSpec` is an immutable value received per request. Its json form is also the
//! signature stored on the workload it produced, so field names follow the OpenFaaS CRD.
mod quantity;

pub use self::quantity::Quantity;

use crate::error::ValidationError;
use crate::resource::{InvalidResourceError, K8sResource};

use lazy_static::lazy_static;
use regex::Regex;

use std::collections::BTreeMap;

pub type StringMap = BTreeMap<String, String>;

/// Marker label identifying a workload as a function. The scale guard only touches these.
pub const LABEL_FUNCTION: &str = "faas_function";
pub const LABEL_MIN_REPLICAS: &str = "com.openfaas.scale.min";
pub const LABEL_MAX_REPLICAS: &str = "com.openfaas.scale.max";
pub const ANNOTATION_FUNCTION_SPEC: &str = "com.openfaas.function.spec";
pub const ANNOTATION_PROMETHEUS_SCRAPE: &str = "prometheus.io.scrape";
/// Comma separated list of profile names to apply to the workload
pub const ANNOTATION_PROFILES: &str = "com.openfaas.profile";

lazy_static! {
    static ref DNS_LABEL_REGEX: Regex = Regex::new("^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FunctionResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
}

impl FunctionResources {
    pub fn is_empty(&self) -> bool {
        self.memory.is_none() && self.cpu.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    pub name: String,
    pub image: String,
    /// the function's process, exported to the watchdog as `fprocess`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub handler: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: StringMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: StringMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: StringMap,
    /// node selector entries in `key=value` form
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<FunctionResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<FunctionResources>,
    #[serde(default)]
    pub read_only_root_filesystem: bool,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> FunctionSpec {
        FunctionSpec {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Checks the fields an api caller can get wrong. Synthesis is lenient about most of
    /// these, so explicit create and update requests run this first.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !DNS_LABEL_REGEX.is_match(&self.name) || self.name.len() > 63 {
            return Err(ValidationError::new(
                "service",
                format!("'{}' must be a valid DNS-1123 label", self.name),
            ));
        }
        if self.image.trim().is_empty() {
            return Err(ValidationError::new("image", "must not be empty"));
        }
        for constraint in self.constraints.iter() {
            parse_constraint(constraint)?;
        }
        self.validate_scaling_labels()
    }

    fn validate_scaling_labels(&self) -> Result<(), ValidationError> {
        let min = parse_positive_label(&self.labels, LABEL_MIN_REPLICAS)?;
        let max = parse_positive_label(&self.labels, LABEL_MAX_REPLICAS)?;
        if let (Some(min), Some(max)) = (min, max) {
            if min > max {
                return Err(ValidationError::new(
                    LABEL_MIN_REPLICAS,
                    format!("minimum of {} is greater than maximum of {}", min, max),
                ));
            }
        }
        Ok(())
    }
}

fn parse_positive_label(labels: &StringMap, key: &str) -> Result<Option<i32>, ValidationError> {
    match labels.get(key) {
        None => Ok(None),
        Some(value) => match value.trim().parse::<i32>() {
            Ok(n) if n >= 1 => Ok(Some(n)),
            _ => Err(ValidationError::new(
                key,
                format!("'{}' must be a positive integer", value),
            )),
        },
    }
}

/// Splits a `key=value` placement constraint
pub fn parse_constraint(constraint: &str) -> Result<(&str, &str), ValidationError> {
    let mut parts = constraint.split('=');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(key), Some(value), None) if !key.trim().is_empty() => Ok((key.trim(), value.trim())),
        _ => Err(ValidationError::new(
            "constraints",
            format!("'{}' is not in key=value form", constraint),
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FunctionMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// uid of the source object, used for the owner reference on rendered objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// A function together with the identity of the object it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub metadata: FunctionMeta,
    pub spec: FunctionSpec,
}

impl Function {
    /// A function that didn't come from a custom resource, e.g. a deploy request. The
    /// source object name is the service name and no owner reference will be written.
    pub fn new(namespace: impl Into<String>, spec: FunctionSpec) -> Function {
        Function {
            metadata: FunctionMeta {
                name: spec.name.clone(),
                namespace: Some(namespace.into()),
                uid: None,
            },
            spec,
        }
    }

    pub fn from_resource(resource: &K8sResource) -> Result<Function, InvalidResourceError> {
        serde_json::from_value(resource.as_ref().clone()).map_err(|err| {
            log::warn!("Cannot decode Function '{}': {}", resource.get_object_id(), err);
            InvalidResourceError::new("not a valid Function", resource.as_ref().clone())
        })
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Function {
        self.metadata.uid = Some(uid.into());
        self
    }

    pub fn namespace_or<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        self.metadata
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default_namespace)
    }

    pub fn service_name(&self) -> &str {
        self.spec.name.as_str()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn spec_with_labels(labels: &[(&str, &str)]) -> FunctionSpec {
        let mut spec = FunctionSpec::new("echo", "ghcr.io/openfaas/echo:latest");
        for (k, v) in labels {
            spec.labels.insert(k.to_string(), v.to_string());
        }
        spec
    }

    #[test]
    fn validate_accepts_a_minimal_spec() {
        assert_eq!(Ok(()), spec_with_labels(&[]).validate());
    }

    #[test]
    fn validate_rejects_bad_service_names() {
        for name in &["Echo", "-echo", "echo_fn", ""] {
            let mut spec = spec_with_labels(&[]);
            spec.name = name.to_string();
            let err = spec.validate().unwrap_err();
            assert_eq!("service", err.field);
        }
    }

    #[test]
    fn validate_rejects_malformed_constraints() {
        let mut spec = spec_with_labels(&[]);
        spec.constraints = vec!["node.kubernetes.io/instance-type=m5.large".to_owned(), "gpu".to_owned()];
        let err = spec.validate().unwrap_err();
        assert_eq!("constraints", err.field);
        assert!(err.message.contains("gpu"));
    }

    #[test]
    fn validate_checks_scaling_labels() {
        assert!(spec_with_labels(&[(LABEL_MIN_REPLICAS, "2"), (LABEL_MAX_REPLICAS, "4")]).validate().is_ok());
        assert!(spec_with_labels(&[(LABEL_MIN_REPLICAS, "zero")]).validate().is_err());
        assert!(spec_with_labels(&[(LABEL_MIN_REPLICAS, "0")]).validate().is_err());
        let err = spec_with_labels(&[(LABEL_MIN_REPLICAS, "5"), (LABEL_MAX_REPLICAS, "2")])
            .validate()
            .unwrap_err();
        assert_eq!(LABEL_MIN_REPLICAS, err.field);
    }

    #[test]
    fn parse_constraint_splits_on_a_single_equals() {
        assert_eq!(Ok(("zone", "eu-west-1a")), parse_constraint("zone=eu-west-1a"));
        assert!(parse_constraint("a=b=c").is_err());
        assert!(parse_constraint("=b").is_err());
    }

    #[test]
    fn function_decodes_from_custom_resource() {
        let resource = K8sResource::from_value(json!({
            "apiVersion": "openfaas.com/v1",
            "kind": "Function",
            "metadata": {
                "name": "nodeinfo",
                "namespace": "openfaas-fn",
                "uid": "5d1c2b9e",
                "resourceVersion": "42"
            },
            "spec": {
                "name": "nodeinfo",
                "image": "functions/nodeinfo:latest",
                "handler": "node main.js",
                "readOnlyRootFilesystem": true,
                "secrets": ["api-key"],
                "limits": { "memory": "128Mi" }
            }
        }))
        .unwrap();

        let function = Function::from_resource(&resource).expect("function should decode");
        assert_eq!(Some("5d1c2b9e"), function.metadata.uid.as_deref());
        assert_eq!("node main.js", function.spec.handler);
        assert!(function.spec.read_only_root_filesystem);
        assert_eq!(vec!["api-key".to_owned()], function.spec.secrets);
        assert_eq!(Some("128Mi"), function.spec.limits.as_ref().and_then(|l| l.memory.as_deref()));
        assert_eq!("openfaas-fn", function.namespace_or("default"));
    }
}
