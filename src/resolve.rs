//! Narrow lookups for the things a function refers to by name: secrets and profiles.
//!
//! Each resolver is its own trait so the reconciler can be tested with fixed answers.
//! The store-backed implementations read from the same [`ResourceStore`] the reconciler
//! writes to.
use crate::error::ReconcileError;
use crate::k8s_types;
use crate::resource::{K8sResource, ObjectIdRef};
use crate::store::{ResourceStore, StoreError};
use crate::workload::{Toleration, Volume};

use async_trait::async_trait;
use serde_json::Value;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const SECRET_TYPE_DOCKERCFG: &str = "kubernetes.io/dockercfg";
const SECRET_TYPE_DOCKER_CONFIG_JSON: &str = "kubernetes.io/dockerconfigjson";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    /// registry credentials, referenced from `imagePullSecrets`
    Pull,
    /// anything else, projected into the container as files
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretDescriptor {
    pub name: String,
    pub kind: SecretKind,
    pub keys: BTreeSet<String>,
}

impl SecretDescriptor {
    pub fn pull(name: impl Into<String>) -> SecretDescriptor {
        SecretDescriptor {
            name: name.into(),
            kind: SecretKind::Pull,
            keys: BTreeSet::new(),
        }
    }

    pub fn generic<I, S>(name: impl Into<String>, keys: I) -> SecretDescriptor
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SecretDescriptor {
            name: name.into(),
            kind: SecretKind::Generic,
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Describes a `v1/Secret`. Only the key names are read, never the values.
    pub fn from_resource(resource: &K8sResource) -> SecretDescriptor {
        let kind = match resource.str_value("/type") {
            Some(SECRET_TYPE_DOCKERCFG) | Some(SECRET_TYPE_DOCKER_CONFIG_JSON) => SecretKind::Pull,
            _ => SecretKind::Generic,
        };
        let mut keys = BTreeSet::new();
        for field in &["/data", "/stringData"] {
            if let Some(data) = resource.as_ref().pointer(field).and_then(Value::as_object) {
                keys.extend(data.keys().cloned());
            }
        }
        SecretDescriptor {
            name: resource.name().to_owned(),
            kind,
            keys,
        }
    }
}

pub type ResolvedSecrets = BTreeMap<String, SecretDescriptor>;

#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Resolves every name that exists. Missing names are simply absent from the result,
    /// the caller decides whether that's an error.
    async fn resolve(&self, namespace: &str, names: &[String]) -> Result<ResolvedSecrets, ReconcileError>;
}

/// The pod-spec fragment a profile contributes
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_security_context: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileDescriptor {
    pub name: String,
    pub spec: ProfileSpec,
}

impl ProfileDescriptor {
    pub fn new(name: impl Into<String>, spec: ProfileSpec) -> ProfileDescriptor {
        ProfileDescriptor {
            name: name.into(),
            spec,
        }
    }

    pub fn from_resource(resource: &K8sResource) -> Result<ProfileDescriptor, serde_json::Error> {
        let spec = match resource.as_ref().get("spec") {
            Some(spec) => serde_json::from_value(spec.clone())?,
            None => ProfileSpec::default(),
        };
        Ok(ProfileDescriptor::new(resource.name(), spec))
    }
}

#[async_trait]
pub trait ProfileResolver: Send + Sync {
    /// `Err(ReconcileError::NotFound)` when no profile by that name exists in the namespace
    async fn resolve(&self, namespace: &str, name: &str) -> Result<ProfileDescriptor, ReconcileError>;
}

pub struct StoreSecretResolver<S: ResourceStore> {
    store: Arc<S>,
}

impl<S: ResourceStore> StoreSecretResolver<S> {
    pub fn new(store: Arc<S>) -> Self {
        StoreSecretResolver { store }
    }
}

#[async_trait]
impl<S: ResourceStore> SecretResolver for StoreSecretResolver<S> {
    async fn resolve(&self, namespace: &str, names: &[String]) -> Result<ResolvedSecrets, ReconcileError> {
        let mut resolved = ResolvedSecrets::new();
        for name in names {
            if resolved.contains_key(name) {
                continue;
            }
            let id = ObjectIdRef::new(namespace, name.as_str());
            match self.store.get(k8s_types::core::v1::Secret, id).await {
                Ok(secret) => {
                    resolved.insert(name.clone(), SecretDescriptor::from_resource(&secret));
                }
                Err(StoreError::NotFound(_)) => {
                    log::debug!("Secret '{}' does not exist", id);
                }
                Err(other) => return Err(ReconcileError::Upstream(other)),
            }
        }
        Ok(resolved)
    }
}

pub struct StoreProfileResolver<S: ResourceStore> {
    store: Arc<S>,
}

impl<S: ResourceStore> StoreProfileResolver<S> {
    pub fn new(store: Arc<S>) -> Self {
        StoreProfileResolver { store }
    }
}

#[async_trait]
impl<S: ResourceStore> ProfileResolver for StoreProfileResolver<S> {
    async fn resolve(&self, namespace: &str, name: &str) -> Result<ProfileDescriptor, ReconcileError> {
        let id = ObjectIdRef::new(namespace, name);
        match self.store.get(k8s_types::openfaas::v1::Profile, id).await {
            Ok(resource) => ProfileDescriptor::from_resource(&resource).map_err(|err| {
                ReconcileError::Upstream(StoreError::Upstream(format!(
                    "invalid Profile '{}': {}",
                    id, err
                )))
            }),
            Err(StoreError::NotFound(_)) => Err(ReconcileError::not_found("Profile", id.to_string())),
            Err(other) => Err(ReconcileError::Upstream(other)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn secret_kind_follows_the_secret_type() {
        let pull = K8sResource::from_value(json!({
            "metadata": { "name": "registry", "resourceVersion": "1" },
            "type": "kubernetes.io/dockerconfigjson",
            "data": { ".dockerconfigjson": "e30=" }
        }))
        .unwrap();
        assert_eq!(SecretKind::Pull, SecretDescriptor::from_resource(&pull).kind);

        let generic = K8sResource::from_value(json!({
            "metadata": { "name": "api-key", "resourceVersion": "1" },
            "type": "Opaque",
            "data": { "token": "c2VjcmV0" },
            "stringData": { "user": "admin" }
        }))
        .unwrap();
        let descriptor = SecretDescriptor::from_resource(&generic);
        assert_eq!(SecretKind::Generic, descriptor.kind);
        assert_eq!(
            vec!["token", "user"],
            descriptor.keys.iter().map(String::as_str).collect::<Vec<_>>()
        );
    }

    #[test]
    fn profile_spec_decodes_from_resource() {
        let resource = K8sResource::from_value(json!({
            "metadata": { "name": "gpu", "namespace": "openfaas", "resourceVersion": "3" },
            "spec": {
                "runtimeClassName": "nvidia",
                "tolerations": [{ "key": "gpu", "operator": "Exists", "effect": "NoSchedule" }]
            }
        }))
        .unwrap();
        let profile = ProfileDescriptor::from_resource(&resource).unwrap();
        assert_eq!("gpu", profile.name);
        assert_eq!(Some("nvidia"), profile.spec.runtime_class_name.as_deref());
        assert_eq!(Some("gpu"), profile.spec.tolerations[0].key.as_deref());
    }
}
