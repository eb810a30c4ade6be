//! Raw Kubernetes objects as they come back from the api server, plus the
//! namespace/name ids used to address them.
//!
//! `K8sResource` is a thin wrapper around a json `Value` that has been checked for the
//! metadata fields every persisted object carries. Typed views such as
//! [`Workload`](crate::workload::Workload) are decoded from it on demand, so anything
//! this crate doesn't model survives a fetch-mutate-replace cycle untouched.
use serde_json::Value;

use std::fmt::{self, Display};

pub type JsonObject = serde_json::Map<String, Value>;

#[derive(Debug, PartialEq, Clone)]
pub struct InvalidResourceError {
    pub message: &'static str,
    pub value: Value,
}

impl InvalidResourceError {
    pub fn new(message: &'static str, value: Value) -> Self {
        InvalidResourceError { message, value }
    }
}

impl Display for InvalidResourceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid Resource: {}", self.message)
    }
}

impl std::error::Error for InvalidResourceError {}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct K8sResource(Value);

impl K8sResource {
    pub fn from_value(value: Value) -> Result<K8sResource, InvalidResourceError> {
        match K8sResource::validate(&value) {
            Ok(()) => Ok(K8sResource(value)),
            Err(message) => Err(InvalidResourceError { message, value }),
        }
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn resource_version(&self) -> &str {
        self.str_value("/metadata/resourceVersion").unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.str_value("/metadata/name").unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_value("/metadata/namespace")
    }

    pub fn uid(&self) -> Option<&str> {
        self.str_value("/metadata/uid")
    }

    pub fn kind(&self) -> Option<&str> {
        self.str_value("/kind")
    }

    pub fn get_label_value(&self, label: &str) -> Option<&str> {
        let labels = self.0.pointer("/metadata/labels")?.as_object()?;
        labels.get(label).and_then(Value::as_str)
    }

    pub fn get_annotation_value(&self, annotation: &str) -> Option<&str> {
        let annotations = self.0.pointer("/metadata/annotations")?.as_object()?;
        annotations.get(annotation).and_then(Value::as_str)
    }

    pub fn get_object_id(&self) -> ObjectIdRef<'_> {
        ObjectIdRef::new(self.namespace().unwrap_or(""), self.name())
    }

    pub fn str_value(&self, pointer: &str) -> Option<&str> {
        self.0.pointer(pointer).and_then(Value::as_str)
    }

    fn validate(value: &Value) -> Result<(), &'static str> {
        if !value.is_object() {
            return Err("resource must be a json object");
        }
        value
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or("missing metadata.name")?;
        value
            .pointer("/metadata/resourceVersion")
            .ok_or("missing metadata.resourceVersion")?;
        Ok(())
    }
}

impl AsRef<Value> for K8sResource {
    fn as_ref(&self) -> &Value {
        &self.0
    }
}

impl From<K8sResource> for Value {
    fn from(resource: K8sResource) -> Value {
        resource.into_value()
    }
}

impl Display for K8sResource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An owned namespace and name. An empty namespace means "not namespaced".
#[derive(Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct ObjectId {
    pub namespace: String,
    pub name: String,
}

impl ObjectId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> ObjectId {
        ObjectId {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn as_id_ref(&self) -> ObjectIdRef<'_> {
        ObjectIdRef::new(&self.namespace, &self.name)
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.as_id_ref().fmt(f)
    }
}

/// An id that borrows its fields, typically from a json `Value` or a `FunctionSpec`
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct ObjectIdRef<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
}

impl<'a> ObjectIdRef<'a> {
    pub fn new(namespace: &'a str, name: &'a str) -> ObjectIdRef<'a> {
        ObjectIdRef { namespace, name }
    }

    pub fn to_owned(&self) -> ObjectId {
        ObjectId::new(self.namespace, self.name)
    }

    /// Returns `None` when the namespace is empty
    pub fn namespace(&self) -> Option<&'a str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(self.namespace)
        }
    }

    pub fn name(&self) -> &'a str {
        self.name
    }
}

impl<'a> Display for ObjectIdRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl<'a> From<(&'a str, &'a str)> for ObjectIdRef<'a> {
    fn from((namespace, name): (&'a str, &'a str)) -> ObjectIdRef<'a> {
        ObjectIdRef { namespace, name }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn resource_requires_name_and_resource_version() {
        let missing_version = json!({
            "metadata": { "name": "echo" }
        });
        let err = K8sResource::from_value(missing_version).unwrap_err();
        assert_eq!("missing metadata.resourceVersion", err.message);

        let valid = json!({
            "metadata": { "name": "echo", "namespace": "openfaas-fn", "resourceVersion": "7" }
        });
        let resource = K8sResource::from_value(valid).expect("resource should be valid");
        assert_eq!("7", resource.resource_version());
        assert_eq!(ObjectIdRef::new("openfaas-fn", "echo"), resource.get_object_id());
    }

    #[test]
    fn label_and_annotation_lookups_tolerate_missing_maps() {
        let resource = K8sResource::from_value(json!({
            "metadata": {
                "name": "echo",
                "resourceVersion": "1",
                "labels": { "faas_function": "echo" }
            }
        }))
        .unwrap();
        assert_eq!(Some("echo"), resource.get_label_value("faas_function"));
        assert_eq!(None, resource.get_annotation_value("com.openfaas.function.spec"));
        assert_eq!(None, resource.get_object_id().namespace());
    }
}
