//! The external store that holds every object this crate reads or writes.
//!
//! In production this is the Kubernetes api server, reached through
//! [`Client`](crate::runner::client::Client). Tests use the in-memory store from the
//! `testkit` module. Writes are conditional on `metadata.resourceVersion`, and a stale
//! version comes back as `StoreError::Conflict`.
use crate::k8s_types::K8sType;
use crate::resource::{K8sResource, ObjectIdRef};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use std::fmt::{self, Display};

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    NotFound(String),
    Conflict(String),
    /// The requested resourceVersion is too old to watch from. Callers should re-list.
    Expired,
    Upstream(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "'{}' not found", id),
            StoreError::Conflict(msg) => write!(f, "conflict: {}", msg),
            StoreError::Expired => f.write_str("resourceVersion expired"),
            StoreError::Upstream(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Error(ApiError),
}

#[derive(Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
pub struct ApiError {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    pub code: u16,
}

impl Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Api Error: status: '{}', code: {}, reason: '{}', message: '{}'",
            self.status, self.code, self.reason, self.message
        )
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
pub struct ListMeta {
    #[serde(rename = "resourceVersion")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ObjectList<T> {
    #[serde(default)]
    pub metadata: ListMeta,
    pub items: Vec<T>,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// get/create/replace/list/watch with optimistic concurrency.
///
/// `replace` must fail with `StoreError::Conflict` when the `metadata.resourceVersion` of
/// the submitted object doesn't match the stored one.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, k8s_type: &K8sType, id: ObjectIdRef<'_>) -> Result<K8sResource, StoreError>;

    async fn create(&self, k8s_type: &K8sType, resource: &Value) -> Result<K8sResource, StoreError>;

    async fn replace(
        &self,
        k8s_type: &K8sType,
        id: ObjectIdRef<'_>,
        resource: &Value,
    ) -> Result<K8sResource, StoreError>;

    async fn list(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<ObjectList<Value>, StoreError>;

    /// Streams changes that happened after `resource_version`. The stream ends when the
    /// server closes the connection, and the caller is expected to start a new watch.
    async fn watch(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<WatchStream, StoreError>;

    /// Like `get`, but a missing object is `Ok(None)`
    async fn get_optional(
        &self,
        k8s_type: &K8sType,
        id: ObjectIdRef<'_>,
    ) -> Result<Option<K8sResource>, StoreError> {
        match self.get(k8s_type, id).await {
            Ok(resource) => Ok(Some(resource)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn watch_events_decode_from_api_server_lines() {
        let line = r#"{"type":"MODIFIED","object":{"metadata":{"name":"echo","resourceVersion":"3"}}}"#;
        let event: WatchEvent = serde_json::from_str(line).expect("should decode");
        assert_eq!(
            WatchEvent::Modified(json!({"metadata": {"name": "echo", "resourceVersion": "3"}})),
            event
        );

        let line = r#"{"type":"ERROR","object":{"status":"Failure","code":410,"reason":"Expired"}}"#;
        match serde_json::from_str::<WatchEvent>(line).expect("should decode") {
            WatchEvent::Error(err) => assert_eq!(410, err.code),
            other => panic!("expected error event, got: {:?}", other),
        }
    }
}
