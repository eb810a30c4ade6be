//! In-memory stand-ins for the api server and the resolvers, for tests.
//!
//! `MemoryStore` behaves like the api server where it matters to this crate: every write
//! bumps a global resourceVersion, a replace with a stale resourceVersion is a conflict,
//! and watches replay every change made after the version they start from.
use crate::error::ReconcileError;
use crate::k8s_types::K8sType;
use crate::resolve::{
    ProfileDescriptor, ProfileResolver, ResolvedSecrets, SecretDescriptor, SecretResolver,
};
use crate::resource::{K8sResource, ObjectId, ObjectIdRef};
use crate::store::{ListMeta, ObjectList, ResourceStore, StoreError, WatchEvent, WatchStream};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

type StoreKey = (String, ObjectId);

fn type_key(k8s_type: &K8sType) -> String {
    k8s_type.to_string()
}

#[derive(Debug, Clone)]
struct Change {
    version: u64,
    type_key: String,
    namespace: String,
    event: WatchEvent,
}

struct Watcher {
    type_key: String,
    namespace: Option<String>,
    label_selector: Option<String>,
    sender: UnboundedSender<Result<WatchEvent, StoreError>>,
}

impl Watcher {
    fn wants(&self, change: &Change) -> bool {
        self.type_key == change.type_key
            && self
                .namespace
                .as_deref()
                .map(|ns| ns == change.namespace)
                .unwrap_or(true)
            && event_matches(&change.event, self.label_selector.as_deref())
    }
}

#[derive(Default)]
struct StoreState {
    version: u64,
    objects: BTreeMap<StoreKey, Value>,
    history: Vec<Change>,
    watchers: Vec<Watcher>,
    writes: HashMap<String, usize>,
}

impl StoreState {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn record(&mut self, k8s_type: &K8sType, namespace: &str, event: WatchEvent) {
        let change = Change {
            version: self.version,
            type_key: type_key(k8s_type),
            namespace: namespace.to_owned(),
            event,
        };
        self.watchers.retain(|watcher| {
            !watcher.wants(&change) || watcher.sender.send(Ok(change.event.clone())).is_ok()
        });
        self.history.push(change);
    }

    fn count_write(&mut self, k8s_type: &K8sType) {
        *self.writes.entry(type_key(k8s_type)).or_insert(0) += 1;
    }

    /// Stores the object under a fresh resourceVersion and notifies watchers
    fn store(&mut self, k8s_type: &K8sType, id: ObjectId, mut value: Value, added: bool) -> Value {
        let version = self.next_version();
        if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert("resourceVersion".to_owned(), Value::String(version));
        }
        let event = if added {
            WatchEvent::Added(value.clone())
        } else {
            WatchEvent::Modified(value.clone())
        };
        let namespace = id.namespace.clone();
        self.objects.insert((type_key(k8s_type), id), value.clone());
        self.record(k8s_type, &namespace, event);
        value
    }
}

fn object_id(value: &Value) -> Result<ObjectId, StoreError> {
    let name = value
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Upstream("metadata.name is required".to_owned()))?;
    let namespace = value
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or("");
    Ok(ObjectId::new(namespace, name))
}

/// Supports `key` and `key=value` terms separated by commas
fn matches_selector(value: &Value, selector: Option<&str>) -> bool {
    let selector = match selector {
        Some(s) => s,
        None => return true,
    };
    let labels = value.pointer("/metadata/labels");
    selector.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| {
        let (key, expected) = match term.find('=') {
            Some(idx) => (&term[..idx], Some(&term[(idx + 1)..])),
            None => (term, None),
        };
        let actual = labels.and_then(|l| l.get(key)).and_then(Value::as_str);
        match (actual, expected) {
            (Some(actual), Some(expected)) => actual == expected,
            (Some(_), None) => true,
            (None, _) => false,
        }
    })
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds or overwrites an object without any checks, as if someone else had written it
    pub fn insert(&self, k8s_type: &K8sType, value: Value) -> K8sResource {
        let id = object_id(&value).expect("seeded objects need a name");
        let mut state = self.state();
        let added = !state.objects.contains_key(&(type_key(k8s_type), id.clone()));
        let stored = state.store(k8s_type, id, value, added);
        K8sResource::from_value(stored).expect("stored objects are valid")
    }

    pub fn get_value(&self, k8s_type: &K8sType, id: ObjectIdRef<'_>) -> Option<Value> {
        self.state()
            .objects
            .get(&(type_key(k8s_type), id.to_owned()))
            .cloned()
    }

    /// Applies `modify` to a stored object and stores it under a new resourceVersion.
    /// Writers still holding the old version will get a conflict.
    pub fn modify<F: FnOnce(&mut Value)>(&self, k8s_type: &K8sType, id: ObjectIdRef<'_>, modify: F) {
        let mut state = self.state();
        let key = (type_key(k8s_type), id.to_owned());
        let mut value = state
            .objects
            .get(&key)
            .cloned()
            .unwrap_or_else(|| panic!("no {} named {}", k8s_type, id));
        modify(&mut value);
        state.store(k8s_type, key.1, value, false);
    }

    /// Number of successful creates and replaces of the given type, not counting `insert`
    /// and `modify`
    pub fn write_count(&self, k8s_type: &K8sType) -> usize {
        self.state()
            .writes
            .get(&type_key(k8s_type))
            .copied()
            .unwrap_or(0)
    }

    pub fn current_version(&self) -> u64 {
        self.state().version
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, k8s_type: &K8sType, id: ObjectIdRef<'_>) -> Result<K8sResource, StoreError> {
        let value = self
            .get_value(k8s_type, id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        K8sResource::from_value(value).map_err(|err| StoreError::Upstream(err.to_string()))
    }

    async fn create(&self, k8s_type: &K8sType, resource: &Value) -> Result<K8sResource, StoreError> {
        let id = object_id(resource)?;
        let mut state = self.state();
        if state.objects.contains_key(&(type_key(k8s_type), id.clone())) {
            return Err(StoreError::Conflict(format!("{} '{}' already exists", k8s_type, id)));
        }
        state.count_write(k8s_type);
        let stored = state.store(k8s_type, id, resource.clone(), true);
        K8sResource::from_value(stored).map_err(|err| StoreError::Upstream(err.to_string()))
    }

    async fn replace(
        &self,
        k8s_type: &K8sType,
        id: ObjectIdRef<'_>,
        resource: &Value,
    ) -> Result<K8sResource, StoreError> {
        let mut state = self.state();
        let key = (type_key(k8s_type), id.to_owned());
        let current_version = state
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let submitted = resource
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty());
        if let Some(submitted) = submitted {
            if Some(submitted) != current_version.as_deref() {
                return Err(StoreError::Conflict(format!(
                    "{} '{}' is at resourceVersion {:?}, not {}",
                    k8s_type, id, current_version, submitted
                )));
            }
        }

        state.count_write(k8s_type);
        let stored = state.store(k8s_type, key.1, resource.clone(), false);
        K8sResource::from_value(stored).map_err(|err| StoreError::Upstream(err.to_string()))
    }

    async fn list(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<ObjectList<Value>, StoreError> {
        let state = self.state();
        let key = type_key(k8s_type);
        let items = state
            .objects
            .iter()
            .filter(|((t, id), _)| *t == key && namespace.map(|ns| ns == id.namespace).unwrap_or(true))
            .filter(|(_, value)| matches_selector(value, label_selector))
            .map(|(_, value)| value.clone())
            .collect();
        Ok(ObjectList {
            metadata: ListMeta {
                resource_version: Some(state.version.to_string()),
            },
            items,
        })
    }

    async fn watch(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<WatchStream, StoreError> {
        let since = match resource_version {
            Some(v) => v
                .parse::<u64>()
                .map_err(|_| StoreError::Upstream(format!("invalid resourceVersion '{}'", v)))?,
            None => 0,
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        let watcher = Watcher {
            type_key: type_key(k8s_type),
            namespace: namespace.map(str::to_owned),
            label_selector: label_selector.map(str::to_owned),
            sender,
        };

        let mut state = self.state();
        for change in state.history.iter().filter(|c| c.version > since) {
            if watcher.wants(change) {
                let _ = watcher.sender.send(Ok(change.event.clone()));
            }
        }
        state.watchers.push(watcher);
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }
}

fn event_matches(event: &WatchEvent, selector: Option<&str>) -> bool {
    match event {
        WatchEvent::Added(v) | WatchEvent::Modified(v) | WatchEvent::Deleted(v) => {
            matches_selector(v, selector)
        }
        WatchEvent::Error(_) => true,
    }
}

/// Resolves secrets from a fixed set of descriptors
#[derive(Debug, Default, Clone)]
pub struct StaticSecrets(ResolvedSecrets);

impl StaticSecrets {
    pub fn new() -> StaticSecrets {
        StaticSecrets::default()
    }

    pub fn with(mut self, descriptor: SecretDescriptor) -> StaticSecrets {
        self.0.insert(descriptor.name.clone(), descriptor);
        self
    }
}

#[async_trait]
impl SecretResolver for StaticSecrets {
    async fn resolve(&self, _namespace: &str, names: &[String]) -> Result<ResolvedSecrets, ReconcileError> {
        Ok(names
            .iter()
            .filter_map(|name| self.0.get(name).map(|d| (name.clone(), d.clone())))
            .collect())
    }
}

/// Resolves profiles from a fixed set of descriptors, ignoring the namespace
#[derive(Debug, Default, Clone)]
pub struct StaticProfiles(BTreeMap<String, ProfileDescriptor>);

impl StaticProfiles {
    pub fn new() -> StaticProfiles {
        StaticProfiles::default()
    }

    pub fn with(mut self, profile: ProfileDescriptor) -> StaticProfiles {
        self.0.insert(profile.name.clone(), profile);
        self
    }
}

#[async_trait]
impl ProfileResolver for StaticProfiles {
    async fn resolve(&self, namespace: &str, name: &str) -> Result<ProfileDescriptor, ReconcileError> {
        self.0
            .get(name)
            .cloned()
            .ok_or_else(|| ReconcileError::not_found("Profile", format!("{}/{}", namespace, name)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types::apps::v1::StatefulSet;
    use futures::StreamExt;
    use serde_json::json;

    fn statefulset(name: &str) -> Value {
        json!({
            "metadata": { "name": name, "namespace": "openfaas-fn", "labels": { "faas_function": name } },
            "spec": { "replicas": 1 },
        })
    }

    #[test]
    fn stale_replace_is_a_conflict() {
        let store = MemoryStore::new();
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let created = store.create(StatefulSet, &statefulset("echo")).await.unwrap();
            let id = ObjectIdRef::new("openfaas-fn", "echo");
            store.modify(StatefulSet, id, |v| v["spec"]["replicas"] = json!(3));

            let err = store.replace(StatefulSet, id, created.as_ref()).await.unwrap_err();
            assert!(err.is_conflict());

            let current = store.get(StatefulSet, id).await.unwrap();
            store.replace(StatefulSet, id, current.as_ref()).await.unwrap();
            assert_eq!(2, store.write_count(StatefulSet));
        });
    }

    #[test]
    fn watch_replays_changes_after_the_version() {
        let store = MemoryStore::new();
        store.insert(StatefulSet, statefulset("one"));
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let list = store.list(StatefulSet, Some("openfaas-fn"), Some("faas_function")).await.unwrap();
            assert_eq!(1, list.items.len());

            store.insert(StatefulSet, statefulset("two"));
            let mut events = store
                .watch(StatefulSet, None, list.metadata.resource_version.as_deref(), None)
                .await
                .unwrap();
            match events.next().await.unwrap().unwrap() {
                WatchEvent::Added(v) => assert_eq!(json!("two"), v["metadata"]["name"]),
                other => panic!("expected ADDED, got: {:?}", other),
            }

            store.modify(StatefulSet, ObjectIdRef::new("openfaas-fn", "one"), |_| {});
            match events.next().await.unwrap().unwrap() {
                WatchEvent::Modified(v) => assert_eq!(json!("one"), v["metadata"]["name"]),
                other => panic!("expected MODIFIED, got: {:?}", other),
            }
        });
    }
}
