//! Profiles are named pod-spec fragments that a function opts into through the
//! `com.openfaas.profile` annotation.
//!
//! `apply` merges a fragment into the workload and `remove` takes the same fragment out
//! again, leaving anything the fragment didn't contribute alone.
use crate::function::{StringMap, ANNOTATION_PROFILES};
use crate::resolve::ProfileDescriptor;
use crate::workload::Workload;

use serde_json::Value;

/// Profile names in the order they are declared, without duplicates
pub fn profile_names(annotations: &StringMap) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let declared = annotations
        .get(ANNOTATION_PROFILES)
        .map(String::as_str)
        .unwrap_or("");
    for name in declared.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_owned());
        }
    }
    names
}

/// Names declared in the `previous` annotations that are no longer declared in `current`.
/// `previous` has to be the annotations of the workload as it was fetched, before any
/// new annotations were rendered onto it.
pub fn profiles_to_remove(current: &StringMap, previous: &StringMap) -> Vec<String> {
    let keep = profile_names(current);
    profile_names(previous)
        .into_iter()
        .filter(|name| !keep.contains(name))
        .collect()
}

pub fn apply(mut workload: Workload, profile: &ProfileDescriptor) -> Workload {
    let fragment = &profile.spec;
    let pod_spec = workload.pod_spec_mut();

    if let Some(runtime_class) = fragment.runtime_class_name.as_ref() {
        pod_spec.runtime_class_name = Some(runtime_class.clone());
    }

    for toleration in fragment.tolerations.iter() {
        if !pod_spec.tolerations.contains(toleration) {
            pod_spec.tolerations.push(toleration.clone());
        }
    }

    if let Some(affinity) = fragment.affinity.as_ref() {
        let target = pod_spec
            .affinity
            .get_or_insert_with(|| Value::Object(Default::default()));
        merge_json(target, affinity);
    }

    if let Some(context) = fragment.pod_security_context.as_ref() {
        let target = pod_spec
            .security_context
            .get_or_insert_with(|| Value::Object(Default::default()));
        merge_json(target, context);
    }

    for volume in fragment.volumes.iter() {
        match pod_spec.volumes.iter_mut().find(|v| v.name == volume.name) {
            Some(existing) => *existing = volume.clone(),
            None => pod_spec.volumes.push(volume.clone()),
        }
    }

    workload
}

pub fn remove(mut workload: Workload, profile: &ProfileDescriptor) -> Workload {
    let fragment = &profile.spec;
    let pod_spec = workload.pod_spec_mut();

    if fragment.runtime_class_name.is_some() && pod_spec.runtime_class_name == fragment.runtime_class_name {
        pod_spec.runtime_class_name = None;
    }

    pod_spec
        .tolerations
        .retain(|toleration| !fragment.tolerations.contains(toleration));

    if let Some(affinity) = fragment.affinity.as_ref() {
        pod_spec.affinity = subtract_optional(pod_spec.affinity.take(), affinity);
    }
    if let Some(context) = fragment.pod_security_context.as_ref() {
        pod_spec.security_context = subtract_optional(pod_spec.security_context.take(), context);
    }

    // by name, like apply. The server fills defaults into stored volumes.
    pod_spec
        .volumes
        .retain(|volume| !fragment.volumes.iter().any(|v| v.name == volume.name));

    workload
}

fn subtract_optional(target: Option<Value>, fragment: &Value) -> Option<Value> {
    let mut target = target?;
    if subtract_json(&mut target, fragment) {
        None
    } else {
        Some(target)
    }
}

/// Objects merge key by key, arrays gain the elements they don't already have, and
/// anything else is replaced.
pub fn merge_json(target: &mut Value, fragment: &Value) {
    match (target, fragment) {
        (Value::Object(target), Value::Object(fragment)) => {
            for (key, value) in fragment.iter() {
                match target.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(fragment)) => {
            for value in fragment.iter() {
                if !target.contains(value) {
                    target.push(value.clone());
                }
            }
        }
        (target, fragment) => *target = fragment.clone(),
    }
}

/// The reverse of `merge_json`. Returns true when nothing is left of `target`.
pub fn subtract_json(target: &mut Value, fragment: &Value) -> bool {
    match (&mut *target, fragment) {
        (Value::Object(object), Value::Object(fragment)) => {
            for (key, value) in fragment.iter() {
                let emptied = match object.get_mut(key) {
                    Some(existing) => subtract_json(existing, value),
                    None => false,
                };
                if emptied {
                    object.remove(key);
                }
            }
            object.is_empty()
        }
        (Value::Array(array), Value::Array(fragment)) => {
            array.retain(|value| !fragment.contains(value));
            array.is_empty()
        }
        (existing, fragment) => *existing == *fragment,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resolve::ProfileSpec;
    use crate::workload::{Container, Toleration, Volume};
    use serde_json::json;

    fn annotations(profiles: &str) -> StringMap {
        let mut annotations = StringMap::new();
        annotations.insert(ANNOTATION_PROFILES.to_owned(), profiles.to_owned());
        annotations
    }

    fn gpu_toleration() -> Toleration {
        Toleration {
            key: Some("gpu".to_owned()),
            operator: Some("Exists".to_owned()),
            effect: Some("NoSchedule".to_owned()),
            ..Default::default()
        }
    }

    fn gpu_profile() -> ProfileDescriptor {
        ProfileDescriptor::new(
            "gpu",
            ProfileSpec {
                runtime_class_name: Some("nvidia".to_owned()),
                tolerations: vec![gpu_toleration()],
                affinity: Some(json!({
                    "nodeAffinity": {
                        "requiredDuringSchedulingIgnoredDuringExecution": {
                            "nodeSelectorTerms": [
                                { "matchExpressions": [{ "key": "gpu", "operator": "Exists" }] }
                            ]
                        }
                    }
                })),
                pod_security_context: None,
                volumes: vec![Volume::empty_dir("cuda-cache")],
            },
        )
    }

    fn workload() -> Workload {
        let mut workload = Workload::default();
        let pod_spec = workload.pod_spec_mut();
        pod_spec.containers.push(Container {
            name: "echo".to_owned(),
            image: "echo:1".to_owned(),
            ..Default::default()
        });
        pod_spec.tolerations.push(Toleration {
            key: Some("dedicated".to_owned()),
            value: Some("functions".to_owned()),
            ..Default::default()
        });
        pod_spec.affinity = Some(json!({
            "podAntiAffinity": { "preferredDuringSchedulingIgnoredDuringExecution": [] }
        }));
        pod_spec.volumes.push(Volume::empty_dir("temp"));
        workload
    }

    #[test]
    fn profile_names_are_split_trimmed_and_deduplicated() {
        assert_eq!(vec!["gpu", "spot"], profile_names(&annotations(" gpu, spot,,gpu ")));
        assert!(profile_names(&StringMap::new()).is_empty());
    }

    #[test]
    fn profiles_to_remove_compares_against_previous_annotations() {
        let previous = annotations("gpu,spot");
        let current = annotations("spot");
        assert_eq!(vec!["gpu"], profiles_to_remove(&current, &previous));
        assert!(profiles_to_remove(&current, &current).is_empty());
        assert_eq!(vec!["gpu", "spot"], profiles_to_remove(&StringMap::new(), &previous));
    }

    #[test]
    fn apply_is_additive_and_idempotent() {
        let once = apply(workload(), &gpu_profile());
        let twice = apply(once.clone(), &gpu_profile());
        assert_eq!(once, twice);

        let pod_spec = once.pod_spec();
        assert_eq!(Some("nvidia"), pod_spec.runtime_class_name.as_deref());
        assert_eq!(2, pod_spec.tolerations.len());
        assert_eq!(2, pod_spec.volumes.len());
        let affinity = pod_spec.affinity.as_ref().unwrap();
        assert!(affinity.get("podAntiAffinity").is_some());
        assert!(affinity.get("nodeAffinity").is_some());
    }

    #[test]
    fn remove_reverses_apply() {
        let original = workload();
        let applied = apply(original.clone(), &gpu_profile());
        let removed = remove(applied, &gpu_profile());
        assert_eq!(original, removed);
    }

    #[test]
    fn remove_drops_profile_volumes_with_server_defaults() {
        let mut applied = apply(workload(), &gpu_profile());
        let stored = applied
            .pod_spec_mut()
            .volumes
            .iter_mut()
            .find(|v| v.name == "cuda-cache")
            .unwrap();
        stored.empty_dir = Some(json!({ "sizeLimit": "1Gi" }).as_object().unwrap().clone());

        let removed = remove(applied, &gpu_profile());
        let names: Vec<&str> = removed.pod_spec().volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(vec!["temp"], names);
    }

    #[test]
    fn merge_and_subtract_json() {
        let mut target = json!({ "a": { "b": [1, 2] }, "c": true });
        merge_json(&mut target, &json!({ "a": { "b": [2, 3], "d": "x" } }));
        assert_eq!(json!({ "a": { "b": [1, 2, 3], "d": "x" }, "c": true }), target);

        let emptied = subtract_json(&mut target, &json!({ "a": { "b": [3], "d": "x" } }));
        assert!(!emptied);
        assert_eq!(json!({ "a": { "b": [1, 2] }, "c": true }), target);

        let mut only = json!({ "x": [1] });
        assert!(subtract_json(&mut only, &json!({ "x": [1] })));
    }
}
