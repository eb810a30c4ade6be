//! Makes the secrets a function asks for available to its container.
//!
//! Registry credentials go into `imagePullSecrets`. Every other secret becomes one source
//! of a single projected volume named `<service>-projected-secrets`, so each key shows up
//! as a file under the secrets mount path.
use crate::error::ReconcileError;
use crate::resolve::{ResolvedSecrets, SecretKind};
use crate::workload::{
    KeyToPath, LocalObjectReference, ProjectedVolumeSource, SecretProjection, Volume, VolumeMount,
    VolumeProjection, Workload,
};
use crate::resource::JsonObject;

use std::collections::BTreeSet;

pub fn projected_volume_name(service: &str) -> String {
    format!("{}-projected-secrets", service)
}

/// Replaces whatever secret wiring the workload had with exactly what `requested` asks
/// for. Every requested name must be in `resolved`, otherwise nothing is changed and a
/// `NotFound` error is returned.
///
/// The projected volume and its mount exist iff `requested` is non-empty. Duplicate volumes
/// or mounts left behind by earlier writes are all removed.
pub fn project(
    mut workload: Workload,
    service: &str,
    requested: &[String],
    resolved: &ResolvedSecrets,
    mount_path: &str,
) -> Result<Workload, ReconcileError> {
    let requested: BTreeSet<&str> = requested.iter().map(String::as_str).collect();
    let mut descriptors = Vec::with_capacity(requested.len());
    for name in requested.iter() {
        let descriptor = resolved
            .get(*name)
            .ok_or_else(|| ReconcileError::not_found("Secret", *name))?;
        descriptors.push(descriptor);
    }

    let volume_name = projected_volume_name(service);

    let pod_spec = workload.pod_spec_mut();
    pod_spec.image_pull_secrets = descriptors
        .iter()
        .filter(|d| d.kind == SecretKind::Pull)
        .map(|d| LocalObjectReference {
            name: d.name.clone(),
        })
        .collect();
    pod_spec.volumes.retain(|volume| volume.name != volume_name);

    if !requested.is_empty() {
        let sources = descriptors
            .iter()
            .filter(|d| d.kind == SecretKind::Generic)
            .map(|d| VolumeProjection {
                secret: Some(SecretProjection {
                    name: d.name.clone(),
                    items: d
                        .keys
                        .iter()
                        .map(|key| KeyToPath {
                            key: key.clone(),
                            path: key.clone(),
                            mode: None,
                        })
                        .collect(),
                    optional: None,
                }),
                extra: JsonObject::new(),
            })
            .collect();
        pod_spec.volumes.push(Volume {
            name: volume_name.clone(),
            projected: Some(ProjectedVolumeSource {
                sources,
                default_mode: None,
            }),
            ..Default::default()
        });
    }

    if let Some(container) = workload.container_mut() {
        container.volume_mounts.retain(|mount| mount.name != volume_name);
        if !requested.is_empty() {
            container.volume_mounts.push(VolumeMount {
                name: volume_name,
                mount_path: mount_path.to_owned(),
                read_only: true,
                ..Default::default()
            });
        }
    }

    Ok(workload)
}

/// The secret names a workload currently references, sorted and without duplicates
pub fn read_function_secrets(workload: &Workload, service: &str) -> Vec<String> {
    let volume_name = projected_volume_name(service);
    let pod_spec = workload.pod_spec();

    let mut names: BTreeSet<&str> = pod_spec
        .image_pull_secrets
        .iter()
        .map(|reference| reference.name.as_str())
        .collect();

    let projected = pod_spec
        .volumes
        .iter()
        .filter(|volume| volume.name == volume_name)
        .filter_map(|volume| volume.projected.as_ref());
    for source in projected.flat_map(|p| p.sources.iter()) {
        if let Some(secret) = source.secret.as_ref() {
            names.insert(secret.name.as_str());
        }
    }

    names.into_iter().map(str::to_owned).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resolve::SecretDescriptor;
    use crate::workload::Container;

    const MOUNT_PATH: &str = "/var/openfaas/secrets";

    fn empty_workload() -> Workload {
        let mut workload = Workload::default();
        workload.pod_spec_mut().containers.push(Container {
            name: "testfunc".to_owned(),
            image: "alpine:latest".to_owned(),
            ..Default::default()
        });
        workload
    }

    fn cluster_secrets() -> ResolvedSecrets {
        let mut secrets = ResolvedSecrets::new();
        secrets.insert("pullsecret".to_owned(), SecretDescriptor::pull("pullsecret"));
        secrets.insert(
            "testsecret".to_owned(),
            SecretDescriptor::generic("testsecret", vec!["filename"]),
        );
        secrets
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn assert_single_projection(workload: &Workload) {
        let volume_name = "testfunc-projected-secrets";
        assert_eq!(1, workload.pod_spec().volumes.len());
        assert_eq!(1, workload.volume_count(volume_name));
        assert_eq!(1, workload.mount_count(volume_name));

        let mount = &workload.container().unwrap().volume_mounts[0];
        assert_eq!(MOUNT_PATH, mount.mount_path);
        assert!(mount.read_only);

        let projected = workload.pod_spec().volumes[0].projected.as_ref().unwrap();
        assert_eq!(1, projected.sources.len());
        let secret = projected.sources[0].secret.as_ref().unwrap();
        assert_eq!("testsecret", secret.name);
        assert_eq!("filename", secret.items[0].key);
        assert_eq!("filename", secret.items[0].path);

        assert_eq!(
            vec![LocalObjectReference { name: "pullsecret".to_owned() }],
            workload.pod_spec().image_pull_secrets
        );
    }

    fn assert_no_projection(workload: &Workload) {
        assert!(workload.pod_spec().volumes.is_empty());
        assert!(workload.container().unwrap().volume_mounts.is_empty());
    }

    #[test]
    fn adds_projected_volume_for_requested_secrets() {
        let requested = names(&["pullsecret", "testsecret"]);
        let workload = project(empty_workload(), "testfunc", &requested, &cluster_secrets(), MOUNT_PATH).unwrap();
        assert_single_projection(&workload);
    }

    #[test]
    fn projecting_twice_does_not_duplicate() {
        let requested = names(&["pullsecret", "testsecret"]);
        let once = project(empty_workload(), "testfunc", &requested, &cluster_secrets(), MOUNT_PATH).unwrap();
        let twice = project(once.clone(), "testfunc", &requested, &cluster_secrets(), MOUNT_PATH).unwrap();
        assert_single_projection(&twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_or_missing_request_removes_all_copies() {
        let volume_name = "testfunc-projected-secrets";
        let mut corrupted = empty_workload();
        for _ in 0..2 {
            corrupted.pod_spec_mut().volumes.push(Volume {
                name: volume_name.to_owned(),
                ..Default::default()
            });
            corrupted.container_mut().unwrap().volume_mounts.push(VolumeMount {
                name: volume_name.to_owned(),
                ..Default::default()
            });
        }

        let cleaned = project(corrupted, "testfunc", &[], &cluster_secrets(), MOUNT_PATH).unwrap();
        assert_no_projection(&cleaned);
        assert!(cleaned.pod_spec().image_pull_secrets.is_empty());
    }

    #[test]
    fn removing_all_secrets_clears_previous_projection() {
        let requested = names(&["pullsecret", "testsecret"]);
        let with = project(empty_workload(), "testfunc", &requested, &cluster_secrets(), MOUNT_PATH).unwrap();
        let without = project(with, "testfunc", &[], &cluster_secrets(), MOUNT_PATH).unwrap();
        assert_no_projection(&without);
    }

    #[test]
    fn missing_secret_is_not_found() {
        let requested = names(&["testsecret", "does-not-exist"]);
        let before = project(empty_workload(), "testfunc", &names(&["testsecret"]), &cluster_secrets(), MOUNT_PATH).unwrap();
        let err = project(before, "testfunc", &requested, &cluster_secrets(), MOUNT_PATH).unwrap_err();
        match err {
            ReconcileError::NotFound { kind, name } => {
                assert_eq!("Secret", kind);
                assert_eq!("does-not-exist", name);
            }
            other => panic!("expected NotFound, got: {:?}", other),
        }
    }

    #[test]
    fn read_back_is_sorted_and_deduplicated() {
        let cases: &[(&[&str], &[&str])] = &[
            (&[], &[]),
            (&["pullsecret"], &["pullsecret"]),
            (&["testsecret"], &["testsecret"]),
            (&["testsecret", "pullsecret"], &["pullsecret", "testsecret"]),
            (&["testsecret", "pullsecret", "testsecret"], &["pullsecret", "testsecret"]),
        ];
        for (requested, expected) in cases {
            let workload = project(empty_workload(), "testfunc", &names(requested), &cluster_secrets(), MOUNT_PATH).unwrap();
            assert_eq!(names(expected), read_function_secrets(&workload, "testfunc"));
        }
    }
}
