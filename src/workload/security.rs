//! Container security settings: the run-as user and the read-only root filesystem.
//!
//! Both operations can be applied any number of times and produce the same workload.
use crate::workload::{SecurityContext, Volume, VolumeMount, Workload};

/// Pinned when the non-root policy is enabled. Above the ranges commonly reserved on hosts.
pub const NON_ROOT_USER_ID: i64 = 12000;
pub const TEMP_VOLUME_NAME: &str = "temp";
pub const TEMP_MOUNT_PATH: &str = "/tmp";

fn security_context(workload: &mut Workload) -> Option<&mut SecurityContext> {
    let container = workload.container_mut()?;
    Some(container.security_context.get_or_insert_with(SecurityContext::default))
}

/// Pins the run-as user when `set_non_root_user` is on, and otherwise clears it so the
/// image's own user applies.
pub fn configure_user_id(mut workload: Workload, set_non_root_user: bool) -> Workload {
    if let Some(context) = security_context(&mut workload) {
        context.run_as_user = if set_non_root_user {
            Some(NON_ROOT_USER_ID)
        } else {
            None
        };
    }
    workload
}

/// Sets the read-only root filesystem flag. A writable `temp` volume is mounted at `/tmp`
/// iff the flag is on, and any existing `temp` volumes or mounts are dropped first.
pub fn configure_read_only_root_filesystem(mut workload: Workload, read_only: bool) -> Workload {
    if let Some(context) = security_context(&mut workload) {
        context.read_only_root_filesystem = Some(read_only);
    }

    let pod_spec = workload.pod_spec_mut();
    pod_spec.volumes.retain(|volume| volume.name != TEMP_VOLUME_NAME);
    if read_only {
        pod_spec.volumes.push(Volume::empty_dir(TEMP_VOLUME_NAME));
    }

    if let Some(container) = workload.container_mut() {
        container
            .volume_mounts
            .retain(|mount| mount.name != TEMP_VOLUME_NAME);
        if read_only {
            container.volume_mounts.push(VolumeMount {
                name: TEMP_VOLUME_NAME.to_owned(),
                mount_path: TEMP_MOUNT_PATH.to_owned(),
                read_only: false,
                ..Default::default()
            });
        }
    }
    workload
}
