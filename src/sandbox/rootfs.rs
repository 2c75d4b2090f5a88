//! Root filesystem pivot and population for the sandbox mount namespace.
//!
//! Everything in this module runs on the namespace-creation thread, after
//! `unshare(CLONE_NEWNS)` and before the namespaces are pinned. The sequence
//! is order-sensitive:
//!
//! 1. Make `/` recursive-private so nothing leaks back to the host.
//! 2. Mount the read-only image at the new root (or bind the directory onto
//!    itself; `pivot_root` requires the new root to be a mount point).
//! 3. `pivot_root(new_root, new_root/mnt)`, chdir to `/`, detach the old
//!    root at `/mnt`.
//! 4. Populate `/proc`, `/dev`, `/sys`, `/tmp`, `/run`.
//!
//! All mounts use `MS_NOSUID | MS_RELATIME`; `/dev` additionally omits
//! `MS_NODEV` and `/tmp` omits `MS_NOEXEC`.

use std::path::Path;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chdir, pivot_root};
use tracing::{debug, instrument, trace};

use crate::error::MountError;
use crate::sandbox::SandboxConfig;

/// Where the old root lands during the pivot, relative to the new root.
/// The directory must exist inside the image.
const PIVOT_OLD: &str = "/mnt";

const DEFAULT_MOUNT_FLAGS: MsFlags = MsFlags::MS_NOSUID
    .union(MsFlags::MS_RELATIME)
    .union(MsFlags::MS_NODEV)
    .union(MsFlags::MS_NOEXEC);

/// `/dev` must stay usable for device nodes.
const DEV_MOUNT_FLAGS: MsFlags = MsFlags::MS_NOSUID
    .union(MsFlags::MS_RELATIME)
    .union(MsFlags::MS_NOEXEC);

/// The browser maps executable shared memory under `/tmp`.
const TMP_MOUNT_FLAGS: MsFlags = MsFlags::MS_NOSUID
    .union(MsFlags::MS_RELATIME)
    .union(MsFlags::MS_NODEV);

/// Creates a plain bind mount of `src` onto `dst`.
pub(crate) fn bind_mount(src: &Path, dst: &Path) -> Result<(), MountError> {
    mount(Some(src), dst, Some("none"), MsFlags::MS_BIND, None::<&str>).map_err(|e| {
        MountError::BindMount {
            source_path: src.display().to_string(),
            target: dst.display().to_string(),
            source: e,
        }
    })
}

/// Pivots into the configured root and populates the pseudo-filesystems.
///
/// Must be called on the freshly unshared mount-namespace thread; the
/// thread's view of the filesystem is irreversibly replaced.
///
/// # Errors
///
/// Any failure aborts sandbox creation; nothing is rolled back because the
/// half-built state is confined to the dying namespace.
#[instrument(skip_all, fields(new_root = %config.mount_point.display()))]
pub(crate) fn pivot_and_populate(config: &SandboxConfig) -> Result<(), MountError> {
    // Detach from host propagation before any other mount activity.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| MountError::PrivateRoot { source: e })?;

    let new_root = &config.mount_point;

    if let Some(image) = &config.image_path {
        std::fs::create_dir_all(new_root).map_err(|e| MountError::Mkdir {
            path: new_root.display().to_string(),
            source: e,
        })?;

        debug!(image = %image.display(), fstype = %config.image_fstype, "Mounting root image");
        mount(
            Some(image.as_path()),
            new_root,
            Some(config.image_fstype.as_str()),
            MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| MountError::ImageMount {
            image: image.display().to_string(),
            target: new_root.display().to_string(),
            fstype: config.image_fstype.clone(),
            source: e,
        })?;
    } else {
        trace!("No image configured, binding mount point onto itself");
        bind_mount(new_root, new_root)?;
    }

    let put_old = new_root.join(PIVOT_OLD.trim_start_matches('/'));
    pivot_root(new_root, &put_old).map_err(|e| MountError::PivotRoot {
        new_root: new_root.display().to_string(),
        put_old: put_old.display().to_string(),
        source: e,
    })?;

    chdir("/").map_err(|e| MountError::Chdir {
        path: String::from("/"),
        source: e,
    })?;

    umount2(PIVOT_OLD, MntFlags::MNT_DETACH).map_err(|e| MountError::Unmount {
        target: String::from(PIVOT_OLD),
        source: e,
    })?;

    populate_pseudo_fs()?;

    debug!("Rootfs pivot complete");
    Ok(())
}

/// Mounts the pseudo-filesystems a freshly pivoted root needs.
fn populate_pseudo_fs() -> Result<(), MountError> {
    mount_pseudo("proc", "/proc", "proc", DEFAULT_MOUNT_FLAGS)?;
    mount_pseudo("dev", "/dev", "devtmpfs", DEV_MOUNT_FLAGS)?;
    mount_pseudo("sys", "/sys", "sysfs", DEFAULT_MOUNT_FLAGS)?;
    mount_pseudo("tmp", "/tmp", "tmpfs", TMP_MOUNT_FLAGS)?;
    mount_pseudo("run", "/run", "tmpfs", DEFAULT_MOUNT_FLAGS)?;
    Ok(())
}

fn mount_pseudo(
    source: &str,
    target: &str,
    fstype: &str,
    flags: MsFlags,
) -> Result<(), MountError> {
    trace!(target, fstype, "Mounting pseudo-filesystem");
    mount(Some(source), target, Some(fstype), flags, None::<&str>).map_err(|e| {
        MountError::PseudoFs {
            target: String::from(target),
            fstype: String::from(fstype),
            source: e,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags_cover_the_hardening_set() {
        assert!(DEFAULT_MOUNT_FLAGS.contains(MsFlags::MS_NOSUID));
        assert!(DEFAULT_MOUNT_FLAGS.contains(MsFlags::MS_NODEV));
        assert!(DEFAULT_MOUNT_FLAGS.contains(MsFlags::MS_NOEXEC));
        assert!(DEFAULT_MOUNT_FLAGS.contains(MsFlags::MS_RELATIME));
    }

    #[test]
    fn test_dev_allows_device_nodes() {
        assert!(!DEV_MOUNT_FLAGS.contains(MsFlags::MS_NODEV));
        assert!(DEV_MOUNT_FLAGS.contains(MsFlags::MS_NOSUID));
    }

    #[test]
    fn test_tmp_allows_exec() {
        assert!(!TMP_MOUNT_FLAGS.contains(MsFlags::MS_NOEXEC));
        assert!(TMP_MOUNT_FLAGS.contains(MsFlags::MS_NODEV));
    }

    // Actual pivot tests require root and a prepared rootfs; they live in
    // tests/sandbox.rs behind #[ignore].
}
