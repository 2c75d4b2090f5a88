//! Configuration for the kiosk sandbox.

use std::path::PathBuf;

/// Configuration for the namespace sandbox.
///
/// Use the builder methods to customize the sandbox behavior.
///
/// # Example
///
/// ```
/// use webkiosk::sandbox::SandboxConfig;
///
/// let config = SandboxConfig::new("/run/webkiosk/mnt", "/run/webkiosk/ns")
///     .with_hostname("display-1")
///     .with_image("/var/lib/webkiosk/rootfs.squashfs");
/// ```
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Hostname for the sandbox (UTS namespace).
    pub hostname: String,

    /// Mount point that becomes the sandbox root after pivot.
    pub mount_point: PathBuf,

    /// Optional read-only root filesystem image. When absent, `mount_point`
    /// is assumed to already contain a root tree and is bind-mounted onto
    /// itself so pivot_root accepts it.
    pub image_path: Option<PathBuf>,

    /// Filesystem type of `image_path`.
    pub image_fstype: String,

    /// Directory holding the namespace pin files.
    pub ns_dir: PathBuf,
}

/// Default filesystem type for root images.
pub const DEFAULT_IMAGE_FSTYPE: &str = "squashfs";

/// Default sandbox hostname.
pub const DEFAULT_HOSTNAME: &str = "webkiosk";

impl SandboxConfig {
    /// Creates a configuration with the given mount point and pin directory.
    #[must_use]
    pub fn new(mount_point: impl Into<PathBuf>, ns_dir: impl Into<PathBuf>) -> Self {
        Self {
            hostname: String::from(DEFAULT_HOSTNAME),
            mount_point: mount_point.into(),
            image_path: None,
            image_fstype: String::from(DEFAULT_IMAGE_FSTYPE),
            ns_dir: ns_dir.into(),
        }
    }

    /// Sets the sandbox hostname (UTS namespace).
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Sets the root filesystem image to mount read-only.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<PathBuf>) -> Self {
        self.image_path = Some(image.into());
        self
    }

    /// Sets the filesystem type of the root image.
    #[must_use]
    pub fn with_image_fstype(mut self, fstype: impl Into<String>) -> Self {
        self.image_fstype = fstype.into();
        self
    }

    /// Resolves `mount_point` and `ns_dir` to absolute paths.
    ///
    /// Mount syscalls resolve relative paths against the calling thread's
    /// working directory, which changes across the pivot; absolute paths are
    /// required before any namespace work starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the current working directory cannot be read.
    pub fn absolutize(mut self) -> std::io::Result<Self> {
        self.mount_point = std::path::absolute(&self.mount_point)?;
        self.ns_dir = std::path::absolute(&self.ns_dir)?;
        if let Some(image) = self.image_path.take() {
            self.image_path = Some(std::path::absolute(image)?);
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::new("/run/webkiosk/mnt", "/run/webkiosk/ns");
        assert_eq!(config.hostname, DEFAULT_HOSTNAME);
        assert_eq!(config.image_fstype, DEFAULT_IMAGE_FSTYPE);
        assert!(config.image_path.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let config = SandboxConfig::new("/mnt", "/ns")
            .with_hostname("display-7")
            .with_image("/images/root.erofs")
            .with_image_fstype("erofs");

        assert_eq!(config.hostname, "display-7");
        assert_eq!(config.image_path, Some(PathBuf::from("/images/root.erofs")));
        assert_eq!(config.image_fstype, "erofs");
    }

    #[test]
    fn test_absolutize_keeps_absolute_paths() {
        let config = SandboxConfig::new("/run/webkiosk/mnt", "/run/webkiosk/ns")
            .absolutize()
            .unwrap();
        assert_eq!(config.mount_point, PathBuf::from("/run/webkiosk/mnt"));
        assert_eq!(config.ns_dir, PathBuf::from("/run/webkiosk/ns"));
    }

    #[test]
    fn test_absolutize_resolves_relative_paths() {
        let config = SandboxConfig::new("mnt", "ns").absolutize().unwrap();
        assert!(config.mount_point.is_absolute());
        assert!(config.ns_dir.is_absolute());
    }
}
