//! System requirements checking implementation.

use std::path::Path;

use nix::unistd::geteuid;

use crate::error::{Result, SystemRequirementsError};
use crate::sandbox::{NsKind, NS_KINDS};

/// Minimum required kernel version (major, minor).
pub const MIN_KERNEL_VERSION: (u32, u32) = (5, 4);

/// Results of all system requirements checks.
#[derive(Debug, Clone)]
pub struct SystemRequirements {
    /// Kernel version string (e.g., "6.7.0")
    pub kernel_version: String,
    /// Parsed kernel major version
    pub kernel_major: u32,
    /// Parsed kernel minor version
    pub kernel_minor: u32,
    /// Whether the process runs with effective uid 0
    pub running_as_root: bool,
    /// Namespace kinds the kernel exposes under /proc/self/ns
    pub namespaces: Vec<NsKind>,
}

/// Check all system requirements and return detailed results.
///
/// Returns `Ok(SystemRequirements)` with all check results, or
/// `Err` with the first failing requirement.
pub fn check_all() -> Result<SystemRequirements> {
    let (kernel_version, kernel_major, kernel_minor) = check_kernel_version()?;
    check_root()?;
    let namespaces = check_namespace_support()?;

    Ok(SystemRequirements {
        kernel_version,
        kernel_major,
        kernel_minor,
        running_as_root: true,
        namespaces,
    })
}

/// Check kernel version meets [`MIN_KERNEL_VERSION`].
///
/// # Errors
///
/// Returns error if the kernel version cannot be read or is below minimum.
pub fn check_kernel_version() -> Result<(String, u32, u32)> {
    let uname = nix::sys::utsname::uname().map_err(|e| SystemRequirementsError::ReadFailed {
        context: String::from("uname syscall"),
        source: std::io::Error::from_raw_os_error(e as i32),
    })?;

    let release = uname.release().to_string_lossy().to_string();
    let (major, minor) = parse_kernel_version(&release)?;

    if major < MIN_KERNEL_VERSION.0
        || (major == MIN_KERNEL_VERSION.0 && minor < MIN_KERNEL_VERSION.1)
    {
        return Err(SystemRequirementsError::KernelTooOld {
            found: release,
            required: format!("{}.{}", MIN_KERNEL_VERSION.0, MIN_KERNEL_VERSION.1),
        }
        .into());
    }

    Ok((release, major, minor))
}

/// Parse kernel version string into (major, minor).
fn parse_kernel_version(version: &str) -> Result<(u32, u32)> {
    let invalid = || SystemRequirementsError::ReadFailed {
        context: format!("Failed to parse kernel version: {version}"),
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Invalid kernel version format",
        ),
    };

    let mut parts = version.split('.');
    let major = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)?;
    let minor = parts
        .next()
        .and_then(|s| {
            // Trailing tags like "14-arch1" stop at the first non-digit.
            let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .ok_or_else(invalid)?;

    Ok((major, minor))
}

/// Namespace creation, mounts, and pivot_root all need CAP_SYS_ADMIN;
/// rootless operation is out of scope.
pub fn check_root() -> Result<()> {
    let euid = geteuid();
    if !euid.is_root() {
        return Err(SystemRequirementsError::NotRoot {
            euid: euid.as_raw(),
        }
        .into());
    }
    Ok(())
}

/// Verify the kernel exposes every namespace kind the sandbox isolates.
pub fn check_namespace_support() -> Result<Vec<NsKind>> {
    for kind in NS_KINDS {
        let path = format!("/proc/self/ns/{}", kind.name());
        if !Path::new(&path).exists() {
            return Err(SystemRequirementsError::NamespaceUnavailable { kind }.into());
        }
    }
    Ok(NS_KINDS.to_vec())
}
