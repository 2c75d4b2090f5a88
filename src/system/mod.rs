//! System requirements validation.
//!
//! Preflight checks run before any namespace work: kernel version, effective
//! root, and namespace support. Failing fast here beats a half-built sandbox.

mod requirements;

pub use requirements::{
    check_all, check_kernel_version, check_namespace_support, check_root, SystemRequirements,
    MIN_KERNEL_VERSION,
};
