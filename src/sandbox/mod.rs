//! Namespace sandbox construction for the kiosk browser.
//!
//! The sandbox consists of three pinned Linux namespaces (UTS, NET, MNT) and
//! a read-only root filesystem the browser is pivoted into. Creation happens
//! once at startup on a dedicated kernel thread; the supervisor and its
//! helpers re-enter the namespaces on demand via the pins.
//!
//! # Example
//!
//! ```no_run
//! use webkiosk::sandbox::{NamespaceSet, SandboxConfig};
//!
//! let config = SandboxConfig::new("/run/webkiosk/mnt", "/run/webkiosk/ns")
//!     .with_image("/var/lib/webkiosk/rootfs.squashfs");
//!
//! let sandbox = NamespaceSet::create(&config).unwrap();
//! let listener = sandbox
//!     .run_inside(|| std::net::TcpListener::bind("127.0.0.1:8443").map_err(Into::into))
//!     .unwrap();
//! # drop(listener);
//! sandbox.destroy();
//! ```

mod config;
mod namespaces;
pub(crate) mod rootfs;

pub use config::{SandboxConfig, DEFAULT_HOSTNAME, DEFAULT_IMAGE_FSTYPE};
pub use namespaces::{NamespaceSet, NsKind, NS_KINDS};
