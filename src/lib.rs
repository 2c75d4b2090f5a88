//! webkiosk - namespace-sandboxed kiosk browser supervisor.
//!
//! Runs a locked-down browser inside a purpose-built Linux sandbox and
//! intercepts all of its network traffic through an in-process
//! TLS-terminating proxy:
//!
//! - UTS/NET/MNT namespaces are created once, pinned to bind-mounted files,
//!   and re-entered on demand ([`sandbox`]).
//! - The browser is pivoted into a read-only root image with fresh
//!   `/proc`, `/dev`, `/sys`, `/tmp`, `/run`.
//! - Egress flows through a loopback proxy bound *inside* the sandbox but
//!   served outside it, which terminates TLS with an ephemeral CA and
//!   silently drops the browser vendor's telemetry ([`proxy`]).
//! - Navigation and script evaluation are driven over the browser's
//!   debugging protocol ([`browser`]), orchestrated by the [`supervisor`].
//!
//! # Platform Requirements
//!
//! - Linux with UTS, network, and mount namespaces
//! - root (CAP_SYS_ADMIN) for namespace and mount operations
//!
//! # Example
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use webkiosk::supervisor::{KioskConfig, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> miette::Result<()> {
//!     webkiosk::system::check_all()?;
//!
//!     let supervisor = Supervisor::new(KioskConfig::default())?;
//!     supervisor.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod browser;
pub mod error;
pub mod proxy;
pub mod sandbox;
pub mod supervisor;
pub mod system;

// Re-export commonly used types
pub use error::{Error, Result};
pub use sandbox::{NamespaceSet, SandboxConfig};
pub use supervisor::{KioskConfig, Supervisor};
