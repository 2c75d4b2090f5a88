//! Error types for the kiosk supervisor.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use crate::sandbox::NsKind;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// System requirements not met
    #[error("System requirements check failed")]
    #[diagnostic(code(kiosk::system::requirements))]
    SystemRequirements(#[from] SystemRequirementsError),

    /// Namespace error
    #[error("Namespace error")]
    #[diagnostic(code(kiosk::namespace))]
    Namespace(#[from] NamespaceError),

    /// Mount error
    #[error("Mount error")]
    #[diagnostic(code(kiosk::mount))]
    Mount(#[from] MountError),

    /// Proxy error
    #[error("Proxy error")]
    #[diagnostic(code(kiosk::proxy))]
    Proxy(#[from] ProxyError),

    /// Browser error
    #[error("Browser error")]
    #[diagnostic(code(kiosk::browser))]
    Browser(#[from] BrowserError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(kiosk::io))]
    Io(#[from] std::io::Error),
}

/// Errors related to system requirements validation.
#[derive(Error, Debug, Diagnostic)]
pub enum SystemRequirementsError {
    /// Kernel version too old
    #[error("Kernel version {found} is below minimum required {required}")]
    #[diagnostic(
        code(kiosk::system::kernel_version),
        help("pivot_root into a detached mount namespace needs a reasonably modern kernel")
    )]
    KernelTooOld { found: String, required: String },

    /// Not running as root
    #[error("Must run as root (effective uid {euid})")]
    #[diagnostic(
        code(kiosk::system::privileges),
        help("Namespace creation, mounts, and pivot_root require CAP_SYS_ADMIN")
    )]
    NotRoot { euid: u32 },

    /// A namespace kind is not supported by this kernel
    #[error("Namespace {kind} is not available on this system")]
    #[diagnostic(
        code(kiosk::system::namespace_support),
        help("Ensure the kernel is built with CONFIG_UTS_NS, CONFIG_NET_NS and mount namespaces")
    )]
    NamespaceUnavailable { kind: NsKind },

    /// Failed to read system information
    #[error("Failed to read system information: {context}")]
    #[diagnostic(code(kiosk::system::read_failed))]
    ReadFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the namespace builder.
#[derive(Error, Debug, Diagnostic)]
pub enum NamespaceError {
    /// unshare(2) failed on the creator or entering thread
    #[error("unshare failed: {source}")]
    #[diagnostic(code(kiosk::namespace::unshare))]
    Unshare {
        #[source]
        source: nix::Error,
    },

    /// sethostname(2) failed inside the new UTS namespace
    #[error("sethostname {hostname:?} failed: {source}")]
    #[diagnostic(code(kiosk::namespace::hostname))]
    SetHostname {
        hostname: String,
        #[source]
        source: nix::Error,
    },

    /// Bringing the loopback interface up failed
    #[error("failed to bring loopback up: {source}")]
    #[diagnostic(code(kiosk::namespace::loopback))]
    LoopbackUp {
        #[source]
        source: std::io::Error,
    },

    /// Pinning a namespace to its bind-mounted file failed
    #[error("failed to pin {kind} namespace at {path}: {reason}")]
    #[diagnostic(code(kiosk::namespace::pin))]
    Pin {
        kind: NsKind,
        path: String,
        reason: String,
    },

    /// The pin directory could not be made a recursive-private mount
    #[error("could not make {path} a private mount after {attempts} attempts")]
    #[diagnostic(
        code(kiosk::namespace::pin_dir_private),
        help("The host propagates shared mounts; check that the run directory is mountable")
    )]
    PinDirPrivate { path: String, attempts: u32 },

    /// One or more setns(2) calls failed while entering the sandbox.
    ///
    /// The calling thread may be partially entered and must not be reused.
    #[error("entering sandbox failed: {}", .failures.join("; "))]
    #[diagnostic(code(kiosk::namespace::enter))]
    Enter { failures: Vec<String> },

    /// The namespace set was already destroyed
    #[error("namespace set has been destroyed")]
    #[diagnostic(code(kiosk::namespace::destroyed))]
    Destroyed,

    /// The dedicated creation thread died without reporting a result
    #[error("namespace creation thread terminated unexpectedly")]
    #[diagnostic(code(kiosk::namespace::creator_died))]
    CreatorDied,

    /// A closure running on a sandbox-entered thread panicked
    #[error("sandboxed task panicked")]
    #[diagnostic(code(kiosk::namespace::task_panicked))]
    TaskPanicked,
}

/// Errors related to mount operations during rootfs setup.
#[derive(Error, Debug, Diagnostic)]
pub enum MountError {
    /// Failed to mount the root filesystem image
    #[error("failed to mount {fstype} image {image} at {target}: {source}")]
    #[diagnostic(code(kiosk::mount::image))]
    ImageMount {
        image: String,
        target: String,
        fstype: String,
        #[source]
        source: nix::Error,
    },

    /// Failed to create a bind mount
    #[error("failed to bind mount {source_path} onto {target}: {source}")]
    #[diagnostic(code(kiosk::mount::bind))]
    BindMount {
        source_path: String,
        target: String,
        #[source]
        source: nix::Error,
    },

    /// pivot_root(2) failed
    #[error("pivot_root {new_root} {put_old} failed: {source}")]
    #[diagnostic(
        code(kiosk::mount::pivot_root),
        help("The new root must be a mount point and must contain /mnt for the old root")
    )]
    PivotRoot {
        new_root: String,
        put_old: String,
        #[source]
        source: nix::Error,
    },

    /// Failed to mount one of the pseudo-filesystems post-pivot
    #[error("failed to mount {fstype} at {target}: {source}")]
    #[diagnostic(code(kiosk::mount::pseudo_fs))]
    PseudoFs {
        target: String,
        fstype: String,
        #[source]
        source: nix::Error,
    },

    /// Failed to change mount propagation on /
    #[error("failed to make / recursive-private: {source}")]
    #[diagnostic(code(kiosk::mount::private_root))]
    PrivateRoot {
        #[source]
        source: nix::Error,
    },

    /// Failed to change directory after the pivot
    #[error("failed to chdir to {path}: {source}")]
    #[diagnostic(code(kiosk::mount::chdir))]
    Chdir {
        path: String,
        #[source]
        source: nix::Error,
    },

    /// Failed to unmount
    #[error("failed to unmount {target}: {source}")]
    #[diagnostic(code(kiosk::mount::unmount))]
    Unmount {
        target: String,
        #[source]
        source: nix::Error,
    },

    /// Failed to create a directory on the setup path
    #[error("failed to create directory {path}: {source}")]
    #[diagnostic(code(kiosk::mount::mkdir))]
    Mkdir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the TLS intercepting proxy's setup path.
///
/// Per-request failures are mapped to HTTP status codes in the handler and
/// never surface here.
#[derive(Error, Debug, Diagnostic)]
pub enum ProxyError {
    /// Ephemeral CA generation failed
    #[error("failed to generate ephemeral CA: {0}")]
    #[diagnostic(code(kiosk::proxy::certificate))]
    Certificate(#[from] rcgen::Error),

    /// rustls rejected the generated certificate or key
    #[error("TLS configuration failed: {0}")]
    #[diagnostic(code(kiosk::proxy::tls_config))]
    TlsConfig(#[from] rustls::Error),

    /// Binding or converting the listener failed
    #[error("proxy listener error: {0}")]
    #[diagnostic(code(kiosk::proxy::listener))]
    Listener(#[source] std::io::Error),

    /// The upstream HTTP client could not be constructed
    #[error("failed to build upstream client: {0}")]
    #[diagnostic(code(kiosk::proxy::upstream_client))]
    UpstreamClient(#[from] reqwest::Error),
}

/// Errors from the browser controller.
#[derive(Error, Debug, Diagnostic)]
pub enum BrowserError {
    /// Spawning the browser process failed
    #[error("failed to spawn browser {program}: {source}")]
    #[diagnostic(code(kiosk::browser::spawn))]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The DevTools endpoint never became reachable
    #[error("DevTools endpoint on port {port} not reachable: {reason}")]
    #[diagnostic(
        code(kiosk::browser::devtools_connect),
        help("The browser may have crashed before opening its debugging port")
    )]
    DevToolsConnect { port: u16, reason: String },

    /// The DevTools connection failed mid-session
    #[error("DevTools transport error: {0}")]
    #[diagnostic(code(kiosk::browser::devtools_transport))]
    DevToolsTransport(String),

    /// The browser reported a protocol-level error for a command
    #[error("DevTools command {method} failed: {message}")]
    #[diagnostic(code(kiosk::browser::devtools_command))]
    DevToolsCommand { method: String, message: String },

    /// A command outlived its deadline
    #[error("DevTools command {method} timed out")]
    #[diagnostic(code(kiosk::browser::devtools_timeout))]
    DevToolsTimeout { method: String },

    /// The browser process exited
    #[error("browser exited: {status}")]
    #[diagnostic(code(kiosk::browser::exited))]
    Exited { status: String },

    /// The controller is gone; its command queue is closed
    #[error("browser controller is not running")]
    #[diagnostic(code(kiosk::browser::closed))]
    ControllerClosed,

    /// Decoding an evaluation result failed
    #[error("failed to decode evaluation result: {0}")]
    #[diagnostic(code(kiosk::browser::decode))]
    Decode(#[from] serde_json::Error),

    /// I/O error on the launch path
    #[error("browser I/O error: {0}")]
    #[diagnostic(code(kiosk::browser::io))]
    Io(#[from] std::io::Error),
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
