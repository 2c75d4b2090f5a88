//! The supervisor: builds the sandbox, wires the proxy through it, and hosts
//! the browser.
//!
//! Thread and namespace choreography, in order:
//!
//! 1. The namespace set is created and pinned (dedicated thread inside
//!    [`NamespaceSet::create`]).
//! 2. The proxy listener is bound on a sandbox-entered throwaway thread; the
//!    resulting descriptor is served by a task *outside* the sandbox, which
//!    gives the proxy host-side DNS and routing while keeping the listener
//!    unreachable from the host network.
//! 3. The browser gets its own OS thread, which enters the sandbox and stays
//!    pinned until the process ends.
//! 4. The supervisor waits for cancellation or the first browser error, then
//!    destroys the namespace set.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::browser::{
    Browser, BrowserConfig, BrowserFlags, BrowserHandle, DEFAULT_DEBUG_PORT, DEFAULT_START_URL,
};
use crate::error::{BrowserError, Error, NamespaceError, ProxyError};
use crate::proxy::{self, EphemeralCa, Proxy};
use crate::sandbox::{NamespaceSet, SandboxConfig};

/// Default run directory; holds `mnt/` (pivot target) and `ns/` (pins).
pub const DEFAULT_RUN_DIR: &str = "/run/webkiosk";

/// Loopback port the proxy listens on inside the sandbox.
pub const PROXY_PORT: u16 = 8443;

/// Single-window Wayland compositor wrapping the browser.
const CAGE_BIN: &str = "/usr/bin/cage";

const ENV_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const USER_HOME: &str = "/run/home";
const XDG_RUNTIME_DIR: &str = "/run";
const BROWSER_DATA_DIR: &str = "/run/chrome-data";

/// Deadline for relay dials into the sandboxed debugger.
const RELAY_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace period for the browser thread after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Top-level configuration for a kiosk instance.
#[derive(Debug, Clone)]
pub struct KioskConfig {
    /// Run directory; created if missing.
    pub run_dir: PathBuf,
    /// Pivot mount point; defaults to `<run_dir>/mnt`.
    pub mount_point: Option<PathBuf>,
    /// Root filesystem image; when absent, `mount_point` must already hold a
    /// root tree.
    pub image_path: Option<PathBuf>,
    /// Starting URL (before effective-URL rewriting).
    pub start_url: String,
    /// Host-side address relaying to the in-sandbox remote debugger.
    pub remote_debug_addr: Option<SocketAddr>,
    /// Let the browser's own telemetry through the proxy.
    pub allow_internal_requests: bool,
}

impl Default for KioskConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
            mount_point: None,
            image_path: None,
            start_url: String::new(),
            remote_debug_addr: None,
            allow_internal_requests: false,
        }
    }
}

/// Orchestrates sandbox, proxy, and browser for one kiosk instance.
pub struct Supervisor {
    sandbox_config: SandboxConfig,
    run_dir: PathBuf,
    remote_debug_addr: Option<SocketAddr>,
    allow_internal_requests: bool,
    browser: Option<Browser>,
    handle: BrowserHandle,
}

impl Supervisor {
    /// Resolves paths and prepares (but does not start) all components.
    ///
    /// # Errors
    ///
    /// Fails if the configured paths cannot be made absolute.
    pub fn new(config: KioskConfig) -> Result<Self, Error> {
        let run_dir = std::path::absolute(&config.run_dir)?;
        let mount_point = config
            .mount_point
            .unwrap_or_else(|| run_dir.join("mnt"));

        let mut sandbox_config = SandboxConfig::new(mount_point, run_dir.join("ns"));
        if let Some(image) = config.image_path {
            sandbox_config = sandbox_config.with_image(image);
        }
        let sandbox_config = sandbox_config.absolutize()?;

        let start_url = if config.start_url.is_empty() {
            String::from(DEFAULT_START_URL)
        } else {
            config.start_url
        };

        let extra_flags: BrowserFlags =
            [("proxy-server", format!("https://127.0.0.1:{PROXY_PORT}"))]
                .into_iter()
                .collect();

        let browser_config = BrowserConfig {
            start_url,
            extra_flags,
            exec_prefix: vec![String::from(CAGE_BIN), String::from("--")],
            env: Some(vec![
                (String::from("PATH"), String::from(ENV_PATH)),
                (String::from("HOME"), String::from(USER_HOME)),
                (String::from("XDG_RUNTIME_DIR"), String::from(XDG_RUNTIME_DIR)),
                (String::from("WLR_LIBINPUT_NO_DEVICES"), String::from("1")),
            ]),
            user_data_dir: Some(String::from(BROWSER_DATA_DIR)),
            ..BrowserConfig::default()
        };
        let (browser, handle) = Browser::new(browser_config);

        Ok(Self {
            sandbox_config,
            run_dir,
            remote_debug_addr: config.remote_debug_addr,
            allow_internal_requests: config.allow_internal_requests,
            browser: Some(browser),
            handle,
        })
    }

    /// Command handle for the admin surface. Valid before `run`; operations
    /// queue until the browser serves them.
    #[must_use]
    pub fn browser(&self) -> BrowserHandle {
        self.handle.clone()
    }

    /// Runs the kiosk until cancellation or browser failure.
    ///
    /// # Errors
    ///
    /// Setup failures (namespace creation, listener bind, TLS material) and
    /// browser termination are fatal; the namespace set is destroyed on
    /// every exit path.
    #[instrument(skip_all, fields(run_dir = %self.run_dir.display()))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), Error> {
        std::fs::create_dir_all(&self.run_dir)?;

        // Mount-heavy and runs its own threads; keep it off the worker pool.
        let sandbox_config = self.sandbox_config.clone();
        let namespaces =
            tokio::task::spawn_blocking(move || NamespaceSet::create(&sandbox_config))
                .await
                .map_err(|_| Error::Namespace(NamespaceError::CreatorDied))??;
        let namespaces = Arc::new(namespaces);

        let result = self.serve(Arc::clone(&namespaces), cancel).await;

        let ns = Arc::clone(&namespaces);
        let _ = tokio::task::spawn_blocking(move || ns.destroy()).await;

        result
    }

    async fn serve(
        &mut self,
        namespaces: Arc<NamespaceSet>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        // Bind inside the sandbox net namespace; the descriptor remains
        // usable from the host side of the supervisor.
        let proxy_addr = SocketAddr::from(([127, 0, 0, 1], PROXY_PORT));
        let std_listener = namespaces.run_inside(|| {
            let listener = std::net::TcpListener::bind(proxy_addr).map_err(Error::Io)?;
            listener.set_nonblocking(true).map_err(Error::Io)?;
            Ok(listener)
        })?;
        let listener = TcpListener::from_std(std_listener).map_err(ProxyError::Listener)?;
        debug!(%proxy_addr, "Proxy listener bound inside sandbox");

        let ca = EphemeralCa::generate()?;
        let tls = TlsAcceptor::from(Arc::new(ca.server_config()?));
        let proxy = Proxy::new(self.allow_internal_requests)?;

        let proxy_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy::serve(listener, tls, proxy, proxy_cancel).await {
                error!(error = %e, "Proxy terminated");
            }
        });

        let browser = self
            .browser
            .take()
            .ok_or(Error::Browser(BrowserError::ControllerClosed))?;

        // The browser thread enters the sandbox and must stay pinned for the
        // process lifetime; it gets its own single-threaded runtime so no
        // work ever migrates off it.
        let (done_tx, mut done_rx) = oneshot::channel();
        let browser_cancel = cancel.clone();
        let browser_ns = Arc::clone(&namespaces);
        std::thread::Builder::new()
            .name(String::from("browser"))
            .spawn(move || {
                let result = run_browser_thread(&browser_ns, browser, browser_cancel);
                let _ = done_tx.send(result);
            })
            .map_err(Error::Io)?;

        if let Some(addr) = self.remote_debug_addr {
            let relay_ns = Arc::clone(&namespaces);
            let relay_cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = remote_debug_relay(addr, relay_ns, relay_cancel).await {
                    warn!(error = %e, "Remote debugger relay terminated");
                }
            });
        }

        tokio::select! {
            () = cancel.cancelled() => {
                info!("Supervisor cancelled, waiting for browser shutdown");
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, done_rx).await;
                Ok(())
            }
            outcome = &mut done_rx => match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    warn!(error = %e, "Browser terminated");
                    Err(e)
                }
                Err(_) => Err(Error::Namespace(NamespaceError::TaskPanicked)),
            }
        }
    }
}

/// Body of the dedicated browser thread: enter the sandbox, then run the
/// controller on a runtime confined to this thread.
fn run_browser_thread(
    namespaces: &NamespaceSet,
    browser: Browser,
    cancel: CancellationToken,
) -> Result<(), Error> {
    namespaces.enter()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::Io)?;

    runtime.block_on(browser.run(cancel)).map_err(Error::Browser)
}

/// Host-side listener forwarding raw bytes to the in-sandbox debug port.
async fn remote_debug_relay(
    addr: SocketAddr,
    namespaces: Arc<NamespaceSet>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Remote debugger relay listening");

    loop {
        let (client, peer) = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };

        let ns = Arc::clone(&namespaces);
        tokio::spawn(async move {
            let dialed =
                tokio::task::spawn_blocking(move || dial_debugger(&ns)).await;

            let upstream = match dialed {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "Debugger dial failed");
                    return;
                }
                Err(_) => {
                    debug!(%peer, "Debugger dial task panicked");
                    return;
                }
            };

            let upstream = match tokio::net::TcpStream::from_std(upstream) {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%peer, error = %e, "Debugger stream conversion failed");
                    return;
                }
            };

            match proxy::bridge(client, upstream).await {
                Ok((tx, rx)) => debug!(%peer, tx, rx, "Relay session closed"),
                Err(e) => debug!(%peer, error = %e, "Relay session error"),
            }
        });
    }
}

/// Dials the sandboxed debugger from a throwaway sandbox-entered thread.
fn dial_debugger(namespaces: &NamespaceSet) -> Result<std::net::TcpStream, Error> {
    namespaces.run_inside(|| {
        let addr = SocketAddr::from(([127, 0, 0, 1], DEFAULT_DEBUG_PORT));
        let stream =
            std::net::TcpStream::connect_timeout(&addr, RELAY_DIAL_TIMEOUT).map_err(Error::Io)?;
        stream.set_nonblocking(true).map_err(Error::Io)?;
        Ok(stream)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_point_defaults_under_run_dir() {
        let supervisor = Supervisor::new(KioskConfig {
            run_dir: PathBuf::from("/run/webkiosk"),
            ..KioskConfig::default()
        })
        .unwrap();

        assert_eq!(
            supervisor.sandbox_config.mount_point,
            PathBuf::from("/run/webkiosk/mnt")
        );
        assert_eq!(
            supervisor.sandbox_config.ns_dir,
            PathBuf::from("/run/webkiosk/ns")
        );
    }

    #[test]
    fn test_explicit_mount_point_wins() {
        let supervisor = Supervisor::new(KioskConfig {
            mount_point: Some(PathBuf::from("/srv/rootfs")),
            ..KioskConfig::default()
        })
        .unwrap();

        assert_eq!(
            supervisor.sandbox_config.mount_point,
            PathBuf::from("/srv/rootfs")
        );
    }

    #[test]
    fn test_handle_available_before_run() {
        let supervisor = Supervisor::new(KioskConfig::default()).unwrap();
        // Cloning the handle must not require a running browser.
        let _handle = supervisor.browser();
    }
}
