//! Browser process launch and the serialized control loop.
//!
//! The controller owns the browser child process and its DevTools session.
//! Callers reach it through a [`BrowserHandle`] whose two command queues
//! (navigate, evaluate) have capacity one: a second sender waits until the
//! loop has served the first, so operations are naturally serialized and
//! calls made before the browser is up simply queue.

use std::process::Stdio;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::browser::cdp::DevTools;
use crate::browser::flags::{effective_url, BrowserFlags};
use crate::error::BrowserError;

/// Stock Chrome install path on the appliance image.
pub const DEFAULT_BROWSER_BIN: &str = "/opt/google/chrome/google-chrome";

/// Port the kiosk flag set opens the debugger on.
pub const DEFAULT_DEBUG_PORT: u16 = 9222;

/// How long the freshly spawned browser gets to expose its debugger.
const DEVTOOLS_CONNECT_DEADLINE: Duration = Duration::from_secs(30);

/// Launch configuration for the browser.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Browser binary path.
    pub browser_bin: String,
    /// URL shown at startup, before effective-URL rewriting.
    pub start_url: String,
    /// Base flag set; empty means [`BrowserFlags::kiosk_defaults`].
    pub flags: BrowserFlags,
    /// Overrides merged over the base set, overrides winning.
    pub extra_flags: BrowserFlags,
    /// Argv prefix wrapping the browser, e.g. a compositor:
    /// `["/usr/bin/cage", "--"]`.
    pub exec_prefix: Vec<String>,
    /// When set, the child environment is exactly this (the inherited
    /// environment is discarded, not merged).
    pub env: Option<Vec<(String, String)>>,
    /// Browser profile directory, created before launch.
    pub user_data_dir: Option<String>,
    /// DevTools port to connect to after launch.
    pub debug_port: u16,
    /// Serialize every DevTools event to the trace log.
    pub trace_events: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            browser_bin: String::from(DEFAULT_BROWSER_BIN),
            start_url: String::new(),
            flags: BrowserFlags::new(),
            extra_flags: BrowserFlags::new(),
            exec_prefix: Vec::new(),
            env: None,
            user_data_dir: None,
            debug_port: DEFAULT_DEBUG_PORT,
            trace_events: false,
        }
    }
}

struct NavigateOp {
    url: String,
    reply: oneshot::Sender<Result<(), BrowserError>>,
}

struct EvalOp {
    code: String,
    reply: oneshot::Sender<Result<Vec<u8>, BrowserError>>,
}

/// Cheap, clonable front for queueing operations into the control loop.
#[derive(Clone)]
pub struct BrowserHandle {
    navigate_tx: mpsc::Sender<NavigateOp>,
    eval_tx: mpsc::Sender<EvalOp>,
}

impl BrowserHandle {
    /// Queues a navigation and waits for the browser's answer.
    ///
    /// # Errors
    ///
    /// Returns the navigation error, or [`BrowserError::ControllerClosed`]
    /// if the control loop is gone.
    pub async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let (reply, reply_rx) = oneshot::channel();
        self.navigate_tx
            .send(NavigateOp {
                url: url.to_owned(),
                reply,
            })
            .await
            .map_err(|_| BrowserError::ControllerClosed)?;
        reply_rx.await.map_err(|_| BrowserError::ControllerClosed)?
    }

    /// Evaluates a script, returning the result as raw JSON bytes.
    pub async fn eval_js(&self, code: &str) -> Result<Vec<u8>, BrowserError> {
        let (reply, reply_rx) = oneshot::channel();
        self.eval_tx
            .send(EvalOp {
                code: code.to_owned(),
                reply,
            })
            .await
            .map_err(|_| BrowserError::ControllerClosed)?;
        reply_rx.await.map_err(|_| BrowserError::ControllerClosed)?
    }

    /// Evaluates a script and decodes its result into `T`.
    pub async fn eval_json<T: DeserializeOwned>(&self, code: &str) -> Result<T, BrowserError> {
        let raw = self.eval_js(code).await?;
        serde_json::from_slice(&raw).map_err(BrowserError::Decode)
    }
}

/// The browser controller. Construct with [`Browser::new`], then call
/// [`Browser::run`] from the sandbox-entered thread.
pub struct Browser {
    config: BrowserConfig,
    navigate_rx: mpsc::Receiver<NavigateOp>,
    eval_rx: mpsc::Receiver<EvalOp>,
    // Keeps the queues open even if every external handle is dropped.
    _handle: BrowserHandle,
}

impl Browser {
    /// Builds a controller and its command handle.
    #[must_use]
    pub fn new(config: BrowserConfig) -> (Self, BrowserHandle) {
        let (navigate_tx, navigate_rx) = mpsc::channel(1);
        let (eval_tx, eval_rx) = mpsc::channel(1);
        let handle = BrowserHandle {
            navigate_tx,
            eval_tx,
        };

        (
            Self {
                config,
                navigate_rx,
                eval_rx,
                _handle: handle.clone(),
            },
            handle,
        )
    }

    /// Launches the browser and serves the command queues until cancellation
    /// or browser exit.
    ///
    /// Must run on a thread that has entered the sandbox namespaces and
    /// stays pinned for the process lifetime; the child inherits that
    /// membership, and the DevTools dial goes over sandbox loopback.
    ///
    /// # Errors
    ///
    /// Returns [`BrowserError::Exited`] when the browser terminates on its
    /// own; cancellation is a clean `Ok(())` after killing the child.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), BrowserError> {
        if let Some(dir) = &self.config.user_data_dir {
            std::fs::create_dir_all(dir)?;
        }

        let mut child = self.spawn()?;
        forward_output(&mut child);

        let devtools = tokio::select! {
            () = cancel.cancelled() => {
                let _ = child.kill().await;
                return Ok(());
            }
            status = child.wait() => {
                return Err(exit_error(status));
            }
            connected = DevTools::connect(
                self.config.debug_port,
                DEVTOOLS_CONNECT_DEADLINE,
                self.config.trace_events,
            ) => connected?,
        };

        info!("Browser control loop running");

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Browser controller cancelled");
                    let _ = child.kill().await;
                    return Ok(());
                }
                status = child.wait() => {
                    return Err(exit_error(status));
                }
                Some(op) = self.navigate_rx.recv() => {
                    let url = effective_url(&op.url);
                    trace!(%url, "navigate");
                    let _ = op.reply.send(devtools.navigate(&url).await);
                }
                Some(op) = self.eval_rx.recv() => {
                    trace!("evaluate");
                    let _ = op.reply.send(devtools.evaluate(&op.code).await);
                }
            }
        }
    }

    fn spawn(&self) -> Result<Child, BrowserError> {
        let mut flags = if self.config.flags.is_empty() {
            BrowserFlags::kiosk_defaults()
        } else {
            self.config.flags.clone()
        };
        flags.merge(&self.config.extra_flags);

        let argv = build_argv(&self.config, &flags);
        debug!(argv = ?argv, "Launching browser");

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir("/")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(env) = &self.config.env {
            command.env_clear();
            command.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        // If the monitoring thread dies, the kernel takes the browser down
        // with it.
        unsafe {
            command.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        command.spawn().map_err(|e| BrowserError::Spawn {
            program: argv[0].clone(),
            source: e,
        })
    }
}

/// Full argv: wrapper prefix, binary, rendered flags, profile dir, and the
/// effective start URL last.
fn build_argv(config: &BrowserConfig, flags: &BrowserFlags) -> Vec<String> {
    let mut argv = config.exec_prefix.clone();
    argv.push(config.browser_bin.clone());
    argv.extend(flags.to_args());
    if let Some(dir) = &config.user_data_dir {
        argv.push(format!("--user-data-dir={dir}"));
    }
    argv.push(effective_url(&config.start_url));
    argv
}

fn exit_error(status: std::io::Result<std::process::ExitStatus>) -> BrowserError {
    match status {
        Ok(status) => BrowserError::Exited {
            status: status.to_string(),
        },
        Err(e) => BrowserError::Io(e),
    }
}

fn forward_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(log_lines(stdout, "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_lines(stderr, "stderr"));
    }
}

async fn log_lines<R: AsyncRead + Unpin>(reader: R, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("browser {stream}: {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::flags::DEFAULT_START_URL;

    #[test]
    fn test_argv_shape() {
        let config = BrowserConfig {
            exec_prefix: vec![String::from("/usr/bin/cage"), String::from("--")],
            start_url: String::from("https://example.com/"),
            user_data_dir: Some(String::from("/run/chrome-data")),
            ..BrowserConfig::default()
        };
        let mut flags = BrowserFlags::new();
        flags.set("kiosk", true);

        let argv = build_argv(&config, &flags);

        assert_eq!(argv[0], "/usr/bin/cage");
        assert_eq!(argv[1], "--");
        assert_eq!(argv[2], DEFAULT_BROWSER_BIN);
        assert!(argv.contains(&String::from("--kiosk")));
        assert!(argv.contains(&String::from("--user-data-dir=/run/chrome-data")));
        assert_eq!(argv.last().map(String::as_str), Some("https://example.com/"));
    }

    #[test]
    fn test_argv_rewrites_the_start_url() {
        let config = BrowserConfig {
            start_url: String::from("blank:red"),
            ..BrowserConfig::default()
        };
        let argv = build_argv(&config, &BrowserFlags::new());
        assert!(argv.last().unwrap().starts_with("data:text/html;base64,"));
    }

    #[test]
    fn test_empty_start_url_uses_the_default() {
        let config = BrowserConfig::default();
        let argv = build_argv(&config, &BrowserFlags::new());
        assert_eq!(argv.last(), Some(&effective_url(DEFAULT_START_URL)));
    }

    #[tokio::test]
    async fn test_handle_reports_closed_controller() {
        let (browser, handle) = Browser::new(BrowserConfig::default());
        drop(browser);

        let result = handle.navigate("https://example.com/").await;
        assert!(matches!(result, Err(BrowserError::ControllerClosed)));

        let result = handle.eval_js("1 + 1").await;
        assert!(matches!(result, Err(BrowserError::ControllerClosed)));
    }
}
