//! webkiosk - Entry Point
//!
//! CLI wiring, preflight checks, the admin HTTP surface, and signal
//! handling around the supervisor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

use webkiosk::browser::{BrowserHandle, DEFAULT_START_URL};
use webkiosk::supervisor::{KioskConfig, Supervisor, DEFAULT_RUN_DIR};
use webkiosk::system;

/// webkiosk - sandboxed kiosk browser with intercepted egress.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address for the admin HTTP server
    #[arg(long, default_value = "127.0.0.1:8080")]
    http: SocketAddr,

    /// Path to an already mounted container root
    #[arg(long)]
    mount: Option<PathBuf>,

    /// Path to a container squashfs image
    #[arg(long)]
    image: Option<PathBuf>,

    /// Run directory for the pivot target and namespace pins
    #[arg(long, default_value = DEFAULT_RUN_DIR)]
    rundir: PathBuf,

    /// Starting URL
    #[arg(long, default_value = "blank:yellow")]
    url: String,

    /// Host-side addr:port relaying to the browser's remote debugger
    /// (empty disables the relay)
    #[arg(long, default_value = "127.0.0.1:9222")]
    remotedebug: String,

    /// Skip system requirements checks (NOT RECOMMENDED)
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

/// Shared state for the admin handlers.
#[derive(Clone)]
struct AdminState {
    browser: BrowserHandle,
    cancel: CancellationToken,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("webkiosk v{}", env!("CARGO_PKG_VERSION"));

    if args.skip_checks {
        warn!("Skipping system requirements checks (--skip-checks)");
    } else {
        let reqs = system::check_all()?;
        info!(
            "System requirements satisfied: kernel {}, namespaces {:?}",
            reqs.kernel_version, reqs.namespaces
        );
    }

    let remote_debug_addr = if args.remotedebug.is_empty() {
        None
    } else {
        Some(args.remotedebug.parse::<SocketAddr>().into_diagnostic()?)
    };

    let supervisor = Supervisor::new(KioskConfig {
        run_dir: args.rundir,
        mount_point: args.mount,
        image_path: args.image,
        start_url: args.url,
        remote_debug_addr,
        allow_internal_requests: false,
    })?;

    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    let state = AdminState {
        browser: supervisor.browser(),
        cancel: cancel.clone(),
    };
    let app = Router::new()
        .route("/", get(index))
        .route("/navigate", get(navigate))
        .route("/console", get(console))
        .route("/quit", get(quit))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.http)
        .await
        .into_diagnostic()?;
    info!(addr = %args.http, "Admin surface listening");

    let admin_cancel = cancel.clone();
    tokio::spawn(async move {
        let shutdown = async move { admin_cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "Admin server failed");
        }
    });

    let result = supervisor.run(cancel.clone()).await;
    cancel.cancel();
    result?;
    Ok(())
}

async fn index() -> &'static str {
    "webkiosk\n"
}

/// `GET /navigate?url=…` - queue a navigation. `-` and `about:blank` reset
/// to the default blank screen. Errors are logged, not echoed to the caller.
async fn navigate(
    State(state): State<AdminState>,
    Query(params): Query<HashMap<String, String>>,
) -> String {
    let Some(mut url) = params.get("url").filter(|u| !u.is_empty()).cloned() else {
        return String::from("missing ?url= param\n");
    };

    if url == "-" || url == "about:blank" {
        url = String::from(DEFAULT_START_URL);
    }

    if let Err(e) = state.browser.navigate(&url).await {
        error!(%url, error = %e, "Navigate failed");
    }
    String::new()
}

/// `GET /console?text=…` - log a line on the page's console. Errors are
/// logged, not echoed to the caller.
async fn console(
    State(state): State<AdminState>,
    Query(params): Query<HashMap<String, String>>,
) -> String {
    let Some(text) = params.get("text").filter(|t| !t.is_empty()) else {
        return String::from("missing ?text= param\n");
    };

    // Route the text through JSON so it arrives on the page unescaped.
    let payload = json!({ "text": text });
    let code = format!("(function() {{ console.log({payload}.text); }})();");

    if let Err(e) = state.browser.eval_js(&code).await {
        error!(error = %e, "Console injection failed");
    }
    String::new()
}

/// `GET /quit?now=1` - cancel the supervisor.
async fn quit(
    State(state): State<AdminState>,
    Query(params): Query<HashMap<String, String>>,
) -> String {
    if params.get("now").map(String::as_str) == Some("1") {
        state.cancel.cancel();
        String::from("shutting down\n")
    } else {
        String::from("missing ?now=1 param\n")
    }
}
