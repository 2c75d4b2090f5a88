//! TLS-intercepting egress proxy for the sandboxed browser.
//!
//! All browser traffic is routed here via `--proxy-server`. The proxy
//! terminates TLS with an ephemeral self-signed CA, suppresses the browser
//! vendor's own telemetry, and forwards everything else.

pub mod ca;
pub mod classify;
mod service;

pub use ca::EphemeralCa;
pub use classify::{is_internal_request, INTERNAL_BROWSER_REQUESTS};
pub use service::{serve, Proxy, ProxyBody, DEFAULT_DIAL_TIMEOUT};

pub(crate) use service::bridge;
