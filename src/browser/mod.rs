//! Browser launch and remote control.
//!
//! The browser runs inside the sandbox, wrapped by a single-window Wayland
//! compositor. Control happens over its DevTools port: one worker owns the
//! session, and navigate/evaluate operations queue through capacity-one
//! channels on a [`BrowserHandle`].

pub mod cdp;
mod controller;
mod flags;

pub use controller::{
    Browser, BrowserConfig, BrowserHandle, DEFAULT_BROWSER_BIN, DEFAULT_DEBUG_PORT,
};
pub use flags::{effective_url, BrowserFlags, FlagValue, DEFAULT_START_URL};
