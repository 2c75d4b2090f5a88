//! Browser command-line flags and start-URL handling.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// URL handed to the browser when none is configured. `blank:<color>` paints
/// the whole page in a CSS color via a generated `data:` URL.
pub const DEFAULT_START_URL: &str = "blank:black";

/// A single flag value: present/absent, or carrying a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagValue {
    /// Rendered as `--name` when true, omitted when false.
    Switch(bool),
    /// Rendered as `--name=value`.
    Value(String),
}

impl From<bool> for FlagValue {
    fn from(on: bool) -> Self {
        FlagValue::Switch(on)
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::Value(value.to_owned())
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> Self {
        FlagValue::Value(value)
    }
}

/// An ordered flag set. Ordering keeps the rendered command line stable
/// between runs, which matters for log diffing on appliances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrowserFlags(BTreeMap<String, FlagValue>);

impl BrowserFlags {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock kiosk flag set: fullscreen kiosk mode, no first-run or
    /// crash-report chrome, remote debugging on 9222, Wayland via Ozone, and
    /// tolerance for the intercepting proxy's untrusted certificate.
    #[must_use]
    pub fn kiosk_defaults() -> Self {
        let mut flags = Self::new();
        flags.set("kiosk", true);
        flags.set("no-default-browser-check", true);
        flags.set("remote-debugging-port", "9222");
        flags.set("no-sandbox", true);
        flags.set("disable-infobars", true);
        flags.set("noerrdialogs", true);
        flags.set("enable-automation", false);
        flags.set("disable-crash-report", true);
        flags.set("ignore-certificate-errors", true);
        flags.set("bwsi", true);
        flags.set("disable-extensions", true);
        flags.set("allow-insecure-localhost", true);
        flags.set("allow-running-insecure-content", true);
        flags.set("headless", false);
        flags.set("enable-features", "UseOzonePlatform");
        flags.set("ozone-platform", "wayland");
        flags.set("disable-blink-features", "AutomationControlled");
        flags
    }

    /// Sets or replaces a flag.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FlagValue>) {
        self.0.insert(name.into(), value.into());
    }

    /// Looks a flag up.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FlagValue> {
        self.0.get(name)
    }

    /// Merges `overrides` into this set; override values win on collision.
    pub fn merge(&mut self, overrides: &BrowserFlags) {
        for (name, value) in &overrides.0 {
            self.0.insert(name.clone(), value.clone());
        }
    }

    /// Renders the set as command-line arguments: `--name` for set switches,
    /// `--name=value` for values, nothing for unset switches.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.0.len());
        for (name, value) in &self.0 {
            match value {
                FlagValue::Switch(true) => args.push(format!("--{name}")),
                FlagValue::Switch(false) => {}
                FlagValue::Value(v) => args.push(format!("--{name}={v}")),
            }
        }
        args
    }

    /// Number of flags in the set (including unset switches).
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no flags are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<FlagValue>> FromIterator<(K, V)> for BrowserFlags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut flags = Self::new();
        for (name, value) in iter {
            flags.set(name, value);
        }
        flags
    }
}

/// Resolves the URL actually handed to the browser.
///
/// Empty input falls back to [`DEFAULT_START_URL`]. A `blank:<color>` input
/// becomes a base64 `data:text/html` URL painting the page in that color.
/// Anything else, including already-rewritten `data:` URLs, passes through
/// untouched, so the rewrite is idempotent.
#[must_use]
pub fn effective_url(url: &str) -> String {
    let url = if url.is_empty() { DEFAULT_START_URL } else { url };

    match url.strip_prefix("blank:") {
        Some(color) => data_url_html(&format!("<style>html{{background-color:{color}}}</style>")),
        None => url.to_owned(),
    }
}

fn data_url_html(html: &str) -> String {
    format!("data:text/html;base64,{}", STANDARD.encode(html))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_rendering() {
        let mut flags = BrowserFlags::new();
        flags.set("kiosk", true);
        flags.set("headless", false);
        assert_eq!(flags.to_args(), vec!["--kiosk"]);
    }

    #[test]
    fn test_value_rendering() {
        let mut flags = BrowserFlags::new();
        flags.set("remote-debugging-port", "9222");
        assert_eq!(flags.to_args(), vec!["--remote-debugging-port=9222"]);
    }

    #[test]
    fn test_args_are_ordered_by_name() {
        let mut flags = BrowserFlags::new();
        flags.set("zygote", true);
        flags.set("apple", true);
        assert_eq!(flags.to_args(), vec!["--apple", "--zygote"]);
    }

    #[test]
    fn test_merge_overrides_win() {
        let mut flags = BrowserFlags::kiosk_defaults();
        let overrides: BrowserFlags = [
            ("proxy-server", FlagValue::from("https://127.0.0.1:8443")),
            ("kiosk", FlagValue::from(false)),
        ]
        .into_iter()
        .collect();

        flags.merge(&overrides);

        assert_eq!(
            flags.get("proxy-server"),
            Some(&FlagValue::Value(String::from("https://127.0.0.1:8443")))
        );
        assert_eq!(flags.get("kiosk"), Some(&FlagValue::Switch(false)));
        // Keys absent from the overrides keep their defaults.
        assert_eq!(flags.get("bwsi"), Some(&FlagValue::Switch(true)));
        assert_eq!(
            flags.get("remote-debugging-port"),
            Some(&FlagValue::Value(String::from("9222")))
        );
    }

    #[test]
    fn test_kiosk_defaults_render_expected_shape() {
        let args = BrowserFlags::kiosk_defaults().to_args();
        assert!(args.contains(&String::from("--kiosk")));
        assert!(args.contains(&String::from("--ozone-platform=wayland")));
        // Unset switches never appear.
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
        assert!(!args.iter().any(|a| a.starts_with("--enable-automation")));
    }

    #[test]
    fn test_effective_url_blank_color() {
        assert_eq!(
            effective_url("blank:red"),
            "data:text/html;base64,PHN0eWxlPmh0bWx7YmFja2dyb3VuZC1jb2xvcjpyZWR9PC9zdHlsZT4="
        );
    }

    #[test]
    fn test_effective_url_empty_uses_default() {
        assert_eq!(effective_url(""), effective_url(DEFAULT_START_URL));
    }

    #[test]
    fn test_effective_url_passthrough() {
        assert_eq!(effective_url("https://example.com/"), "https://example.com/");
    }

    #[test]
    fn test_effective_url_is_idempotent() {
        let once = effective_url("blank:teal");
        let twice = effective_url(&once);
        assert_eq!(once, twice);

        let plain = effective_url("https://example.com/");
        assert_eq!(effective_url(&plain), plain);
    }
}
