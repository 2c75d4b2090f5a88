//! Integration tests for browser flag handling and start-URL rewriting.

use webkiosk::browser::{effective_url, BrowserFlags, FlagValue, DEFAULT_START_URL};

#[test]
fn test_blank_red_produces_the_known_data_url() {
    // base64 of `<style>html{background-color:red}</style>`
    assert_eq!(
        effective_url("blank:red"),
        "data:text/html;base64,PHN0eWxlPmh0bWx7YmFja2dyb3VuZC1jb2xvcjpyZWR9PC9zdHlsZT4="
    );
}

#[test]
fn test_regular_urls_pass_through() {
    assert_eq!(effective_url("https://example.com/"), "https://example.com/");
    assert_eq!(
        effective_url("http://dashboard.local/status?full=1"),
        "http://dashboard.local/status?full=1"
    );
}

#[test]
fn test_empty_url_means_blank_black() {
    assert_eq!(effective_url(""), effective_url(DEFAULT_START_URL));
    assert!(effective_url("").starts_with("data:text/html;base64,"));
}

#[test]
fn test_rewriting_is_idempotent() {
    let rewritten = effective_url("blank:orange");
    assert_eq!(effective_url(&rewritten), rewritten);
}

#[test]
fn test_override_merge_preserves_untouched_defaults() {
    let mut flags = BrowserFlags::kiosk_defaults();
    let before = flags.len();

    let overrides: BrowserFlags = [
        ("proxy-server", FlagValue::from("https://127.0.0.1:8443")),
        ("window-size", FlagValue::from("1920,1080")),
    ]
    .into_iter()
    .collect();
    flags.merge(&overrides);

    // Every key in the overrides took the override value.
    assert_eq!(
        flags.get("proxy-server"),
        Some(&FlagValue::Value(String::from("https://127.0.0.1:8443")))
    );
    assert_eq!(
        flags.get("window-size"),
        Some(&FlagValue::Value(String::from("1920,1080")))
    );

    // Keys absent from the overrides kept their defaults.
    assert_eq!(flags.get("kiosk"), Some(&FlagValue::Switch(true)));
    assert_eq!(
        flags.get("remote-debugging-port"),
        Some(&FlagValue::Value(String::from("9222")))
    );
    assert_eq!(flags.len(), before + 2);
}

#[test]
fn test_rendered_args_hide_disabled_switches() {
    let mut flags = BrowserFlags::kiosk_defaults();
    flags.set("kiosk", false);
    let args = flags.to_args();

    assert!(!args.contains(&String::from("--kiosk")));
    assert!(args.contains(&String::from("--no-sandbox")));
}
