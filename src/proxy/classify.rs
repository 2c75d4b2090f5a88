//! Classification of the browser's own vendor traffic.
//!
//! Chromium-family browsers phone home for update checks, safe browsing,
//! autofill models, and clock sync regardless of the page being displayed.
//! On an unattended display none of that traffic is wanted, so the proxy
//! consults this classifier first and silently times such requests out.
//!
//! The table mixes exact entries (`CONNECT //host:443`) and prefix entries
//! (URLs ending in `?`, which match any query string) in one sorted list so
//! a single binary search serves both.

use http::{Method, Uri};

/// Vendor-internal endpoints, as canonical `METHOD SP URL` strings.
///
/// Must stay lexicographically sorted; the matcher depends on it.
pub const INTERNAL_BROWSER_REQUESTS: [&str; 8] = [
    "CONNECT //accounts.google.com:443",
    "CONNECT //content-autofill.googleapis.com:443",
    "CONNECT //optimizationguide-pa.googleapis.com:443",
    "CONNECT //safebrowsingohttpgateway.googleapis.com:443",
    "CONNECT //update.googleapis.com:443",
    "CONNECT //www.google.com:443",
    "GET http://clients2.google.com/time/1/current?",
    "POST http://update.googleapis.com/service/update2/json?",
];

/// Returns true if the request targets a vendor-internal endpoint.
///
/// Pure and safe to call from any number of connection tasks concurrently.
#[must_use]
pub fn is_internal_request(method: &Method, uri: &Uri) -> bool {
    is_internal_key(&canonical_key(method, uri))
}

/// Renders the lookup key the table is written in.
///
/// CONNECT requests carry an authority-form target, printed scheme-less with
/// a `//` prefix; everything else uses the absolute URI as received.
pub(crate) fn canonical_key(method: &Method, uri: &Uri) -> String {
    if method == Method::CONNECT {
        match uri.authority() {
            Some(authority) => format!("CONNECT //{authority}"),
            None => format!("CONNECT {uri}"),
        }
    } else {
        format!("{method} {uri}")
    }
}

/// The sorted-table matching rule.
///
/// Binary-search the key; a miss whose insertion point is >= 2 may still be a
/// prefix match against the entry just before it (the trailing-`?` entries);
/// the insertion point is then clamped to the last index for the exact test.
fn is_internal_key(key: &str) -> bool {
    let table = &INTERNAL_BROWSER_REQUESTS;

    let mut n = match table.binary_search(&key) {
        Ok(i) => i,
        Err(i) => i,
    };

    if n > 1 && key.starts_with(table[n - 1]) {
        return true;
    }

    if n == table.len() {
        n -= 1;
    }

    key == table[n]
}
