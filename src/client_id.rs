//! Extracts the analytics client id from the browser's cookie header.

use once_cell::sync::Lazy;
use regex::Regex;

/// Name of the long-lived analytics cookie.
const PRIMARY_COOKIE: &str = "_ga";
/// Prefix of the per-property session cookies (`_ga_<container id>`).
const SECONDARY_COOKIE_PREFIX: &str = "_ga_";
/// Cookie values shorter than this cannot carry a client id (`GA1.1.<rand>.<ts>`).
const MIN_SEGMENTS: usize = 4;

static CLIENT_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+$").expect("client id pattern is valid"));

/// Returns true for ids of the form `digits.digits`.
pub(crate) fn is_valid_client_id(client_id: &str) -> bool {
    CLIENT_ID_PATTERN.is_match(client_id)
}

/// Reads the client id from a `Cookie` header.
///
/// The `_ga` cookie is preferred; a `_ga_<id>` cookie is used only when it is
/// absent or unusable. Returns `None` when neither yields a valid id.
pub(crate) fn client_id_from_cookies(cookie_header: &str) -> Option<String> {
    let cookies: Vec<(&str, &str)> = cookie_header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect();

    let primary = cookies
        .iter()
        .filter(|(name, _)| *name == PRIMARY_COOKIE)
        .find_map(|(_, value)| client_id_from_value(value));
    if primary.is_some() {
        return primary;
    }

    let secondary = cookies
        .iter()
        .filter(|(name, _)| name.starts_with(SECONDARY_COOKIE_PREFIX))
        .find_map(|(_, value)| client_id_from_value(value));
    if secondary.is_none() {
        tracing::debug!("No usable analytics client id cookie found");
    }
    secondary
}

/// Joins the last two numeric segments of a dot-delimited cookie value.
fn client_id_from_value(value: &str) -> Option<String> {
    let segments: Vec<&str> = value.split('.').collect();
    if segments.len() < MIN_SEGMENTS {
        return None;
    }

    let numeric: Vec<&str> = segments
        .iter()
        .copied()
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .collect();
    let [.., first, second] = numeric.as_slice() else {
        return None;
    };

    let client_id = format!("{}.{}", first, second);
    is_valid_client_id(&client_id).then_some(client_id)
}
