//! Escaping and url helpers shared by documents, databases and queries.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value as JsonValue;

/// Everything except unreserved characters is escaped, so `/` inside an id
/// never turns into a path separator.
const ID_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Query parameters whose values are JSON on the wire.
const JSON_PARAMS: [&str; 3] = ["key", "startkey", "endkey"];

/// Percent-encodes a document id (or any other path segment).
pub fn escape_id(id: &str) -> String {
    utf8_percent_encode(id, ID_ESCAPE).to_string()
}

/// Reverses [`escape_id`].
pub fn unescape_id(escaped: &str) -> String {
    percent_decode_str(escaped).decode_utf8_lossy().into_owned()
}

/// Normalizes a database name: `::` becomes `__`, the name is lowercased and
/// anything outside `[a-z0-9_-]` is dropped.
pub fn escape_database_name(name: &str) -> String {
    // Lowercased, not stripped: "Things" maps to "things".
    name.replace("::", "__")
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect()
}

/// Encodes a query value. Keys are JSON-encoded first; every value is then
/// percent-encoded.
pub fn encode_param(name: &str, value: &JsonValue) -> String {
    let raw = if JSON_PARAMS.contains(&name) {
        value.to_string()
    } else {
        match value {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        }
    };
    escape_id(&raw)
}

/// Appends `params` to `url` as a query string, in the given order.
pub fn paramify_url(url: &str, params: &[(String, JsonValue)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }
    let query = params
        .iter()
        .map(|(name, value)| format!("{}={}", name, encode_param(name, value)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{url}?{query}")
}
