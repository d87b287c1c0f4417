//! Percent-encoding and canonicalization helpers for request signing
//!
//! Two encodings of the same parameter set are produced and they must stay
//! distinct:
//! - the wire query keeps the original key case and form-encodes values
//! - the signing input lower-cases keys and encoded values, and writes
//!   spaces as `%20` instead of `+`
//!
//! Values are form-encoded with `*` left unescaped (alphanumerics and
//! `*-._` are the only characters passed through). The provider verifies
//! signatures against exactly this byte sequence.

/// Form-encode a single value (`*` stays literal, space becomes `+`)
pub fn encode_value(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Sort parameters by key, case-insensitively
///
/// Keys that differ only in case fall back to a byte-wise comparison of the
/// original key so the order never depends on insertion order.
pub fn sort_params(params: &mut [(String, String)]) {
    params.sort_by(|(a, _), (b, _)| {
        a.to_lowercase()
            .cmp(&b.to_lowercase())
            .then_with(|| a.cmp(b))
    });
}

/// Render the literal query string sent on the wire (without signature)
pub fn wire_query(sorted: &[(String, String)]) -> String {
    sorted
        .iter()
        .map(|(key, value)| format!("{}={}", key, encode_value(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Render the canonical form used as HMAC input
pub fn canonical_form(sorted: &[(String, String)]) -> String {
    sorted
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                key.to_lowercase(),
                encode_value(value).to_lowercase().replace('+', "%20")
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}
