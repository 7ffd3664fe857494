//! Header coercion, request-ID validation, bearer extraction, and key
//! masking for log lines.

/// A header value as it arrives off the wire: absent, a single string, or
/// an ordered sequence (e.g. a repeated header). Collapses to the first
/// element.
pub fn first_value<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    values.into_iter().next()
}

/// Printable, non-space ASCII (0x21-0x7E), non-empty, at most 128 bytes.
pub fn is_valid_request_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && value.bytes().all(|b| (0x21..=0x7E).contains(&b))
}

/// Returns the token portion of an `Authorization: Bearer <token>` header,
/// requiring the scheme to be exactly `Bearer ` (case-insensitive, single
/// space separator).
pub fn extract_bearer(header_value: &str) -> Option<&str> {
    const SCHEME: &str = "bearer ";
    if header_value.len() <= SCHEME.len() {
        return None;
    }
    let (scheme, rest) = header_value.split_at(SCHEME.len());
    if scheme.eq_ignore_ascii_case(SCHEME) {
        Some(rest)
    } else {
        None
    }
}

/// Masks an API key for logging: keeps the prefix up to the second hyphen
/// and the last four characters, replaces the middle with `****`. Inputs
/// of length <= 8 collapse entirely to `****`.
pub fn mask_key(key: &str) -> String {
    if key.len() <= 8 {
        return "****".to_string();
    }

    let second_hyphen = key
        .char_indices()
        .filter(|(_, c)| *c == '-')
        .nth(1)
        .map(|(i, _)| i + 1);

    let tail_start = key.len() - 4;
    match second_hyphen {
        Some(prefix_end) if prefix_end < tail_start => {
            format!("{}****{}", &key[..prefix_end], &key[tail_start..])
        }
        _ => format!("****{}", &key[tail_start..]),
    }
}
