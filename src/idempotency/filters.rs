//! Header filtering applied before anything is persisted or replayed.
//!
//! Request snapshots lose credentials and tokens; cached responses keep only
//! the headers that are safe to send again verbatim.

use http::HeaderMap;
use std::borrow::Cow;

use crate::models::HeaderList;

/// Request headers that are always redacted (compared case-insensitively).
pub const SENSITIVE_REQUEST_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-auth-token",
    "x-csrf-token",
    "x-xsrf-token",
    "x-api-key",
];

/// Any request header starting with one of these is redacted too.
pub const SENSITIVE_REQUEST_HEADER_PREFIXES: &[&str] =
    &["x-auth-", "x-token-", "x-secret-", "x-key-"];

/// Response header prefixes that survive capture.
pub const REPLAYABLE_RESPONSE_HEADER_PREFIXES: &[&str] =
    &["content-", "access-control-allow-"];

/// Response headers that survive capture by exact name.
pub const REPLAYABLE_RESPONSE_HEADERS: &[&str] = &["location"];

pub fn is_sensitive_request_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    SENSITIVE_REQUEST_HEADERS.contains(&name.as_str())
        || SENSITIVE_REQUEST_HEADER_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

pub fn is_replayable_response_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    REPLAYABLE_RESPONSE_HEADERS.contains(&name.as_str())
        || REPLAYABLE_RESPONSE_HEADER_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

/// Drops sensitive headers; everything else is kept as-is.
pub fn redact_request_headers<'a, I>(headers: I) -> HeaderList
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .filter(|(name, _)| !is_sensitive_request_header(name))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// Keeps only headers that may be replayed.
pub fn whitelist_response_headers<'a, I>(headers: I) -> HeaderList
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .filter(|(name, _)| is_replayable_response_header(name))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// Flattens a `HeaderMap`. Values are decoded as UTF-8, so obs-text such as
/// `café` is kept; invalid sequences become U+FFFD rather than being dropped.
pub fn header_pairs(headers: &HeaderMap) -> Vec<(&str, Cow<'_, str>)> {
    headers
        .iter()
        .map(|(name, value)| (name.as_str(), String::from_utf8_lossy(value.as_bytes())))
        .collect()
}

pub fn redact_header_map(headers: &HeaderMap) -> HeaderList {
    let pairs = header_pairs(headers);
    redact_request_headers(pairs.iter().map(|(name, value)| (*name, value.as_ref())))
}

pub fn whitelist_header_map(headers: &HeaderMap) -> HeaderList {
    let pairs = header_pairs(headers);
    whitelist_response_headers(pairs.iter().map(|(name, value)| (*name, value.as_ref())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_exact_denylist_case_insensitive() {
        let headers = vec![
            ("Authorization", "Bearer abc"),
            ("PROXY-AUTHORIZATION", "Basic xyz"),
            ("Cookie", "session=1"),
            ("X-Api-Key", "secret"),
            ("x-csrf-token", "t"),
            ("Content-Type", "application/json"),
        ];
        let redacted = redact_request_headers(headers);
        assert_eq!(
            redacted,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );
    }

    #[test]
    fn test_redacts_prefixed_headers() {
        for name in ["x-auth-user", "X-Token-Id", "x-secret-sauce", "X-KEY-ID"] {
            assert!(is_sensitive_request_header(name), "{name} should be redacted");
        }
        for name in ["accept", "user-agent", "host", "x-request-id", "x-keyboard"] {
            assert!(!is_sensitive_request_header(name), "{name} should be kept");
        }
    }

    #[test]
    fn test_response_whitelist() {
        for name in [
            "Content-Type",
            "content-length",
            "Content-Encoding",
            "Access-Control-Allow-Origin",
            "access-control-allow-headers",
            "Location",
        ] {
            assert!(is_replayable_response_header(name), "{name} should replay");
        }
        for name in [
            "cache-control",
            "Expires",
            "ETag",
            "last-modified",
            "vary",
            "retry-after",
            "Set-Cookie",
            "authorization",
            "server",
            "x-powered-by",
            "x-custom",
            "access-control-max-age",
        ] {
            assert!(!is_replayable_response_header(name), "{name} should not replay");
        }
    }

    #[test]
    fn test_header_map_helpers() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer t".parse().unwrap());
        headers.insert("accept", "*/*".parse().unwrap());
        headers.append("content-language", "en".parse().unwrap());
        headers.append("content-language", "fr".parse().unwrap());

        let redacted = redact_header_map(&headers);
        assert!(redacted.iter().all(|(name, _)| name != "authorization"));
        assert!(redacted.contains(&("accept".to_string(), "*/*".to_string())));

        let replayable = whitelist_header_map(&headers);
        assert_eq!(
            replayable,
            vec![
                ("content-language".to_string(), "en".to_string()),
                ("content-language".to_string(), "fr".to_string()),
            ]
        );
    }

    #[test]
    fn test_non_ascii_values_are_kept() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-note",
            http::HeaderValue::from_bytes(b"caf\xC3\xA9").unwrap(),
        );
        headers.insert(
            "content-disposition",
            http::HeaderValue::from_bytes(b"attachment; filename=\"r\xC3\xA9sum\xC3\xA9.pdf\"").unwrap(),
        );

        let redacted = redact_header_map(&headers);
        assert!(redacted.contains(&("x-note".to_string(), "café".to_string())));

        let replayable = whitelist_header_map(&headers);
        assert_eq!(
            replayable,
            vec![(
                "content-disposition".to_string(),
                "attachment; filename=\"résumé.pdf\"".to_string()
            )]
        );
    }

    #[test]
    fn test_invalid_utf8_value_is_not_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("x-raw", http::HeaderValue::from_bytes(b"a\xFFb").unwrap());

        let redacted = redact_header_map(&headers);
        assert_eq!(redacted, vec![("x-raw".to_string(), "a\u{FFFD}b".to_string())]);
    }
}
