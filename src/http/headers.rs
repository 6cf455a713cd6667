//! Input and output header collections.
//!
//! Well-known request headers get named slots filled by per-header
//! validators; the validator table is keyed by the lowercase hash the
//! header parser computes while scanning the field name.

use std::sync::OnceLock;
use std::time::SystemTime;

use crate::http::parse::header_hash;
use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPolicy {
    /// Nothing explicit: keepalive iff HTTP/1.1.
    #[default]
    Default,
    Close,
    KeepAlive,
}

#[derive(Debug, Default)]
pub struct HeadersIn {
    /// Every field in arrival order, names lowercased.
    pub fields: Vec<(String, String)>,

    pub host: Option<String>,
    /// The host came from an absolute-form request target; a Host field
    /// is then ignored rather than treated as a duplicate.
    pub host_from_uri: bool,
    pub connection: ConnectionPolicy,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub expect_continue: bool,
    pub if_modified_since: Option<SystemTime>,
    pub if_none_match: Option<String>,
    pub range: Option<String>,
    pub user_agent: Option<String>,
    pub authorization: Option<String>,
    pub x_forwarded_for: Option<String>,
    pub cookies: Vec<String>,
}

type Validator = fn(&mut HeadersIn, &str) -> std::result::Result<(), u16>;

fn validator_table() -> &'static HashMap<u64, Validator> {
    static TABLE: OnceLock<HashMap<u64, Validator>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let entries: &[(&[u8], Validator)] = &[
            (b"host", validate_host),
            (b"connection", validate_connection),
            (b"content-length", validate_content_length),
            (b"transfer-encoding", validate_transfer_encoding),
            (b"expect", validate_expect),
            (b"if-modified-since", validate_if_modified_since),
            (b"if-none-match", validate_if_none_match),
            (b"range", validate_range),
            (b"user-agent", validate_user_agent),
            (b"authorization", validate_authorization),
            (b"x-forwarded-for", validate_x_forwarded_for),
            (b"cookie", validate_cookie),
        ];
        entries
            .iter()
            .map(|&(name, validator)| (header_hash(name), validator))
            .collect()
    })
}

impl HeadersIn {
    /// Record one parsed field and run its validator, if it is a
    /// well-known header. `invalid` fields (bad token bytes) are recorded
    /// but never validated.
    pub fn add(
        &mut self,
        name: &str,
        value: &str,
        hash: u64,
        invalid: bool,
    ) -> std::result::Result<(), u16> {
        self.fields.push((name.to_ascii_lowercase(), value.to_string()));
        if invalid {
            return Ok(());
        }
        if let Some(validator) = validator_table().get(&hash) {
            validator(self, value)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Content length as the body reader sees it: explicit length, or
    /// none for chunked.
    pub fn body_length(&self) -> Option<u64> {
        if self.chunked {
            None
        } else {
            self.content_length
        }
    }

    pub fn has_body(&self) -> bool {
        self.chunked || self.content_length.map(|n| n > 0).unwrap_or(false)
    }
}

fn validate_host(headers: &mut HeadersIn, value: &str) -> std::result::Result<(), u16> {
    if headers.host_from_uri {
        return Ok(());
    }
    if headers.host.is_some() {
        return Err(HTTP_BAD_REQUEST);
    }
    let host = normalize_host(value).ok_or(HTTP_BAD_REQUEST)?;
    headers.host = Some(host);
    Ok(())
}

/// Lowercase, strip the port and any trailing dot. An empty host is kept
/// as an empty string: HTTP/1.0 allows it, the lifecycle layer enforces
/// the HTTP/1.1 requirement.
pub fn normalize_host(value: &str) -> Option<String> {
    let value = value.trim();
    let host = match value.strip_prefix('[') {
        // Bracketed IPv6 literal, port after the bracket.
        Some(rest) => {
            let close = rest.find(']')?;
            &value[..close + 2]
        }
        None => value.split(':').next().unwrap_or(""),
    };
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.contains(|c: char| c.is_whitespace() || c == '/' || c == '\\' || c == '\0') {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

fn validate_connection(headers: &mut HeadersIn, value: &str) -> std::result::Result<(), u16> {
    for token in value.split(',') {
        match token.trim().to_ascii_lowercase().as_str() {
            "close" => headers.connection = ConnectionPolicy::Close,
            "keep-alive" => {
                if headers.connection != ConnectionPolicy::Close {
                    headers.connection = ConnectionPolicy::KeepAlive;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_content_length(headers: &mut HeadersIn, value: &str) -> std::result::Result<(), u16> {
    if headers.content_length.is_some() {
        return Err(HTTP_BAD_REQUEST);
    }
    let length: u64 = value.trim().parse().map_err(|_| HTTP_BAD_REQUEST)?;
    headers.content_length = Some(length);
    Ok(())
}

fn validate_transfer_encoding(
    headers: &mut HeadersIn,
    value: &str,
) -> std::result::Result<(), u16> {
    match value.trim().to_ascii_lowercase().as_str() {
        "chunked" => {
            headers.chunked = true;
            Ok(())
        }
        "identity" => Ok(()),
        _ => Err(HTTP_NOT_IMPLEMENTED),
    }
}

fn validate_expect(headers: &mut HeadersIn, value: &str) -> std::result::Result<(), u16> {
    if value.trim().eq_ignore_ascii_case("100-continue") {
        headers.expect_continue = true;
    }
    Ok(())
}

fn validate_if_modified_since(
    headers: &mut HeadersIn,
    value: &str,
) -> std::result::Result<(), u16> {
    // An unparsable validator is ignored, not an error.
    headers.if_modified_since = httpdate::parse_http_date(value.trim()).ok();
    Ok(())
}

fn validate_if_none_match(headers: &mut HeadersIn, value: &str) -> std::result::Result<(), u16> {
    headers.if_none_match = Some(value.trim().to_string());
    Ok(())
}

fn validate_range(headers: &mut HeadersIn, value: &str) -> std::result::Result<(), u16> {
    headers.range = Some(value.trim().to_string());
    Ok(())
}

fn validate_user_agent(headers: &mut HeadersIn, value: &str) -> std::result::Result<(), u16> {
    headers.user_agent = Some(value.to_string());
    Ok(())
}

fn validate_authorization(headers: &mut HeadersIn, value: &str) -> std::result::Result<(), u16> {
    headers.authorization = Some(value.to_string());
    Ok(())
}

fn validate_x_forwarded_for(headers: &mut HeadersIn, value: &str) -> std::result::Result<(), u16> {
    headers.x_forwarded_for = Some(value.to_string());
    Ok(())
}

fn validate_cookie(headers: &mut HeadersIn, value: &str) -> std::result::Result<(), u16> {
    headers.cookies.push(value.to_string());
    Ok(())
}

/// Response-side headers, filled by handlers and serialized by the header
/// writer filter.
#[derive(Debug, Default)]
pub struct HeadersOut {
    pub status: u16,
    /// Overrides the canonical reason phrase when set.
    pub status_line: Option<String>,

    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub last_modified: Option<SystemTime>,
    pub etag: Option<String>,
    pub location: Option<String>,
    pub content_range: Option<String>,
    pub accept_ranges: bool,
    pub chunked: bool,

    /// Anything else, in emission order.
    pub extra: Vec<(String, String)>,
}

impl HeadersOut {
    pub fn add(&mut self, name: &str, value: &str) {
        self.extra.push((name.to_string(), value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(headers: &mut HeadersIn, name: &str, value: &str) -> std::result::Result<(), u16> {
        headers.add(name, value, header_hash(name.as_bytes()), false)
    }

    #[test]
    fn host_is_normalized_once() {
        let mut headers = HeadersIn::default();
        add(&mut headers, "Host", "EXAMPLE.com:8080").unwrap();
        assert_eq!(headers.host.as_deref(), Some("example.com"));
        assert_eq!(
            add(&mut headers, "Host", "other"),
            Err(HTTP_BAD_REQUEST),
            "duplicate Host is rejected"
        );
    }

    #[test]
    fn ipv6_host_keeps_brackets() {
        assert_eq!(normalize_host("[::1]:8080").as_deref(), Some("[::1]"));
        assert_eq!(normalize_host("example.com."), Some("example.com".into()));
        assert!(normalize_host("exa mple").is_none());
    }

    #[test]
    fn connection_close_wins_over_keepalive() {
        let mut headers = HeadersIn::default();
        add(&mut headers, "Connection", "keep-alive, close").unwrap();
        assert_eq!(headers.connection, ConnectionPolicy::Close);
    }

    #[test]
    fn content_length_must_be_single_and_numeric() {
        let mut headers = HeadersIn::default();
        add(&mut headers, "Content-Length", "42").unwrap();
        assert_eq!(headers.content_length, Some(42));
        assert!(add(&mut headers, "Content-Length", "42").is_err());

        let mut headers = HeadersIn::default();
        assert!(add(&mut headers, "Content-Length", "4x").is_err());
    }

    #[test]
    fn unknown_transfer_coding_is_not_implemented() {
        let mut headers = HeadersIn::default();
        assert_eq!(
            add(&mut headers, "Transfer-Encoding", "gzip"),
            Err(HTTP_NOT_IMPLEMENTED)
        );
        add(&mut headers, "Transfer-Encoding", "chunked").unwrap();
        assert!(headers.chunked);
        assert_eq!(headers.body_length(), None);
    }

    #[test]
    fn invalid_fields_are_recorded_but_not_validated() {
        let mut headers = HeadersIn::default();
        headers
            .add("x_bad", "v", header_hash(b"x_bad"), true)
            .unwrap();
        assert_eq!(headers.get("x_bad"), Some("v"));
    }

    #[test]
    fn cookies_accumulate() {
        let mut headers = HeadersIn::default();
        add(&mut headers, "Cookie", "a=1").unwrap();
        add(&mut headers, "Cookie", "b=2").unwrap();
        assert_eq!(headers.cookies.len(), 2);
    }
}
