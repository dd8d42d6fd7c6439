//! Canonical request identity used for caching and deduplication.
//!
//! Two requests that differ only in query-parameter order, host case,
//! default port, fragment, or escaping of unreserved characters produce the
//! same `RequestKey`. Only headers that change the representation a server
//! returns take part in the key.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::http::{HttpMethod, HttpRequest};

/// Headers that select between representations of the same resource.
const KEYED_HEADERS: &[&str] = &["accept", "accept-encoding", "accept-language", "authorization"];

/// Identity of a logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    method: HttpMethod,
    url: String,
    headers: Vec<(String, String)>,
    body_digest: Option<String>,
}

impl RequestKey {
    /// Compute the key. Never fails: a URL that does not parse is keyed by
    /// its trimmed text.
    pub fn new(
        method: HttpMethod,
        url: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Self {
        let mut keyed: Vec<(String, String)> = headers
            .iter()
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .filter(|(k, _)| KEYED_HEADERS.contains(&k.as_str()))
            .collect();
        keyed.sort();
        keyed.dedup_by(|a, b| a.0 == b.0);

        let body_digest = body
            .filter(|b| method.carries_body() && !b.is_empty())
            .map(|b| hex::encode(Sha256::digest(b)));

        Self {
            method,
            url: canonical_url(url),
            headers: keyed,
            body_digest,
        }
    }

    pub fn from_request(request: &HttpRequest) -> Self {
        Self::new(
            request.method,
            &request.url,
            &request.headers,
            request.body.as_deref(),
        )
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stable hex SHA-256 over every component of the key.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.url.as_bytes());
        for (k, v) in &self.headers {
            hasher.update(b"|");
            hasher.update(k.as_bytes());
            hasher.update(b":");
            hasher.update(v.as_bytes());
        }
        if let Some(digest) = &self.body_digest {
            hasher.update(b"|body:");
            hasher.update(digest.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// Normalize an absolute URL: lower-case scheme and host, drop the default
/// port and the fragment, normalize path escapes and sort the query.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    url.set_fragment(None);

    let path = normalize_escapes(url.path());
    url.set_path(&path);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        url.set_query(Some(&query));
    }

    url.to_string()
}

/// Decode `%XX` escapes of unreserved characters and upper-case the rest.
fn normalize_escapes(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(path.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
                    out.push(byte as char);
                } else {
                    out.push('%');
                    out.push_str(&hex.to_ascii_uppercase());
                }
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> RequestKey {
        RequestKey::new(HttpMethod::Get, url, &[], None)
    }

    #[test]
    fn query_order_does_not_matter() {
        assert_eq!(
            get("http://example.com/items?b=2&a=1"),
            get("http://example.com/items?a=1&b=2")
        );
    }

    #[test]
    fn host_case_default_port_and_fragment_are_normalized() {
        assert_eq!(
            get("HTTP://Example.COM:80/item/42#top"),
            get("http://example.com/item/42")
        );
    }

    #[test]
    fn unreserved_escapes_are_decoded() {
        assert_eq!(get("http://example.com/%7Euser/a%2fb"), get("http://example.com/~user/a%2Fb"));
    }

    #[test]
    fn query_escaping_is_normalized() {
        assert_eq!(
            get("http://example.com/search?q=a%20b"),
            get("http://example.com/search?q=a+b")
        );
    }

    #[test]
    fn method_is_part_of_the_key() {
        let head = RequestKey::new(HttpMethod::Head, "http://example.com/", &[], None);
        assert_ne!(head, get("http://example.com/"));
    }

    #[test]
    fn only_representation_headers_count() {
        let a = RequestKey::new(
            HttpMethod::Get,
            "http://example.com/",
            &[
                ("Accept".to_string(), "application/json".to_string()),
                ("X-Request-Id".to_string(), "1".to_string()),
            ],
            None,
        );
        let b = RequestKey::new(
            HttpMethod::Get,
            "http://example.com/",
            &[
                ("X-Request-Id".to_string(), "2".to_string()),
                ("accept".to_string(), " application/json ".to_string()),
            ],
            None,
        );
        assert_eq!(a, b);

        let c = RequestKey::new(
            HttpMethod::Get,
            "http://example.com/",
            &[("Accept".to_string(), "text/html".to_string())],
            None,
        );
        assert_ne!(a, c);
    }

    #[test]
    fn body_distinguishes_writes() {
        let a = RequestKey::new(HttpMethod::Post, "http://example.com/", &[], Some(b"a=1"));
        let b = RequestKey::new(HttpMethod::Post, "http://example.com/", &[], Some(b"a=2"));
        assert_ne!(a, b);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn unparsable_url_is_keyed_verbatim() {
        let key = get("  not a url  ");
        assert_eq!(key.url(), "not a url");
    }

    #[test]
    fn digest_is_stable_hex() {
        let key = get("http://example.com/item/42");
        assert_eq!(key.digest(), get("http://example.com/item/42").digest());
        assert_eq!(key.digest().len(), 64);
        assert_eq!(key.to_string(), "GET http://example.com/item/42");
    }
}
