//! HTTP caching semantics: directives, validators and expiry.
//!
//! A client-side, private cache: `s-maxage` and `public`/`private` are
//! ignored. `max-age` wins over `Expires`; an unparsable `Expires` means
//! already expired.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::http::{header, HttpResponse};
use crate::request::{CachePolicy, OperationRequest};

/// Longest lifetime any entry is given: ten years.
pub const MAX_LIFETIME_SECS: i64 = 10 * 365 * 86_400;

/// Revalidation token taken from a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validator {
    /// `ETag`.
    Strong(String),
    /// `Last-Modified`.
    Weak(String),
}

impl Validator {
    /// The conditional request header that carries this validator.
    pub fn conditional_header(&self) -> (String, String) {
        match self {
            Validator::Strong(etag) => ("If-None-Match".to_string(), etag.clone()),
            Validator::Weak(date) => ("If-Modified-Since".to_string(), date.clone()),
        }
    }
}

fn directives(headers: &[(String, String)]) -> impl Iterator<Item = String> + '_ {
    headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("cache-control"))
        .flat_map(|(_, v)| v.split(','))
        .map(|d| d.trim().to_ascii_lowercase())
}

/// `no-store`, `no-cache`, or `Pragma: no-cache`.
pub fn has_do_not_cache_directive(headers: &[(String, String)]) -> bool {
    let pragma = header(headers, "pragma")
        .map(|p| p.to_ascii_lowercase().contains("no-cache"))
        .unwrap_or(false);
    pragma || directives(headers).any(|d| d == "no-store" || d == "no-cache")
}

/// Any header a server uses to opt into caching.
pub fn has_cache_headers(headers: &[(String, String)]) -> bool {
    ["cache-control", "expires", "etag", "last-modified"]
        .iter()
        .any(|name| header(headers, name).is_some())
}

/// Prefer the strong validator.
pub fn validator(headers: &[(String, String)]) -> Option<Validator> {
    if let Some(etag) = header(headers, "etag") {
        return Some(Validator::Strong(etag.trim().to_string()));
    }
    header(headers, "last-modified").map(|lm| Validator::Weak(lm.trim().to_string()))
}

/// `max-age` in seconds, clamped to `0..=MAX_LIFETIME_SECS`. A value too
/// large for an integer is treated as the ceiling.
fn max_age(headers: &[(String, String)]) -> Option<i64> {
    directives(headers).find_map(|d| {
        d.strip_prefix("max-age=").map(|v| {
            let v = v.trim_matches('"');
            let secs = match v.parse::<i64>() {
                Ok(secs) => secs,
                Err(_) if !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()) => MAX_LIFETIME_SECS,
                Err(_) => 0,
            };
            secs.clamp(0, MAX_LIFETIME_SECS)
        })
    })
}

/// `now + lifetime`, saturating at `now + MAX_LIFETIME_SECS`.
pub fn expires_after(now: DateTime<Utc>, lifetime: Duration) -> DateTime<Utc> {
    let ceiling = Duration::seconds(MAX_LIFETIME_SECS);
    now.checked_add_signed(lifetime.min(ceiling))
        .or_else(|| now.checked_add_signed(ceiling))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Absolute expiry declared by the headers, if any.
pub fn expiry(headers: &[(String, String)], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(secs) = max_age(headers) {
        return Some(expires_after(now, Duration::seconds(secs)));
    }
    header(headers, "expires").map(|raw| {
        DateTime::parse_from_rfc2822(raw.trim())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(now)
    })
}

/// Decide whether `response` to `request` is stored and until when.
///
/// Returns `None` when the entry must not be written to either tier.
pub fn storage_expiry(
    request: &OperationRequest,
    response: &HttpResponse,
    now: DateTime<Utc>,
    default_expiry: Duration,
) -> Option<DateTime<Utc>> {
    if !request.method.is_safe() || !response.is_success() {
        return None;
    }
    if has_do_not_cache_directive(&response.headers) {
        return None;
    }
    let declared = expiry(&response.headers, now);
    match request.cache_policy {
        CachePolicy::DoNotCache => None,
        CachePolicy::AlwaysCache => Some(declared.unwrap_or_else(|| expires_after(now, default_expiry))),
        CachePolicy::Default if has_cache_headers(&response.headers) => {
            Some(declared.unwrap_or_else(|| expires_after(now, default_expiry)))
        }
        CachePolicy::Default => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn h(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn ok(headers: &[(&str, &str)]) -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: h(headers),
            body: b"x".to_vec(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn no_store_and_no_cache_prevent_caching() {
        assert!(has_do_not_cache_directive(&h(&[("Cache-Control", "private, no-store")])));
        assert!(has_do_not_cache_directive(&h(&[("cache-control", "No-Cache")])));
        assert!(has_do_not_cache_directive(&h(&[("Pragma", "no-cache")])));
        assert!(!has_do_not_cache_directive(&h(&[("Cache-Control", "max-age=60")])));
    }

    #[test]
    fn etag_wins_over_last_modified() {
        let headers = h(&[
            ("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT"),
            ("ETag", "\"v1\""),
        ]);
        assert_eq!(validator(&headers), Some(Validator::Strong("\"v1\"".into())));
        assert_eq!(
            Validator::Strong("\"v1\"".into()).conditional_header(),
            ("If-None-Match".to_string(), "\"v1\"".to_string())
        );
        assert_eq!(
            Validator::Weak("d".into()).conditional_header().0,
            "If-Modified-Since"
        );
    }

    #[test]
    fn max_age_wins_over_expires() {
        let headers = h(&[
            ("Expires", "Mon, 01 Jan 2024 13:00:00 GMT"),
            ("Cache-Control", "public, max-age=30"),
        ]);
        assert_eq!(expiry(&headers, now()), Some(now() + Duration::seconds(30)));
    }

    #[test]
    fn huge_max_age_is_capped_at_the_lifetime_ceiling() {
        let ceiling = Some(now() + Duration::seconds(MAX_LIFETIME_SECS));
        let huge = h(&[("Cache-Control", "max-age=9999999999999")]);
        assert_eq!(expiry(&huge, now()), ceiling);
        let overflowing = h(&[("Cache-Control", "max-age=99999999999999999999999")]);
        assert_eq!(expiry(&overflowing, now()), ceiling);
        let negative = h(&[("Cache-Control", "max-age=-5")]);
        assert_eq!(expiry(&negative, now()), Some(now()));
    }

    #[test]
    fn lifetime_saturates_near_the_end_of_time() {
        let late = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        assert_eq!(expires_after(late, Duration::seconds(60)), late + Duration::seconds(60));
        assert_eq!(expires_after(late, Duration::days(3650)), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            storage_expiry(
                &OperationRequest::get("http://example.com/"),
                &ok(&[("Cache-Control", "max-age=9999999999999")]),
                late,
                Duration::seconds(60),
            ),
            Some(DateTime::<Utc>::MAX_UTC)
        );
    }

    #[test]
    fn expires_header_is_parsed() {
        let headers = h(&[("Expires", "Mon, 01 Jan 2024 13:00:00 GMT")]);
        assert_eq!(expiry(&headers, now()), Some(now() + Duration::hours(1)));
        let bad = h(&[("Expires", "0")]);
        assert_eq!(expiry(&bad, now()), Some(now()));
    }

    #[test]
    fn default_policy_needs_cache_headers() {
        let req = OperationRequest::get("http://example.com/");
        let default = Duration::seconds(60);
        assert_eq!(storage_expiry(&req, &ok(&[]), now(), default), None);
        assert_eq!(
            storage_expiry(&req, &ok(&[("ETag", "\"a\"")]), now(), default),
            Some(now() + default)
        );
    }

    #[test]
    fn always_cache_forces_a_write_but_not_past_no_store() {
        let mut req = OperationRequest::get("http://example.com/");
        req.set_cache_policy(CachePolicy::AlwaysCache);
        let default = Duration::seconds(60);
        assert_eq!(storage_expiry(&req, &ok(&[]), now(), default), Some(now() + default));
        assert_eq!(
            storage_expiry(&req, &ok(&[("Cache-Control", "no-store")]), now(), default),
            None
        );
    }

    #[test]
    fn do_not_cache_and_errors_are_never_stored() {
        let mut req = OperationRequest::get("http://example.com/");
        req.set_cache_policy(CachePolicy::DoNotCache);
        let headers = [("Cache-Control", "max-age=60")];
        assert_eq!(storage_expiry(&req, &ok(&headers), now(), Duration::seconds(1)), None);

        let req = OperationRequest::get("http://example.com/");
        let mut err = ok(&headers);
        err.status = 500;
        assert_eq!(storage_expiry(&req, &err, now(), Duration::seconds(1)), None);
    }
}
