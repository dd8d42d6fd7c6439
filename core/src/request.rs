//! Caller-facing description of one network operation.
//!
//! # Design
//! `OperationRequest` carries everything needed to rebuild a transfer:
//! target, headers, parameters, body, encoding and the per-operation policy
//! flags. It is `Serialize` so the freeze store can persist it verbatim, and
//! `build` turns it into the `HttpRequest` a transport executes. The engine
//! creates these from a host and path; tests and FFI callers may also build
//! them directly from an absolute URL.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::OperationError;
use crate::http::{self, HttpMethod, HttpRequest};
use crate::key::RequestKey;

/// How parameters are encoded into a request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterEncoding {
    /// `application/x-www-form-urlencoded`.
    #[default]
    Url,
    /// `application/json` object.
    Json,
    /// The caller supplies an encoded multipart body; parameters stay in
    /// the query string.
    Multipart,
}

/// Cache write override for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Store when the response headers allow it.
    #[default]
    Default,
    /// Never store.
    DoNotCache,
    /// Store even without caching headers, using the default expiry.
    AlwaysCache,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct BasicAuth {
    username: String,
    password: String,
}

/// A logical request, before it is submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default, with = "body_base64")]
    pub body: Option<Vec<u8>>,
    #[serde(default)]
    pub encoding: ParameterEncoding,
    #[serde(default)]
    pub freezable: bool,
    #[serde(default)]
    pub cache_policy: CachePolicy,
    /// Skip both cache tiers on read.
    #[serde(default)]
    pub ignore_cache: bool,
    /// Deliver a fresh cached copy but still load from the network.
    #[serde(default)]
    pub always_load: bool,
    #[serde(default, with = "optional_millis")]
    pub timeout: Option<Duration>,
    /// Write a successful body to this file instead of memory.
    #[serde(default)]
    pub download_path: Option<PathBuf>,
    #[serde(default)]
    basic_auth: Option<BasicAuth>,
}

impl OperationRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            params: BTreeMap::new(),
            body: None,
            encoding: ParameterEncoding::default(),
            freezable: false,
            cache_policy: CachePolicy::default(),
            ignore_cache: false,
            always_load: false,
            timeout: None,
            download_path: None,
            basic_auth: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn add_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        http::set_header(&mut self.headers, name, value);
        self
    }

    pub fn add_headers<I, K, V>(&mut self, headers: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (k, v) in headers {
            http::set_header(&mut self.headers, k.as_ref(), v);
        }
        self
    }

    pub fn add_param(&mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> &mut Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Attach a pre-encoded body. Replaces any parameter-derived body.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>, content_type: &str) -> &mut Self {
        self.body = Some(body.into());
        http::set_header(&mut self.headers, "Content-Type", content_type);
        self
    }

    pub fn set_encoding(&mut self, encoding: ParameterEncoding) -> &mut Self {
        self.encoding = encoding;
        self
    }

    pub fn set_freezable(&mut self, freezable: bool) -> &mut Self {
        self.freezable = freezable;
        self
    }

    pub fn set_cache_policy(&mut self, policy: CachePolicy) -> &mut Self {
        self.cache_policy = policy;
        self
    }

    pub fn set_ignore_cache(&mut self, ignore: bool) -> &mut Self {
        self.ignore_cache = ignore;
        self
    }

    pub fn set_always_load(&mut self, always_load: bool) -> &mut Self {
        self.always_load = always_load;
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// Stream a 2xx body to `path`. The file appears only once the whole
    /// body has arrived, and such operations bypass the cache tiers.
    pub fn set_download_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.download_path = Some(path.into());
        self
    }

    /// Send HTTP Basic credentials with the first attempt.
    pub fn set_username_password(&mut self, username: &str, password: &str) -> &mut Self {
        self.basic_auth = Some(BasicAuth {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Set `Authorization: <scheme> <token>`, e.g. `Bearer`.
    pub fn set_authorization(&mut self, token: &str, scheme: &str) -> &mut Self {
        http::set_header(&mut self.headers, "Authorization", format!("{scheme} {token}"));
        self
    }

    /// Whether responses to this request may be read from or written to the
    /// cache tiers.
    pub fn is_cacheable(&self) -> bool {
        self.method.is_safe()
            && self.cache_policy != CachePolicy::DoNotCache
            && self.download_path.is_none()
    }

    /// Whether an identical in-flight operation may absorb this one.
    /// Downloads never share, since each names its own target file.
    pub fn is_shareable(&self) -> bool {
        self.method.is_safe() && self.download_path.is_none()
    }

    /// Build the wire request. Parameters land in the query for methods
    /// without a body and in the body otherwise.
    pub fn build(&self) -> Result<HttpRequest, OperationError> {
        let mut headers = self.headers.clone();
        let mut body = self.body.clone();
        let params_in_body = self.method.carries_body()
            && self.encoding != ParameterEncoding::Multipart
            && body.is_none();

        let url = if params_in_body || self.params.is_empty() {
            self.url.clone()
        } else {
            append_query(&self.url, &self.params)?
        };

        if params_in_body && !self.params.is_empty() {
            let (encoded, content_type) = match self.encoding {
                ParameterEncoding::Json => (
                    serde_json::to_vec(&self.params)
                        .map_err(|e| OperationError::Encoding(e.to_string()))?,
                    "application/json",
                ),
                _ => (
                    form_encode(&self.params).into_bytes(),
                    "application/x-www-form-urlencoded",
                ),
            };
            if http::header(&headers, "content-type").is_none() {
                headers.push(("Content-Type".to_string(), content_type.to_string()));
            }
            body = Some(encoded);
        }

        if let Some(auth) = &self.basic_auth {
            if http::header(&headers, "authorization").is_none() {
                let token = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", auth.username, auth.password));
                headers.push(("Authorization".to_string(), format!("Basic {token}")));
            }
        }

        Ok(HttpRequest {
            method: self.method,
            url,
            headers,
            body,
            timeout: self.timeout,
            download_to: self.download_path.clone(),
        })
    }

    /// The request's identity. A request that cannot be built is keyed by
    /// its raw URL, method and headers.
    pub fn key(&self) -> RequestKey {
        match self.build() {
            Ok(req) => RequestKey::from_request(&req),
            Err(_) => RequestKey::new(self.method, &self.url, &self.headers, None),
        }
    }

    /// Render an equivalent cURL command line.
    pub fn to_curl(&self) -> String {
        let req = match self.build() {
            Ok(req) => req,
            Err(err) => return format!("# unbuildable request: {err}"),
        };
        let mut out = format!("curl -X {} '{}'", req.method, req.url);
        for (k, v) in &req.headers {
            out.push_str(&format!(" -H '{k}: {}'", v.replace('\'', "'\\''")));
        }
        if let Some(body) = &req.body {
            match std::str::from_utf8(body) {
                Ok(text) => out.push_str(&format!(" -d '{}'", text.replace('\'', "'\\''"))),
                Err(_) => out.push_str(&format!(" --data-binary @- # {} bytes", body.len())),
            }
        }
        if let Some(path) = &self.download_path {
            out.push_str(&format!(" -o '{}'", path.display()));
        }
        out
    }
}

fn param_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn form_encode(params: &BTreeMap<String, serde_json::Value>) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), param_text(v))))
        .finish()
}

fn append_query(
    raw: &str,
    params: &BTreeMap<String, serde_json::Value>,
) -> Result<String, OperationError> {
    let mut url = Url::parse(raw).map_err(|e| OperationError::Encoding(format!("{raw}: {e}")))?;
    {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in params {
            pairs.append_pair(k, &param_text(v));
        }
    }
    Ok(url.to_string())
}

mod body_base64 {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match body {
            Some(bytes) => s.serialize_some(&base64::engine::general_purpose::STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        text.map(|t| {
            base64::engine::general_purpose::STANDARD
                .decode(t)
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_params_go_to_the_query() {
        let mut op = OperationRequest::get("http://example.com/search");
        op.add_param("q", "rust").add_param("page", 2);
        let req = op.build().unwrap();
        assert_eq!(req.url, "http://example.com/search?page=2&q=rust");
        assert!(req.body.is_none());
    }

    #[test]
    fn post_params_are_form_encoded() {
        let mut op = OperationRequest::new(HttpMethod::Post, "http://example.com/items");
        op.add_param("title", "buy milk");
        let req = op.build().unwrap();
        assert_eq!(req.url, "http://example.com/items");
        assert_eq!(req.body.as_deref(), Some(&b"title=buy+milk"[..]));
        assert_eq!(
            req.header("content-type"),
            Some("application/x-www-form-urlencoded")
        );
    }

    #[test]
    fn json_encoding_keeps_value_types() {
        let mut op = OperationRequest::new(HttpMethod::Put, "http://example.com/items/1");
        op.set_encoding(ParameterEncoding::Json)
            .add_param("done", true)
            .add_param("count", 3);
        let req = op.build().unwrap();
        let body: serde_json::Value = serde_json::from_slice(req.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["done"], true);
        assert_eq!(body["count"], 3);
        assert_eq!(req.header("Content-Type"), Some("application/json"));
    }

    #[test]
    fn multipart_keeps_caller_body_and_queries_params() {
        let mut op = OperationRequest::new(HttpMethod::Post, "http://example.com/upload");
        op.set_encoding(ParameterEncoding::Multipart)
            .set_body(b"--b\r\n...".to_vec(), "multipart/form-data; boundary=b")
            .add_param("album", "x");
        let req = op.build().unwrap();
        assert_eq!(req.url, "http://example.com/upload?album=x");
        assert_eq!(req.body.as_deref(), Some(&b"--b\r\n..."[..]));
    }

    #[test]
    fn basic_auth_becomes_a_header() {
        let mut op = OperationRequest::get("http://example.com/private");
        op.set_username_password("ann", "secret");
        let req = op.build().unwrap();
        assert_eq!(req.header("authorization"), Some("Basic YW5uOnNlY3JldA=="));
    }

    #[test]
    fn key_ignores_param_insertion_order() {
        let mut a = OperationRequest::get("http://example.com/item");
        a.add_param("b", "2").add_param("a", "1");
        let b = OperationRequest::get("http://example.com/item?b=2&a=1");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn curl_rendering_includes_headers_and_body() {
        let mut op = OperationRequest::new(HttpMethod::Post, "http://example.com/items");
        op.add_header("X-Trace", "1").add_param("title", "it's");
        let curl = op.to_curl();
        assert!(curl.starts_with("curl -X POST 'http://example.com/items'"));
        assert!(curl.contains("-H 'X-Trace: 1'"));
        assert!(curl.contains("-d 'title=it%27s'"));
    }

    #[test]
    fn cacheable_only_for_safe_methods() {
        assert!(OperationRequest::get("http://example.com/").is_cacheable());
        let mut no_cache = OperationRequest::get("http://example.com/");
        no_cache.set_cache_policy(CachePolicy::DoNotCache);
        assert!(!no_cache.is_cacheable());
        assert!(!OperationRequest::new(HttpMethod::Post, "http://example.com/").is_cacheable());
    }

    #[test]
    fn downloads_skip_the_cache_and_never_share() {
        let mut op = OperationRequest::get("http://example.com/file");
        assert!(op.is_shareable());
        op.set_download_path("/tmp/file.bin");
        assert!(!op.is_cacheable());
        assert!(!op.is_shareable());

        let req = op.build().unwrap();
        assert_eq!(req.download_to, Some(PathBuf::from("/tmp/file.bin")));
        assert!(op.to_curl().ends_with("-o '/tmp/file.bin'"));
    }

    #[test]
    fn survives_json_persistence() {
        let mut op = OperationRequest::new(HttpMethod::Post, "http://example.com/items");
        op.set_body(vec![0u8, 159, 146, 150], "application/octet-stream")
            .set_freezable(true)
            .set_timeout(Duration::from_millis(1500));
        let json = serde_json::to_string(&op).unwrap();
        let back: OperationRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }
}
