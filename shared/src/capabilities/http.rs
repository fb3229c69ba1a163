//! Request and response types shared by every [`HttpTransport`].
//!
//! Requests are checked when they are built, so a transport only ever sees
//! an http(s) URL with a host, well-formed headers and a bounded body.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const MAX_URL_LENGTH: usize = 2048;
/// The contents API refuses files over 100 MB; base64 inflates by a third.
pub const MAX_BODY_BYTES: usize = 75 * 1024 * 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_HEADER_VALUE_LENGTH: usize = 8192;

/// Set by the transport, never by callers.
const MANAGED_HEADERS: [&str; 4] = ["host", "content-length", "transfer-encoding", "connection"];

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("request body is {size} bytes, limit is {max}")]
    BodyTooLarge { size: usize, max: usize },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("could not serialize request body: {message}")]
    SerializationError { message: String },

    #[error("could not reach {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("no answer within {timeout_ms}ms")]
    Timeout { timeout_ms: u64, request_id: String },

    #[error("unreadable response: {reason}")]
    InvalidResponse { reason: String, request_id: String },
}

/// An absolute http(s) URL with a host and no embedded credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl(String);

impl ValidatedUrl {
    pub fn new(url: impl AsRef<str>) -> Result<Self, HttpError> {
        let raw = url.as_ref();
        if raw.trim().is_empty() {
            return Err(invalid_url(raw, "empty URL"));
        }
        if raw.len() > MAX_URL_LENGTH {
            return Err(invalid_url(raw, &format!("longer than {MAX_URL_LENGTH} bytes")));
        }
        let parsed = Url::parse(raw).map_err(|e| invalid_url(raw, &e.to_string()))?;
        Self::from_url(&parsed)
    }

    pub fn from_url(url: &Url) -> Result<Self, HttpError> {
        let raw = url.as_str();
        if raw.len() > MAX_URL_LENGTH {
            return Err(invalid_url(raw, &format!("longer than {MAX_URL_LENGTH} bytes")));
        }
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid_url(raw, &format!("unsupported scheme '{}'", url.scheme())));
        }
        if url.host_str().is_none() {
            return Err(invalid_url(raw, "no host"));
        }
        // The token goes in the Authorization header.
        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid_url(raw, "credentials in URL"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn host(&self) -> String {
        Url::parse(&self.0)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .unwrap_or_default()
    }
}

fn invalid_url(url: &str, reason: &str) -> HttpError {
    let shown = match url.char_indices().nth(80) {
        Some((cut, _)) => format!("{}...", &url[..cut]),
        None => url.to_string(),
    };
    HttpError::InvalidUrl {
        url: shown,
        reason: reason.to_string(),
    }
}

/// Header list with case-insensitive names. Inserting a name again replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeaders(Vec<(String, String)>);

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), HttpError> {
        let name = name.into();
        let value = value.into();
        let refuse = |reason: &str| HttpError::InvalidHeader {
            name: name.clone(),
            reason: reason.to_string(),
        };

        // RFC 9110 token characters.
        let is_tchar = |c: char| c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c);
        if name.is_empty() || !name.chars().all(is_tchar) {
            return Err(refuse("not a valid header name"));
        }
        if MANAGED_HEADERS.iter().any(|m| name.eq_ignore_ascii_case(m)) {
            return Err(refuse("managed by the transport"));
        }
        if value.len() > MAX_HEADER_VALUE_LENGTH {
            return Err(refuse("value too long"));
        }
        if value.contains(['\r', '\n', '\0']) {
            return Err(refuse("value contains CR, LF or NUL"));
        }

        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.0.push((name, value));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The contents API only needs reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Put,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    method: HttpMethod,
    url: ValidatedUrl,
    headers: HttpHeaders,
    body: Option<Vec<u8>>,
    timeout_ms: u64,
    request_id: String,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: ValidatedUrl) -> Self {
        Self {
            method,
            url,
            headers: HttpHeaders::new(),
            body: None,
            timeout_ms: duration_ms(DEFAULT_TIMEOUT),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn get(url: ValidatedUrl) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn put(url: ValidatedUrl) -> Self {
        Self::new(HttpMethod::Put, url)
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, HttpError> {
        self.headers.insert(name, value)?;
        Ok(self)
    }

    /// Serializes `value` as the body. Only `PUT` carries one.
    pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self, HttpError> {
        if self.method != HttpMethod::Put {
            return Err(HttpError::InvalidRequest {
                reason: format!("{} has no body", self.method.as_str()),
            });
        }
        let body = serde_json::to_vec(value).map_err(|e| HttpError::SerializationError {
            message: e.to_string(),
        })?;
        if body.len() > MAX_BODY_BYTES {
            return Err(HttpError::BodyTooLarge {
                size: body.len(),
                max: MAX_BODY_BYTES,
            });
        }
        self.headers.insert("Content-Type", "application/json")?;
        self.body = Some(body);
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, HttpError> {
        if timeout.is_zero() || timeout > MAX_TIMEOUT {
            return Err(HttpError::InvalidRequest {
                reason: format!(
                    "timeout must be between 1ms and {}ms",
                    duration_ms(MAX_TIMEOUT)
                ),
            });
        }
        self.timeout_ms = duration_ms(timeout);
        Ok(self)
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url(&self) -> &ValidatedUrl {
        &self.url
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    status: u16,
    headers: HttpHeaders,
    body: Vec<u8>,
    request_id: String,
}

impl HttpResponse {
    pub fn new(status: u16, headers: HttpHeaders, body: Vec<u8>, request_id: String) -> Self {
        Self {
            status,
            headers,
            body,
            request_id,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|e| HttpError::InvalidResponse {
            reason: format!("body is not the expected JSON: {e}"),
            request_id: self.request_id.clone(),
        })
    }

    /// The `message` of a JSON error body, else the bare status.
    pub fn error_message(&self) -> String {
        #[derive(Deserialize)]
        struct ErrorBody {
            message: String,
        }

        serde_json::from_slice::<ErrorBody>(&self.body)
            .map(|b| b.message)
            .unwrap_or_else(|_| format!("HTTP error: {}", self.status))
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

pub type HttpResult = Result<HttpResponse, HttpError>;

/// Executes requests on behalf of the shell. The core never talks to the network itself.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> HttpResult;
}
