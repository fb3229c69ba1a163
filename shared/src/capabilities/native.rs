//! `reqwest`-backed transport for native shells.

use std::time::{Duration, Instant};

use tracing::debug;

use super::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport,
};
use crate::sync::USER_AGENT;

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| HttpError::InvalidRequest {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let started = Instant::now();
        let method = match request.method() {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Put => reqwest::Method::PUT,
        };

        let mut builder = self
            .client
            .request(method, request.url().as_str())
            .timeout(Duration::from_millis(request.timeout_ms()));
        for (name, value) in request.headers().iter() {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body() {
            builder = builder.body(body.to_vec());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout {
                    timeout_ms: request.timeout_ms(),
                    request_id: request.request_id().to_string(),
                }
            } else {
                HttpError::ConnectionError {
                    host: request.url().host(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let mut headers = HttpHeaders::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else {
                continue;
            };
            // Transport-managed headers are refused by HttpHeaders.
            if let Err(error) = headers.insert(name.as_str(), value) {
                debug!(%error, "response header skipped");
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| HttpError::InvalidResponse {
                reason: e.to_string(),
                request_id: request.request_id().to_string(),
            })?;

        debug!(
            request_id = request.request_id(),
            status,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "response received"
        );
        Ok(HttpResponse::new(
            status,
            headers,
            body.to_vec(),
            request.request_id().to_string(),
        ))
    }
}
