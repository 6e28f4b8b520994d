use std::time::{Duration, SystemTime};

use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER},
    StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{detect_null_fields, ApiError, Result};

/// A fully read HTTP response.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    elapsed: Duration,
}

impl ApiResponse {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: impl Into<Bytes>,
        elapsed: Duration,
    ) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            elapsed,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Wall-clock time spent on the exchange.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)?.to_str().ok()
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Returns `true` when the body is empty or whitespace only.
    pub fn is_body_empty(&self) -> bool {
        self.body.iter().all(u8::is_ascii_whitespace)
    }

    /// Server retry hint from the `Retry-After` header.
    pub fn retry_after(&self) -> Option<Duration> {
        parse_retry_after(&self.headers)
    }

    /// Decodes the body into `T`.
    ///
    /// On failure the body is scanned for `null` values and the paths are
    /// attached to the returned [`ApiError::Parse`].
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|err| {
            let null_fields = serde_json::from_slice::<Value>(&self.body)
                .map(|value| detect_null_fields(&value))
                .unwrap_or_default();
            let mut message = format!(
                "invalid {} response body for {}: {err}",
                self.status,
                std::any::type_name::<T>()
            );
            if !null_fields.is_empty() {
                message.push_str(&format!("; null fields: {}", null_fields.join(", ")));
            }
            ApiError::Parse {
                message,
                null_fields,
            }
        })
    }

    pub(crate) fn into_parts(self) -> (StatusCode, HeaderMap, Bytes, Duration) {
        (self.status, self.headers, self.body, self.elapsed)
    }
}

/// Parses `Retry-After` as delay seconds or an HTTP-date.
///
/// Dates in the past and negative or malformed values yield `None`.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(value).ok()?;
    date.duration_since(SystemTime::now()).ok()
}
