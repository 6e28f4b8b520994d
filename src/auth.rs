use std::fmt;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, COOKIE};

use crate::{ApiError, ApiRequest, ApiResponse, Result, Transport};

const REDACTED: &str = "<redacted>";

/// Stamps fixed headers onto every outgoing request.
///
/// Values are marked sensitive so they never show up in `Debug` output of
/// the request or the layer.
#[derive(Clone)]
pub struct HeaderAuthLayer<T> {
    inner: T,
    headers: HeaderMap,
}

impl<T> HeaderAuthLayer<T> {
    pub fn new(inner: T, mut headers: HeaderMap) -> Self {
        for value in headers.values_mut() {
            value.set_sensitive(true);
        }
        Self { inner, headers }
    }

    /// Builds the layer from `(name, value)` pairs, validating each one.
    pub fn from_pairs<I, K, V>(inner: T, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            let (name, value) = header_pair(name.as_ref(), value.as_ref())?;
            headers.insert(name, value);
        }
        Ok(Self::new(inner, headers))
    }

    /// `Authorization: Bearer <token>`; the prefix is added when missing.
    pub fn bearer(inner: T, token: &str) -> Result<Self> {
        Self::from_pairs(
            inner,
            [(AUTHORIZATION.as_str(), normalize_bearer_authorization(token))],
        )
    }

    pub fn header_names(&self) -> impl Iterator<Item = &HeaderName> {
        self.headers.keys()
    }
}

impl<T> fmt::Debug for HeaderAuthLayer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderAuthLayer")
            .field("headers", &redacted_headers(&self.headers))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: Transport> Transport for HeaderAuthLayer<T> {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let request = self
            .headers
            .iter()
            .fold(request, |request, (name, value)| {
                request.with_header(name.clone(), value.clone())
            });
        self.inner.send(request).await
    }
}

/// Validates a header name and value, marking the value sensitive.
pub fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let header = HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|err| ApiError::Configuration(format!("invalid header name '{name}': {err}")))?;
    let mut value = HeaderValue::from_str(value.trim()).map_err(|err| {
        ApiError::Configuration(format!("invalid value for header '{header}': {err}"))
    })?;
    value.set_sensitive(true);
    Ok((header, value))
}

/// Header list safe to log: credential-bearing values are replaced.
pub fn redacted_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let shown = if value.is_sensitive() || is_credential_header(name) {
                REDACTED.to_owned()
            } else {
                value.to_str().unwrap_or("<binary>").to_owned()
            };
            (name.as_str().to_owned(), shown)
        })
        .collect()
}

fn is_credential_header(name: &HeaderName) -> bool {
    *name == AUTHORIZATION
        || *name == COOKIE
        || name.as_str().contains("api-key")
        || name.as_str().contains("token")
}

pub(crate) fn normalize_bearer_authorization(token: &str) -> String {
    let trimmed = token.trim();
    let prefix = trimmed.get(..7);
    if prefix.is_some_and(|value| value.eq_ignore_ascii_case("bearer ")) {
        trimmed.to_owned()
    } else {
        format!("Bearer {trimmed}")
    }
}
