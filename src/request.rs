use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Method, Url,
};
use serde::Serialize;

use crate::{ApiError, Result};

/// A request travelling through the pipeline.
///
/// Layers never mutate a request they were handed; the `with_*` methods
/// consume the value and return the modified copy, so each retry attempt
/// starts from the same original.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl ApiRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Parses `url` and builds a request.
    pub fn parse(method: Method, url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|err| ApiError::Configuration(format!("invalid request url '{url}': {err}")))?;
        Ok(Self::new(method, url))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Sets a header, replacing any previous value with the same name.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes `body` as JSON and sets the content type.
    pub fn with_json<T: Serialize + ?Sized>(self, body: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(body).map_err(|err| ApiError::Parse {
            message: format!("failed to encode request body: {err}"),
            null_fields: Vec::new(),
        })?;
        Ok(self
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(encoded))
    }

    /// Returns the first value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn has_query_param(&self, name: &str) -> bool {
        self.url.query_pairs().any(|(key, _)| key == name)
    }

    /// Sets a query parameter, replacing every existing occurrence.
    pub fn with_query_param(mut self, name: &str, value: &str) -> Self {
        let retained: Vec<(String, String)> = self
            .url
            .query_pairs()
            .filter(|(key, _)| key != name)
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        {
            let mut pairs = self.url.query_pairs_mut();
            pairs.clear();
            for (key, value) in &retained {
                pairs.append_pair(key, value);
            }
            pairs.append_pair(name, value);
        }
        self
    }
}
