//! In-memory transport for exercising layers without a network.
//!
//! Enabled for this crate's tests and, through the `testing` feature, for
//! downstream crates testing their own pipelines.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    StatusCode,
};
use serde_json::Value;
use tokio::time::Instant;

use crate::{ApiError, ApiRequest, ApiResponse, Result, Transport, TransportErrorKind};

enum Scripted {
    Response(ApiResponse),
    Failure(TransportErrorKind),
}

#[derive(Default)]
struct Recorded {
    requests: Vec<ApiRequest>,
    sent_at: Vec<Instant>,
}

/// Replays queued outcomes in order and records every request it receives.
///
/// Once the script runs out every further call answers `500`.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    recorded: Mutex<Recorded>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, response: ApiResponse) -> Self {
        lock(&self.script).push_back(Scripted::Response(response));
        self
    }

    pub fn respond_json(self, status: u16, body: Value) -> Self {
        self.respond(json_response(status, body))
    }

    pub fn respond_with_headers(self, status: u16, headers: &[(&str, &str)], body: Value) -> Self {
        let mut all = vec![("content-type", "application/json")];
        all.extend_from_slice(headers);
        self.respond(Self::build_response(status, &all, body.to_string()))
    }

    pub fn fail(self, kind: TransportErrorKind) -> Self {
        lock(&self.script).push_back(Scripted::Failure(kind));
        self
    }

    /// Builds a response with arbitrary headers and raw body.
    ///
    /// Panics on an invalid status or header, which only test input produces.
    pub fn build_response(
        status: u16,
        headers: &[(&str, &str)],
        body: impl Into<Bytes>,
    ) -> ApiResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).expect("valid header name"),
                HeaderValue::from_str(value).expect("valid header value"),
            );
        }
        ApiResponse::new(
            StatusCode::from_u16(status).expect("valid status"),
            map,
            body,
            Duration::from_millis(1),
        )
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        lock(&self.recorded).requests.clone()
    }

    pub fn hits(&self) -> usize {
        lock(&self.recorded).requests.len()
    }

    /// Time elapsed between consecutive requests.
    pub fn request_gaps(&self) -> Vec<Duration> {
        lock(&self.recorded)
            .sent_at
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        {
            let mut recorded = lock(&self.recorded);
            recorded.requests.push(request);
            recorded.sent_at.push(Instant::now());
        }

        match lock(&self.script).pop_front() {
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::Failure(kind)) => {
                Err(ApiError::transport(kind, format!("scripted {kind} failure")))
            }
            None => Ok(json_response(
                500,
                serde_json::json!({"detail": "script exhausted"}),
            )),
        }
    }
}

/// A JSON response with the given status.
pub fn json_response(status: u16, body: Value) -> ApiResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    ApiResponse::new(
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        headers,
        body.to_string(),
        Duration::from_millis(1),
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
