use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::{ApiError, ApiRequest, ApiResponse, Result};

/// One stage of the request pipeline.
///
/// Layers hold the next stage and are composed at construction time:
/// `RetryLayer<PaginationLayer<ErrorTranslationLayer<HeaderAuthLayer<HttpTransport>>>>`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        (**self).send(request).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        (**self).send(request).await
    }
}

/// Network core performing the exchange with `reqwest`.
///
/// The timeout applies to each physical attempt, not to a logical call.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), timeout)
    }

    pub fn with_client(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let started = Instant::now();
        let mut builder = self
            .http
            .request(request.method().clone(), request.url().clone())
            .headers(request.headers().clone())
            .timeout(self.timeout);
        if let Some(body) = request.body() {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(ApiError::from_reqwest)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(ApiError::from_reqwest)?;

        Ok(ApiResponse::new(status, headers, body, started.elapsed()))
    }
}
