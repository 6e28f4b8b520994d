//! Translation of HTTP responses into typed errors.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{ApiError, ApiRequest, ApiResponse, ProblemDetail, Result, Transport};

const BODY_EXCERPT_CHARS: usize = 200;

/// Returns the dotted/bracketed path of every `null` in `value`, depth-first
/// in document order (`order.supplier.name`, `items[2].receivedDate`).
pub fn detect_null_fields(value: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect_null_fields(value, "", &mut paths);
    paths
}

fn collect_null_fields(value: &Value, path: &str, paths: &mut Vec<String>) {
    match value {
        Value::Object(object) => {
            for (key, child) in object {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                visit(child, child_path, paths);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                visit(child, format!("{path}[{index}]"), paths);
            }
        }
        _ => {}
    }
}

fn visit(child: &Value, child_path: String, paths: &mut Vec<String>) {
    match child {
        Value::Null => paths.push(child_path),
        Value::Object(_) | Value::Array(_) => collect_null_fields(child, &child_path, paths),
        _ => {}
    }
}

/// Builds the typed error for a non-success response.
pub fn error_for_status(response: &ApiResponse) -> ApiError {
    let status = response.status().as_u16();
    let problem = ProblemDetail::from_response(response);
    let message = match &problem {
        Some(problem) => problem.to_message(),
        None => fallback_message(status, &response.text()),
    };

    match status {
        400 => ApiError::BadRequest {
            status,
            message,
            problem,
        },
        401 => ApiError::Unauthorized {
            status,
            message,
            problem,
        },
        403 => ApiError::Forbidden {
            status,
            message,
            problem,
        },
        404 => ApiError::NotFound {
            status,
            message,
            problem,
        },
        409 => ApiError::Conflict {
            status,
            message,
            problem,
        },
        422 => ApiError::Validation {
            status,
            message,
            errors: problem
                .as_ref()
                .map(|problem| problem.errors.clone())
                .unwrap_or_default(),
            problem,
        },
        429 => ApiError::RateLimited {
            status,
            message,
            retry_after: response.retry_after(),
            problem,
        },
        400..=499 => ApiError::Client {
            status,
            message,
            problem,
        },
        500..=599 => ApiError::Server {
            status,
            message,
            problem,
        },
        _ => ApiError::UnexpectedStatus { status, message },
    }
}

fn fallback_message(status: u16, body: &str) -> String {
    let excerpt: String = body.trim().chars().take(BODY_EXCERPT_CHARS).collect();
    if excerpt.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {excerpt}")
    }
}

/// Fails with the typed error unless the status is 2xx.
pub fn raise_for_status(response: &ApiResponse) -> Result<()> {
    if response.is_success() {
        Ok(())
    } else {
        Err(error_for_status(response))
    }
}

/// Turns a completed response into its payload.
///
/// "Absent" means a 404, a 204, or an empty/`null` body. With
/// `raise_on_absent` an absent payload is an error; otherwise it is `Ok(None)`.
pub fn unwrap_response<T: DeserializeOwned>(
    response: &ApiResponse,
    raise_on_absent: bool,
) -> Result<Option<T>> {
    if response.status() == StatusCode::NOT_FOUND && !raise_on_absent {
        return Ok(None);
    }
    raise_for_status(response)?;

    let absent = response.status() == StatusCode::NO_CONTENT
        || response.is_body_empty()
        || response.body().trim_ascii() == b"null";
    if absent {
        return if raise_on_absent {
            Err(ApiError::Parse {
                message: format!("{} response has no payload", response.status()),
                null_fields: Vec::new(),
            })
        } else {
            Ok(None)
        };
    }

    response.json::<T>().map(Some).inspect_err(|err| {
        #[cfg(feature = "tracing")]
        tracing::error!(
            status = response.status().as_u16(),
            null_fields = ?err.null_fields(),
            "response body does not match the expected shape"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = err;
    })
}

/// Result of a create-or-update call.
#[derive(Clone, Debug, PartialEq)]
pub enum UpsertOutcome<T> {
    /// 201: the resource did not exist.
    Created(T),
    /// Any other 2xx: an existing resource was updated.
    Updated(T),
}

impl<T> UpsertOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Created(value) | Self::Updated(value) => value,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Unwraps an upsert response, telling creation (201) from update.
pub fn unwrap_upsert<T: DeserializeOwned>(response: &ApiResponse) -> Result<UpsertOutcome<T>> {
    let created = response.status() == StatusCode::CREATED;
    let value = unwrap_response::<T>(response, true)?.ok_or_else(|| ApiError::Parse {
        message: "upsert response has no payload".to_owned(),
        null_fields: Vec::new(),
    })?;
    Ok(if created {
        UpsertOutcome::Created(value)
    } else {
        UpsertOutcome::Updated(value)
    })
}

/// Inspects every response passing through and reports failures.
///
/// Responses are handed upward unchanged so the retry layer still sees the
/// raw status; typed errors are produced at the client boundary with
/// [`unwrap_response`]. Server errors are left for the retry layer to report.
pub struct ErrorTranslationLayer<T> {
    inner: T,
    log_errors: bool,
    detect_null_fields: bool,
}

impl<T> ErrorTranslationLayer<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            log_errors: true,
            detect_null_fields: true,
        }
    }

    pub fn log_errors(mut self, enabled: bool) -> Self {
        self.log_errors = enabled;
        self
    }

    pub fn detect_null_fields(mut self, enabled: bool) -> Self {
        self.detect_null_fields = enabled;
        self
    }

    #[cfg(feature = "tracing")]
    fn inspect(&self, method: &reqwest::Method, url: &reqwest::Url, response: &ApiResponse) {
        let status = response.status().as_u16();
        let elapsed_ms = response.elapsed().as_millis() as u64;

        if response.is_success() {
            tracing::info!(%method, %url, status, elapsed_ms, "request succeeded");
            if self.detect_null_fields && !response.is_body_empty() {
                if let Ok(value) = serde_json::from_slice::<Value>(response.body()) {
                    let null_fields = detect_null_fields(&value);
                    if !null_fields.is_empty() {
                        tracing::debug!(
                            %method,
                            %url,
                            ?null_fields,
                            "response contains null fields"
                        );
                    }
                }
            }
        } else if response.status().is_client_error() && self.log_errors {
            let err = error_for_status(response);
            tracing::error!(
                %method,
                %url,
                status,
                elapsed_ms,
                problem = ?err.problem_detail(),
                "request failed: {err}"
            );
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for ErrorTranslationLayer<T> {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        #[cfg(feature = "tracing")]
        let (method, url) = {
            tracing::debug!(
                method = %request.method(),
                url = %request.url(),
                headers = ?crate::auth::redacted_headers(request.headers()),
                "sending request"
            );
            (request.method().clone(), request.url().clone())
        };

        let response = self.inner.send(request).await?;

        #[cfg(feature = "tracing")]
        self.inspect(&method, &url, &response);

        Ok(response)
    }
}
