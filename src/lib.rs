//! `openapi-client-core` is a composable HTTP pipeline for generated OpenAPI
//! clients.
//!
//! Each concern is a [`Transport`] layer wrapping the next one:
//! - [`RetryLayer`]: bounded retries with exponential backoff and `Retry-After`
//! - [`PaginationLayer`]: collects every page of a GET collection
//! - [`ErrorTranslationLayer`]: reports failures and null fields
//! - [`HeaderAuthLayer`]: stamps credentials onto every request
//! - [`HttpTransport`]: the network core over `reqwest`
//!
//! [`ApiClient`] builds the pipeline from [`ClientOptions`] and turns final
//! responses into typed payloads or [`ApiError`]s.

mod auth;
mod client;
pub mod credentials;
mod error;
mod options;
mod pagination;
mod problem;
mod request;
mod response;
mod retry;
mod translate;
mod transport;
mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use auth::{header_pair, redacted_headers, HeaderAuthLayer};
pub use client::{build_pipeline, ApiClient};
pub use credentials::{resolve_credential, Credential, CredentialChain, CredentialSource};
pub use error::{ApiError, TransportErrorKind};
pub use options::{ClientOptions, CredentialHeader};
pub use pagination::{
    extract_page_meta, MetaSource, PageMeta, PageOutcome, PaginationConfig, PaginationLayer,
    PaginationState, StopReason, DEFAULT_MAX_PAGES,
};
pub use problem::{FieldError, ProblemDetail};
pub use request::ApiRequest;
pub use response::{parse_retry_after, ApiResponse};
pub use retry::{RetryLayer, RetryPolicy, RetryStrategy, DEFAULT_RETRY_STATUS_CODES};
pub use translate::{
    detect_null_fields, error_for_status, raise_for_status, unwrap_response, unwrap_upsert,
    ErrorTranslationLayer, UpsertOutcome,
};
pub use transport::{HttpTransport, Transport};

pub type Result<T> = std::result::Result<T, ApiError>;
