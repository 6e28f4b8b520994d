use std::{fmt, sync::Arc};

use reqwest::{header::AUTHORIZATION, Method, Url};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    auth::{normalize_bearer_authorization, HeaderAuthLayer},
    credentials::default_chain,
    translate::{raise_for_status, unwrap_response, unwrap_upsert, UpsertOutcome},
    ApiError, ApiRequest, ApiResponse, ClientOptions, ErrorTranslationLayer, HttpTransport,
    PaginationLayer, Result, RetryLayer, RetryPolicy, Transport,
};

/// Composes the request pipeline around `core`:
/// retry, then pagination (when enabled), then error translation, then auth.
///
/// Credential headers are resolved here; an absent credential is a
/// configuration error.
pub fn build_pipeline<T>(
    core: T,
    options: &ClientOptions,
) -> Result<(Arc<dyn Transport>, Arc<RetryPolicy>)>
where
    T: Transport + 'static,
{
    let policy = Arc::new(options.retry_policy()?);
    let pagination = options.pagination_config()?;

    let mut headers: Vec<(String, String)> = options
        .auth_headers
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    for binding in &options.credential_headers {
        let credential = binding
            .chain
            .require(&format!("credential for header '{}'", binding.header))?;
        let value = if binding.bearer {
            normalize_bearer_authorization(credential.value())
        } else {
            credential.into_value()
        };
        headers.push((binding.header.clone(), value));
    }

    let auth = HeaderAuthLayer::from_pairs(core, headers)?;
    let translate = ErrorTranslationLayer::new(auth)
        .log_errors(options.log_errors)
        .detect_null_fields(options.detect_null_fields);

    let pipeline: Arc<dyn Transport> = match pagination {
        Some(config) => Arc::new(RetryLayer::new(
            PaginationLayer::new(translate, config),
            policy.clone(),
        )),
        None => Arc::new(RetryLayer::new(translate, policy.clone())),
    };
    Ok((pipeline, policy))
}

/// Entry point for calling an API through the configured pipeline.
#[derive(Clone)]
pub struct ApiClient {
    base_url: Url,
    pipeline: Arc<dyn Transport>,
    policy: Arc<RetryPolicy>,
    options: ClientOptions,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("policy", &self.policy)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Creates a client sending over HTTP with `reqwest`.
    pub fn new(base_url: &str, options: ClientOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(user_agent) = &options.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }
        let http = builder
            .build()
            .map_err(|err| ApiError::Configuration(format!("cannot build HTTP client: {err}")))?;
        let core = HttpTransport::with_client(http, options.timeout());
        Self::with_transport(base_url, core, options)
    }

    /// Creates a client over a custom core transport.
    pub fn with_transport<T>(base_url: &str, core: T, options: ClientOptions) -> Result<Self>
    where
        T: Transport + 'static,
    {
        let base_url = parse_base_url(base_url)?;
        let (pipeline, policy) = build_pipeline(core, &options)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            base_url = %base_url,
            strategy = %policy.strategy(),
            max_attempts = policy.max_attempts(),
            paginate = options.paginate,
            "api client ready"
        );

        Ok(Self {
            base_url,
            pipeline,
            policy,
            options,
        })
    }

    /// Creates a client from environment variables.
    ///
    /// Reads:
    /// - `<PREFIX>_BASE_URL`: API root URL
    /// - `<PREFIX>_API_KEY`: bearer token, also looked up in `./.env` and
    ///   the netrc entry of the base URL's host
    /// - the overrides listed on [`ClientOptions::from_env`]
    pub fn from_env(prefix: &str) -> Result<Self> {
        let url_var = format!("{prefix}_BASE_URL");
        let base_url = std::env::var(&url_var)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                ApiError::Configuration(format!("missing {url_var} environment variable"))
            })?;
        let host = Url::parse(base_url.trim())
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned));

        let key_var = format!("{prefix}_API_KEY");
        let token = default_chain(None, &key_var, host.as_deref()).require(&key_var)?;
        let options = ClientOptions::from_env(prefix)?.with_auth_header(
            AUTHORIZATION.as_str(),
            normalize_bearer_authorization(token.value()),
        );
        Self::new(&base_url, options)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Resolves `path` against the base URL; absolute URLs are used as is.
    pub fn url(&self, path: &str) -> Result<Url> {
        if let Ok(url) = Url::parse(path) {
            return Ok(url);
        }
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| ApiError::Configuration(format!("invalid path '{path}': {err}")))
    }

    pub fn request(&self, method: Method, path: &str) -> Result<ApiRequest> {
        Ok(ApiRequest::new(method, self.url(path)?))
    }

    /// Sends through the pipeline and returns the raw final response,
    /// whatever its status.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.pipeline.send(request).await
    }

    /// Sends and decodes the payload; non-success statuses and missing
    /// payloads are errors.
    pub async fn execute<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let response = self.send(request).await?;
        unwrap_response(&response, true)?.ok_or_else(|| ApiError::Parse {
            message: format!("{} response has no payload", response.status()),
            null_fields: Vec::new(),
        })
    }

    /// Like [`execute`](Self::execute) but a 404 or empty payload is `None`.
    pub async fn execute_optional<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> Result<Option<T>> {
        let response = self.send(request).await?;
        unwrap_response(&response, false)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.execute(self.request(Method::GET, path)?).await
    }

    pub async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        self.execute_optional(self.request(Method::GET, path)?).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(self.request(Method::POST, path)?.with_json(body)?)
            .await
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(self.request(Method::PUT, path)?.with_json(body)?)
            .await
    }

    pub async fn patch_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(self.request(Method::PATCH, path)?.with_json(body)?)
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let response = self.send(self.request(Method::DELETE, path)?).await?;
        raise_for_status(&response)
    }

    /// Sends `body` to a create-or-update endpoint and reports, from the
    /// 201 vs 200 status, which of the two happened.
    pub async fn upsert<B, T>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<UpsertOutcome<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.request(method, path)?.with_json(body)?;
        let response = self.send(request).await?;
        unwrap_upsert(&response)
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    let mut url = Url::parse(trimmed)
        .map_err(|err| ApiError::Configuration(format!("invalid base url '{trimmed}': {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::Configuration(format!(
            "base url must use http or https, got '{}'",
            url.scheme()
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reqwest::Method;
    use serde::Deserialize;
    use serde_json::json;

    use super::ApiClient;
    use crate::{
        credentials::CredentialChain, testing::ScriptedTransport, ApiError, ClientOptions,
        UpsertOutcome,
    };

    fn fast() -> ClientOptions {
        ClientOptions::default().with_retry_backoff_ms(1)
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Product {
        id: u32,
    }

    #[test]
    fn url_joins_relative_paths_under_base() {
        let client =
            ApiClient::with_transport("https://api.test/v1", ScriptedTransport::new(), fast())
                .expect("valid client");
        assert_eq!(
            client.url("/orders/7").expect("url").as_str(),
            "https://api.test/v1/orders/7"
        );
        assert_eq!(
            client.url("https://other.test/x").expect("url").as_str(),
            "https://other.test/x"
        );
    }

    #[test]
    fn invalid_configuration_fails_construction() {
        let err = ApiClient::with_transport("ftp://api.test", ScriptedTransport::new(), fast())
            .expect_err("must fail");
        assert!(matches!(err, ApiError::Configuration(_)));

        let err = ApiClient::with_transport(
            "https://api.test",
            ScriptedTransport::new(),
            fast().with_max_attempts(0),
        )
        .expect_err("must fail");
        assert!(matches!(err, ApiError::Configuration(_)));
    }

    #[test]
    fn missing_credential_fails_construction() {
        let options = fast().with_bearer_credential(
            CredentialChain::new().env("OPENAPI_CLIENT_CORE_CLIENT_TEST_UNSET"),
        );
        let err = ApiClient::with_transport("https://api.test", ScriptedTransport::new(), options)
            .expect_err("must fail");
        assert!(matches!(err, ApiError::Configuration(_)));
    }

    #[test]
    fn from_env_requires_api_key() {
        std::env::set_var("OCC_CLIENT_NOKEY_BASE_URL", "https://nokey.invalid");
        let err = ApiClient::from_env("OCC_CLIENT_NOKEY").expect_err("must fail");
        assert!(err.to_string().contains("OCC_CLIENT_NOKEY_API_KEY"));

        let err = ApiClient::from_env("OCC_CLIENT_NOURL").expect_err("must fail");
        assert!(err.to_string().contains("OCC_CLIENT_NOURL_BASE_URL"));
    }

    #[tokio::test]
    async fn pipeline_retries_then_assembles_pages() {
        let script = Arc::new(
            ScriptedTransport::new()
                .respond_json(503, json!({}))
                .respond_json(200, json!({"data": [{"id": 1}], "pagination": {"total_pages": 2}}))
                .respond_json(200, json!({"data": [{"id": 2}], "pagination": {"total_pages": 2}})),
        );
        let options = fast().with_bearer_credential(CredentialChain::new().explicit("tok"));
        let client = ApiClient::with_transport("https://api.test", script.clone(), options)
            .expect("valid client");

        let body: serde_json::Value = client.get_json("products").await.expect("collection");
        let products: Vec<Product> = serde_json::from_value(body["data"].clone()).expect("items");

        assert_eq!(products, vec![Product { id: 1 }, Product { id: 2 }]);
        assert_eq!(script.hits(), 3);
        for request in script.requests() {
            assert_eq!(request.headers()["authorization"], "Bearer tok");
        }
    }

    #[tokio::test]
    async fn custom_items_key_is_paginated() {
        let script = Arc::new(
            ScriptedTransport::new()
                .respond_json(200, json!({"records": [{"id": 1}], "pagination": {"page": 1}}))
                .respond_json(200, json!({"records": [{"id": 2}], "pagination": {"page": 2}}))
                .respond_json(200, json!({"records": [], "pagination": {"page": 3}})),
        );
        let options = fast().with_items_keys(["records"]);
        let client = ApiClient::with_transport("https://api.test", script.clone(), options)
            .expect("valid client");

        let body: serde_json::Value = client.get_json("products").await.expect("collection");

        assert_eq!(body["records"], json!([{"id": 1}, {"id": 2}]));
        assert_eq!(script.hits(), 3);
    }

    #[tokio::test]
    async fn page_param_is_sent_only_while_paginating() {
        let script = Arc::new(
            ScriptedTransport::new()
                .respond_json(200, json!({"id": 7}))
                .respond_json(200, json!({"id": 7})),
        );
        let paged = ApiClient::with_transport("https://api.test", script.clone(), fast())
            .expect("valid client");
        let plain = ApiClient::with_transport(
            "https://api.test",
            script.clone(),
            fast().with_pagination(false),
        )
        .expect("valid client");

        let _: Product = paged.get_json("products/7").await.expect("product");
        let _: Product = plain.get_json("products/7").await.expect("product");

        let requests = script.requests();
        assert_eq!(requests[0].query_param("page").as_deref(), Some("1"));
        assert_eq!(requests[1].query_param("page"), None);
    }

    #[tokio::test]
    async fn client_errors_surface_typed_without_retry() {
        let script = Arc::new(
            ScriptedTransport::new()
                .respond_json(404, json!({"title": "Not Found", "detail": "no product 9"})),
        );
        let client = ApiClient::with_transport("https://api.test", script.clone(), fast())
            .expect("valid client");

        let err = client
            .get_json::<Product>("products/9")
            .await
            .expect_err("must fail");
        assert!(matches!(err, ApiError::NotFound { .. }));
        assert_eq!(
            err.problem_detail().and_then(|p| p.detail.as_deref()),
            Some("no product 9")
        );
        assert_eq!(script.hits(), 1);
    }

    #[tokio::test]
    async fn upsert_reports_creation() {
        let script = Arc::new(
            ScriptedTransport::new()
                .respond_json(201, json!({"id": 5}))
                .respond_json(200, json!({"id": 5})),
        );
        let client = ApiClient::with_transport("https://api.test", script.clone(), fast())
            .expect("valid client");

        let created = client
            .upsert::<_, Product>(Method::POST, "products", &json!({"id": 5}))
            .await
            .expect("created");
        let updated = client
            .upsert::<_, Product>(Method::POST, "products", &json!({"id": 5}))
            .await
            .expect("updated");

        assert!(created.is_created());
        assert_eq!(updated, UpsertOutcome::Updated(Product { id: 5 }));
        assert_eq!(script.requests()[0].headers()["content-type"], "application/json");
    }

    #[tokio::test]
    async fn optional_get_returns_none_on_404() {
        let script = Arc::new(ScriptedTransport::new().respond_json(404, json!({})));
        let client = ApiClient::with_transport("https://api.test", script, fast())
            .expect("valid client");
        let product: Option<Product> = client.get_optional("products/9").await.expect("ok");
        assert_eq!(product, None);
    }

    #[test]
    fn debug_redacts_authorization_value() {
        let options = fast().with_auth_header("authorization", "Bearer secret-token");
        let client =
            ApiClient::with_transport("https://api.test", ScriptedTransport::new(), options)
                .expect("valid client");
        let debug = format!("{client:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("secret-token"));
    }

    #[test]
    fn debug_redacts_fallback_credential() {
        let options = fast().with_bearer_credential(
            CredentialChain::new()
                .env("OPENAPI_CLIENT_CORE_CLIENT_TEST_UNSET")
                .fallback("dev-secret-123"),
        );
        let client =
            ApiClient::with_transport("https://api.test", ScriptedTransport::new(), options)
                .expect("valid client");
        assert!(!format!("{client:?}").contains("dev-secret-123"));
    }
}
