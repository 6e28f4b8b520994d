use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use reqwest::Method;

use crate::{
    credentials::CredentialChain,
    pagination::{PaginationConfig, DEFAULT_MAX_PAGES},
    retry::DEFAULT_RETRY_STATUS_CODES,
    ApiError, Result, RetryPolicy, RetryStrategy,
};

/// A header whose value is resolved from a credential chain when the client
/// is built.
#[derive(Clone, Debug)]
pub struct CredentialHeader {
    pub header: String,
    pub chain: CredentialChain,
    /// Sends the value as `Bearer <value>`.
    pub bearer: bool,
}

/// Configures the request pipeline: timeout, retry, pagination, error
/// reporting and authentication.
#[derive(Clone)]
pub struct ClientOptions {
    /// Timeout of each physical attempt in milliseconds.
    pub timeout_ms: u64,
    pub retry_strategy: RetryStrategy,
    /// Total number of sends per logical call, the first one included.
    pub max_attempts: u32,
    /// Backoff before the first retry in milliseconds.
    pub retry_backoff_ms: u64,
    pub backoff_factor: f64,
    /// Longest `Retry-After` hint waited out, in milliseconds.
    pub max_retry_after_ms: u64,
    pub retry_status_codes: Vec<u16>,
    /// Overrides the strategy's idempotent method set.
    pub idempotent_methods: Option<Vec<Method>>,
    /// Required to use [`RetryStrategy::AllMethods`].
    pub allow_unsafe_retries: bool,
    /// Aggregates paged GET collections.
    ///
    /// Every GET that does not already carry `page_param` is sent with
    /// `page_param=1`, single-resource fetches included. Disable this for
    /// APIs that reject unknown query parameters, or pin the page on the
    /// request.
    pub paginate: bool,
    pub max_pages: u32,
    pub page_param: String,
    /// Body keys searched, in order, for a page's item list.
    pub items_keys: Vec<String>,
    /// Logs 4xx responses with their problem detail.
    pub log_errors: bool,
    /// Reports `null` fields of successful responses.
    pub detect_null_fields: bool,
    /// Static headers added to every request.
    pub auth_headers: BTreeMap<String, String>,
    pub credential_headers: Vec<CredentialHeader>,
    pub user_agent: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry_strategy: RetryStrategy::default(),
            max_attempts: 6,
            retry_backoff_ms: 1_000,
            backoff_factor: 2.0,
            max_retry_after_ms: 300_000,
            retry_status_codes: DEFAULT_RETRY_STATUS_CODES.to_vec(),
            idempotent_methods: None,
            allow_unsafe_retries: false,
            paginate: true,
            max_pages: DEFAULT_MAX_PAGES,
            page_param: "page".to_owned(),
            items_keys: PaginationConfig::default().items_keys,
            log_errors: true,
            detect_null_fields: true,
            auth_headers: BTreeMap::new(),
            credential_headers: Vec::new(),
            user_agent: None,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let auth_headers: BTreeMap<&str, &str> = self
            .auth_headers
            .keys()
            .map(|name| (name.as_str(), "<redacted>"))
            .collect();
        f.debug_struct("ClientOptions")
            .field("timeout_ms", &self.timeout_ms)
            .field("retry_strategy", &self.retry_strategy)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("backoff_factor", &self.backoff_factor)
            .field("max_retry_after_ms", &self.max_retry_after_ms)
            .field("retry_status_codes", &self.retry_status_codes)
            .field("idempotent_methods", &self.idempotent_methods)
            .field("allow_unsafe_retries", &self.allow_unsafe_retries)
            .field("paginate", &self.paginate)
            .field("max_pages", &self.max_pages)
            .field("page_param", &self.page_param)
            .field("items_keys", &self.items_keys)
            .field("log_errors", &self.log_errors)
            .field("detect_null_fields", &self.detect_null_fields)
            .field("auth_headers", &auth_headers)
            .field("credential_headers", &self.credential_headers)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl ClientOptions {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_retry_after_ms(mut self, max_retry_after_ms: u64) -> Self {
        self.max_retry_after_ms = max_retry_after_ms;
        self
    }

    pub fn with_retry_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retry_status_codes = codes.into_iter().collect();
        self
    }

    pub fn with_idempotent_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.idempotent_methods = Some(methods.into_iter().collect());
        self
    }

    /// Acknowledges that non-idempotent requests may be sent more than once.
    pub fn allow_unsafe_retries(mut self, allow: bool) -> Self {
        self.allow_unsafe_retries = allow;
        self
    }

    pub fn with_pagination(mut self, enabled: bool) -> Self {
        self.paginate = enabled;
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_page_param(mut self, name: impl Into<String>) -> Self {
        self.page_param = name.into();
        self
    }

    pub fn with_items_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.items_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_error_logging(mut self, enabled: bool) -> Self {
        self.log_errors = enabled;
        self
    }

    pub fn with_null_field_detection(mut self, enabled: bool) -> Self {
        self.detect_null_fields = enabled;
        self
    }

    pub fn with_auth_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.auth_headers.insert(name.into(), value.into());
        self
    }

    /// Resolves `header` from `chain` when the client is built; an absent
    /// credential fails construction.
    pub fn with_credential_header(
        mut self,
        header: impl Into<String>,
        chain: CredentialChain,
    ) -> Self {
        self.credential_headers.push(CredentialHeader {
            header: header.into(),
            chain,
            bearer: false,
        });
        self
    }

    /// Resolves a bearer token for `Authorization` from `chain`.
    pub fn with_bearer_credential(mut self, chain: CredentialChain) -> Self {
        self.credential_headers.push(CredentialHeader {
            header: "authorization".to_owned(),
            chain,
            bearer: true,
        });
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Builds and validates the retry policy these options describe.
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let mut policy = RetryPolicy::new(self.retry_strategy)
            .with_max_attempts(self.max_attempts)
            .with_base_backoff(Duration::from_millis(self.retry_backoff_ms))
            .with_backoff_factor(self.backoff_factor)
            .with_max_retry_after(Duration::from_millis(self.max_retry_after_ms))
            .with_retry_status_codes(self.retry_status_codes.iter().copied());
        if let Some(methods) = &self.idempotent_methods {
            policy = policy.with_idempotent_methods(methods.iter().cloned());
        }
        policy.validate(self.allow_unsafe_retries)?;
        Ok(policy)
    }

    /// Pagination settings, or `None` when auto-pagination is off.
    pub fn pagination_config(&self) -> Result<Option<PaginationConfig>> {
        if !self.paginate {
            return Ok(None);
        }
        if self.max_pages == 0 {
            return Err(ApiError::Configuration(
                "max_pages must be at least 1".to_owned(),
            ));
        }
        if self.page_param.trim().is_empty() {
            return Err(ApiError::Configuration(
                "page_param must not be empty".to_owned(),
            ));
        }
        if self.items_keys.iter().all(|key| key.trim().is_empty()) {
            return Err(ApiError::Configuration(
                "items_keys must name at least one body key".to_owned(),
            ));
        }
        Ok(Some(PaginationConfig {
            max_pages: self.max_pages,
            page_param: self.page_param.clone(),
            items_keys: self
                .items_keys
                .iter()
                .filter(|key| !key.trim().is_empty())
                .cloned()
                .collect(),
        }))
    }

    /// Reads overrides from `<PREFIX>_TIMEOUT_MS`, `<PREFIX>_RETRY_STRATEGY`,
    /// `<PREFIX>_MAX_ATTEMPTS`, `<PREFIX>_MAX_PAGES` and `<PREFIX>_PAGINATE`.
    ///
    /// Unset or empty variables keep the defaults; malformed values are
    /// configuration errors.
    pub fn from_env(prefix: &str) -> Result<Self> {
        let mut options = Self::default();
        if let Some(value) = env_value::<u64>(prefix, "TIMEOUT_MS")? {
            options.timeout_ms = value;
        }
        if let Some(value) = env_value::<RetryStrategy>(prefix, "RETRY_STRATEGY")? {
            options.retry_strategy = value;
        }
        if let Some(value) = env_value::<u32>(prefix, "MAX_ATTEMPTS")? {
            options.max_attempts = value;
        }
        if let Some(value) = env_value::<u32>(prefix, "MAX_PAGES")? {
            options.max_pages = value;
        }
        if let Some(value) = env_value::<bool>(prefix, "PAGINATE")? {
            options.paginate = value;
        }
        Ok(options)
    }
}

fn env_value<T>(prefix: &str, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let key = format!("{prefix}_{name}");
    let Ok(raw) = std::env::var(&key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|err| ApiError::Configuration(format!("invalid {key} '{raw}': {err}")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::Method;

    use super::ClientOptions;
    use crate::{ApiError, RetryStrategy};

    #[test]
    fn defaults_match_documented_values() {
        let options = ClientOptions::default();
        assert_eq!(options.timeout(), Duration::from_secs(10));
        assert_eq!(options.retry_strategy, RetryStrategy::RateLimitAware);
        assert_eq!(options.max_attempts, 6);
        assert_eq!(options.max_pages, 100);
        assert!(options.paginate);

        let policy = options.retry_policy().expect("valid defaults");
        assert_eq!(policy.max_attempts(), 6);
        assert_eq!(policy.base_backoff(), Duration::from_secs(1));
        assert_eq!(policy.max_retry_after(), Duration::from_secs(300));

        let policy = options
            .with_max_retry_after_ms(5_000)
            .retry_policy()
            .expect("valid");
        assert_eq!(policy.max_retry_after(), Duration::from_secs(5));
    }

    #[test]
    fn all_methods_requires_acknowledgement() {
        let options = ClientOptions::default().with_retry_strategy(RetryStrategy::AllMethods);
        assert!(matches!(
            options.retry_policy(),
            Err(ApiError::Configuration(_))
        ));
        assert!(options.allow_unsafe_retries(true).retry_policy().is_ok());
    }

    #[test]
    fn idempotent_override_reaches_policy() {
        let policy = ClientOptions::default()
            .with_retry_strategy(RetryStrategy::IdempotentOnly)
            .with_idempotent_methods([Method::GET])
            .retry_policy()
            .expect("valid");
        assert!(policy.is_idempotent(&Method::GET));
        assert!(!policy.is_idempotent(&Method::PUT));
    }

    #[test]
    fn pagination_can_be_disabled_or_rejected() {
        assert!(ClientOptions::default()
            .with_pagination(false)
            .pagination_config()
            .expect("valid")
            .is_none());
        assert!(ClientOptions::default()
            .with_max_pages(0)
            .pagination_config()
            .is_err());
        let config = ClientOptions::default()
            .with_max_pages(7)
            .with_page_param("p")
            .pagination_config()
            .expect("valid")
            .expect("enabled");
        assert_eq!(config.max_pages, 7);
        assert_eq!(config.page_param, "p");
        assert_eq!(config.items_keys, vec!["data", "items", "results"]);
    }

    #[test]
    fn items_keys_reach_pagination_config() {
        let config = ClientOptions::default()
            .with_items_keys(["records", "entries"])
            .pagination_config()
            .expect("valid")
            .expect("enabled");
        assert_eq!(config.items_keys, vec!["records", "entries"]);

        assert!(ClientOptions::default()
            .with_items_keys(Vec::<String>::new())
            .pagination_config()
            .is_err());
    }

    #[test]
    fn from_env_reads_prefixed_overrides() {
        std::env::set_var("OCC_OPTS_TEST_TIMEOUT_MS", "2500");
        std::env::set_var("OCC_OPTS_TEST_RETRY_STRATEGY", "idempotent_only");
        std::env::set_var("OCC_OPTS_TEST_PAGINATE", "false");

        let options = ClientOptions::from_env("OCC_OPTS_TEST").expect("valid env");
        assert_eq!(options.timeout_ms, 2500);
        assert_eq!(options.retry_strategy, RetryStrategy::IdempotentOnly);
        assert!(!options.paginate);
        assert_eq!(options.max_attempts, 6);
    }

    #[test]
    fn from_env_rejects_malformed_values() {
        std::env::set_var("OCC_OPTS_BAD_MAX_ATTEMPTS", "many");
        let err = ClientOptions::from_env("OCC_OPTS_BAD").expect_err("must fail");
        assert!(err.to_string().contains("OCC_OPTS_BAD_MAX_ATTEMPTS"));
    }

    #[test]
    fn debug_redacts_auth_headers() {
        let options = ClientOptions::default().with_auth_header("x-api-key", "secret-key");
        let debug = format!("{options:?}");
        assert!(debug.contains("x-api-key"));
        assert!(!debug.contains("secret-key"));
    }
}
