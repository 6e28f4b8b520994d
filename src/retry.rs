//! Retry policies and the retry layer.

use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use tokio::time::sleep;

use crate::{ApiError, ApiRequest, ApiResponse, Result, Transport};

/// Default retryable statuses for server-side failures.
pub const DEFAULT_RETRY_STATUS_CODES: [u16; 3] = [502, 503, 504];

/// Strategy deciding which methods may be re-sent.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum RetryStrategy {
    /// Retries only GET, HEAD, OPTIONS and TRACE, and never on 429.
    IdempotentOnly,
    /// Retries every method on 429; GET, HEAD, OPTIONS, TRACE, PUT and
    /// DELETE on server errors.
    #[default]
    RateLimitAware,
    /// Retries every method on every configured status.
    ///
    /// Unsafe unless the server deduplicates requests with idempotency keys;
    /// a client refuses it unless the caller opts in explicitly.
    AllMethods,
}

impl RetryStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdempotentOnly => "idempotent_only",
            Self::RateLimitAware => "rate_limit_aware",
            Self::AllMethods => "all_methods",
        }
    }

    /// Methods treated as idempotent before any override.
    pub fn default_idempotent_methods(self) -> HashSet<Method> {
        let mut methods: HashSet<Method> =
            [Method::GET, Method::HEAD, Method::OPTIONS, Method::TRACE].into();
        if self != Self::IdempotentOnly {
            methods.insert(Method::PUT);
            methods.insert(Method::DELETE);
        }
        methods
    }

    fn retries_rate_limit(self) -> bool {
        matches!(self, Self::RateLimitAware | Self::AllMethods)
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryStrategy {
    type Err = ApiError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "idempotent_only" | "idempotent" => Ok(Self::IdempotentOnly),
            "rate_limit_aware" | "rate_limited" => Ok(Self::RateLimitAware),
            "all_methods" | "all" => Ok(Self::AllMethods),
            other => Err(ApiError::Configuration(format!(
                "unknown retry strategy '{other}' \
                 (expected idempotent_only, rate_limit_aware or all_methods)"
            ))),
        }
    }
}

/// Immutable retry configuration shared by every request of a client.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    max_attempts: u32,
    base_backoff: Duration,
    backoff_factor: f64,
    max_backoff: Duration,
    max_retry_after: Duration,
    retry_status_codes: BTreeSet<u16>,
    idempotent_methods: HashSet<Method>,
    respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryStrategy::default())
    }
}

impl RetryPolicy {
    /// Creates a policy with one initial send plus five retries, a 1 s base
    /// backoff doubling each attempt, and retries on 502/503/504.
    pub fn new(strategy: RetryStrategy) -> Self {
        Self {
            strategy,
            max_attempts: 6,
            base_backoff: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(300),
            max_retry_after: Duration::from_secs(300),
            retry_status_codes: DEFAULT_RETRY_STATUS_CODES.into_iter().collect(),
            idempotent_methods: strategy.default_idempotent_methods(),
            respect_retry_after: true,
        }
    }

    pub fn idempotent_only() -> Self {
        Self::new(RetryStrategy::IdempotentOnly)
    }

    pub fn rate_limit_aware() -> Self {
        Self::new(RetryStrategy::RateLimitAware)
    }

    pub fn all_methods() -> Self {
        Self::new(RetryStrategy::AllMethods)
    }

    /// Total number of physical sends, including the first one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Upper bound for the computed backoff. A larger `Retry-After` still wins.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Longest `Retry-After` the layer will wait out. A larger hint ends the
    /// call with the rate-limited response instead of sleeping.
    pub fn with_max_retry_after(mut self, max_retry_after: Duration) -> Self {
        self.max_retry_after = max_retry_after;
        self
    }

    pub fn with_retry_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retry_status_codes = codes.into_iter().collect();
        self
    }

    pub fn with_idempotent_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.idempotent_methods = methods.into_iter().collect();
        self
    }

    /// Decides whether PUT and DELETE count as idempotent.
    ///
    /// They are under REST conventions, but HTTP itself does not guarantee it.
    pub fn with_put_delete_idempotent(mut self, idempotent: bool) -> Self {
        for method in [Method::PUT, Method::DELETE] {
            if idempotent {
                self.idempotent_methods.insert(method);
            } else {
                self.idempotent_methods.remove(&method);
            }
        }
        self
    }

    /// Ignores `Retry-After` and always uses the computed backoff.
    pub fn ignore_retry_after(mut self) -> Self {
        self.respect_retry_after = false;
        self
    }

    pub fn strategy(&self) -> RetryStrategy {
        self.strategy
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_backoff(&self) -> Duration {
        self.base_backoff
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn max_retry_after(&self) -> Duration {
        self.max_retry_after
    }

    /// Whether a server hint is short enough to be waited out.
    pub fn accepts_retry_after(&self, hint: Duration) -> bool {
        !self.respect_retry_after || hint <= self.max_retry_after
    }

    pub fn retry_status_codes(&self) -> &BTreeSet<u16> {
        &self.retry_status_codes
    }

    pub fn idempotent_methods(&self) -> &HashSet<Method> {
        &self.idempotent_methods
    }

    /// Checks the policy for values that cannot work.
    ///
    /// `allow_unsafe` acknowledges that [`RetryStrategy::AllMethods`] may
    /// duplicate non-idempotent operations.
    pub fn validate(&self, allow_unsafe: bool) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ApiError::Configuration(
                "max_attempts must be at least 1".to_owned(),
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ApiError::Configuration(format!(
                "backoff factor must be a finite number >= 1, got {}",
                self.backoff_factor
            )));
        }
        if let Some(code) = self
            .retry_status_codes
            .iter()
            .find(|code| StatusCode::from_u16(**code).is_err())
        {
            return Err(ApiError::Configuration(format!(
                "invalid retry status code {code}"
            )));
        }
        if self.strategy == RetryStrategy::AllMethods && !allow_unsafe {
            return Err(ApiError::Configuration(
                "all_methods retry strategy re-sends non-idempotent requests; \
                 enable allow_unsafe_retries only if the server honours idempotency keys"
                    .to_owned(),
            ));
        }
        Ok(())
    }

    /// Whether a request with `method` may be re-sent on server errors.
    pub fn is_idempotent(&self, method: &Method) -> bool {
        self.strategy == RetryStrategy::AllMethods || self.idempotent_methods.contains(method)
    }

    pub fn should_retry_status(&self, method: &Method, status: u16) -> bool {
        if status == StatusCode::TOO_MANY_REQUESTS.as_u16() && self.strategy.retries_rate_limit() {
            return true;
        }
        self.retry_status_codes.contains(&status) && self.is_idempotent(method)
    }

    pub fn should_retry_error(&self, method: &Method, err: &ApiError) -> bool {
        match err.status() {
            Some(status) => self.should_retry_status(method, status),
            None => err.is_transport() && self.is_idempotent(method),
        }
    }

    /// Backoff after the given 1-based attempt: `base * factor^(attempt - 1)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let seconds = self.base_backoff.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(seconds)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Delay before the next attempt, honouring a larger server hint.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.backoff_for(attempt);
        match retry_after {
            Some(hint) if self.respect_retry_after => backoff.max(hint),
            _ => backoff,
        }
    }
}

/// Re-sends failed requests according to a [`RetryPolicy`].
///
/// Attempts are strictly sequential. The last response or error is returned
/// unchanged once the attempt budget is spent.
pub struct RetryLayer<T> {
    inner: T,
    policy: Arc<RetryPolicy>,
}

impl<T> RetryLayer<T> {
    pub fn new(inner: T, policy: impl Into<Arc<RetryPolicy>>) -> Self {
        Self {
            inner,
            policy: policy.into(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<T: Transport> Transport for RetryLayer<T> {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let method = request.method().clone();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let outcome = self.inner.send(request.clone()).await;
            let (retryable, retry_after) = match &outcome {
                Ok(response) => (
                    self.policy
                        .should_retry_status(&method, response.status().as_u16()),
                    response.retry_after(),
                ),
                Err(err) => (self.policy.should_retry_error(&method, err), err.retry_after()),
            };

            if !retryable {
                return outcome;
            }

            if retry_after.is_some_and(|hint| !self.policy.accepts_retry_after(hint)) {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    method = %method,
                    url = %request.url(),
                    ?retry_after,
                    max_retry_after_secs = self.policy.max_retry_after.as_secs(),
                    "retry-after exceeds the configured ceiling; giving up"
                );
                return outcome;
            }

            if attempt >= max_attempts {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    method = %method,
                    url = %request.url(),
                    attempts = attempt,
                    outcome = %describe(&outcome),
                    "retry attempts exhausted"
                );
                return outcome;
            }

            let delay = self.policy.delay_for(attempt, retry_after);

            #[cfg(feature = "tracing")]
            tracing::debug!(
                method = %method,
                url = %request.url(),
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                outcome = %describe(&outcome),
                "retrying request"
            );

            sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(feature = "tracing")]
fn describe(outcome: &Result<ApiResponse>) -> String {
    match outcome {
        Ok(response) => response.status().to_string(),
        Err(err) => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use reqwest::Method;
    use serde_json::json;
    use tokio::time::Instant;

    use super::{RetryLayer, RetryPolicy, RetryStrategy};
    use crate::{
        testing::ScriptedTransport, ApiError, ApiRequest, Transport, TransportErrorKind,
    };

    fn request(method: Method) -> ApiRequest {
        ApiRequest::parse(method, "https://api.test/orders").expect("valid url")
    }

    fn fast(policy: RetryPolicy) -> RetryPolicy {
        policy.with_base_backoff(Duration::from_millis(1))
    }

    async fn run(
        policy: RetryPolicy,
        script: ScriptedTransport,
        method: Method,
    ) -> (crate::Result<crate::ApiResponse>, usize) {
        let transport = Arc::new(script);
        let layer = RetryLayer::new(transport.clone(), policy);
        let outcome = layer.send(request(method)).await;
        (outcome, transport.hits())
    }

    #[tokio::test]
    async fn idempotent_only_never_retries_post_or_patch_on_gateway_errors() {
        for method in [Method::POST, Method::PATCH] {
            for status in [502, 503, 504] {
                let script = ScriptedTransport::new()
                    .respond_json(status, json!({}))
                    .respond_json(200, json!({}));
                let (outcome, hits) =
                    run(fast(RetryPolicy::idempotent_only()), script, method.clone()).await;

                assert_eq!(hits, 1, "{method} on {status} must not retry");
                assert_eq!(outcome.expect("response").status().as_u16(), status);
            }
        }
    }

    #[tokio::test]
    async fn idempotent_only_retries_get_until_success() {
        let script = ScriptedTransport::new()
            .respond_json(503, json!({}))
            .respond_json(502, json!({}))
            .respond_json(200, json!({"ok": true}));
        let (outcome, hits) = run(fast(RetryPolicy::idempotent_only()), script, Method::GET).await;

        assert_eq!(hits, 3);
        assert!(outcome.expect("response").is_success());
    }

    #[tokio::test]
    async fn idempotent_only_does_not_retry_rate_limit_or_client_errors() {
        for status in [429, 404] {
            let script = ScriptedTransport::new()
                .respond_json(status, json!({}))
                .respond_json(200, json!({}));
            let (_, hits) = run(fast(RetryPolicy::idempotent_only()), script, Method::GET).await;
            assert_eq!(hits, 1);
        }
    }

    #[tokio::test]
    async fn rate_limit_is_retried_for_every_method_up_to_max_attempts() {
        let strategies = [RetryPolicy::rate_limit_aware(), RetryPolicy::all_methods()];
        for policy in strategies {
            for method in [Method::GET, Method::POST, Method::PATCH, Method::DELETE] {
                let mut script = ScriptedTransport::new();
                for _ in 0..10 {
                    script = script.respond_json(429, json!({}));
                }
                let (outcome, hits) =
                    run(fast(policy.clone()).with_max_attempts(4), script, method).await;

                assert_eq!(hits, 4);
                assert_eq!(outcome.expect("response").status().as_u16(), 429);
            }
        }
    }

    #[tokio::test]
    async fn rate_limit_aware_retries_put_and_delete_on_server_errors() {
        for method in [Method::PUT, Method::DELETE] {
            let script = ScriptedTransport::new()
                .respond_json(503, json!({}))
                .respond_json(200, json!({}));
            let (_, hits) = run(fast(RetryPolicy::rate_limit_aware()), script, method).await;
            assert_eq!(hits, 2);
        }

        let script = ScriptedTransport::new()
            .respond_json(503, json!({}))
            .respond_json(201, json!({}));
        let (_, hits) = run(fast(RetryPolicy::rate_limit_aware()), script, Method::POST).await;
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn put_delete_idempotency_is_configurable_both_ways() {
        let strict = fast(RetryPolicy::rate_limit_aware()).with_put_delete_idempotent(false);
        let script = ScriptedTransport::new()
            .respond_json(503, json!({}))
            .respond_json(200, json!({}));
        let (_, hits) = run(strict, script, Method::PUT).await;
        assert_eq!(hits, 1);

        let relaxed = fast(RetryPolicy::idempotent_only()).with_put_delete_idempotent(true);
        let script = ScriptedTransport::new()
            .respond_json(503, json!({}))
            .respond_json(204, json!({}));
        let (_, hits) = run(relaxed, script, Method::DELETE).await;
        assert_eq!(hits, 2);
    }

    #[tokio::test]
    async fn all_methods_retries_post_on_server_error() {
        let script = ScriptedTransport::new()
            .respond_json(502, json!({}))
            .respond_json(201, json!({}));
        let (outcome, hits) = run(fast(RetryPolicy::all_methods()), script, Method::POST).await;

        assert_eq!(hits, 2);
        assert_eq!(outcome.expect("response").status().as_u16(), 201);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_response_unchanged() {
        let script = ScriptedTransport::new()
            .respond_json(503, json!({"attempt": 1}))
            .respond_json(503, json!({"attempt": 2}))
            .respond_json(504, json!({"attempt": 3}));
        let (outcome, hits) = run(
            fast(RetryPolicy::idempotent_only()).with_max_attempts(3),
            script,
            Method::GET,
        )
        .await;

        let response = outcome.expect("last response");
        assert_eq!(hits, 3);
        assert_eq!(response.status().as_u16(), 504);
        assert_eq!(response.text(), r#"{"attempt":3}"#);
    }

    #[tokio::test]
    async fn transport_failures_follow_the_idempotency_gate() {
        let script = ScriptedTransport::new()
            .fail(TransportErrorKind::Connect)
            .respond_json(200, json!({}));
        let (outcome, hits) = run(fast(RetryPolicy::idempotent_only()), script, Method::GET).await;
        assert_eq!(hits, 2);
        assert!(outcome.is_ok());

        let script = ScriptedTransport::new()
            .fail(TransportErrorKind::Timeout)
            .respond_json(200, json!({}));
        let (outcome, hits) = run(fast(RetryPolicy::idempotent_only()), script, Method::POST).await;
        assert_eq!(hits, 1);
        assert!(matches!(
            outcome,
            Err(ApiError::Transport {
                kind: TransportErrorKind::Timeout,
                ..
            })
        ));
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy::idempotent_only()
            .with_base_backoff(Duration::from_secs(1))
            .with_backoff_factor(2.0);
        let delays: Vec<u64> = (1..=5).map(|a| policy.backoff_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn retry_after_wins_only_when_larger() {
        let policy = RetryPolicy::rate_limit_aware();
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        assert_eq!(
            policy.delay_for(4, Some(Duration::from_secs(3))),
            Duration::from_secs(8)
        );
        assert_eq!(
            policy
                .clone()
                .ignore_retry_after()
                .delay_for(1, Some(Duration::from_secs(30))),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn backoff_is_capped_without_overflow() {
        let policy = RetryPolicy::idempotent_only().with_max_backoff(Duration::from_secs(60));
        assert_eq!(policy.backoff_for(1_000), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_follow_backoff_schedule() {
        let mut script = ScriptedTransport::new();
        for _ in 0..6 {
            script = script.respond_json(503, json!({}));
        }
        let transport = Arc::new(script);
        let layer = RetryLayer::new(transport.clone(), RetryPolicy::idempotent_only());

        let started = Instant::now();
        let response = layer.send(request(Method::GET)).await.expect("response");
        let elapsed = started.elapsed();

        assert_eq!(response.status().as_u16(), 503);
        assert_eq!(transport.hits(), 6);
        assert!(elapsed >= Duration::from_secs(31), "waited {elapsed:?}");
        assert!(elapsed < Duration::from_millis(31_100), "waited {elapsed:?}");

        let gaps = transport.request_gaps();
        let seconds: Vec<u64> = gaps.iter().map(|gap| gap.as_secs()).collect();
        assert_eq!(seconds, vec![1, 2, 4, 8, 16]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_header_forces_longer_wait() {
        let script = ScriptedTransport::new()
            .respond_with_headers(429, &[("retry-after", "30")], json!({}))
            .respond_json(201, json!({}));
        let transport = Arc::new(script);
        let layer = RetryLayer::new(transport.clone(), RetryPolicy::rate_limit_aware());

        let started = Instant::now();
        let response = layer.send(request(Method::POST)).await.expect("response");

        assert_eq!(response.status().as_u16(), 201);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(transport.hits(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_retry_after_returns_rate_limited_response() {
        let script = ScriptedTransport::new()
            .respond_with_headers(429, &[("retry-after", "86400")], json!({}))
            .respond_json(201, json!({}));
        let transport = Arc::new(script);
        let layer = RetryLayer::new(transport.clone(), RetryPolicy::rate_limit_aware());

        let started = Instant::now();
        let response = layer.send(request(Method::POST)).await.expect("response");

        assert_eq!(response.status().as_u16(), 429);
        assert_eq!(transport.hits(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn retry_after_ceiling_is_configurable() {
        let policy = RetryPolicy::default().with_max_retry_after(Duration::from_secs(10));
        assert!(policy.accepts_retry_after(Duration::from_secs(10)));
        assert!(!policy.accepts_retry_after(Duration::from_secs(11)));
        assert!(policy
            .ignore_retry_after()
            .accepts_retry_after(Duration::from_secs(86_400)));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_call_cancels_pending_backoff() {
        let script = ScriptedTransport::new()
            .respond_json(503, json!({}))
            .respond_json(200, json!({}));
        let transport = Arc::new(script);
        let layer = RetryLayer::new(
            transport.clone(),
            RetryPolicy::idempotent_only().with_base_backoff(Duration::from_secs(60)),
        );

        let outcome =
            tokio::time::timeout(Duration::from_secs(5), layer.send(request(Method::GET))).await;

        assert!(outcome.is_err());
        assert_eq!(transport.hits(), 1);
    }

    #[test]
    fn validate_rejects_unacknowledged_all_methods() {
        let err = RetryPolicy::all_methods()
            .validate(false)
            .expect_err("must be rejected");
        assert!(matches!(err, ApiError::Configuration(_)));
        assert!(RetryPolicy::all_methods().validate(true).is_ok());
    }

    #[test]
    fn validate_rejects_zero_attempts_and_shrinking_backoff() {
        assert!(RetryPolicy::default().with_max_attempts(0).validate(false).is_err());
        assert!(RetryPolicy::default()
            .with_backoff_factor(0.5)
            .validate(false)
            .is_err());
        assert!(RetryPolicy::default()
            .with_retry_status_codes([1000])
            .validate(false)
            .is_err());
    }

    #[test]
    fn strategy_parses_from_names() {
        assert_eq!(
            "idempotent_only".parse::<RetryStrategy>().ok(),
            Some(RetryStrategy::IdempotentOnly)
        );
        assert_eq!(
            "rate-limited".parse::<RetryStrategy>().ok(),
            Some(RetryStrategy::RateLimitAware)
        );
        assert_eq!(
            "ALL_METHODS".parse::<RetryStrategy>().ok(),
            Some(RetryStrategy::AllMethods)
        );
        assert!("sometimes".parse::<RetryStrategy>().is_err());
    }
}
