//! Two-layer rate limiting in front of a request handler.
//!
//! A request is first counted against `{action}:{ip}`. If that passes and the
//! JSON body carries an `email` or `identifier`, it is also counted against
//! `{action}:{ip}:{identifier}`. Either check can refuse with a 429. If the
//! limiter itself fails, the request is let through and the failure is
//! reported as [`CheckOutcome::Degraded`].

use axum::http::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, warn};

use crate::config::RateLimitConfig;
use crate::error::RateLimitError;
use crate::metrics::{DEGRADED, LIMITED_BY_IDENTIFIER, LIMITED_BY_IP};
use crate::models::RateLimitedBody;
use crate::rate_limit::{RateLimitOutcome, RateLimiter, rate_limit_key};

pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
pub const RESET_HEADER: &str = "X-RateLimit-Reset";

pub const FALLBACK_IP: &str = "127.0.0.1";

const IP_LIMITED_MESSAGE: &str = "Too many requests, please try again later.";
const IDENTIFIER_LIMITED_MESSAGE: &str =
    "Too many attempts for this account, please try again later.";

/// What the limiter needs to read from an inbound request.
pub trait ClientRequest {
    /// Header value. Repeated headers come back joined with `", "`.
    fn header(&self, name: &str) -> Option<String>;

    /// Remote address of the connection.
    fn remote_addr(&self) -> Option<String>;

    /// Request-level IP set by the framework, if any.
    fn ip(&self) -> Option<&str> {
        None
    }

    /// Already-parsed JSON body.
    fn json_body(&self) -> Option<&Value>;
}

/// What the limiter needs to write on the outbound response.
pub trait ClientResponse {
    fn set_header(&mut self, name: &'static str, value: String);
    fn send_json(&mut self, status: StatusCode, body: Value);
}

/// Where the client IP comes from.
///
/// `ForwardedFor` trusts `x-forwarded-for` first and is only correct behind a
/// reverse proxy that overwrites the header. Otherwise use `Socket`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpSource {
    #[default]
    ForwardedFor,
    Socket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Ip,
    Identifier,
}

#[derive(Debug)]
pub enum CheckOutcome {
    Allowed,
    /// The 429 has already been written to the response.
    Limited(LimitScope),
    /// The limiter failed; the request should go through.
    Degraded(RateLimitError),
}

/// Client IP, in order: x-forwarded-for (if trusted), connection address,
/// request ip, then `127.0.0.1`. The header value is taken verbatim.
pub fn client_ip<Q: ClientRequest + ?Sized>(req: &Q, source: IpSource) -> String {
    let forwarded = match source {
        IpSource::ForwardedFor => req.header("x-forwarded-for").filter(|v| !v.is_empty()),
        IpSource::Socket => None,
    };

    forwarded
        .or_else(|| req.remote_addr())
        .or_else(|| req.ip().map(str::to_string))
        .unwrap_or_else(|| FALLBACK_IP.to_string())
}

/// `email`, else `identifier`, from a JSON object body.
///
/// Non-empty strings, non-zero numbers and `true` count; numbers and booleans
/// are stringified. Empty, zero, false, null, objects and arrays are skipped.
pub fn request_identifier<Q: ClientRequest + ?Sized>(req: &Q) -> Option<String> {
    let body = req.json_body()?.as_object()?;
    ["email", "identifier"]
        .iter()
        .find_map(|field| body.get(*field).and_then(identifier_value))
}

fn identifier_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        Value::Bool(true) => Some("true".to_string()),
        _ => None,
    }
}

/// Rate limiting for one action profile.
pub struct RateLimitGuard {
    limiter: Arc<RateLimiter>,
    action: String,
    config: &'static RateLimitConfig,
    ip_source: IpSource,
}

impl RateLimitGuard {
    pub fn new(limiter: Arc<RateLimiter>, action: impl Into<String>) -> Self {
        let action = action.into();
        let config = RateLimitConfig::for_action(&action);
        Self {
            limiter,
            action,
            config,
            ip_source: IpSource::default(),
        }
    }

    pub fn with_ip_source(mut self, ip_source: IpSource) -> Self {
        self.ip_source = ip_source;
        self
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn config(&self) -> &'static RateLimitConfig {
        self.config
    }

    /// Run both checks. Never fails: limiter errors come back as `Degraded`.
    pub fn apply<Q, S>(&self, req: &Q, res: &mut S) -> CheckOutcome
    where
        Q: ClientRequest + ?Sized,
        S: ClientResponse + ?Sized,
    {
        match self.try_apply(req, res) {
            Ok(outcome) => outcome,
            Err(err) => {
                DEGRADED.inc();
                error!(
                    action = %self.action,
                    error = %err,
                    "Rate limiter failed, letting request through"
                );
                CheckOutcome::Degraded(err)
            }
        }
    }

    fn try_apply<Q, S>(&self, req: &Q, res: &mut S) -> Result<CheckOutcome, RateLimitError>
    where
        Q: ClientRequest + ?Sized,
        S: ClientResponse + ?Sized,
    {
        let ip = client_ip(req, self.ip_source);
        let identifier = request_identifier(req);

        let ip_key = rate_limit_key(&ip, &self.action, None);
        let by_ip = self.limiter.check_rate_limit(&ip_key, Some(self.config))?;

        res.set_header(LIMIT_HEADER, self.config.max_requests.to_string());
        res.set_header(REMAINING_HEADER, by_ip.remaining.to_string());
        res.set_header(RESET_HEADER, (by_ip.reset_time / 1000).to_string());

        if by_ip.limited {
            self.refuse(res, &by_ip, LimitScope::Ip)?;
            return Ok(CheckOutcome::Limited(LimitScope::Ip));
        }

        if let Some(identifier) = identifier {
            let key = rate_limit_key(&ip, &self.action, Some(&identifier));
            let by_identifier = self.limiter.check_rate_limit(&key, Some(self.config))?;
            if by_identifier.limited {
                self.refuse(res, &by_identifier, LimitScope::Identifier)?;
                return Ok(CheckOutcome::Limited(LimitScope::Identifier));
            }
        }

        Ok(CheckOutcome::Allowed)
    }

    fn refuse<S>(
        &self,
        res: &mut S,
        outcome: &RateLimitOutcome,
        scope: LimitScope,
    ) -> Result<(), RateLimitError>
    where
        S: ClientResponse + ?Sized,
    {
        let message = match scope {
            LimitScope::Ip => {
                LIMITED_BY_IP.inc();
                IP_LIMITED_MESSAGE
            }
            LimitScope::Identifier => {
                LIMITED_BY_IDENTIFIER.inc();
                IDENTIFIER_LIMITED_MESSAGE
            }
        };

        warn!(
            action = %self.action,
            profile = self.config.identifier,
            key = %outcome.key,
            scope = ?scope,
            "Rate limit exceeded"
        );

        let body = serde_json::to_value(RateLimitedBody {
            error: message.to_string(),
            retry_after: outcome.retry_after_secs(),
        })?;
        res.send_json(StatusCode::TOO_MANY_REQUESTS, body);
        Ok(())
    }
}

/// Result of calling a rate-limited handler.
#[derive(Debug)]
pub enum Guarded<T> {
    Allowed(T),
    /// Handler ran because the limiter failed.
    Degraded { error: RateLimitError, output: T },
    /// Handler did not run; a 429 was written.
    Refused(LimitScope),
}

impl<T> Guarded<T> {
    pub fn into_output(self) -> Option<T> {
        match self {
            Guarded::Allowed(output) | Guarded::Degraded { output, .. } => Some(output),
            Guarded::Refused(_) => None,
        }
    }
}

/// A handler wrapped by [`with_rate_limit`].
pub struct RateLimited<H> {
    guard: RateLimitGuard,
    handler: H,
}

/// Wrap `handler` so every call is rate limited under the `action` profile.
/// Unknown actions use the default profile.
pub fn with_rate_limit<H>(limiter: Arc<RateLimiter>, handler: H, action: &str) -> RateLimited<H> {
    RateLimited {
        guard: RateLimitGuard::new(limiter, action),
        handler,
    }
}

impl<H> RateLimited<H> {
    pub fn with_ip_source(mut self, ip_source: IpSource) -> Self {
        self.guard = self.guard.with_ip_source(ip_source);
        self
    }

    pub fn guard(&self) -> &RateLimitGuard {
        &self.guard
    }

    pub async fn call<Q, S, T>(&self, req: &Q, res: &mut S) -> Guarded<T>
    where
        Q: ClientRequest,
        S: ClientResponse,
        H: AsyncFn(&Q, &mut S) -> T,
    {
        match self.guard.apply(req, res) {
            CheckOutcome::Allowed => Guarded::Allowed((self.handler)(req, res).await),
            CheckOutcome::Limited(scope) => Guarded::Refused(scope),
            CheckOutcome::Degraded(error) => {
                let output = (self.handler)(req, res).await;
                Guarded::Degraded { error, output }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct TestRequest {
        headers: HashMap<String, String>,
        remote: Option<String>,
        ip: Option<String>,
        body: Option<Value>,
    }

    impl TestRequest {
        fn from_ip(ip: &str) -> Self {
            Self {
                remote: Some(ip.to_string()),
                ..Default::default()
            }
        }

        fn with_body(mut self, body: Value) -> Self {
            self.body = Some(body);
            self
        }
    }

    impl ClientRequest for TestRequest {
        fn header(&self, name: &str) -> Option<String> {
            self.headers.get(name).cloned()
        }

        fn remote_addr(&self) -> Option<String> {
            self.remote.clone()
        }

        fn ip(&self) -> Option<&str> {
            self.ip.as_deref()
        }

        fn json_body(&self) -> Option<&Value> {
            self.body.as_ref()
        }
    }

    #[derive(Default)]
    struct TestResponse {
        headers: HashMap<&'static str, String>,
        sent: Option<(StatusCode, Value)>,
        headers_at_send: usize,
    }

    impl ClientResponse for TestResponse {
        fn set_header(&mut self, name: &'static str, value: String) {
            self.headers.insert(name, value);
        }

        fn send_json(&mut self, status: StatusCode, body: Value) {
            self.headers_at_send = self.headers.len();
            self.sent = Some((status, body));
        }
    }

    fn setup() -> (Arc<ManualClock>, Arc<RateLimiter>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let limiter = Arc::new(RateLimiter::with_clock(clock.clone()));
        (clock, limiter)
    }

    #[test]
    fn ip_precedence() {
        let mut req = TestRequest {
            ip: Some("9.9.9.9".into()),
            ..Default::default()
        };
        assert_eq!(client_ip(&req, IpSource::ForwardedFor), "9.9.9.9");

        req.remote = Some("10.0.0.2".into());
        assert_eq!(client_ip(&req, IpSource::ForwardedFor), "10.0.0.2");

        req.headers.insert("x-forwarded-for".into(), "1.1.1.1, 10.0.0.1".into());
        assert_eq!(client_ip(&req, IpSource::ForwardedFor), "1.1.1.1, 10.0.0.1");
        assert_eq!(client_ip(&req, IpSource::Socket), "10.0.0.2");

        assert_eq!(client_ip(&TestRequest::default(), IpSource::ForwardedFor), FALLBACK_IP);
    }

    #[test]
    fn identifier_from_body() {
        let req = TestRequest::default().with_body(json!({ "email": "a@b.co", "identifier": "x" }));
        assert_eq!(request_identifier(&req), Some("a@b.co".to_string()));

        let req = TestRequest::default().with_body(json!({ "identifier": "user-7" }));
        assert_eq!(request_identifier(&req), Some("user-7".to_string()));

        let req = TestRequest::default().with_body(json!({ "email": "", "identifier": "user-7" }));
        assert_eq!(request_identifier(&req), Some("user-7".to_string()));

        let req = TestRequest::default().with_body(json!(["a@b.co"]));
        assert_eq!(request_identifier(&req), None);

        assert_eq!(request_identifier(&TestRequest::default()), None);
    }

    #[test]
    fn scalar_identifiers_are_stringified() {
        let req = TestRequest::default().with_body(json!({ "identifier": 1234 }));
        assert_eq!(request_identifier(&req), Some("1234".to_string()));

        let req = TestRequest::default().with_body(json!({ "email": 0, "identifier": true }));
        assert_eq!(request_identifier(&req), Some("true".to_string()));

        let req = TestRequest::default().with_body(json!({ "email": false, "identifier": null }));
        assert_eq!(request_identifier(&req), None);

        let req = TestRequest::default().with_body(json!({ "email": { "nested": 1 } }));
        assert_eq!(request_identifier(&req), None);
    }

    #[tokio::test]
    async fn numeric_identifier_gets_its_own_counter() {
        let (_, limiter) = setup();
        let login = with_rate_limit(
            limiter.clone(),
            async |_: &TestRequest, _: &mut TestResponse| (),
            "login",
        );

        let req = TestRequest::from_ip("1.2.3.4").with_body(json!({ "identifier": 42 }));
        login.call(&req, &mut TestResponse::default()).await;
        assert_eq!(limiter.entry("login:1.2.3.4:42").unwrap().count, 1);
    }

    #[tokio::test]
    async fn limits_after_profile_ceiling() {
        let (_, limiter) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let login = with_rate_limit(
            limiter,
            async move |_: &TestRequest, _: &mut TestResponse| {
                counter.fetch_add(1, Ordering::SeqCst);
                "ok"
            },
            "login",
        );

        let req = TestRequest::from_ip("1.2.3.4");
        for expected_remaining in ["4", "3", "2", "1", "0"] {
            let mut res = TestResponse::default();
            assert!(matches!(login.call(&req, &mut res).await, Guarded::Allowed("ok")));
            assert_eq!(res.headers[LIMIT_HEADER], "5");
            assert_eq!(res.headers[REMAINING_HEADER], expected_remaining);
            assert!(res.sent.is_none());
        }

        let mut res = TestResponse::default();
        assert!(matches!(login.call(&req, &mut res).await, Guarded::Refused(LimitScope::Ip)));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let (status, body) = res.sent.unwrap();
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        let body: RateLimitedBody = serde_json::from_value(body).unwrap();
        assert_eq!(body.error, IP_LIMITED_MESSAGE);
        assert_eq!(body.retry_after, 60);
        assert_eq!(res.headers[REMAINING_HEADER], "0");
        assert_eq!(res.headers[RESET_HEADER], "1700000060");
        assert_eq!(res.headers_at_send, 3);
    }

    #[tokio::test]
    async fn retry_after_rounds_up() {
        let (clock, limiter) = setup();
        let signup = with_rate_limit(
            limiter,
            async |_: &TestRequest, _: &mut TestResponse| (),
            "signup",
        );
        let req = TestRequest::from_ip("1.2.3.4");

        for _ in 0..3 {
            signup.call(&req, &mut TestResponse::default()).await;
        }
        clock.advance(Duration::from_millis(20_500));

        let mut res = TestResponse::default();
        assert!(matches!(signup.call(&req, &mut res).await, Guarded::Refused(_)));
        let body: RateLimitedBody = serde_json::from_value(res.sent.unwrap().1).unwrap();
        assert_eq!(body.retry_after, 40);
    }

    #[tokio::test]
    async fn identifier_limit_applies_while_ip_has_headroom() {
        let (_, limiter) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let login = with_rate_limit(
            limiter.clone(),
            async move |_: &TestRequest, _: &mut TestResponse| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            "login",
        );

        // identifier counter exhausted from an earlier window of activity
        for _ in 0..5 {
            limiter
                .check_rate_limit("login:1.2.3.4:a@b.co", Some(login.guard().config()))
                .unwrap();
        }

        let req = TestRequest::from_ip("1.2.3.4").with_body(json!({ "email": "a@b.co" }));
        let mut res = TestResponse::default();
        assert!(matches!(
            login.call(&req, &mut res).await,
            Guarded::Refused(LimitScope::Identifier)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(res.headers[REMAINING_HEADER], "4");

        let body: RateLimitedBody = serde_json::from_value(res.sent.unwrap().1).unwrap();
        assert_eq!(body.error, IDENTIFIER_LIMITED_MESSAGE);

        // another account from the same IP is unaffected
        let other = TestRequest::from_ip("1.2.3.4").with_body(json!({ "email": "c@d.co" }));
        assert!(matches!(
            login.call(&other, &mut TestResponse::default()).await,
            Guarded::Allowed(())
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ip_limit_short_circuits_identifier_check() {
        let (_, limiter) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let login = with_rate_limit(
            limiter.clone(),
            async move |_: &TestRequest, _: &mut TestResponse| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            "login",
        );

        for _ in 0..5 {
            limiter
                .check_rate_limit("login:1.2.3.4", Some(login.guard().config()))
                .unwrap();
        }

        let req = TestRequest::from_ip("1.2.3.4").with_body(json!({ "email": "a@b.co" }));
        let mut res = TestResponse::default();
        assert!(matches!(login.call(&req, &mut res).await, Guarded::Refused(LimitScope::Ip)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(limiter.entry("login:1.2.3.4:a@b.co").is_none());
    }

    #[tokio::test]
    async fn limiter_failure_fails_open() {
        let (clock, limiter) = setup();
        let handler = with_rate_limit(
            limiter,
            async |_: &TestRequest, _: &mut TestResponse| 42,
            "login",
        );
        clock.set_failing(true);

        let req = TestRequest::from_ip("1.2.3.4");
        for _ in 0..10 {
            let mut res = TestResponse::default();
            match handler.call(&req, &mut res).await {
                Guarded::Degraded { error, output } => {
                    assert!(matches!(error, RateLimitError::Clock(_)));
                    assert_eq!(output, 42);
                }
                other => panic!("expected degraded, got {:?}", other),
            }
            assert!(res.sent.is_none());
            assert!(res.headers.is_empty());
        }
    }

    #[tokio::test]
    async fn unknown_action_uses_default_profile() {
        let (_, limiter) = setup();
        let handler = with_rate_limit(
            limiter.clone(),
            async |_: &TestRequest, _: &mut TestResponse| (),
            "nonexistent",
        );
        assert_eq!(handler.guard().config(), &crate::config::DEFAULT);

        let req = TestRequest::from_ip("1.2.3.4");
        for _ in 0..20 {
            let mut res = TestResponse::default();
            assert!(matches!(handler.call(&req, &mut res).await, Guarded::Allowed(())));
            assert_eq!(res.headers[LIMIT_HEADER], "20");
        }
        assert!(matches!(
            handler.call(&req, &mut TestResponse::default()).await,
            Guarded::Refused(LimitScope::Ip)
        ));
        assert!(limiter.entry("nonexistent:1.2.3.4").is_some());
    }

    #[tokio::test]
    async fn window_reset_readmits_requests() {
        let (clock, limiter) = setup();
        let handler = with_rate_limit(
            limiter,
            async |_: &TestRequest, _: &mut TestResponse| (),
            "signup",
        );
        let req = TestRequest::from_ip("1.2.3.4");

        for _ in 0..3 {
            handler.call(&req, &mut TestResponse::default()).await;
        }
        assert!(handler.call(&req, &mut TestResponse::default()).await.into_output().is_none());

        clock.advance(Duration::from_secs(61));
        let mut res = TestResponse::default();
        assert!(handler.call(&req, &mut res).await.into_output().is_some());
        assert_eq!(res.headers[REMAINING_HEADER], "2");
    }

    #[tokio::test]
    async fn socket_source_ignores_forwarded_header() {
        let (_, limiter) = setup();
        let handler = with_rate_limit(
            limiter.clone(),
            async |_: &TestRequest, _: &mut TestResponse| (),
            "login",
        )
        .with_ip_source(IpSource::Socket);

        let mut req = TestRequest::from_ip("10.0.0.2");
        req.headers.insert("x-forwarded-for".into(), "6.6.6.6".into());
        handler.call(&req, &mut TestResponse::default()).await;

        assert!(limiter.entry("login:10.0.0.2").is_some());
        assert!(limiter.entry("login:6.6.6.6").is_none());
    }
}
