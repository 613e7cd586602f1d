//! Passthrough authorization chains.
//!
//! A chain is an ordered list of links, each delegating the decision to a
//! remote service over gRPC or HTTP. State returned by one link is handed to
//! the next under [`PASSTHROUGH_STATE_KEY`]. A link whose service cannot be
//! reached (or answers with a server error) is skipped when it allows failure,
//! and fails the whole chain otherwise. An explicit deny always fails it.

use rand::Rng;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::check::CheckContext;
use super::client::{CallRequest, CallResponse, Decision, Target, TransportError};
use super::verdict::{
    merge_headers, HeaderValueOption, Verdict, STATUS_FORBIDDEN, STATUS_SERVICE_UNAVAILABLE,
    STATUS_UNAUTHORIZED,
};
use crate::metadata::{merge_state, State};

/// Key carrying the accumulated chain state on every call.
pub const PASSTHROUGH_STATE_KEY: &str = "solo.auth.passthrough";
/// Key carrying a link's static configuration block.
pub const PASSTHROUGH_CONFIG_KEY: &str = "solo.auth.passthrough.config";

fn default_connection_timeout_ms() -> u64 {
    5000
}

/// A gRPC passthrough service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrpcLink {
    pub address: String,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

/// What an HTTP link sends to its service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestPolicy {
    /// Request headers forwarded to the service
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    /// Static headers added to every call
    #[serde(default)]
    pub headers_to_add: BTreeMap<String, String>,
    #[serde(default)]
    pub pass_through_state: bool,
    #[serde(default)]
    pub pass_through_filter_metadata: bool,
    #[serde(default)]
    pub pass_through_body: bool,
}

/// What an HTTP link takes back from its service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResponsePolicy {
    /// Response headers copied to the upstream request on allow
    #[serde(default)]
    pub allowed_upstream_headers: Vec<String>,
    /// Response headers returned to the client on deny
    #[serde(default)]
    pub allowed_client_headers_on_denied: Vec<String>,
    #[serde(default)]
    pub read_state_from_response: bool,
}

/// An HTTP passthrough service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpLink {
    pub url: String,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default)]
    pub request: HttpRequestPolicy,
    #[serde(default)]
    pub response: HttpResponsePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkProtocol {
    Grpc(GrpcLink),
    Http(HttpLink),
}

/// Bounded retries with jittered exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub num_retries: u32,
    #[serde(default = "default_base_interval_ms")]
    pub base_interval_ms: u64,
    #[serde(default)]
    pub max_interval_ms: Option<u64>,
}

fn default_base_interval_ms() -> u64 {
    100
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            num_retries: 0,
            base_interval_ms: default_base_interval_ms(),
            max_interval_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Sleep before retry number `attempt` (starting at 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_interval_ms.max(1);
        let max = self.max_interval_ms.unwrap_or(base * 10).max(base);
        let ceiling = base
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(20))
            .min(max);
        let jittered = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        Duration::from_millis(jittered)
    }
}

/// One delegated call in a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassthroughLink {
    #[serde(flatten)]
    pub protocol: LinkProtocol,
    /// Skip this link, instead of failing the chain, when its service is unreachable
    #[serde(default)]
    pub failure_mode_allow: bool,
    /// Static configuration forwarded under [`PASSTHROUGH_CONFIG_KEY`]
    #[serde(default)]
    pub config: Option<Map<String, Value>>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

#[derive(Debug)]
enum LinkFailure {
    Transport(TransportError),
    Server,
}

enum LinkOutcome {
    Allowed(CallResponse),
    Denied(CallResponse),
    Failed(LinkFailure),
}

impl PassthroughLink {
    pub fn target(&self) -> Target {
        match &self.protocol {
            LinkProtocol::Grpc(grpc) => Target::Grpc {
                address: grpc.address.clone(),
            },
            LinkProtocol::Http(http) => Target::Http {
                url: http.url.clone(),
            },
        }
    }

    fn timeout(&self) -> Duration {
        let ms = match &self.protocol {
            LinkProtocol::Grpc(grpc) => grpc.connection_timeout_ms,
            LinkProtocol::Http(http) => http.connection_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    fn build_call(&self, ctx: &CheckContext<'_>, state: &State) -> CallRequest {
        let mut call = CallRequest::new(self.target(), self.timeout());
        match &self.protocol {
            LinkProtocol::Grpc(_) => {
                call.headers = ctx
                    .request
                    .headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                call.metadata.insert(
                    PASSTHROUGH_STATE_KEY.to_string(),
                    Value::Object(state.clone()),
                );
                if let Some(config) = &self.config {
                    call.metadata.insert(
                        PASSTHROUGH_CONFIG_KEY.to_string(),
                        Value::Object(config.clone()),
                    );
                }
            }
            LinkProtocol::Http(http) => {
                let policy = &http.request;
                call.headers = policy
                    .allowed_headers
                    .iter()
                    .filter_map(|name| {
                        ctx.request
                            .headers
                            .get(name)
                            .map(|value| (name.to_ascii_lowercase(), value.to_string()))
                    })
                    .collect();
                call.headers.extend(
                    policy
                        .headers_to_add
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );

                let mut body = Map::new();
                if policy.pass_through_state {
                    body.insert("state".to_string(), Value::Object(state.clone()));
                }
                if policy.pass_through_filter_metadata {
                    if let Ok(metadata) = serde_json::to_value(&ctx.request.metadata) {
                        body.insert("filterMetadata".to_string(), metadata);
                    }
                }
                if policy.pass_through_body {
                    if let Some(request_body) = &ctx.request.body {
                        body.insert("body".to_string(), Value::String(request_body.clone()));
                    }
                }
                if let Some(config) = &self.config {
                    body.insert("config".to_string(), Value::Object(config.clone()));
                }
                if !body.is_empty() {
                    call.body = Some(Value::Object(body));
                }
            }
        }
        call
    }

    /// Call the service, retrying transport and server failures.
    async fn execute(&self, ctx: &CheckContext<'_>, state: &State) -> LinkOutcome {
        let target = self.target();
        let mut attempt = 0u32;
        loop {
            let call = self.build_call(ctx, state);
            let timeout = call.timeout;
            let result = tokio::select! {
                _ = ctx.cancel.cancelled() => Err(TransportError::Cancelled),
                result = tokio::time::timeout(timeout, ctx.client.call(call)) => {
                    result.unwrap_or(Err(TransportError::Timeout(timeout)))
                }
            };

            let failure = match result {
                Ok(response) => match response.decision {
                    Decision::Allow => return LinkOutcome::Allowed(response),
                    Decision::Deny => return LinkOutcome::Denied(response),
                    Decision::ServerError => LinkFailure::Server,
                },
                Err(TransportError::Cancelled) => {
                    return LinkOutcome::Failed(LinkFailure::Transport(TransportError::Cancelled))
                }
                Err(e) => LinkFailure::Transport(e),
            };

            if attempt >= self.retry_policy.num_retries {
                return LinkOutcome::Failed(failure);
            }
            attempt += 1;
            let delay = self.retry_policy.backoff(attempt);
            debug!(service = %target, attempt, ?delay, ?failure, "retrying passthrough call");
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return LinkOutcome::Failed(LinkFailure::Transport(TransportError::Cancelled))
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn failure_status(&self, failure: &LinkFailure) -> u16 {
        match (&self.protocol, failure) {
            (LinkProtocol::Grpc(_), LinkFailure::Server) => STATUS_SERVICE_UNAVAILABLE,
            (LinkProtocol::Grpc(_), LinkFailure::Transport(_)) => STATUS_FORBIDDEN,
            (LinkProtocol::Http(_), _) => STATUS_UNAUTHORIZED,
        }
    }

    fn deny_status(&self, response: &CallResponse) -> u16 {
        match (&self.protocol, response.status) {
            (LinkProtocol::Http(_), Some(status)) if (400..500).contains(&status) => status,
            _ => STATUS_UNAUTHORIZED,
        }
    }

    fn reads_state(&self) -> bool {
        match &self.protocol {
            LinkProtocol::Grpc(_) => true,
            LinkProtocol::Http(http) => http.response.read_state_from_response,
        }
    }

    fn upstream_headers(&self, response: &CallResponse) -> Vec<HeaderValueOption> {
        response
            .headers
            .iter()
            .filter(|(key, _)| match &self.protocol {
                LinkProtocol::Grpc(_) => true,
                LinkProtocol::Http(http) => contains_ignore_case(
                    &http.response.allowed_upstream_headers,
                    key,
                ),
            })
            .map(|(key, value)| HeaderValueOption::new(key.clone(), value.clone(), false))
            .collect()
    }

    fn denied_client_headers(&self, response: &CallResponse) -> Vec<(String, String)> {
        response
            .headers
            .iter()
            .filter(|(key, _)| match &self.protocol {
                LinkProtocol::Grpc(_) => true,
                LinkProtocol::Http(http) => contains_ignore_case(
                    &http.response.allowed_client_headers_on_denied,
                    key,
                ),
            })
            .cloned()
            .collect()
    }
}

fn contains_ignore_case(names: &[String], name: &str) -> bool {
    names.iter().any(|n| n.eq_ignore_ascii_case(name))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChainConfig {
    Chain { chain: Vec<PassthroughLink> },
    Single(PassthroughLink),
}

impl From<ChainConfig> for PassthroughChain {
    fn from(config: ChainConfig) -> Self {
        match config {
            ChainConfig::Chain { chain } => PassthroughChain { links: chain },
            ChainConfig::Single(link) => PassthroughChain { links: vec![link] },
        }
    }
}

/// An ordered sequence of passthrough links sharing one state.
///
/// Configured either as a single link or as `chain: [link, ...]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "ChainConfig")]
pub struct PassthroughChain {
    pub links: Vec<PassthroughLink>,
}

impl Serialize for PassthroughChain {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.links.as_slice() {
            [link] => link.serialize(serializer),
            links => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("chain", links)?;
                map.end()
            }
        }
    }
}

impl PassthroughChain {
    pub fn new(links: Vec<PassthroughLink>) -> Self {
        Self { links }
    }

    /// Run every link in order, starting from the state in `ctx`.
    #[instrument(name = "passthrough", skip_all, fields(links = self.links.len()))]
    pub async fn run(&self, ctx: &CheckContext<'_>) -> Verdict {
        let mut state = ctx.state.clone();
        let mut upstream_headers: Vec<HeaderValueOption> = Vec::new();

        for (index, link) in self.links.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Verdict::error("request cancelled");
            }
            let target = link.target();

            match link.execute(ctx, &state).await {
                LinkOutcome::Allowed(response) => {
                    debug!(index, service = %target, "passthrough link allowed");
                    upstream_headers = merge_headers(&upstream_headers, &link.upstream_headers(&response));
                    if link.reads_state() {
                        if let Some(returned) = &response.state {
                            merge_state(&mut state, returned);
                        }
                    }
                }
                LinkOutcome::Denied(response) => {
                    debug!(index, service = %target, "passthrough link denied");
                    let mut verdict = Verdict::deny(format!("{} denied the request", target))
                        .with_status(link.deny_status(&response));
                    verdict.client_headers = link.denied_client_headers(&response);
                    return verdict;
                }
                LinkOutcome::Failed(LinkFailure::Transport(TransportError::Cancelled)) => {
                    return Verdict::error("request cancelled");
                }
                LinkOutcome::Failed(failure) => {
                    if link.failure_mode_allow {
                        warn!(index, service = %target, ?failure, "passthrough link failed, skipping");
                        continue;
                    }
                    warn!(index, service = %target, ?failure, "passthrough link failed");
                    return Verdict::deny(format!("{} failed", target))
                        .with_status(link.failure_status(&failure));
                }
            }
        }

        let mut verdict = Verdict::allow().with_state(state);
        verdict.upstream_headers = upstream_headers;
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::client::mock::MockClient;
    use crate::auth::verdict::Outcome;
    use crate::request::RequestContext;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn grpc(address: &str, failure_mode_allow: bool) -> PassthroughLink {
        PassthroughLink {
            protocol: LinkProtocol::Grpc(GrpcLink {
                address: address.to_string(),
                connection_timeout_ms: 200,
            }),
            failure_mode_allow,
            config: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    fn http(url: &str, failure_mode_allow: bool) -> PassthroughLink {
        PassthroughLink {
            protocol: LinkProtocol::Http(HttpLink {
                url: url.to_string(),
                connection_timeout_ms: 200,
                request: HttpRequestPolicy {
                    pass_through_state: true,
                    ..Default::default()
                },
                response: HttpResponsePolicy {
                    read_state_from_response: true,
                    allowed_upstream_headers: vec!["x-passthrough".to_string()],
                    ..Default::default()
                },
            }),
            failure_mode_allow,
            config: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    fn passthrough_state(call: &CallRequest) -> State {
        call.metadata
            .get(PASSTHROUGH_STATE_KEY)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// Allows only when the incoming state carries `key`.
    fn requires(key: &'static str) -> impl Fn(&CallRequest) -> Result<CallResponse, TransportError> {
        move |call| {
            if passthrough_state(call).contains_key(key) {
                Ok(CallResponse::allow())
            } else {
                Ok(CallResponse::deny())
            }
        }
    }

    fn emits(key: &'static str, value: &'static str) -> impl Fn(&CallRequest) -> Result<CallResponse, TransportError> {
        move |_| {
            let mut state = State::new();
            state.insert(key.to_string(), Value::from(value));
            Ok(CallResponse::allow().with_state(state))
        }
    }

    async fn run(chain: &PassthroughChain, client: &MockClient) -> Verdict {
        let request = RequestContext::default();
        let state = State::new();
        let cancel = CancellationToken::new();
        let ctx = CheckContext {
            request: &request,
            state: &state,
            client,
            cancel: &cancel,
            timeout: Duration::from_secs(1),
        };
        chain.run(&ctx).await
    }

    #[tokio::test]
    async fn test_state_flows_to_next_link() {
        let client = MockClient::new()
            .on("a:9000", emits("K", "V"))
            .on("b:9000", requires("K"));
        let chain = PassthroughChain::new(vec![grpc("a:9000", false), grpc("b:9000", false)]);

        let verdict = run(&chain, &client).await;
        assert_eq!(verdict.outcome, Outcome::Allow);
        assert_eq!(verdict.emitted_state["K"], Value::from("V"));
        assert_eq!(
            passthrough_state(&client.calls_to("b:9000")[0])["K"],
            Value::from("V")
        );
    }

    #[tokio::test]
    async fn test_missing_state_flips_next_link_to_deny() {
        let client = MockClient::new()
            .on("a:9000", |_| Ok(CallResponse::allow()))
            .on("b:9000", requires("K"));
        let chain = PassthroughChain::new(vec![grpc("a:9000", false), grpc("b:9000", false)]);

        let verdict = run(&chain, &client).await;
        assert_eq!(verdict.outcome, Outcome::Deny);
        assert_eq!(verdict.http_status_override, Some(STATUS_UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_unreachable_link_skipped_with_failure_mode_allow() {
        let client = MockClient::new().on("b:9000", |call| {
            assert!(passthrough_state(call).is_empty());
            Ok(CallResponse::allow())
        });
        let chain = PassthroughChain::new(vec![grpc("a:9000", true), grpc("b:9000", false)]);

        let verdict = run(&chain, &client).await;
        assert_eq!(verdict.outcome, Outcome::Allow);
        assert_eq!(client.calls_to("b:9000").len(), 1);
    }

    #[tokio::test]
    async fn test_failure_status_mapping() {
        // Unreachable gRPC service
        let chain = PassthroughChain::new(vec![grpc("a:9000", false), grpc("b:9000", false)]);
        let client = MockClient::new().on("b:9000", |_| Ok(CallResponse::allow()));
        let verdict = run(&chain, &client).await;
        assert_eq!(verdict.outcome, Outcome::Deny);
        assert_eq!(verdict.http_status_override, Some(STATUS_FORBIDDEN));
        assert!(client.calls_to("b:9000").is_empty());

        // gRPC server error
        let client = MockClient::new().on("a:9000", |_| Ok(CallResponse::server_error()));
        let verdict = run(&chain, &client).await;
        assert_eq!(verdict.http_status_override, Some(STATUS_SERVICE_UNAVAILABLE));

        // HTTP failure
        let chain = PassthroughChain::new(vec![http("http://a.local/auth", false)]);
        let verdict = run(&chain, &MockClient::new()).await;
        assert_eq!(verdict.http_status_override, Some(STATUS_UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_explicit_deny_ignores_failure_mode_allow() {
        let client = MockClient::new().on("a:9000", |_| Ok(CallResponse::deny()));
        let chain = PassthroughChain::new(vec![grpc("a:9000", true)]);
        let verdict = run(&chain, &client).await;
        assert_eq!(verdict.outcome, Outcome::Deny);
        assert_eq!(verdict.http_status_override, Some(STATUS_UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_server_error_then_deny_chain() {
        // A fails with failure mode allow, B denies because A's metadata never arrived.
        let client = MockClient::new()
            .on("a:9000", |_| Ok(CallResponse::server_error()))
            .on("b:9000", requires("K"));
        let chain = PassthroughChain::new(vec![grpc("a:9000", true), grpc("b:9000", false)]);
        let verdict = run(&chain, &client).await;
        assert_eq!(verdict.http_status_override, Some(STATUS_UNAUTHORIZED));

        let chain = PassthroughChain::new(vec![grpc("a:9000", false), grpc("b:9000", true)]);
        let verdict = run(&chain, &client).await;
        assert_eq!(verdict.http_status_override, Some(STATUS_SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_http_link_body_and_headers() {
        let client = MockClient::new()
            .on("a:9000", emits("user", "alice"))
            .on("http://b.local/auth", |call| {
                let body = call.body.clone().unwrap_or_default();
                assert_eq!(body["state"]["user"], Value::from("alice"));
                let mut state = State::new();
                state.insert("tier".to_string(), Value::from("gold"));
                Ok(CallResponse::allow()
                    .with_state(state)
                    .with_header("x-passthrough", "1")
                    .with_header("x-internal", "secret"))
            });
        let chain =
            PassthroughChain::new(vec![grpc("a:9000", false), http("http://b.local/auth", false)]);

        let verdict = run(&chain, &client).await;
        assert_eq!(verdict.outcome, Outcome::Allow);
        assert_eq!(verdict.emitted_state["user"], Value::from("alice"));
        assert_eq!(verdict.emitted_state["tier"], Value::from("gold"));
        assert_eq!(
            verdict.upstream_headers,
            vec![HeaderValueOption::new("x-passthrough", "1", false)]
        );
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let attempts = Arc::new(Mutex::new(0));
        let seen = attempts.clone();
        let client = MockClient::new().on("a:9000", move |_| {
            let mut count = seen.lock();
            *count += 1;
            if *count < 3 {
                Ok(CallResponse::server_error())
            } else {
                Ok(CallResponse::allow())
            }
        });
        let mut link = grpc("a:9000", false);
        link.retry_policy = RetryPolicy {
            num_retries: 2,
            base_interval_ms: 1,
            max_interval_ms: Some(2),
        };

        let verdict = run(&PassthroughChain::new(vec![link]), &client).await;
        assert_eq!(verdict.outcome, Outcome::Allow);
        assert_eq!(*attempts.lock(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_request_aborts_chain() {
        let client = MockClient::new().on("a:9000", |_| Ok(CallResponse::allow()));
        let chain = PassthroughChain::new(vec![grpc("a:9000", false)]);
        let request = RequestContext::default();
        let state = State::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = CheckContext {
            request: &request,
            state: &state,
            client: &client,
            cancel: &cancel,
            timeout: Duration::from_secs(1),
        };

        let verdict = chain.run(&ctx).await;
        assert_eq!(verdict.outcome, Outcome::Error);
        assert!(client.calls().is_empty());
    }

    #[test]
    fn test_backoff_bounds() {
        let policy = RetryPolicy {
            num_retries: 5,
            base_interval_ms: 100,
            max_interval_ms: Some(300),
        };
        for attempt in 1..6 {
            let delay = policy.backoff(attempt);
            assert!(delay <= Duration::from_millis(300));
            assert!(delay >= Duration::from_millis(50));
        }
    }

    #[test]
    fn test_deserialize_single_and_chain() {
        let single: PassthroughChain = serde_yaml::from_str(
            r#"
grpc:
  address: auth.local:9001
failure_mode_allow: true
"#,
        )
        .unwrap();
        assert_eq!(single.links.len(), 1);
        assert!(single.links[0].failure_mode_allow);

        let chain: PassthroughChain = serde_yaml::from_str(
            r#"
chain:
  - grpc:
      address: a.local:9001
  - http:
      url: http://b.local/auth
      request:
        pass_through_state: true
    retry_policy:
      num_retries: 2
"#,
        )
        .unwrap();
        assert_eq!(chain.links.len(), 2);
        assert_eq!(chain.links[1].retry_policy.num_retries, 2);
        assert_eq!(chain.links[1].target(), Target::Http {
            url: "http://b.local/auth".to_string()
        });
    }
}
