//! The request-time entry point: early rate limits, auth, regular rate limits.

use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info, instrument, Span};
use uuid::Uuid;

use crate::auth::verdict::{STATUS_OK, STATUS_TOO_MANY_REQUESTS};
use crate::auth::{AuthServiceClient, EvaluationOptions, HeaderValueOption};
use crate::config::EngineConfig;
use crate::policy::{Policy, PolicyStore};
use crate::ratelimit::{CounterBackend, Judgement, RateLimitJudge};
use crate::request::RequestContext;
use crate::stage::{Stage, StageScheduler};

/// The final answer for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub request_id: String,
    pub allowed: bool,
    pub status: u16,
    /// Headers for the client response
    pub response_headers: Vec<(String, String)>,
    /// Headers to add to the request forwarded upstream
    pub upstream_headers: Vec<HeaderValueOption>,
    pub user_id: Option<String>,
    /// Stage whose rate limits rejected the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited_in: Option<Stage>,
}

impl Decision {
    fn new(request_id: String) -> Self {
        Self {
            request_id,
            allowed: true,
            status: STATUS_OK,
            response_headers: Vec::new(),
            upstream_headers: Vec::new(),
            user_id: None,
            rate_limited_in: None,
        }
    }

    fn rate_limited(mut self, stage: Stage, judgement: Judgement) -> Self {
        self.allowed = false;
        self.status = STATUS_TOO_MANY_REQUESTS;
        self.rate_limited_in = Some(stage);
        self.response_headers.extend(judgement.headers);
        self
    }
}

/// Evaluates requests against the live policy.
pub struct PolicyEngine {
    config: EngineConfig,
    store: Arc<PolicyStore>,
    client: Arc<dyn AuthServiceClient>,
    judge: RateLimitJudge,
}

impl PolicyEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<PolicyStore>,
        client: Arc<dyn AuthServiceClient>,
        backend: Arc<dyn CounterBackend>,
    ) -> Self {
        let judge = RateLimitJudge::new(backend, &config.rate_limit);
        Self {
            config,
            store,
            client,
            judge,
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn handle(&self, request: RequestContext) -> Decision {
        self.handle_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Evaluate a request; `cancel` aborts outstanding auth calls.
    #[instrument(
        skip_all,
        fields(
            request_id = field::Empty,
            method = %request.method,
            path = %request.path,
        )
    )]
    pub async fn handle_with_cancel(
        &self,
        mut request: RequestContext,
        cancel: &CancellationToken,
    ) -> Decision {
        let request_id = request
            .request_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        Span::current().record("request_id", request_id.as_str());

        // One snapshot for the whole request
        let policy = self.store.load();
        let mut decision = Decision::new(request_id);

        StageScheduler::prepare(&mut request, &self.config);

        let early = self.judge_stage(&policy, Stage::Early, &request).await;
        if early.rejected {
            info!(stage = %Stage::Early, "Request rate limited");
            return decision.rate_limited(Stage::Early, early);
        }

        let options = EvaluationOptions {
            check_timeout: self.config.auth.check_timeout(),
            concurrent: self.config.auth.concurrent_checks,
        };
        let auth = policy
            .auth
            .evaluate(&request, self.client.as_ref(), cancel, options)
            .await;
        if !auth.allowed {
            info!(status = auth.status, outcomes = ?auth.outcomes, "Request denied");
            decision.allowed = false;
            decision.status = auth.status;
            decision.response_headers = auth.client_headers;
            decision.response_headers.extend(early.headers);
            return decision;
        }

        StageScheduler::publish(&mut request, &auth, &self.config);
        decision.user_id = auth.user_id;
        decision.upstream_headers = auth.upstream_headers;

        let regular = self.judge_stage(&policy, Stage::Regular, &request).await;
        if regular.rejected {
            info!(stage = %Stage::Regular, "Request rate limited");
            return decision.rate_limited(Stage::Regular, regular);
        }

        // Report the stage that counted last
        decision.response_headers = if regular.headers.is_empty() {
            early.headers
        } else {
            regular.headers
        };
        debug!(user_id = ?decision.user_id, "Request allowed");
        decision
    }

    async fn judge_stage(&self, policy: &Policy, stage: Stage, request: &RequestContext) -> Judgement {
        let descriptors = policy.stages.descriptors(stage, request);
        if descriptors.is_empty() {
            return Judgement::default();
        }
        let matched = policy.rate_limits.find_rules(&descriptors);
        self.judge.judge(&matched).await
    }
}
