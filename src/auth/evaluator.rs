//! Evaluation of an auth config against a request.
//!
//! Every check referenced by the expression runs at most once per request.
//! Checks that do not depend on other checks fan out concurrently, each under
//! its own timeout. Passthrough checks then run in list order, each seeing the
//! state emitted by the checks before it.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::check::{AuthCheck, AuthConfigEntry, CheckContext};
use super::client::AuthServiceClient;
use super::expr::Expr;
use super::verdict::{
    merge_headers, HeaderValueOption, Outcome, Verdict, STATUS_FORBIDDEN, STATUS_FOUND,
    STATUS_OK, STATUS_UNAUTHORIZED,
};
use crate::error::{Result, TollgateError};
use crate::metadata::{merge_state, State};
use crate::request::RequestContext;

/// An auth config as written in a policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub configs: Vec<AuthConfigEntry>,
    /// Boolean expression over entry names; every entry must pass when absent
    #[serde(default)]
    pub boolean_expr: Option<String>,
    /// Turn redirect style failures into a hard 403
    #[serde(default)]
    pub fail_on_redirect: bool,
}

/// A compiled check with its resolved name.
#[derive(Debug, Clone)]
pub struct NamedCheck {
    pub name: String,
    pub check: AuthCheck,
}

/// Runtime knobs for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationOptions {
    pub check_timeout: Duration,
    pub concurrent: bool,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(5),
            concurrent: true,
        }
    }
}

/// The combined authorization result for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthDecision {
    pub allowed: bool,
    pub status: u16,
    /// Union of the state emitted by allowing checks
    pub state: State,
    pub user_id: Option<String>,
    pub upstream_headers: Vec<HeaderValueOption>,
    pub client_headers: Vec<(String, String)>,
    /// Outcome of every check that ran, in list order
    pub outcomes: Vec<(String, Outcome)>,
}

/// A compiled auth config.
#[derive(Debug, Clone, Default)]
pub struct AuthEvaluator {
    checks: Vec<NamedCheck>,
    expr: Option<Expr>,
    /// False when the expression is the implicit conjunction of every entry
    explicit: bool,
    fail_on_redirect: bool,
}

impl AuthEvaluator {
    /// Resolve names, compile every check and parse the expression.
    pub fn compile(config: AuthConfig) -> Result<Self> {
        let mut checks = Vec::with_capacity(config.configs.len());
        let mut seen = HashSet::new();

        for entry in config.configs {
            let name = entry
                .name
                .clone()
                .unwrap_or_else(|| entry.check.default_name().to_string());
            if !seen.insert(name.clone()) {
                return Err(TollgateError::ConfigurationAmbiguity(format!(
                    "auth config name '{}' is used more than once",
                    name
                )));
            }
            checks.push(NamedCheck {
                name,
                check: AuthCheck::compile(entry.check)?,
            });
        }

        let (expr, explicit) = match config.boolean_expr.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => {
                let expr = Expr::parse(text)?;
                expr.validate(&seen).map_err(|e| {
                    TollgateError::ConfigurationAmbiguity(format!("boolean_expr: {}", e))
                })?;
                (Some(expr), true)
            }
            _ => (Expr::all_of(checks.iter().map(|c| c.name.clone())), false),
        };

        Ok(Self {
            checks,
            expr,
            explicit,
            fail_on_redirect: config.fail_on_redirect,
        })
    }

    pub fn checks(&self) -> &[NamedCheck] {
        &self.checks
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub async fn evaluate(
        &self,
        request: &RequestContext,
        client: &dyn AuthServiceClient,
        cancel: &CancellationToken,
        options: EvaluationOptions,
    ) -> AuthDecision {
        let expr = match &self.expr {
            Some(expr) => expr,
            None => return AuthDecision::allow_empty(),
        };
        let referenced = expr.names();
        let empty = State::new();
        let base = CheckContext {
            request,
            state: &empty,
            client,
            cancel,
            timeout: options.check_timeout,
        };

        let mut verdicts: HashMap<&str, Verdict> = HashMap::new();

        // Independent checks
        let independent: Vec<&NamedCheck> = self
            .checks
            .iter()
            .filter(|c| !c.check.is_passthrough() && referenced.contains(c.name.as_str()))
            .collect();
        if options.concurrent {
            let runs = independent
                .into_iter()
                .map(|named| run_with_timeout(named, base, options.check_timeout));
            verdicts.extend(join_all(runs).await);
        } else {
            for named in independent {
                let (name, verdict) = run_with_timeout(named, base, options.check_timeout).await;
                verdicts.insert(name, verdict);
            }
        }

        // Passthrough checks, in list order, threading state
        let mut state = State::new();
        let mut failed = false;
        for named in &self.checks {
            if !referenced.contains(named.name.as_str()) {
                continue;
            }
            if named.check.is_passthrough() {
                if failed && !self.explicit {
                    // The implicit conjunction is already false.
                    continue;
                }
                let ctx = CheckContext {
                    state: &state,
                    ..base
                };
                // The timeout bounds the whole chain, retries included
                let (_, verdict) = run_with_timeout(named, ctx, options.check_timeout).await;
                verdicts.insert(named.name.as_str(), verdict);
            }
            if let Some(verdict) = verdicts.get(named.name.as_str()) {
                if verdict.is_allowed() {
                    merge_state(&mut state, &verdict.emitted_state);
                } else {
                    failed = true;
                }
            }
        }

        let allowed = expr.eval(&mut |name| verdicts.get(name).map_or(false, Verdict::is_allowed));
        let decision = self.decide(allowed, &verdicts);
        debug!(allowed = decision.allowed, status = decision.status, expr = %expr, "auth evaluated");
        decision
    }

    fn decide(&self, allowed: bool, verdicts: &HashMap<&str, Verdict>) -> AuthDecision {
        let ran: Vec<(&NamedCheck, &Verdict)> = self
            .checks
            .iter()
            .filter_map(|c| verdicts.get(c.name.as_str()).map(|v| (c, v)))
            .collect();
        let outcomes = ran
            .iter()
            .map(|(c, v)| (c.name.clone(), v.outcome))
            .collect();

        if allowed {
            let mut decision = AuthDecision {
                allowed: true,
                status: STATUS_OK,
                state: State::new(),
                user_id: None,
                upstream_headers: Vec::new(),
                client_headers: Vec::new(),
                outcomes,
            };
            for (_, verdict) in ran.iter().filter(|(_, v)| v.is_allowed()) {
                merge_state(&mut decision.state, &verdict.emitted_state);
                decision.upstream_headers =
                    merge_headers(&decision.upstream_headers, &verdict.upstream_headers);
                if decision.user_id.is_none() {
                    decision.user_id = verdict.user_id.clone();
                }
            }
            return decision;
        }

        let failing: Vec<&(&NamedCheck, &Verdict)> =
            ran.iter().filter(|(_, v)| !v.is_allowed()).collect();

        let (status, client_headers) = if self.fail_on_redirect
            && failing.iter().any(|(_, v)| v.outcome == Outcome::Error)
        {
            (STATUS_FORBIDDEN, Vec::new())
        } else if let Some((_, redirect)) = failing.iter().find(|(_, v)| v.is_redirect()) {
            (STATUS_FOUND, redirect.client_headers.clone())
        } else if let Some((named, first)) = failing.first() {
            debug!(check = %named.name, reason = ?first.reason, "auth check failed");
            (
                first.http_status_override.unwrap_or(STATUS_UNAUTHORIZED),
                first.client_headers.clone(),
            )
        } else {
            (STATUS_UNAUTHORIZED, Vec::new())
        };

        AuthDecision {
            allowed: false,
            status,
            state: State::new(),
            user_id: None,
            upstream_headers: Vec::new(),
            client_headers,
            outcomes,
        }
    }
}

async fn run_with_timeout<'a>(
    named: &'a NamedCheck,
    ctx: CheckContext<'a>,
    timeout: Duration,
) -> (&'a str, Verdict) {
    let verdict = match tokio::time::timeout(timeout, named.check.evaluate(&ctx)).await {
        Ok(verdict) => verdict,
        Err(_) => {
            warn!(check = %named.name, "auth check timed out");
            Verdict::error("check timed out")
        }
    };
    (named.name.as_str(), verdict)
}

impl AuthDecision {
    fn allow_empty() -> Self {
        Self {
            allowed: true,
            status: STATUS_OK,
            state: State::new(),
            user_id: None,
            upstream_headers: Vec::new(),
            client_headers: Vec::new(),
            outcomes: Vec::new(),
        }
    }
}
