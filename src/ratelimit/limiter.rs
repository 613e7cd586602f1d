//! The rate limit judge: counts matched rules and decides whether to reject.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::backend::{CounterBackend, CounterStatus};
use super::rules::MatchedRule;
use crate::config::RateLimitSettings;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Outcome of judging one request against its matched rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Judgement {
    pub rejected: bool,
    /// `X-RateLimit-*` headers, empty unless enabled
    pub headers: Vec<(String, String)>,
    /// Number of rules that were counted
    pub counted: usize,
}

/// Counts every matched rule and rejects when any bucket is exceeded.
pub struct RateLimitJudge {
    backend: Arc<dyn CounterBackend>,
    enable_headers: bool,
    deny_on_backend_error: bool,
}

impl RateLimitJudge {
    pub fn new(backend: Arc<dyn CounterBackend>, settings: &RateLimitSettings) -> Self {
        Self {
            backend,
            enable_headers: settings.enable_x_ratelimit_headers,
            deny_on_backend_error: settings.deny_on_backend_error,
        }
    }

    #[instrument(skip_all, fields(rules = matched.len()))]
    pub async fn judge(&self, matched: &[MatchedRule]) -> Judgement {
        if matched.is_empty() {
            return Judgement::default();
        }

        let results = join_all(matched.iter().map(|rule| {
            let key = rule.key.to_string_key();
            async move {
                let result = self
                    .backend
                    .increment_and_check(&key, rule.limit.requests_per_unit, rule.limit.unit, 1)
                    .await;
                (rule, key, result)
            }
        }))
        .await;

        let mut judgement = Judgement::default();
        let mut statuses: Vec<(&MatchedRule, CounterStatus)> = Vec::with_capacity(results.len());
        for (rule, key, result) in results {
            match result {
                Ok(status) => {
                    if status.over_limit() {
                        debug!(key = %key, rule = %rule.name, current = status.current, "Rate limit exceeded");
                        judgement.rejected = true;
                    }
                    statuses.push((rule, status));
                }
                Err(e) if self.deny_on_backend_error => {
                    warn!(key = %key, error = %e, "Counter backend failed, rejecting request");
                    judgement.rejected = true;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Counter backend failed, allowing request");
                }
            }
        }
        judgement.counted = statuses.len();

        if self.enable_headers {
            judgement.headers = rate_limit_headers(&statuses);
        }
        judgement
    }
}

/// Headers describing the rule that rejected the request, or the most
/// restrictive one when none did.
fn rate_limit_headers(statuses: &[(&MatchedRule, CounterStatus)]) -> Vec<(String, String)> {
    let chosen = statuses
        .iter()
        .position(|(_, s)| s.over_limit())
        .or_else(|| {
            statuses
                .iter()
                .enumerate()
                .min_by_key(|(i, (_, s))| (s.remaining(), *i))
                .map(|(i, _)| i)
        });
    let Some(chosen) = chosen else {
        return Vec::new();
    };

    let (_, status) = &statuses[chosen];
    let mut limit = status.limit.to_string();
    // The chosen rule's quota policy comes first, then the others in match order
    let order = std::iter::once(chosen).chain((0..statuses.len()).filter(|i| *i != chosen));
    for i in order {
        let (rule, s) = &statuses[i];
        limit.push_str(&format!(
            ", {};w={};name=\"{}\"",
            s.limit,
            s.window.seconds(),
            rule.name
        ));
    }

    vec![
        (HEADER_LIMIT.to_string(), limit),
        (HEADER_REMAINING.to_string(), status.remaining().to_string()),
        (HEADER_RESET.to_string(), status.reset_after.as_secs().to_string()),
    ]
}
