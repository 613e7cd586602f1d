//! Delegation to named external auth services.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::check::CheckContext;
use super::client::{CallRequest, Decision, Target};
use super::verdict::Verdict;

/// Service name used when a custom check does not name one.
pub const DEFAULT_SERVICE: &str = "default";

/// Custom auth configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomAuth {
    /// External auth service to call; the default service when absent
    #[serde(default)]
    pub name: Option<String>,
    /// Static key-value pairs forwarded with every call
    #[serde(default)]
    pub context_extensions: BTreeMap<String, String>,
}

impl CustomAuth {
    pub fn service(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_SERVICE)
    }

    pub async fn evaluate(&self, ctx: &CheckContext<'_>) -> Verdict {
        let mut call = CallRequest::new(
            Target::Service {
                name: self.service().to_string(),
            },
            ctx.timeout,
        );
        call.headers = ctx
            .request
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if !self.context_extensions.is_empty() {
            let extensions = self
                .context_extensions
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            call.metadata
                .insert("context_extensions".to_string(), Value::Object(extensions));
        }

        let response = match ctx.client.call(call).await {
            Ok(response) => response,
            Err(e) => return Verdict::error(format!("{} unavailable: {}", self.service(), e)),
        };

        match response.decision {
            Decision::Allow => {
                let mut verdict = Verdict::allow();
                for (key, value) in response.headers {
                    verdict = verdict.with_upstream_header(key, value);
                }
                match response.state {
                    Some(state) => verdict.with_state(state),
                    None => verdict,
                }
            }
            Decision::Deny => {
                let mut verdict = Verdict::deny(format!("{} denied the request", self.service()));
                if let Some(status) = response.status {
                    verdict = verdict.with_status(status);
                }
                for (key, value) in response.headers {
                    verdict = verdict.with_client_header(key, value);
                }
                verdict
            }
            Decision::ServerError => Verdict::error(format!("{} failed", self.service())),
        }
    }
}
