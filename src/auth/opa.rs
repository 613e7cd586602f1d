//! Open Policy Agent queries.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::check::CheckContext;
use super::client::{CallRequest, Decision, Target};
use super::verdict::Verdict;

/// OPA check configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpaAuth {
    /// Base URL of the OPA server
    pub server_url: String,
    /// Package path queried, e.g. `gateway/authz`
    pub package: String,
    /// Forward the request body as part of the input document
    #[serde(default)]
    pub include_body: bool,
}

impl OpaAuth {
    fn query_url(&self) -> String {
        format!(
            "{}/v1/data/{}",
            self.server_url.trim_end_matches('/'),
            self.package.trim_matches('/')
        )
    }

    fn input(&self, ctx: &CheckContext<'_>) -> Value {
        let headers: Map<String, Value> = ctx
            .request
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        let mut input = json!({
            "method": ctx.request.method,
            "path": ctx.request.path,
            "headers": headers,
            "state": ctx.state,
        });
        if self.include_body {
            if let Some(body) = &ctx.request.body {
                input["body"] = Value::String(body.clone());
            }
        }
        json!({ "input": input })
    }

    pub async fn evaluate(&self, ctx: &CheckContext<'_>) -> Verdict {
        let mut call = CallRequest::new(Target::Http { url: self.query_url() }, ctx.timeout);
        call.body = Some(self.input(ctx));

        let response = match ctx.client.call(call).await {
            Ok(response) => response,
            Err(e) => return Verdict::error(format!("opa unavailable: {}", e)),
        };
        if response.decision == Decision::ServerError {
            return Verdict::error("opa server error");
        }

        let reply = response.state.unwrap_or_default();
        match reply.get("allow") {
            Some(Value::Bool(true)) => Verdict::allow(),
            _ => Verdict::deny("opa policy denied the request"),
        }
    }
}
