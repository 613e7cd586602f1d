//! API key authentication.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use subtle::ConstantTimeEq;

use super::verdict::Verdict;
use crate::metadata::State;
use crate::request::RequestContext;

/// A registered API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    /// Principal the key belongs to
    pub owner: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// API key configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyAuth {
    #[serde(default = "default_header_name")]
    pub header_name: String,
    /// Key value to entry
    #[serde(default)]
    pub keys: HashMap<String, ApiKeyEntry>,
    /// Upstream header name to metadata field of the matched key
    #[serde(default)]
    pub headers_from_metadata: BTreeMap<String, String>,
}

fn default_header_name() -> String {
    "api-key".to_string()
}

impl ApiKeyAuth {
    pub fn evaluate(&self, request: &RequestContext) -> Verdict {
        let presented = match request.headers.get(&self.header_name) {
            Some(value) if !value.is_empty() => value,
            _ => return Verdict::deny("missing api key"),
        };

        let entry = self
            .keys
            .iter()
            .find(|(key, _)| key.as_bytes().ct_eq(presented.as_bytes()).into())
            .map(|(_, entry)| entry);

        let entry = match entry {
            Some(entry) => entry,
            None => return Verdict::deny("unknown api key"),
        };

        let mut state = State::new();
        state.insert("apiKeyOwner".to_string(), Value::String(entry.owner.clone()));

        let mut verdict = Verdict::allow()
            .with_user_id(entry.owner.clone())
            .with_state(state);
        for (header, field) in &self.headers_from_metadata {
            if let Some(value) = entry.metadata.get(field) {
                verdict = verdict.with_upstream_header(header.clone(), value.clone());
            }
        }
        verdict
    }
}
