//! Per-check verdicts and the HTTP statuses they map to.

use serde::{Deserialize, Serialize};

use crate::metadata::{merge_state, State};

pub const STATUS_OK: u16 = 200;
pub const STATUS_FOUND: u16 = 302;
pub const STATUS_UNAUTHORIZED: u16 = 401;
pub const STATUS_FORBIDDEN: u16 = 403;
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

/// The outcome of a single auth check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Allow,
    Deny,
    /// The check could not reach a decision: it timed out, its backend was
    /// unavailable, or it wants to redirect the client elsewhere.
    Error,
}

/// A header to add to the upstream request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderValueOption {
    pub key: String,
    pub value: String,
    /// Append to an existing value instead of replacing it
    #[serde(default)]
    pub append: bool,
}

impl HeaderValueOption {
    pub fn new(key: impl Into<String>, value: impl Into<String>, append: bool) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            append,
        }
    }
}

/// The result of evaluating one auth check against a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub outcome: Outcome,
    /// State forwarded to later checks and stages when the check allows
    pub emitted_state: State,
    pub http_status_override: Option<u16>,
    /// Identity established by the check
    pub user_id: Option<String>,
    pub upstream_headers: Vec<HeaderValueOption>,
    /// Headers returned to the client (redirect location, challenges)
    pub client_headers: Vec<(String, String)>,
    /// Diagnostic only; logged and never sent to the client
    pub reason: Option<String>,
}

impl Verdict {
    fn with_outcome(outcome: Outcome) -> Self {
        Self {
            outcome,
            emitted_state: State::new(),
            http_status_override: None,
            user_id: None,
            upstream_headers: Vec::new(),
            client_headers: Vec::new(),
            reason: None,
        }
    }

    pub fn allow() -> Self {
        Self::with_outcome(Outcome::Allow)
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self::with_outcome(Outcome::Deny).with_reason(reason)
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::with_outcome(Outcome::Error).with_reason(reason)
    }

    /// An error leaf asking the client to follow a login redirect.
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::error("redirect required")
            .with_status(STATUS_FOUND)
            .with_client_header("location", location)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status_override = Some(status);
        self
    }

    pub fn with_state(mut self, state: State) -> Self {
        merge_state(&mut self.emitted_state, &state);
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_upstream_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.upstream_headers
            .push(HeaderValueOption::new(key, value, false));
        self
    }

    pub fn with_client_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.client_headers.push((key.into(), value.into()));
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.outcome == Outcome::Allow
    }

    /// True for error leaves that carry a redirect.
    pub fn is_redirect(&self) -> bool {
        self.outcome == Outcome::Error && self.http_status_override == Some(STATUS_FOUND)
    }
}

/// Merge upstream headers from two successful checks.
///
/// Headers in `second` that append are comma-joined onto a value already set
/// by `first`; headers that do not append replace it.
pub fn merge_headers(
    first: &[HeaderValueOption],
    second: &[HeaderValueOption],
) -> Vec<HeaderValueOption> {
    let mut merged: Vec<HeaderValueOption> = first.to_vec();
    for header in second {
        match merged
            .iter_mut()
            .find(|existing| existing.key.eq_ignore_ascii_case(&header.key))
        {
            Some(existing) if header.append => {
                existing.value = format!("{}, {}", existing.value, header.value);
                existing.append = true;
            }
            Some(existing) => {
                existing.value = header.value.clone();
                existing.append = false;
            }
            None => merged.push(header.clone()),
        }
    }
    merged
}
