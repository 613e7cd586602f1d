//! The boundary to remote authorization services.
//!
//! Passthrough links, custom auth services, OPA servers and OAuth2 endpoints
//! are all reached through [`AuthServiceClient`]. The wire protocol behind it
//! (HTTP or gRPC client mechanics) lives outside this crate.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::metadata::State;

/// Where a delegated call is sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Grpc { address: String },
    Http { url: String },
    /// A named external auth service; `default` when none is given
    Service { name: String },
}

impl Target {
    /// The address, url or service name of this target.
    pub fn key(&self) -> &str {
        match self {
            Target::Grpc { address } => address,
            Target::Http { url } => url,
            Target::Service { name } => name,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Grpc { address } => write!(f, "grpc://{}", address),
            Target::Http { url } => write!(f, "{}", url),
            Target::Service { name } => write!(f, "service:{}", name),
        }
    }
}

/// A single delegated authorization call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub target: Target,
    /// Request headers forwarded to the remote service
    pub headers: Vec<(String, String)>,
    /// Filter metadata attached to the call, keyed by well-known names
    pub metadata: Map<String, Value>,
    /// JSON body for HTTP style calls
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl CallRequest {
    pub fn new(target: Target, timeout: Duration) -> Self {
        Self {
            target,
            headers: Vec::new(),
            metadata: Map::new(),
            body: None,
            timeout,
        }
    }
}

/// What the remote service decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    /// The service answered but failed to decide (5xx, UNAVAILABLE)
    ServerError,
}

/// The reply to a [`CallRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct CallResponse {
    pub decision: Decision,
    /// HTTP status returned by the service, when it has one
    pub status: Option<u16>,
    /// State written back by the service
    pub state: Option<State>,
    pub headers: Vec<(String, String)>,
}

impl CallResponse {
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            status: None,
            state: None,
            headers: Vec::new(),
        }
    }

    pub fn deny() -> Self {
        Self {
            decision: Decision::Deny,
            ..Self::allow()
        }
    }

    pub fn server_error() -> Self {
        Self {
            decision: Decision::ServerError,
            ..Self::allow()
        }
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Failures to obtain any reply from a remote service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("service unreachable: {0}")]
    Unreachable(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("call cancelled")]
    Cancelled,
}

/// Client used by checks that delegate to remote services.
#[async_trait]
pub trait AuthServiceClient: Send + Sync {
    /// Perform one call. Retries and timeouts are applied by the caller.
    async fn call(&self, request: CallRequest) -> Result<CallResponse, TransportError>;
}

/// A client with no transport configured; every call is unreachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableClient;

#[async_trait]
impl AuthServiceClient for UnavailableClient {
    async fn call(&self, request: CallRequest) -> Result<CallResponse, TransportError> {
        Err(TransportError::Unreachable(format!(
            "no transport configured for {}",
            request.target
        )))
    }
}
