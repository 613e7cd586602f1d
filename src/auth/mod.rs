//! Authorization: named checks combined by a boolean expression.

pub mod apikey;
pub mod basic;
pub mod check;
pub mod client;
pub mod custom;
pub mod evaluator;
pub mod expr;
pub mod hmac;
pub mod jwt;
pub mod oauth2;
pub mod opa;
pub mod passthrough;
pub mod verdict;

pub use check::{AuthCheck, AuthCheckConfig, AuthConfigEntry, CheckContext};
pub use client::{AuthServiceClient, CallRequest, CallResponse, Decision, Target, TransportError, UnavailableClient};
pub use evaluator::{AuthConfig, AuthDecision, AuthEvaluator, EvaluationOptions};
pub use expr::{Expr, ExprError};
pub use passthrough::{PassthroughChain, PassthroughLink};
pub use verdict::{HeaderValueOption, Outcome, Verdict};
