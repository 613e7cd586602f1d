//! Tollgate - Request-Time Policy Engine for API Gateways
//!
//! This crate decides, for every proxied request, whether it is authorized
//! and how it is rate limited. Authorization combines named checks with a
//! boolean expression; rate limiting matches request descriptors against
//! tree and set rules and counts them through a pluggable counter backend.
//! Rate limits run in an early stage before authorization and a regular
//! stage after it.

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod policy;
pub mod ratelimit;
pub mod request;
pub mod stage;

pub use engine::{Decision, PolicyEngine};
pub use error::{Result, TollgateError};
pub use policy::{Policy, PolicyDocument, PolicyStore};
pub use request::RequestContext;
