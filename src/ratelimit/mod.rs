//! Rate limiting: descriptor derivation, rule matching and counting.

pub mod actions;
pub mod backend;
pub mod basic;
pub mod counter;
pub mod descriptor;
pub mod limiter;
pub mod memory;
pub mod rules;
pub mod set;
pub mod table;

pub use actions::{Action, ActionSet, RateLimitActions};
pub use backend::{CounterBackend, CounterError, CounterStatus};
pub use basic::{IngressRateLimit, INGRESS_DOMAIN};
pub use counter::{RateLimitCounter, TimeWindow};
pub use descriptor::{Descriptor, DescriptorEntry, DescriptorKey, DescriptorKind};
pub use limiter::{Judgement, RateLimitJudge};
pub use memory::InMemoryCounterBackend;
pub use rules::{DescriptorConfig, MatchedRule, RateLimitRule, TreeMatcher};
pub use set::{SetDescriptorConfig, SetMatcher, SimpleDescriptor};
pub use table::RateLimitTable;
