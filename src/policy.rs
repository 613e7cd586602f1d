//! Policy documents, their compiled form, and atomic publication.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::auth::{AuthConfig, AuthEvaluator};
use crate::config::EngineConfig;
use crate::error::{Result, TollgateError};
use crate::ratelimit::basic::{compile_ingress, INGRESS_DOMAIN};
use crate::ratelimit::{
    ActionSet, DescriptorConfig, IngressRateLimit, RateLimitActions, RateLimitTable,
    SetDescriptorConfig,
};
use crate::stage::StageScheduler;

/// A policy as written by an operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
}

/// Rate limit section of a policy document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Tree rules
    #[serde(default)]
    pub descriptors: Vec<DescriptorConfig>,
    /// Set rules, in precedence order
    #[serde(default)]
    pub set_descriptors: Vec<SetDescriptorConfig>,
    #[serde(default)]
    pub actions: Vec<RateLimitActions>,
    /// Basic per-virtual-host limits
    #[serde(default)]
    pub ingress: Vec<IngressRateLimit>,
}

impl PolicyDocument {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// A compiled, immutable policy generation.
#[derive(Debug)]
pub struct Policy {
    pub auth: AuthEvaluator,
    pub rate_limits: RateLimitTable,
    pub stages: StageScheduler,
}

impl Policy {
    /// Validate and compile a document; nothing is published on error.
    pub fn compile(document: PolicyDocument, config: &EngineConfig) -> Result<Self> {
        let settings = &config.rate_limit;
        if settings.domain == INGRESS_DOMAIN {
            return Err(TollgateError::Config(format!(
                "rate limit domain {:?} is reserved for basic limits",
                INGRESS_DOMAIN
            )));
        }

        let auth = AuthEvaluator::compile(document.auth)?;

        let mut rate_limits = RateLimitTable::new();
        rate_limits.add_tree_rules(&settings.domain, &document.rate_limit.descriptors)?;
        rate_limits.add_set_rules(&settings.domain, &document.rate_limit.set_descriptors)?;

        let mut actions = document
            .rate_limit
            .actions
            .iter()
            .map(|entry| ActionSet::compile(&settings.domain, entry))
            .collect::<Result<Vec<_>>>()?;

        let ingress = compile_ingress(&document.rate_limit.ingress, settings)?;
        rate_limits.add_tree_rules(INGRESS_DOMAIN, &ingress.descriptors)?;
        actions.extend(ingress.actions);

        let policy = Self {
            auth,
            rate_limits,
            stages: StageScheduler::new(actions, settings.rate_limit_before_auth),
        };
        info!(
            auth_checks = policy.auth.checks().len(),
            rate_limit_rules = policy.rate_limits.rule_count(),
            "Compiled policy"
        );
        Ok(policy)
    }

    /// A policy that allows everything and limits nothing.
    pub fn empty() -> Self {
        Self {
            auth: AuthEvaluator::default(),
            rate_limits: RateLimitTable::new(),
            stages: StageScheduler::default(),
        }
    }
}

/// Holds the live policy; readers take a snapshot per request.
///
/// A new generation is fully compiled before it is swapped in, so a reader
/// never observes a partially updated table. The previous generation is kept
/// for rollback.
pub struct PolicyStore {
    current: ArcSwap<Policy>,
    last_known_good: ArcSwap<Policy>,
    generation: AtomicU64,
}

impl PolicyStore {
    pub fn new(initial: Policy) -> Self {
        let initial = Arc::new(initial);
        Self {
            current: ArcSwap::from(initial.clone()),
            last_known_good: ArcSwap::from(initial),
            generation: AtomicU64::new(1),
        }
    }

    pub fn load(&self) -> Arc<Policy> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Publish a compiled policy and return its generation.
    pub fn publish(&self, policy: Policy) -> u64 {
        let previous = self.current.swap(Arc::new(policy));
        self.last_known_good.store(previous);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "Published policy");
        generation
    }

    /// Compile and publish a document; the live policy is untouched on error.
    pub fn reload(&self, document: PolicyDocument, config: &EngineConfig) -> Result<u64> {
        let policy = Policy::compile(document, config)?;
        Ok(self.publish(policy))
    }

    /// Restore the generation that was live before the last publish.
    pub fn rollback(&self) -> Arc<Policy> {
        let policy = self.last_known_good.load_full();
        self.current.store(policy.clone());
        info!(generation = self.generation(), "Rolled back policy");
        policy
    }
}
