//! The combined tree and set rule tables.

use tracing::debug;

use super::descriptor::Descriptor;
use super::rules::{DescriptorConfig, MatchedRule, TreeMatcher};
use super::set::{SetDescriptorConfig, SetMatcher};
use crate::error::Result;

/// Every rate limit rule of one policy generation.
#[derive(Debug, Clone, Default)]
pub struct RateLimitTable {
    tree: TreeMatcher,
    set: SetMatcher,
}

impl RateLimitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tree_rules(&mut self, domain: &str, descriptors: &[DescriptorConfig]) -> Result<()> {
        self.tree.add_domain(domain, descriptors)
    }

    pub fn add_set_rules(&mut self, domain: &str, descriptors: &[SetDescriptorConfig]) -> Result<()> {
        self.set.add_domain(domain, descriptors)
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty() && self.set.is_empty()
    }

    pub fn rule_count(&self) -> usize {
        self.tree.rules().len() + self.set.len()
    }

    /// Tree and set matches for a request's descriptors.
    pub fn find_rules(&self, descriptors: &[Descriptor]) -> Vec<MatchedRule> {
        let mut matched = self.tree.find_rules(descriptors);
        matched.extend(self.set.find_rules(descriptors));
        debug!(
            descriptors = descriptors.len(),
            matched = matched.len(),
            "Matched rate limit rules"
        );
        matched
    }
}
