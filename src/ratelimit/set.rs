//! Set rate limit rules.
//!
//! A set rule lists the (key, value) pairs a request must carry, in any order
//! and alongside any number of other pairs. The first rule in declaration
//! order whose pairs are all present is the primary match; `always_apply`
//! rules are selected whenever their pairs are present.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use super::descriptor::{rule_path, Descriptor, DescriptorKey, DescriptorKind};
use super::rules::{MatchedRule, RateLimitRule};
use crate::error::{Result, TollgateError};

/// A required pair; a missing value matches any value for the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimpleDescriptor {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// A set rule as written in a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDescriptorConfig {
    #[serde(default)]
    pub simple_descriptors: Vec<SimpleDescriptor>,
    pub rate_limit: RateLimitRule,
    #[serde(default)]
    pub always_apply: bool,
}

#[derive(Debug, Clone)]
struct SetRule {
    id: String,
    domain: String,
    required: Vec<SimpleDescriptor>,
    limit: RateLimitRule,
    always_apply: bool,
}

impl SetRule {
    /// Request value satisfying each required pair, or `None` on a miss.
    fn satisfied_by(&self, descriptor: &Descriptor) -> Option<Vec<(String, String)>> {
        if self.domain != descriptor.domain {
            return None;
        }
        self.required
            .iter()
            .map(|pair| {
                descriptor
                    .entries
                    .iter()
                    .find(|e| {
                        e.key == pair.key && pair.value.as_ref().map_or(true, |v| *v == e.value)
                    })
                    .map(|e| (e.key.clone(), e.value.clone()))
            })
            .collect()
    }

    fn name(&self) -> String {
        rule_path(
            &self.domain,
            self.required
                .iter()
                .map(|p| (p.key.as_str(), p.value.as_deref())),
        )
    }

    fn select(&self, entries: Vec<(String, String)>) -> MatchedRule {
        MatchedRule {
            key: DescriptorKey::new(&self.domain, &self.id, entries),
            name: self.name(),
            limit: self.limit.clone(),
            always_apply: self.always_apply,
        }
    }
}

/// Compiled set rules of every domain, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct SetMatcher {
    rules: Vec<SetRule>,
}

impl SetMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_domain(&mut self, domain: &str, configs: &[SetDescriptorConfig]) -> Result<()> {
        for config in configs {
            let mut seen = HashSet::new();
            let mut required = Vec::with_capacity(config.simple_descriptors.len());
            for pair in &config.simple_descriptors {
                if pair.key.is_empty() {
                    return Err(TollgateError::MalformedDescriptor(
                        "set descriptor pair has an empty key".to_string(),
                    ));
                }
                // Required pairs form a set
                if seen.insert(pair.clone()) {
                    required.push(pair.clone());
                }
            }
            let rule = SetRule {
                id: format!("set:{}", self.rules.len()),
                domain: domain.to_string(),
                required,
                limit: config.rate_limit.clone(),
                always_apply: config.always_apply,
            };
            debug!(
                rule = %rule.name(),
                always_apply = rule.always_apply,
                "Loaded set rate limit rule"
            );
            self.rules.push(rule);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Select rules for the set descriptors of a request.
    pub fn find_rules(&self, descriptors: &[Descriptor]) -> Vec<MatchedRule> {
        let mut matched = Vec::new();
        let mut seen = HashSet::new();

        for descriptor in descriptors.iter().filter(|d| d.kind == DescriptorKind::Set) {
            let mut primary_found = false;
            for rule in &self.rules {
                if primary_found && !rule.always_apply {
                    continue;
                }
                if let Some(entries) = rule.satisfied_by(descriptor) {
                    if !rule.always_apply {
                        primary_found = true;
                    }
                    let selected = rule.select(entries);
                    if seen.insert(selected.key.clone()) {
                        matched.push(selected);
                    }
                }
            }
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::descriptor::DescriptorEntry;

    fn compile_set(yaml: &str) -> SetMatcher {
        let configs: Vec<SetDescriptorConfig> = serde_yaml::from_str(yaml).unwrap();
        let mut matcher = SetMatcher::new();
        matcher.add_domain("gateway", &configs).unwrap();
        matcher
    }

    fn pairs(entries: &[(&str, &str)]) -> Descriptor {
        Descriptor::new(
            "gateway",
            DescriptorKind::Set,
            entries
                .iter()
                .map(|(k, v)| DescriptorEntry::new(*k, *v))
                .collect(),
        )
    }

    fn limits(matched: &[MatchedRule]) -> Vec<u64> {
        matched.iter().map(|m| m.limit.requests_per_unit).collect()
    }

    #[test]
    fn test_subset_match() {
        let matcher = compile_set(
            r#"
- simple_descriptors:
    - key: generic_key
      value: foo
    - key: generic_key
      value: bar
  rate_limit:
    requests_per_unit: 1
    unit: minute
"#,
        );
        let superset = pairs(&[
            ("generic_key", "baz"),
            ("generic_key", "bar"),
            ("generic_key", "foo"),
        ]);
        assert_eq!(limits(&matcher.find_rules(&[superset])), vec![1]);

        let missing_foo = pairs(&[("generic_key", "bar"), ("generic_key", "baz")]);
        assert!(matcher.find_rules(&[missing_foo]).is_empty());
    }

    #[test]
    fn test_first_match_is_primary_and_catch_all_is_skipped() {
        let matcher = compile_set(
            r#"
- simple_descriptors:
    - key: generic_key
      value: first
  rate_limit:
    requests_per_unit: 1
    unit: minute
- rate_limit:
    requests_per_unit: 100
    unit: minute
"#,
        );
        assert_eq!(
            limits(&matcher.find_rules(&[pairs(&[("generic_key", "first")])])),
            vec![1]
        );
        // Anything else falls through to the catch-all
        assert_eq!(
            limits(&matcher.find_rules(&[pairs(&[("generic_key", "second")])])),
            vec![100]
        );
    }

    #[test]
    fn test_always_apply_regardless_of_position() {
        let matcher = compile_set(
            r#"
- simple_descriptors:
    - key: generic_key
      value: foo
  rate_limit:
    requests_per_unit: 10
    unit: minute
- simple_descriptors:
    - key: generic_key
      value: foo
  always_apply: true
  rate_limit:
    requests_per_unit: 2
    unit: minute
- rate_limit:
    requests_per_unit: 100
    unit: minute
- simple_descriptors:
    - key: remote_address
  always_apply: true
  rate_limit:
    requests_per_unit: 5
    unit: second
"#,
        );
        let matched = matcher.find_rules(&[pairs(&[
            ("generic_key", "foo"),
            ("remote_address", "10.0.0.1"),
        ])]);
        assert_eq!(limits(&matched), vec![10, 2, 5]);
        assert_eq!(
            matched[2].key.entries,
            vec![("remote_address".to_string(), "10.0.0.1".to_string())]
        );
        assert_eq!(matched[2].name, "gateway|remote_address");
    }

    #[test]
    fn test_tree_descriptors_are_ignored() {
        let matcher = compile_set(
            r#"
- rate_limit:
    requests_per_unit: 1
    unit: second
"#,
        );
        let tree = Descriptor::new(
            "gateway",
            DescriptorKind::Tree,
            vec![DescriptorEntry::new("generic_key", "foo")],
        );
        assert!(matcher.find_rules(&[tree]).is_empty());
    }

    #[test]
    fn test_duplicate_pairs_collapse() {
        let matcher = compile_set(
            r#"
- simple_descriptors:
    - key: generic_key
      value: foo
    - key: generic_key
      value: foo
  rate_limit:
    requests_per_unit: 1
    unit: second
"#,
        );
        let matched = matcher.find_rules(&[pairs(&[("generic_key", "foo")])]);
        assert_eq!(matched[0].name, "gateway|generic_key^foo");
        assert_eq!(matcher.len(), 1);
    }
}
