//! Tree rate limit rules: configuration and matching.
//!
//! Rules use Envoy's hierarchical descriptor format. Each node of the tree that
//! carries a `rate_limit` becomes one rule keyed by the path of (key, value)
//! segments from the root down to it. A request descriptor matches a rule when
//! the rule's path is a prefix of the descriptor.
//!
//! Per descriptor, one primary rule is selected among the non-`always_apply`
//! candidates: highest weight first, then the longest path, then the path with
//! the most exact values. Every matching `always_apply` rule is selected as
//! well. Rule pairs that could tie on all three are rejected when the table is
//! compiled.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::counter::TimeWindow;
use super::descriptor::{rule_path, Descriptor, DescriptorKey, DescriptorKind};
use crate::error::{Result, TollgateError};

/// Configuration for a rate limit descriptor node.
///
/// Descriptors form a tree structure where each node can have:
/// - A key to match against
/// - An optional value to match (if not present, matches any value)
/// - An optional rate limit to apply at this level
/// - Child descriptors for more specific matching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorConfig {
    /// The key to match
    pub key: String,
    /// Optional value to match (if not set, matches any value for this key)
    #[serde(default)]
    pub value: Option<String>,
    /// Rate limit to apply at this level
    #[serde(default)]
    pub rate_limit: Option<RateLimitRule>,
    /// Precedence of this node's rule over other candidates
    #[serde(default)]
    pub weight: u32,
    /// Apply this node's rule in addition to the primary match
    #[serde(default)]
    pub always_apply: bool,
    /// Child descriptors for more specific matching
    #[serde(default)]
    pub descriptors: Vec<DescriptorConfig>,
}

/// A rate limit rule specifying the limit and time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Number of requests allowed per unit of time
    pub requests_per_unit: u64,
    /// The time unit
    pub unit: TimeWindow,
    /// Optional name/description for this limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl RateLimitRule {
    pub fn new(requests_per_unit: u64, unit: TimeWindow) -> Self {
        Self {
            requests_per_unit,
            unit,
            name: None,
        }
    }
}

/// A rule selected for a request, ready to be counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRule {
    /// Counter bucket for this request
    pub key: DescriptorKey,
    /// Rule path reported in `X-RateLimit-Limit`
    pub name: String,
    pub limit: RateLimitRule,
    pub always_apply: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    key: String,
    value: Option<String>,
}

/// One flattened tree rule.
#[derive(Debug, Clone)]
pub struct TreeRule {
    id: String,
    domain: String,
    path: Vec<Segment>,
    limit: RateLimitRule,
    weight: u32,
    always_apply: bool,
}

impl TreeRule {
    /// Whether this rule's path is a prefix of the descriptor.
    fn matches(&self, descriptor: &Descriptor) -> bool {
        self.domain == descriptor.domain
            && self.path.len() <= descriptor.entries.len()
            && self
                .path
                .iter()
                .zip(&descriptor.entries)
                .all(|(segment, entry)| {
                    segment.key == entry.key
                        && segment.value.as_ref().map_or(true, |v| *v == entry.value)
                })
    }

    fn exact_segments(&self) -> usize {
        self.path.iter().filter(|s| s.value.is_some()).count()
    }

    /// Ordering used to pick the primary rule; greater wins.
    fn rank(&self) -> (u32, usize, usize) {
        (self.weight, self.path.len(), self.exact_segments())
    }

    /// Whether some descriptor could match both rules at the same rank.
    fn ties_with(&self, other: &TreeRule) -> bool {
        self.domain == other.domain
            && self.rank() == other.rank()
            && self.path.iter().zip(&other.path).all(|(a, b)| {
                a.key == b.key
                    && match (&a.value, &b.value) {
                        (Some(x), Some(y)) => x == y,
                        _ => true,
                    }
            })
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_always_apply(&self) -> bool {
        self.always_apply
    }

    pub fn name(&self) -> String {
        rule_path(
            &self.domain,
            self.path.iter().map(|s| (s.key.as_str(), s.value.as_deref())),
        )
    }

    fn select(&self, descriptor: &Descriptor) -> MatchedRule {
        let entries = descriptor.entries[..self.path.len()]
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect();
        MatchedRule {
            key: DescriptorKey::new(&self.domain, &self.id, entries),
            name: self.name(),
            limit: self.limit.clone(),
            always_apply: self.always_apply,
        }
    }
}

/// Compiled tree rules of every domain.
#[derive(Debug, Clone, Default)]
pub struct TreeMatcher {
    rules: Vec<TreeRule>,
}

impl TreeMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten a domain's descriptor tree and add its rules.
    pub fn add_domain(&mut self, domain: &str, descriptors: &[DescriptorConfig]) -> Result<()> {
        let mut path = Vec::new();
        for config in descriptors {
            self.flatten(domain, config, &mut path)?;
        }
        self.check_ambiguity()
    }

    fn flatten(
        &mut self,
        domain: &str,
        config: &DescriptorConfig,
        path: &mut Vec<Segment>,
    ) -> Result<()> {
        if config.key.is_empty() {
            return Err(TollgateError::MalformedDescriptor(format!(
                "descriptor under {:?} has an empty key",
                rule_path(domain, path.iter().map(|s| (s.key.as_str(), s.value.as_deref())))
            )));
        }
        path.push(Segment {
            key: config.key.clone(),
            value: config.value.clone(),
        });

        if let Some(limit) = &config.rate_limit {
            let rule = TreeRule {
                id: format!("tree:{}", self.rules.len()),
                domain: domain.to_string(),
                path: path.clone(),
                limit: limit.clone(),
                weight: config.weight,
                always_apply: config.always_apply,
            };
            debug!(
                rule = %rule.name(),
                weight = rule.weight,
                always_apply = rule.always_apply,
                "Loaded tree rate limit rule"
            );
            self.rules.push(rule);
        } else if config.descriptors.is_empty() {
            return Err(TollgateError::MalformedDescriptor(format!(
                "descriptor {:?} has neither a rate limit nor children",
                rule_path(domain, path.iter().map(|s| (s.key.as_str(), s.value.as_deref())))
            )));
        }

        for child in &config.descriptors {
            self.flatten(domain, child, path)?;
        }
        path.pop();
        Ok(())
    }

    fn check_ambiguity(&self) -> Result<()> {
        let primaries: Vec<&TreeRule> = self.rules.iter().filter(|r| !r.always_apply).collect();
        for (i, a) in primaries.iter().enumerate() {
            for b in &primaries[i + 1..] {
                if a.ties_with(b) {
                    return Err(TollgateError::ConfigurationAmbiguity(format!(
                        "rules {} and {} can match the same request with equal weight {} and specificity",
                        a.name(),
                        b.name(),
                        a.weight
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn rules(&self) -> &[TreeRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Select rules for the tree descriptors of a request.
    ///
    /// Each descriptor contributes its primary rule; across the descriptors of
    /// one domain only the primaries carrying the highest weight are kept.
    /// `always_apply` rules are selected regardless.
    pub fn find_rules(&self, descriptors: &[Descriptor]) -> Vec<MatchedRule> {
        let mut primaries: Vec<(u32, MatchedRule)> = Vec::new();
        let mut always = Vec::new();

        for descriptor in descriptors.iter().filter(|d| d.kind == DescriptorKind::Tree) {
            let candidates = self.rules.iter().filter(|r| r.matches(descriptor));
            let mut primary: Option<&TreeRule> = None;
            for rule in candidates {
                if rule.always_apply {
                    always.push(rule.select(descriptor));
                } else if primary.map_or(true, |p| rule.rank() > p.rank()) {
                    primary = Some(rule);
                }
            }
            if let Some(rule) = primary {
                primaries.push((rule.weight, rule.select(descriptor)));
            }
        }

        let mut top_weight: HashMap<String, u32> = HashMap::new();
        for (weight, matched) in &primaries {
            let top = top_weight.entry(matched.key.domain.clone()).or_insert(*weight);
            *top = (*top).max(*weight);
        }
        let mut seen = HashSet::new();
        primaries
            .into_iter()
            .filter(|(w, m)| top_weight.get(&m.key.domain) == Some(w))
            .map(|(_, m)| m)
            .chain(always)
            .filter(|m| seen.insert(m.key.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::descriptor::DescriptorEntry;

    fn compile_tree(yaml: &str) -> Result<TreeMatcher> {
        let descriptors: Vec<DescriptorConfig> = serde_yaml::from_str(yaml).unwrap();
        let mut matcher = TreeMatcher::new();
        matcher.add_domain("test_domain", &descriptors)?;
        Ok(matcher)
    }

    fn descriptor(entries: &[(&str, &str)]) -> Descriptor {
        Descriptor::new(
            "test_domain",
            DescriptorKind::Tree,
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
    fn test_parse_hierarchical_config() {
        let yaml = r#"
- key: source_cluster
  value: cluster_a
  rate_limit:
    requests_per_unit: 100
    unit: second
  descriptors:
    - key: destination_cluster
      value: cluster_b
      weight: 2
      always_apply: true
      rate_limit:
        requests_per_unit: 50
        unit: second
"#;
        let matcher = compile_tree(yaml).unwrap();
        assert_eq!(matcher.rules().len(), 2);
        assert_eq!(matcher.rules()[1].weight(), 2);
        assert!(matcher.rules()[1].is_always_apply());
        assert_eq!(
            matcher.rules()[1].name(),
            "test_domain|source_cluster^cluster_a|destination_cluster^cluster_b"
        );
    }

    #[test]
    fn test_find_limit_with_value_match() {
        let yaml = r#"
- key: source_cluster
  value: premium
  rate_limit:
    requests_per_unit: 10000
    unit: second
- key: source_cluster
  value: basic
  rate_limit:
    requests_per_unit: 100
    unit: second
"#;
        let matcher = compile_tree(yaml).unwrap();

        let matched = matcher.find_rules(&[descriptor(&[("source_cluster", "premium")])]);
        assert_eq!(limits(&matched), vec![10000]);

        let matched = matcher.find_rules(&[descriptor(&[("source_cluster", "basic")])]);
        assert_eq!(limits(&matched), vec![100]);
    }

    #[test]
    fn test_longer_prefix_wins_then_weight() {
        let yaml = r#"
- key: a
  rate_limit:
    requests_per_unit: 1000
    unit: second
  descriptors:
    - key: b
      rate_limit:
        requests_per_unit: 10
        unit: second
"#;
        let matcher = compile_tree(yaml).unwrap();
        let request = [descriptor(&[("a", "1"), ("b", "2")])];
        assert_eq!(limits(&matcher.find_rules(&request)), vec![10]);

        // Only `a` present: the shorter rule is the only candidate
        assert_eq!(
            limits(&matcher.find_rules(&[descriptor(&[("a", "1")])])),
            vec![1000]
        );

        let weighted = r#"
- key: a
  rate_limit:
    requests_per_unit: 1000
    unit: second
  descriptors:
    - key: b
      rate_limit:
        requests_per_unit: 10
        unit: second
    - key: b
      value: "2"
      weight: 1
      rate_limit:
        requests_per_unit: 5
        unit: second
"#;
        let matcher = compile_tree(weighted).unwrap();
        assert_eq!(limits(&matcher.find_rules(&request)), vec![5]);
    }

    #[test]
    fn test_weight_beats_longer_prefix() {
        let yaml = r#"
- key: a
  weight: 3
  rate_limit:
    requests_per_unit: 7
    unit: minute
  descriptors:
    - key: b
      rate_limit:
        requests_per_unit: 10
        unit: second
"#;
        let matcher = compile_tree(yaml).unwrap();
        let matched = matcher.find_rules(&[descriptor(&[("a", "1"), ("b", "2")])]);
        assert_eq!(limits(&matched), vec![7]);
        assert_eq!(matched[0].key.entries, vec![("a".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_exact_value_beats_wildcard() {
        let yaml = r#"
- key: remote_address
  rate_limit:
    requests_per_unit: 50
    unit: second
- key: remote_address
  value: 10.0.0.1
  rate_limit:
    requests_per_unit: 5
    unit: second
"#;
        let matcher = compile_tree(yaml).unwrap();
        assert_eq!(
            limits(&matcher.find_rules(&[descriptor(&[("remote_address", "10.0.0.1")])])),
            vec![5]
        );
        assert_eq!(
            limits(&matcher.find_rules(&[descriptor(&[("remote_address", "10.0.0.2")])])),
            vec![50]
        );
    }

    #[test]
    fn test_always_apply_rules_join_primary() {
        let yaml = r#"
- key: generic_key
  value: api
  rate_limit:
    requests_per_unit: 1000
    unit: second
  descriptors:
    - key: remote_address
      always_apply: true
      rate_limit:
        requests_per_unit: 2
        unit: minute
- key: generic_key
  always_apply: true
  rate_limit:
    requests_per_unit: 3
    unit: minute
"#;
        let matcher = compile_tree(yaml).unwrap();
        let matched = matcher.find_rules(&[descriptor(&[
            ("generic_key", "api"),
            ("remote_address", "10.0.0.1"),
        ])]);
        assert_eq!(limits(&matched), vec![1000, 2, 3]);
        assert!(!matched[0].always_apply);
        assert!(matched[1].always_apply && matched[2].always_apply);
    }

    #[test]
    fn test_highest_weight_wins_across_descriptors() {
        let yaml = r#"
- key: generic_key
  value: unprioritized
  rate_limit:
    requests_per_unit: 2
    unit: minute
- key: generic_key
  value: prioritized
  weight: 1
  rate_limit:
    requests_per_unit: 1000
    unit: second
- key: generic_key
  value: always
  always_apply: true
  rate_limit:
    requests_per_unit: 2
    unit: minute
"#;
        let matcher = compile_tree(yaml).unwrap();
        let request = [
            descriptor(&[("generic_key", "unprioritized")]),
            descriptor(&[("generic_key", "prioritized")]),
            descriptor(&[("generic_key", "always")]),
        ];
        assert_eq!(limits(&matcher.find_rules(&request)), vec![1000, 2]);

        // Without the prioritized descriptor the lower weight rule applies
        assert_eq!(
            limits(&matcher.find_rules(&[descriptor(&[("generic_key", "unprioritized")])])),
            vec![2]
        );
    }

    #[test]
    fn test_weight_only_competes_within_a_domain() {
        let mut matcher = compile_tree(
            r#"
- key: generic_key
  value: prioritized
  weight: 1
  rate_limit:
    requests_per_unit: 1000
    unit: second
"#,
        )
        .unwrap();
        let other: Vec<DescriptorConfig> = serde_yaml::from_str(
            r#"
- key: remote_address
  rate_limit:
    requests_per_unit: 1
    unit: minute
"#,
        )
        .unwrap();
        matcher.add_domain("other_domain", &other).unwrap();

        let request = [
            descriptor(&[("generic_key", "prioritized")]),
            Descriptor::new(
                "other_domain",
                DescriptorKind::Tree,
                vec![DescriptorEntry::new("remote_address", "10.0.0.1")],
            ),
        ];
        let matched = matcher.find_rules(&request);
        assert_eq!(limits(&matched), vec![1000, 1]);
        assert_eq!(matched[1].key.domain, "other_domain");
    }

    #[test]
    fn test_equal_rank_overlap_is_ambiguous() {
        let yaml = r#"
- key: a
  value: "1"
  descriptors:
    - key: b
      rate_limit:
        requests_per_unit: 1
        unit: second
- key: a
  descriptors:
    - key: b
      value: "2"
      rate_limit:
        requests_per_unit: 2
        unit: second
"#;
        assert!(matches!(
            compile_tree(yaml),
            Err(TollgateError::ConfigurationAmbiguity(_))
        ));

        // Disjoint exact values never meet
        let disjoint = r#"
- key: a
  value: "1"
  rate_limit:
    requests_per_unit: 1
    unit: second
- key: a
  value: "2"
  rate_limit:
    requests_per_unit: 2
    unit: second
"#;
        assert!(compile_tree(disjoint).is_ok());
    }

    #[test]
    fn test_no_match() {
        let yaml = r#"
- key: api_key
  rate_limit:
    requests_per_unit: 1000
    unit: minute
"#;
        let matcher = compile_tree(yaml).unwrap();
        assert!(matcher
            .find_rules(&[descriptor(&[("other_key", "value")])])
            .is_empty());

        let other_domain = Descriptor::new(
            "other_domain",
            DescriptorKind::Tree,
            vec![DescriptorEntry::new("api_key", "value")],
        );
        assert!(matcher.find_rules(&[other_domain]).is_empty());
    }

    #[test]
    fn test_leaf_without_limit_is_malformed() {
        let yaml = r#"
- key: a
"#;
        assert!(matches!(
            compile_tree(yaml),
            Err(TollgateError::MalformedDescriptor(_))
        ));
    }
}
