//! Ordering of rate limiting relative to authorization.
//!
//! Rate limit actions run in one of two stages. Early actions run before any
//! auth check and only see what the client sent. Regular actions run after
//! authorization allowed the request and also see the state it emitted: the
//! auth metadata namespace and the user id header.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::auth::AuthDecision;
use crate::config::EngineConfig;
use crate::metadata::AUTHZ_NAMESPACE;
use crate::ratelimit::{ActionSet, Descriptor};
use crate::request::RequestContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Before authorization
    Early,
    /// After authorization allowed the request
    Regular,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Early => write!(f, "early"),
            Stage::Regular => write!(f, "regular"),
        }
    }
}

/// Actions of one policy, split by stage.
#[derive(Debug, Clone, Default)]
pub struct StageScheduler {
    early: Vec<ActionSet>,
    regular: Vec<ActionSet>,
}

impl StageScheduler {
    /// Place each actions entry; unstaged entries follow `before_auth`.
    pub fn new(action_sets: Vec<ActionSet>, before_auth: bool) -> Self {
        let mut scheduler = Self::default();
        for set in action_sets {
            let stage = set.stage().unwrap_or(if before_auth {
                Stage::Early
            } else {
                Stage::Regular
            });
            match stage {
                Stage::Early => scheduler.early.push(set),
                Stage::Regular => scheduler.regular.push(set),
            }
        }
        scheduler
    }

    pub fn actions(&self, stage: Stage) -> &[ActionSet] {
        match stage {
            Stage::Early => &self.early,
            Stage::Regular => &self.regular,
        }
    }

    /// Descriptors the request yields in a stage.
    pub fn descriptors(&self, stage: Stage, request: &RequestContext) -> Vec<Descriptor> {
        let descriptors: Vec<Descriptor> = self
            .actions(stage)
            .iter()
            .filter_map(|set| set.derive(request))
            .collect();
        debug!(stage = %stage, descriptors = descriptors.len(), "Derived descriptors");
        descriptors
    }

    /// Drop auth-owned data the client may have supplied itself.
    ///
    /// Must run before the early stage so neither stage can observe an
    /// identity that authorization did not establish.
    pub fn prepare(request: &mut RequestContext, config: &EngineConfig) {
        request.headers.remove(&config.rate_limit.user_id_header);
        request.metadata.remove_namespace(AUTHZ_NAMESPACE);
    }

    /// Publish authorization state to the request for the regular stage.
    pub fn publish(request: &mut RequestContext, decision: &AuthDecision, config: &EngineConfig) {
        request.metadata.merge(AUTHZ_NAMESPACE, &decision.state);
        if let Some(user_id) = &decision.user_id {
            request.metadata.insert(
                AUTHZ_NAMESPACE,
                config.auth.user_id_metadata_key.clone(),
                Value::String(user_id.clone()),
            );
            request
                .headers
                .insert(&config.rate_limit.user_id_header, user_id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{DescriptorConfig, RateLimitActions, RateLimitTable};
    use serde_json::json;

    fn action_set(yaml: &str) -> ActionSet {
        let config: RateLimitActions = serde_yaml::from_str(yaml).unwrap();
        ActionSet::compile("gateway", &config).unwrap()
    }

    fn user_actions() -> ActionSet {
        action_set(
            r#"
actions:
  - metadata:
      descriptor_key: user
      metadata_key:
        key: envoy.filters.http.ext_authz
        path:
          - key: userId
"#,
        )
    }

    fn allowed_as(user: &str) -> AuthDecision {
        AuthDecision {
            allowed: true,
            status: 200,
            state: json!({"tier": "gold"}).as_object().unwrap().clone(),
            user_id: Some(user.to_string()),
            upstream_headers: Vec::new(),
            client_headers: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    #[test]
    fn test_placement() {
        let early = action_set("actions: [{remote_address: {}}]\nstage: early");
        let regular = action_set("actions: [{remote_address: {}}]\nstage: regular");
        let unstaged = action_set("actions: [{remote_address: {}}]");

        let scheduler = StageScheduler::new(vec![early.clone(), regular.clone(), unstaged.clone()], false);
        assert_eq!(scheduler.actions(Stage::Early).len(), 1);
        assert_eq!(scheduler.actions(Stage::Regular).len(), 2);

        let scheduler = StageScheduler::new(vec![early, regular, unstaged], true);
        assert_eq!(scheduler.actions(Stage::Early).len(), 2);
        assert_eq!(scheduler.actions(Stage::Regular).len(), 1);
    }

    #[test]
    fn test_user_rule_only_triggers_in_regular_stage() {
        let config = EngineConfig::default();
        let rules: Vec<DescriptorConfig> = serde_yaml::from_str(
            r#"
- key: user
  rate_limit:
    requests_per_unit: 1
    unit: minute
"#,
        )
        .unwrap();
        let mut table = RateLimitTable::new();
        table.add_tree_rules("gateway", &rules).unwrap();

        // The same actions entry, placed in either stage
        let early = StageScheduler::new(vec![user_actions()], true);
        let regular = StageScheduler::new(vec![user_actions()], false);

        let mut request = RequestContext::default();
        StageScheduler::prepare(&mut request, &config);
        assert!(table
            .find_rules(&early.descriptors(Stage::Early, &request))
            .is_empty());

        StageScheduler::publish(&mut request, &allowed_as("alice"), &config);
        let matched = table.find_rules(&regular.descriptors(Stage::Regular, &request));
        assert_eq!(matched.len(), 1);
        assert_eq!(
            matched[0].key.entries,
            vec![("user".to_string(), "alice".to_string())]
        );
    }

    #[test]
    fn test_prepare_strips_spoofed_identity() {
        let config = EngineConfig::default();
        let mut request = RequestContext::default().with_header("X-User-Id", "mallory");
        request
            .metadata
            .insert(AUTHZ_NAMESPACE, "userId", json!("mallory"));

        StageScheduler::prepare(&mut request, &config);
        assert!(!request.headers.contains("x-user-id"));
        assert!(request.metadata.namespace(AUTHZ_NAMESPACE).is_none());
    }

    #[test]
    fn test_publish_writes_header_and_metadata() {
        let config = EngineConfig::default();
        let mut request = RequestContext::default();
        StageScheduler::publish(&mut request, &allowed_as("alice"), &config);

        assert_eq!(request.headers.get("x-user-id"), Some("alice"));
        let state = request.metadata.namespace(AUTHZ_NAMESPACE).unwrap();
        assert_eq!(state["userId"], json!("alice"));
        assert_eq!(state["tier"], json!("gold"));
    }
}
