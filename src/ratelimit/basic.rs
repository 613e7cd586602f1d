//! Basic ("ingress") rate limits.
//!
//! A basic limit is a pair of quotas for one named virtual host: one for
//! authenticated callers, counted per user id, and one for anonymous callers,
//! counted per client address. They expand into ordinary tree rules and
//! regular-stage actions under their own domain.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::actions::{Action, ActionSet, HeaderMatchRule, HeaderMatcher, RateLimitActions};
use super::rules::{DescriptorConfig, RateLimitRule};
use crate::config::RateLimitSettings;
use crate::error::{Result, TollgateError};
use crate::stage::Stage;

/// Domain of every rule generated from basic limits.
pub const INGRESS_DOMAIN: &str = "ingress";

const AUTHENTICATED: &str = "authenticated";
const NOT_AUTHENTICATED: &str = "not-authenticated";
const USER_ID_KEY: &str = "userid";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressRateLimit {
    /// Unique name, usually `<namespace>_<virtual host>`
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub authorized_limits: Option<RateLimitRule>,
    #[serde(default)]
    pub anonymous_limits: Option<RateLimitRule>,
}

/// Rules and actions generated from basic limits.
#[derive(Debug, Clone, Default)]
pub struct IngressRules {
    pub descriptors: Vec<DescriptorConfig>,
    pub actions: Vec<ActionSet>,
}

pub fn compile_ingress(
    limits: &[IngressRateLimit],
    settings: &RateLimitSettings,
) -> Result<IngressRules> {
    let mut rules = IngressRules::default();
    if limits.is_empty() {
        return Ok(rules);
    }
    if settings.rate_limit_before_auth {
        return Err(TollgateError::AuthOrderingConflict(
            "basic rate limits are keyed on the authenticated user and cannot run before auth"
                .to_string(),
        ));
    }

    let mut names = HashSet::new();
    for limit in limits {
        if limit.name.is_empty() {
            return Err(TollgateError::Config(
                "basic rate limit is missing a name".to_string(),
            ));
        }
        if !names.insert(limit.name.as_str()) {
            return Err(TollgateError::Config(format!(
                "duplicate basic rate limit name {:?}",
                limit.name
            )));
        }

        let mut children = Vec::new();
        if let Some(authorized) = &limit.authorized_limits {
            children.push(node(
                "header_match",
                Some(AUTHENTICATED),
                vec![leaf(USER_ID_KEY, authorized)],
            ));
            let actions = vec![
                generic_key(&limit.name),
                user_id_match(AUTHENTICATED, &settings.user_id_header, false),
                Action::RequestHeaders {
                    header_name: settings.user_id_header.clone(),
                    descriptor_key: USER_ID_KEY.to_string(),
                    skip_if_absent: false,
                },
            ];
            rules.actions.push(regular(actions)?);
        }
        if let Some(anonymous) = &limit.anonymous_limits {
            children.push(node(
                "header_match",
                Some(NOT_AUTHENTICATED),
                vec![leaf("remote_address", anonymous)],
            ));
            let actions = vec![
                generic_key(&limit.name),
                user_id_match(NOT_AUTHENTICATED, &settings.user_id_header, true),
                Action::RemoteAddress {},
            ];
            rules.actions.push(regular(actions)?);
        }
        if !children.is_empty() {
            rules
                .descriptors
                .push(node("generic_key", Some(&limit.name), children));
        }
    }
    Ok(rules)
}

fn node(key: &str, value: Option<&str>, descriptors: Vec<DescriptorConfig>) -> DescriptorConfig {
    DescriptorConfig {
        key: key.to_string(),
        value: value.map(str::to_string),
        rate_limit: None,
        weight: 0,
        always_apply: false,
        descriptors,
    }
}

fn leaf(key: &str, limit: &RateLimitRule) -> DescriptorConfig {
    DescriptorConfig {
        rate_limit: Some(limit.clone()),
        ..node(key, None, Vec::new())
    }
}

fn generic_key(name: &str) -> Action {
    Action::GenericKey {
        descriptor_value: Some(name.to_string()),
        descriptor_key: None,
    }
}

fn user_id_match(value: &str, header: &str, invert: bool) -> Action {
    Action::HeaderValueMatch {
        descriptor_value: Some(value.to_string()),
        descriptor_key: None,
        expect_match: true,
        headers: vec![HeaderMatcher {
            name: header.to_string(),
            rule: HeaderMatchRule::Present(true),
            invert_match: invert,
        }],
    }
}

fn regular(actions: Vec<Action>) -> Result<ActionSet> {
    ActionSet::compile(
        INGRESS_DOMAIN,
        &RateLimitActions {
            actions,
            set_actions: Vec::new(),
            stage: Some(Stage::Regular),
        },
    )
}
