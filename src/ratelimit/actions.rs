//! Rate limit actions: how descriptors are derived from a request.
//!
//! Action names and fields follow Envoy's route-level rate limit actions, so
//! existing gateway configuration can be pasted in unchanged. Actions are
//! compiled once when a policy loads; anything that could never produce an
//! entry is rejected there instead of silently matching nothing at runtime.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::descriptor::{Descriptor, DescriptorEntry, DescriptorKind};
use crate::error::{Result, TollgateError};
use crate::metadata::value_to_descriptor;
use crate::request::RequestContext;
use crate::stage::Stage;

const GENERIC_KEY: &str = "generic_key";
const HEADER_MATCH_KEY: &str = "header_match";
const SOURCE_CLUSTER_KEY: &str = "source_cluster";
const DESTINATION_CLUSTER_KEY: &str = "destination_cluster";
const REMOTE_ADDRESS_KEY: &str = "remote_address";

/// A single rate limit action as written in a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    SourceCluster {},
    DestinationCluster {},
    RequestHeaders {
        header_name: String,
        descriptor_key: String,
        /// Drop this action instead of the whole descriptor when the header is absent
        #[serde(default)]
        skip_if_absent: bool,
    },
    RemoteAddress {},
    GenericKey {
        #[serde(default)]
        descriptor_value: Option<String>,
        #[serde(default)]
        descriptor_key: Option<String>,
    },
    HeaderValueMatch {
        #[serde(default)]
        descriptor_value: Option<String>,
        #[serde(default)]
        descriptor_key: Option<String>,
        #[serde(default = "default_expect_match")]
        expect_match: bool,
        #[serde(default)]
        headers: Vec<HeaderMatcher>,
    },
    Metadata {
        descriptor_key: String,
        metadata_key: MetadataKey,
        #[serde(default)]
        default_value: Option<String>,
    },
}

fn default_expect_match() -> bool {
    true
}

/// Address of a dynamic metadata value: a filter namespace and a key path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataKey {
    pub key: String,
    #[serde(default)]
    pub path: Vec<PathSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSegment {
    pub key: String,
}

/// Match against one request header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderMatcher {
    pub name: String,
    #[serde(flatten)]
    pub rule: HeaderMatchRule,
    #[serde(default)]
    pub invert_match: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderMatchRule {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Regex(String),
    Present(bool),
}

#[derive(Debug, Clone)]
enum CompiledRule {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Regex(Regex),
    Present(bool),
}

#[derive(Debug, Clone)]
struct CompiledHeaderMatcher {
    name: String,
    rule: CompiledRule,
    invert: bool,
}

impl CompiledHeaderMatcher {
    fn compile(matcher: &HeaderMatcher) -> Result<Self> {
        let rule = match &matcher.rule {
            HeaderMatchRule::Exact(s) => CompiledRule::Exact(s.clone()),
            HeaderMatchRule::Prefix(s) => CompiledRule::Prefix(s.clone()),
            HeaderMatchRule::Suffix(s) => CompiledRule::Suffix(s.clone()),
            // Header regexes must match the whole value
            HeaderMatchRule::Regex(pattern) => CompiledRule::Regex(
                Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                    TollgateError::Config(format!("invalid header regex {:?}: {}", pattern, e))
                })?,
            ),
            HeaderMatchRule::Present(present) => CompiledRule::Present(*present),
        };
        Ok(Self {
            name: matcher.name.clone(),
            rule,
            invert: matcher.invert_match,
        })
    }

    fn matches(&self, request: &RequestContext) -> bool {
        let value = request.headers.get(&self.name);
        let matched = match (&self.rule, value) {
            (CompiledRule::Present(present), value) => value.is_some() == *present,
            (_, None) => false,
            (CompiledRule::Exact(s), Some(v)) => v == s,
            (CompiledRule::Prefix(s), Some(v)) => v.starts_with(s.as_str()),
            (CompiledRule::Suffix(s), Some(v)) => v.ends_with(s.as_str()),
            (CompiledRule::Regex(re), Some(v)) => re.is_match(v),
        };
        matched != self.invert
    }
}

/// Result of applying one action to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Derived {
    Entry(DescriptorEntry),
    /// The action drops out; the rest of the descriptor is kept
    Skip,
    /// The action cannot produce a value; no descriptor is generated
    Missing,
}

#[derive(Debug, Clone)]
enum CompiledAction {
    SourceCluster,
    DestinationCluster,
    RequestHeaders {
        header_name: String,
        descriptor_key: String,
        skip_if_absent: bool,
    },
    RemoteAddress,
    GenericKey {
        key: String,
        value: String,
    },
    HeaderValueMatch {
        key: String,
        value: String,
        expect_match: bool,
        headers: Vec<CompiledHeaderMatcher>,
    },
    Metadata {
        descriptor_key: String,
        namespace: String,
        path: Vec<String>,
        default_value: Option<String>,
    },
}

impl CompiledAction {
    fn compile(action: &Action) -> Result<Self> {
        Ok(match action {
            Action::SourceCluster {} => CompiledAction::SourceCluster,
            Action::DestinationCluster {} => CompiledAction::DestinationCluster,
            Action::RequestHeaders {
                header_name,
                descriptor_key,
                skip_if_absent,
            } => CompiledAction::RequestHeaders {
                header_name: header_name.clone(),
                descriptor_key: descriptor_key.clone(),
                skip_if_absent: *skip_if_absent,
            },
            Action::RemoteAddress {} => CompiledAction::RemoteAddress,
            Action::GenericKey {
                descriptor_value,
                descriptor_key,
            } => CompiledAction::GenericKey {
                key: descriptor_key.clone().unwrap_or_else(|| GENERIC_KEY.to_string()),
                value: required_value(descriptor_value, "generic_key")?,
            },
            Action::HeaderValueMatch {
                descriptor_value,
                descriptor_key,
                expect_match,
                headers,
            } => CompiledAction::HeaderValueMatch {
                key: descriptor_key
                    .clone()
                    .unwrap_or_else(|| HEADER_MATCH_KEY.to_string()),
                value: required_value(descriptor_value, "header_value_match")?,
                expect_match: *expect_match,
                headers: headers
                    .iter()
                    .map(CompiledHeaderMatcher::compile)
                    .collect::<Result<_>>()?,
            },
            Action::Metadata {
                descriptor_key,
                metadata_key,
                default_value,
            } => {
                if metadata_key.path.is_empty() {
                    return Err(TollgateError::MalformedDescriptor(format!(
                        "metadata action {:?} has an empty key path",
                        descriptor_key
                    )));
                }
                CompiledAction::Metadata {
                    descriptor_key: descriptor_key.clone(),
                    namespace: metadata_key.key.clone(),
                    path: metadata_key.path.iter().map(|s| s.key.clone()).collect(),
                    default_value: default_value.clone(),
                }
            }
        })
    }

    fn derive(&self, request: &RequestContext) -> Derived {
        match self {
            CompiledAction::SourceCluster => match &request.source_cluster {
                Some(cluster) => Derived::Entry(DescriptorEntry::new(SOURCE_CLUSTER_KEY, cluster)),
                None => Derived::Missing,
            },
            CompiledAction::DestinationCluster => match &request.destination_cluster {
                Some(cluster) => {
                    Derived::Entry(DescriptorEntry::new(DESTINATION_CLUSTER_KEY, cluster))
                }
                None => Derived::Missing,
            },
            CompiledAction::RequestHeaders {
                header_name,
                descriptor_key,
                skip_if_absent,
            } => match request.headers.get(header_name) {
                Some(value) => Derived::Entry(DescriptorEntry::new(descriptor_key, value)),
                None if *skip_if_absent => Derived::Skip,
                None => Derived::Missing,
            },
            CompiledAction::RemoteAddress => match &request.remote_address {
                Some(addr) => Derived::Entry(DescriptorEntry::new(REMOTE_ADDRESS_KEY, addr)),
                None => Derived::Missing,
            },
            CompiledAction::GenericKey { key, value } => {
                Derived::Entry(DescriptorEntry::new(key, value))
            }
            CompiledAction::HeaderValueMatch {
                key,
                value,
                expect_match,
                headers,
            } => {
                let all_match = headers.iter().all(|m| m.matches(request));
                if all_match == *expect_match {
                    Derived::Entry(DescriptorEntry::new(key, value))
                } else {
                    Derived::Missing
                }
            }
            CompiledAction::Metadata {
                descriptor_key,
                namespace,
                path,
                default_value,
            } => {
                let value = request
                    .metadata
                    .lookup(namespace, path)
                    .and_then(value_to_descriptor)
                    .filter(|v| !v.is_empty())
                    .or_else(|| default_value.clone());
                match value {
                    Some(value) => Derived::Entry(DescriptorEntry::new(descriptor_key, value)),
                    None => Derived::Missing,
                }
            }
        }
    }
}

fn required_value(value: &Option<String>, action: &str) -> Result<String> {
    match value {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(TollgateError::MalformedDescriptor(format!(
            "{} action requires a descriptor_value",
            action
        ))),
    }
}

/// One entry of a rate limit actions list as written in a policy.
///
/// Exactly one of `actions` (ordered, tree matched) or `set_actions`
/// (unordered, set matched) must be given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitActions {
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "serde_yaml::with::singleton_map_recursive"
    )]
    pub actions: Vec<Action>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "serde_yaml::with::singleton_map_recursive"
    )]
    pub set_actions: Vec<Action>,
    /// Stage the entry runs in; placed by `rate_limit_before_auth` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

/// A compiled actions entry bound to a domain.
#[derive(Debug, Clone)]
pub struct ActionSet {
    domain: String,
    kind: DescriptorKind,
    actions: Vec<CompiledAction>,
    stage: Option<Stage>,
}

impl ActionSet {
    pub fn compile(domain: &str, config: &RateLimitActions) -> Result<Self> {
        let (kind, actions) = match (config.actions.is_empty(), config.set_actions.is_empty()) {
            (false, true) => (DescriptorKind::Tree, &config.actions),
            (true, false) => (DescriptorKind::Set, &config.set_actions),
            (true, true) => {
                return Err(TollgateError::MalformedDescriptor(
                    "rate limit actions entry has no actions".to_string(),
                ))
            }
            (false, false) => {
                return Err(TollgateError::MalformedDescriptor(
                    "rate limit actions entry sets both actions and set_actions".to_string(),
                ))
            }
        };

        Ok(Self {
            domain: domain.to_string(),
            kind,
            actions: actions
                .iter()
                .map(CompiledAction::compile)
                .collect::<Result<_>>()?,
            stage: config.stage,
        })
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    /// Stage as configured; `None` means the scheduler places it.
    pub fn stage(&self) -> Option<Stage> {
        self.stage
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Derive this entry's descriptor, if every action yields a value.
    pub fn derive(&self, request: &RequestContext) -> Option<Descriptor> {
        let mut entries = Vec::with_capacity(self.actions.len());
        for action in &self.actions {
            match action.derive(request) {
                Derived::Entry(entry) => entries.push(entry),
                Derived::Skip => {}
                Derived::Missing => {
                    trace!(domain = %self.domain, action = ?action, "Action produced no value");
                    return None;
                }
            }
        }
        if entries.is_empty() {
            return None;
        }
        Some(Descriptor::new(self.domain.clone(), self.kind, entries))
    }
}
