//! Descriptors derived from requests and the keys their counters live under.

use serde::Serialize;
use std::borrow::Cow;

/// One key-value pair of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DescriptorEntry {
    pub key: String,
    pub value: String,
}

impl DescriptorEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// How a descriptor is matched against the rule tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    /// Ordered entries, prefix matched against tree rules
    Tree,
    /// Unordered pairs, subset matched against set rules
    Set,
}

/// A descriptor derived from one rate limit actions entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Descriptor {
    pub domain: String,
    pub kind: DescriptorKind,
    pub entries: Vec<DescriptorEntry>,
}

impl Descriptor {
    pub fn new(domain: impl Into<String>, kind: DescriptorKind, entries: Vec<DescriptorEntry>) -> Self {
        Self {
            domain: domain.into(),
            kind,
            entries,
        }
    }

    /// Value of the first entry with the given key.
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }
}

/// A key that uniquely identifies a counter bucket.
///
/// The key is composed of the domain, the rule that selected the bucket and
/// the request values the rule matched, in rule order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorKey {
    /// The domain this descriptor belongs to
    pub domain: String,
    /// Identifier of the rule within its table
    pub rule: String,
    /// Matched key-value pairs from the descriptor
    pub entries: Vec<(String, String)>,
}

impl DescriptorKey {
    pub fn new(domain: &str, rule: &str, entries: Vec<(String, String)>) -> Self {
        Self {
            domain: domain.to_string(),
            rule: rule.to_string(),
            entries,
        }
    }

    /// Convert the descriptor key to the string handed to counter backends.
    ///
    /// Separators inside keys and values are percent-escaped so distinct
    /// entry lists never share a bucket.
    pub fn to_string_key(&self) -> String {
        let entries_str: Vec<String> = self
            .entries
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect();

        format!("{}:{}:{}", self.domain, self.rule, entries_str.join(","))
    }
}

fn escape(part: &str) -> Cow<'_, str> {
    if !part.contains(|c| matches!(c, '%' | ',' | '=')) {
        return Cow::Borrowed(part);
    }
    let mut escaped = String::with_capacity(part.len() + 4);
    for c in part.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ',' => escaped.push_str("%2C"),
            '=' => escaped.push_str("%3D"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

impl std::fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Human readable rule path used in `X-RateLimit-Limit`.
///
/// Entries are joined with `|`, a key and its value with `^`. Segments that
/// match any value show only their key.
pub fn rule_path<'a, I>(domain: &str, segments: I) -> String
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
{
    let mut path = domain.to_string();
    for (key, value) in segments {
        path.push('|');
        path.push_str(key);
        if let Some(value) = value {
            path.push('^');
            path.push_str(value);
        }
    }
    path
}
