//! HMAC request signing.
//!
//! Clients send
//! `Authorization: hmac username="alice", algorithm="hmac-sha256", headers="date @request-target", signature="<base64>"`
//! where the signature covers one `name: value` line per listed header.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;

use super::verdict::Verdict;
use crate::request::RequestContext;

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TARGET: &str = "@request-target";
const SUPPORTED_ALGORITHM: &str = "hmac-sha256";

/// HMAC auth configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmacAuth {
    /// Username to shared secret
    #[serde(default)]
    pub users: HashMap<String, String>,
    /// Maximum distance between the signed `date` header and now
    #[serde(default = "default_max_clock_skew")]
    pub max_clock_skew_secs: i64,
}

fn default_max_clock_skew() -> i64 {
    300
}

#[derive(Debug, Default, PartialEq, Eq)]
struct SignatureParams {
    username: String,
    algorithm: String,
    headers: Vec<String>,
    signature: String,
}

fn parse_params(value: &str) -> Option<SignatureParams> {
    let (scheme, rest) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("hmac") {
        return None;
    }

    let mut params = SignatureParams::default();
    for pair in rest.split(',') {
        let (key, raw) = pair.trim().split_once('=')?;
        let raw = raw.trim().trim_matches('"');
        match key.trim() {
            "username" => params.username = raw.to_string(),
            "algorithm" => params.algorithm = raw.to_ascii_lowercase(),
            "headers" => {
                params.headers = raw
                    .split_whitespace()
                    .map(str::to_ascii_lowercase)
                    .collect()
            }
            "signature" => params.signature = raw.to_string(),
            _ => {}
        }
    }

    if params.username.is_empty() || params.signature.is_empty() {
        return None;
    }
    if params.algorithm.is_empty() {
        params.algorithm = SUPPORTED_ALGORITHM.to_string();
    }
    if params.headers.is_empty() {
        params.headers.push("date".to_string());
    }
    Some(params)
}

/// Build the string that is signed for `headers`.
pub fn signing_string(request: &RequestContext, headers: &[String]) -> Option<String> {
    let mut lines = Vec::with_capacity(headers.len());
    for name in headers {
        if name == REQUEST_TARGET {
            lines.push(format!(
                "{}: {} {}",
                REQUEST_TARGET,
                request.method.to_ascii_lowercase(),
                request.path
            ));
        } else {
            lines.push(format!("{}: {}", name, request.headers.get(name)?));
        }
    }
    Some(lines.join("\n"))
}

/// Sign `message` with `secret`, base64 encoded.
pub fn sign(secret: &str, message: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message.as_bytes());
    Some(STANDARD.encode(mac.finalize().into_bytes()))
}

impl HmacAuth {
    pub fn evaluate(&self, request: &RequestContext) -> Verdict {
        let params = match request.headers.get("authorization").and_then(parse_params) {
            Some(params) => params,
            None => return Verdict::deny("missing hmac signature"),
        };

        if params.algorithm != SUPPORTED_ALGORITHM {
            return Verdict::deny(format!("unsupported algorithm {}", params.algorithm));
        }

        let secret = match self.users.get(&params.username) {
            Some(secret) => secret,
            None => return Verdict::deny("unknown hmac user"),
        };

        if params.headers.iter().any(|h| h == "date") && !self.date_within_skew(request) {
            return Verdict::deny("signed date outside allowed clock skew");
        }

        let message = match signing_string(request, &params.headers) {
            Some(message) => message,
            None => return Verdict::deny("signed header missing from request"),
        };

        let provided = match STANDARD.decode(&params.signature) {
            Ok(provided) => provided,
            Err(_) => return Verdict::deny("signature is not base64"),
        };

        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return Verdict::deny("unusable secret"),
        };
        mac.update(message.as_bytes());

        match mac.verify_slice(&provided) {
            Ok(()) => Verdict::allow().with_user_id(params.username),
            Err(_) => Verdict::deny("signature mismatch"),
        }
    }

    fn date_within_skew(&self, request: &RequestContext) -> bool {
        let date = match request
            .headers
            .get("date")
            .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
        {
            Some(date) => date.with_timezone(&Utc),
            None => return false,
        };
        (Utc::now() - date).num_seconds().abs() <= self.max_clock_skew_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::verdict::Outcome;

    fn hmac_auth() -> HmacAuth {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "s3cret".to_string());
        HmacAuth {
            users,
            max_clock_skew_secs: default_max_clock_skew(),
        }
    }

    fn signed_request(secret: &str, date: DateTime<Utc>) -> RequestContext {
        let request = RequestContext::new("POST", "/orders?id=7")
            .with_header("date", date.to_rfc2822());
        let headers = vec!["date".to_string(), REQUEST_TARGET.to_string()];
        let message = signing_string(&request, &headers).unwrap();
        let signature = sign(secret, &message).unwrap();
        request.with_header(
            "authorization",
            format!(
                "hmac username=\"alice\", algorithm=\"hmac-sha256\", headers=\"date @request-target\", signature=\"{}\"",
                signature
            ),
        )
    }

    #[test]
    fn test_signing_string_layout() {
        let request = RequestContext::new("GET", "/a").with_header("date", "d");
        let message =
            signing_string(&request, &["date".to_string(), REQUEST_TARGET.to_string()]).unwrap();
        assert_eq!(message, "date: d\n@request-target: get /a");
        assert!(signing_string(&request, &["x-missing".to_string()]).is_none());
    }

    #[test]
    fn test_valid_signature_allows() {
        let verdict = hmac_auth().evaluate(&signed_request("s3cret", Utc::now()));
        assert_eq!(verdict.outcome, Outcome::Allow);
        assert_eq!(verdict.user_id.as_deref(), Some("alice"));
    }

    #[test]
    fn test_wrong_secret_denies() {
        let verdict = hmac_auth().evaluate(&signed_request("other", Utc::now()));
        assert_eq!(verdict.outcome, Outcome::Deny);
    }

    #[test]
    fn test_stale_date_denies() {
        let stale = Utc::now() - chrono::Duration::hours(1);
        let verdict = hmac_auth().evaluate(&signed_request("s3cret", stale));
        assert_eq!(verdict.outcome, Outcome::Deny);
    }

    #[test]
    fn test_parse_params_defaults() {
        let params = parse_params("hmac username=\"bob\", signature=\"abc=\"").unwrap();
        assert_eq!(params.algorithm, SUPPORTED_ALGORITHM);
        assert_eq!(params.headers, vec!["date".to_string()]);
        assert_eq!(params.signature, "abc=");
        assert!(parse_params("Basic abc").is_none());
    }
}
