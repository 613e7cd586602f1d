//! JWT validation for bearer tokens.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::verdict::{HeaderValueOption, Verdict};
use crate::error::{Result, TollgateError};
use crate::metadata::{value_to_descriptor, State};
use crate::request::RequestContext;

/// Signature algorithms accepted for tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JwtAlgorithm {
    #[default]
    HS256,
    HS384,
    HS512,
    RS256,
}

impl From<JwtAlgorithm> for Algorithm {
    fn from(alg: JwtAlgorithm) -> Self {
        match alg {
            JwtAlgorithm::HS256 => Algorithm::HS256,
            JwtAlgorithm::HS384 => Algorithm::HS384,
            JwtAlgorithm::HS512 => Algorithm::HS512,
            JwtAlgorithm::RS256 => Algorithm::RS256,
        }
    }
}

/// Copy a string claim into an upstream header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimToHeader {
    pub claim: String,
    pub header: String,
    #[serde(default)]
    pub append: bool,
}

/// JWT configuration as it appears in a policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JwtConfig {
    #[serde(default)]
    pub algorithm: JwtAlgorithm,
    /// Shared secret for HMAC algorithms
    #[serde(default)]
    pub secret: Option<String>,
    /// PEM encoded public key for RSA algorithms
    #[serde(default)]
    pub public_key_pem: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audiences: Vec<String>,
    /// Header carrying the token; `authorization` by default
    #[serde(default)]
    pub header: Option<String>,
    /// Prefix stripped from the header value; `Bearer ` by default
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub claims_to_headers: Vec<ClaimToHeader>,
    /// Clock skew tolerated on `exp` and `nbf`
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

fn default_leeway() -> u64 {
    60
}

/// A compiled JWT check.
#[derive(Clone)]
pub struct JwtAuth {
    config: JwtConfig,
    key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for JwtAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuth")
            .field("algorithm", &self.config.algorithm)
            .field("issuer", &self.config.issuer)
            .field("audiences", &self.config.audiences)
            .finish()
    }
}

impl JwtAuth {
    pub fn compile(config: JwtConfig) -> Result<Self> {
        let key = match config.algorithm {
            JwtAlgorithm::HS256 | JwtAlgorithm::HS384 | JwtAlgorithm::HS512 => {
                let secret = config.secret.as_ref().ok_or_else(|| {
                    TollgateError::Config("jwt: HMAC algorithms require a secret".to_string())
                })?;
                DecodingKey::from_secret(secret.as_bytes())
            }
            JwtAlgorithm::RS256 => {
                let pem = config.public_key_pem.as_ref().ok_or_else(|| {
                    TollgateError::Config("jwt: RS256 requires public_key_pem".to_string())
                })?;
                DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| TollgateError::Config(format!("jwt: invalid public key: {}", e)))?
            }
        };

        let mut validation = Validation::new(config.algorithm.into());
        validation.leeway = config.leeway_secs;
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if config.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&config.audiences);
        }

        Ok(Self {
            config,
            key,
            validation,
        })
    }

    fn token<'a>(&self, request: &'a RequestContext) -> Option<&'a str> {
        let header = self.config.header.as_deref().unwrap_or("authorization");
        let prefix = self.config.prefix.as_deref().unwrap_or("Bearer ");
        let value = request.headers.get(header)?;
        value.strip_prefix(prefix).map(str::trim)
    }

    /// Validate a raw token and return its claims.
    pub fn validate(&self, token: &str) -> std::result::Result<Map<String, Value>, String> {
        decode::<Map<String, Value>>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| e.to_string())
    }

    pub fn evaluate(&self, request: &RequestContext) -> Verdict {
        let token = match self.token(request) {
            Some(token) if !token.is_empty() => token,
            _ => return Verdict::deny("missing jwt"),
        };

        let claims = match self.validate(token) {
            Ok(claims) => claims,
            Err(e) => return Verdict::deny(format!("invalid jwt: {}", e)),
        };

        self.allow_with_claims(claims)
    }

    pub(crate) fn allow_with_claims(&self, claims: Map<String, Value>) -> Verdict {
        let mut verdict = Verdict::allow();
        if let Some(sub) = claims.get("sub").and_then(value_to_descriptor) {
            verdict = verdict.with_user_id(sub);
        }

        for mapping in &self.config.claims_to_headers {
            if let Some(value) = claims.get(&mapping.claim).and_then(value_to_descriptor) {
                verdict.upstream_headers.push(HeaderValueOption::new(
                    mapping.header.clone(),
                    value,
                    mapping.append,
                ));
            }
        }

        let mut state = State::new();
        state.insert("jwt".to_string(), Value::Object(claims));
        verdict.with_state(state)
    }
}
