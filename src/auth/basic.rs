//! HTTP Basic authentication against salted password hashes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use subtle::ConstantTimeEq;

use super::verdict::Verdict;
use crate::request::RequestContext;

/// A stored credential: `hashed_password = hex(sha256(salt || password))`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaltedHashedPassword {
    pub salt: String,
    pub hashed_password: String,
}

/// Basic auth configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuth {
    #[serde(default = "default_realm")]
    pub realm: String,
    /// Username to credential
    #[serde(default)]
    pub users: HashMap<String, SaltedHashedPassword>,
}

fn default_realm() -> String {
    "gateway".to_string()
}

impl BasicAuth {
    /// Hash a password the way stored credentials are expected to be hashed.
    pub fn hash_password(salt: &str, password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn evaluate(&self, request: &RequestContext) -> Verdict {
        let (username, password) = match credentials(request) {
            Some(credentials) => credentials,
            None => return self.challenge("missing basic credentials"),
        };

        let stored = match self.users.get(&username) {
            Some(stored) => stored,
            None => return self.challenge("unknown user"),
        };

        let computed = Self::hash_password(&stored.salt, &password);
        let matches: bool = computed
            .as_bytes()
            .ct_eq(stored.hashed_password.to_ascii_lowercase().as_bytes())
            .into();

        if matches {
            Verdict::allow().with_user_id(username)
        } else {
            self.challenge("password mismatch")
        }
    }

    fn challenge(&self, reason: &str) -> Verdict {
        Verdict::deny(reason)
            .with_client_header("www-authenticate", format!("Basic realm=\"{}\"", self.realm))
    }
}

/// Decode `Authorization: Basic <base64(user:password)>`.
fn credentials(request: &RequestContext) -> Option<(String, String)> {
    let value = request.headers.get("authorization")?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}
