//! Auth check configuration and dispatch.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::apikey::ApiKeyAuth;
use super::basic::BasicAuth;
use super::client::AuthServiceClient;
use super::custom::CustomAuth;
use super::hmac::HmacAuth;
use super::jwt::{JwtAuth, JwtConfig};
use super::oauth2::{OAuth2Auth, OAuth2Config};
use super::opa::OpaAuth;
use super::passthrough::PassthroughChain;
use super::verdict::Verdict;
use crate::error::Result;
use crate::metadata::State;
use crate::request::RequestContext;

/// One auth check as written in a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthCheckConfig {
    BasicAuth(BasicAuth),
    ApiKeyAuth(ApiKeyAuth),
    Jwt(JwtConfig),
    #[serde(rename = "oauth2")]
    OAuth2(OAuth2Config),
    HmacAuth(HmacAuth),
    OpaAuth(OpaAuth),
    PassThroughAuth(PassthroughChain),
    Disable {},
    CustomAuth(CustomAuth),
}

impl AuthCheckConfig {
    /// Name used for an entry that does not set one.
    pub fn default_name(&self) -> &'static str {
        match self {
            AuthCheckConfig::BasicAuth(_) => "basic_auth",
            AuthCheckConfig::ApiKeyAuth(_) => "api_key_auth",
            AuthCheckConfig::Jwt(_) => "jwt",
            AuthCheckConfig::OAuth2(_) => "oauth2",
            AuthCheckConfig::HmacAuth(_) => "hmac_auth",
            AuthCheckConfig::OpaAuth(_) => "opa_auth",
            AuthCheckConfig::PassThroughAuth(_) => "pass_through_auth",
            AuthCheckConfig::Disable {} => "disable",
            AuthCheckConfig::CustomAuth(_) => "custom_auth",
        }
    }
}

/// A named entry of an auth config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfigEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub check: AuthCheckConfig,
}

/// Everything a check may use while it runs.
#[derive(Clone, Copy)]
pub struct CheckContext<'a> {
    pub request: &'a RequestContext,
    /// State emitted by checks that ran earlier in list order
    pub state: &'a State,
    pub client: &'a dyn AuthServiceClient,
    pub cancel: &'a CancellationToken,
    /// Timeout for a single remote call
    pub timeout: Duration,
}

/// A compiled auth check.
#[derive(Debug, Clone)]
pub enum AuthCheck {
    Basic(BasicAuth),
    ApiKey(ApiKeyAuth),
    Jwt(JwtAuth),
    OAuth2(OAuth2Auth),
    Hmac(HmacAuth),
    Opa(OpaAuth),
    PassThrough(PassthroughChain),
    Disable,
    Custom(CustomAuth),
}

impl AuthCheck {
    pub fn compile(config: AuthCheckConfig) -> Result<Self> {
        Ok(match config {
            AuthCheckConfig::BasicAuth(basic) => AuthCheck::Basic(basic),
            AuthCheckConfig::ApiKeyAuth(api_key) => AuthCheck::ApiKey(api_key),
            AuthCheckConfig::Jwt(jwt) => AuthCheck::Jwt(JwtAuth::compile(jwt)?),
            AuthCheckConfig::OAuth2(oauth2) => AuthCheck::OAuth2(OAuth2Auth::compile(oauth2)?),
            AuthCheckConfig::HmacAuth(hmac) => AuthCheck::Hmac(hmac),
            AuthCheckConfig::OpaAuth(opa) => AuthCheck::Opa(opa),
            AuthCheckConfig::PassThroughAuth(chain) => AuthCheck::PassThrough(chain),
            AuthCheckConfig::Disable {} => AuthCheck::Disable,
            AuthCheckConfig::CustomAuth(custom) => AuthCheck::Custom(custom),
        })
    }

    /// Passthrough checks consume state from earlier checks and run in order.
    pub fn is_passthrough(&self) -> bool {
        matches!(self, AuthCheck::PassThrough(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuthCheck::Basic(_) => "basic",
            AuthCheck::ApiKey(_) => "api_key",
            AuthCheck::Jwt(_) => "jwt",
            AuthCheck::OAuth2(_) => "oauth2",
            AuthCheck::Hmac(_) => "hmac",
            AuthCheck::Opa(_) => "opa",
            AuthCheck::PassThrough(_) => "passthrough",
            AuthCheck::Disable => "disable",
            AuthCheck::Custom(_) => "custom",
        }
    }

    pub async fn evaluate(&self, ctx: &CheckContext<'_>) -> Verdict {
        match self {
            AuthCheck::Basic(basic) => basic.evaluate(ctx.request),
            AuthCheck::ApiKey(api_key) => api_key.evaluate(ctx.request),
            AuthCheck::Jwt(jwt) => jwt.evaluate(ctx.request),
            AuthCheck::OAuth2(oauth2) => oauth2.evaluate(ctx).await,
            AuthCheck::Hmac(hmac) => hmac.evaluate(ctx.request),
            AuthCheck::Opa(opa) => opa.evaluate(ctx).await,
            AuthCheck::PassThrough(chain) => chain.run(ctx).await,
            AuthCheck::Disable => Verdict::allow(),
            AuthCheck::Custom(custom) => custom.evaluate(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entries() {
        let yaml = r#"
- name: JwtAuth
  jwt:
    secret: s3cret
    issuer: https://issuer.example.com
- basic_auth:
    realm: gateway
    users:
      user:
        salt: abc
        hashed_password: "00"
- oauth2:
    access_token_validation:
      introspection_url: http://introspect.local
- disable: {}
- custom_auth: {}
- pass_through_auth:
    grpc:
      address: auth.local:9001
"#;
        let entries: Vec<AuthConfigEntry> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[0].name.as_deref(), Some("JwtAuth"));
        let names: Vec<&str> = entries.iter().map(|e| e.check.default_name()).collect();
        assert_eq!(
            names,
            vec!["jwt", "basic_auth", "oauth2", "disable", "custom_auth", "pass_through_auth"]
        );

        let checks: Vec<AuthCheck> = entries
            .into_iter()
            .map(|e| AuthCheck::compile(e.check).unwrap())
            .collect();
        assert!(checks[5].is_passthrough());
        assert_eq!(checks[2].kind(), "oauth2");
    }

    #[test]
    fn test_compile_surfaces_config_errors() {
        let entry: AuthConfigEntry = serde_yaml::from_str("jwt: {}").unwrap();
        assert!(AuthCheck::compile(entry.check).is_err());
    }
}
