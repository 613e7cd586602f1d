//! OAuth2 checks: login redirects and access token validation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::check::CheckContext;
use super::client::{CallRequest, Decision, Target};
use super::jwt::{JwtAuth, JwtConfig};
use super::verdict::Verdict;
use crate::error::{Result, TollgateError};
use crate::metadata::{value_to_descriptor, State};

/// Settings shared by the redirect based flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectFlow {
    pub client_id: String,
    /// Authorization endpoint of the identity provider
    pub auth_endpoint: String,
    /// Public URL of the application, used to build the callback
    pub app_url: String,
    #[serde(default = "default_callback_path")]
    pub callback_path: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Cookie carrying the session established after login
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
    /// Endpoint that validates an existing session
    pub session_validation_url: String,
}

fn default_callback_path() -> String {
    "/oauth2/callback".to_string()
}

fn default_session_cookie() -> String {
    "id_token".to_string()
}

/// Access token validation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessTokenValidationConfig {
    /// Remote introspection endpoint
    #[serde(default)]
    pub introspection_url: Option<String>,
    /// Local validation of JWT access tokens
    #[serde(default)]
    pub jwt: Option<JwtConfig>,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    /// Field of the token info holding the user id; `sub` by default
    #[serde(default)]
    pub user_id_attribute_name: Option<String>,
}

/// OAuth2 configuration as it appears in a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuth2Config {
    OidcAuthorizationCode(RedirectFlow),
    #[serde(rename = "plain_oauth2")]
    PlainOAuth2(RedirectFlow),
    AccessTokenValidation(AccessTokenValidationConfig),
}

#[derive(Debug, Clone)]
pub enum TokenValidator {
    Introspection(String),
    Jwt(JwtAuth),
}

/// A compiled OAuth2 check.
#[derive(Debug, Clone)]
pub enum OAuth2Auth {
    Redirect { flow: RedirectFlow, oidc: bool },
    AccessToken {
        validator: TokenValidator,
        required_scopes: Vec<String>,
        user_id_attribute: String,
    },
}

impl OAuth2Auth {
    pub fn compile(config: OAuth2Config) -> Result<Self> {
        match config {
            OAuth2Config::OidcAuthorizationCode(flow) => Self::redirect(flow, true),
            OAuth2Config::PlainOAuth2(flow) => Self::redirect(flow, false),
            OAuth2Config::AccessTokenValidation(config) => {
                let validator = match (config.introspection_url, config.jwt) {
                    (Some(url), None) => TokenValidator::Introspection(url),
                    (None, Some(jwt)) => TokenValidator::Jwt(JwtAuth::compile(jwt)?),
                    _ => {
                        return Err(TollgateError::Config(
                            "access_token_validation needs exactly one of introspection_url or jwt"
                                .to_string(),
                        ))
                    }
                };
                Ok(OAuth2Auth::AccessToken {
                    validator,
                    required_scopes: config.required_scopes,
                    user_id_attribute: config
                        .user_id_attribute_name
                        .unwrap_or_else(|| "sub".to_string()),
                })
            }
        }
    }

    fn redirect(flow: RedirectFlow, oidc: bool) -> Result<Self> {
        Url::parse(&flow.auth_endpoint)
            .map_err(|e| TollgateError::Config(format!("oauth2 auth_endpoint: {}", e)))?;
        Url::parse(&flow.app_url)
            .map_err(|e| TollgateError::Config(format!("oauth2 app_url: {}", e)))?;
        Ok(OAuth2Auth::Redirect { flow, oidc })
    }

    pub async fn evaluate(&self, ctx: &CheckContext<'_>) -> Verdict {
        match self {
            OAuth2Auth::Redirect { flow, oidc } => evaluate_session(flow, *oidc, ctx).await,
            OAuth2Auth::AccessToken {
                validator,
                required_scopes,
                user_id_attribute,
            } => {
                let token = match ctx.request.bearer_token() {
                    Some(token) if !token.is_empty() => token,
                    _ => return Verdict::deny("missing access token"),
                };
                let info = match validator {
                    TokenValidator::Jwt(jwt) => match jwt.validate(token) {
                        Ok(claims) => claims,
                        Err(e) => return Verdict::deny(format!("invalid access token: {}", e)),
                    },
                    TokenValidator::Introspection(url) => {
                        match introspect(url, token, ctx).await {
                            Ok(info) => info,
                            Err(verdict) => return verdict,
                        }
                    }
                };
                token_info_verdict(info, required_scopes, user_id_attribute)
            }
        }
    }
}

/// Build the authorization endpoint URL a client is redirected to.
pub fn login_url(flow: &RedirectFlow, oidc: bool, original_path: &str) -> Option<String> {
    let mut scopes: Vec<&str> = flow.scopes.iter().map(String::as_str).collect();
    if oidc && !scopes.contains(&"openid") {
        scopes.insert(0, "openid");
    }
    let redirect_uri = format!(
        "{}{}",
        flow.app_url.trim_end_matches('/'),
        flow.callback_path
    );
    let url = Url::parse_with_params(
        &flow.auth_endpoint,
        &[
            ("response_type", "code"),
            ("client_id", flow.client_id.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("scope", scopes.join(" ").as_str()),
            ("state", original_path),
        ],
    )
    .ok()?;
    Some(url.to_string())
}

async fn evaluate_session(flow: &RedirectFlow, oidc: bool, ctx: &CheckContext<'_>) -> Verdict {
    let redirect = || match login_url(flow, oidc, &ctx.request.path) {
        Some(location) => Verdict::redirect(location),
        None => Verdict::error("unable to build login url"),
    };

    let session = match ctx.request.cookie(&flow.session_cookie) {
        Some(session) if !session.is_empty() => session,
        _ => return redirect(),
    };

    let mut call = CallRequest::new(
        Target::Http {
            url: flow.session_validation_url.clone(),
        },
        ctx.timeout,
    );
    call.body = Some(json!({ "session": session }));

    match ctx.client.call(call).await {
        Ok(response) if response.decision == Decision::Allow => {
            let state = response.state.unwrap_or_default();
            let mut verdict = Verdict::allow();
            if let Some(sub) = state.get("sub").and_then(value_to_descriptor) {
                verdict = verdict.with_user_id(sub);
            }
            verdict.with_state(state)
        }
        Ok(response) if response.decision == Decision::Deny => {
            debug!("session rejected, redirecting to login");
            redirect()
        }
        Ok(_) => Verdict::error("session validation failed"),
        Err(e) => Verdict::error(format!("session validation unavailable: {}", e)),
    }
}

async fn introspect(
    url: &str,
    token: &str,
    ctx: &CheckContext<'_>,
) -> std::result::Result<State, Verdict> {
    let mut call = CallRequest::new(Target::Http { url: url.to_string() }, ctx.timeout);
    call.body = Some(json!({ "token": token }));

    match ctx.client.call(call).await {
        Ok(response) => match response.decision {
            Decision::ServerError => Err(Verdict::error("introspection server error")),
            _ => Ok(response.state.unwrap_or_default()),
        },
        Err(e) => Err(Verdict::error(format!("introspection unavailable: {}", e))),
    }
}

fn token_info_verdict(info: State, required_scopes: &[String], user_id_attribute: &str) -> Verdict {
    // Locally validated JWTs carry no `active` field.
    if matches!(info.get("active"), Some(Value::Bool(false)) | Some(Value::Null)) {
        return Verdict::deny("token is not active");
    }

    let granted: Vec<&str> = info
        .get("scope")
        .and_then(Value::as_str)
        .map(|s| s.split_whitespace().collect())
        .unwrap_or_default();
    if let Some(missing) = required_scopes
        .iter()
        .find(|scope| !granted.contains(&scope.as_str()))
    {
        return Verdict::deny(format!("missing scope {}", missing));
    }

    let mut verdict = Verdict::allow();
    if let Some(user_id) = info.get(user_id_attribute).and_then(value_to_descriptor) {
        verdict = verdict.with_user_id(user_id);
    }
    verdict.with_state(info)
}
