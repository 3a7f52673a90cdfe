//! OAuth sender login and profile completion.
//!
//! The callback exchanges an authorization code at the provider's token
//! endpoint, reads the userinfo document, finds or creates the sender for the
//! returned email and issues a session. Providers often omit the fields a kind
//! requires, so responses carry `profile_complete` and the missing fields; the
//! client fills them through `PUT /v1/auth/{kind}/profile`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::Response,
    Json,
};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info_span, warn, Instrument};
use url::Url;

use super::{
    login::{clean_display_name, clean_phone},
    otp::find_or_create_sender,
    principal::{kind_from_path, require_auth, PrincipalKind},
    rate_limit::{self, RateLimitAction},
    session::{issue_session, principal_response, session_response},
    state::AuthState,
    storage::ProfileUpdate,
    types::{OAuthCallbackRequest, PrincipalResponse, ProfileRequest, SessionResponse},
    utils::{normalize_email, valid_email},
};
use crate::{api::error::respond, api::error::ApiError, APP_USER_AGENT};

/// Identity returned by the provider for an authorization code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OAuthIdentity {
    pub email: String,
    pub name: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchange `code` for the user's identity.
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<OAuthIdentity>;

    /// Redirect URI used when the client does not send one.
    fn default_redirect_uri(&self) -> &str;
}

#[derive(Clone, Debug)]
pub struct OAuthConfig {
    client_id: String,
    client_secret: SecretString,
    token_url: Url,
    userinfo_url: Url,
    redirect_uri: String,
}

impl OAuthConfig {
    #[must_use]
    pub fn new(
        client_id: String,
        client_secret: SecretString,
        token_url: Url,
        userinfo_url: Url,
        redirect_uri: String,
    ) -> Self {
        Self {
            client_id,
            client_secret,
            token_url,
            userinfo_url,
            redirect_uri,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct UserInfo {
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<bool>,
    #[serde(default)]
    name: Option<String>,
}

/// Authorization-code client for a standard OAuth 2.0 / OIDC provider.
#[derive(Clone, Debug)]
pub struct OAuthClient {
    client: reqwest::Client,
    config: OAuthConfig,
}

impl OAuthClient {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: OAuthConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build OAuth HTTP client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl IdentityProvider for OAuthClient {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<OAuthIdentity> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
        ];
        let token: TokenResponse = self
            .client
            .post(self.config.token_url.clone())
            .form(&form)
            .send()
            .instrument(info_span!("oauth.token", url = %self.config.token_url))
            .await
            .context("token request failed")?
            .error_for_status()
            .context("token endpoint rejected the code")?
            .json()
            .await
            .context("invalid token response")?;

        let info: UserInfo = self
            .client
            .get(self.config.userinfo_url.clone())
            .bearer_auth(&token.access_token)
            .send()
            .instrument(info_span!("oauth.userinfo", url = %self.config.userinfo_url))
            .await
            .context("userinfo request failed")?
            .error_for_status()
            .context("userinfo endpoint rejected the token")?
            .json()
            .await
            .context("invalid userinfo response")?;

        if info.email_verified == Some(false) {
            return Err(anyhow!("provider reports an unverified email"));
        }
        let email = info
            .email
            .map(|email| normalize_email(&email))
            .filter(|email| valid_email(email))
            .ok_or_else(|| anyhow!("provider returned no usable email"))?;
        Ok(OAuthIdentity {
            email,
            name: info.name,
        })
    }

    fn default_redirect_uri(&self) -> &str {
        &self.config.redirect_uri
    }
}

#[utoipa::path(
    post,
    path = "/v1/oauth/callback",
    request_body = OAuthCallbackRequest,
    responses(
        (status = 200, description = "Session issued", body = SessionResponse),
        (status = 400, description = "Invalid input"),
        (status = 401, description = "Code exchange failed"),
        (status = 404, description = "OAuth login is not configured"),
        (status = 429, description = "Too many login attempts")
    ),
    tag = "oauth"
)]
pub async fn oauth_callback(
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
    payload: Option<Json<OAuthCallbackRequest>>,
) -> Result<Response, ApiError> {
    let Some(provider) = auth_state.identity_provider() else {
        return Err(ApiError::NotFound("OAuth login is not configured".to_string()));
    };
    rate_limit::enforce(&auth_state, &headers, RateLimitAction::Login).await?;
    let Some(Json(request)) = payload else {
        return Err(ApiError::validation("Missing payload"));
    };
    let code = request.code.trim();
    if code.is_empty() {
        return Err(ApiError::validation("Authorization code is required"));
    }
    let redirect_uri = request
        .redirect_uri
        .as_deref()
        .unwrap_or_else(|| provider.default_redirect_uri());

    let identity = match provider.exchange_code(code, redirect_uri).await {
        Ok(identity) => identity,
        Err(err) => {
            warn!("OAuth code exchange failed: {err:#}");
            return Err(ApiError::Unauthenticated(
                "OAuth code exchange failed".to_string(),
            ));
        }
    };

    let now = Utc::now();
    let display_name = clean_display_name(identity.name.as_deref()).unwrap_or(None);
    let principal =
        find_or_create_sender(auth_state.store(), &identity.email, display_name, now).await?;
    let config = auth_state.config().kind(PrincipalKind::Sender);
    let issued = issue_session(
        auth_state.store(),
        config,
        &principal,
        request.remember_me,
        now,
    )
    .await?;

    auth_state
        .audit(
            &headers,
            Some(PrincipalKind::Sender),
            Some(principal.id),
            "oauth_login",
            now,
        )
        .await;
    session_response(auth_state.config(), config, issued, StatusCode::OK, now)
}

#[utoipa::path(
    put,
    path = "/v1/auth/{kind}/profile",
    params(("kind" = String, Path, description = "sender, receiver or admin")),
    request_body = ProfileRequest,
    responses(
        (status = 200, description = "Profile updated", body = PrincipalResponse),
        (status = 400, description = "Invalid input"),
        (status = 401, description = "Not authenticated")
    ),
    tag = "auth"
)]
pub async fn update_profile(
    Path(kind): Path<String>,
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
    payload: Option<Json<ProfileRequest>>,
) -> Result<Response, ApiError> {
    let kind = kind_from_path(&kind)?;
    let principal = require_auth(&headers, &auth_state, kind).await?;
    let Some(Json(request)) = payload else {
        return Err(ApiError::validation("Missing payload"));
    };
    let update = ProfileUpdate {
        display_name: clean_display_name(request.display_name.as_deref())?,
        phone: clean_phone(request.phone.as_deref())?,
    };
    if update.display_name.is_none() && update.phone.is_none() {
        return Err(ApiError::validation("Nothing to update"));
    }

    let Some(updated) = auth_state
        .store()
        .update_profile(kind, principal.id, &update)
        .await?
    else {
        return Err(ApiError::NotFound("Principal not found".to_string()));
    };
    auth_state
        .audit(&headers, Some(kind), Some(updated.id), "profile_update", Utc::now())
        .await;
    let config = auth_state.config().kind(kind);
    Ok(respond(StatusCode::OK, principal_response(config, updated)))
}
