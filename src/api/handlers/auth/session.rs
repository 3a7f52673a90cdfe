//! Session issuance, validation, refresh and logout for every principal kind.
//!
//! A session is the pair (access token, optional refresh token). Only SHA-256
//! hashes and absolute expiries are persisted, on the principal's own row, so a
//! new login replaces any earlier session and logout makes the old tokens fail
//! on their next validation.
//!
//! Tokens carry their kind's prefix. A token whose prefix belongs to another
//! kind is rejected before any storage lookup.

use anyhow::anyhow;
use axum::{
    extract::{Extension, Path},
    http::{
        header::{InvalidHeaderValue, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use super::{
    error::AuthError,
    principal::{kind_from_path, require_auth, KindConfig, Principal, TokenTransport},
    rate_limit::{self, RateLimitAction},
    state::{AuthConfig, AuthState},
    storage::{AuthStore, SessionWrite},
    types::{LogoutResponse, PrincipalResponse, RefreshRequest, SessionResponse},
    utils::{expires_after, extract_bearer_token, extract_cookie, generate_token, hash_token},
};
use crate::api::error::{respond, ApiError, Envelope};

pub(crate) const REFRESH_TTL_SECONDS: i64 = 24 * 60 * 60;
pub(crate) const REMEMBER_ME_REFRESH_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Freshly minted tokens. Raw values only live here and in the response.
#[derive(Clone, Debug)]
pub struct IssuedSession {
    pub principal: Principal,
    pub access_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_token: Option<String>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

/// Issue a new session for an authenticated principal, replacing any previous one.
///
/// # Errors
/// `Inactive` for deactivated principals, `Storage` when persisting fails.
pub async fn issue_session(
    store: &dyn AuthStore,
    config: &KindConfig,
    principal: &Principal,
    remember_me: bool,
    now: DateTime<Utc>,
) -> Result<IssuedSession, AuthError> {
    if !principal.is_active {
        return Err(AuthError::Inactive);
    }
    let refresh_ttl = if remember_me {
        REMEMBER_ME_REFRESH_TTL_SECONDS
    } else {
        REFRESH_TTL_SECONDS
    };
    let refresh_expires_at = if config.issues_refresh() {
        Some(expires_after(now, refresh_ttl)?)
    } else {
        None
    };
    persist(store, config, principal, refresh_expires_at, Some(now), now).await
}

/// Resolve an access token into its principal.
///
/// # Errors
/// `InvalidSession` when the token is malformed, of another kind, unknown,
/// expired, or belongs to an inactive principal.
pub async fn validate_session(
    store: &dyn AuthStore,
    config: &KindConfig,
    token: &str,
    now: DateTime<Utc>,
) -> Result<Principal, AuthError> {
    if !token.starts_with(config.access_prefix()) {
        return Err(AuthError::InvalidSession);
    }
    store
        .principal_by_access_hash(config.kind(), &hash_token(token), now)
        .await?
        .ok_or(AuthError::InvalidSession)
}

/// Rotate both tokens using a live refresh token. The refresh expiry is kept.
///
/// # Errors
/// `InvalidSession` when the kind issues no refresh tokens or the token is not live.
pub async fn refresh_session(
    store: &dyn AuthStore,
    config: &KindConfig,
    refresh_token: &str,
    now: DateTime<Utc>,
) -> Result<IssuedSession, AuthError> {
    if !config.issues_refresh() || !refresh_token.starts_with(config.refresh_prefix()) {
        return Err(AuthError::InvalidSession);
    }
    let Some((principal, refresh_expires_at)) = store
        .principal_by_refresh_hash(config.kind(), &hash_token(refresh_token), now)
        .await?
    else {
        return Err(AuthError::InvalidSession);
    };
    persist(store, config, &principal, Some(refresh_expires_at), None, now).await
}

/// Clear the session owning `token` (access or refresh). Returns the principal
/// whose session was cleared, or `None` when the token resolves to nothing.
///
/// # Errors
/// `Storage` when the lookup or the update fails.
pub async fn end_session(
    store: &dyn AuthStore,
    config: &KindConfig,
    token: &str,
    now: DateTime<Utc>,
) -> Result<Option<Principal>, AuthError> {
    let hash = hash_token(token);
    let principal = if token.starts_with(config.refresh_prefix()) {
        store
            .principal_by_refresh_hash(config.kind(), &hash, now)
            .await?
            .map(|(principal, _)| principal)
    } else if token.starts_with(config.access_prefix()) {
        store
            .principal_by_access_hash(config.kind(), &hash, now)
            .await?
    } else {
        None
    };
    if let Some(principal) = &principal {
        store.clear_session(config.kind(), principal.id).await?;
    }
    Ok(principal)
}

async fn persist(
    store: &dyn AuthStore,
    config: &KindConfig,
    principal: &Principal,
    refresh_expires_at: Option<DateTime<Utc>>,
    login_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<IssuedSession, AuthError> {
    let access_token = generate_token(config.access_prefix())?;
    let refresh_token = match refresh_expires_at {
        Some(_) => Some(generate_token(config.refresh_prefix())?),
        None => None,
    };
    let access_expires_at = expires_after(now, config.access_ttl_seconds())?;
    let write = SessionWrite {
        access_hash: hash_token(&access_token),
        access_expires_at,
        refresh_hash: refresh_token.as_deref().map(hash_token),
        refresh_expires_at,
        login_at,
    };
    // The row update only matches active principals.
    let Some(principal) = store
        .write_session(config.kind(), principal.id, &write)
        .await?
    else {
        return Err(AuthError::Inactive);
    };
    Ok(IssuedSession {
        principal,
        access_token,
        access_expires_at,
        refresh_token,
        refresh_expires_at,
    })
}

/// Access token presented by the request, per the kind's transport.
pub(crate) fn extract_access_token(headers: &HeaderMap, config: &KindConfig) -> Option<String> {
    match config.transport() {
        TokenTransport::Bearer => extract_bearer_token(headers),
        TokenTransport::Cookie => extract_cookie(headers, &config.session_cookie_name()),
    }
}

fn cookie(
    name: &str,
    value: &str,
    max_age: i64,
    secure: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie =
        format!("{name}={value}; Path=/; HttpOnly; SameSite=Strict; Max-Age={max_age}");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// `Set-Cookie` values for an issued session; `Max-Age` counts down to each expiry.
pub(crate) fn session_cookies(
    auth_config: &AuthConfig,
    config: &KindConfig,
    issued: &IssuedSession,
    now: DateTime<Utc>,
) -> Result<Vec<HeaderValue>, InvalidHeaderValue> {
    let secure = auth_config.session_cookie_secure();
    let mut cookies = vec![cookie(
        &config.session_cookie_name(),
        &issued.access_token,
        (issued.access_expires_at - now).num_seconds().max(0),
        secure,
    )?];
    if let (Some(token), Some(expires_at)) = (&issued.refresh_token, issued.refresh_expires_at) {
        cookies.push(cookie(
            &config.refresh_cookie_name(),
            token,
            (expires_at - now).num_seconds().max(0),
            secure,
        )?);
    }
    Ok(cookies)
}

fn clear_session_cookies(
    auth_config: &AuthConfig,
    config: &KindConfig,
) -> Result<Vec<HeaderValue>, InvalidHeaderValue> {
    let secure = auth_config.session_cookie_secure();
    Ok(vec![
        cookie(&config.session_cookie_name(), "", 0, secure)?,
        cookie(&config.refresh_cookie_name(), "", 0, secure)?,
    ])
}

fn cookie_error(err: InvalidHeaderValue) -> ApiError {
    ApiError::Internal(anyhow!("failed to build session cookie: {err}"))
}

/// Render an issued session: tokens in the body for bearer kinds, in cookies otherwise.
pub(crate) fn session_response(
    auth_config: &AuthConfig,
    config: &KindConfig,
    issued: IssuedSession,
    status: StatusCode,
    now: DateTime<Utc>,
) -> Result<Response, ApiError> {
    let mut headers = HeaderMap::new();
    let bearer = config.transport() == TokenTransport::Bearer;
    if !bearer {
        for value in session_cookies(auth_config, config, &issued, now).map_err(cookie_error)? {
            headers.append(SET_COOKIE, value);
        }
    }
    let missing_fields = issued.principal.missing_fields(config);
    let body = SessionResponse {
        profile_complete: missing_fields.is_empty(),
        missing_fields,
        principal: issued.principal,
        access_token: bearer.then_some(issued.access_token),
        access_expires_at: issued.access_expires_at,
        refresh_token: issued.refresh_token.filter(|_| bearer),
        refresh_expires_at: issued.refresh_expires_at,
    };
    Ok((status, headers, Json(Envelope::ok(body))).into_response())
}

pub(crate) fn principal_response(config: &KindConfig, principal: Principal) -> PrincipalResponse {
    let missing_fields = principal.missing_fields(config);
    PrincipalResponse {
        profile_complete: missing_fields.is_empty(),
        missing_fields,
        principal,
    }
}

#[utoipa::path(
    get,
    path = "/v1/auth/{kind}/session",
    params(("kind" = String, Path, description = "sender, receiver or admin")),
    responses(
        (status = 200, description = "Session is active", body = PrincipalResponse),
        (status = 401, description = "Missing, invalid or expired session"),
        (status = 404, description = "Unknown principal kind")
    ),
    tag = "auth"
)]
pub async fn session(
    Path(kind): Path<String>,
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
) -> Result<Response, ApiError> {
    let kind = kind_from_path(&kind)?;
    let principal = require_auth(&headers, &auth_state, kind).await?;
    let config = auth_state.config().kind(kind);
    Ok(respond(StatusCode::OK, principal_response(config, principal)))
}

#[utoipa::path(
    post,
    path = "/v1/auth/{kind}/refresh",
    params(("kind" = String, Path, description = "sender, receiver or admin")),
    request_body(content = RefreshRequest, description = "Refresh token (bearer kinds)"),
    responses(
        (status = 200, description = "Tokens rotated", body = SessionResponse),
        (status = 401, description = "Invalid or expired refresh token"),
        (status = 429, description = "Rate limited")
    ),
    tag = "auth"
)]
pub async fn refresh(
    Path(kind): Path<String>,
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
    payload: Option<Json<RefreshRequest>>,
) -> Result<Response, ApiError> {
    let kind = kind_from_path(&kind)?;
    rate_limit::enforce(&auth_state, &headers, RateLimitAction::Refresh).await?;

    let config = auth_state.config().kind(kind);
    let token = match config.transport() {
        TokenTransport::Cookie => extract_cookie(&headers, &config.refresh_cookie_name()),
        TokenTransport::Bearer => payload.and_then(|Json(request)| request.refresh_token),
    };
    let Some(token) = token else {
        return Err(AuthError::InvalidSession.into());
    };

    let now = Utc::now();
    let issued = refresh_session(auth_state.store(), config, token.trim(), now).await?;
    session_response(auth_state.config(), config, issued, StatusCode::OK, now)
}

#[utoipa::path(
    post,
    path = "/v1/auth/{kind}/logout",
    params(("kind" = String, Path, description = "sender, receiver or admin")),
    responses(
        (status = 200, description = "Session cleared", body = LogoutResponse)
    ),
    tag = "auth"
)]
pub async fn logout(
    Path(kind): Path<String>,
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
) -> Result<Response, ApiError> {
    let kind = kind_from_path(&kind)?;
    let config = auth_state.config().kind(kind);
    let token = extract_access_token(&headers, config).or_else(|| {
        (config.transport() == TokenTransport::Cookie)
            .then(|| extract_cookie(&headers, &config.refresh_cookie_name()))
            .flatten()
    });

    let now = Utc::now();
    let mut cleared = None;
    if let Some(token) = token {
        cleared = end_session(auth_state.store(), config, &token, now).await?;
    }
    if let Some(principal) = &cleared {
        info!(kind = %kind, principal_id = %principal.id, "session cleared");
        auth_state
            .audit(&headers, Some(kind), Some(principal.id), "logout", now)
            .await;
    }

    // Cookies are cleared even when no stored session matched.
    let mut response_headers = HeaderMap::new();
    if config.transport() == TokenTransport::Cookie {
        for value in clear_session_cookies(auth_state.config(), config).map_err(cookie_error)? {
            response_headers.append(SET_COOKIE, value);
        }
    }
    let body = LogoutResponse {
        logged_out: cleared.is_some(),
    };
    Ok((StatusCode::OK, response_headers, Json(Envelope::ok(body))).into_response())
}
