//! Password registration and login.
//!
//! Passwords are stored as Argon2id PHC strings. Unknown identifiers and wrong
//! passwords produce the same 401 so callers cannot probe which accounts exist.

use anyhow::Context;
use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::Response,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::{
    error::AuthError,
    principal::{kind_from_path, KindConfig, Principal},
    rate_limit::{self, RateLimitAction},
    session::{issue_session, principal_response, session_response},
    state::AuthState,
    storage::{AuthStore, CreateOutcome, NewPrincipal},
    types::{LoginRequest, PrincipalResponse, RegisterRequest, SessionResponse},
    utils::{
        hash_password, normalize_email, normalize_phone, valid_email, valid_password, valid_phone,
        verify_password, MIN_PASSWORD_LENGTH,
    },
};
use crate::api::error::{respond, ApiError};

pub(crate) const MAX_DISPLAY_NAME_LENGTH: usize = 100;

/// Verified in place of a stored hash for unknown and passwordless accounts, so every
/// failed lookup pays one Argon2 verification with the production parameters.
const DUMMY_PASSWORD_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$YWlkbGluay1kdW1teS1zYQ$\
     17PPox8qyttvrj57YA05y91dAM3XNE4WEgxQzEeuj54";

/// Normalize a login identifier: an email, or a phone number for kinds that allow it.
pub(crate) fn normalize_identifier(config: &KindConfig, raw: &str) -> Result<String, ApiError> {
    let raw = raw.trim();
    if raw.contains('@') || !config.phone_identifier() {
        let email = normalize_email(raw);
        if !valid_email(&email) {
            return Err(ApiError::validation("Invalid email"));
        }
        return Ok(email);
    }
    let phone = normalize_phone(raw);
    if !valid_phone(&phone) {
        return Err(ApiError::validation("Invalid email or phone number"));
    }
    Ok(phone)
}

/// Trimmed display name, `None` when blank.
pub(crate) fn clean_display_name(value: Option<&str>) -> Result<Option<String>, ApiError> {
    let Some(name) = value.map(str::trim).filter(|name| !name.is_empty()) else {
        return Ok(None);
    };
    if name.chars().count() > MAX_DISPLAY_NAME_LENGTH {
        return Err(ApiError::validation("Display name is too long"));
    }
    Ok(Some(name.to_string()))
}

/// Normalized phone number, `None` when blank.
pub(crate) fn clean_phone(value: Option<&str>) -> Result<Option<String>, ApiError> {
    let Some(phone) = value.map(str::trim).filter(|phone| !phone.is_empty()) else {
        return Ok(None);
    };
    let phone = normalize_phone(phone);
    if !valid_phone(&phone) {
        return Err(ApiError::validation("Invalid phone number"));
    }
    Ok(Some(phone))
}

/// Hash on the blocking pool; Argon2 is deliberately slow.
pub(crate) async fn hash_password_blocking(password: String) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .context("password hashing task failed")?
}

/// Verify `identifier`/`password` for `config`'s kind.
///
/// # Errors
/// `InvalidCredentials` for unknown identifiers, passwordless accounts and wrong
/// passwords; `Inactive` for deactivated principals.
pub async fn check_credentials(
    store: &dyn AuthStore,
    config: &KindConfig,
    identifier: &str,
    password: &str,
) -> Result<Principal, AuthError> {
    let credentials = store.find_credentials(config.kind(), identifier).await?;
    let stored_hash = credentials
        .as_ref()
        .and_then(|credentials| credentials.password_hash.clone());
    let has_hash = stored_hash.is_some();
    let hash = stored_hash.unwrap_or_else(|| DUMMY_PASSWORD_HASH.to_string());

    let password = password.to_string();
    let matches = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .context("password verification task failed")??;
    let Some(credentials) = credentials.filter(|_| has_hash && matches) else {
        return Err(AuthError::InvalidCredentials);
    };
    if !credentials.principal.is_active {
        return Err(AuthError::Inactive);
    }
    Ok(credentials.principal)
}

#[utoipa::path(
    post,
    path = "/v1/auth/{kind}/register",
    params(("kind" = String, Path, description = "sender or receiver")),
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Principal created", body = PrincipalResponse),
        (status = 400, description = "Invalid input"),
        (status = 403, description = "Self-registration not allowed for this kind"),
        (status = 409, description = "Identifier already registered"),
        (status = 429, description = "Rate limited")
    ),
    tag = "auth"
)]
pub async fn register(
    Path(kind): Path<String>,
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
    payload: Option<Json<RegisterRequest>>,
) -> Result<Response, ApiError> {
    let kind = kind_from_path(&kind)?;
    let config = auth_state.config().kind(kind);
    if !config.self_registration() {
        return Err(ApiError::Forbidden(format!(
            "Self-registration is not allowed for {kind} accounts"
        )));
    }
    rate_limit::enforce(&auth_state, &headers, RateLimitAction::Register).await?;

    let Some(Json(request)) = payload else {
        return Err(ApiError::validation("Missing payload"));
    };
    let identifier = normalize_identifier(config, &request.identifier)?;
    if !valid_password(&request.password) {
        return Err(ApiError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    let display_name = clean_display_name(request.display_name.as_deref())?;
    let mut phone = clean_phone(request.phone.as_deref())?;
    if phone.is_none() && config.phone_identifier() && !identifier.contains('@') {
        phone = Some(identifier.clone());
    }

    let password_hash = hash_password_blocking(request.password).await?;
    let now = Utc::now();
    let new = NewPrincipal {
        identifier,
        display_name,
        phone,
        password_hash: Some(password_hash),
    };
    let principal = match auth_state.store().create_principal(kind, new, now).await? {
        CreateOutcome::Created(principal) => principal,
        CreateOutcome::Conflict => {
            return Err(ApiError::Conflict("Account already exists".to_string()));
        }
    };

    info!(kind = %kind, principal_id = %principal.id, "principal registered");
    auth_state
        .audit(&headers, Some(kind), Some(principal.id), "register", now)
        .await;
    Ok(respond(
        StatusCode::CREATED,
        principal_response(config, principal),
    ))
}

#[utoipa::path(
    post,
    path = "/v1/auth/{kind}/login",
    params(("kind" = String, Path, description = "sender, receiver or admin")),
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session issued", body = SessionResponse),
        (status = 400, description = "Invalid input"),
        (status = 401, description = "Invalid credentials"),
        (status = 403, description = "Account is inactive"),
        (status = 429, description = "Rate limited")
    ),
    tag = "auth"
)]
pub async fn login(
    Path(kind): Path<String>,
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
    payload: Option<Json<LoginRequest>>,
) -> Result<Response, ApiError> {
    let kind = kind_from_path(&kind)?;
    rate_limit::enforce(&auth_state, &headers, RateLimitAction::Login).await?;

    let Some(Json(request)) = payload else {
        return Err(ApiError::validation("Missing payload"));
    };
    let config = auth_state.config().kind(kind);
    let identifier = normalize_identifier(config, &request.identifier)?;
    if request.password.is_empty() {
        return Err(ApiError::validation("Password is required"));
    }

    let principal =
        check_credentials(auth_state.store(), config, &identifier, &request.password).await?;
    let now = Utc::now();
    let issued = issue_session(
        auth_state.store(),
        config,
        &principal,
        request.remember_me,
        now,
    )
    .await?;

    info!(kind = %kind, principal_id = %principal.id, "login succeeded");
    auth_state
        .audit(&headers, Some(kind), Some(principal.id), "login", now)
        .await;
    session_response(auth_state.config(), config, issued, StatusCode::OK, now)
}
