//! Passwordless sender login with one-time codes.
//!
//! A challenge is keyed by email and holds the SHA-256 of a 6-digit code, its
//! expiry and a failed-attempt counter. Only a matching code presented strictly
//! before expiry verifies, and it verifies once: the challenge is deleted with a
//! compare-and-delete so concurrent verifications cannot both succeed. Wrong
//! codes leave the challenge usable until `otp_max_attempts` failures.

use anyhow::Result;
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::Response,
    Json,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    error::AuthError,
    principal::{Principal, PrincipalKind},
    rate_limit::{self, RateLimitAction},
    session::{issue_session, session_response},
    state::{AuthConfig, AuthState},
    storage::{AuthStore, CreateOutcome, NewPrincipal, OtpChallenge},
    types::{OtpIssuedResponse, OtpRequest, OtpVerifyRequest, SessionResponse},
    utils::{
        expires_after, generate_otp_code, hash_token, normalize_email, valid_email,
        valid_otp_code,
    },
};
use crate::api::error::{respond, ApiError};

/// Delivery channel for one-time codes.
pub trait OtpSender: Send + Sync {
    /// Deliver `code` to `email` or return an error to fail the request.
    fn send(&self, email: &str, code: &str, expires_at: DateTime<Utc>) -> Result<()>;
}

/// Local dev sender that logs the code instead of emailing it.
#[derive(Clone, Debug)]
pub struct LogOtpSender;

impl OtpSender for LogOtpSender {
    fn send(&self, email: &str, code: &str, expires_at: DateTime<Utc>) -> Result<()> {
        info!(
            to_email = %email,
            code = %code,
            expires_at = %expires_at,
            "otp delivery stub"
        );
        Ok(())
    }
}

/// Outcome of a verification attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OtpVerdict {
    Verified,
    /// Wrong code; the challenge stays usable for `remaining` more failures.
    Mismatch { remaining: u32 },
    Expired,
    /// Too many wrong codes; the challenge was discarded.
    Exhausted,
    /// No challenge for this email (never issued, or already used).
    Missing,
}

/// Create a challenge for `email`, replacing any earlier one. Returns the raw code.
///
/// # Errors
/// Returns an error when storing the challenge fails.
pub async fn issue_otp(
    store: &dyn AuthStore,
    config: &AuthConfig,
    email: &str,
    now: DateTime<Utc>,
) -> Result<(String, DateTime<Utc>)> {
    let code = generate_otp_code();
    let expires_at = expires_after(now, config.otp_ttl_seconds())?;
    store
        .put_otp(&OtpChallenge {
            email: email.to_string(),
            code_hash: hash_token(&code),
            created_at: now,
            expires_at,
            failed_attempts: 0,
        })
        .await?;
    Ok((code, expires_at))
}

/// Check `code` against the challenge for `email`.
///
/// # Errors
/// Returns an error on storage failure.
pub async fn verify_otp(
    store: &dyn AuthStore,
    config: &AuthConfig,
    email: &str,
    code: &str,
    now: DateTime<Utc>,
) -> Result<OtpVerdict> {
    let Some(challenge) = store.get_otp(email).await? else {
        return Ok(OtpVerdict::Missing);
    };
    if now >= challenge.expires_at {
        store.delete_otp(email).await?;
        return Ok(OtpVerdict::Expired);
    }
    if challenge.failed_attempts >= config.otp_max_attempts() {
        store.delete_otp(email).await?;
        return Ok(OtpVerdict::Exhausted);
    }

    let code_hash = hash_token(code);
    if code_hash == challenge.code_hash {
        // Only the caller that deletes the row wins.
        if store.take_otp(email, &code_hash).await? {
            return Ok(OtpVerdict::Verified);
        }
        return Ok(OtpVerdict::Missing);
    }

    let failures = store.record_otp_failure(email).await?;
    if failures >= config.otp_max_attempts() {
        store.delete_otp(email).await?;
        return Ok(OtpVerdict::Exhausted);
    }
    Ok(OtpVerdict::Mismatch {
        remaining: config.otp_max_attempts() - failures,
    })
}

/// Load the sender for a verified email, creating it on first login.
pub(super) async fn find_or_create_sender(
    store: &dyn AuthStore,
    email: &str,
    display_name: Option<String>,
    now: DateTime<Utc>,
) -> Result<Principal, AuthError> {
    if let Some(credentials) = store.find_credentials(PrincipalKind::Sender, email).await? {
        return Ok(credentials.principal);
    }
    let new = NewPrincipal {
        identifier: email.to_string(),
        display_name,
        ..NewPrincipal::default()
    };
    match store
        .create_principal(PrincipalKind::Sender, new, now)
        .await?
    {
        CreateOutcome::Created(principal) => {
            info!(principal_id = %principal.id, "sender created on first passwordless login");
            Ok(principal)
        }
        // Lost a race with a concurrent first login.
        CreateOutcome::Conflict => store
            .find_credentials(PrincipalKind::Sender, email)
            .await?
            .map(|credentials| credentials.principal)
            .ok_or(AuthError::InvalidCredentials),
    }
}

fn email_from(raw: &str) -> Result<String, ApiError> {
    let email = normalize_email(raw);
    if valid_email(&email) {
        Ok(email)
    } else {
        Err(ApiError::validation("Invalid email"))
    }
}

#[utoipa::path(
    post,
    path = "/v1/otp/request",
    request_body = OtpRequest,
    responses(
        (status = 200, description = "Code issued", body = OtpIssuedResponse),
        (status = 400, description = "Invalid email"),
        (status = 429, description = "Rate limited")
    ),
    tag = "otp"
)]
pub async fn request_otp(
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
    payload: Option<Json<OtpRequest>>,
) -> Result<Response, ApiError> {
    rate_limit::enforce(&auth_state, &headers, RateLimitAction::OtpSend).await?;
    let Some(Json(request)) = payload else {
        return Err(ApiError::validation("Missing payload"));
    };
    let email = email_from(&request.email)?;

    let now = Utc::now();
    let (code, expires_at) = issue_otp(auth_state.store(), auth_state.config(), &email, now).await?;
    auth_state.otp_sender().send(&email, &code, expires_at)?;

    auth_state
        .audit(&headers, Some(PrincipalKind::Sender), None, "otp_request", now)
        .await;
    Ok(respond(StatusCode::OK, OtpIssuedResponse { expires_at }))
}

#[utoipa::path(
    post,
    path = "/v1/otp/verify",
    request_body = OtpVerifyRequest,
    responses(
        (status = 200, description = "Code verified, session issued", body = SessionResponse),
        (status = 400, description = "Invalid input"),
        (status = 401, description = "Wrong, expired or used code"),
        (status = 429, description = "Rate limited")
    ),
    tag = "otp"
)]
pub async fn verify_otp_login(
    headers: HeaderMap,
    Extension(auth_state): Extension<Arc<AuthState>>,
    payload: Option<Json<OtpVerifyRequest>>,
) -> Result<Response, ApiError> {
    rate_limit::enforce(&auth_state, &headers, RateLimitAction::OtpVerify).await?;
    let Some(Json(request)) = payload else {
        return Err(ApiError::validation("Missing payload"));
    };
    let email = email_from(&request.email)?;
    let code = request.code.trim();
    if !valid_otp_code(code) {
        return Err(ApiError::validation("Code must be 6 digits"));
    }

    let now = Utc::now();
    let verdict = verify_otp(auth_state.store(), auth_state.config(), &email, code, now).await?;
    let message = match verdict {
        OtpVerdict::Verified => None,
        OtpVerdict::Mismatch { remaining } => {
            warn!(remaining, "otp mismatch");
            Some("Invalid code")
        }
        OtpVerdict::Expired => Some("Code expired"),
        OtpVerdict::Exhausted => Some("Too many failed attempts"),
        OtpVerdict::Missing => Some("No active code for this email"),
    };
    if let Some(message) = message {
        return Err(ApiError::Unauthenticated(message.to_string()));
    }

    let config = auth_state.config().kind(PrincipalKind::Sender);
    let principal = find_or_create_sender(auth_state.store(), &email, None, now).await?;
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
            "otp_login",
            now,
        )
        .await;
    session_response(auth_state.config(), config, issued, StatusCode::OK, now)
}
