//! Principal kinds, the per-kind configuration record, and authenticated
//! principal extraction.
//!
//! Flow Overview: every flow (login, refresh, logout, validation) is written
//! once and parameterized by [`PrincipalKind`]. The differences between kinds
//! (table, token prefix, lifetimes, transport, required profile fields) live in
//! [`KindConfig`].

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{error::AuthError, session, state::AuthState};
use crate::api::error::ApiError;

const DEFAULT_ACCESS_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_ADMIN_ACCESS_TTL_SECONDS: i64 = 15 * 60;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    /// Donor contributing money or goods.
    Sender,
    /// Recipient requesting aid.
    Receiver,
    /// Platform administrator.
    Admin,
}

impl PrincipalKind {
    pub const ALL: [Self; 3] = [Self::Sender, Self::Receiver, Self::Admin];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sender => "sender",
            Self::Receiver => "receiver",
            Self::Admin => "admin",
        }
    }

    /// Storage table holding this kind's principals and their session state.
    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::Sender => "senders",
            Self::Receiver => "receivers",
            Self::Admin => "admins",
        }
    }

    const fn token_prefix(self) -> &'static str {
        match self {
            Self::Sender => "snd_",
            Self::Receiver => "rcv_",
            Self::Admin => "adm_",
        }
    }

    const fn refresh_prefix(self) -> &'static str {
        match self {
            Self::Sender => "sndr_",
            Self::Receiver => "rcvr_",
            Self::Admin => "admr_",
        }
    }
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrincipalKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sender" => Ok(Self::Sender),
            "receiver" => Ok(Self::Receiver),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown principal kind: {other}")),
        }
    }
}

/// Parse a `{kind}` path segment; unknown kinds are a 404, not a 400.
pub(crate) fn kind_from_path(segment: &str) -> Result<PrincipalKind, ApiError> {
    segment
        .parse()
        .map_err(|_| ApiError::NotFound("Unknown principal kind".to_string()))
}

/// How a kind's tokens travel between client and server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenTransport {
    /// `Authorization: Bearer <token>`; tokens are returned in the response body.
    Bearer,
    /// `HttpOnly` cookies; tokens never appear in the response body.
    Cookie,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProfileField {
    DisplayName,
    Phone,
}

/// Per-kind knobs for the shared session flows.
#[derive(Clone, Debug)]
pub struct KindConfig {
    kind: PrincipalKind,
    access_ttl_seconds: i64,
    issues_refresh: bool,
    transport: TokenTransport,
    required_fields: &'static [ProfileField],
    self_registration: bool,
    phone_identifier: bool,
}

impl KindConfig {
    #[must_use]
    pub fn defaults(kind: PrincipalKind) -> Self {
        match kind {
            PrincipalKind::Sender => Self {
                kind,
                access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
                issues_refresh: true,
                transport: TokenTransport::Bearer,
                required_fields: &[ProfileField::DisplayName],
                self_registration: true,
                phone_identifier: false,
            },
            PrincipalKind::Receiver => Self {
                kind,
                access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
                issues_refresh: true,
                transport: TokenTransport::Bearer,
                required_fields: &[ProfileField::DisplayName, ProfileField::Phone],
                self_registration: true,
                phone_identifier: true,
            },
            PrincipalKind::Admin => Self {
                kind,
                access_ttl_seconds: DEFAULT_ADMIN_ACCESS_TTL_SECONDS,
                issues_refresh: true,
                transport: TokenTransport::Cookie,
                required_fields: &[],
                self_registration: false,
                phone_identifier: false,
            },
        }
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_tokens(mut self, enabled: bool) -> Self {
        self.issues_refresh = enabled;
        self
    }

    #[must_use]
    pub fn kind(&self) -> PrincipalKind {
        self.kind
    }

    #[must_use]
    pub fn table(&self) -> &'static str {
        self.kind.table()
    }

    #[must_use]
    pub fn access_prefix(&self) -> &'static str {
        self.kind.token_prefix()
    }

    #[must_use]
    pub fn refresh_prefix(&self) -> &'static str {
        self.kind.refresh_prefix()
    }

    #[must_use]
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    #[must_use]
    pub fn issues_refresh(&self) -> bool {
        self.issues_refresh
    }

    #[must_use]
    pub fn transport(&self) -> TokenTransport {
        self.transport
    }

    #[must_use]
    pub fn required_fields(&self) -> &'static [ProfileField] {
        self.required_fields
    }

    #[must_use]
    pub fn self_registration(&self) -> bool {
        self.self_registration
    }

    /// Receivers may register with a phone number instead of an email.
    #[must_use]
    pub fn phone_identifier(&self) -> bool {
        self.phone_identifier
    }

    pub(crate) fn session_cookie_name(&self) -> String {
        format!("aidlink_{}_session", self.kind)
    }

    pub(crate) fn refresh_cookie_name(&self) -> String {
        format!("aidlink_{}_refresh", self.kind)
    }
}

/// Identity record shared by all kinds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Principal {
    pub id: Uuid,
    pub kind: PrincipalKind,
    /// Normalized email, or phone number for receivers.
    pub identifier: String,
    pub display_name: Option<String>,
    pub phone: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl Principal {
    /// Profile fields the kind requires that are still empty.
    #[must_use]
    pub fn missing_fields(&self, config: &KindConfig) -> Vec<ProfileField> {
        config
            .required_fields()
            .iter()
            .copied()
            .filter(|field| {
                let value = match field {
                    ProfileField::DisplayName => self.display_name.as_deref(),
                    ProfileField::Phone => self.phone.as_deref(),
                };
                value.map_or(true, |v| v.trim().is_empty())
            })
            .collect()
    }
}

/// Resolve the request's token for `kind` into a principal, or 401.
///
/// # Errors
/// `Unauthenticated` for missing/invalid tokens, `Internal` on storage failure.
pub async fn require_auth(
    headers: &HeaderMap,
    auth_state: &AuthState,
    kind: PrincipalKind,
) -> Result<Principal, ApiError> {
    let config = auth_state.config().kind(kind);
    let Some(token) = session::extract_access_token(headers, config) else {
        return Err(AuthError::InvalidSession.into());
    };
    session::validate_session(auth_state.store(), config, &token, Utc::now())
        .await
        .map_err(ApiError::from)
}
