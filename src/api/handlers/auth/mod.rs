//! Auth handlers and supporting modules.
//!
//! Sessions, password and passwordless login, OAuth login and rate limiting
//! for the three principal kinds. Every flow is written once and takes a
//! [`PrincipalKind`]; per-kind differences live in [`KindConfig`].
//!
//! ## Token Transport
//!
//! - **Admin:** `HttpOnly`, `SameSite=Strict` cookies (`aidlink_admin_session`,
//!   `aidlink_admin_refresh`), `Secure` when the frontend is HTTPS.
//! - **Sender/Receiver:** `Authorization: Bearer`; tokens are returned in the
//!   response body.
//!
//! ## Lifetimes
//!
//! Access tokens live 1 hour (admin: 15 minutes). Refresh tokens live 1 day, or
//! 7 days with `remember_me`. Refreshing rotates both tokens without extending
//! the refresh expiry.
//!
//! ## Rate Limiting
//!
//! Login, registration, OTP issue/verify, refresh and order creation are
//! limited per client address with fixed windows (see [`RateLimitPolicies`]).

mod error;
pub(crate) mod login;
mod memory;
pub(crate) mod oauth;
pub(crate) mod otp;
pub(crate) mod principal;
mod rate_limit;
pub(crate) mod session;
mod state;
mod storage;
pub(crate) mod types;
mod utils;

pub use error::AuthError;
pub use login::check_credentials;
pub use memory::MemoryStore;
pub use oauth::{IdentityProvider, OAuthClient, OAuthConfig, OAuthIdentity};
pub use otp::{issue_otp, verify_otp, LogOtpSender, OtpSender, OtpVerdict};
pub use principal::{
    require_auth, KindConfig, Principal, PrincipalKind, ProfileField, TokenTransport,
};
pub use rate_limit::{
    FixedWindowRateLimiter, NoopRateLimiter, RateLimitAction, RateLimitDecision,
    RateLimitPolicies, RateLimitPolicy, RateLimiter,
};
pub use session::{
    end_session, issue_session, refresh_session, validate_session, IssuedSession,
};
pub use state::{AuthConfig, AuthState};
pub use storage::{
    AuditEvent, AuthStore, CreateOutcome, Credentials, NewPrincipal, OtpChallenge, PgStore,
    ProfileUpdate, SessionWrite,
};
pub(crate) use login::hash_password_blocking;
pub(crate) use rate_limit::enforce as enforce_rate_limit;
pub(crate) use utils::{
    normalize_email, resolve_client_ip, valid_email, valid_password, CLIENT_IP_HEADER,
};
