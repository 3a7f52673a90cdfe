//! # Aidlink (donation platform session authority)
//!
//! `aidlink` owns identities and sessions for the three principal kinds of the
//! donation platform: donors (senders), aid recipients (receivers) and
//! administrators. It also runs passwordless OTP login for senders, per-client
//! rate limiting, and payment order creation and signature verification.
//!
//! ## Principal kinds
//!
//! Every kind has its own table and a small [`api::handlers::auth::KindConfig`]
//! record (token prefix, access TTL, transport, required profile fields). The
//! flows are written once and parameterized by [`api::handlers::auth::PrincipalKind`].
//!
//! - **Admin** tokens travel in `HttpOnly` cookies.
//! - **Sender/Receiver** tokens travel in the `Authorization: Bearer` header.
//!
//! ## Sessions
//!
//! A principal has at most one authoritative session, stored on its own row as
//! token hashes plus absolute expiries. Logging in again overwrites it; logging
//! out clears it, so a previously issued token fails validation immediately.
//! Raw tokens and OTP codes never reach storage, only their SHA-256 hashes.
//!
//! ## Storage
//!
//! Handlers reach storage through the injected [`api::handlers::auth::AuthStore`]
//! trait. `PgStore` is the production backend; `MemoryStore` backs development
//! runs without a DSN and the test suite.

pub mod api;
pub mod cli;
pub mod payments;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
