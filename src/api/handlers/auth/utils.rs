//! Small helpers for input validation, token material and password hashing.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use argon2::password_hash::{
    rand_core::OsRng as HashRng, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::{Algorithm, Argon2, Params, PasswordHash, Version};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, Rng, RngCore};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::net::IpAddr;

pub(crate) const MIN_PASSWORD_LENGTH: usize = 8;
const MAX_PASSWORD_LENGTH: usize = 256;

/// Normalize an email for lookup/uniqueness checks.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(crate) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

/// Phone numbers are digits with an optional leading `+`, 7 to 15 digits long.
pub(crate) fn valid_phone(phone: &str) -> bool {
    Regex::new(r"^\+?[0-9]{7,15}$").is_ok_and(|regex| regex.is_match(phone))
}

/// Strip the separators people usually type into phone numbers.
pub(crate) fn normalize_phone(phone: &str) -> String {
    phone
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect()
}

pub(crate) fn valid_password(password: &str) -> bool {
    (MIN_PASSWORD_LENGTH..=MAX_PASSWORD_LENGTH).contains(&password.chars().count())
}

/// OTP codes are exactly six ASCII digits.
pub(crate) fn valid_otp_code(code: &str) -> bool {
    code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit())
}

/// Create a new opaque token carrying the given kind prefix.
/// The raw value is only returned to the client; storage keeps a hash.
pub(crate) fn generate_token(prefix: &str) -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate session token")?;
    Ok(format!("{prefix}{}", Base64UrlUnpadded::encode_string(&bytes)))
}

/// Hash a token or OTP code so raw values never touch storage.
pub(crate) fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

pub(crate) fn generate_otp_code() -> String {
    OsRng.gen_range(100_000..=999_999_u32).to_string()
}

/// `now + seconds`, or an error when the sum leaves chrono's range.
pub(crate) fn expires_after(now: DateTime<Utc>, seconds: i64) -> Result<DateTime<Utc>> {
    TimeDelta::try_seconds(seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .with_context(|| format!("expiry {seconds}s after {now} is out of range"))
}

fn argon2() -> Result<Argon2<'static>> {
    let params = Params::new(
        19_456, // 19 MiB
        2,      // iterations
        1,      // parallelism
        None,
    )
    .map_err(|e| anyhow!("failed to create Argon2 params: {e}"))?;

    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash a password into a PHC string (Argon2id).
pub(crate) fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut HashRng);
    let hash = argon2()?
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("failed to hash password: {e}"))?
        .to_string();
    Ok(hash)
}

/// Check a password against a stored PHC string.
///
/// Returns `Ok(false)` on mismatch; malformed hashes are errors.
pub(crate) fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed =
        PasswordHash::new(hash).map_err(|e| anyhow!("invalid password hash format: {e}"))?;

    match argon2()?.verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(anyhow!("password verification failed: {e}")),
    }
}

/// Request header carrying the address resolved by the router's client-ip layer.
/// Any client-supplied value is replaced before handlers run.
pub(crate) const CLIENT_IP_HEADER: &str = "x-aidlink-client-ip";

/// Resolve the caller's address from the socket peer and, behind trusted proxies, the
/// forwarding headers.
///
/// With `trusted_proxy_hops == 0` the headers are ignored. Otherwise the client is the
/// `trusted_proxy_hops`-th `X-Forwarded-For` entry counted from the right, since entries
/// to its left were written by the client. `X-Real-IP` is used when no `X-Forwarded-For`
/// is present. Unparseable or short chains fall back to the peer.
pub(crate) fn resolve_client_ip(
    peer: Option<IpAddr>,
    headers: &HeaderMap,
    trusted_proxy_hops: usize,
) -> Option<IpAddr> {
    if trusted_proxy_hops == 0 {
        return peer;
    }

    let forwarded: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();
    if !forwarded.is_empty() {
        return forwarded
            .len()
            .checked_sub(trusted_proxy_hops)
            .and_then(|index| forwarded.get(index))
            .and_then(|value| value.parse().ok())
            .or(peer);
    }

    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .or(peer)
}

/// Client address for rate limiting and audit, as resolved by the router.
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CLIENT_IP_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

pub(crate) fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    value.split(';').find_map(|pair| {
        let mut parts = pair.trim().splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        (key == name && !val.is_empty()).then(|| val.to_string())
    })
}
