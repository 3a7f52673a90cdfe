//! Fixed-window rate limiting for sensitive auth and payment actions.
//!
//! Each action class has a `(max_requests, window)` policy. A request hits the
//! counter for `(client address, action)`: when the window has elapsed the
//! counter restarts at 1, otherwise it increments, and the request is limited
//! once the count exceeds `max_requests`. Bursts at window boundaries are
//! accepted. Counters live in the injected store, never in process globals.

use anyhow::Result;
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use tracing::warn;

use super::{state::AuthState, storage::AuthStore, utils::extract_client_ip};
use crate::api::error::ApiError;

/// Bucket for requests whose client address cannot be resolved.
const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    Login,
    Register,
    OtpSend,
    OtpVerify,
    Refresh,
    OrderCreate,
}

impl RateLimitAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Register => "register",
            Self::OtpSend => "otp_send",
            Self::OtpVerify => "otp_verify",
            Self::Refresh => "refresh",
            Self::OrderCreate => "order_create",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    max_requests: u32,
    window_ms: u64,
}

impl RateLimitPolicy {
    #[must_use]
    pub const fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }

    /// Parse `max/window_ms`, e.g. `5/900000`.
    ///
    /// # Errors
    /// Returns a message when the format is wrong or either side is zero.
    pub fn parse(value: &str) -> Result<Self, String> {
        let (max, window) = value
            .split_once('/')
            .ok_or_else(|| format!("expected max/window_ms, got {value:?}"))?;
        let max_requests: u32 = max
            .trim()
            .parse()
            .map_err(|_| format!("invalid max requests: {max:?}"))?;
        let window_ms: u64 = window
            .trim()
            .parse()
            .map_err(|_| format!("invalid window: {window:?}"))?;
        if max_requests == 0 || window_ms == 0 {
            return Err("max requests and window must be greater than zero".to_string());
        }
        Ok(Self::new(max_requests, window_ms))
    }

    #[must_use]
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    #[must_use]
    pub fn window(&self) -> TimeDelta {
        TimeDelta::milliseconds(i64::try_from(self.window_ms).unwrap_or(i64::MAX))
    }
}

/// Policies for every action class.
#[derive(Clone, Debug)]
pub struct RateLimitPolicies {
    login: RateLimitPolicy,
    register: RateLimitPolicy,
    otp_send: RateLimitPolicy,
    otp_verify: RateLimitPolicy,
    refresh: RateLimitPolicy,
    order_create: RateLimitPolicy,
}

impl Default for RateLimitPolicies {
    fn default() -> Self {
        Self {
            login: RateLimitPolicy::new(5, 15 * 60 * 1000),
            register: RateLimitPolicy::new(5, 60 * 60 * 1000),
            otp_send: RateLimitPolicy::new(3, 10 * 60 * 1000),
            otp_verify: RateLimitPolicy::new(10, 10 * 60 * 1000),
            refresh: RateLimitPolicy::new(30, 15 * 60 * 1000),
            order_create: RateLimitPolicy::new(10, 60 * 1000),
        }
    }
}

impl RateLimitPolicies {
    #[must_use]
    pub fn with_policy(mut self, action: RateLimitAction, policy: RateLimitPolicy) -> Self {
        *self.slot(action) = policy;
        self
    }

    #[must_use]
    pub fn policy(&self, action: RateLimitAction) -> RateLimitPolicy {
        match action {
            RateLimitAction::Login => self.login,
            RateLimitAction::Register => self.register,
            RateLimitAction::OtpSend => self.otp_send,
            RateLimitAction::OtpVerify => self.otp_verify,
            RateLimitAction::Refresh => self.refresh,
            RateLimitAction::OrderCreate => self.order_create,
        }
    }

    fn slot(&mut self, action: RateLimitAction) -> &mut RateLimitPolicy {
        match action {
            RateLimitAction::Login => &mut self.login,
            RateLimitAction::Register => &mut self.register,
            RateLimitAction::OtpSend => &mut self.otp_send,
            RateLimitAction::OtpVerify => &mut self.otp_verify,
            RateLimitAction::Refresh => &mut self.refresh,
            RateLimitAction::OrderCreate => &mut self.order_create,
        }
    }
}

/// Counter state for one `(client, action)` key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WindowCounter {
    pub(crate) hits: u32,
    pub(crate) window_start: DateTime<Utc>,
}

impl WindowCounter {
    /// Apply one hit at `now`.
    pub(crate) fn hit(current: Option<Self>, window: TimeDelta, now: DateTime<Utc>) -> Self {
        match current {
            Some(counter) if now - counter.window_start < window => Self {
                hits: counter.hits.saturating_add(1),
                window_start: counter.window_start,
            },
            _ => Self {
                hits: 1,
                window_start: now,
            },
        }
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(
        &self,
        client: Option<&str>,
        action: RateLimitAction,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision>;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn check(
        &self,
        _client: Option<&str>,
        _action: RateLimitAction,
        _now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        Ok(RateLimitDecision::Allowed)
    }
}

/// Fixed-window limiter whose counters live in an [`AuthStore`].
pub struct FixedWindowRateLimiter {
    store: Arc<dyn AuthStore>,
    policies: RateLimitPolicies,
}

impl FixedWindowRateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn AuthStore>, policies: RateLimitPolicies) -> Self {
        Self { store, policies }
    }
}

#[async_trait]
impl RateLimiter for FixedWindowRateLimiter {
    async fn check(
        &self,
        client: Option<&str>,
        action: RateLimitAction,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        let policy = self.policies.policy(action);
        let client_key = client.unwrap_or(UNKNOWN_CLIENT);
        let hits = self
            .store
            .hit_rate_counter(client_key, action.as_str(), policy.window(), now)
            .await?;
        if hits > policy.max_requests() {
            Ok(RateLimitDecision::Limited)
        } else {
            Ok(RateLimitDecision::Allowed)
        }
    }
}

/// Reject the request with 429 when the caller's address exceeded `action`'s policy.
///
/// # Errors
/// `RateLimited` when limited, `Internal` when the counter store fails.
pub(crate) async fn enforce(
    auth_state: &AuthState,
    headers: &HeaderMap,
    action: RateLimitAction,
) -> Result<(), ApiError> {
    let client_ip = extract_client_ip(headers);
    let decision = auth_state
        .rate_limiter()
        .check(client_ip.as_deref(), action, Utc::now())
        .await?;
    if decision == RateLimitDecision::Limited {
        warn!(
            client_ip = client_ip.as_deref().unwrap_or(UNKNOWN_CLIENT),
            action = action.as_str(),
            "rate limited"
        );
        return Err(ApiError::RateLimited);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::auth::memory::MemoryStore;

    fn limiter(policy: RateLimitPolicy) -> FixedWindowRateLimiter {
        FixedWindowRateLimiter::new(
            Arc::new(MemoryStore::new()),
            RateLimitPolicies::default().with_policy(RateLimitAction::Login, policy),
        )
    }

    #[tokio::test]
    async fn noop_rate_limiter_allows() -> Result<()> {
        let limiter = NoopRateLimiter;
        assert_eq!(
            limiter
                .check(None, RateLimitAction::OtpSend, Utc::now())
                .await?,
            RateLimitDecision::Allowed
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejects_the_call_after_max_requests_then_recovers() -> Result<()> {
        let limiter = limiter(RateLimitPolicy::new(3, 60_000));
        let start = Utc::now();
        for i in 0..3 {
            let now = start + TimeDelta::seconds(i);
            assert_eq!(
                limiter
                    .check(Some("10.0.0.1"), RateLimitAction::Login, now)
                    .await?,
                RateLimitDecision::Allowed
            );
        }
        assert_eq!(
            limiter
                .check(
                    Some("10.0.0.1"),
                    RateLimitAction::Login,
                    start + TimeDelta::seconds(10)
                )
                .await?,
            RateLimitDecision::Limited
        );

        // Another client has its own counter.
        assert_eq!(
            limiter
                .check(
                    Some("10.0.0.2"),
                    RateLimitAction::Login,
                    start + TimeDelta::seconds(10)
                )
                .await?,
            RateLimitDecision::Allowed
        );

        // The window restarts once a full window has elapsed since its start.
        assert_eq!(
            limiter
                .check(
                    Some("10.0.0.1"),
                    RateLimitAction::Login,
                    start + TimeDelta::seconds(60)
                )
                .await?,
            RateLimitDecision::Allowed
        );
        Ok(())
    }

    #[tokio::test]
    async fn actions_are_counted_separately() -> Result<()> {
        let limiter = limiter(RateLimitPolicy::new(1, 60_000));
        let now = Utc::now();
        assert_eq!(
            limiter
                .check(Some("10.0.0.3"), RateLimitAction::Login, now)
                .await?,
            RateLimitDecision::Allowed
        );
        assert_eq!(
            limiter
                .check(Some("10.0.0.3"), RateLimitAction::OtpSend, now)
                .await?,
            RateLimitDecision::Allowed
        );
        assert_eq!(
            limiter
                .check(Some("10.0.0.3"), RateLimitAction::Login, now)
                .await?,
            RateLimitDecision::Limited
        );
        Ok(())
    }

    #[tokio::test]
    async fn unknown_clients_share_a_bucket() -> Result<()> {
        let limiter = limiter(RateLimitPolicy::new(1, 60_000));
        let now = Utc::now();
        assert_eq!(
            limiter.check(None, RateLimitAction::Login, now).await?,
            RateLimitDecision::Allowed
        );
        assert_eq!(
            limiter.check(None, RateLimitAction::Login, now).await?,
            RateLimitDecision::Limited
        );
        Ok(())
    }

    #[test]
    fn window_counter_resets_after_window() {
        let start = Utc::now();
        let window = TimeDelta::seconds(30);
        let first = WindowCounter::hit(None, window, start);
        assert_eq!(first.hits, 1);
        let second = WindowCounter::hit(Some(first), window, start + TimeDelta::seconds(29));
        assert_eq!(second.hits, 2);
        assert_eq!(second.window_start, start);
        let reset = WindowCounter::hit(Some(second), window, start + TimeDelta::seconds(30));
        assert_eq!(reset.hits, 1);
        assert_eq!(reset.window_start, start + TimeDelta::seconds(30));
    }

    #[test]
    fn policy_parse() {
        assert_eq!(
            RateLimitPolicy::parse("5/900000"),
            Ok(RateLimitPolicy::new(5, 900_000))
        );
        assert!(RateLimitPolicy::parse("5").is_err());
        assert!(RateLimitPolicy::parse("0/1000").is_err());
        assert!(RateLimitPolicy::parse("five/1000").is_err());
        assert_eq!(
            RateLimitPolicy::new(2, 1500).window(),
            TimeDelta::milliseconds(1500)
        );
    }
}
