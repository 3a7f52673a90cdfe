//! Auth state and configuration shared by the handlers.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::{
    oauth::IdentityProvider,
    otp::OtpSender,
    principal::{KindConfig, PrincipalKind},
    rate_limit::RateLimiter,
    storage::{AuditEvent, AuthStore},
    utils::extract_client_ip,
};

const DEFAULT_OTP_TTL_SECONDS: i64 = 10 * 60;
const DEFAULT_OTP_MAX_ATTEMPTS: u32 = 5;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    frontend_base_url: String,
    sender: KindConfig,
    receiver: KindConfig,
    admin: KindConfig,
    otp_ttl_seconds: i64,
    otp_max_attempts: u32,
    trusted_proxy_hops: usize,
}

impl AuthConfig {
    #[must_use]
    pub fn new(frontend_base_url: String) -> Self {
        Self {
            frontend_base_url,
            sender: KindConfig::defaults(PrincipalKind::Sender),
            receiver: KindConfig::defaults(PrincipalKind::Receiver),
            admin: KindConfig::defaults(PrincipalKind::Admin),
            otp_ttl_seconds: DEFAULT_OTP_TTL_SECONDS,
            otp_max_attempts: DEFAULT_OTP_MAX_ATTEMPTS,
            trusted_proxy_hops: 0,
        }
    }

    /// Replace the configuration of the kind the record belongs to.
    #[must_use]
    pub fn with_kind_config(mut self, config: KindConfig) -> Self {
        match config.kind() {
            PrincipalKind::Sender => self.sender = config,
            PrincipalKind::Receiver => self.receiver = config,
            PrincipalKind::Admin => self.admin = config,
        }
        self
    }

    #[must_use]
    pub fn with_otp_ttl_seconds(mut self, seconds: i64) -> Self {
        self.otp_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_otp_max_attempts(mut self, attempts: u32) -> Self {
        self.otp_max_attempts = attempts;
        self
    }

    /// Number of reverse proxies in front of the service whose forwarding headers are
    /// trusted. Zero ignores `X-Forwarded-For` and `X-Real-IP`.
    #[must_use]
    pub fn with_trusted_proxy_hops(mut self, hops: usize) -> Self {
        self.trusted_proxy_hops = hops;
        self
    }

    #[must_use]
    pub fn kind(&self, kind: PrincipalKind) -> &KindConfig {
        match kind {
            PrincipalKind::Sender => &self.sender,
            PrincipalKind::Receiver => &self.receiver,
            PrincipalKind::Admin => &self.admin,
        }
    }

    #[must_use]
    pub fn otp_ttl_seconds(&self) -> i64 {
        self.otp_ttl_seconds
    }

    #[must_use]
    pub fn otp_max_attempts(&self) -> u32 {
        self.otp_max_attempts
    }

    #[must_use]
    pub fn trusted_proxy_hops(&self) -> usize {
        self.trusted_proxy_hops
    }

    pub(crate) fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    /// Cookies are only marked `Secure` when the frontend is served over HTTPS.
    pub(crate) fn session_cookie_secure(&self) -> bool {
        self.frontend_base_url.starts_with("https://")
    }
}

pub struct AuthState {
    config: AuthConfig,
    store: Arc<dyn AuthStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    otp_sender: Arc<dyn OtpSender>,
    identity_provider: Option<Arc<dyn IdentityProvider>>,
}

impl AuthState {
    pub fn new(
        config: AuthConfig,
        store: Arc<dyn AuthStore>,
        rate_limiter: Arc<dyn RateLimiter>,
        otp_sender: Arc<dyn OtpSender>,
    ) -> Self {
        Self {
            config,
            store,
            rate_limiter,
            otp_sender,
            identity_provider: None,
        }
    }

    #[must_use]
    pub fn with_identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity_provider = Some(provider);
        self
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &dyn AuthStore {
        self.store.as_ref()
    }

    pub(crate) fn rate_limiter(&self) -> &dyn RateLimiter {
        self.rate_limiter.as_ref()
    }

    pub(super) fn otp_sender(&self) -> &dyn OtpSender {
        self.otp_sender.as_ref()
    }

    pub(super) fn identity_provider(&self) -> Option<&dyn IdentityProvider> {
        self.identity_provider.as_deref()
    }

    /// Append an audit event. Failures are logged and never fail the request.
    pub(crate) async fn audit(
        &self,
        headers: &HeaderMap,
        kind: Option<PrincipalKind>,
        principal_id: Option<Uuid>,
        action: &str,
        at: DateTime<Utc>,
    ) {
        let event = AuditEvent {
            kind,
            principal_id,
            action: action.to_string(),
            client_ip: extract_client_ip(headers),
            at,
        };
        if let Err(err) = self.store.record_audit(&event).await {
            warn!(action, "Failed to record audit event: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{
        memory::MemoryStore,
        otp::LogOtpSender,
        rate_limit::{NoopRateLimiter, RateLimiter},
    };
    use super::*;

    #[test]
    fn auth_config_defaults_and_overrides() {
        let config = AuthConfig::new("https://aidlink.dev".to_string());

        assert_eq!(config.frontend_base_url(), "https://aidlink.dev");
        assert!(config.session_cookie_secure());
        assert_eq!(config.otp_ttl_seconds(), DEFAULT_OTP_TTL_SECONDS);
        assert_eq!(config.otp_max_attempts(), DEFAULT_OTP_MAX_ATTEMPTS);
        assert_eq!(config.trusted_proxy_hops(), 0);
        assert_eq!(config.kind(PrincipalKind::Admin).access_ttl_seconds(), 15 * 60);

        let config = config
            .with_otp_ttl_seconds(60)
            .with_otp_max_attempts(3)
            .with_trusted_proxy_hops(1)
            .with_kind_config(
                KindConfig::defaults(PrincipalKind::Sender).with_access_ttl_seconds(120),
            );
        assert_eq!(config.otp_ttl_seconds(), 60);
        assert_eq!(config.otp_max_attempts(), 3);
        assert_eq!(config.trusted_proxy_hops(), 1);
        assert_eq!(config.kind(PrincipalKind::Sender).access_ttl_seconds(), 120);
        assert_eq!(config.kind(PrincipalKind::Receiver).access_ttl_seconds(), 60 * 60);
    }

    #[test]
    fn plain_http_frontend_disables_secure_cookies() {
        let config = AuthConfig::new("http://localhost:8080".to_string());
        assert!(!config.session_cookie_secure());
    }

    #[tokio::test]
    async fn audit_records_client_ip() {
        let store = Arc::new(MemoryStore::new());
        let limiter: Arc<dyn RateLimiter> = Arc::new(NoopRateLimiter);
        let state = AuthState::new(
            AuthConfig::new("https://aidlink.dev".to_string()),
            store.clone(),
            limiter,
            Arc::new(LogOtpSender),
        );
        assert!(state.identity_provider().is_none());

        let mut headers = HeaderMap::new();
        headers.insert(
            super::super::utils::CLIENT_IP_HEADER,
            axum::http::HeaderValue::from_static("10.1.2.3"),
        );
        let now = Utc::now();
        state
            .audit(&headers, Some(PrincipalKind::Sender), None, "login", now)
            .await;

        let events = store.audit_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "login");
        assert_eq!(events[0].client_ip.as_deref(), Some("10.1.2.3"));
    }
}
