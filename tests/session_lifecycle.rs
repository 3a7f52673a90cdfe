use aidlink::{
    api::{
        self,
        handlers::auth::{
            AuthConfig, AuthState, AuthStore, FixedWindowRateLimiter, IdentityProvider,
            MemoryStore, NoopRateLimiter, OAuthIdentity, OtpSender, RateLimitAction,
            RateLimitPolicies, RateLimitPolicy, RateLimiter,
        },
    },
    cli::actions::create_admin::create_admin,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    extract::connect_info::MockConnectInfo,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, SET_COOKIE},
        HeaderMap, HeaderName, Method, Request, StatusCode,
    },
    Router,
};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tower::ServiceExt;

const ADMIN_EMAIL: &str = "ops@aidlink.org";
const ADMIN_PASSWORD: &str = "correct horse battery";

#[derive(Default)]
struct CapturingSender {
    sent: Mutex<Vec<(String, String)>>,
}

impl CapturingSender {
    fn last_code(&self) -> Option<String> {
        self.sent
            .lock()
            .ok()
            .and_then(|sent| sent.last().map(|(_, code)| code.clone()))
    }
}

impl OtpSender for CapturingSender {
    fn send(&self, email: &str, code: &str, _expires_at: DateTime<Utc>) -> Result<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((email.to_string(), code.to_string()));
        }
        Ok(())
    }
}

struct Harness {
    app: Router,
    store: Arc<MemoryStore>,
    otp: Arc<CapturingSender>,
}

fn config() -> AuthConfig {
    AuthConfig::new("https://aidlink.dev".to_string())
}

fn harness_with(
    config: AuthConfig,
    rate_limiter: impl FnOnce(Arc<dyn AuthStore>) -> Arc<dyn RateLimiter>,
) -> Result<Harness> {
    let store = Arc::new(MemoryStore::new());
    let otp = Arc::new(CapturingSender::default());
    let auth_state = AuthState::new(
        config,
        store.clone(),
        rate_limiter(store.clone()),
        otp.clone(),
    );
    let app = api::router(Arc::new(auth_state), None)?;
    Ok(Harness { app, store, otp })
}

fn harness() -> Result<Harness> {
    harness_with(config(), |_| {
        let limiter: Arc<dyn RateLimiter> = Arc::new(NoopRateLimiter);
        limiter
    })
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    headers: &[(HeaderName, String)],
    body: Option<Value>,
) -> Result<Reply> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    let request = match body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?,
        None => builder.body(Body::empty())?,
    };
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok(Reply {
        status,
        headers,
        body,
    })
}

fn set_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.starts_with(&format!("{name}=")))
}

fn cookie_pair(set_cookie: &str) -> String {
    set_cookie.split(';').next().unwrap_or_default().to_string()
}

fn bearer(token: &str) -> (HeaderName, String) {
    (AUTHORIZATION, format!("Bearer {token}"))
}

fn token(reply: &Reply, field: &str) -> Result<String> {
    reply.body["data"][field]
        .as_str()
        .map(str::to_string)
        .with_context(|| format!("missing {field} in {}", reply.body))
}

async fn seed_admin(harness: &Harness) -> Result<()> {
    create_admin(
        harness.store.as_ref(),
        ADMIN_EMAIL,
        &SecretString::from(ADMIN_PASSWORD.to_string()),
        Some("Ops".to_string()),
    )
    .await?;
    Ok(())
}

async fn admin_login(harness: &Harness, remember_me: bool) -> Result<Reply> {
    call(
        &harness.app,
        Method::POST,
        "/v1/auth/admin/login",
        &[],
        Some(json!({
            "email": ADMIN_EMAIL,
            "password": ADMIN_PASSWORD,
            "remember_me": remember_me,
        })),
    )
    .await
}

#[tokio::test]
async fn admin_remember_me_sets_seven_day_refresh_cookie() -> Result<()> {
    let harness = harness()?;
    seed_admin(&harness).await?;

    let reply = admin_login(&harness, true).await?;
    assert_eq!(reply.status, StatusCode::OK);
    // Cookie transport keeps tokens out of the body.
    assert!(reply.body["data"].get("access_token").is_none());

    let refresh = set_cookie(&reply.headers, "aidlink_admin_refresh").context("refresh cookie")?;
    assert!(refresh.contains("Max-Age=604800"), "{refresh}");
    assert!(refresh.contains("HttpOnly"));
    assert!(refresh.contains("SameSite=Strict"));
    assert!(refresh.contains("Secure"));

    let reply = admin_login(&harness, false).await?;
    let refresh = set_cookie(&reply.headers, "aidlink_admin_refresh").context("refresh cookie")?;
    assert!(refresh.contains("Max-Age=86400"), "{refresh}");

    let session = set_cookie(&reply.headers, "aidlink_admin_session").context("session cookie")?;
    let reply = call(
        &harness.app,
        Method::GET,
        "/v1/auth/admin/session",
        &[(COOKIE, cookie_pair(session))],
        None,
    )
    .await?;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["data"]["principal"]["identifier"], ADMIN_EMAIL);
    Ok(())
}

#[tokio::test]
async fn admin_refresh_and_logout_use_cookies() -> Result<()> {
    let harness = harness()?;
    seed_admin(&harness).await?;
    let login = admin_login(&harness, false).await?;
    let session =
        cookie_pair(set_cookie(&login.headers, "aidlink_admin_session").context("session")?);
    let refresh =
        cookie_pair(set_cookie(&login.headers, "aidlink_admin_refresh").context("refresh")?);

    let rotated = call(
        &harness.app,
        Method::POST,
        "/v1/auth/admin/refresh",
        &[(COOKIE, refresh.clone())],
        None,
    )
    .await?;
    assert_eq!(rotated.status, StatusCode::OK);
    let new_session =
        cookie_pair(set_cookie(&rotated.headers, "aidlink_admin_session").context("rotated")?);
    assert_ne!(new_session, session);

    // The old access token was replaced by the rotation.
    let stale = call(
        &harness.app,
        Method::GET,
        "/v1/auth/admin/session",
        &[(COOKIE, session)],
        None,
    )
    .await?;
    assert_eq!(stale.status, StatusCode::UNAUTHORIZED);

    let logout = call(
        &harness.app,
        Method::POST,
        "/v1/auth/admin/logout",
        &[(COOKIE, new_session.clone())],
        None,
    )
    .await?;
    assert_eq!(logout.status, StatusCode::OK);
    assert_eq!(logout.body["data"]["logged_out"], true);
    let cleared = set_cookie(&logout.headers, "aidlink_admin_session").context("cleared")?;
    assert!(cleared.contains("Max-Age=0"));

    let after = call(
        &harness.app,
        Method::GET,
        "/v1/auth/admin/session",
        &[(COOKIE, new_session)],
        None,
    )
    .await?;
    assert_eq!(after.status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn otp_login_scenario() -> Result<()> {
    let harness = harness()?;
    let email = "user@example.com";

    let issued = call(
        &harness.app,
        Method::POST,
        "/v1/otp/request",
        &[],
        Some(json!({ "email": email })),
    )
    .await?;
    assert_eq!(issued.status, StatusCode::OK);
    let code = harness.otp.last_code().context("code was not delivered")?;
    assert_eq!(code.len(), 6);
    assert!(code.chars().all(|c| c.is_ascii_digit()));

    let wrong = format!("{:06}", (code.parse::<u32>()? + 1) % 1_000_000);
    let verify = |code: String| {
        call(
            &harness.app,
            Method::POST,
            "/v1/otp/verify",
            &[],
            Some(json!({ "email": email, "code": code })),
        )
    };

    let reply = verify(wrong).await?;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(reply.body["success"], false);

    // The challenge survives a wrong guess.
    let reply = verify(code.clone()).await?;
    assert_eq!(reply.status, StatusCode::OK);
    let access = token(&reply, "access_token")?;
    assert!(access.starts_with("snd_"));
    assert_eq!(reply.body["data"]["principal"]["identifier"], email);
    assert_eq!(reply.body["data"]["profile_complete"], false);

    let reply = verify(code).await?;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    let session = call(
        &harness.app,
        Method::GET,
        "/v1/auth/sender/session",
        &[bearer(&access)],
        None,
    )
    .await?;
    assert_eq!(session.status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn tokens_do_not_cross_kinds_and_die_on_logout() -> Result<()> {
    let harness = harness()?;
    let registered = call(
        &harness.app,
        Method::POST,
        "/v1/auth/sender/register",
        &[],
        Some(json!({
            "email": "donor@example.com",
            "password": "long enough",
            "display_name": "Donor",
        })),
    )
    .await?;
    assert_eq!(registered.status, StatusCode::CREATED);
    assert_eq!(registered.body["data"]["profile_complete"], true);

    let duplicate = call(
        &harness.app,
        Method::POST,
        "/v1/auth/sender/register",
        &[],
        Some(json!({ "email": "donor@example.com", "password": "long enough" })),
    )
    .await?;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);

    let login = call(
        &harness.app,
        Method::POST,
        "/v1/auth/sender/login",
        &[],
        Some(json!({ "email": "donor@example.com", "password": "long enough" })),
    )
    .await?;
    assert_eq!(login.status, StatusCode::OK);
    let access = token(&login, "access_token")?;
    let refresh = token(&login, "refresh_token")?;

    for kind in ["receiver", "admin"] {
        let reply = call(
            &harness.app,
            Method::GET,
            &format!("/v1/auth/{kind}/session"),
            &[bearer(&access)],
            None,
        )
        .await?;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED, "{kind}");
    }

    let rotated = call(
        &harness.app,
        Method::POST,
        "/v1/auth/sender/refresh",
        &[],
        Some(json!({ "refresh_token": refresh })),
    )
    .await?;
    assert_eq!(rotated.status, StatusCode::OK);
    let access = token(&rotated, "access_token")?;

    let logout = call(
        &harness.app,
        Method::POST,
        "/v1/auth/sender/logout",
        &[bearer(&access)],
        None,
    )
    .await?;
    assert_eq!(logout.body["data"]["logged_out"], true);

    let session = call(
        &harness.app,
        Method::GET,
        "/v1/auth/sender/session",
        &[bearer(&access)],
        None,
    )
    .await?;
    assert_eq!(session.status, StatusCode::UNAUTHORIZED);

    let unknown = call(&harness.app, Method::GET, "/v1/auth/donor/session", &[], None).await?;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn admin_self_registration_is_forbidden() -> Result<()> {
    let harness = harness()?;
    let reply = call(
        &harness.app,
        Method::POST,
        "/v1/auth/admin/register",
        &[],
        Some(json!({ "email": "rogue@example.com", "password": "long enough" })),
    )
    .await?;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn deactivation_ends_the_session() -> Result<()> {
    let harness = harness()?;
    seed_admin(&harness).await?;
    let admin = admin_login(&harness, false).await?;
    let admin_cookie =
        cookie_pair(set_cookie(&admin.headers, "aidlink_admin_session").context("session")?);

    let credentials = json!({ "email": "donor@example.com", "password": "long enough" });
    let registered = call(
        &harness.app,
        Method::POST,
        "/v1/auth/sender/register",
        &[],
        Some(credentials.clone()),
    )
    .await?;
    let sender_id = registered.body["data"]["principal"]["id"]
        .as_str()
        .context("sender id")?
        .to_string();
    let login = call(
        &harness.app,
        Method::POST,
        "/v1/auth/sender/login",
        &[],
        Some(credentials.clone()),
    )
    .await?;
    let access = token(&login, "access_token")?;

    // Sender tokens cannot reach admin routes.
    let forbidden = call(
        &harness.app,
        Method::POST,
        &format!("/v1/admin/principals/sender/{sender_id}/deactivate"),
        &[bearer(&access)],
        None,
    )
    .await?;
    assert_eq!(forbidden.status, StatusCode::UNAUTHORIZED);

    let deactivated = call(
        &harness.app,
        Method::POST,
        &format!("/v1/admin/principals/sender/{sender_id}/deactivate"),
        &[(COOKIE, admin_cookie.clone())],
        None,
    )
    .await?;
    assert_eq!(deactivated.status, StatusCode::OK);
    assert_eq!(deactivated.body["data"]["is_active"], false);

    let session = call(
        &harness.app,
        Method::GET,
        "/v1/auth/sender/session",
        &[bearer(&access)],
        None,
    )
    .await?;
    assert_eq!(session.status, StatusCode::UNAUTHORIZED);

    let login = call(
        &harness.app,
        Method::POST,
        "/v1/auth/sender/login",
        &[],
        Some(credentials),
    )
    .await?;
    assert_eq!(login.status, StatusCode::FORBIDDEN);

    let missing = call(
        &harness.app,
        Method::POST,
        &format!("/v1/admin/principals/receiver/{sender_id}/deactivate"),
        &[(COOKIE, admin_cookie)],
        None,
    )
    .await?;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    let audit = harness.store.audit_events().await;
    assert!(audit.iter().any(|event| event.action == "deactivate"));
    Ok(())
}

fn login_limited(config: AuthConfig) -> Result<Harness> {
    harness_with(config, |store| {
        let limiter: Arc<dyn RateLimiter> = Arc::new(FixedWindowRateLimiter::new(
            store,
            RateLimitPolicies::default()
                .with_policy(RateLimitAction::Login, RateLimitPolicy::new(2, 60_000)),
        ));
        limiter
    })
}

fn from_peer(app: &Router, ip: [u8; 4]) -> Router {
    app.clone().layer(MockConnectInfo(SocketAddr::from((ip, 40_000))))
}

fn forwarded_for(value: &str) -> (HeaderName, String) {
    (HeaderName::from_static("x-forwarded-for"), value.to_string())
}

async fn failed_login(app: &Router, headers: &[(HeaderName, String)]) -> Result<StatusCode> {
    let body = json!({ "email": "nobody@example.com", "password": "whatever1" });
    let reply = call(app, Method::POST, "/v1/auth/sender/login", headers, Some(body)).await?;
    Ok(reply.status)
}

#[tokio::test]
async fn rotated_forwarded_for_does_not_escape_the_login_limit() -> Result<()> {
    let harness = login_limited(config())?;
    let app = from_peer(&harness.app, [192, 0, 2, 10]);

    let mut statuses = Vec::new();
    for i in 0..6 {
        let headers = [forwarded_for(&format!("10.0.0.{i}"))];
        statuses.push(failed_login(&app, &headers).await?);
    }
    assert_eq!(&statuses[..2], [StatusCode::UNAUTHORIZED; 2]);
    assert_eq!(&statuses[2..], [StatusCode::TOO_MANY_REQUESTS; 4]);

    let neighbour = from_peer(&harness.app, [192, 0, 2, 11]);
    assert_eq!(failed_login(&neighbour, &[]).await?, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn trusted_proxy_forwards_the_client_address() -> Result<()> {
    let harness = login_limited(config().with_trusted_proxy_hops(1))?;
    let proxy = from_peer(&harness.app, [10, 0, 0, 1]);

    let mut statuses = Vec::new();
    for i in 0..3 {
        let headers = [forwarded_for(&format!("6.6.6.{i}, 203.0.113.9"))];
        statuses.push(failed_login(&proxy, &headers).await?);
    }
    assert_eq!(
        statuses,
        vec![
            StatusCode::UNAUTHORIZED,
            StatusCode::UNAUTHORIZED,
            StatusCode::TOO_MANY_REQUESTS
        ]
    );

    let other = [forwarded_for("198.51.100.7")];
    assert_eq!(failed_login(&proxy, &other).await?, StatusCode::UNAUTHORIZED);
    Ok(())
}

struct FixedProvider;

#[async_trait]
impl IdentityProvider for FixedProvider {
    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> Result<OAuthIdentity> {
        if code != "good-code" {
            bail!("invalid_grant");
        }
        Ok(OAuthIdentity {
            email: "donor@example.com".to_string(),
            name: Some("Donor".to_string()),
        })
    }

    fn default_redirect_uri(&self) -> &str {
        "https://aidlink.dev/oauth/callback"
    }
}

async fn oauth_callback(app: &Router, code: &str) -> Result<Reply> {
    let body = json!({ "code": code });
    call(app, Method::POST, "/v1/oauth/callback", &[], Some(body)).await
}

#[tokio::test]
async fn oauth_callback_counts_against_the_login_limit() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let limiter = FixedWindowRateLimiter::new(
        store.clone(),
        RateLimitPolicies::default()
            .with_policy(RateLimitAction::Login, RateLimitPolicy::new(2, 60_000)),
    );
    let auth_state = AuthState::new(
        config(),
        store,
        Arc::new(limiter),
        Arc::new(CapturingSender::default()),
    )
    .with_identity_provider(Arc::new(FixedProvider));
    let app = from_peer(&api::router(Arc::new(auth_state), None)?, [192, 0, 2, 20]);

    let ok = oauth_callback(&app, "good-code").await?;
    assert_eq!(ok.status, StatusCode::OK);
    assert_eq!(ok.body["data"]["principal"]["identifier"], "donor@example.com");
    assert!(ok.body["data"]["access_token"].is_string());

    let bad = oauth_callback(&app, "stolen").await?;
    assert_eq!(bad.status, StatusCode::UNAUTHORIZED);

    let limited = oauth_callback(&app, "good-code").await?;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    Ok(())
}
