use crate::{
    api::{
        self,
        handlers::auth::{
            AuthState, AuthStore, FixedWindowRateLimiter, LogOtpSender, MemoryStore, OAuthClient,
            OAuthConfig, PgStore, RateLimitPolicies,
        },
    },
    cli::{commands::auth::Options as AuthOptions, telemetry},
    payments::{GatewayConfig, HttpPaymentGateway, PaymentsState},
};
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub auth: AuthOptions,
    pub rate_limits: RateLimitPolicies,
    pub oauth: Option<OAuthConfig>,
    pub payments: Option<GatewayConfig>,
}

/// Connect to Postgres with the service's pool settings.
///
/// # Errors
/// Returns an error if the database is unreachable.
pub async fn connect(dsn: &str) -> Result<PgStore> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn)
        .await
        .context("Failed to connect to database")?;
    Ok(PgStore::new(pool))
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database or an outbound client cannot be set up, or the server fails.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let store: Arc<dyn AuthStore> = match args.dsn.as_deref() {
        Some(dsn) => Arc::new(connect(dsn).await?),
        None => {
            warn!("No DSN configured; using the in-memory store, data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let rate_limiter = Arc::new(FixedWindowRateLimiter::new(
        store.clone(),
        args.rate_limits,
    ));
    let mut auth_state = AuthState::new(
        args.auth.auth_config(),
        store,
        rate_limiter,
        Arc::new(LogOtpSender),
    );
    if let Some(oauth) = args.oauth {
        auth_state = auth_state.with_identity_provider(Arc::new(OAuthClient::new(oauth)?));
    }

    let payments = match args.payments {
        Some(config) => {
            let key_id = config.key_id().to_string();
            let key_secret = config.key_secret().clone();
            let gateway = HttpPaymentGateway::new(config)?;
            Some(Arc::new(PaymentsState::new(
                Arc::new(gateway),
                key_id,
                key_secret,
            )))
        }
        None => None,
    };

    let app = api::router(Arc::new(auth_state), payments)?;
    let result = api::serve(args.port, app).await;

    telemetry::shutdown_tracer();
    result
}

fn log_startup_args(args: &Args) {
    let storage = if args.dsn.is_some() { "postgres" } else { "memory" };
    info!(
        port = args.port,
        storage,
        frontend_base_url = %args.auth.frontend_base_url,
        trusted_proxy_hops = args.auth.trusted_proxy_hops,
        oauth = args.oauth.is_some(),
        payments = args.payments.is_some(),
        "Starting aidlink"
    );
}
