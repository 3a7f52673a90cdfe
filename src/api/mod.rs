use crate::{
    api::{
        error::{ApiError, Envelope},
        handlers::{admin, auth, health, payments, receivers},
    },
    payments::PaymentsState,
};
use anyhow::{anyhow, Context, Result};
use axum::{
    body::Body,
    extract::{ConnectInfo, MatchedPath, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, info_span, warn, Span};
use ulid::Ulid;
use url::Url;
use utoipa_swagger_ui::SwaggerUi;

pub mod error;
pub mod handlers;
mod openapi;

pub use openapi::openapi;

/// Build the full application: documented routes, Swagger UI and the shared layers.
///
/// Payment routes are only mounted when `payments` is configured.
///
/// # Errors
/// Returns an error if the configured frontend base URL is not a valid origin.
pub fn router(
    auth_state: Arc<auth::AuthState>,
    payments: Option<Arc<PaymentsState>>,
) -> Result<Router> {
    let frontend_origin = frontend_origin(auth_state.config().frontend_base_url())?;
    let trusted_proxy_hops = auth_state.config().trusted_proxy_hops();
    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_origin(AllowOrigin::exact(frontend_origin))
        .allow_credentials(true);

    let mut app = Router::new()
        .route("/health", get(health::health).options(health::health))
        .route("/v1/auth/:kind/register", post(auth::login::register))
        .route("/v1/auth/:kind/login", post(auth::login::login))
        .route("/v1/auth/:kind/session", get(auth::session::session))
        .route("/v1/auth/:kind/refresh", post(auth::session::refresh))
        .route("/v1/auth/:kind/logout", post(auth::session::logout))
        .route("/v1/auth/:kind/profile", put(auth::oauth::update_profile))
        .route("/v1/otp/request", post(auth::otp::request_otp))
        .route("/v1/otp/verify", post(auth::otp::verify_otp_login))
        .route("/v1/oauth/callback", post(auth::oauth::oauth_callback))
        .route(
            "/v1/admin/principals/:kind/:id/deactivate",
            post(admin::deactivate_principal),
        )
        .route("/v1/receivers/:id", get(receivers::receiver_profile));

    if let Some(payments_state) = payments {
        app = app.merge(
            Router::new()
                .route("/v1/payments/orders", post(payments::create_order))
                .route("/v1/payments/verify", post(payments::verify_payment))
                .layer(Extension(payments_state)),
        );
    } else {
        warn!("Payment gateway not configured; payment routes are disabled");
    }

    let app = app
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi()))
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(middleware::from_fn_with_state(
                    trusted_proxy_hops,
                    tag_client_ip,
                ))
                .layer(Extension(auth_state)),
        );

    Ok(app)
}

/// Bind `[::]:port` and serve `app` until Ctrl-C.
///
/// # Errors
/// Returns an error if binding or serving fails.
pub async fn serve(port: u16, app: Router) -> Result<()> {
    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {err}");
            }
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

async fn not_found() -> Response {
    let err = ApiError::NotFound("Route not found".to_string());
    (err.status(), Json(Envelope::failure(err.to_string()))).into_response()
}

/// Replace any client-supplied client-ip header with the address resolved from the
/// socket peer and the trusted forwarding headers.
async fn tag_client_ip(
    State(trusted_proxy_hops): State<usize>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client_ip = auth::resolve_client_ip(peer, request.headers(), trusted_proxy_hops);

    let headers = request.headers_mut();
    headers.remove(auth::CLIENT_IP_HEADER);
    if let Some(value) = client_ip.and_then(|ip| HeaderValue::from_str(&ip.to_string()).ok()) {
        headers.insert(HeaderName::from_static(auth::CLIENT_IP_HEADER), value);
    }

    next.run(request).await
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn frontend_origin(frontend_base_url: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;
    let host = parsed.host_str().ok_or_else(|| {
        anyhow!("Frontend base URL must include a valid host: {frontend_base_url}")
    })?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}
