//! HTTP surface: router construction, middleware stack, and server startup.

use crate::auth::{
    postgres::{PostgresSponsorPatternRepository, PostgresUserRepository},
    token::TokenConfig,
    AuthConfig, AuthService, TokenService,
};
use crate::cli::globals::GlobalArgs;
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    routing::{get, post},
    Extension, Json, Router,
};
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, Span};
use ulid::Ulid;
use utoipa::OpenApi;

pub mod handlers;

use handlers::{auth as auth_handlers, health};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::auth::register,
        handlers::auth::login,
        handlers::auth::refresh,
        handlers::auth::change_password,
        handlers::auth::validate_linking_code,
        handlers::auth::sponsor_config,
    ),
    components(schemas(
        crate::auth::RegisterRequest,
        crate::auth::LoginRequest,
        crate::auth::ChangePasswordRequest,
        crate::auth::models::SponsorConfig,
        handlers::types::TokenResponse,
        handlers::types::ErrorResponse,
        handlers::types::LinkingCodeRequest,
        handlers::types::LinkingCodeResponse,
        handlers::health::Health,
    )),
    tags((name = "auth", description = "Authentication and session API"))
)]
pub struct ApiDoc;

/// Build the application router around a shared [`AuthService`].
pub fn router(auth: Arc<AuthService>, pool: Option<PgPool>) -> Router {
    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any);

    let mut app = Router::new()
        .route("/health", get(health::health))
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .route("/v1/auth/register", post(auth_handlers::register))
        .route("/v1/auth/login", post(auth_handlers::login))
        .route("/v1/auth/refresh", post(auth_handlers::refresh))
        .route("/v1/auth/password", post(auth_handlers::change_password))
        .route(
            "/v1/auth/linking-code",
            post(auth_handlers::validate_linking_code),
        )
        .route(
            "/v1/sponsors/:sponsor_id/config",
            get(auth_handlers::sponsor_config),
        );

    if let Some(pool) = pool {
        app = app.layer(Extension(pool));
    }

    app.layer(
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
            .layer(Extension(auth)),
    )
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(
    port: u16,
    dsn: String,
    globals: &GlobalArgs,
    token_config: TokenConfig,
    auth_config: AuthConfig,
) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let tokens = TokenService::from_private_key(
        globals.signing_key_pem.expose_secret().as_bytes(),
        token_config,
    )
    .context("Failed to load token signing key")?;

    let auth = Arc::new(AuthService::new(
        Arc::new(PostgresUserRepository::new(pool.clone())),
        Arc::new(PostgresSponsorPatternRepository::new(pool.clone())),
        tokens,
        auth_config,
    ));

    spawn_limiter_cleanup(auth.clone(), LIMITER_CLEANUP_PERIOD);

    let app = router(auth, Some(pool));

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

const LIMITER_CLEANUP_PERIOD: Duration = Duration::from_secs(60);

/// Periodically drop drained rate-limiter keys so the map does not grow with
/// every address/username pair ever seen.
fn spawn_limiter_cleanup(auth: Arc<AuthService>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            auth.rate_limiter().cleanup();
            debug!("rate limiter cleanup pass complete");
        }
    })
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::memory::{InMemorySponsorPatternRepository, InMemoryUserRepository};
    use crate::auth::token::test_keys::PRIVATE_KEY_PEM;

    fn auth_service(config: AuthConfig) -> Arc<AuthService> {
        let tokens = TokenService::from_private_key(PRIVATE_KEY_PEM.as_bytes(), TokenConfig::default())
            .expect("test key should parse");
        Arc::new(AuthService::new(
            Arc::new(InMemoryUserRepository::new()),
            Arc::new(InMemorySponsorPatternRepository::new()),
            tokens,
            config,
        ))
    }

    #[tokio::test]
    async fn cleanup_task_drops_drained_limiter_keys() {
        // Real sleeps: the limiter windows age on std::time::Instant, which
        // paused tokio time does not advance.
        let config = AuthConfig::default().with_rate_limit(5, Duration::from_millis(50));
        let auth = auth_service(config);

        auth.rate_limiter().check_and_record("10.0.0.1:alice");
        auth.rate_limiter().check_and_record("10.0.0.2:bob");
        assert_eq!(auth.rate_limiter().tracked_keys(), 2);

        let task = spawn_limiter_cleanup(auth.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(auth.rate_limiter().tracked_keys(), 0);
        task.abort();
    }

    #[test]
    fn openapi_document_serializes() {
        let doc = serde_json::to_value(ApiDoc::openapi()).expect("spec should serialize");
        assert!(doc["paths"]["/v1/auth/login"]["post"].is_object());
        assert!(doc["components"]["schemas"]["LoginRequest"].is_object());
    }
}
