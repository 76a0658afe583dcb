use axum::{
    extract::{DefaultBodyLimit, Request},
    http::StatusCode,
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::routes;
use crate::state::AppState;

/// Bulk ingestion payloads can be large; everything else is small JSON.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes — no auth required (health probes only)
    let public_routes = Router::new().route("/health", get(routes::health::health_check));

    // Protected routes — require MEMVAULT_AUTH_TOKEN when configured
    let protected_routes = Router::new()
        // Graceful shutdown (requires auth to prevent unauthorized termination)
        .route("/shutdown", post(routes::health::shutdown_handler))
        // Coordinator flows
        .route("/retrieve", post(routes::memory::retrieve))
        .route("/ingest", post(routes::memory::ingest))
        // Vault RPC surface
        .route("/search", post(routes::vault::search))
        .route("/search-all", post(routes::vault::search_all))
        .route("/store", post(routes::vault::store))
        .route("/store-chunked", post(routes::vault::store_chunked))
        .route("/bulk-store", post(routes::vault::bulk_store))
        .route("/delete", post(routes::vault::delete))
        .route(
            "/buffer",
            get(routes::vault::buffer_get).post(routes::vault::buffer_post),
        )
        .route("/stats", get(routes::vault::stats))
        .route("/clear", post(routes::vault::clear))
        .route("/reset", post(routes::vault::reset))
        .route("/export", get(routes::vault::export))
        .route("/export-raw", get(routes::vault::export_raw))
        .route("/warmth", get(routes::vault::warmth))
        .route("/archival-stats", post(routes::vault::archival_stats))
        .layer(axum::middleware::from_fn(auth_middleware));

    public_routes
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

/// Middleware that validates `Authorization: Bearer <token>` against the
/// `MEMVAULT_AUTH_TOKEN` environment variable.  If the env var is not set or
/// empty, auth is skipped (development mode).
async fn auth_middleware(
    req: Request,
    next: Next,
) -> Result<Response, (StatusCode, axum::Json<serde_json::Value>)> {
    use std::sync::OnceLock;
    static AUTH_TOKEN: OnceLock<Option<String>> = OnceLock::new();
    let expected = AUTH_TOKEN.get_or_init(|| {
        std::env::var("MEMVAULT_AUTH_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
    });

    let expected_token = match expected {
        Some(t) => t.as_str(),
        None => return Ok(next.run(req).await), // No token configured — skip auth
    };

    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    match auth_header {
        Some(header) if header.len() > 7 && header[..7].eq_ignore_ascii_case("bearer ") => {
            let token = &header[7..];
            if token == expected_token {
                Ok(next.run(req).await)
            } else {
                tracing::warn!("Auth token mismatch — rejecting request");
                Err((
                    StatusCode::UNAUTHORIZED,
                    axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401})),
                ))
            }
        }
        _ => {
            tracing::warn!("Missing or malformed Authorization header — rejecting request");
            Err((
                StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401})),
            ))
        }
    }
}
