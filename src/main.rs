use axum::{
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use promptduel_backend::config::Config;
use promptduel_backend::generate::GenerationClient;
use promptduel_backend::live::BattleServer;
use promptduel_backend::rate_limit::RateLimiter;
use promptduel_backend::{api, auth, db, metrics};

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "promptduel-backend" }))
}

async fn track_api_metrics(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let method = req.method().to_string();
    let endpoint = metrics::normalize_path(req.uri().path());
    let response = next.run(req).await;
    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), endpoint.as_str(), response.status().as_str()])
        .inc();
    response
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::load();
    metrics::register_metrics();

    let db = db::Database::new(&config.database_url)
        .await
        .expect("Failed to initialize database");
    let db = Arc::new(db);

    if config.generation_api_token.is_none() {
        tracing::warn!(
            "HUGGINGFACE_TOKEN is not set; image generation will fail until it is configured"
        );
    }
    let generator = Arc::new(GenerationClient::new(
        config.generation_api_url.clone(),
        config.generation_api_token.clone(),
        config.images_dir.clone(),
    ));

    let battles = Arc::new(BattleServer::new(db.clone(), generator));
    let rate_limiter = RateLimiter::new();

    let mut app = Router::new()
        .route("/health", get(health_check))
        // Auth routes (no auth required)
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/profile", put(auth::update_profile))
        .with_state(db.clone())
        .merge(api::router(
            db,
            battles,
            rate_limiter,
            config.timeout_policy,
        ))
        // Generated images are written here and served back to both players.
        .nest_service("/images", ServeDir::new(&config.images_dir))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(track_api_metrics));

    if let Some(static_dir) = &config.static_dir {
        app = app.fallback_service(ServeDir::new(static_dir));
    }

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to port {}: {e}", config.port));

    tracing::info!("Promptduel backend listening on port {}", config.port);
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
