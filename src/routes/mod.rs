pub mod products;

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::handlers::health::health_check;
use crate::state::AppState;
use crate::upload::PUBLIC_PREFIX;

/// Room left in a request body for the text fields sent next to an image.
const FORM_OVERHEAD_BYTES: usize = 1024 * 1024;

pub fn api_router() -> Router<AppState> {
    Router::new().merge(products::routes())
}

/// Builds the full application: health, the product API under `/api`,
/// uploaded images under `/uploads`, plus CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let uploads = ServeDir::new(state.uploads.dir());
    let body_limit = state.uploads.max_bytes() + FORM_OVERHEAD_BYTES;

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_router())
        .nest_service(PUBLIC_PREFIX, uploads)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
