// src/handlers/health.rs
use axum::{extract::State, http::StatusCode, response::{IntoResponse, Response}, Json};
use chrono::Utc;
use serde_json::json;
use tracing::{error, instrument};

use crate::state::AppState;

// GET /health - Liveness plus a database round-trip
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    match sqlx::query_scalar::<_, i32>("SELECT 1 AS ok")
        .fetch_one(&state.db_pool)
        .await
    {
        Ok(ok) => Json(json!({
            "status": "ok",
            "db": ok == 1,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "Health check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "status": "error",
                    "message": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}
