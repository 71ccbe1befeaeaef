//! Progress-polling HTTP server.
//!
//! Exposes the per-object run markers over a small JSON API so dialogs
//! and dashboards can poll a batch run they triggered elsewhere.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/objects/{type}/{id}/progress` | Run marker snapshot for one object |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses share one schema:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "id must be numeric" } }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so editor frontends on
//! other origins can poll directly.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::db;
use crate::markers::{RunProgress, RunState};
use crate::models::ObjectRef;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    run_state: Arc<RunState>,
}

/// Starts the progress server.
///
/// Binds to the address configured in `[server].bind` and serves until
/// the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pool = db::connect(config).await?;

    let state = AppState {
        run_state: Arc::new(RunState::new(pool)),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/objects/{otype}/{id}/progress", get(handle_progress))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("Progress server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`).
    code: String,
    /// Human-readable error message.
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

/// JSON response body for `GET /health`.
#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    /// The crate version from `Cargo.toml`.
    version: String,
}

/// Handler for `GET /health`.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /objects/{type}/{id}/progress ============

/// Handler for `GET /objects/{type}/{id}/progress`.
///
/// Returns the run marker snapshot for one object: processed count, run
/// total, the running timestamp (0 when idle), and the last terminal
/// result, if any. Objects that never ran return an all-zero snapshot.
async fn handle_progress(
    State(state): State<AppState>,
    Path((otype, id)): Path<(String, String)>,
) -> Result<Json<RunProgress>, AppError> {
    if otype.trim().is_empty() {
        return Err(bad_request("object type must not be empty"));
    }
    let id: i64 = id
        .parse()
        .map_err(|_| bad_request("object id must be numeric"))?;

    let hash = ObjectRef::new(id, otype).marker_hash();
    let progress = state
        .run_state
        .progress(&hash)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(progress))
}
