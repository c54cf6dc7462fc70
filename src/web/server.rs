//! Axum server for the compile endpoint.
//!
//! Routes: `GET /health`, `POST /compile`, JSON errors for everything
//! else. Every response carries an `x-request-id` header.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use super::{validate_query, ValidationDetail};
use crate::compile::{compile, CompileOptions};
use crate::config::Config;
use crate::query::UserQuery;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared state: the immutable config plus compile options.
pub struct AppState {
    pub config: Config,
    pub options: CompileOptions,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: u64,
}

#[derive(Serialize)]
struct QueryInfo {
    id: String,
    name: String,
}

#[derive(Serialize)]
struct SqlPayload {
    query: String,
    parameters: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize)]
struct CompileResponse {
    success: bool,
    query: QueryInfo,
    graph: String,
    sql: SqlPayload,
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<ValidationDetail>>,
}

impl ErrorResponse {
    fn new(error: &'static str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: Vec<ValidationDetail>) -> Self {
        self.details = Some(details);
        self
    }
}

/// Build the router with all routes.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/compile", post(compile_handler))
        .fallback(not_found)
        .layer(middleware::from_fn(request_id))
        .layer(cors)
        .with_state(state)
}

/// Start the server.
pub async fn serve(config: Config, options: CompileOptions, port: u16) -> std::io::Result<()> {
    let state = Arc::new(AppState { config, options });
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "screener compile service listening");
    axum::serve(listener, app).await
}

async fn request_id(request: Request, next: Next) -> Response {
    let id = Uuid::new_v4().to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    info!(request_id = %id, %method, %path, status = %response.status(), "request");
    response
}

async fn health() -> Json<HealthResponse> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Json(HealthResponse {
        status: "ok",
        timestamp,
    })
}

async fn compile_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    // Malformed JSON and schema failures are distinct failure modes:
    // 400 for the former, 422 with details for the latter.
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new("bad_request", err.to_string())),
            )
                .into_response();
        }
    };

    let query: UserQuery = match serde_json::from_value(value) {
        Ok(query) => query,
        Err(err) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(
                    ErrorResponse::new("validation_failed", "request does not match the schema")
                        .with_details(vec![ValidationDetail {
                            path: String::new(),
                            message: err.to_string(),
                        }]),
                ),
            )
                .into_response();
        }
    };

    let details = validate_query(&query, &state.config);
    if !details.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(
                ErrorResponse::new("validation_failed", "query failed validation")
                    .with_details(details),
            ),
        )
            .into_response();
    }

    match compile(&query, &state.config, state.options) {
        Ok(output) => (
            StatusCode::OK,
            Json(CompileResponse {
                success: true,
                query: QueryInfo {
                    id: query.id,
                    name: query.name,
                },
                graph: output.diagram,
                sql: SqlPayload {
                    query: output.sql,
                    parameters: output.parameters,
                },
            }),
        )
            .into_response(),
        Err(err) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse::new("compilation_failed", err.to_string())),
        )
            .into_response(),
    }
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new("not_found", "unknown route")),
    )
        .into_response()
}
