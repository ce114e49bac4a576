//! HTTP surface: `GET /health` and `POST /track`.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::service::{TrackError, TrackRequest, TrackResponse, TrackingService};

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

impl From<TrackError> for ApiError {
    fn from(err: TrackError) -> Self {
        match err {
            TrackError::InvalidRequest(message) => Self::bad_request(message),
            other => {
                log::error!("tracking failed: {other}");
                Self::internal(other.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

pub fn build_router(service: Arc<TrackingService>, cors: bool) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/track", post(track))
        .layer(TraceLayer::new_for_http())
        .with_state(service);
    if cors {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    app
}

pub async fn serve(service: Arc<TrackingService>, bind: &str, cors: bool) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    log::info!("tracking API listening on {bind}");
    axum::serve(listener, build_router(service, cors))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("tracking API shutting down");
        })
        .await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy", "timestamp": Utc::now()}))
}

async fn track(
    State(service): State<Arc<TrackingService>>,
    payload: Result<Json<TrackRequest>, JsonRejection>,
) -> Result<Json<TrackResponse>, ApiError> {
    let Json(request) = payload?;
    let response = service.track(request).await?;
    Ok(Json(response))
}
