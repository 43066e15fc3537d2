//! REST API consumed by the dashboard.
//!
//! Management routes (rules, channels, rule destinations, endpoints)
//! invalidate the routing cache after every successful write. Query routes
//! read straight from the store. Authentication is handled in front of
//! this router.

pub mod routes;

use std::sync::Arc;

use axum::Json;
use axum::extract::FromRequest;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::error::{ApiError, DatabaseError, PipelineError};
use crate::pipeline::{Pipeline, RoutingCache};
use crate::store::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Database>,
    pub cache: Arc<RoutingCache>,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            store: Arc::clone(pipeline.store()),
            cache: Arc::clone(pipeline.cache()),
            pipeline,
        }
    }
}

/// JSON body extractor whose rejections use the API error shape.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

/// The full router: REST routes plus a permissive CORS layer for the SPA.
pub fn router(state: AppState) -> axum::Router {
    routes::api_routes(state).layer(CorsLayer::permissive())
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Database(DatabaseError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Database(DatabaseError::Constraint(_)) => StatusCode::CONFLICT,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Pipeline(PipelineError::InvalidMessage(_)) => StatusCode::BAD_REQUEST,
            Self::Pipeline(PipelineError::Unauthorized(_)) => StatusCode::UNAUTHORIZED,
            Self::Pipeline(PipelineError::EndpointInactive(_)) => StatusCode::FORBIDDEN,
            Self::Pipeline(PipelineError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "API error");
        }
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}
