//! Router, handlers and the JSON error mapping.
//!
//! Inference runs on the blocking pool. A panic there, or anywhere else in a
//! handler, becomes the catch-all 500 body.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use severity_core::align::RawRecord;
use severity_core::{ModelState, PredictError, Prediction, Predictor};
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

const INDEX_HTML: &str = include_str!("../templates/index.html");
const APP_JS: &str = include_str!("../static/js/app.js");

/// Shared, read-only request state.
#[derive(Clone)]
pub struct AppState {
    pub predictor: Arc<Predictor>,
    /// Include failure text in catch-all 500 responses.
    pub expose_error_details: bool,
}

impl AppState {
    pub fn new(predictor: Predictor, expose_error_details: bool) -> Self {
        Self {
            predictor: Arc::new(predictor),
            expose_error_details,
        }
    }
}

/// Every non-200 answer the service gives.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("No input data provided")]
    NoInput,

    #[error("Model or target encoder not loaded")]
    ModelUnavailable,

    /// Detail stays in the server log.
    #[error("Prediction failed, see server logs")]
    PredictionFailed,

    #[error("Resource not found")]
    NotFound { path: String },

    #[error("Method not allowed")]
    MethodNotAllowed { method: Method, path: String },

    #[error("Request body rejected")]
    BodyRejected { status: StatusCode, details: String },

    #[error("An unexpected error occurred")]
    Unexpected { details: String },
}

const HIDDEN_DETAILS: &str = "Internal error, see server logs";

impl ApiError {
    fn unexpected(details: String, expose: bool) -> Self {
        let details = if expose {
            details
        } else {
            HIDDEN_DETAILS.to_string()
        };
        Self::Unexpected { details }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NoInput => StatusCode::BAD_REQUEST,
            Self::ModelUnavailable | Self::PredictionFailed | Self::Unexpected { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::BodyRejected { status, .. } => *status,
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            Self::NotFound { path } => Some(format!(
                "The requested URL {path} was not found on the server."
            )),
            Self::MethodNotAllowed { method, path } => Some(format!(
                "The method {method} is not allowed for the requested URL {path}."
            )),
            Self::BodyRejected { details, .. } | Self::Unexpected { details } => {
                Some(details.clone())
            }
            Self::NoInput | Self::ModelUnavailable | Self::PredictionFailed => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            details: self.details(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse<'a> {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    features: usize,
    encoders: usize,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let expose = state.expose_error_details;
    Router::new()
        .route("/", get(home))
        .route("/predict", post(predict))
        .route("/health", get(health))
        .route("/static/js/app.js", get(app_js))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .with_state(state)
        .layer(CatchPanicLayer::custom(move |err| panic_response(err, expose)))
        .layer(TraceLayer::new_for_http())
}

/// Serve on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn home() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn app_js() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/javascript; charset=utf-8")],
        APP_JS,
    )
}

async fn health(State(state): State<AppState>) -> Response {
    let predictor = &state.predictor;
    let (status, body) = match predictor.state() {
        ModelState::Ready { .. } => (
            StatusCode::OK,
            HealthResponse {
                status: "ready",
                reason: None,
                features: predictor.schema().len(),
                encoders: predictor.encoders().len(),
            },
        ),
        ModelState::Degraded { reason } => (
            StatusCode::SERVICE_UNAVAILABLE,
            HealthResponse {
                status: "degraded",
                reason: Some(reason.as_str()),
                features: predictor.schema().len(),
                encoders: predictor.encoders().len(),
            },
        ),
    };
    (status, Json(body)).into_response()
}

async fn predict(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Prediction>, ApiError> {
    if let Err(err) = state.predictor.ensure_ready() {
        tracing::warn!("{err}");
        return Err(ApiError::ModelUnavailable);
    }

    let body = body.map_err(|rejection| ApiError::BodyRejected {
        status: rejection.status(),
        details: rejection.body_text(),
    })?;
    let Some(record) = parse_record(&body) else {
        tracing::debug!("rejecting request without a JSON object body");
        return Err(ApiError::NoInput);
    };

    let predictor = Arc::clone(&state.predictor);
    match tokio::task::spawn_blocking(move || predictor.predict(&record)).await {
        Ok(Ok(prediction)) => Ok(Json(prediction)),
        Ok(Err(PredictError::ModelUnavailable)) => Err(ApiError::ModelUnavailable),
        Ok(Err(err)) => {
            tracing::error!("Error during prediction: {err}");
            Err(ApiError::PredictionFailed)
        }
        Err(join_err) => {
            let details = if join_err.is_panic() {
                panic_message(join_err.into_panic().as_ref())
            } else {
                join_err.to_string()
            };
            tracing::error!("Unhandled exception: {details}");
            Err(ApiError::unexpected(details, state.expose_error_details))
        }
    }
}

/// A non-empty JSON object, or `None` for anything else.
fn parse_record(body: &[u8]) -> Option<RawRecord> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) if !map.is_empty() => Some(map),
        _ => None,
    }
}

async fn not_found(uri: Uri) -> ApiError {
    let path = uri.path().to_string();
    tracing::warn!("404 Error: {path} not found");
    ApiError::NotFound { path }
}

async fn method_not_allowed(method: Method, uri: Uri) -> ApiError {
    let path = uri.path().to_string();
    tracing::warn!("405 Error: {method} {path}");
    ApiError::MethodNotAllowed { method, path }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn panic_response(payload: Box<dyn Any + Send + 'static>, expose: bool) -> Response {
    let details = panic_message(payload.as_ref());
    tracing::error!("Unhandled exception: {details}");
    ApiError::unexpected(details, expose).into_response()
}
