use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::PredictError;
use crate::predictor::{Prediction, Predictor};
use crate::request::PredictionRequest;
use crate::weights::{WeightCategory, WeightManifest};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    predictor: Predictor,
    manifest: WeightManifest,
}

impl AppState {
    pub fn new(predictor: Predictor, manifest: WeightManifest) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                predictor,
                manifest,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PredictionBody {
    #[serde(default)]
    pub id: Option<String>,
    pub input: PredictionRequest,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictionMetrics {
    pub predict_time: f64,
    pub seed: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub id: String,
    pub status: PredictionStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub metrics: Option<PredictionMetrics>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WeightStatus {
    pub name: String,
    pub category: WeightCategory,
    pub path: String,
    pub present: bool,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/predictions", post(create_prediction))
        .route("/weights", get(list_weights))
        .fallback(route_not_found)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds `addr` and serves until ctrl-c.
pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Prediction server listening");
    axum::serve(listener, app_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "READY" })
}

async fn route_not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("endpoint not found: {}", uri.path()))
}

async fn list_weights(State(state): State<AppState>) -> Json<Vec<WeightStatus>> {
    let manifest = &state.inner.manifest;
    let weights = manifest
        .list()
        .iter()
        .map(|entry| WeightStatus {
            name: entry.name.clone(),
            category: entry.category,
            path: manifest.destination(entry).display().to_string(),
            present: manifest.is_present(entry),
        })
        .collect();
    Json(weights)
}

async fn create_prediction(
    State(state): State<AppState>,
    body: Result<Json<PredictionBody>, JsonRejection>,
) -> (StatusCode, Json<PredictionResponse>) {
    let started_at = Utc::now();

    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Rejected malformed prediction body");
            let response = failed_response(
                Uuid::new_v4().to_string(),
                rejection.body_text(),
                started_at,
            );
            return (StatusCode::UNPROCESSABLE_ENTITY, Json(response));
        }
    };

    let id = body
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(prediction_id = %id, "Prediction requested");

    let worker_state = state.clone();
    let worker_id = id.clone();
    let joined = tokio::task::spawn_blocking(move || {
        worker_state
            .inner
            .predictor
            .predict_with_id(worker_id, body.input)
    })
    .await;

    match joined {
        Ok(Ok(prediction)) => (StatusCode::OK, Json(succeeded_response(prediction, started_at))),
        Ok(Err(err)) => {
            let status = status_for(&err);
            if status.is_server_error() {
                error!(prediction_id = %id, error = %err, "Prediction failed");
            } else {
                warn!(prediction_id = %id, error = %err, "Prediction input rejected");
            }
            (status, Json(failed_response(id, err.to_string(), started_at)))
        }
        Err(join_err) => {
            error!(prediction_id = %id, error = %join_err, "Prediction worker panicked");
            let message = format!("prediction worker failed: {join_err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(failed_response(id, message, started_at)),
            )
        }
    }
}

fn status_for(err: &PredictError) -> StatusCode {
    if err.is_client_error() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn succeeded_response(prediction: Prediction, started_at: DateTime<Utc>) -> PredictionResponse {
    PredictionResponse {
        id: prediction.id,
        status: PredictionStatus::Succeeded,
        output: Some(prediction.output.display().to_string()),
        error: None,
        metrics: Some(PredictionMetrics {
            predict_time: prediction.elapsed.as_secs_f64(),
            seed: prediction.seed,
        }),
        started_at,
        completed_at: Utc::now(),
    }
}

fn failed_response(id: String, error: String, started_at: DateTime<Utc>) -> PredictionResponse {
    PredictionResponse {
        id,
        status: PredictionStatus::Failed,
        output: None,
        error: Some(error),
        metrics: None,
        started_at,
        completed_at: Utc::now(),
    }
}

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
