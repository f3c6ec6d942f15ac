use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::{StatusCode, Uri},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::artifact::ModelHandle;
use crate::config::Config;
use crate::errors::AppError;
use crate::features::{vectorize, UnknownFields};
use crate::health::{LifecycleState, Readiness};
use crate::inference::{predict as score_vector, RiskPrediction};
use crate::models::*;

/// Shared application state injected into handlers.
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Lifecycle state and the write-once model handle.
    pub readiness: Arc<Readiness>,
    /// Bounds concurrent CPU-bound scoring jobs.
    scoring_permits: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: Config, readiness: Arc<Readiness>) -> Self {
        let scoring_permits = Arc::new(Semaphore::new(config.max_concurrent_scoring));
        Self {
            config,
            readiness,
            scoring_permits,
        }
    }

    fn model(&self) -> Result<Arc<ModelHandle>, AppError> {
        self.readiness
            .model()
            .cloned()
            .ok_or(AppError::ModelUnavailable)
    }

    /// Runs a CPU-bound scoring job on the blocking pool within the
    /// request's processing budget.
    ///
    /// The budget covers both waiting for a scoring permit and the job
    /// itself. The permit moves into the job so it is held until the work
    /// actually finishes, even if the caller has already timed out.
    async fn run_scoring<T, F>(&self, job: F) -> Result<T, AppError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let budget = self.config.request_timeout;
        let permits = self.scoring_permits.clone();

        let work = async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|_| AppError::InternalError("scoring pool closed".to_string()))?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                job()
            })
            .await
            .map_err(|e| AppError::InternalError(format!("scoring task failed: {}", e)))
        };

        match tokio::time::timeout(budget, work).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Overloaded {
                budget_ms: budget.as_millis() as u64,
            }),
        }
    }
}

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Vectorizes and scores one decoded profile.
fn score_profile(
    profile: &BusinessProfileRequest,
    model: &ModelHandle,
    unknown: UnknownFields,
) -> Result<RiskPrediction, AppError> {
    let vector = vectorize(profile, model.schema(), unknown)?;
    score_vector(&vector, model).map_err(|e| {
        tracing::error!(
            target: "scoring_invariant",
            model_version = %model.model_version(),
            sha256 = %model.sha256(),
            error = %e,
            "Scoring invariant violated; code and model artifact disagree"
        );
        AppError::from(e)
    })
}

/// Builds the HTTP router.
///
/// Health endpoints bypass rate limiting so orchestration probes are never
/// throttled. The body limit is enforced by the `Json` extractor, so an
/// oversized body surfaces as a structured `payload_too_large` error.
pub fn router(state: Arc<AppState>) -> anyhow::Result<Router> {
    let mut scoring_routes: Router<Arc<AppState>> = Router::new()
        .route("/predict", post(predict))
        .route("/predict/batch", post(predict_batch))
        .route("/model", get(model_info))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes));

    let per_second = state.config.rate_limit_per_second;
    if per_second > 0 {
        // governor replenishes one request every `interval` nanoseconds
        let interval_ns = (NANOS_PER_SECOND / per_second).max(1);
        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .per_nanosecond(interval_ns)
                .burst_size(state.config.rate_limit_burst)
                .error_handler(|e| AppError::from(e).into_response())
                .key_extractor(SmartIpKeyExtractor)
                .finish()
                .ok_or_else(|| anyhow::anyhow!("invalid rate limit configuration"))?,
        );
        scoring_routes = scoring_routes.layer(GovernorLayer {
            config: governor_conf,
        });
        tracing::info!(
            "Rate limiting enabled: {} req/s per IP, burst {}",
            per_second,
            state.config.rate_limit_burst
        );
    }

    Ok(Router::new()
        .route("/health", get(health))
        .route("/live", get(live))
        .merge(scoring_routes)
        .fallback(not_found)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        ))
}

/// Readiness endpoint.
///
/// Returns 200 once the model artifact has loaded, 503 while starting or
/// after a failed load.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let mut response = HealthResponse {
        status: "starting",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        model_version: None,
        artifact_sha256: None,
        reason: None,
    };

    let status = match state.readiness.state() {
        LifecycleState::Starting => StatusCode::SERVICE_UNAVAILABLE,
        LifecycleState::Ready(model) => {
            response.status = "ready";
            response.model_version = Some(model.model_version().to_string());
            response.artifact_sha256 = Some(model.sha256().to_string());
            StatusCode::OK
        }
        LifecycleState::Failed(reason) => {
            response.status = "failed";
            response.reason = Some(reason);
            StatusCode::SERVICE_UNAVAILABLE
        }
    };

    (status, Json(response))
}

/// Liveness endpoint: answers as long as the process serves HTTP.
pub async fn live() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "alive" })))
}

/// POST /predict
///
/// Scores a single business profile.
pub async fn predict(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<PredictionResponse>, AppError> {
    let Json(body) = payload?;
    let profile = BusinessProfileRequest::from_json(body)?;

    let model = state.model()?;
    let request_id = Uuid::new_v4();
    tracing::debug!(%request_id, attributes = profile.len(), "POST /predict");

    let unknown = state.config.unknown_fields();
    let scoring_model = model.clone();
    let prediction = state
        .run_scoring(move || score_profile(&profile, &scoring_model, unknown))
        .await??;

    tracing::info!(
        %request_id,
        probability = prediction.probability,
        label = ?prediction.label,
        model_version = %prediction.model_version,
        "Prediction served"
    );

    Ok(Json(PredictionResponse::new(request_id, &prediction, &model)))
}

/// POST /predict/batch
///
/// Scores up to `MAX_BATCH_SIZE` records. Validation failures are reported
/// per record; an internal scoring error fails the whole batch.
pub async fn predict_batch(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<BatchPredictionResponse>, AppError> {
    let Json(body) = payload?;
    let batch: BatchPredictionRequest = serde_json::from_value(body)
        .map_err(|e| AppError::InvalidPayload(format!("expected {{\"records\": [...]}}: {}", e)))?;

    if batch.records.is_empty() {
        return Err(AppError::InvalidBatch("batch contains no records".to_string()));
    }
    let max = state.config.max_batch_size;
    if batch.records.len() > max {
        return Err(AppError::InvalidBatch(format!(
            "batch contains {} records, the limit is {}",
            batch.records.len(),
            max
        )));
    }

    let model = state.model()?;
    let request_id = Uuid::new_v4();
    let total = batch.records.len();
    tracing::debug!(%request_id, records = total, "POST /predict/batch");

    let unknown = state.config.unknown_fields();
    let scoring_model = model.clone();
    let results = state
        .run_scoring(move || -> Result<Vec<BatchItemResult>, AppError> {
            batch
                .records
                .into_iter()
                .enumerate()
                .map(|(index, record)| {
                    let outcome = BusinessProfileRequest::from_json(record)
                        .map_err(AppError::from)
                        .and_then(|profile| score_profile(&profile, &scoring_model, unknown));
                    match outcome {
                        Ok(prediction) => Ok(BatchItemResult::Scored {
                            index,
                            prediction: ScoredRecord::from(&prediction),
                        }),
                        Err(e @ AppError::InternalScoring(_)) => Err(e),
                        Err(e) => Ok(BatchItemResult::Rejected {
                            index,
                            error: e.body(),
                        }),
                    }
                })
                .collect()
        })
        .await??;

    let response = BatchPredictionResponse::new(request_id, &model, results);
    tracing::info!(
        %request_id,
        total = response.total,
        succeeded = response.succeeded,
        failed = response.failed,
        "Batch prediction served"
    );

    Ok(Json(response))
}

/// GET /model
///
/// Metadata of the loaded artifact, for audits and deployment checks.
pub async fn model_info(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ModelInfoResponse>, AppError> {
    let model = state.model()?;
    Ok(Json(ModelInfoResponse::from(model.as_ref())))
}

async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("no route for {}", uri.path()))
}
