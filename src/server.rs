use anyhow::Context;
use axum::{
    Router,
    extract::{Path, State},
    http::HeaderValue,
    response::Json,
    routing::{get, post},
};
use metrics::counter;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::engine::Engine;
use crate::error::{ApiError, ApiResult};
use crate::labels::Emotion;
use crate::reflection;
use crate::types::{
    ChatRequest, ChatResponse, PredictRequest, PredictResponse, RitualResponse, StatusResponse,
    ZeroShotRequest,
};

pub const STATUS_MESSAGE: &str = "MoodScape Brain is Active & Model Loaded";

#[derive(Clone)]
pub struct AppState {
    engine: Arc<dyn Engine + Send + Sync>,
}

impl AppState {
    pub fn new(engine: Arc<dyn Engine + Send + Sync>) -> Self {
        Self { engine }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/predict", post(predict_handler))
        .route("/chat", post(chat_handler))
        .route("/rituals/:emotion", get(ritual_handler))
        .with_state(state)
}

/// Browser clients live on another origin during development.
pub fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin.trim())
                .with_context(|| format!("Invalid CORS origin {origin:?}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any))
}

async fn status_handler() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: STATUS_MESSAGE.to_string(),
    })
}

#[tracing::instrument(skip(state, request), fields(text_len = request.text.len()))]
async fn predict_handler(
    State(state): State<AppState>,
    Json(request): Json<PredictRequest>,
) -> ApiResult<Json<PredictResponse>> {
    counter!("predict_requests_total").increment(1);

    if request.text.is_empty() {
        return Err(ApiError::BadRequest("Text cannot be empty".to_string()));
    }

    let response = state
        .engine
        .classify(ZeroShotRequest {
            text: request.text,
            labels: Emotion::ALL.to_vec(),
        })
        .await
        .inspect_err(|_| counter!("predict_failures_total").increment(1))?;

    let prediction = response
        .into_prediction()
        .context("Classifier returned no scores")?;

    tracing::info!(
        emotion = %prediction.emotion,
        confidence = prediction.confidence,
        "Prediction completed"
    );
    Ok(Json(prediction))
}

#[tracing::instrument(skip(request), fields(mood = %request.mood))]
async fn chat_handler(Json(request): Json<ChatRequest>) -> Json<ChatResponse> {
    counter!("chat_requests_total").increment(1);

    Json(ChatResponse {
        reply: reflection::reflect(&request.text, &request.mood).to_string(),
    })
}

async fn ritual_handler(Path(emotion): Path<String>) -> ApiResult<Json<RitualResponse>> {
    let emotion: Emotion = emotion
        .parse()
        .map_err(|e: crate::labels::UnknownEmotion| ApiError::NotFound(e.to_string()))?;
    let ritual = emotion.ritual();

    Ok(Json(RitualResponse {
        emotion,
        title: ritual.title,
        steps: ritual.steps,
    }))
}
