use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::error;

use crate::{
    error::StoreError,
    models::{ModelDraft, SemanticModelDraft, VisualizationDraft},
    AppState,
};

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "timestamp": Utc::now(),
        "storage": if state.models.configured() { "postgres" } else { "memory" },
    }))
}

pub async fn list_models(State(state): State<AppState>) -> Response {
    match state.models.fetch_all().await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => store_failure(err),
    }
}

pub async fn get_model(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.models.get(&key).await {
        Ok(Some(entry)) => Json(entry).into_response(),
        Ok(None) => not_found("MODEL_NOT_FOUND", "No model matches that identifier or alias."),
        Err(err) => store_failure(err),
    }
}

pub async fn upsert_model(
    State(state): State<AppState>,
    Json(draft): Json<ModelDraft>,
) -> Response {
    match state.models.upsert(draft).await {
        Ok(entry) => (StatusCode::OK, Json(entry)).into_response(),
        Err(err) => store_failure(err),
    }
}

pub async fn list_semantic_models(State(state): State<AppState>) -> Response {
    match state.semantics.fetch_all().await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => store_failure(err),
    }
}

pub async fn get_semantic_model(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Response {
    match state.semantics.get(&key).await {
        Ok(Some(entry)) => Json(entry).into_response(),
        Ok(None) => not_found(
            "SEMANTIC_MODEL_NOT_FOUND",
            "No semantic model matches that identifier or dataset.",
        ),
        Err(err) => store_failure(err),
    }
}

pub async fn upsert_semantic_model(
    State(state): State<AppState>,
    Json(draft): Json<SemanticModelDraft>,
) -> Response {
    match state.semantics.upsert(draft).await {
        Ok(entry) => (StatusCode::OK, Json(entry)).into_response(),
        Err(err) => store_failure(err),
    }
}

pub async fn list_visualizations(State(state): State<AppState>) -> Response {
    match state.visualizations.fetch_all().await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => store_failure(err),
    }
}

pub async fn get_visualization(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.visualizations.get(&id).await {
        Ok(Some(entry)) => Json(entry).into_response(),
        Ok(None) => not_found("VISUALIZATION_NOT_FOUND", "Visualization not found."),
        Err(err) => store_failure(err),
    }
}

pub async fn upsert_visualization(
    State(state): State<AppState>,
    Json(draft): Json<VisualizationDraft>,
) -> Response {
    match state.visualizations.upsert(draft).await {
        Ok(entry) => (StatusCode::OK, Json(entry)).into_response(),
        Err(err) => store_failure(err),
    }
}

pub async fn delete_visualization(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.visualizations.delete(&id).await {
        Ok(true) => Json(json!({ "deleted": true, "id": id })).into_response(),
        Ok(false) => not_found("VISUALIZATION_NOT_FOUND", "Visualization not found."),
        Err(err) => store_failure(err),
    }
}

pub async fn get_preferences(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    match state.preferences.get(&user_id).await {
        // An unknown user simply has no stored preferences yet.
        Ok(None) => Json(json!({ "userId": user_id, "preferences": {} })).into_response(),
        Ok(Some(entry)) => Json(entry).into_response(),
        Err(err) => store_failure(err),
    }
}

pub async fn put_preferences(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(preferences): Json<Value>,
) -> Response {
    match state.preferences.set(&user_id, preferences).await {
        Ok(entry) => Json(entry).into_response(),
        Err(err) => store_failure(err),
    }
}

fn not_found(code: &str, message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": { "code": code, "message": message } })),
    )
        .into_response()
}

fn store_failure(err: StoreError) -> Response {
    match err {
        StoreError::InvalidRecord(message) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "code": "INVALID_RECORD", "message": message } })),
        )
            .into_response(),
        other => {
            error!(error = %other, "catalogue store operation failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": {
                        "code": "STORE_UNAVAILABLE",
                        "message": "The catalogue backend is unavailable."
                    }
                })),
            )
                .into_response()
        }
    }
}
