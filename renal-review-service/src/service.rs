use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use clinical_core::{
    Decision, DecisionModel, KnowledgeBase, KnowledgeCache, decide, expand_terms,
    extract_clinical_data,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::models::{
    AnalyzeDocumentRequest, AnalyzeDocumentResponse, DecisionRequest, ExpandTermsRequest,
    ExpandTermsResponse,
};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

#[derive(Clone)]
pub struct AppState {
    pub knowledge: Arc<KnowledgeCache>,
    pub model: Arc<dyn DecisionModel>,
}

pub fn create_app(knowledge: Arc<KnowledgeCache>, model: Arc<dyn DecisionModel>) -> Router {
    let app_state = AppState { knowledge, model };
    build_router(app_state)
}

fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/terms/expand", post(expand_terms_handler))
        .route("/documents/analyze", post(analyze_document))
        .route("/decisions", post(make_decision))
        .route("/knowledge/reload", post(reload_knowledge))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Renal Claims Review Service",
        "version": "1.0.0",
        "description": "Clinical value extraction, term expansion and appeal decisioning for kidney-disease claims",
        "endpoints": {
            "POST /terms/expand": "Expand known medical abbreviations found in text",
            "POST /documents/analyze": "Extract clinical values and term expansions from document text",
            "POST /decisions": "Produce an APPROVE/REJECT/REVIEW decision for extracted clinical data",
            "POST /knowledge/reload": "Force a knowledge base reload",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

fn validate_text(text: &str) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(bad_request_error("Document text is required"));
    }
    Ok(())
}

async fn load_knowledge(state: &AppState) -> Result<Arc<KnowledgeBase>, ApiError> {
    state.knowledge.get().await.map_err(|e| {
        error!("Failed to load knowledge base: {}", e);
        internal_error("Knowledge base unavailable", &e.to_string())
    })
}

async fn expand_terms_handler(
    State(state): State<AppState>,
    Json(request): Json<ExpandTermsRequest>,
) -> ApiResult<ExpandTermsResponse> {
    validate_text(&request.text)?;
    let knowledge = load_knowledge(&state).await?;

    let expansions = expand_terms(&request.text, &knowledge);
    info!("Expanded {} terms", expansions.len());

    Ok(Json(ExpandTermsResponse {
        text: request.text,
        expansions,
    }))
}

async fn analyze_document(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeDocumentRequest>,
) -> ApiResult<AnalyzeDocumentResponse> {
    validate_text(&request.text)?;
    let knowledge = load_knowledge(&state).await?;

    let document_id = Uuid::new_v4().to_string();
    info!(
        "Analyzing document {} ({} characters)",
        document_id,
        request.text.len()
    );

    // Expansion and extraction are independent passes over the same text
    let expansions = expand_terms(&request.text, &knowledge);
    let clinical_data = extract_clinical_data(&request.text, &knowledge);
    let ckd_stage = clinical_data
        .gfr
        .and_then(|gfr| knowledge.stage_for_gfr(gfr))
        .cloned();

    Ok(Json(AnalyzeDocumentResponse {
        document_id,
        expansions,
        clinical_data,
        ckd_stage,
    }))
}

async fn make_decision(
    State(state): State<AppState>,
    Json(request): Json<DecisionRequest>,
) -> ApiResult<Decision> {
    validate_text(&request.text)?;
    let knowledge = load_knowledge(&state).await?;

    let decision = decide(
        &request.clinical_data,
        &request.text,
        &knowledge,
        state.model.as_ref(),
    )
    .await;

    info!(
        "Decision: {:?} (confidence {:.2}, source {:?})",
        decision.outcome, decision.confidence, decision.source
    );

    Ok(Json(decision))
}

async fn reload_knowledge(State(state): State<AppState>) -> ApiResult<Value> {
    let knowledge = state.knowledge.force_reload().await.map_err(|e| {
        error!("Forced knowledge base reload failed: {}", e);
        internal_error("Knowledge base reload failed", &e.to_string())
    })?;

    Ok(Json(json!({
        "status": "reloaded",
        "abbreviations": knowledge.abbreviations.len(),
        "complications": knowledge.complications.len(),
        "stages": knowledge.stages.len()
    })))
}
