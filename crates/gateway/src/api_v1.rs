//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST   /v1/turns`                              — run one conversational turn
//! - `POST   /v1/feedback`                           — record reviewer feedback
//! - `GET    /v1/feedback`                           — filtered feedback listing
//! - `PATCH  /v1/feedback/{id}`                      — partial update
//! - `DELETE /v1/feedback/{id}`                      — hard delete
//! - `PUT    /v1/agents/{agent_id}/knowledge-links`  — replace the linked set
//! - `GET    /v1/agents/{agent_id}/knowledge-links`  — read the linked set
//! - `GET    /v1/agents/{agent_id}/examples/export`  — deterministic export
//! - `GET    /v1/conversations/{contact_id}`         — recent window + summary
//! - `DELETE /v1/conversations/{contact_id}`         — purge a conversation
//! - `GET    /v1/audit`                              — recent audit records

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

use attune_assembler::TurnError;
use attune_core::error::{AuditError, CuratorError, InferenceError, KnowledgeError, LedgerError};
use attune_core::feedback::{
    ExamplesExport, FeedbackExample, FeedbackFilter, FeedbackInput, FeedbackPage, FeedbackPatch,
};
use attune_core::inference::InferenceOutcome;
use attune_core::ledger::LedgerMessage;
use attune_core::AuditRecord;

use crate::SharedState;

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        .route("/turns", post(turn_handler))
        .route("/feedback", post(create_feedback_handler))
        .route("/feedback", get(list_feedback_handler))
        .route(
            "/feedback/{id}",
            axum::routing::patch(update_feedback_handler),
        )
        .route("/feedback/{id}", delete(delete_feedback_handler))
        .route("/agents/{agent_id}/knowledge-links", put(set_links_handler))
        .route("/agents/{agent_id}/knowledge-links", get(get_links_handler))
        .route(
            "/agents/{agent_id}/examples/export",
            get(export_examples_handler),
        )
        .route("/conversations/{contact_id}", get(get_conversation_handler))
        .route(
            "/conversations/{contact_id}",
            delete(delete_conversation_handler),
        )
        .route("/audit", get(list_audit_handler))
        .with_state(state)
}

// ── DTOs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TurnRequest {
    tenant_id: i64,
    contact_id: String,
    agent_id: i64,
    message: String,
}

#[derive(Debug, Serialize)]
struct TurnResponse {
    response: String,
    success: bool,
    latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_used: Option<String>,
    reduced_context: bool,
}

#[derive(Debug, Deserialize)]
struct TenantQuery {
    tenant_id: i64,
}

#[derive(Debug, Deserialize)]
struct ListFeedbackQuery {
    tenant_id: i64,
    agent_id: Option<i64>,
    team_id: Option<i64>,
    feedback_type: Option<String>,
    used_in_prompt: Option<bool>,
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_page_limit")]
    limit: usize,
}

fn default_page_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
struct SetLinksRequest {
    tenant_id: i64,
    document_ids: BTreeSet<i64>,
}

#[derive(Debug, Serialize)]
struct LinksResponse {
    agent_id: i64,
    document_ids: BTreeSet<i64>,
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    tenant_id: i64,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ConversationQuery {
    tenant_id: i64,
    #[serde(default = "default_page_limit")]
    limit: usize,
}

#[derive(Debug, Serialize)]
struct ConversationResponse {
    contact_id: String,
    messages: Vec<LedgerMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    tenant_id: i64,
    agent_id: Option<i64>,
    #[serde(default = "default_page_limit")]
    limit: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl std::fmt::Display) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn curator_error(e: CuratorError) -> ApiError {
    let status = match e {
        CuratorError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        CuratorError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e)
}

fn ledger_error(e: LedgerError) -> ApiError {
    let status = match e {
        LedgerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        LedgerError::Conflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e)
}

fn knowledge_error(e: KnowledgeError) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
}

fn audit_error(e: AuditError) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
}

fn turn_error(e: TurnError) -> ApiError {
    match e {
        TurnError::Timeout { .. } => api_error(StatusCode::GATEWAY_TIMEOUT, e),
        TurnError::Ledger(e) => ledger_error(e),
    }
}

fn inference_status(e: &InferenceError) -> StatusCode {
    match e {
        InferenceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        InferenceError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        InferenceError::Api { .. } => StatusCode::BAD_GATEWAY,
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `POST /v1/turns` — assemble context, call inference, record the outcome.
///
/// The user message is persisted before inference runs, so an upstream
/// failure leaves it in the ledger and produces a failed audit record.
async fn turn_handler(
    State(state): State<SharedState>,
    Json(payload): Json<TurnRequest>,
) -> Result<Json<TurnResponse>, ApiError> {
    info!(
        tenant = payload.tenant_id,
        agent = payload.agent_id,
        "v1/turns request"
    );

    let request = state
        .assembler
        .handle_turn(
            payload.tenant_id,
            payload.agent_id,
            &payload.contact_id,
            &payload.message,
        )
        .await
        .map_err(turn_error)?;

    let started = std::time::Instant::now();
    match state.inference.complete(&request).await {
        Ok(reply) => {
            let outcome = InferenceOutcome::success(reply.response.clone(), reply.latency_ms);
            if let Err(e) = state.assembler.record_result(&request, &outcome).await {
                warn!("Failed to persist turn outcome: {e}");
            }
            Ok(Json(TurnResponse {
                response: reply.response,
                success: true,
                latency_ms: reply.latency_ms,
                agent_used: reply.agent_used,
                reduced_context: request.reduced_context,
            }))
        }
        Err(e) => {
            let latency_ms = started.elapsed().as_millis() as u64;
            let outcome = InferenceOutcome::failure(e.to_string(), latency_ms);
            if let Err(persist) = state.assembler.record_result(&request, &outcome).await {
                warn!("Failed to persist turn outcome: {persist}");
            }
            Err(api_error(inference_status(&e), e))
        }
    }
}

/// `POST /v1/feedback` — record reviewer feedback, 201 on success.
async fn create_feedback_handler(
    State(state): State<SharedState>,
    Json(input): Json<FeedbackInput>,
) -> Result<(StatusCode, Json<FeedbackExample>), ApiError> {
    let example = state.examples.record(input).await.map_err(curator_error)?;
    Ok((StatusCode::CREATED, Json(example)))
}

async fn list_feedback_handler(
    State(state): State<SharedState>,
    Query(query): Query<ListFeedbackQuery>,
) -> Result<Json<FeedbackPage>, ApiError> {
    let feedback_type = query
        .feedback_type
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(curator_error)?;
    let page = state
        .examples
        .list(
            query.tenant_id,
            FeedbackFilter {
                agent_id: query.agent_id,
                team_id: query.team_id,
                feedback_type,
                used_in_prompt: query.used_in_prompt,
                offset: query.offset,
                limit: query.limit,
            },
        )
        .await
        .map_err(curator_error)?;
    Ok(Json(page))
}

async fn update_feedback_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<TenantQuery>,
    Json(patch): Json<FeedbackPatch>,
) -> Result<Json<FeedbackExample>, ApiError> {
    let example = state
        .examples
        .update(&id, query.tenant_id, patch)
        .await
        .map_err(curator_error)?;
    Ok(Json(example))
}

async fn delete_feedback_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<TenantQuery>,
) -> Result<StatusCode, ApiError> {
    state
        .examples
        .remove(&id, query.tenant_id)
        .await
        .map_err(curator_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_links_handler(
    State(state): State<SharedState>,
    Path(agent_id): Path<i64>,
    Json(payload): Json<SetLinksRequest>,
) -> Result<Json<LinksResponse>, ApiError> {
    state
        .links
        .set_links(payload.tenant_id, agent_id, payload.document_ids.clone())
        .await
        .map_err(knowledge_error)?;
    Ok(Json(LinksResponse {
        agent_id,
        document_ids: payload.document_ids,
    }))
}

async fn get_links_handler(
    State(state): State<SharedState>,
    Path(agent_id): Path<i64>,
    Query(query): Query<TenantQuery>,
) -> Result<Json<LinksResponse>, ApiError> {
    let document_ids = state
        .links
        .links_for(query.tenant_id, agent_id)
        .await
        .map_err(knowledge_error)?;
    Ok(Json(LinksResponse {
        agent_id,
        document_ids,
    }))
}

async fn export_examples_handler(
    State(state): State<SharedState>,
    Path(agent_id): Path<i64>,
    Query(query): Query<ExportQuery>,
) -> Result<Json<ExamplesExport>, ApiError> {
    let limit = query.limit.unwrap_or(state.export_limit);
    let export = state
        .examples
        .export(query.tenant_id, agent_id, limit)
        .await
        .map_err(curator_error)?;
    Ok(Json(export))
}

async fn get_conversation_handler(
    State(state): State<SharedState>,
    Path(contact_id): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let messages = state
        .ledger
        .recent_messages(query.tenant_id, &contact_id, query.limit)
        .await
        .map_err(ledger_error)?;
    let summary = state
        .ledger
        .summary(query.tenant_id, &contact_id)
        .await
        .map_err(ledger_error)?;
    Ok(Json(ConversationResponse {
        contact_id,
        messages,
        summary,
    }))
}

async fn delete_conversation_handler(
    State(state): State<SharedState>,
    Path(contact_id): Path<String>,
    Query(query): Query<TenantQuery>,
) -> Result<StatusCode, ApiError> {
    state
        .ledger
        .delete_ledger(query.tenant_id, &contact_id)
        .await
        .map_err(ledger_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_audit_handler(
    State(state): State<SharedState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditRecord>>, ApiError> {
    let records = state
        .audit
        .recent(query.tenant_id, query.agent_id, query.limit)
        .await
        .map_err(audit_error)?;
    Ok(Json(records))
}
