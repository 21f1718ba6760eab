//! HTTP request handlers: the thinnest possible adapter from axum routes
//! onto the core components, grounded on teacher's `api/handlers.rs`
//! (`create_router`, `State<AppState>` extractors, `AppError` propagation)
//! generalized from one conversation-centric surface to one per-user
//! surface over every substrate component.

use super::sse::sse_stream;
use super::types::{
    ChatRequest, ChatResponse, CreateScheduleRequest, DelegateRequest, DelegateResponse,
    MemorySearchQuery, NewMemoryRequest, StorageResponse, SuccessResponse,
};
use super::AgentHost;
use crate::error::AppError;
use crate::ids::{MemoryId, ScheduleId, TaskId, UserId};
use crate::llm::LlmErrorKind;
use crate::memory::{Memory, NewMemory, SourceType};
use crate::scheduler::ScheduledTask;
use crate::session::chat_log::TurnRole;
use crate::session::recovery::{recovery_trigger, RecoveryTrigger};
use crate::session::{ExpireReason, RecoveryContext};
use crate::task_manager::SubAgentTask;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

/// Wire together every route the dashboard / chat adapter reaches the
/// substrate through, all under `/api/users/:user_id/...` since every
/// resource in this system is scoped to exactly one user (§3 "Ownership").
pub fn create_router(host: AgentHost) -> Router {
    Router::new()
        .route("/api/users/:user_id/chat", post(send_chat))
        .route("/api/users/:user_id/events", get(stream_events))
        .route("/api/users/:user_id/storage", get(get_storage))
        .route("/api/users/:user_id/tasks", get(list_tasks).post(create_task))
        .route("/api/users/:user_id/tasks/:task_id", get(get_task))
        .route("/api/users/:user_id/tasks/:task_id/cancel", post(cancel_task))
        .route(
            "/api/users/:user_id/memories",
            get(search_memories).post(create_memory),
        )
        .route("/api/users/:user_id/memories/:memory_id", axum::routing::delete(delete_memory))
        .route(
            "/api/users/:user_id/schedules",
            get(list_schedules).post(create_schedule),
        )
        .route(
            "/api/users/:user_id/schedules/:schedule_id",
            get(get_schedule).delete(delete_schedule),
        )
        .route("/api/users/:user_id/schedules/:schedule_id/enable", post(enable_schedule))
        .route("/api/users/:user_id/schedules/:schedule_id/disable", post(disable_schedule))
        .route("/api/users/:user_id/schedules/:schedule_id/reset", post(reset_schedule))
        .route("/version", get(get_version))
        .with_state(host)
}

// ============================================================
// Session & Conversation Lifecycle (§4.1)
// ============================================================

/// Route a chat message: resume or open the user's Session, recover
/// context if the session is stale or the backend forgot it, invoke the
/// LLM, and log both turns.
async fn send_chat(
    State(host): State<AgentHost>,
    Path(user_id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let user_id = UserId::from(user_id);
    let user = host
        .users
        .get_or_create(&user_id)
        .await
        .map_err(AppError::from)?;
    if !user.enabled {
        return Err(AppError::Validation("user is disabled".to_string()));
    }

    let session = host
        .sessions
        .open_or_resume(&user.id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    host.sessions
        .record_turn(&user.id, TurnRole::User, &req.text, 0, 0, 0.0)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let trigger = recovery_trigger(
        session.last_activity,
        Utc::now(),
        host.config.context_stale_threshold(),
        session.last_call_remote_unknown,
    );
    let prompt = if trigger == RecoveryTrigger::None {
        req.text.clone()
    } else {
        let context = host
            .sessions
            .recover_context(&user.id)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        render_recovered_prompt(&context, &req.text)
    };

    let cancellation = CancellationToken::new();
    let response = match host
        .sessions
        .invoke(&user.id, prompt, cancellation.clone())
        .await
    {
        Ok(response) => response,
        Err(e) if e.kind == LlmErrorKind::RemoteUnknown => {
            host.sessions
                .expire(&session, ExpireReason::RemoteUnknown)
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?;
            host.sessions
                .open_or_resume(&user.id)
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?;
            let context = host
                .sessions
                .recover_context(&user.id)
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?;
            let retry_prompt = render_recovered_prompt(&context, &req.text);
            host.sessions
                .invoke(&user.id, retry_prompt, cancellation)
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?
        }
        Err(e) => return Err(AppError::Internal(e.to_string())),
    };

    let updated_session = host
        .sessions
        .record_turn(
            &user.id,
            TurnRole::Agent,
            &response.text,
            response.usage.input_tokens,
            response.usage.output_tokens,
            0.0,
        )
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(ChatResponse {
        session_id: updated_session.id.as_str().to_string(),
        reply: response.text,
    }))
}

/// Render the context block `recover_context` returns into a single text
/// prefix prepended to the user's new message, since the opaque
/// `LlmBackend::invoke` contract (§6) takes one prompt string.
fn render_recovered_prompt(context: &RecoveryContext, text: &str) -> String {
    let mut out = String::new();
    if !context.recent_summaries.is_empty() {
        out.push_str("Recent conversation summaries:\n");
        for summary in &context.recent_summaries {
            out.push_str(&summary.summary_text);
            out.push('\n');
        }
        out.push('\n');
    }
    if !context.chat_log_excerpt.is_empty() {
        out.push_str("Recent conversation log:\n");
        out.push_str(&context.chat_log_excerpt);
        out.push_str("\n\n");
    }
    out.push_str(text);
    out
}

// ============================================================
// Event Bus (§4.5)
// ============================================================

async fn stream_events(State(host): State<AgentHost>, Path(user_id): Path<String>) -> impl IntoResponse {
    let user_id = UserId::from(user_id);
    let subscription = host.event_bus.subscribe(&user_id).await;
    sse_stream(subscription.receiver)
}

// ============================================================
// Quota (consumed via §6 QuotaGate)
// ============================================================

async fn get_storage(State(host): State<AgentHost>, Path(user_id): Path<String>) -> Json<StorageResponse> {
    let user_id = UserId::from(user_id);
    let report = host.quota.report(&user_id).await;
    Json(StorageResponse {
        used_bytes: report.used_bytes,
        quota_bytes: report.quota_bytes,
    })
}

// ============================================================
// Sub-Agent Task Manager (§4.2)
// ============================================================

async fn list_tasks(
    State(host): State<AgentHost>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<SubAgentTask>>, AppError> {
    let user_id = UserId::from(user_id);
    let tasks = host
        .tasks
        .list(&user_id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(tasks))
}

async fn create_task(
    State(host): State<AgentHost>,
    Path(user_id): Path<String>,
    Json(req): Json<DelegateRequest>,
) -> Result<Json<DelegateResponse>, AppError> {
    let user_id = UserId::from(user_id);
    host.users.get_or_create(&user_id).await.map_err(AppError::from)?;

    let task_id = match req.review_criteria {
        Some(criteria) => {
            host.tasks
                .delegate_and_review(&user_id, req.description, req.prompt, criteria)
                .await
        }
        None => host.tasks.delegate(&user_id, req.description, req.prompt).await,
    }
    .map_err(AppError::from)?;

    Ok(Json(DelegateResponse {
        task_id: task_id.as_str().to_string(),
    }))
}

async fn get_task(
    State(host): State<AgentHost>,
    Path((_user_id, task_id)): Path<(String, String)>,
) -> Result<Json<SubAgentTask>, AppError> {
    let task_id = TaskId::from(task_id);
    let task = host
        .tasks
        .get(&task_id)
        .await
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok(Json(task))
}

async fn cancel_task(
    State(host): State<AgentHost>,
    Path((_user_id, task_id)): Path<(String, String)>,
) -> Result<Json<SuccessResponse>, AppError> {
    let task_id = TaskId::from(task_id);
    host.tasks
        .cancel(&task_id)
        .await
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Memory Store (§4.6)
// ============================================================

async fn search_memories(
    State(host): State<AgentHost>,
    Path(user_id): Path<String>,
    Query(query): Query<MemorySearchQuery>,
) -> Result<Json<Vec<Memory>>, AppError> {
    let user_id = UserId::from(user_id);
    let memories = host
        .memory
        .search(&user_id, query.q.as_deref(), None, false, 50)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(memories))
}

async fn create_memory(
    State(host): State<AgentHost>,
    Path(user_id): Path<String>,
    Json(req): Json<NewMemoryRequest>,
) -> Result<Json<Memory>, AppError> {
    let user_id = UserId::from(user_id);
    host.users.get_or_create(&user_id).await.map_err(AppError::from)?;

    let memory = host
        .memory
        .save(
            &user_id,
            NewMemory {
                content: req.content,
                category: req.category,
                visibility: req.visibility,
                source_type: SourceType::Explicit,
                confidence: 1.0,
                tags: Vec::new(),
            },
        )
        .await
        .map_err(AppError::from)?;

    Ok(Json(memory))
}

async fn delete_memory(
    State(host): State<AgentHost>,
    Path((user_id, memory_id)): Path<(String, String)>,
) -> Result<Json<SuccessResponse>, AppError> {
    let user_id = UserId::from(user_id);
    let memory_id = MemoryId::from(memory_id);
    let removed = host
        .memory
        .delete(&user_id, &memory_id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    if !removed {
        return Err(AppError::NotFound(format!("no such memory: {memory_id}")));
    }
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Scheduler (§4.3)
// ============================================================

async fn list_schedules(
    State(host): State<AgentHost>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<ScheduledTask>>, AppError> {
    let user_id = UserId::from(user_id);
    let schedules = host
        .scheduler
        .list(&user_id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(schedules))
}

async fn create_schedule(
    State(host): State<AgentHost>,
    Path(user_id): Path<String>,
    Json(req): Json<CreateScheduleRequest>,
) -> Result<Json<ScheduledTask>, AppError> {
    let user_id = UserId::from(user_id);
    host.users.get_or_create(&user_id).await.map_err(AppError::from)?;

    let max_runs = req.max_runs;
    let name = req.name.clone();
    let prompt = req.prompt.clone();
    let recurrence = req.into_recurrence();

    let task = host
        .scheduler
        .create(&user_id, name, prompt, recurrence, max_runs)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(task))
}

async fn get_schedule(
    State(host): State<AgentHost>,
    Path((user_id, schedule_id)): Path<(String, String)>,
) -> Result<Json<ScheduledTask>, AppError> {
    let user_id = UserId::from(user_id);
    let schedule_id = ScheduleId::from(schedule_id);
    let task = host
        .scheduler
        .get(&user_id, &schedule_id)
        .await
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok(Json(task))
}

async fn delete_schedule(
    State(host): State<AgentHost>,
    Path((user_id, schedule_id)): Path<(String, String)>,
) -> Result<Json<SuccessResponse>, AppError> {
    let user_id = UserId::from(user_id);
    let schedule_id = ScheduleId::from(schedule_id);
    host.scheduler
        .delete(&user_id, &schedule_id)
        .await
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn enable_schedule(
    State(host): State<AgentHost>,
    Path((user_id, schedule_id)): Path<(String, String)>,
) -> Result<Json<SuccessResponse>, AppError> {
    let user_id = UserId::from(user_id);
    let schedule_id = ScheduleId::from(schedule_id);
    host.scheduler
        .enable(&user_id, &schedule_id)
        .await
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn disable_schedule(
    State(host): State<AgentHost>,
    Path((user_id, schedule_id)): Path<(String, String)>,
) -> Result<Json<SuccessResponse>, AppError> {
    let user_id = UserId::from(user_id);
    let schedule_id = ScheduleId::from(schedule_id);
    host.scheduler
        .disable(&user_id, &schedule_id)
        .await
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn reset_schedule(
    State(host): State<AgentHost>,
    Path((user_id, schedule_id)): Path<(String, String)>,
) -> Result<Json<SuccessResponse>, AppError> {
    let user_id = UserId::from(user_id);
    let schedule_id = ScheduleId::from(schedule_id);
    host.scheduler
        .reset(&user_id, &schedule_id)
        .await
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
