//! Sub-Agent Task Manager (§4.2): bounded concurrent execution of delegated
//! tasks with an iterative review/retry loop and per-task artifact
//! capture. Grounded on teacher's `RuntimeManager` sub-agent
//! spawn/cancel handler (`runtime.rs`): a registry of handles keyed by id,
//! a background-spawned execution per task, and cooperative cancellation
//! via a token threaded through the LLM call — generalized from teacher's
//! stubbed `Effect::SpawnSubAgent` into the real thing (§F of the expanded
//! spec).

pub mod review;

use crate::chat_adapter::{ChatEffect, SerializedChatAdapter};
use crate::config::Config;
use crate::event_bus::EventBus;
use crate::file_tracker::{self, Delivery, FileTrackerError, FileTrackerScope};
use crate::ids::{TaskId, UserId};
use crate::llm::{LlmBackend, LlmRequest};
use crate::persist::{self, LockTable, PersistError, PersistenceRoot};
use crate::quota::{QuotaDecision, QuotaGate};
use chrono::{DateTime, Utc};
use review::{ReviewAgent, ReviewVerdict};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEntry {
    pub feedback: String,
    pub suggestions: Vec<String>,
    pub missing_dimensions: Vec<String>,
    pub result_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentTask {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub description: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub review_criteria: Option<String>,
    pub retry_history: Vec<RetryEntry>,
    pub files_produced: Vec<String>,
    pub result: String,
    pub error: Option<String>,
    /// Set when the task reached a terminal `completed` state only
    /// because `retry_count` hit `max_retries`, per §4.2 step 5.
    #[serde(default)]
    pub max_retries_reached: bool,
}

#[derive(Debug, Error)]
pub enum TaskManagerError {
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    FileTracker(#[from] FileTrackerError),
    #[error("no such task: {0}")]
    NotFound(String),
    #[error("storage quota exceeded")]
    QuotaExceeded,
}

pub type Result<T> = std::result::Result<T, TaskManagerError>;

struct TaskHandle {
    user_id: UserId,
    cancellation: CancellationToken,
}

pub struct TaskManager {
    root: PersistenceRoot,
    locks: LockTable,
    config: Arc<Config>,
    event_bus: EventBus,
    llm: Arc<dyn LlmBackend>,
    quota: Arc<dyn QuotaGate>,
    review_agent: Arc<ReviewAgent>,
    chat: Arc<SerializedChatAdapter>,
    admission: Arc<Semaphore>,
    handles: Mutex<HashMap<String, TaskHandle>>,
}

impl TaskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PersistenceRoot,
        locks: LockTable,
        config: Arc<Config>,
        event_bus: EventBus,
        llm: Arc<dyn LlmBackend>,
        quota: Arc<dyn QuotaGate>,
        chat: Arc<SerializedChatAdapter>,
    ) -> Arc<Self> {
        let max_sub_agents = config.max_sub_agents;
        Arc::new(Self {
            root,
            locks,
            config,
            event_bus,
            review_agent: Arc::new(ReviewAgent::new(llm.clone())),
            llm,
            quota,
            chat,
            admission: Arc::new(Semaphore::new(max_sub_agents)),
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Enqueue a task with no review loop: runs once, terminal on first
    /// completion or failure.
    pub async fn delegate(
        self: &Arc<Self>,
        user: &UserId,
        description: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Result<TaskId> {
        self.submit(user, description.into(), prompt.into(), None).await
    }

    /// Enqueue a task whose result is evaluated against `review_criteria`
    /// by the Review Agent after each run, retrying on rejection.
    pub async fn delegate_and_review(
        self: &Arc<Self>,
        user: &UserId,
        description: impl Into<String>,
        prompt: impl Into<String>,
        review_criteria: impl Into<String>,
    ) -> Result<TaskId> {
        self.submit(user, description.into(), prompt.into(), Some(review_criteria.into()))
            .await
    }

    async fn submit(
        self: &Arc<Self>,
        user: &UserId,
        description: String,
        prompt: String,
        review_criteria: Option<String>,
    ) -> Result<TaskId> {
        let task = SubAgentTask {
            task_id: TaskId::new(),
            user_id: user.clone(),
            description: description.clone(),
            prompt,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: self.config.max_retries,
            review_criteria,
            retry_history: Vec::new(),
            files_produced: Vec::new(),
            result: String::new(),
            error: None,
            max_retries_reached: false,
        };

        let estimated_bytes = serde_json::to_vec(&task).map(|v| v.len() as u64).unwrap_or(0);
        if self.quota.check(user, estimated_bytes).await == QuotaDecision::Denied {
            return Err(TaskManagerError::QuotaExceeded);
        }

        self.persist_running(&task).await?;
        self.publish_storage_update(user).await;

        let cancellation = CancellationToken::new();
        {
            let mut handles = self.handles.lock().await;
            handles.insert(
                task.task_id.as_str().to_string(),
                TaskHandle {
                    user_id: user.clone(),
                    cancellation: cancellation.clone(),
                },
            );
        }

        self.event_bus
            .broadcast_task_created(user, &task.task_id, &description)
            .await;

        let task_id = task.task_id.clone();
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_task(task, cancellation).await;
        });

        Ok(task_id)
    }

    /// Best-effort cancellation: signals the task's cancellation token.
    /// A task waiting for admission is marked `cancelled` immediately; a
    /// running task's in-flight LLM call is asked to abort and, once it
    /// unwinds, the result and any produced files are discarded (B4).
    pub async fn cancel(&self, task_id: &TaskId) -> Result<()> {
        let handles = self.handles.lock().await;
        match handles.get(task_id.as_str()) {
            Some(handle) => {
                handle.cancellation.cancel();
                Ok(())
            }
            None => Err(TaskManagerError::NotFound(task_id.as_str().to_string())),
        }
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<SubAgentTask> {
        let user = {
            let handles = self.handles.lock().await;
            handles.get(task_id.as_str()).map(|h| h.user_id.clone())
        };
        if let Some(user) = user {
            if let Some(task) = self.load_running(&user, task_id).await? {
                return Ok(task);
            }
            if let Some(task) = self.load_completed(&user, task_id).await? {
                return Ok(task);
            }
        }
        Err(TaskManagerError::NotFound(task_id.as_str().to_string()))
    }

    pub async fn list(&self, user: &UserId) -> Result<Vec<SubAgentTask>> {
        let mut tasks = Vec::new();
        for dir in [
            self.root.running_tasks_dir(user.as_str()),
            self.root.completed_tasks_dir(user.as_str()),
        ] {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.filter_map(std::result::Result::ok) {
                if let Some(task) = persist::read_json::<SubAgentTask>(&self.locks, &entry.path()).await? {
                    tasks.push(task);
                }
            }
        }
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn persist_running(&self, task: &SubAgentTask) -> Result<()> {
        let path = self
            .root
            .running_task_path(task.user_id.as_str(), task.task_id.as_str());
        persist::write_json_atomic(&self.locks, &path, task).await?;
        Ok(())
    }

    async fn persist_completed(&self, task: &SubAgentTask) -> Result<()> {
        let completed_path = self
            .root
            .completed_task_path(task.user_id.as_str(), task.task_id.as_str());
        persist::write_json_atomic(&self.locks, &completed_path, task).await?;
        let running_path = self
            .root
            .running_task_path(task.user_id.as_str(), task.task_id.as_str());
        let _ = std::fs::remove_file(running_path);
        Ok(())
    }

    async fn load_running(&self, user: &UserId, task_id: &TaskId) -> Result<Option<SubAgentTask>> {
        let path = self.root.running_task_path(user.as_str(), task_id.as_str());
        Ok(persist::read_json(&self.locks, &path).await?)
    }

    async fn load_completed(&self, user: &UserId, task_id: &TaskId) -> Result<Option<SubAgentTask>> {
        let path = self.root.completed_task_path(user.as_str(), task_id.as_str());
        Ok(persist::read_json(&self.locks, &path).await?)
    }

    /// Mark every task still `running`/`pending` in `running_tasks/` as
    /// `failed` with `error: "interrupted by restart"`, matching teacher's
    /// unconditional `db.reset_all_to_idle()` at start-up (§F "Boot-time
    /// reconciliation").
    pub async fn reconcile_on_boot(&self, user: &UserId) -> Result<()> {
        let dir = self.root.running_tasks_dir(user.as_str());
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Ok(());
        };
        for entry in entries.filter_map(std::result::Result::ok) {
            let Some(mut task) = persist::read_json::<SubAgentTask>(&self.locks, &entry.path()).await?
            else {
                continue;
            };
            task.status = TaskStatus::Failed;
            task.error = Some("interrupted by restart".to_string());
            task.completed_at = Some(Utc::now());
            self.persist_completed(&task).await?;
            tracing::warn!(task_id = %task.task_id, user_id = %user, "reconciled interrupted task to failed on boot");
        }
        Ok(())
    }

    async fn run_task(self: Arc<Self>, mut task: SubAgentTask, cancellation: CancellationToken) {
        let user = task.user_id.clone();

        loop {
            let permit = tokio::select! {
                permit = self.admission.acquire() => permit,
                () = cancellation.cancelled() => {
                    self.finalize_cancelled(task).await;
                    return;
                }
            };
            let Ok(_permit) = permit else {
                self.finalize_cancelled(task).await;
                return;
            };

            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Running;
                task.started_at.get_or_insert(Utc::now());
                if self.persist_running(&task).await.is_err() {
                    tracing::error!(task_id = %task.task_id, "failed to persist running task");
                }
                self.event_bus
                    .broadcast_task_update(&user, &task.task_id, "running", None, None)
                    .await;
            }

            let workspace = self.root.task_workspace_dir(user.as_str(), task.task_id.as_str());
            if let Err(e) = std::fs::create_dir_all(&workspace) {
                self.finalize_failed(task, format!("failed to prepare task workspace: {e}")).await;
                return;
            }
            let scope = match FileTrackerScope::start(&workspace) {
                Ok(scope) => scope,
                Err(e) => {
                    self.finalize_failed(task, format!("file tracker failed to start: {e}")).await;
                    return;
                }
            };

            let full_prompt = render_prompt(&task);
            let invocation = self.llm.invoke(
                LlmRequest {
                    prompt: full_prompt,
                    session_remote_id: None,
                },
                cancellation.clone(),
            );

            let response = tokio::select! {
                result = invocation => result,
                () = cancellation.cancelled() => {
                    self.finalize_cancelled(task).await;
                    return;
                }
            };

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    self.finalize_failed(task, e.to_string()).await;
                    return;
                }
            };

            let verdict = match &task.review_criteria {
                Some(criteria) => {
                    self.review_agent
                        .review(&response.text, criteria, Utc::now().date_naive())
                        .await
                }
                None => ReviewVerdict::Accept,
            };

            match verdict {
                ReviewVerdict::Accept => {
                    task.result = response.text;
                    self.finalize_completed(task, scope).await;
                    return;
                }
                ReviewVerdict::Reject {
                    feedback,
                    suggestions,
                    missing_dimensions,
                } => {
                    if task.retry_count >= task.max_retries {
                        task.result = response.text;
                        task.max_retries_reached = true;
                        self.finalize_completed(task, scope).await;
                        return;
                    }

                    let entry = RetryEntry {
                        feedback,
                        suggestions,
                        missing_dimensions,
                        result_summary: truncate(&response.text, 200),
                    };
                    self.append_review_log(&task, &entry).await;

                    task.retry_count += 1;
                    task.retry_history.push(entry);
                    task.status = TaskStatus::Pending;
                    if self.persist_running(&task).await.is_err() {
                        tracing::error!(task_id = %task.task_id, "failed to persist retry state");
                    }
                    drop(scope);
                    // loop back to re-acquire admission for the retry attempt
                }
            }
        }
    }

    async fn append_review_log(&self, task: &SubAgentTask, entry: &RetryEntry) {
        let path = self
            .root
            .task_review_log_path(task.user_id.as_str(), task.task_id.as_str());
        if let Err(e) = persist::append_jsonl(&self.locks, &path, entry).await {
            tracing::warn!(task_id = %task.task_id, error = %e, "failed to append review log entry");
        }
    }

    async fn finalize_completed(&self, mut task: SubAgentTask, scope: FileTrackerScope) {
        let user = task.user_id.clone();

        let changed = scope.diff().unwrap_or_default();
        let produced_bytes: u64 = changed
            .iter()
            .map(|relative| std::fs::metadata(scope.root().join(relative)).map(|m| m.len()).unwrap_or(0))
            .sum();
        let delivery_allowed = self.quota.check(&user, produced_bytes).await == QuotaDecision::Ok;

        if !delivery_allowed {
            tracing::warn!(task_id = %task.task_id, user_id = %user, "storage quota exceeded, dropping produced files");
        } else {
            match file_tracker::classify_delivery(changed, self.config.file_tracker_inline_threshold) {
                Delivery::None => {}
                Delivery::Inline(files) => {
                    for relative in &files {
                        let absolute = scope.root().join(relative);
                        self.chat
                            .enqueue(
                                &user,
                                ChatEffect::SendFile {
                                    path: absolute,
                                    caption: Some(task.description.clone()),
                                },
                            )
                            .await;
                    }
                    task.files_produced = files.iter().map(|p| p.display().to_string()).collect();
                }
                Delivery::Archive(files) => {
                    let archive_path = self.root.task_archive_path(user.as_str(), task.task_id.as_str());
                    match file_tracker::pack_archive(scope.root(), &files, &archive_path) {
                        Ok(()) => {
                            self.chat
                                .enqueue(
                                    &user,
                                    ChatEffect::SendFile {
                                        path: archive_path.clone(),
                                        caption: Some(task.description.clone()),
                                    },
                                )
                                .await;
                        }
                        Err(e) => tracing::warn!(task_id = %task.task_id, error = %e, "failed to pack artifact archive"),
                    }
                    task.files_produced = files.iter().map(|p| p.display().to_string()).collect();
                    let _ = std::fs::remove_file(&archive_path);
                }
            }
        }
        let _ = scope.cleanup();

        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());

        self.finish(task).await;
        self.publish_storage_update(&user).await;
    }

    async fn finalize_failed(&self, mut task: SubAgentTask, error: String) {
        task.status = TaskStatus::Failed;
        task.error = Some(error);
        task.completed_at = Some(Utc::now());
        self.finish(task).await;
    }

    async fn finalize_cancelled(&self, mut task: SubAgentTask) {
        // Files produced so far are not delivered (B4): no diff/delivery step.
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        self.finish(task).await;
    }

    async fn finish(&self, task: SubAgentTask) {
        let user = task.user_id.clone();
        let status_label = match task.status {
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Pending | TaskStatus::Running => "running",
        };
        if let Err(e) = self.persist_completed(&task).await {
            tracing::error!(task_id = %task.task_id, error = %e, "failed to persist terminal task state");
        }
        {
            let mut handles = self.handles.lock().await;
            handles.remove(task.task_id.as_str());
        }
        self.event_bus
            .broadcast_task_update(
                &user,
                &task.task_id,
                status_label,
                Some(task.result.clone()),
                task.completed_at,
            )
            .await;
    }

    pub async fn running_count(&self) -> usize {
        self.config.max_sub_agents - self.admission.available_permits()
    }

    /// Re-measures usage and publishes `storage_update` (§6) so subscribers
    /// see it as soon as a task record or its artifacts change what's on
    /// disk.
    async fn publish_storage_update(&self, user: &UserId) {
        let report = self.quota.report(user).await;
        self.event_bus
            .broadcast_storage_update(user, report.used_bytes, report.quota_bytes)
            .await;
    }
}

fn render_prompt(task: &SubAgentTask) -> String {
    if task.retry_history.is_empty() {
        return task.prompt.clone();
    }
    let mut out = task.prompt.clone();
    out.push_str("\n\n--- Prior attempt feedback ---\n");
    for (i, entry) in task.retry_history.iter().enumerate() {
        out.push_str(&format!(
            "Attempt {}: {}\nSuggestions: {}\nMissing: {}\n",
            i + 1,
            entry.feedback,
            entry.suggestions.join(", "),
            entry.missing_dimensions.join(", "),
        ));
    }
    out
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect::<String>() + "…"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_adapter::LoggingChatAdapter;
    use crate::llm::{LlmError, LlmResponse, LlmUsage};
    use crate::quota::{FsQuotaGate, QuotaDecision};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            persistence_root: std::path::PathBuf::from("."),
            bind_port: 8000,
            session_timeout_seconds: 3600,
            context_stale_threshold_seconds: 600,
            chat_log_excerpt_chars: 8000,
            chat_summary_recent_count: 3,
            max_sub_agents: 2,
            max_retries: 3,
            file_tracker_inline_threshold: 5,
            event_bus_ping_interval_seconds: 30,
            event_bus_missed_pong_limit: 2,
            scheduler_tick_seconds: 30,
            llm_backend_endpoint: None,
            default_quota_bytes: 1024 * 1024 * 1024,
        })
    }

    struct SlowBackend {
        delay: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmBackend for SlowBackend {
        async fn invoke(
            &self,
            _request: LlmRequest,
            _cancellation: CancellationToken,
        ) -> std::result::Result<LlmResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(LlmResponse {
                text: "done".to_string(),
                usage: LlmUsage::default(),
                remote_id: None,
            })
        }

        async fn summarize(&self, _log_excerpt: &str) -> std::result::Result<String, LlmError> {
            Ok(r#"{"verdict": "accept"}"#.to_string())
        }
    }

    /// Rejects until the result text is at least 100 chars.
    struct LengthGatedBackend {
        short_result: bool,
    }

    #[async_trait]
    impl LlmBackend for LengthGatedBackend {
        async fn invoke(
            &self,
            _request: LlmRequest,
            _cancellation: CancellationToken,
        ) -> std::result::Result<LlmResponse, LlmError> {
            let text = if self.short_result { "short" } else { &"x".repeat(150) };
            Ok(LlmResponse {
                text: text.to_string(),
                usage: LlmUsage::default(),
                remote_id: None,
            })
        }

        async fn summarize(&self, log_excerpt: &str) -> std::result::Result<String, LlmError> {
            // review prompt embeds the rejected result; reject anything short.
            if log_excerpt.contains("Result to review:\nshort") {
                Ok(r#"{"verdict": "reject", "feedback": "too short", "suggestions": ["add more"], "missing_dimensions": ["length"]}"#
                    .to_string())
            } else {
                Ok(r#"{"verdict": "accept"}"#.to_string())
            }
        }
    }

    async fn manager_with(
        llm: Arc<dyn LlmBackend>,
        max_sub_agents: usize,
    ) -> (Arc<TaskManager>, UserId, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let root = PersistenceRoot::new(dir.path());
        let user = UserId::new();
        root.ensure_user_dirs(user.as_str()).unwrap();
        let locks = LockTable::new();
        let mut config = (*test_config()).clone();
        config.max_sub_agents = max_sub_agents;
        let config = Arc::new(config);
        let quota: Arc<dyn QuotaGate> = Arc::new(FsQuotaGate::new(root.clone(), config.default_quota_bytes));
        let bus = EventBus::new(config.event_bus_missed_pong_limit);
        let chat = SerializedChatAdapter::new(Arc::new(LoggingChatAdapter));
        let manager = TaskManager::new(root, locks, config, bus, llm, quota, chat);
        (manager, user, dir)
    }

    #[tokio::test]
    async fn concurrent_cap_admits_only_max_sub_agents() {
        let backend = Arc::new(SlowBackend {
            delay: Duration::from_millis(150),
            calls: AtomicU32::new(0),
        });
        let (manager, user, _dir) = manager_with(backend, 2).await;

        for i in 0..5 {
            manager.delegate(&user, format!("task {i}"), "do work").await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.running_count().await <= 2);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let tasks = manager.list(&user).await.unwrap();
        assert_eq!(tasks.len(), 5);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
    }

    #[tokio::test]
    async fn review_loop_retries_until_max_then_flags_max_retries_reached() {
        let backend = Arc::new(LengthGatedBackend { short_result: true });
        let (manager, user, _dir) = manager_with(backend, 5).await;

        let task_id = manager
            .delegate_and_review(&user, "write a report", "go", "length >= 100")
            .await
            .unwrap();

        for _ in 0..100 {
            let task = manager.get(&task_id).await.unwrap();
            if task.status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let task = manager.get(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 3);
        assert!(task.max_retries_reached);
        assert_eq!(task.retry_history.len(), 3);
    }

    #[tokio::test]
    async fn review_loop_accepts_long_result_without_retry() {
        let backend = Arc::new(LengthGatedBackend { short_result: false });
        let (manager, user, _dir) = manager_with(backend, 5).await;

        let task_id = manager
            .delegate_and_review(&user, "write a report", "go", "length >= 100")
            .await
            .unwrap();

        for _ in 0..100 {
            let task = manager.get(&task_id).await.unwrap();
            if task.status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let task = manager.get(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 0);
        assert!(!task.max_retries_reached);
    }

    #[tokio::test]
    async fn submit_denied_when_quota_exceeded() {
        let backend = Arc::new(SlowBackend {
            delay: Duration::from_millis(50),
            calls: AtomicU32::new(0),
        });
        let dir = tempfile::tempdir().unwrap();
        let root = PersistenceRoot::new(dir.path());
        let user = UserId::new();
        root.ensure_user_dirs(user.as_str()).unwrap();
        std::fs::write(root.user_data_dir(user.as_str()).join("f.txt"), vec![0u8; 100]).unwrap();

        let locks = LockTable::new();
        let mut config = (*test_config()).clone();
        config.default_quota_bytes = 100;
        let config = Arc::new(config);
        let quota: Arc<dyn QuotaGate> = Arc::new(FsQuotaGate::new(root.clone(), config.default_quota_bytes));
        let bus = EventBus::new(config.event_bus_missed_pong_limit);
        let chat = SerializedChatAdapter::new(Arc::new(LoggingChatAdapter));
        let manager = TaskManager::new(root, locks, config, bus, backend, quota, chat);

        let result = manager.delegate(&user, "task", "do work").await;
        assert!(matches!(result, Err(TaskManagerError::QuotaExceeded)));
    }

    #[tokio::test]
    async fn cancel_before_start_produces_cancelled_with_no_files() {
        let backend = Arc::new(SlowBackend {
            delay: Duration::from_millis(500),
            calls: AtomicU32::new(0),
        });
        let (manager, user, _dir) = manager_with(backend, 0).await;

        let task_id = manager.delegate(&user, "task", "do work").await.unwrap();
        manager.cancel(&task_id).await.unwrap();

        for _ in 0..100 {
            let task = manager.get(&task_id).await.unwrap();
            if task.status == TaskStatus::Cancelled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let task = manager.get(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.files_produced.is_empty());
    }

    #[test]
    fn render_prompt_includes_retry_history() {
        let task = SubAgentTask {
            task_id: TaskId::new(),
            user_id: UserId::new(),
            description: "d".to_string(),
            prompt: "base prompt".to_string(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 1,
            max_retries: 3,
            review_criteria: None,
            retry_history: vec![RetryEntry {
                feedback: "too vague".to_string(),
                suggestions: vec!["be specific".to_string()],
                missing_dimensions: vec!["detail".to_string()],
                result_summary: "...".to_string(),
            }],
            files_produced: vec![],
            result: String::new(),
            error: None,
            max_retries_reached: false,
        };
        let rendered = render_prompt(&task);
        assert!(rendered.contains("base prompt"));
        assert!(rendered.contains("too vague"));
        assert!(rendered.contains("be specific"));
    }
}
