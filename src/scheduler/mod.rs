//! Scheduler (§4.3): fires `ScheduledTask`s on their recurrence rule,
//! submits them to the Task Manager, and maintains the schedule file and
//! its operation log. Grounded on teacher's `runtime/recovery.rs` tick-loop
//! shape (a periodic `tokio::time::interval` driving a pure decision
//! function) and `persist`'s atomic-write-plus-append-log discipline
//! already used by `memory.rs`.

pub mod recurrence;

use crate::event_bus::EventBus;
use crate::ids::{ScheduleId, TaskId, UserId};
use crate::persist::{self, LockTable, PersistError, PersistenceRoot};
use crate::task_manager::TaskManager;
use crate::users::UserStore;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use recurrence::{should_fire, Recurrence, ScheduleType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub schedule_id: ScheduleId,
    pub user_id: UserId,
    pub name: String,
    pub prompt: String,
    pub recurrence: Recurrence,
    pub enabled: bool,
    pub run_count: u32,
    pub max_runs: Option<u32>,
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScheduleOperation {
    Create { task: ScheduledTask },
    Update { task: ScheduledTask },
    Delete { task: ScheduledTask },
    Enable { schedule_id: ScheduleId },
    Disable { schedule_id: ScheduleId },
    Reset { schedule_id: ScheduleId },
    Execute {
        schedule_id: ScheduleId,
        sub_agent_task_id: TaskId,
        run_count: u32,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct ScheduleLogEntry {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    operation: ScheduleOperation,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SchedulesFile {
    tasks: HashMap<String, ScheduledTask>,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("no such schedule: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

pub struct Scheduler {
    root: PersistenceRoot,
    locks: LockTable,
    users: UserStore,
    event_bus: EventBus,
    task_manager: Arc<TaskManager>,
}

impl Scheduler {
    pub fn new(
        root: PersistenceRoot,
        locks: LockTable,
        users: UserStore,
        event_bus: EventBus,
        task_manager: Arc<TaskManager>,
    ) -> Self {
        Self {
            root,
            locks,
            users,
            event_bus,
            task_manager,
        }
    }

    fn tasks_path(&self, user: &UserId) -> std::path::PathBuf {
        self.root.schedule_tasks_path(user.as_str())
    }

    fn log_path(&self, user: &UserId) -> std::path::PathBuf {
        self.root.schedule_operation_log_path(user.as_str())
    }

    async fn load(&self, user: &UserId) -> Result<SchedulesFile> {
        Ok(persist::read_json(&self.locks, &self.tasks_path(user))
            .await?
            .unwrap_or_default())
    }

    async fn save(&self, user: &UserId, file: &SchedulesFile) -> Result<()> {
        persist::write_json_atomic(&self.locks, &self.tasks_path(user), file).await?;
        Ok(())
    }

    async fn log(&self, user: &UserId, operation: ScheduleOperation) -> Result<()> {
        persist::append_jsonl(
            &self.locks,
            &self.log_path(user),
            &ScheduleLogEntry {
                timestamp: Utc::now(),
                operation,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn create(
        &self,
        user: &UserId,
        name: impl Into<String>,
        prompt: impl Into<String>,
        recurrence: Recurrence,
        max_runs: Option<u32>,
    ) -> Result<ScheduledTask> {
        let task = ScheduledTask {
            schedule_id: ScheduleId::new(),
            user_id: user.clone(),
            name: name.into(),
            prompt: prompt.into(),
            recurrence,
            enabled: true,
            run_count: 0,
            max_runs,
            last_run: None,
            created_at: Utc::now(),
        };

        let mut file = self.load(user).await?;
        file.tasks.insert(task.schedule_id.as_str().to_string(), task.clone());
        self.save(user, &file).await?;
        self.log(user, ScheduleOperation::Create { task: task.clone() }).await?;
        Ok(task)
    }

    pub async fn update(
        &self,
        user: &UserId,
        schedule_id: &ScheduleId,
        name: Option<String>,
        prompt: Option<String>,
        recurrence: Option<Recurrence>,
        max_runs: Option<Option<u32>>,
    ) -> Result<ScheduledTask> {
        let mut file = self.load(user).await?;
        let task = file
            .tasks
            .get_mut(schedule_id.as_str())
            .ok_or_else(|| SchedulerError::NotFound(schedule_id.as_str().to_string()))?;
        if let Some(name) = name {
            task.name = name;
        }
        if let Some(prompt) = prompt {
            task.prompt = prompt;
        }
        if let Some(recurrence) = recurrence {
            task.recurrence = recurrence;
        }
        if let Some(max_runs) = max_runs {
            task.max_runs = max_runs;
        }
        let updated = task.clone();
        self.save(user, &file).await?;
        self.log(user, ScheduleOperation::Update { task: updated.clone() }).await?;
        Ok(updated)
    }

    pub async fn delete(&self, user: &UserId, schedule_id: &ScheduleId) -> Result<()> {
        let mut file = self.load(user).await?;
        let removed = file
            .tasks
            .remove(schedule_id.as_str())
            .ok_or_else(|| SchedulerError::NotFound(schedule_id.as_str().to_string()))?;
        self.save(user, &file).await?;
        self.log(user, ScheduleOperation::Delete { task: removed }).await?;
        Ok(())
    }

    pub async fn enable(&self, user: &UserId, schedule_id: &ScheduleId) -> Result<()> {
        self.set_enabled(user, schedule_id, true).await?;
        self.log(
            user,
            ScheduleOperation::Enable {
                schedule_id: schedule_id.clone(),
            },
        )
        .await
    }

    pub async fn disable(&self, user: &UserId, schedule_id: &ScheduleId) -> Result<()> {
        self.set_enabled(user, schedule_id, false).await?;
        self.log(
            user,
            ScheduleOperation::Disable {
                schedule_id: schedule_id.clone(),
            },
        )
        .await
    }

    async fn set_enabled(&self, user: &UserId, schedule_id: &ScheduleId, enabled: bool) -> Result<()> {
        let mut file = self.load(user).await?;
        let task = file
            .tasks
            .get_mut(schedule_id.as_str())
            .ok_or_else(|| SchedulerError::NotFound(schedule_id.as_str().to_string()))?;
        task.enabled = enabled;
        self.save(user, &file).await
    }

    /// Clear `run_count` and re-enable a task that hit `max_runs`.
    pub async fn reset(&self, user: &UserId, schedule_id: &ScheduleId) -> Result<()> {
        let mut file = self.load(user).await?;
        let task = file
            .tasks
            .get_mut(schedule_id.as_str())
            .ok_or_else(|| SchedulerError::NotFound(schedule_id.as_str().to_string()))?;
        task.run_count = 0;
        task.enabled = true;
        self.save(user, &file).await?;
        self.log(
            user,
            ScheduleOperation::Reset {
                schedule_id: schedule_id.clone(),
            },
        )
        .await
    }

    pub async fn get(&self, user: &UserId, schedule_id: &ScheduleId) -> Result<ScheduledTask> {
        let file = self.load(user).await?;
        file.tasks
            .get(schedule_id.as_str())
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(schedule_id.as_str().to_string()))
    }

    pub async fn list(&self, user: &UserId) -> Result<Vec<ScheduledTask>> {
        let file = self.load(user).await?;
        let mut tasks: Vec<_> = file.tasks.into_values().collect();
        tasks.sort_by(|a, b| a.schedule_id.as_str().cmp(b.schedule_id.as_str()));
        Ok(tasks)
    }

    /// Evaluate every user's schedules against `now` and fire the ones
    /// that are due, in (user_id, task_id) order (tie-break rule, §4.3).
    /// Called once per tick by the host's background loop.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let mut users = self.users.list().await;
        users.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        for user in users {
            if let Err(e) = self.tick_user(&user.id, &user.timezone, now).await {
                tracing::warn!(user_id = %user.id, error = %e, "scheduler tick failed for user");
            }
        }
    }

    async fn tick_user(&self, user: &UserId, timezone: &str, now: DateTime<Utc>) -> Result<()> {
        let tz: Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
        let mut file = self.load(user).await?;

        let mut due: Vec<String> = file
            .tasks
            .values()
            .filter(|task| self.is_due(task, tz, now))
            .map(|task| task.schedule_id.as_str().to_string())
            .collect();
        due.sort();

        for schedule_id in due {
            let Some(task) = file.tasks.get(&schedule_id).cloned() else {
                continue;
            };
            self.fire_one(&mut file, task, now, tz).await;
        }

        self.save(user, &file).await
    }

    fn is_due(&self, task: &ScheduledTask, tz: Tz, now: DateTime<Utc>) -> bool {
        if !task.enabled {
            return false;
        }
        if let Some(max_runs) = task.max_runs {
            if task.run_count >= max_runs {
                return false;
            }
        }
        should_fire(&task.recurrence, tz, now, task.last_run)
    }

    async fn fire_one(&self, file: &mut SchedulesFile, mut task: ScheduledTask, now: DateTime<Utc>, tz: Tz) {
        let sub_agent_task_id = match self
            .task_manager
            .delegate(&task.user_id, format!("scheduled: {}", task.name), task.prompt.clone())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(schedule_id = %task.schedule_id, error = %e, "scheduler failed to submit fire to task manager");
                return;
            }
        };

        task.run_count += 1;
        task.last_run = Some(now);
        if let Some(max_runs) = task.max_runs {
            if task.run_count >= max_runs {
                task.enabled = false;
            }
        }

        let next_run = recurrence::next_run_after(&task.recurrence, tz, now);

        if let Err(e) = self
            .log(
                &task.user_id,
                ScheduleOperation::Execute {
                    schedule_id: task.schedule_id.clone(),
                    sub_agent_task_id,
                    run_count: task.run_count,
                },
            )
            .await
        {
            tracing::warn!(schedule_id = %task.schedule_id, error = %e, "failed to append schedule operation log entry");
        }

        self.event_bus
            .broadcast_schedule_executed(&task.user_id, task.schedule_id.as_str(), task.run_count, next_run)
            .await;

        file.tasks.insert(task.schedule_id.as_str().to_string(), task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_adapter::LoggingChatAdapter;
    use crate::config::Config;
    use crate::llm::{LlmBackend, LlmError, LlmResponse, LlmUsage};
    use crate::quota::FsQuotaGate;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio_util::sync::CancellationToken;

    struct NoopBackend;

    #[async_trait]
    impl LlmBackend for NoopBackend {
        async fn invoke(
            &self,
            _request: crate::llm::LlmRequest,
            _cancellation: CancellationToken,
        ) -> std::result::Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                text: "ok".to_string(),
                usage: LlmUsage::default(),
                remote_id: None,
            })
        }

        async fn summarize(&self, _log_excerpt: &str) -> std::result::Result<String, LlmError> {
            Ok(r#"{"verdict": "accept"}"#.to_string())
        }
    }

    async fn test_scheduler() -> (Scheduler, UserId, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let root = PersistenceRoot::new(dir.path());
        let locks = LockTable::new();
        let users = UserStore::load(root.clone(), locks.clone(), 1024 * 1024).await.unwrap();
        let user = users.get_or_create(&UserId::new()).await.unwrap();

        let config = Arc::new(Config {
            persistence_root: dir.path().to_path_buf(),
            bind_port: 8000,
            session_timeout_seconds: 3600,
            context_stale_threshold_seconds: 600,
            chat_log_excerpt_chars: 8000,
            chat_summary_recent_count: 3,
            max_sub_agents: 5,
            max_retries: 3,
            file_tracker_inline_threshold: 5,
            event_bus_ping_interval_seconds: 30,
            event_bus_missed_pong_limit: 2,
            scheduler_tick_seconds: 30,
            llm_backend_endpoint: None,
            default_quota_bytes: 1024 * 1024,
        });
        let bus = EventBus::new(config.event_bus_missed_pong_limit);
        let quota = Arc::new(FsQuotaGate::new(root.clone(), config.default_quota_bytes));
        let chat = crate::chat_adapter::SerializedChatAdapter::new(Arc::new(LoggingChatAdapter));
        let task_manager = TaskManager::new(root.clone(), locks.clone(), config, bus.clone(), Arc::new(NoopBackend), quota, chat);

        let scheduler = Scheduler::new(root, locks, users, bus, task_manager);
        (scheduler, user.id, dir)
    }

    fn daily_recurrence(hour: u32, minute: u32) -> Recurrence {
        Recurrence {
            schedule_type: ScheduleType::Daily,
            hour,
            minute,
            weekdays: vec![],
            month_day: None,
            interval_seconds: None,
            run_date: None,
            first_fire_at: None,
        }
    }

    #[tokio::test]
    async fn create_then_list_round_trips() {
        let (scheduler, user, _dir) = test_scheduler().await;
        let created = scheduler
            .create(&user, "daily digest", "summarize my day", daily_recurrence(9, 0), None)
            .await
            .unwrap();

        let listed = scheduler.list(&user).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].schedule_id, created.schedule_id);
    }

    #[tokio::test]
    async fn disabled_schedule_never_fires() {
        let (scheduler, user, _dir) = test_scheduler().await;
        let created = scheduler
            .create(&user, "daily digest", "do it", daily_recurrence(9, 0), None)
            .await
            .unwrap();
        scheduler.disable(&user, &created.schedule_id).await.unwrap();

        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        scheduler.tick(now).await;

        let task = scheduler.get(&user, &created.schedule_id).await.unwrap();
        assert_eq!(task.run_count, 0);
    }

    #[tokio::test]
    async fn due_schedule_fires_and_increments_run_count() {
        let (scheduler, user, _dir) = test_scheduler().await;
        scheduler
            .users
            .set_timezone(&user, "UTC".to_string())
            .await
            .unwrap();
        let created = scheduler
            .create(&user, "daily digest", "do it", daily_recurrence(9, 0), None)
            .await
            .unwrap();

        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        scheduler.tick(now).await;

        let task = scheduler.get(&user, &created.schedule_id).await.unwrap();
        assert_eq!(task.run_count, 1);
        assert_eq!(task.last_run, Some(now));

        // a second tick in the same matching minute must not re-fire
        scheduler.tick(now).await;
        let task = scheduler.get(&user, &created.schedule_id).await.unwrap();
        assert_eq!(task.run_count, 1);
    }

    #[tokio::test]
    async fn max_runs_reached_disables_schedule() {
        let (scheduler, user, _dir) = test_scheduler().await;
        let created = scheduler
            .create(&user, "one shot daily", "do it", daily_recurrence(9, 0), Some(1))
            .await
            .unwrap();

        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        scheduler.tick(now).await;

        let task = scheduler.get(&user, &created.schedule_id).await.unwrap();
        assert_eq!(task.run_count, 1);
        assert!(!task.enabled);

        // reset clears run_count and re-enables
        scheduler.reset(&user, &created.schedule_id).await.unwrap();
        let task = scheduler.get(&user, &created.schedule_id).await.unwrap();
        assert_eq!(task.run_count, 0);
        assert!(task.enabled);
    }

    #[tokio::test]
    async fn delete_records_snapshot_in_operation_log() {
        let (scheduler, user, _dir) = test_scheduler().await;
        let created = scheduler
            .create(&user, "to delete", "do it", daily_recurrence(9, 0), None)
            .await
            .unwrap();
        scheduler.delete(&user, &created.schedule_id).await.unwrap();

        assert!(scheduler.get(&user, &created.schedule_id).await.is_err());

        let log: Vec<ScheduleLogEntry> =
            persist::read_jsonl(&scheduler.locks, &scheduler.log_path(&user))
                .await
                .unwrap();
        let has_delete_snapshot = log.iter().any(|entry| matches!(
            &entry.operation,
            ScheduleOperation::Delete { task } if task.schedule_id == created.schedule_id
        ));
        assert!(has_delete_snapshot);
    }
}
