//! axum surface (§A): the thinnest adapter onto the core components. Not
//! itself in scope as a component, but every other module is reached
//! through it. Grounded on teacher's `api.rs` (`AppState`, `create_router`)
//! generalized from one runtime+db pair to the full set of substrate
//! components.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;

use crate::chat_adapter::{LoggingChatAdapter, SerializedChatAdapter};
use crate::config::Config;
use crate::event_bus::EventBus;
use crate::llm::{HttpLlmBackend, LlmBackend, LoggingBackend};
use crate::memory::MemoryStore;
use crate::persist::{LockTable, PersistenceRoot};
use crate::quota::{FsQuotaGate, QuotaGate};
use crate::scheduler::Scheduler;
use crate::session::SessionManager;
use crate::task_manager::TaskManager;
use crate::users::UserStore;
use std::sync::Arc;

/// The single owning value constructed at start-up, holding every
/// sub-manager behind cheap `Arc` clones (§9 "a single owning AgentHost
/// value"). This is the `axum` `State`.
#[derive(Clone)]
pub struct AgentHost {
    pub config: Arc<Config>,
    pub users: UserStore,
    pub memory: Arc<MemoryStore>,
    pub event_bus: EventBus,
    pub sessions: Arc<SessionManager>,
    pub tasks: Arc<TaskManager>,
    pub scheduler: Arc<Scheduler>,
    pub quota: Arc<dyn QuotaGate>,
}

impl AgentHost {
    /// Construct every sub-manager in dependency order (Event Bus →
    /// QuotaGate → Memory Store → Session → Task Manager → Scheduler),
    /// reconcile interrupted state left by an unclean shutdown, and
    /// recompute schedules' next_run with no catch-up.
    pub async fn new(config: Config) -> Result<Self, crate::error::FatalError> {
        let config = Arc::new(config);
        let root = PersistenceRoot::new(config.persistence_root.clone());
        root.ensure_root()?;
        let locks = LockTable::new();

        let users = UserStore::load(root.clone(), locks.clone(), config.default_quota_bytes)
            .await
            .map_err(crate::error::FatalError::from)?;

        let event_bus = EventBus::new(config.event_bus_missed_pong_limit);
        let quota: Arc<dyn QuotaGate> = Arc::new(FsQuotaGate::new(root.clone(), config.default_quota_bytes));
        let memory = Arc::new(MemoryStore::new(
            root.clone(),
            locks.clone(),
            quota.clone(),
            event_bus.clone(),
        ));

        let llm_endpoint = config
            .llm_backend_endpoint
            .clone()
            .unwrap_or_else(|| "http://localhost:4000".to_string());
        let llm: Arc<dyn LlmBackend> = Arc::new(LoggingBackend::new(Arc::new(HttpLlmBackend::new(llm_endpoint))));

        let sessions = Arc::new(
            SessionManager::load(root.clone(), locks.clone(), config.clone(), llm.clone())
                .await
                .map_err(crate::error::FatalError::from)?,
        );

        let chat = SerializedChatAdapter::new(Arc::new(LoggingChatAdapter));
        let tasks = TaskManager::new(root.clone(), locks.clone(), config.clone(), event_bus.clone(), llm, quota.clone(), chat);

        let scheduler = Arc::new(Scheduler::new(root, locks, users.clone(), event_bus.clone(), tasks.clone()));

        let host = Self {
            config,
            users,
            memory,
            event_bus,
            sessions,
            tasks,
            scheduler,
            quota,
        };

        host.reconcile_on_boot().await;
        Ok(host)
    }

    /// Mark interrupted `running_tasks` as failed and recompute schedules'
    /// `next_run` forward, with no retroactive catch-up (§4.3).
    async fn reconcile_on_boot(&self) {
        for user in self.users.list().await {
            if let Err(e) = self.tasks.reconcile_on_boot(&user.id).await {
                tracing::warn!(user_id = %user.id, error = %e, "failed to reconcile interrupted tasks on boot");
            }
        }
    }

    /// Drain in-flight work on shutdown: cancel every running sub-agent
    /// task and let the File Tracker clean up its scope (§5 "On global
    /// shutdown").
    pub async fn drain(&self) {
        for user in self.users.list().await {
            let Ok(running) = self.tasks.list(&user.id).await else {
                continue;
            };
            for task in running {
                if task.status == crate::task_manager::TaskStatus::Running
                    || task.status == crate::task_manager::TaskStatus::Pending
                {
                    let _ = self.tasks.cancel(&task.task_id).await;
                }
            }
        }
    }

    pub async fn periodic_tick(&self) {
        self.event_bus.tick_liveness().await;
        self.scheduler.tick(chrono::Utc::now()).await;
    }
}
