//! Session & Conversation Lifecycle (§4.1): for each user, maintain at
//! most one active Session, append turns to its ChatLog, and surface a
//! stable contract to the Task Manager and chat adapter.

pub mod chat_log;
pub mod recovery;

use crate::config::Config;
use crate::ids::{SessionId, UserId};
use crate::llm::{LlmBackend, LlmError, LlmRequest};
use crate::persist::{self, LockTable, PersistError, PersistenceRoot};
use chat_log::{Turn, TurnRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub turns: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub remote_id: Option<String>,
    /// Set once a prior LLM call reports the remote session as unknown,
    /// consumed by the next `recover_context` call then cleared.
    #[serde(default)]
    pub last_call_remote_unknown: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireReason {
    Timeout,
    RemoteUnknown,
    ManualNew,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: String,
    pub user_id: UserId,
    pub summary_text: String,
    pub original_log_ref: String,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub chat_log_excerpt: String,
    pub recent_summaries: Vec<ChatSummary>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("no active session for user")]
    NoActiveSession,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionsFile {
    active: HashMap<String, Session>,
}

pub struct SessionManager {
    root: PersistenceRoot,
    locks: LockTable,
    config: Arc<Config>,
    llm: Arc<dyn LlmBackend>,
    active: Mutex<HashMap<String, Session>>,
    /// Dedupes concurrent expiry attempts per user: "only one expiry is in
    /// flight per user; concurrent attempts observe the in-progress one
    /// and wait."
    expire_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub async fn load(
        root: PersistenceRoot,
        locks: LockTable,
        config: Arc<Config>,
        llm: Arc<dyn LlmBackend>,
    ) -> Result<Self, SessionError> {
        let path = root.root().join("sessions.json");
        let file: SessionsFile = persist::read_json(&locks, &path).await?.unwrap_or_default();
        Ok(Self {
            root,
            locks,
            config,
            llm,
            active: Mutex::new(file.active),
            expire_locks: Mutex::new(HashMap::new()),
        })
    }

    async fn flush(&self) -> Result<(), PersistError> {
        let active = self.active.lock().await;
        let file = SessionsFile {
            active: active.clone(),
        };
        let path = self.root.root().join("sessions.json");
        persist::write_json_atomic(&self.locks, &path, &file).await
    }

    /// Return the active Session for `user` if one exists and has not
    /// timed out, otherwise create a fresh one.
    pub async fn open_or_resume(&self, user: &UserId) -> Result<Session, SessionError> {
        let now = Utc::now();
        {
            let active = self.active.lock().await;
            if let Some(session) = active.get(user.as_str()) {
                if !recovery::is_timed_out(session.last_activity, now, self.config.session_timeout())
                {
                    return Ok(session.clone());
                }
            }
        }
        // Either no session or it has timed out: expire (if present) then open fresh.
        let stale = {
            let active = self.active.lock().await;
            active.get(user.as_str()).cloned()
        };
        if let Some(stale) = stale {
            self.expire(&stale, ExpireReason::Timeout).await?;
        }

        let session = Session {
            id: SessionId::new(),
            user_id: user.clone(),
            created_at: now,
            last_activity: now,
            message_count: 0,
            turns: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            remote_id: None,
            last_call_remote_unknown: false,
        };
        {
            let mut active = self.active.lock().await;
            active.insert(user.as_str().to_string(), session.clone());
        }
        self.flush().await?;
        Ok(session)
    }

    /// Append a turn to the ChatLog and update the session's counters.
    pub async fn record_turn(
        &self,
        user: &UserId,
        role: TurnRole,
        body: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    ) -> Result<Session, SessionError> {
        let mut active = self.active.lock().await;
        let session = active
            .get_mut(user.as_str())
            .ok_or(SessionError::NoActiveSession)?;

        chat_log::append_turn(
            &self.root,
            &self.locks,
            user.as_str(),
            session.id.as_str(),
            &Turn {
                role,
                body: body.to_string(),
                timestamp: Utc::now(),
            },
        )
        .await?;

        session.last_activity = Utc::now();
        session.message_count += 1;
        if matches!(role, TurnRole::User) {
            session.turns += 1;
        }
        session.input_tokens += input_tokens;
        session.output_tokens += output_tokens;
        session.cost += cost;
        let snapshot = session.clone();
        drop(active);
        self.flush().await?;
        Ok(snapshot)
    }

    /// Record that the backend reported `remote_unknown` for this
    /// session's last call, so the next `recover_context` picks it up.
    pub async fn mark_remote_unknown(&self, user: &UserId) {
        let mut active = self.active.lock().await;
        if let Some(session) = active.get_mut(user.as_str()) {
            session.last_call_remote_unknown = true;
        }
    }

    /// Atomically synthesize a ChatSummary, persist it, mark the session
    /// expired, and null the user's active-session pointer.
    pub async fn expire(&self, session: &Session, reason: ExpireReason) -> Result<(), SessionError> {
        let user = &session.user_id;

        let user_lock = {
            let mut locks = self.expire_locks.lock().await;
            locks
                .entry(user.as_str().to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _expire_guard = user_lock.lock().await;

        {
            let active = self.active.lock().await;
            match active.get(user.as_str()) {
                Some(current) if current.id == session.id => {}
                _ => return Ok(()), // another caller already expired/replaced this session
            }
        }

        let turns = chat_log::read_all(&self.root, &self.locks, user.as_str(), session.id.as_str())
            .await
            .unwrap_or_default();

        let summary_text = self.summarize_with_fallback(&turns).await;

        let range_start = turns.first().map(|t| t.timestamp).unwrap_or(session.created_at);
        let range_end = turns.last().map(|t| t.timestamp).unwrap_or(session.last_activity);

        let summary = ChatSummary {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user.clone(),
            summary_text,
            original_log_ref: session.id.as_str().to_string(),
            range_start,
            range_end,
        };
        let summary_path = self.root.chat_summary_path(user.as_str(), session.id.as_str());
        persist::write_json_atomic(&self.locks, &summary_path, &summary).await?;

        {
            let mut active = self.active.lock().await;
            if active.get(user.as_str()).map(|s| &s.id) == Some(&session.id) {
                active.remove(user.as_str());
            }
        }
        self.flush().await?;

        tracing::info!(user_id = %user, session_id = %session.id, ?reason, "session expired");
        Ok(())
    }

    async fn summarize_with_fallback(&self, turns: &[Turn]) -> String {
        let excerpt: String = turns
            .iter()
            .map(|t| format!("{:?}: {}\n", t.role, t.body))
            .collect();

        let timeout = std::time::Duration::from_secs(10);
        match tokio::time::timeout(timeout, self.llm.summarize(&excerpt)).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "summarization failed, using fallback");
                chat_log::fallback_summary(turns, self.config.chat_summary_recent_count)
            }
            Err(_) => {
                tracing::warn!("summarization timed out, using fallback");
                chat_log::fallback_summary(turns, self.config.chat_summary_recent_count)
            }
        }
    }

    /// Build the context block handed to the next LLM call when recovery
    /// is triggered: the last K chars of the ChatLog plus the N most
    /// recent ChatSummaries.
    pub async fn recover_context(&self, user: &UserId) -> Result<RecoveryContext, SessionError> {
        let session = {
            let active = self.active.lock().await;
            active.get(user.as_str()).cloned()
        };

        let chat_log_excerpt = if let Some(session) = &session {
            chat_log::tail_excerpt(
                &self.root,
                &self.locks,
                user.as_str(),
                session.id.as_str(),
                self.config.chat_log_excerpt_chars,
            )
            .await?
        } else {
            String::new()
        };

        let recent_summaries = self.recent_summaries(user, self.config.chat_summary_recent_count).await?;

        if let Some(session) = session {
            let mut active = self.active.lock().await;
            if let Some(s) = active.get_mut(user.as_str()) {
                if s.id == session.id {
                    s.last_call_remote_unknown = false;
                }
            }
        }

        Ok(RecoveryContext {
            chat_log_excerpt,
            recent_summaries,
        })
    }

    async fn recent_summaries(&self, user: &UserId, n: usize) -> Result<Vec<ChatSummary>, SessionError> {
        let dir = self
            .root
            .user_data_dir(user.as_str())
            .join("chat_summaries");
        let mut entries: Vec<std::path::PathBuf> = match std::fs::read_dir(&dir) {
            Ok(rd) => rd.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(_) => return Ok(Vec::new()),
        };
        entries.sort();
        entries.reverse();

        let mut summaries = Vec::new();
        for path in entries.into_iter().take(n) {
            if let Some(summary) = persist::read_json::<ChatSummary>(&self.locks, &path).await? {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    /// Invoke the LLM backend for this user's session, wiring `remote_id`
    /// through and recording `remote_unknown` for the next recovery check.
    pub async fn invoke(
        &self,
        user: &UserId,
        prompt: String,
        cancellation: tokio_util::sync::CancellationToken,
    ) -> Result<crate::llm::LlmResponse, LlmError> {
        let remote_id = {
            let active = self.active.lock().await;
            active.get(user.as_str()).and_then(|s| s.remote_id.clone())
        };

        let result = self
            .llm
            .invoke(
                LlmRequest {
                    prompt,
                    session_remote_id: remote_id,
                },
                cancellation,
            )
            .await;

        match &result {
            Ok(response) => {
                let mut active = self.active.lock().await;
                if let Some(session) = active.get_mut(user.as_str()) {
                    if let Some(remote_id) = &response.remote_id {
                        session.remote_id = Some(remote_id.clone());
                    }
                }
            }
            Err(e) if e.kind == crate::llm::LlmErrorKind::RemoteUnknown => {
                self.mark_remote_unknown(user).await;
            }
            Err(_) => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, LlmUsage};
    use async_trait::async_trait;

    struct StubBackend {
        summary: Option<String>,
    }

    #[async_trait]
    impl LlmBackend for StubBackend {
        async fn invoke(
            &self,
            _request: LlmRequest,
            _cancellation: tokio_util::sync::CancellationToken,
        ) -> Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                text: "ok".to_string(),
                usage: LlmUsage::default(),
                remote_id: Some("remote-1".to_string()),
            })
        }

        async fn summarize(&self, _log_excerpt: &str) -> Result<String, LlmError> {
            match &self.summary {
                Some(s) => Ok(s.clone()),
                None => Err(LlmError::transport("down")),
            }
        }
    }

    async fn manager(summary: Option<&str>) -> (SessionManager, UserId, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let root = PersistenceRoot::new(dir.path());
        let user = UserId::new();
        root.ensure_user_dirs(user.as_str()).unwrap();
        let config = Arc::new(Config {
            persistence_root: dir.path().to_path_buf(),
            ..test_config()
        });
        let backend: Arc<dyn LlmBackend> = Arc::new(StubBackend {
            summary: summary.map(str::to_string),
        });
        let manager = SessionManager::load(root, LockTable::new(), config, backend)
            .await
            .unwrap();
        (manager, user, dir)
    }

    fn test_config() -> Config {
        Config {
            persistence_root: std::path::PathBuf::from("."),
            bind_port: 8000,
            session_timeout_seconds: 3600,
            context_stale_threshold_seconds: 600,
            chat_log_excerpt_chars: 8000,
            chat_summary_recent_count: 3,
            max_sub_agents: 10,
            max_retries: 10,
            file_tracker_inline_threshold: 5,
            event_bus_ping_interval_seconds: 30,
            event_bus_missed_pong_limit: 2,
            scheduler_tick_seconds: 30,
            llm_backend_endpoint: None,
            default_quota_bytes: 1024 * 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn open_or_resume_creates_then_resumes_same_session() {
        let (manager, user, _dir) = manager(Some("summary")).await;
        let first = manager.open_or_resume(&user).await.unwrap();
        let second = manager.open_or_resume(&user).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn record_turn_updates_counters_and_appends_log() {
        let (manager, user, _dir) = manager(Some("summary")).await;
        manager.open_or_resume(&user).await.unwrap();
        let session = manager
            .record_turn(&user, TurnRole::User, "hello", 10, 0, 0.01)
            .await
            .unwrap();
        assert_eq!(session.message_count, 1);
        assert_eq!(session.turns, 1);
        assert_eq!(session.input_tokens, 10);
    }

    #[tokio::test]
    async fn expire_yields_fresh_session_with_no_carried_turns() {
        let (manager, user, _dir) = manager(Some("summary")).await;
        let session = manager.open_or_resume(&user).await.unwrap();
        manager
            .record_turn(&user, TurnRole::User, "hello", 0, 0, 0.0)
            .await
            .unwrap();

        manager.expire(&session, ExpireReason::ManualNew).await.unwrap();
        let fresh = manager.open_or_resume(&user).await.unwrap();

        assert_ne!(fresh.id, session.id);
        assert_eq!(fresh.turns, 0);
    }

    #[tokio::test]
    async fn expire_falls_back_when_summarization_fails() {
        let (manager, user, _dir) = manager(None).await;
        let session = manager.open_or_resume(&user).await.unwrap();
        manager
            .record_turn(&user, TurnRole::User, "hello there", 0, 0, 0.0)
            .await
            .unwrap();

        manager.expire(&session, ExpireReason::Timeout).await.unwrap();

        let path = manager
            .root
            .chat_summary_path(user.as_str(), session.id.as_str());
        let summary: ChatSummary = persist::read_json(&manager.locks, &path)
            .await
            .unwrap()
            .unwrap();
        assert!(summary.summary_text.contains("hello there"));
    }

    #[tokio::test]
    async fn recover_context_includes_excerpt_and_summaries() {
        let (manager, user, _dir) = manager(Some("earlier summary")).await;
        let first_session = manager.open_or_resume(&user).await.unwrap();
        manager
            .record_turn(&user, TurnRole::User, "first session turn", 0, 0, 0.0)
            .await
            .unwrap();
        manager.expire(&first_session, ExpireReason::Compact).await.unwrap();

        let second_session = manager.open_or_resume(&user).await.unwrap();
        manager
            .record_turn(&user, TurnRole::User, "second session turn", 0, 0, 0.0)
            .await
            .unwrap();

        let context = manager.recover_context(&user).await.unwrap();
        assert!(context.chat_log_excerpt.contains("second session turn"));
        assert_eq!(context.recent_summaries.len(), 1);
        assert_eq!(context.recent_summaries[0].summary_text, "earlier summary");
        let _ = second_session;
    }
}
