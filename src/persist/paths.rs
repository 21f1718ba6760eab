//! Typed path helpers over the per-user persisted-state layout.
//!
//! Every path a component needs is derived here rather than assembled
//! ad hoc at call sites, so the on-disk layout is defined in exactly one
//! place.

use std::path::{Path, PathBuf};

/// Root of the persisted-state tree, e.g. `$HOME/.agent-host/data`.
#[derive(Debug, Clone)]
pub struct PersistenceRoot {
    root: PathBuf,
}

impl PersistenceRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_dir(&self, user_id: &str) -> PathBuf {
        self.root.join("users").join(user_id)
    }

    /// `users/<id>/data/` — the user's working directory, the tree the
    /// File Tracker snapshots and diffs.
    pub fn user_data_dir(&self, user_id: &str) -> PathBuf {
        self.user_dir(user_id).join("data")
    }

    /// `users/<id>/data/chat_logs/<session_id>.log`
    pub fn chat_log_path(&self, user_id: &str, session_id: &str) -> PathBuf {
        self.user_data_dir(user_id)
            .join("chat_logs")
            .join(format!("{session_id}.log"))
    }

    pub fn chat_logs_dir(&self, user_id: &str) -> PathBuf {
        self.user_data_dir(user_id).join("chat_logs")
    }

    /// `users/<id>/data/chat_summaries/<session_id>.json`
    pub fn chat_summary_path(&self, user_id: &str, session_id: &str) -> PathBuf {
        self.user_data_dir(user_id)
            .join("chat_summaries")
            .join(format!("{session_id}.json"))
    }

    /// `users/<id>/data/memories.json`
    pub fn memories_path(&self, user_id: &str) -> PathBuf {
        self.user_data_dir(user_id).join("memories.json")
    }

    /// `users/<id>/data/schedules/tasks.json`
    pub fn schedule_tasks_path(&self, user_id: &str) -> PathBuf {
        self.user_data_dir(user_id)
            .join("schedules")
            .join("tasks.json")
    }

    /// `users/<id>/data/schedules/operation_log.jsonl`
    pub fn schedule_operation_log_path(&self, user_id: &str) -> PathBuf {
        self.user_data_dir(user_id)
            .join("schedules")
            .join("operation_log.jsonl")
    }

    /// `users/<id>/data/running_tasks/<task_id>.json`
    pub fn running_task_path(&self, user_id: &str, task_id: &str) -> PathBuf {
        self.user_data_dir(user_id)
            .join("running_tasks")
            .join(format!("{task_id}.json"))
    }

    pub fn running_tasks_dir(&self, user_id: &str) -> PathBuf {
        self.user_data_dir(user_id).join("running_tasks")
    }

    /// `users/<id>/data/completed_tasks/<task_id>.json`
    pub fn completed_task_path(&self, user_id: &str, task_id: &str) -> PathBuf {
        self.user_data_dir(user_id)
            .join("completed_tasks")
            .join(format!("{task_id}.json"))
    }

    pub fn completed_tasks_dir(&self, user_id: &str) -> PathBuf {
        self.user_data_dir(user_id).join("completed_tasks")
    }

    /// Scratch directory a running task's sub-agent is given as its cwd,
    /// snapshotted and diffed by the File Tracker. Placed alongside
    /// `running_tasks/` since its lifetime matches the task's.
    pub fn task_workspace_dir(&self, user_id: &str, task_id: &str) -> PathBuf {
        self.user_dir(user_id)
            .join("task_workspaces")
            .join(task_id)
    }

    /// Where a task's packed artifact archive lands once it exceeds the
    /// inline-file threshold.
    pub fn task_archive_path(&self, user_id: &str, task_id: &str) -> PathBuf {
        self.user_dir(user_id)
            .join("task_archives")
            .join(format!("{task_id}.tar.zst"))
    }

    /// Per-task review log: every rejection the Review Agent issues
    /// during a `delegate_and_review` run, appended as the retries happen.
    /// Placed alongside the task workspace since its lifetime matches the
    /// task's.
    pub fn task_review_log_path(&self, user_id: &str, task_id: &str) -> PathBuf {
        self.user_dir(user_id)
            .join("task_workspaces")
            .join(format!("{task_id}.review_log.jsonl"))
    }

    pub fn users_dir(&self) -> PathBuf {
        self.root.join("users")
    }

    /// Ensure every directory a fresh user needs exists. Idempotent.
    pub fn ensure_user_dirs(&self, user_id: &str) -> std::io::Result<()> {
        for dir in [
            self.chat_logs_dir(user_id),
            self.user_data_dir(user_id).join("chat_summaries"),
            self.user_data_dir(user_id).join("schedules"),
            self.running_tasks_dir(user_id),
            self.completed_tasks_dir(user_id),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Ensure the root itself exists, called once at start-up.
    pub fn ensure_root(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_per_user_tree() {
        let root = PersistenceRoot::new("/var/lib/agent-host");
        assert_eq!(
            root.memories_path("u1"),
            PathBuf::from("/var/lib/agent-host/users/u1/data/memories.json")
        );
        assert_eq!(
            root.schedule_operation_log_path("u1"),
            PathBuf::from(
                "/var/lib/agent-host/users/u1/data/schedules/operation_log.jsonl"
            )
        );
        assert_eq!(
            root.running_task_path("u1", "t1"),
            PathBuf::from("/var/lib/agent-host/users/u1/data/running_tasks/t1.json")
        );
    }
}
