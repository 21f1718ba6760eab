//! ChatLog: the append-only per-session transcript, stored as a
//! line-oriented file (one JSON object per line) under the user's working
//! directory.

use crate::persist::{self, LockTable, PersistError, PersistenceRoot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

pub async fn append_turn(
    root: &PersistenceRoot,
    locks: &LockTable,
    user_id: &str,
    session_id: &str,
    turn: &Turn,
) -> Result<(), PersistError> {
    let path = root.chat_log_path(user_id, session_id);
    persist::append_jsonl(locks, &path, turn).await
}

pub async fn read_all(
    root: &PersistenceRoot,
    locks: &LockTable,
    user_id: &str,
    session_id: &str,
) -> Result<Vec<Turn>, PersistError> {
    let path = root.chat_log_path(user_id, session_id);
    persist::read_jsonl(locks, &path).await
}

/// Last `max_chars` characters of the log, rendered as `role: body` lines,
/// used by `recover_context`.
pub async fn tail_excerpt(
    root: &PersistenceRoot,
    locks: &LockTable,
    user_id: &str,
    session_id: &str,
    max_chars: usize,
) -> Result<String, PersistError> {
    let turns = read_all(root, locks, user_id, session_id).await?;
    let rendered: Vec<String> = turns
        .iter()
        .map(|t| format!("{:?}: {}", t.role, t.body))
        .collect();
    let joined = rendered.join("\n");
    if joined.chars().count() <= max_chars {
        return Ok(joined);
    }
    let skip = joined.chars().count() - max_chars;
    Ok(joined.chars().skip(skip).collect())
}

/// Deterministic fallback summary: first `n` and last `n` turns plus
/// aggregate stats, used when the LLM-backed summarization call fails or
/// times out (§4.1 "a deterministic fallback summary ... is written").
pub fn fallback_summary(turns: &[Turn], n: usize) -> String {
    if turns.is_empty() {
        return "(empty conversation)".to_string();
    }

    let total_chars: usize = turns.iter().map(|t| t.body.chars().count()).sum();
    let head: Vec<&Turn> = turns.iter().take(n).collect();
    let tail: Vec<&Turn> = turns.iter().rev().take(n).rev().collect();

    let mut out = format!(
        "{} turns, {total_chars} characters total.\n\nEarliest turns:\n",
        turns.len()
    );
    for t in &head {
        out.push_str(&format!("- {:?}: {}\n", t.role, truncate(&t.body, 200)));
    }
    out.push_str("\nMost recent turns:\n");
    for t in &tail {
        out.push_str(&format!("- {:?}: {}\n", t.role, truncate(&t.body, 200)));
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

    fn turn(role: TurnRole, body: &str) -> Turn {
        Turn {
            role,
            body: body.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn appends_and_reads_turns_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = PersistenceRoot::new(dir.path());
        let locks = LockTable::new();

        append_turn(&root, &locks, "u1", "s1", &turn(TurnRole::User, "hi")).await.unwrap();
        append_turn(&root, &locks, "u1", "s1", &turn(TurnRole::Agent, "hello")).await.unwrap();

        let turns = read_all(&root, &locks, "u1", "s1").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].body, "hi");
        assert_eq!(turns[1].body, "hello");
    }

    #[test]
    fn fallback_summary_includes_head_and_tail() {
        let turns: Vec<Turn> = (0..10)
            .map(|i| turn(TurnRole::User, &format!("turn {i}")))
            .collect();
        let summary = fallback_summary(&turns, 2);
        assert!(summary.contains("turn 0"));
        assert!(summary.contains("turn 1"));
        assert!(summary.contains("turn 9"));
        assert!(summary.contains("turn 8"));
        assert!(summary.contains("10 turns"));
    }

    #[test]
    fn fallback_summary_handles_empty_log() {
        assert_eq!(fallback_summary(&[], 5), "(empty conversation)");
    }
}
