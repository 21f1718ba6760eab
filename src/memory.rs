//! Memory Store (§4.6): persistent structured facts per user, with a
//! supersede chain for evolving facts over time.

use crate::event_bus::EventBus;
use crate::ids::{MemoryId, UserId};
use crate::persist::{self, LockTable, PersistError, PersistenceRoot};
use crate::quota::{QuotaDecision, QuotaGate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    Personal,
    Career,
    Interests,
    Preferences,
    Goals,
    Relationships,
    Emotions,
    Health,
    Finance,
    Schedule,
    Context,
    Family,
    Education,
}

impl MemoryCategory {
    /// Fixed lookup table: career/interests/goals/education are public by
    /// default, everything else defaults private.
    pub fn default_visibility(self) -> Visibility {
        match self {
            MemoryCategory::Career
            | MemoryCategory::Interests
            | MemoryCategory::Goals
            | MemoryCategory::Education => Visibility::Public,
            _ => Visibility::Private,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Explicit,
    Inferred,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub user_id: UserId,
    pub content: String,
    pub category: MemoryCategory,
    pub visibility: Visibility,
    pub source_type: SourceType,
    pub confidence: f32,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub supersedes_id: Option<MemoryId>,
    pub superseded_by_id: Option<MemoryId>,
    pub user_confirmed: bool,
}

impl Memory {
    pub fn is_current(&self) -> bool {
        self.superseded_by_id.is_none() && self.valid_until.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct NewMemory {
    pub content: String,
    pub category: MemoryCategory,
    pub visibility: Option<Visibility>,
    pub source_type: SourceType,
    pub confidence: f32,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryUpdate {
    pub content: Option<String>,
    pub visibility: Option<Visibility>,
    pub user_confirmed: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub by_category: HashMap<String, usize>,
    pub by_visibility: HashMap<String, usize>,
}

/// On-disk document for `memories.json`: newest-first, the chosen
/// authoritative ordering at rest (see the ordering decision recorded in
/// the design ledger).
#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoriesFile {
    memories: Vec<Memory>,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("storage quota exceeded")]
    QuotaExceeded,
}

pub struct MemoryStore {
    root: PersistenceRoot,
    locks: LockTable,
    quota: Arc<dyn QuotaGate>,
    event_bus: EventBus,
}

impl MemoryStore {
    pub fn new(
        root: PersistenceRoot,
        locks: LockTable,
        quota: Arc<dyn QuotaGate>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            root,
            locks,
            quota,
            event_bus,
        }
    }

    /// Re-measures usage and publishes `storage_update` (§6) so subscribers
    /// see it as soon as a save/delete changes what's on disk.
    async fn publish_storage_update(&self, user: &UserId) {
        let report = self.quota.report(user).await;
        self.event_bus
            .broadcast_storage_update(user, report.used_bytes, report.quota_bytes)
            .await;
    }

    async fn load(&self, user: &UserId) -> Result<MemoriesFile, PersistError> {
        let path = self.root.memories_path(user.as_str());
        Ok(persist::read_json(&self.locks, &path).await?.unwrap_or_default())
    }

    async fn store(&self, user: &UserId, file: &MemoriesFile) -> Result<(), PersistError> {
        let path = self.root.memories_path(user.as_str());
        persist::write_json_atomic(&self.locks, &path, file).await
    }

    /// Append a new Memory, inserted at the front so storage stays
    /// newest-first. Consults the `QuotaGate` first since this grows the
    /// user's stored data (§5); a denial leaves the store untouched.
    pub async fn save(&self, user: &UserId, new: NewMemory) -> Result<Memory, MemoryError> {
        let now = Utc::now();
        let memory = Memory {
            id: MemoryId::new(),
            user_id: user.clone(),
            content: new.content,
            visibility: new.visibility.unwrap_or_else(|| new.category.default_visibility()),
            category: new.category,
            source_type: new.source_type,
            confidence: new.confidence,
            tags: new.tags,
            created_at: now,
            valid_from: now,
            valid_until: None,
            supersedes_id: None,
            superseded_by_id: None,
            user_confirmed: false,
        };

        let estimated_bytes = serde_json::to_vec(&memory).map(|v| v.len() as u64).unwrap_or(0);
        if self.quota.check(user, estimated_bytes).await == QuotaDecision::Denied {
            return Err(MemoryError::QuotaExceeded);
        }

        let mut file = self.load(user).await?;
        file.memories.insert(0, memory.clone());
        self.store(user, &file).await?;
        self.publish_storage_update(user).await;
        Ok(memory)
    }

    /// Save a new Memory and atomically close out its predecessor: sets
    /// `superseded_by_id` on the predecessor and `valid_until = now`.
    pub async fn save_with_supersede(
        &self,
        user: &UserId,
        new: NewMemory,
        supersedes_id: &MemoryId,
    ) -> Result<Memory, MemoryError> {
        let now = Utc::now();

        let successor_id = MemoryId::new();
        let memory = Memory {
            id: successor_id.clone(),
            user_id: user.clone(),
            content: new.content,
            visibility: new.visibility.unwrap_or_else(|| new.category.default_visibility()),
            category: new.category,
            source_type: new.source_type,
            confidence: new.confidence,
            tags: new.tags,
            created_at: now,
            valid_from: now,
            valid_until: None,
            supersedes_id: Some(supersedes_id.clone()),
            superseded_by_id: None,
            user_confirmed: false,
        };

        let estimated_bytes = serde_json::to_vec(&memory).map(|v| v.len() as u64).unwrap_or(0);
        if self.quota.check(user, estimated_bytes).await == QuotaDecision::Denied {
            return Err(MemoryError::QuotaExceeded);
        }

        let mut file = self.load(user).await?;

        let predecessor = file
            .memories
            .iter_mut()
            .find(|m| &m.id == supersedes_id)
            .ok_or_else(|| {
                MemoryError::Persist(PersistError::Io {
                    path: self.root.memories_path(user.as_str()),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no memory {supersedes_id} to supersede"),
                    ),
                })
            })?;
        predecessor.superseded_by_id = Some(successor_id.clone());
        predecessor.valid_until = Some(now);

        file.memories.insert(0, memory.clone());
        self.store(user, &file).await?;
        self.publish_storage_update(user).await;
        Ok(memory)
    }

    /// Substring/tag match over current (non-superseded) memories unless
    /// `include_superseded` is set, most-recent-first.
    pub async fn search(
        &self,
        user: &UserId,
        query: Option<&str>,
        category: Option<MemoryCategory>,
        include_superseded: bool,
        limit: usize,
    ) -> Result<Vec<Memory>, PersistError> {
        let file = self.load(user).await?;
        let query_lower = query.map(str::to_lowercase);

        let matches: Vec<Memory> = file
            .memories
            .into_iter()
            .filter(|m| include_superseded || m.is_current())
            .filter(|m| category.is_none_or(|c| c as u8 == m.category as u8))
            .filter(|m| {
                query_lower.as_ref().is_none_or(|q| {
                    m.content.to_lowercase().contains(q)
                        || m.tags.iter().any(|t| t.to_lowercase().contains(q))
                })
            })
            .take(limit)
            .collect();
        Ok(matches)
    }

    /// Full supersede chain for a category, including superseded entries,
    /// ordered by `created_at` ascending.
    pub async fn list_timeline(
        &self,
        user: &UserId,
        category: MemoryCategory,
    ) -> Result<Vec<Memory>, PersistError> {
        let file = self.load(user).await?;
        let mut chain: Vec<Memory> = file
            .memories
            .into_iter()
            .filter(|m| m.category as u8 == category as u8)
            .collect();
        chain.sort_by_key(|m| m.created_at);
        Ok(chain)
    }

    pub async fn update(
        &self,
        user: &UserId,
        id: &MemoryId,
        patch: MemoryUpdate,
    ) -> Result<Option<Memory>, PersistError> {
        let mut file = self.load(user).await?;
        let updated = file.memories.iter_mut().find(|m| &m.id == id).map(|m| {
            if let Some(content) = patch.content {
                m.content = content;
            }
            if let Some(visibility) = patch.visibility {
                m.visibility = visibility;
            }
            if let Some(confirmed) = patch.user_confirmed {
                m.user_confirmed = confirmed;
            }
            m.clone()
        });
        if updated.is_some() {
            self.store(user, &file).await?;
        }
        Ok(updated)
    }

    pub async fn delete(&self, user: &UserId, id: &MemoryId) -> Result<bool, PersistError> {
        let mut file = self.load(user).await?;
        let before = file.memories.len();
        file.memories.retain(|m| &m.id != id);
        let removed = file.memories.len() != before;
        if removed {
            self.store(user, &file).await?;
            self.publish_storage_update(user).await;
        }
        Ok(removed)
    }

    pub async fn stats(&self, user: &UserId) -> Result<MemoryStats, PersistError> {
        let file = self.load(user).await?;
        let mut stats = MemoryStats::default();
        for memory in &file.memories {
            *stats
                .by_category
                .entry(format!("{:?}", memory.category).to_lowercase())
                .or_insert(0) += 1;
            *stats
                .by_visibility
                .entry(format!("{:?}", memory.visibility).to_lowercase())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(content: &str) -> NewMemory {
        NewMemory {
            content: content.to_string(),
            category: MemoryCategory::Preferences,
            visibility: None,
            source_type: SourceType::Explicit,
            confidence: 0.9,
            tags: vec!["food".to_string()],
        }
    }

    async fn store() -> (MemoryStore, UserId, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let root = PersistenceRoot::new(dir.path());
        let user = UserId::new();
        root.ensure_user_dirs(user.as_str()).unwrap();
        let quota: Arc<dyn QuotaGate> = Arc::new(crate::quota::FsQuotaGate::new(
            root.clone(),
            1024 * 1024,
        ));
        let event_bus = EventBus::new(8);
        (
            MemoryStore::new(root, LockTable::new(), quota, event_bus),
            user,
            dir,
        )
    }

    #[tokio::test]
    async fn default_visibility_follows_category_table() {
        assert_eq!(
            MemoryCategory::Career.default_visibility(),
            Visibility::Public
        );
        assert_eq!(
            MemoryCategory::Health.default_visibility(),
            Visibility::Private
        );
    }

    #[tokio::test]
    async fn save_then_search_finds_it() {
        let (store, user, _dir) = store().await;
        store.save(&user, sample("loves ramen")).await.unwrap();

        let found = store
            .search(&user, Some("ramen"), None, false, 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "loves ramen");
    }

    #[tokio::test]
    async fn save_denied_when_quota_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let root = PersistenceRoot::new(dir.path());
        let user = UserId::new();
        root.ensure_user_dirs(user.as_str()).unwrap();
        std::fs::write(root.user_data_dir(user.as_str()).join("f.txt"), vec![0u8; 100]).unwrap();

        let quota: Arc<dyn QuotaGate> = Arc::new(crate::quota::FsQuotaGate::new(root.clone(), 100));
        let event_bus = EventBus::new(8);
        let store = MemoryStore::new(root, LockTable::new(), quota, event_bus);

        let result = store.save(&user, sample("over quota")).await;
        assert!(matches!(result, Err(MemoryError::QuotaExceeded)));
    }

    #[tokio::test]
    async fn supersede_closes_out_predecessor_and_links_chain() {
        let (store, user, _dir) = store().await;
        let first = store.save(&user, sample("lives in Tokyo")).await.unwrap();

        let second = store
            .save_with_supersede(&user, sample("lives in Osaka"), &first.id)
            .await
            .unwrap();

        assert_eq!(second.supersedes_id, Some(first.id.clone()));

        let timeline = store
            .list_timeline(&user, MemoryCategory::Preferences)
            .await
            .unwrap();
        assert_eq!(timeline.len(), 2);
        let reloaded_first = timeline.iter().find(|m| m.id == first.id).unwrap();
        assert_eq!(reloaded_first.superseded_by_id, Some(second.id.clone()));
        assert!(reloaded_first.valid_until.is_some());
        assert!(!reloaded_first.is_current());
        assert!(second.is_current());
    }

    #[tokio::test]
    async fn search_excludes_superseded_by_default() {
        let (store, user, _dir) = store().await;
        let first = store.save(&user, sample("drinks coffee")).await.unwrap();
        store
            .save_with_supersede(&user, sample("drinks tea"), &first.id)
            .await
            .unwrap();

        let current = store.search(&user, None, None, false, 10).await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].content, "drinks tea");

        let all = store.search(&user, None, None, true, 10).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_memory() {
        let (store, user, _dir) = store().await;
        let memory = store.save(&user, sample("x")).await.unwrap();
        assert!(store.delete(&user, &memory.id).await.unwrap());
        assert!(store.search(&user, None, None, false, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stats_counts_by_category_and_visibility() {
        let (store, user, _dir) = store().await;
        store.save(&user, sample("a")).await.unwrap();
        store.save(&user, sample("b")).await.unwrap();

        let stats = store.stats(&user).await.unwrap();
        assert_eq!(stats.by_category.get("preferences"), Some(&2));
        assert_eq!(stats.by_visibility.get("private"), Some(&2));
    }
}
