//! User entity and the store backing it. Users are created lazily on first
//! authenticated contact and never destroyed, per the data model.

use crate::ids::UserId;
use crate::persist::{self, LockTable, PersistError, PersistenceRoot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub quota_bytes: u64,
    pub enabled: bool,
    /// IANA timezone identifier used for the Scheduler's wall-clock
    /// evaluations. Every user needs one for recurrence evaluation to make
    /// sense; defaults to UTC for users created before this field
    /// existed or supplied by a client that doesn't set it.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsersFile {
    users: HashMap<String, User>,
}

/// Shared `users.json` at the persistence root, guarded by an in-memory
/// read-write lock for lookups plus the persistence layer's own per-path
/// write lock for durability.
#[derive(Clone)]
pub struct UserStore {
    root: PersistenceRoot,
    locks: LockTable,
    cache: Arc<RwLock<UsersFile>>,
    default_quota_bytes: u64,
}

impl UserStore {
    pub async fn load(
        root: PersistenceRoot,
        locks: LockTable,
        default_quota_bytes: u64,
    ) -> Result<Self, PersistError> {
        let path = root.root().join("users.json");
        let file: UsersFile = persist::read_json(&locks, &path).await?.unwrap_or_default();
        Ok(Self {
            root,
            locks,
            cache: Arc::new(RwLock::new(file)),
            default_quota_bytes,
        })
    }

    fn path(&self) -> std::path::PathBuf {
        self.root.root().join("users.json")
    }

    async fn flush(&self) -> Result<(), PersistError> {
        let file = self.cache.read().await;
        persist::write_json_atomic(&self.locks, &self.path(), &*file).await
    }

    pub async fn get(&self, id: &UserId) -> Option<User> {
        self.cache.read().await.users.get(id.as_str()).cloned()
    }

    /// Fetch the user with this id, creating a fresh enabled record with
    /// the default quota if this is their first contact.
    pub async fn get_or_create(&self, id: &UserId) -> Result<User, PersistError> {
        if let Some(existing) = self.get(id).await {
            return Ok(existing);
        }
        let user = User {
            id: id.clone(),
            display_name: id.as_str().to_string(),
            quota_bytes: self.default_quota_bytes,
            enabled: true,
            timezone: default_timezone(),
        };
        {
            let mut file = self.cache.write().await;
            file.users.insert(id.as_str().to_string(), user.clone());
        }
        self.root
            .ensure_user_dirs(id.as_str())
            .map_err(|source| PersistError::Io {
                path: self.root.user_data_dir(id.as_str()),
                source,
            })?;
        self.flush().await?;
        Ok(user)
    }

    pub async fn set_enabled(&self, id: &UserId, enabled: bool) -> Result<(), PersistError> {
        {
            let mut file = self.cache.write().await;
            if let Some(user) = file.users.get_mut(id.as_str()) {
                user.enabled = enabled;
            }
        }
        self.flush().await
    }

    pub async fn set_timezone(&self, id: &UserId, timezone: String) -> Result<(), PersistError> {
        {
            let mut file = self.cache.write().await;
            if let Some(user) = file.users.get_mut(id.as_str()) {
                user.timezone = timezone;
            }
        }
        self.flush().await
    }

    pub async fn list(&self) -> Vec<User> {
        self.cache.read().await.users.values().cloned().collect()
    }
}
