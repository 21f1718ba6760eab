//! `QuotaGate`: the external contract any write that enlarges a user's
//! working directory must consult before proceeding. This crate consumes
//! the trait; storage-quota enforcement internals are an external
//! collaborator's concern, not ours.

use crate::ids::UserId;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Ok,
    Denied,
}

#[derive(Debug, Clone, Copy)]
pub struct StorageReport {
    pub used_bytes: u64,
    pub quota_bytes: u64,
}

#[async_trait]
pub trait QuotaGate: Send + Sync {
    async fn check(&self, user: &UserId, additional_bytes: u64) -> QuotaDecision;
    async fn report(&self, user: &UserId) -> StorageReport;
}

/// Default `QuotaGate` backed by a per-user fixed byte budget and the
/// actual size of the user's working directory on disk. Suitable as the
/// substrate's built-in behavior when no external quota service is wired
/// in; a deployment that needs centralized quota accounting supplies its
/// own `QuotaGate` impl instead.
pub struct FsQuotaGate {
    persistence: crate::persist::PersistenceRoot,
    default_quota_bytes: u64,
}

impl FsQuotaGate {
    pub fn new(persistence: crate::persist::PersistenceRoot, default_quota_bytes: u64) -> Self {
        Self {
            persistence,
            default_quota_bytes,
        }
    }

    fn dir_size(path: &std::path::Path) -> u64 {
        walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }
}

#[async_trait]
impl QuotaGate for FsQuotaGate {
    async fn check(&self, user: &UserId, additional_bytes: u64) -> QuotaDecision {
        let report = self.report(user).await;
        if report.used_bytes + additional_bytes > report.quota_bytes {
            QuotaDecision::Denied
        } else {
            QuotaDecision::Ok
        }
    }

    async fn report(&self, user: &UserId) -> StorageReport {
        let dir = self.persistence.user_data_dir(user.as_str());
        let used_bytes = Self::dir_size(&dir);
        StorageReport {
            used_bytes,
            quota_bytes: self.default_quota_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denies_when_addition_exceeds_quota() {
        let dir = tempfile::tempdir().unwrap();
        let root = crate::persist::PersistenceRoot::new(dir.path());
        let user = UserId::new();
        root.ensure_user_dirs(user.as_str()).unwrap();
        std::fs::write(root.user_data_dir(user.as_str()).join("f.txt"), vec![0u8; 100]).unwrap();

        let gate = FsQuotaGate::new(root, 150);
        assert_eq!(gate.check(&user, 100).await, QuotaDecision::Denied);
        assert_eq!(gate.check(&user, 40).await, QuotaDecision::Ok);
    }
}
