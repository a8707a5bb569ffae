use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::storage::JsonStorage;

pub const SUDO_FILE: &str = "sudo_users.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SudoEntry {
    pub user_id: u64,
    pub added_by: u64,
    pub added_at: DateTime<Utc>,
    pub active: bool,
    pub removed_by: Option<u64>,
    pub removed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddSudoOutcome {
    Added,
    /// A previously removed entry was reactivated.
    Restored,
    AlreadySudo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveSudoOutcome {
    Removed,
    NotSudo,
    /// The owner can never lose sudo rights.
    Protected,
}

/// Usuarios con privilegios elevados: owner, admins de config y sudo persistidos
pub struct SudoRegistry {
    owner_id: Option<u64>,
    admin_ids: Vec<u64>,
    users: RwLock<BTreeMap<u64, SudoEntry>>,
    storage: Arc<JsonStorage>,
    persist_lock: Mutex<()>,
}

impl SudoRegistry {
    pub async fn load(storage: Arc<JsonStorage>, owner_id: Option<u64>, admin_ids: Vec<u64>) -> Result<Self> {
        let entries: Vec<SudoEntry> = storage.load(SUDO_FILE).await?;
        let active = entries.iter().filter(|e| e.active).count();
        info!("👑 Sudo: owner {:?}, {} admins, {} usuarios activos", owner_id, admin_ids.len(), active);

        Ok(Self {
            owner_id,
            admin_ids,
            users: RwLock::new(entries.into_iter().map(|e| (e.user_id, e)).collect()),
            storage,
            persist_lock: Mutex::new(()),
        })
    }

    pub fn owner_id(&self) -> Option<u64> {
        self.owner_id
    }

    pub fn is_owner(&self, user_id: u64) -> bool {
        self.owner_id == Some(user_id)
    }

    /// Owner and configured admins; only they manage the sudo list.
    pub fn can_manage(&self, user_id: u64) -> bool {
        self.is_owner(user_id) || self.admin_ids.contains(&user_id)
    }

    pub fn is_sudo(&self, user_id: u64) -> bool {
        self.can_manage(user_id)
            || self
                .users
                .read()
                .get(&user_id)
                .map(|e| e.active)
                .unwrap_or(false)
    }

    pub async fn add(&self, user_id: u64, actor: u64) -> AddSudoOutcome {
        let outcome = {
            let mut users = self.users.write();
            match users.get_mut(&user_id) {
                Some(entry) if entry.active => AddSudoOutcome::AlreadySudo,
                Some(entry) => {
                    entry.active = true;
                    entry.added_by = actor;
                    entry.added_at = Utc::now();
                    entry.removed_by = None;
                    entry.removed_at = None;
                    AddSudoOutcome::Restored
                }
                None => {
                    users.insert(
                        user_id,
                        SudoEntry {
                            user_id,
                            added_by: actor,
                            added_at: Utc::now(),
                            active: true,
                            removed_by: None,
                            removed_at: None,
                        },
                    );
                    AddSudoOutcome::Added
                }
            }
        };

        if outcome != AddSudoOutcome::AlreadySudo {
            info!("👑 {} agregado como sudo por {}", user_id, actor);
            self.persist().await;
        }
        outcome
    }

    pub async fn remove(&self, user_id: u64, actor: u64) -> RemoveSudoOutcome {
        if self.is_owner(user_id) {
            return RemoveSudoOutcome::Protected;
        }

        let outcome = {
            let mut users = self.users.write();
            match users.get_mut(&user_id) {
                Some(entry) if entry.active => {
                    entry.active = false;
                    entry.removed_by = Some(actor);
                    entry.removed_at = Some(Utc::now());
                    RemoveSudoOutcome::Removed
                }
                _ => RemoveSudoOutcome::NotSudo,
            }
        };

        if outcome == RemoveSudoOutcome::Removed {
            info!("👑 {} removido de sudo por {}", user_id, actor);
            self.persist().await;
        }
        outcome
    }

    /// Active persisted sudo users, by id.
    pub fn list(&self) -> Vec<u64> {
        self.users
            .read()
            .values()
            .filter(|e| e.active)
            .map(|e| e.user_id)
            .collect()
    }

    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot: Vec<SudoEntry> = self.users.read().values().cloned().collect();
        if let Err(e) = self.storage.save(SUDO_FILE, &snapshot).await {
            error!("💾 No se pudo guardar la lista sudo: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const OWNER: u64 = 1;
    const ADMIN: u64 = 2;

    async fn registry() -> (tempfile::TempDir, Arc<JsonStorage>, SudoRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(JsonStorage::new(dir.path().to_path_buf()).await.unwrap());
        let registry = SudoRegistry::load(storage.clone(), Some(OWNER), vec![ADMIN]).await.unwrap();
        (dir, storage, registry)
    }

    #[tokio::test]
    async fn owner_and_admins_are_implicit_sudo() {
        let (_dir, _storage, registry) = registry().await;
        assert!(registry.is_sudo(OWNER));
        assert!(registry.is_sudo(ADMIN));
        assert!(!registry.is_sudo(3));
        assert!(registry.can_manage(ADMIN));
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn add_remove_and_restore() {
        let (_dir, storage, registry) = registry().await;

        assert_eq!(registry.add(3, OWNER).await, AddSudoOutcome::Added);
        assert_eq!(registry.add(3, OWNER).await, AddSudoOutcome::AlreadySudo);
        assert!(registry.is_sudo(3));

        assert_eq!(registry.remove(3, ADMIN).await, RemoveSudoOutcome::Removed);
        assert_eq!(registry.remove(3, ADMIN).await, RemoveSudoOutcome::NotSudo);
        assert!(!registry.is_sudo(3));

        assert_eq!(registry.add(3, ADMIN).await, AddSudoOutcome::Restored);

        let reloaded = SudoRegistry::load(storage, Some(OWNER), vec![]).await.unwrap();
        assert_eq!(reloaded.list(), vec![3]);
    }

    #[tokio::test]
    async fn the_owner_cannot_be_removed() {
        let (_dir, _storage, registry) = registry().await;
        assert_eq!(registry.remove(OWNER, ADMIN).await, RemoveSudoOutcome::Protected);
        assert!(registry.is_sudo(OWNER));
    }
}
