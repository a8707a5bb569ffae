//! # Moderation Module
//!
//! Ban, mute and global-ban records with full audit history.
//!
//! Every relation lives in its own table. A record is active until its
//! `revoked_at` is set; only the latest active record per (subject, scope)
//! matters for enforcement. All mutations happen under one write lock so a
//! reader never sees a half-applied record.

pub mod sudo;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{bot::client::ChatClient, storage::JsonStorage};

pub use sudo::SudoRegistry;

pub const MODERATION_FILE: &str = "moderation.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Chat(i64),
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Ban,
    Mute,
    GlobalBan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationRecord {
    pub id: u64,
    pub subject: u64,
    pub scope: Scope,
    pub actor: u64,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub revoked_by: Option<u64>,
    pub revoked_at: Option<DateTime<Utc>>,
    /// Kicks are stored as bans that were revoked on the spot.
    #[serde(default)]
    pub is_kick: bool,
}

impl ModerationRecord {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Created(ModerationRecord),
    /// Already active; only the reason was refreshed.
    Updated(ModerationRecord),
}

impl ApplyOutcome {
    pub fn record(&self) -> &ModerationRecord {
        match self {
            Self::Created(record) | Self::Updated(record) => record,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RevokeOutcome {
    Revoked(ModerationRecord),
    NotFound,
}

/// Tally of a per-chat operation applied across many chats.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanOutReport {
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<(i64, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalBanReport {
    pub outcome: ApplyOutcome,
    pub fan_out: FanOutReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalUnbanReport {
    pub outcome: RevokeOutcome,
    /// `None` when there was nothing to revoke.
    pub fan_out: Option<FanOutReport>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    next_id: u64,
    bans: Vec<ModerationRecord>,
    mutes: Vec<ModerationRecord>,
    global_bans: Vec<ModerationRecord>,
}

impl Tables {
    fn table(&self, relation: Relation) -> &Vec<ModerationRecord> {
        match relation {
            Relation::Ban => &self.bans,
            Relation::Mute => &self.mutes,
            Relation::GlobalBan => &self.global_bans,
        }
    }

    fn table_mut(&mut self, relation: Relation) -> &mut Vec<ModerationRecord> {
        match relation {
            Relation::Ban => &mut self.bans,
            Relation::Mute => &mut self.mutes,
            Relation::GlobalBan => &mut self.global_bans,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct ModerationStore {
    tables: RwLock<Tables>,
    storage: Arc<JsonStorage>,
    persist_lock: Mutex<()>,
}

impl ModerationStore {
    pub async fn load(storage: Arc<JsonStorage>) -> Result<Self> {
        let tables: Tables = storage.load(MODERATION_FILE).await?;
        info!(
            "📂 Moderación cargada: {} bans, {} mutes, {} bans globales",
            tables.bans.len(),
            tables.mutes.len(),
            tables.global_bans.len()
        );

        Ok(Self {
            tables: RwLock::new(tables),
            storage,
            persist_lock: Mutex::new(()),
        })
    }

    pub async fn ban(&self, subject: u64, chat_id: i64, actor: u64, reason: Option<String>) -> ApplyOutcome {
        self.apply(Relation::Ban, subject, Scope::Chat(chat_id), actor, reason).await
    }

    pub async fn unban(&self, subject: u64, chat_id: i64, actor: u64) -> RevokeOutcome {
        self.revoke(Relation::Ban, subject, Scope::Chat(chat_id), actor).await
    }

    pub fn is_banned(&self, subject: u64, chat_id: i64) -> bool {
        self.is_active(Relation::Ban, subject, Scope::Chat(chat_id))
    }

    pub async fn mute(&self, subject: u64, chat_id: i64, actor: u64, reason: Option<String>) -> ApplyOutcome {
        self.apply(Relation::Mute, subject, Scope::Chat(chat_id), actor, reason).await
    }

    pub async fn unmute(&self, subject: u64, chat_id: i64, actor: u64) -> RevokeOutcome {
        self.revoke(Relation::Mute, subject, Scope::Chat(chat_id), actor).await
    }

    pub fn is_muted(&self, subject: u64, chat_id: i64) -> bool {
        self.is_active(Relation::Mute, subject, Scope::Chat(chat_id))
    }

    /// Records a kick: a chat ban that is revoked immediately.
    pub async fn record_kick(
        &self,
        subject: u64,
        chat_id: i64,
        actor: u64,
        reason: Option<String>,
    ) -> ModerationRecord {
        let record = {
            let mut tables = self.tables.write();
            let now = Utc::now();
            let record = ModerationRecord {
                id: tables.next_id(),
                subject,
                scope: Scope::Chat(chat_id),
                actor,
                reason,
                created_at: now,
                revoked_by: Some(actor),
                revoked_at: Some(now),
                is_kick: true,
            };
            tables.bans.push(record.clone());
            record
        };
        self.persist().await;
        record
    }

    /// Records the global ban and then bans the subject in every given chat.
    ///
    /// Chats fail independently; nothing is rolled back. Re-running it is
    /// harmless: the record is only refreshed and already-banned chats
    /// accept the ban again.
    pub async fn global_ban(
        &self,
        subject: u64,
        actor: u64,
        reason: Option<String>,
        chats: &[i64],
        client: &dyn ChatClient,
    ) -> GlobalBanReport {
        let outcome = self.apply(Relation::GlobalBan, subject, Scope::Global, actor, reason).await;
        let fan_out = fan_out(chats, |chat_id| client.ban_member(chat_id, subject)).await;

        info!(
            "🌐 Ban global de {}: {} chats ok, {} fallidos",
            subject, fan_out.succeeded, fan_out.failed
        );
        GlobalBanReport { outcome, fan_out }
    }

    pub async fn global_unban(
        &self,
        subject: u64,
        actor: u64,
        chats: &[i64],
        client: &dyn ChatClient,
    ) -> GlobalUnbanReport {
        let outcome = self.revoke(Relation::GlobalBan, subject, Scope::Global, actor).await;
        if outcome == RevokeOutcome::NotFound {
            return GlobalUnbanReport { outcome, fan_out: None };
        }

        let fan_out = fan_out(chats, |chat_id| client.unban_member(chat_id, subject)).await;
        info!(
            "🌐 Unban global de {}: {} chats ok, {} fallidos",
            subject, fan_out.succeeded, fan_out.failed
        );
        GlobalUnbanReport { outcome, fan_out: Some(fan_out) }
    }

    pub fn is_globally_banned(&self, subject: u64) -> bool {
        self.is_active(Relation::GlobalBan, subject, Scope::Global)
    }

    pub fn global_ban_record(&self, subject: u64) -> Option<ModerationRecord> {
        self.latest_active(Relation::GlobalBan, subject, Scope::Global)
    }

    pub fn active_global_bans(&self) -> Vec<ModerationRecord> {
        self.tables
            .read()
            .global_bans
            .iter()
            .filter(|r| r.is_active())
            .cloned()
            .collect()
    }

    /// Every record about a subject, across all tables, oldest first.
    pub fn history(&self, subject: u64) -> Vec<ModerationRecord> {
        let tables = self.tables.read();
        let mut records: Vec<ModerationRecord> = [&tables.bans, &tables.mutes, &tables.global_bans]
            .into_iter()
            .flatten()
            .filter(|r| r.subject == subject)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    pub fn is_active(&self, relation: Relation, subject: u64, scope: Scope) -> bool {
        self.tables
            .read()
            .table(relation)
            .iter()
            .any(|r| r.subject == subject && r.scope == scope && r.is_active())
    }

    fn latest_active(&self, relation: Relation, subject: u64, scope: Scope) -> Option<ModerationRecord> {
        self.tables
            .read()
            .table(relation)
            .iter()
            .rev()
            .find(|r| r.subject == subject && r.scope == scope && r.is_active())
            .cloned()
    }

    /// Refreshes the active record or inserts a new one.
    pub async fn apply(
        &self,
        relation: Relation,
        subject: u64,
        scope: Scope,
        actor: u64,
        reason: Option<String>,
    ) -> ApplyOutcome {
        let outcome = {
            let mut tables = self.tables.write();
            let existing = tables
                .table_mut(relation)
                .iter_mut()
                .rev()
                .find(|r| r.subject == subject && r.scope == scope && r.is_active());

            match existing {
                Some(record) => {
                    record.reason = reason;
                    ApplyOutcome::Updated(record.clone())
                }
                None => {
                    let record = ModerationRecord {
                        id: tables.next_id(),
                        subject,
                        scope,
                        actor,
                        reason,
                        created_at: Utc::now(),
                        revoked_by: None,
                        revoked_at: None,
                        is_kick: false,
                    };
                    tables.table_mut(relation).push(record.clone());
                    ApplyOutcome::Created(record)
                }
            }
        };

        match &outcome {
            ApplyOutcome::Created(r) => info!("🛡️ {:?} #{} sobre {} en {:?}", relation, r.id, subject, scope),
            ApplyOutcome::Updated(r) => debug!("🛡️ {:?} #{} actualizado para {}", relation, r.id, subject),
        }
        self.persist().await;
        outcome
    }

    /// Marks the active record as revoked; `NotFound` when none is active.
    pub async fn revoke(&self, relation: Relation, subject: u64, scope: Scope, actor: u64) -> RevokeOutcome {
        let outcome = {
            let mut tables = self.tables.write();
            let active = tables
                .table_mut(relation)
                .iter_mut()
                .filter(|r| r.subject == subject && r.scope == scope && r.is_active());

            let mut revoked = None;
            let now = Utc::now();
            for record in active {
                record.revoked_by = Some(actor);
                record.revoked_at = Some(now);
                revoked = Some(record.clone());
            }

            match revoked {
                Some(record) => RevokeOutcome::Revoked(record),
                None => RevokeOutcome::NotFound,
            }
        };

        if matches!(outcome, RevokeOutcome::Revoked(_)) {
            self.persist().await;
        }
        outcome
    }

    /// The in-memory change stands even if the write fails.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.tables.read().clone();
        if let Err(e) = self.storage.save(MODERATION_FILE, &snapshot).await {
            error!("💾 No se pudo guardar la moderación: {:#}", e);
        }
    }
}

/// Runs `op` for every chat concurrently and tallies the results.
pub async fn fan_out<F, Fut, E>(chats: &[i64], op: F) -> FanOutReport
where
    F: Fn(i64) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let results = join_all(chats.iter().map(|&chat_id| {
        let call = op(chat_id);
        async move { (chat_id, call.await) }
    }))
    .await;

    let mut report = FanOutReport::default();
    for (chat_id, result) in results {
        match result {
            Ok(()) => report.succeeded += 1,
            Err(e) => {
                warn!("⚠️ Falló la operación en el chat {}: {}", chat_id, e);
                report.failed += 1;
                report.failures.push((chat_id, e.to_string()));
            }
        }
    }
    report
}
