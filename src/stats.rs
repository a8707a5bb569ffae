//! Process-wide status and counters.
//!
//! Every handler bumps a counter here and the supervisor polls the
//! `running` flag to detect a dead runtime.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::{debug, warn};

/// Nombres de contadores conocidos
pub mod counters {
    pub const COMMANDS_PROCESSED: &str = "commands_processed";
    pub const MESSAGES_PROCESSED: &str = "messages_processed";
    pub const SONGS_PLAYED: &str = "songs_played";
    pub const PLAYBACK_ERRORS: &str = "playback_errors";
    pub const AI_CONVERSATIONS: &str = "ai_conversations";
    pub const AUTO_RESPONSES: &str = "auto_responses";
    pub const USERS_BANNED: &str = "users_banned";
    pub const USERS_KICKED: &str = "users_kicked";
    pub const USERS_MUTED: &str = "users_muted";
    pub const GLOBAL_BANS: &str = "global_bans";
    pub const GLOBAL_BAN_ENFORCEMENTS: &str = "global_ban_enforcements";
}

#[derive(Debug)]
pub struct BotStatus {
    running: AtomicBool,
    start_time: RwLock<DateTime<Utc>>,
    last_error: RwLock<Option<String>>,
    counters: DashMap<String, u64>,
}

/// Point-in-time copy of [`BotStatus`], serialisable for the status file.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusSnapshot {
    pub running: bool,
    pub start_time: DateTime<Utc>,
    pub uptime_secs: u64,
    pub last_error: Option<String>,
    pub counters: BTreeMap<String, u64>,
}

impl StatusSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

impl BotStatus {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            start_time: RwLock::new(Utc::now()),
            last_error: RwLock::new(None),
            counters: DashMap::new(),
        }
    }

    pub fn increment(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, amount: u64) {
        // entry() bloquea el shard, el incremento es atómico
        *self.counters.entry(name.to_string()).or_insert(0) += amount;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn mark_running(&self) {
        self.running.store(true, Ordering::SeqCst);
        debug!("Status: running");
    }

    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn mark_failed(&self, error: impl Into<String>) {
        let error = error.into();
        warn!("⚠️ Runtime marked as failed: {}", error);
        *self.last_error.write() = Some(error);
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Clears everything for a fresh runtime start.
    pub fn reset(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.start_time.write() = Utc::now();
        *self.last_error.write() = None;
        self.counters.clear();
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let start_time = *self.start_time.read();
        let uptime_secs = (Utc::now() - start_time).num_seconds().max(0) as u64;

        StatusSnapshot {
            running: self.is_running(),
            start_time,
            uptime_secs,
            last_error: self.last_error(),
            counters: self
                .counters
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }
}

impl Default for BotStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let status = Arc::new(BotStatus::new());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let status = status.clone();
                tokio::spawn(async move {
                    for _ in 0..1000 {
                        status.increment(counters::COMMANDS_PROCESSED);
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(status.get(counters::COMMANDS_PROCESSED), 8000);
    }

    #[test]
    fn failure_clears_running_and_keeps_the_error() {
        let status = BotStatus::new();
        status.mark_running();
        assert!(status.is_running());

        status.mark_failed("dispatcher stopped");
        let snapshot = status.snapshot();
        assert!(!snapshot.running);
        assert_eq!(snapshot.last_error.as_deref(), Some("dispatcher stopped"));
    }

    #[test]
    fn reset_wipes_counters_and_error() {
        let status = BotStatus::new();
        status.increment(counters::SONGS_PLAYED);
        status.mark_failed("boom");

        status.reset();

        let snapshot = status.snapshot();
        assert_eq!(snapshot.counter(counters::SONGS_PLAYED), 0);
        assert!(snapshot.last_error.is_none());
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let status = BotStatus::new();
        status.add(counters::GLOBAL_BANS, 3);

        let json = serde_json::to_value(status.snapshot()).unwrap();
        assert_eq!(json["counters"]["global_bans"], 3);
        assert_eq!(json["running"], false);
    }
}
