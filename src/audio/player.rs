use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    audio::queue::{ChatSession, PlaybackError, PlaybackState, QueueSnapshot},
    sources::Track,
    stats::{counters, BotStatus},
};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub default_duration: Duration,
    pub retry_delay: Duration,
    /// 0 keeps retrying forever.
    pub max_consecutive_failures: u32,
    pub max_queue_size: usize,
    /// Upper bound for each chat announcement.
    pub announce_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_duration: Duration::from_secs(180),
            retry_delay: Duration::from_secs(2),
            max_consecutive_failures: 0,
            max_queue_size: 100,
            announce_timeout: Duration::from_secs(10),
        }
    }
}

/// Mensajes que el loop de reproducción envía al chat
#[async_trait]
pub trait PlaybackAnnouncer: Send + Sync {
    async fn now_playing(&self, chat_id: i64, track: &Track) -> Result<()>;
    async fn queue_empty(&self, chat_id: i64) -> Result<()>;
    async fn playback_error(&self, chat_id: i64, error: &str) -> Result<()>;
}

/// Durable play-count side effect; failures never stop playback.
#[async_trait]
pub trait PlayHistory: Send + Sync {
    async fn record_play(&self, track: &Track) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The chat was idle and a playback loop was started.
    Started,
    Queued { position: usize },
    /// Added behind a paused chat; playback waits for `/resume`.
    QueuedWhilePaused { position: usize },
}

enum Step {
    Play(Track, CancellationToken),
    Retry(CancellationToken),
    Done,
}

/// Drives every chat's queue. Each chat gets at most one loop task.
pub struct PlaybackScheduler {
    sessions: DashMap<i64, Arc<Mutex<ChatSession>>>,
    announcer: Arc<dyn PlaybackAnnouncer>,
    history: Arc<dyn PlayHistory>,
    stats: Arc<BotStatus>,
    config: SchedulerConfig,
}

impl PlaybackScheduler {
    pub fn new(
        announcer: Arc<dyn PlaybackAnnouncer>,
        history: Arc<dyn PlayHistory>,
        stats: Arc<BotStatus>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            announcer,
            history,
            stats,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Agrega un track; si el chat estaba inactivo arranca el loop
    pub async fn enqueue(self: &Arc<Self>, chat_id: i64, track: Track) -> Result<EnqueueOutcome, PlaybackError> {
        let session = self.session(chat_id);
        let mut s = session.lock().await;

        let state = s.state();
        let position = s.push(track, self.config.max_queue_size)?;

        match state {
            PlaybackState::Idle => {
                s.playing = true;
                s.consecutive_failures = 0;
                if let Some(generation) = s.claim_loop() {
                    self.spawn_loop(chat_id, session.clone(), generation);
                }
                Ok(EnqueueOutcome::Started)
            }
            PlaybackState::Paused => Ok(EnqueueOutcome::QueuedWhilePaused { position }),
            PlaybackState::Playing | PlaybackState::Draining => Ok(EnqueueOutcome::Queued { position }),
        }
    }

    /// Pausa la reproducción; el track actual se conserva
    pub async fn pause(&self, chat_id: i64) -> Result<Option<Track>, PlaybackError> {
        let session = self.existing(chat_id).ok_or(PlaybackError::NotPlaying)?;
        let mut s = session.lock().await;

        if s.state() != PlaybackState::Playing {
            return Err(PlaybackError::NotPlaying);
        }

        s.playing = false;
        s.interrupt();
        info!("⏸️ Reproducción pausada en {}", chat_id);
        Ok(s.current().cloned())
    }

    /// Reanuda desde el siguiente track de la cola
    pub async fn resume(self: &Arc<Self>, chat_id: i64) -> Result<(), PlaybackError> {
        let session = self.existing(chat_id).ok_or(PlaybackError::NothingToResume)?;
        let mut s = session.lock().await;

        match s.state() {
            PlaybackState::Paused => {}
            PlaybackState::Idle => return Err(PlaybackError::NothingToResume),
            PlaybackState::Playing | PlaybackState::Draining => return Err(PlaybackError::AlreadyPlaying),
        }

        s.playing = true;
        s.consecutive_failures = 0;
        // Si el loop pausado todavía no salió, seguirá él mismo
        if let Some(generation) = s.claim_loop() {
            self.spawn_loop(chat_id, session.clone(), generation);
        }
        info!("▶️ Reproducción reanudada en {}", chat_id);
        Ok(())
    }

    /// Abandons the current track; the loop moves straight to the next one.
    pub async fn skip(&self, chat_id: i64) -> Result<Option<Track>, PlaybackError> {
        let session = self.existing(chat_id).ok_or(PlaybackError::NotPlaying)?;
        let s = session.lock().await;

        if s.state() != PlaybackState::Playing {
            return Err(PlaybackError::NotPlaying);
        }

        s.interrupt();
        info!("⏭️ Track saltado en {}", chat_id);
        Ok(s.current().cloned())
    }

    /// Clears the queue and the current track; returns how many were dropped.
    pub async fn stop(&self, chat_id: i64) -> usize {
        let Some(session) = self.existing(chat_id) else {
            return 0;
        };
        let dropped = session.lock().await.reset();
        info!("⏹️ Reproducción detenida en {} ({} tracks descartados)", chat_id, dropped);
        dropped
    }

    pub async fn snapshot(&self, chat_id: i64) -> QueueSnapshot {
        match self.existing(chat_id) {
            Some(session) => session.lock().await.snapshot(),
            None => QueueSnapshot::idle(),
        }
    }

    pub async fn current(&self, chat_id: i64) -> Option<Track> {
        self.snapshot(chat_id).await.current
    }

    pub async fn state(&self, chat_id: i64) -> PlaybackState {
        self.snapshot(chat_id).await.state
    }

    /// Number of chats that are playing or paused.
    pub async fn active_chats(&self) -> usize {
        let sessions: Vec<Arc<Mutex<ChatSession>>> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();

        let mut active = 0;
        for session in sessions {
            if session.lock().await.state() != PlaybackState::Idle {
                active += 1;
            }
        }
        active
    }

    fn session(&self, chat_id: i64) -> Arc<Mutex<ChatSession>> {
        self.sessions
            .entry(chat_id)
            .or_insert_with(|| Arc::new(Mutex::new(ChatSession::new(chat_id))))
            .clone()
    }

    fn existing(&self, chat_id: i64) -> Option<Arc<Mutex<ChatSession>>> {
        self.sessions.get(&chat_id).map(|entry| entry.value().clone())
    }

    fn spawn_loop(self: &Arc<Self>, chat_id: i64, session: Arc<Mutex<ChatSession>>, generation: u64) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_loop(chat_id, session, generation).await;
        });
    }

    async fn run_loop(&self, chat_id: i64, session: Arc<Mutex<ChatSession>>, generation: u64) {
        debug!("🔁 Loop de reproducción iniciado para {} (generación {})", chat_id, generation);

        loop {
            let step = self.next_step(chat_id, &session, generation).await;

            match step {
                Step::Play(track, wake) => {
                    let duration = track.playback_duration(self.config.default_duration);
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {
                            debug!("✅ Terminó {} en {}", track.title, chat_id);
                        }
                        _ = wake.cancelled() => {
                            debug!("⏭️ {} interrumpido en {}", track.title, chat_id);
                        }
                    }
                }
                Step::Retry(wake) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                        _ = wake.cancelled() => {}
                    }
                }
                Step::Done => break,
            }
        }

        debug!("🔁 Loop de reproducción terminado para {} (generación {})", chat_id, generation);
    }

    /// One pass: validity checks and advance under the lock, then announce
    /// without it.
    ///
    /// The announcement is a network send, so the lock is released while it
    /// runs and the generation is checked again afterwards; a stop during
    /// the send ends this loop before anything else is announced.
    async fn next_step(&self, chat_id: i64, session: &Mutex<ChatSession>, generation: u64) -> Step {
        let (track, wake) = {
            let mut s = session.lock().await;

            if s.generation() != generation {
                return Step::Done;
            }

            if !s.playing {
                s.release_loop(generation);
                return Step::Done;
            }

            match s.advance() {
                Some(track) => (track, s.arm_wake()),
                None => {
                    s.playing = false;
                    s.release_loop(generation);
                    drop(s);
                    if let Err(e) = self.announce(self.announcer.queue_empty(chat_id)).await {
                        warn!("⚠️ No se pudo anunciar cola vacía en {}: {:#}", chat_id, e);
                    }
                    info!("📋 Cola vacía en {}", chat_id);
                    return Step::Done;
                }
            }
        };

        self.record_play(&track);
        let sent = self.announce(self.announcer.now_playing(chat_id, &track)).await;

        let mut s = session.lock().await;
        if s.generation() != generation {
            debug!("⏹️ {} detenido durante el anuncio de {}", chat_id, track.title);
            return Step::Done;
        }

        let e = match sent {
            Ok(()) => {
                s.consecutive_failures = 0;
                info!("🎵 Reproduciendo en {}: {}", chat_id, track.title);
                // Un pause/skip durante el anuncio ya canceló `wake`
                return Step::Play(track, wake);
            }
            Err(e) => e,
        };

        s.clear_current();
        s.consecutive_failures += 1;
        let failures = s.consecutive_failures;
        self.stats.increment(counters::PLAYBACK_ERRORS);
        warn!(
            "❌ Error reproduciendo {} en {} (fallo consecutivo #{}): {:#}",
            track.title, chat_id, failures, e
        );

        let limit = self.config.max_consecutive_failures;
        if limit > 0 && failures >= limit {
            s.playing = false;
            s.release_loop(generation);
            drop(s);
            error!("⛔ {} fallos seguidos en {}, reproducción pausada", failures, chat_id);
            let message = format!(
                "Playback paused after {} failed attempts. Use /resume to try again.",
                failures
            );
            self.report_error(chat_id, &message).await;
            return Step::Done;
        }

        let wake = s.arm_wake();
        drop(s);
        self.report_error(chat_id, &e.to_string()).await;
        Step::Retry(wake)
    }

    async fn report_error(&self, chat_id: i64, message: &str) {
        if let Err(e) = self.announce(self.announcer.playback_error(chat_id, message)).await {
            warn!("⚠️ No se pudo reportar el error en {}: {:#}", chat_id, e);
        }
    }

    /// Runs an announcement under `announce_timeout`.
    async fn announce(&self, send: impl Future<Output = Result<()>>) -> Result<()> {
        let limit = self.config.announce_timeout;
        match tokio::time::timeout(limit, send).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("announcement timed out after {:?}", limit)),
        }
    }

    fn record_play(&self, track: &Track) {
        self.stats.increment(counters::SONGS_PLAYED);

        let history = Arc::clone(&self.history);
        let track = track.clone();
        tokio::spawn(async move {
            if let Err(e) = history.record_play(&track).await {
                warn!("⚠️ No se pudo registrar la reproducción de {}: {:#}", track.title, e);
            }
        });
    }
}
