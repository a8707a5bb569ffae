//! # Supervisor
//!
//! Outer restart loop around the bot runtime.
//!
//! The runtime reports liveness through [`BotStatus`]; the supervisor polls
//! it, restarts on crash with exponential backoff, cools down after a burst
//! of rapid crashes and gives up after a fixed number of attempts. Every
//! wait point also watches the shutdown token.
//!
//! ```text
//! Starting -> Running -> CrashDetected -> [Cooldown] -> Starting
//!                     \-> GracefulStop                \-> Terminated
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    notify::{NotificationKind, Notifier},
    stats::BotStatus,
};

const COOLDOWN_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_restart_attempts: u32,
    pub rapid_crash_window: Duration,
    pub max_rapid_crashes: u32,
    pub cooldown: Duration,
    pub backoff_base: u64,
    pub backoff_cap: Duration,
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: 10,
            rapid_crash_window: Duration::from_secs(60),
            max_rapid_crashes: 5,
            cooldown: Duration::from_secs(300),
            backoff_base: 2,
            backoff_cap: Duration::from_secs(60),
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Lo que el supervisor arranca y detiene
#[async_trait]
pub trait BotRuntime: Send + Sync {
    /// Starts processing events and marks the status as running.
    async fn start(&self) -> Result<()>;

    async fn stop(&self);
}

/// Crash bookkeeping for the life of the supervisor.
#[derive(Debug)]
pub struct CrashTracker {
    restart_count: u32,
    last_crash: Option<Instant>,
    rapid_crashes: u32,
    window: Duration,
    threshold: u32,
}

impl CrashTracker {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self { restart_count: 0, last_crash: None, rapid_crashes: 0, window, threshold }
    }

    /// Records a crash; returns whether it came within the rapid window.
    pub fn record_crash(&mut self, now: Instant) -> bool {
        self.restart_count += 1;

        let rapid = self
            .last_crash
            .map(|last| now.duration_since(last) < self.window)
            .unwrap_or(false);

        if rapid {
            self.rapid_crashes += 1;
        } else {
            self.rapid_crashes = 1;
        }
        self.last_crash = Some(now);
        rapid
    }

    pub fn needs_cooldown(&self) -> bool {
        self.rapid_crashes >= self.threshold
    }

    pub fn reset_rapid(&mut self) {
        self.rapid_crashes = 0;
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn rapid_crashes(&self) -> u32 {
        self.rapid_crashes
    }
}

/// `min(cap, base^attempts)` seconds.
pub fn backoff_delay(base: u64, attempts: u32, cap: Duration) -> Duration {
    base.checked_pow(attempts)
        .map(Duration::from_secs)
        .unwrap_or(cap)
        .min(cap)
}

/// Asks the supervisor to restart the runtime; not counted as a crash.
#[derive(Clone)]
pub struct RestartHandle {
    notify: Arc<Notify>,
}

impl RestartHandle {
    pub fn restart(&self) {
        info!("🔄 Reinicio solicitado");
        self.notify.notify_one();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Graceful,
    /// Restart attempts exhausted.
    GaveUp,
}

enum Watch {
    Shutdown,
    Restart,
    Crashed(String),
}

pub struct Supervisor {
    runtime: Arc<dyn BotRuntime>,
    status: Arc<BotStatus>,
    notifier: Arc<dyn Notifier>,
    config: SupervisorConfig,
    shutdown: CancellationToken,
    restart: Arc<Notify>,
    status_file: Option<PathBuf>,
}

impl Supervisor {
    pub fn new(
        runtime: Arc<dyn BotRuntime>,
        status: Arc<BotStatus>,
        notifier: Arc<dyn Notifier>,
        config: SupervisorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            status,
            notifier,
            config,
            shutdown,
            restart: Arc::new(Notify::new()),
            status_file: None,
        }
    }

    /// Writes a JSON status snapshot to `path` on every health poll.
    pub fn with_status_file(mut self, path: PathBuf) -> Self {
        self.status_file = Some(path);
        self
    }

    pub fn restart_handle(&self) -> RestartHandle {
        RestartHandle { notify: self.restart.clone() }
    }

    pub async fn run(&self) -> SupervisorExit {
        let mut tracker = CrashTracker::new(self.config.rapid_crash_window, self.config.max_rapid_crashes);
        let mut started_once = false;

        loop {
            if self.shutdown.is_cancelled() {
                return SupervisorExit::Graceful;
            }

            if tracker.needs_cooldown() {
                let detail = format!(
                    "{} rapid crashes, pausing restarts for {}",
                    tracker.rapid_crashes(),
                    humantime::format_duration(self.config.cooldown)
                );
                warn!("🧊 {}", detail);
                self.notifier.notify(NotificationKind::Cooldown, detail).await;

                if !self.cooldown().await {
                    info!("🛑 Apagado durante el cooldown");
                    return SupervisorExit::Graceful;
                }
                tracker.reset_rapid();
            }

            self.status.reset();
            let reason = match self.runtime.start().await {
                Err(e) => format!("start failed: {:#}", e),
                Ok(()) => {
                    let kind = if started_once { NotificationKind::Restarted } else { NotificationKind::Started };
                    started_once = true;
                    self.notifier
                        .notify(kind, format!("restart attempts so far: {}", tracker.restart_count()))
                        .await;

                    match self.watch().await {
                        Watch::Shutdown => {
                            info!("🛑 Señal de apagado, deteniendo el bot...");
                            self.runtime.stop().await;
                            self.status.mark_stopped();
                            self.write_status().await;
                            return SupervisorExit::Graceful;
                        }
                        Watch::Restart => {
                            self.runtime.stop().await;
                            continue;
                        }
                        Watch::Crashed(reason) => {
                            self.runtime.stop().await;
                            reason
                        }
                    }
                }
            };

            let rapid = tracker.record_crash(Instant::now());
            let attempts = tracker.restart_count();
            error!(
                "💥 Crash #{} (rápido: {}, seguidos: {}): {}",
                attempts,
                rapid,
                tracker.rapid_crashes(),
                reason
            );
            self.notifier
                .notify(
                    NotificationKind::Crash,
                    format!("{} (attempt {}/{})", reason, attempts, self.config.max_restart_attempts),
                )
                .await;

            if attempts >= self.config.max_restart_attempts {
                error!("⛔ Máximo de reinicios alcanzado ({})", attempts);
                self.notifier
                    .notify(NotificationKind::Failed, format!("gave up after {} restarts: {}", attempts, reason))
                    .await;
                return SupervisorExit::GaveUp;
            }

            let delay = backoff_delay(self.config.backoff_base, attempts, self.config.backoff_cap);
            info!("⏳ Reiniciando en {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => return SupervisorExit::Graceful,
            }
        }
    }

    /// Polls liveness until a crash, a restart request or shutdown.
    async fn watch(&self) -> Watch {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Watch::Shutdown,
                _ = self.restart.notified() => return Watch::Restart,
                _ = ticker.tick() => {
                    self.write_status().await;
                    if !self.status.is_running() {
                        let reason = self
                            .status
                            .last_error()
                            .unwrap_or_else(|| "runtime stopped".to_string());
                        return Watch::Crashed(reason);
                    }
                    debug!("💓 Bot vivo");
                }
            }
        }
    }

    /// Returns false when shutdown interrupted the cooldown.
    async fn cooldown(&self) -> bool {
        let mut remaining = self.config.cooldown;
        while !remaining.is_zero() {
            let step = remaining.min(COOLDOWN_TICK);
            tokio::select! {
                _ = tokio::time::sleep(step) => remaining -= step,
                _ = self.shutdown.cancelled() => return false,
            }
        }
        true
    }

    async fn write_status(&self) {
        let Some(path) = &self.status_file else {
            return;
        };
        let result = match serde_json::to_vec_pretty(&self.status.snapshot()) {
            Ok(bytes) => tokio::fs::write(path, bytes).await.map_err(anyhow::Error::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("💾 No se pudo escribir {}: {:#}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MockNotifier;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Runtime that can fail to start or crash a while after starting.
    struct FakeRuntime {
        status: Arc<BotStatus>,
        fail_start: bool,
        crash_after: Option<Duration>,
        starts: AtomicU32,
        stops: AtomicU32,
    }

    impl FakeRuntime {
        fn new(status: Arc<BotStatus>, fail_start: bool, crash_after: Option<Duration>) -> Arc<Self> {
            Arc::new(Self { status, fail_start, crash_after, starts: AtomicU32::new(0), stops: AtomicU32::new(0) })
        }

        fn starts(&self) -> u32 {
            self.starts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BotRuntime for FakeRuntime {
        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                anyhow::bail!("network unreachable");
            }
            self.status.mark_running();
            if let Some(after) = self.crash_after {
                let status = self.status.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    status.mark_failed("boom");
                });
            }
            Ok(())
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        kinds: Mutex<Vec<NotificationKind>>,
    }

    impl RecordingNotifier {
        fn kinds(&self) -> Vec<NotificationKind> {
            self.kinds.lock().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, kind: NotificationKind, _detail: String) {
            self.kinds.lock().push(kind);
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig { poll_interval: Duration::from_secs(1), ..SupervisorConfig::default() }
    }

    #[test]
    fn fifth_rapid_crash_asks_for_cooldown() {
        let start = Instant::now();
        let mut tracker = CrashTracker::new(Duration::from_secs(60), 5);

        for (i, at) in [0u64, 5, 10, 15].into_iter().enumerate() {
            let rapid = tracker.record_crash(start + Duration::from_secs(at));
            assert_eq!(rapid, i > 0);
            assert!(!tracker.needs_cooldown());
        }
        tracker.record_crash(start + Duration::from_secs(20));
        assert!(tracker.needs_cooldown());
        assert_eq!(tracker.restart_count(), 5);

        tracker.reset_rapid();
        assert!(!tracker.needs_cooldown());
    }

    #[test]
    fn slow_crashes_reset_the_rapid_streak() {
        let start = Instant::now();
        let mut tracker = CrashTracker::new(Duration::from_secs(60), 3);
        tracker.record_crash(start);
        tracker.record_crash(start + Duration::from_secs(10));
        assert_eq!(tracker.rapid_crashes(), 2);

        assert!(!tracker.record_crash(start + Duration::from_secs(500)));
        assert_eq!(tracker.rapid_crashes(), 1);
        assert_eq!(tracker.restart_count(), 3);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cap = Duration::from_secs(60);
        assert_eq!(backoff_delay(2, 1, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, 5, cap), Duration::from_secs(32));
        assert_eq!(backoff_delay(2, 6, cap), cap);
        assert_eq!(backoff_delay(2, 200, cap), cap);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_cooldown_exits_quickly() {
        let status = Arc::new(BotStatus::new());
        let runtime = FakeRuntime::new(status.clone(), false, Some(Duration::from_secs(1)));
        let notifier = Arc::new(RecordingNotifier::default());
        let shutdown = CancellationToken::new();

        let supervisor = Supervisor::new(runtime.clone(), status, notifier.clone(), config(), shutdown.clone());
        let handle = tokio::spawn(async move { supervisor.run().await });

        while !notifier.kinds().contains(&NotificationKind::Cooldown) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(runtime.starts(), 5);

        let asked = Instant::now();
        shutdown.cancel();
        let exit = handle.await.unwrap();

        assert_eq!(exit, SupervisorExit::Graceful);
        assert!(asked.elapsed() < Duration::from_secs(1));
        assert_eq!(runtime.starts(), 5);
        assert_eq!(notifier.kinds()[0], NotificationKind::Started);
        assert_eq!(notifier.kinds()[2], NotificationKind::Restarted);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let status = Arc::new(BotStatus::new());
        let runtime = FakeRuntime::new(status.clone(), true, None);
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|kind, _| *kind == NotificationKind::Failed)
            .times(1)
            .returning(|_, _| ());
        notifier
            .expect_notify()
            .withf(|kind, _| *kind != NotificationKind::Failed)
            .returning(|_, _| ());

        let config = SupervisorConfig { max_restart_attempts: 3, max_rapid_crashes: 100, ..config() };
        let supervisor = Supervisor::new(runtime.clone(), status, Arc::new(notifier), config, CancellationToken::new());

        assert_eq!(supervisor.run().await, SupervisorExit::GaveUp);
        assert_eq!(runtime.starts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_requests_are_not_crashes() {
        let status = Arc::new(BotStatus::new());
        let runtime = FakeRuntime::new(status.clone(), false, None);
        let notifier = Arc::new(RecordingNotifier::default());
        let shutdown = CancellationToken::new();

        let supervisor = Supervisor::new(runtime.clone(), status, notifier.clone(), config(), shutdown.clone());
        let restart = supervisor.restart_handle();
        let handle = tokio::spawn(async move { supervisor.run().await });

        tokio::time::sleep(Duration::from_secs(5)).await;
        restart.restart();
        while runtime.starts() < 2 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), SupervisorExit::Graceful);
        assert_eq!(notifier.kinds(), vec![NotificationKind::Started, NotificationKind::Restarted]);
        assert_eq!(runtime.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn status_file_tracks_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let status = Arc::new(BotStatus::new());
        let runtime = FakeRuntime::new(status.clone(), false, None);
        let shutdown = CancellationToken::new();

        let supervisor = Supervisor::new(runtime, status, Arc::new(RecordingNotifier::default()), config(), shutdown.clone())
            .with_status_file(path.clone());
        let handle = tokio::spawn(async move { supervisor.run().await });

        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["running"], false);
    }
}
