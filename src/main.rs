use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::{process::ExitCode, sync::Arc, time::Duration};
use teloxide::Bot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::filter::Directive;

mod ai;
mod audio;
mod bot;
mod cache;
mod config;
mod moderation;
mod notify;
mod sources;
mod stats;
mod storage;
mod supervisor;
mod ui;

use crate::ai::{auto_response::AutoResponder, openai::OpenAiClient, AiClient, ConversationService, ConversationSettings};
use crate::audio::player::PlaybackScheduler;
use crate::bot::{
    telegram::{TelegramClient, TelegramRuntime},
    ChatAnnouncer, SlayerBot,
};
use crate::cache::TrackCache;
use crate::config::Config;
use crate::moderation::{sudo::SudoRegistry, ModerationStore};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::sources::{youtube::YtDlpResolver, ResolverHandle};
use crate::stats::BotStatus;
use crate::storage::{ChatDirectory, JsonStorage, TrackLibrary};
use crate::supervisor::{RestartHandle, Supervisor, SupervisorExit};

const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

fn main() -> ExitCode {
    // Inicializar logging
    let filter = ["slayer_bot=debug", "teloxide=info", "reqwest=info"]
        .into_iter()
        .filter_map(|directive| directive.parse::<Directive>().ok())
        .fold(tracing_subscriber::EnvFilter::from_default_env(), |filter, directive| {
            filter.add_directive(directive)
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🗡️ Iniciando Slayer Bot v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Configuración inválida: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("❌ No se pudo crear el runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if std::env::args().any(|arg| arg == "--health-check") {
        return runtime.block_on(health_check(&config));
    }

    match runtime.block_on(run(config)) {
        Ok(SupervisorExit::Graceful) => {
            info!("👋 Slayer Bot detenido");
            ExitCode::SUCCESS
        }
        Ok(SupervisorExit::GaveUp) => ExitCode::FAILURE,
        Err(e) => {
            error!("❌ Error fatal al iniciar: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<SupervisorExit> {
    info!("{}", config.summary());
    let config = Arc::new(config);

    // Almacenamiento
    let storage = Arc::new(JsonStorage::new(config.data_dir.clone()).await?);
    let library = Arc::new(TrackLibrary::load(storage.clone()).await?);
    let chats = Arc::new(ChatDirectory::load(storage.clone()).await?);
    let moderation = Arc::new(ModerationStore::load(storage.clone()).await?);
    let sudo = Arc::new(SudoRegistry::load(storage.clone(), Some(config.owner_id), config.admin_ids.clone()).await?);
    info!("💾 {} chats conocidos, {} tracks en la biblioteca", chats.len(), library.len());

    let status = Arc::new(BotStatus::new());
    let client = Arc::new(TelegramClient::new(Bot::new(&config.telegram_token)));

    let scheduler = Arc::new(PlaybackScheduler::new(
        Arc::new(ChatAnnouncer::new(client.clone())),
        library.clone(),
        status.clone(),
        config.scheduler_config(),
    ));

    let cache = TrackCache::new(config.cache_size, Duration::from_secs(config.cache_ttl));
    let resolver = ResolverHandle::new(
        Arc::new(YtDlpResolver::new(config.ytdlp_path.clone(), config.resolver_concurrency)),
        cache,
        Duration::from_secs(config.resolver_timeout),
    );

    let ai_client: Option<Arc<dyn AiClient>> = match &config.openai_api_key {
        Some(key) => Some(Arc::new(
            OpenAiClient::new(
                key.clone(),
                config.openai_base_url.clone(),
                config.openai_model.clone(),
                config.ai_temperature,
                config.ai_max_tokens,
            )
            .context("cannot build the OpenAI client")?,
        )),
        None => None,
    };
    let conversation = Arc::new(ConversationService::new(
        ai_client,
        ConversationSettings {
            enabled: config.ai_enabled,
            max_history: config.ai_max_history,
            presence_probability: config.ai_presence_probability,
        },
        storage.clone(),
    ));
    let auto_responder = Arc::new(AutoResponder::load(
        config.auto_responses_file.as_deref(),
        config.auto_responses_enabled,
    )?);
    info!("🤖 AI: {}, auto respuestas: {} reglas", conversation.is_enabled(), auto_responder.rule_count());

    let state = Arc::new(SlayerBot {
        config: config.clone(),
        client: client.clone(),
        scheduler,
        resolver,
        moderation,
        sudo,
        stats: status.clone(),
        library,
        chats,
        conversation,
        auto_responder,
        bot_username: RwLock::new(None),
    });

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };

    let shutdown = CancellationToken::new();
    let supervisor = Supervisor::new(
        Arc::new(TelegramRuntime::new(client, state.clone(), status.clone())),
        status,
        notifier,
        config.supervisor_config(),
        shutdown.clone(),
    )
    .with_status_file(config.data_dir.join("status.json"));

    spawn_signal_listener(shutdown.clone(), supervisor.restart_handle());
    spawn_cache_cleanup(state, shutdown.clone());

    info!("🚀 Supervisor iniciado");
    let exit = supervisor.run().await;
    shutdown.cancel();
    Ok(exit)
}

/// Ctrl+C / SIGTERM apagan; SIGHUP reinicia el bot sin contar un crash.
fn spawn_signal_listener(shutdown: CancellationToken, restart: RestartHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut term, mut hup) = match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
                (Ok(term), Ok(hup)) => (term, hup),
                _ => {
                    warn!("⚠️ No se pudieron registrar señales Unix, sólo Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.cancel();
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = term.recv() => break,
                    _ = hup.recv() => restart.restart(),
                    _ = shutdown.cancelled() => return,
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = restart;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = shutdown.cancelled() => return,
            }
        }

        info!("⚠️ Señal de shutdown recibida, cerrando...");
        shutdown.cancel();
    });
}

fn spawn_cache_cleanup(state: Arc<SlayerBot>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CACHE_CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => state.resolver.cache().cleanup_old_entries(),
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

async fn health_check(config: &Config) -> ExitCode {
    let resolver = YtDlpResolver::new(config.ytdlp_path.clone(), 1);
    match resolver.version().await {
        Ok(version) => {
            info!("✅ yt-dlp {}", version);
            println!("OK");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("❌ yt-dlp no disponible: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
