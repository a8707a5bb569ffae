use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::{audio::player::SchedulerConfig, supervisor::SupervisorConfig};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Telegram
    pub telegram_token: String,
    pub owner_id: u64,
    pub admin_ids: Vec<u64>,

    // Reproducción
    pub max_queue_size: usize,
    pub default_track_duration: u64, // En segundos
    pub playback_retry_delay: u64,   // En segundos
    pub playback_max_consecutive_failures: u32,
    pub search_results_limit: usize,

    // Resolver
    pub resolver_timeout: u64,
    pub resolver_concurrency: usize,
    pub ytdlp_path: String,

    // Rendimiento
    pub cache_size: usize,
    pub cache_ttl: u64,
    pub worker_threads: usize,

    // Paths
    pub data_dir: PathBuf,

    // AI
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub ai_enabled: bool,
    pub ai_temperature: f32,
    pub ai_max_tokens: u32,
    pub ai_presence_probability: f64,
    pub ai_max_history: usize,

    // Auto respuestas
    pub auto_responses_enabled: bool,
    pub auto_responses_file: Option<PathBuf>,

    // Notificaciones
    pub notify_webhook_url: Option<String>,

    // Supervisor
    pub max_restart_attempts: u32,
    pub rapid_crash_window: u64,
    pub max_rapid_crashes: u32,
    pub restart_cooldown: u64,
    pub backoff_base: u64,
    pub backoff_cap: u64,
    pub health_poll_interval: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("cannot create data dir {}", config.data_dir.display()))?;

        Ok(config)
    }

    /// Builds the configuration from any key/value source.
    ///
    /// `load()` feeds this with the process environment; tests feed it a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let telegram_token = get("TELEGRAM_BOT_TOKEN").context("TELEGRAM_BOT_TOKEN is required")?;
        let owner_id = get("OWNER_ID")
            .context("OWNER_ID is required")?
            .trim()
            .parse()
            .context("OWNER_ID must be a numeric Telegram user id")?;

        let admin_ids = match get("ADMIN_TELEGRAM_IDS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<u64>())
                .collect::<Result<Vec<_>, _>>()
                .context("ADMIN_TELEGRAM_IDS must be a comma separated list of ids")?,
            None => Vec::new(),
        };

        let openai_api_key = get("OPENAI_API_KEY");
        let ai_requested: bool = parse_or(&get, "AI_ENABLED", "true")?;

        let config = Self {
            telegram_token,
            owner_id,
            admin_ids,

            max_queue_size: parse_or(&get, "MAX_QUEUE_SIZE", "100")?,
            default_track_duration: parse_or(&get, "DEFAULT_TRACK_DURATION", "180")?,
            playback_retry_delay: parse_or(&get, "PLAYBACK_RETRY_DELAY_SECS", "2")?,
            playback_max_consecutive_failures: parse_or(&get, "PLAYBACK_MAX_CONSECUTIVE_FAILURES", "0")?,
            search_results_limit: parse_or(&get, "SEARCH_RESULTS_LIMIT", "5")?,

            resolver_timeout: parse_or(&get, "RESOLVER_TIMEOUT_SECS", "30")?,
            resolver_concurrency: parse_or(&get, "RESOLVER_CONCURRENCY", "3")?,
            ytdlp_path: get("YTDLP_PATH").unwrap_or_else(|| "yt-dlp".to_string()),

            cache_size: parse_or(&get, "CACHE_SIZE", "200")?,
            cache_ttl: parse_or(&get, "CACHE_TTL_SECS", "3600")?,
            worker_threads: match get("WORKER_THREADS") {
                Some(val) => val.trim().parse().context("WORKER_THREADS must be a number")?,
                None => num_cpus::get(),
            },

            data_dir: get("DATA_DIR").unwrap_or_else(|| "./data".to_string()).into(),

            // Sin API key la IA queda desactivada aunque se pida
            ai_enabled: ai_requested && openai_api_key.is_some(),
            openai_api_key,
            openai_model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            openai_base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            ai_temperature: parse_or(&get, "AI_RESPONSE_TEMPERATURE", "0.7")?,
            ai_max_tokens: parse_or(&get, "AI_MAX_TOKENS", "1000")?,
            ai_presence_probability: parse_or(&get, "AI_PRESENCE_PROBABILITY", "0.4")?,
            ai_max_history: parse_or(&get, "AI_MAX_HISTORY", "10")?,

            auto_responses_enabled: parse_or(&get, "AUTO_RESPONSES_ENABLED", "true")?,
            auto_responses_file: get("AUTO_RESPONSES_FILE").map(PathBuf::from),

            notify_webhook_url: get("NOTIFY_WEBHOOK_URL"),

            max_restart_attempts: parse_or(&get, "MAX_RESTART_ATTEMPTS", "10")?,
            rapid_crash_window: parse_or(&get, "RAPID_CRASH_WINDOW_SECS", "60")?,
            max_rapid_crashes: parse_or(&get, "MAX_RAPID_CRASHES", "5")?,
            restart_cooldown: parse_or(&get, "RESTART_COOLDOWN_SECS", "300")?,
            backoff_base: parse_or(&get, "BACKOFF_BASE", "2")?,
            backoff_cap: parse_or(&get, "BACKOFF_CAP_SECS", "60")?,
            health_poll_interval: parse_or(&get, "HEALTH_POLL_INTERVAL_SECS", "60")?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// Catches the mistakes that would otherwise surface much later as a
    /// wedged queue or a supervisor that never restarts anything.
    pub fn validate(&self) -> Result<()> {
        if self.owner_id == 0 {
            anyhow::bail!("OWNER_ID must be a real Telegram user id");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.default_track_duration == 0 {
            anyhow::bail!("Default track duration must be greater than 0");
        }

        if self.search_results_limit == 0 || self.search_results_limit > 10 {
            anyhow::bail!(
                "Search results limit must be between 1 and 10, got: {}",
                self.search_results_limit
            );
        }

        if self.resolver_concurrency == 0 || self.resolver_timeout == 0 {
            anyhow::bail!("Resolver concurrency and timeout must be greater than 0");
        }

        if self.cache_size == 0 {
            anyhow::bail!("Cache size must be greater than 0");
        }

        if self.worker_threads == 0 {
            anyhow::bail!("Worker threads must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.ai_presence_probability) {
            anyhow::bail!(
                "AI presence probability must be between 0.0 and 1.0, got: {}",
                self.ai_presence_probability
            );
        }

        if !(0.0..=2.0).contains(&self.ai_temperature) {
            anyhow::bail!("AI temperature must be between 0.0 and 2.0, got: {}", self.ai_temperature);
        }

        if self.backoff_base < 2 {
            anyhow::bail!("Backoff base must be at least 2, got: {}", self.backoff_base);
        }

        if self.max_restart_attempts == 0 || self.max_rapid_crashes == 0 {
            anyhow::bail!("Restart attempts and rapid crash threshold must be greater than 0");
        }

        if self.health_poll_interval == 0 {
            anyhow::bail!("Health poll interval must be greater than 0");
        }

        if let Some(url) = &self.notify_webhook_url {
            url::Url::parse(url).context("NOTIFY_WEBHOOK_URL is not a valid URL")?;
        }

        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            default_duration: Duration::from_secs(self.default_track_duration),
            retry_delay: Duration::from_secs(self.playback_retry_delay),
            max_consecutive_failures: self.playback_max_consecutive_failures,
            max_queue_size: self.max_queue_size,
            ..SchedulerConfig::default()
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_restart_attempts: self.max_restart_attempts,
            rapid_crash_window: Duration::from_secs(self.rapid_crash_window),
            max_rapid_crashes: self.max_rapid_crashes,
            cooldown: Duration::from_secs(self.restart_cooldown),
            backoff_base: self.backoff_base,
            backoff_cap: Duration::from_secs(self.backoff_cap),
            poll_interval: Duration::from_secs(self.health_poll_interval),
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Never includes the bot token or the API key.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Owner: {} ({} admins)\n  \
            Playback: {} queue, {}s default duration, {}s retry delay\n  \
            Resolver: {} ({} concurrent, {}s timeout)\n  \
            Cache: {} entries, {}s TTL\n  \
            AI: enabled={} model={} presence={}\n  \
            Supervisor: {} attempts, {} rapid crashes in {}s, {}s cooldown",
            self.owner_id,
            self.admin_ids.len(),
            self.max_queue_size,
            self.default_track_duration,
            self.playback_retry_delay,
            self.ytdlp_path,
            self.resolver_concurrency,
            self.resolver_timeout,
            self.cache_size,
            self.cache_ttl,
            self.ai_enabled,
            self.openai_model,
            self.ai_presence_probability,
            self.max_restart_attempts,
            self.max_rapid_crashes,
            self.rapid_crash_window,
            self.restart_cooldown,
        )
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .unwrap_or_else(|| default.to_string())
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {}", key))
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Telegram (sin defaults, deben venir del entorno)
            telegram_token: String::new(),
            owner_id: 0,
            admin_ids: Vec::new(),

            max_queue_size: 100,
            default_track_duration: 180,
            playback_retry_delay: 2,
            playback_max_consecutive_failures: 0,
            search_results_limit: 5,

            resolver_timeout: 30,
            resolver_concurrency: 3,
            ytdlp_path: "yt-dlp".to_string(),

            cache_size: 200,
            cache_ttl: 3600,
            worker_threads: num_cpus::get(),

            data_dir: "./data".into(),

            openai_api_key: None,
            openai_model: "gpt-4o".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            ai_enabled: false,
            ai_temperature: 0.7,
            ai_max_tokens: 1000,
            ai_presence_probability: 0.4,
            ai_max_history: 10,

            auto_responses_enabled: true,
            auto_responses_file: None,

            notify_webhook_url: None,

            max_restart_attempts: 10,
            rapid_crash_window: 60,
            max_rapid_crashes: 5,
            restart_cooldown: 300,
            backoff_base: 2,
            backoff_cap: 60,
            health_poll_interval: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_required_values_are_set() {
        let config =
            Config::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", "123:abc"), ("OWNER_ID", "42")]))
                .unwrap();

        assert_eq!(config.owner_id, 42);
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.default_track_duration, 180);
        assert_eq!(config.openai_model, "gpt-4o");
        assert_eq!(config.max_rapid_crashes, 5);
        assert_eq!(config.restart_cooldown, 300);
        assert!(config.admin_ids.is_empty());
        // Sin OPENAI_API_KEY no hay IA
        assert!(!config.ai_enabled);
    }

    #[test]
    fn missing_token_is_an_error() {
        let err = Config::from_lookup(lookup(&[("OWNER_ID", "42")])).unwrap_err();
        assert!(err.to_string().contains("TELEGRAM_BOT_TOKEN"));
    }

    #[test]
    fn admin_ids_are_parsed_from_a_comma_list() {
        let config = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("OWNER_ID", "1"),
            ("ADMIN_TELEGRAM_IDS", "10, 20,30,"),
            ("OPENAI_API_KEY", "sk-test"),
        ]))
        .unwrap();

        assert_eq!(config.admin_ids, vec![10, 20, 30]);
        assert!(config.ai_enabled);
    }

    #[test]
    fn invalid_numbers_name_the_offending_key() {
        let err = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("OWNER_ID", "1"),
            ("MAX_QUEUE_SIZE", "lots"),
        ]))
        .unwrap_err();

        assert!(format!("{:#}", err).contains("MAX_QUEUE_SIZE"));
    }

    #[test]
    fn out_of_range_probability_fails_validation() {
        let err = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("OWNER_ID", "1"),
            ("AI_PRESENCE_PROBABILITY", "1.5"),
        ]))
        .unwrap_err();

        assert!(err.to_string().contains("presence probability"));
    }

    #[test]
    fn summary_never_leaks_the_token() {
        let config = Config {
            telegram_token: "secret-token".to_string(),
            owner_id: 7,
            ..Config::default()
        };
        assert!(!config.summary().contains("secret-token"));
    }
}
