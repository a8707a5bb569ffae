pub mod youtube;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::TrackCache;

pub use youtube::YtDlpResolver;

/// Representa un track resuelto
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    /// Seconds, 0 when the provider did not report it.
    pub duration: u64,
    pub thumbnail: Option<String>,
    pub url: String,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            duration: 0,
            thumbnail: None,
            url: url.into(),
        }
    }

    pub fn with_duration(mut self, seconds: u64) -> Self {
        self.duration = seconds;
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    /// How long the simulated playback lasts.
    pub fn playback_duration(&self, default: Duration) -> Duration {
        if self.duration == 0 {
            default
        } else {
            Duration::from_secs(self.duration)
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("no matching tracks")]
    NotFound,
    #[error("resolver timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("resolver worker failed: {0}")]
    Worker(String),
}

/// Fuente de metadata de tracks (búsqueda y lookup)
#[async_trait]
pub trait TrackResolver: Send + Sync {
    /// Resolves a free-text query or a direct URL to a single track.
    async fn resolve_one(&self, query: &str) -> Result<Track, ResolverError>;

    /// Text search; an empty result is not an error.
    async fn resolve_many(&self, query: &str, limit: usize) -> Result<Vec<Track>, ResolverError>;

    async fn resolve_by_id(&self, id: &str) -> Result<Track, ResolverError>;

    fn source_name(&self) -> &'static str;
}

/// Runs every resolver call on its own task with a deadline and keeps the
/// results in the metadata cache.
#[derive(Clone)]
pub struct ResolverHandle {
    inner: Arc<dyn TrackResolver>,
    cache: TrackCache,
    timeout: Duration,
}

impl ResolverHandle {
    pub fn new(inner: Arc<dyn TrackResolver>, cache: TrackCache, timeout: Duration) -> Self {
        Self { inner, cache, timeout }
    }

    pub async fn resolve_one(&self, query: &str) -> Result<Track, ResolverError> {
        let query = query.trim().to_string();
        let result = self
            .dispatch("resolve_one", move |resolver| async move {
                resolver.resolve_one(&query).await
            })
            .await;

        if let Ok(track) = &result {
            self.cache.insert(track.id.clone(), track.clone());
        }
        result
    }

    pub async fn resolve_many(&self, query: &str, limit: usize) -> Result<Vec<Track>, ResolverError> {
        let query = query.trim().to_string();
        let tracks = self
            .dispatch("resolve_many", move |resolver| async move {
                resolver.resolve_many(&query, limit).await
            })
            .await?;

        for track in &tracks {
            self.cache.insert(track.id.clone(), track.clone());
        }
        Ok(tracks)
    }

    /// Looks the id up in the cache before asking the provider.
    pub async fn resolve_by_id(&self, id: &str) -> Result<Track, ResolverError> {
        if let Some(track) = self.cache.get(&id.to_string()) {
            debug!("🎯 Cache hit para {}", id);
            return Ok(track);
        }

        let id = id.to_string();
        let track = self
            .dispatch("resolve_by_id", move |resolver| async move {
                resolver.resolve_by_id(&id).await
            })
            .await?;

        self.cache.insert(track.id.clone(), track.clone());
        Ok(track)
    }

    pub fn cache(&self) -> &TrackCache {
        &self.cache
    }

    async fn dispatch<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, ResolverError>
    where
        F: FnOnce(Arc<dyn TrackResolver>) -> Fut,
        Fut: Future<Output = Result<T, ResolverError>> + Send + 'static,
        T: Send + 'static,
    {
        let deadline = self.timeout;
        let worker = tokio::spawn(tokio::time::timeout(deadline, call(self.inner.clone())));

        let result = match worker.await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ResolverError::Timeout(deadline)),
            Err(join_error) => Err(ResolverError::Worker(join_error.to_string())),
        };

        if let Err(e) = &result {
            warn!("❌ {} ({}) failed: {}", operation, self.inner.source_name(), e);
        }
        result
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory resolver with optional latency.
    #[derive(Default)]
    pub struct StaticResolver {
        pub tracks: Mutex<HashMap<String, Track>>,
        pub delay: Option<Duration>,
        pub calls: Mutex<Vec<String>>,
    }

    impl StaticResolver {
        pub fn with_tracks(tracks: Vec<Track>) -> Self {
            Self {
                tracks: Mutex::new(tracks.into_iter().map(|t| (t.id.clone(), t)).collect()),
                ..Self::default()
            }
        }

        async fn wait(&self) {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        }
    }

    #[async_trait]
    impl TrackResolver for StaticResolver {
        async fn resolve_one(&self, query: &str) -> Result<Track, ResolverError> {
            self.calls.lock().push(format!("one:{}", query));
            self.wait().await;
            let needle = query.to_lowercase();
            let tracks = self.tracks.lock();
            let mut found: Vec<&Track> = tracks
                .values()
                .filter(|t| t.title.to_lowercase().contains(&needle) || t.url == query)
                .collect();
            found.sort_by(|a, b| a.id.cmp(&b.id));
            found.first().map(|t| (*t).clone()).ok_or(ResolverError::NotFound)
        }

        async fn resolve_many(&self, query: &str, limit: usize) -> Result<Vec<Track>, ResolverError> {
            self.calls.lock().push(format!("many:{}", query));
            self.wait().await;
            let needle = query.to_lowercase();
            let mut found: Vec<Track> = self
                .tracks
                .lock()
                .values()
                .filter(|t| t.title.to_lowercase().contains(&needle))
                .cloned()
                .collect();
            found.sort_by(|a, b| a.id.cmp(&b.id));
            found.truncate(limit);
            Ok(found)
        }

        async fn resolve_by_id(&self, id: &str) -> Result<Track, ResolverError> {
            self.calls.lock().push(format!("id:{}", id));
            self.wait().await;
            self.tracks.lock().get(id).cloned().ok_or(ResolverError::NotFound)
        }

        fn source_name(&self) -> &'static str {
            "static"
        }
    }
}
