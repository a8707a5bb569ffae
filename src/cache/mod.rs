//! # Cache Module
//!
//! Metadata cache for resolved tracks.
//!
//! `/search` and `/play` fill it; a `play:<id>` button click reads it
//! before going back to yt-dlp, which saves a full process spawn per click.
//!
//! ```env
//! CACHE_SIZE=200        # Maximum number of cached tracks
//! CACHE_TTL_SECS=3600   # Time-to-live in seconds
//! ```

pub mod lru_cache;

use lru_cache::LRUCache;
use tracing::info;

use crate::sources::Track;

/// Tracks keyed by provider id.
pub type TrackCache = LRUCache<String, Track>;

impl TrackCache {
    /// Removes expired entries; meant for a periodic background task.
    pub fn cleanup_old_entries(&self) {
        let removed = self.cleanup_expired();
        if removed > 0 {
            let metrics = self.metrics();
            info!(
                "🧹 Cache cleanup: removed {} expired entries ({} cached, {:.0}% hit rate)",
                removed,
                self.len(),
                metrics.hit_rate() * 100.0
            );
        }
    }
}
