use async_process::Command;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::{ResolverError, Track, TrackResolver};

static URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://\S+$").expect("valid url regex"));

static YOUTUBE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://)?(www\.)?(youtube\.com/(watch\?v=|embed/|v/|shorts/)|youtu\.be/|music\.youtube\.com/)")
        .expect("valid youtube regex")
});

/// Resolver respaldado por yt-dlp
pub struct YtDlpResolver {
    binary: String,
    rate_limiter: Semaphore,
}

/// Información extraída de yt-dlp (`--dump-json`, completa o `--flat-playlist`)
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: String,
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    thumbnails: Option<Vec<Thumbnail>>,
    webpage_url: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>, concurrency: usize) -> Self {
        Self {
            binary: binary.into(),
            // Limitar requests concurrentes para evitar rate limiting
            rate_limiter: Semaphore::new(concurrency.max(1)),
        }
    }

    pub fn is_url(query: &str) -> bool {
        URL_REGEX.is_match(query.trim())
    }

    pub fn is_youtube_url(url: &str) -> bool {
        YOUTUBE_REGEX.is_match(url)
    }

    pub fn watch_url(id: &str) -> String {
        format!("https://www.youtube.com/watch?v={}", id)
    }

    /// Checks that the binary can be executed at all.
    pub async fn version(&self) -> anyhow::Result<String> {
        let output = Command::new(&self.binary).arg("--version").output().await?;
        if !output.status.success() {
            anyhow::bail!("{} --version exited with {}", self.binary, output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run(&self, args: &[&str]) -> Result<String, ResolverError> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| ResolverError::Provider(e.to_string()))?;

        // Si el caller abandona (timeout), el proceso muere con el future
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ResolverError::Provider(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            // yt-dlp reporta "not available"/"Unsupported URL" como error
            if error.contains("not available") || error.contains("Unsupported URL") {
                return Err(ResolverError::NotFound);
            }
            return Err(ResolverError::Provider(error.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Track>, ResolverError> {
        info!("🔍 Buscando en YouTube: {}", query);

        let search_query = format!("ytsearch{}:{}", limit, query);
        let stdout = self
            .run(&[
                "--no-playlist",
                "--dump-json",
                "--flat-playlist",
                "--skip-download",
                "--no-warnings",
                &search_query,
            ])
            .await?;

        Ok(parse_lines(&stdout))
    }

    async fn lookup(&self, url: &str) -> Result<Track, ResolverError> {
        debug!("📊 Obteniendo info de: {}", url);

        let stdout = self
            .run(&["--no-playlist", "--dump-json", "--skip-download", "--no-warnings", url])
            .await?;

        parse_lines(&stdout).into_iter().next().ok_or(ResolverError::NotFound)
    }
}

/// One JSON document per line; lines that don't parse are skipped.
fn parse_lines(stdout: &str) -> Vec<Track> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<YtDlpInfo>(line).ok())
        .filter_map(info_to_track)
        .collect()
}

fn info_to_track(info: YtDlpInfo) -> Option<Track> {
    let title = info.title?;

    let url = info
        .webpage_url
        .or_else(|| info.url.filter(|u| u.starts_with("http")))
        .unwrap_or_else(|| YtDlpResolver::watch_url(&info.id));

    let thumbnail = info
        .thumbnail
        .or_else(|| info.thumbnails.and_then(|t| t.into_iter().last().map(|t| t.url)));

    let mut track = Track::new(info.id, title, url)
        .with_duration(info.duration.map(|d| d.max(0.0).round() as u64).unwrap_or(0));

    if let Some(thumbnail) = thumbnail {
        track = track.with_thumbnail(thumbnail);
    }

    Some(track)
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve_one(&self, query: &str) -> Result<Track, ResolverError> {
        if Self::is_url(query) {
            // Las URLs van directo al provider, sin búsqueda de texto
            return self.lookup(query.trim()).await;
        }

        self.search(query, 1).await?.into_iter().next().ok_or(ResolverError::NotFound)
    }

    async fn resolve_many(&self, query: &str, limit: usize) -> Result<Vec<Track>, ResolverError> {
        self.search(query, limit).await
    }

    async fn resolve_by_id(&self, id: &str) -> Result<Track, ResolverError> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ResolverError::NotFound);
        }
        self.lookup(&Self::watch_url(id)).await
    }

    fn source_name(&self) -> &'static str {
        "yt-dlp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_youtube_url_detection() {
        assert!(YtDlpResolver::is_youtube_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(YtDlpResolver::is_youtube_url("https://youtu.be/dQw4w9WgXcQ"));
        assert!(YtDlpResolver::is_youtube_url("https://music.youtube.com/watch?v=test"));
        assert!(!YtDlpResolver::is_youtube_url("https://example.com/video"));
    }

    #[test]
    fn only_full_urls_bypass_search() {
        assert!(YtDlpResolver::is_url("https://soundcloud.com/artist/track"));
        assert!(YtDlpResolver::is_url("  http://youtu.be/abc  "));
        assert!(!YtDlpResolver::is_url("never gonna give you up"));
        assert!(!YtDlpResolver::is_url("youtube.com/watch?v=abc"));
    }

    #[test]
    fn full_dump_json_is_parsed() {
        let line = r#"{"id":"dQw4w9WgXcQ","title":"Never Gonna Give You Up","duration":212.0,"thumbnail":"https://i.ytimg.com/vi/dQw4w9WgXcQ/hq.jpg","webpage_url":"https://www.youtube.com/watch?v=dQw4w9WgXcQ","formats":[]}"#;

        let tracks = parse_lines(line);
        assert_eq!(
            tracks,
            vec![Track::new(
                "dQw4w9WgXcQ",
                "Never Gonna Give You Up",
                "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
            )
            .with_duration(212)
            .with_thumbnail("https://i.ytimg.com/vi/dQw4w9WgXcQ/hq.jpg")]
        );
    }

    #[test]
    fn flat_search_entries_fall_back_to_watch_urls() {
        let stdout = concat!(
            r#"{"id":"abc","title":"First","duration":null,"url":"abc","thumbnails":[{"url":"small"},{"url":"big"}]}"#,
            "\n",
            "not json at all\n",
            r#"{"id":"def","title":"Second","duration":95.6,"url":"https://www.youtube.com/watch?v=def"}"#,
            "\n",
            r#"{"id":"ghi"}"#,
        );

        let tracks = parse_lines(stdout);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].url, "https://www.youtube.com/watch?v=abc");
        assert_eq!(tracks[0].duration, 0);
        assert_eq!(tracks[0].thumbnail.as_deref(), Some("big"));
        assert_eq!(tracks[1].duration, 96);
    }

    /// Running and not a zombie waiting to be reaped.
    #[cfg(unix)]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            Ok(status) => !status.lines().any(|l| l.starts_with("State:") && l.contains('Z')),
            Err(_) => false,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_lookups_kill_the_process() {
        use crate::{cache::TrackCache, sources::ResolverHandle};
        use std::{os::unix::fs::PermissionsExt, sync::Arc, time::Duration};

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = dir.path().join("yt-dlp");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho $$ > {}\nexec sleep 30\n", pid_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let handle = ResolverHandle::new(
            Arc::new(YtDlpResolver::new(script.display().to_string(), 1)),
            TrackCache::new(10, Duration::from_secs(60)),
            Duration::from_secs(1),
        );

        let result = handle.resolve_one("never gonna give you up").await;
        assert!(matches!(result, Err(ResolverError::Timeout(_))));

        let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let mut alive = process_alive(pid);
        for _ in 0..50 {
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            alive = process_alive(pid);
        }
        assert!(!alive, "yt-dlp {} still running after the timeout", pid);
    }

    #[tokio::test]
    async fn suspicious_ids_are_rejected_before_spawning() {
        let resolver = YtDlpResolver::new("/nonexistent/yt-dlp", 1);
        assert!(matches!(
            resolver.resolve_by_id("abc; rm -rf /").await,
            Err(ResolverError::NotFound)
        ));
    }
}
