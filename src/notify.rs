//! Operator notifications from the supervisor.
//!
//! Delivery is best effort: failures are logged and never reach the caller.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Started,
    Restarted,
    Crash,
    Cooldown,
    Failed,
}

impl NotificationKind {
    pub fn title(&self) -> &'static str {
        match self {
            Self::Started => "🚀 Slayer Bot started",
            Self::Restarted => "🔄 Slayer Bot restarted",
            Self::Crash => "💥 Slayer Bot crashed",
            Self::Cooldown => "🧊 Slayer Bot cooling down",
            Self::Failed => "⛔ Slayer Bot gave up",
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, kind: NotificationKind, detail: String);
}

/// Sólo escribe en el log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, kind: NotificationKind, detail: String) {
        match kind {
            NotificationKind::Crash | NotificationKind::Failed => error!("{}: {}", kind.title(), detail),
            NotificationKind::Cooldown => warn!("{}: {}", kind.title(), detail),
            _ => info!("{}: {}", kind.title(), detail),
        }
    }
}

#[derive(Serialize)]
struct WebhookPayload {
    text: String,
}

/// Posts `{"text": ...}` to a Slack-compatible webhook and logs locally too.
pub struct WebhookNotifier {
    http: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { http, url: url.into() })
    }
}

pub fn render(kind: NotificationKind, detail: &str) -> String {
    if detail.is_empty() {
        kind.title().to_string()
    } else {
        format!("{}\n{}", kind.title(), detail)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, kind: NotificationKind, detail: String) {
        LogNotifier.notify(kind, detail.clone()).await;

        let payload = WebhookPayload { text: render(kind, &detail) };
        match self.http.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!("📣 Webhook respondió {}", response.status()),
            Err(e) => warn!("📣 No se pudo enviar la notificación: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rendering_puts_the_title_first() {
        assert_eq!(render(NotificationKind::Started, ""), "🚀 Slayer Bot started");
        assert_eq!(
            render(NotificationKind::Crash, "dispatcher exited"),
            "💥 Slayer Bot crashed\ndispatcher exited"
        );
    }

    #[tokio::test]
    async fn unreachable_webhooks_are_swallowed() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook").unwrap();
        notifier.notify(NotificationKind::Failed, "test".into()).await;
    }
}
