//! Telegram adapter: `ChatClient` over the Bot API and the long-polling
//! runtime the supervisor starts and stops.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use teloxide::{
    dispatching::{ShutdownToken, UpdateHandler},
    prelude::*,
    types::{
        CallbackQueryId, Chat, ChatPermissions, InlineKeyboardButton, InlineKeyboardMarkup, ParseMode, User,
    },
    RequestError,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    bot::{
        client::{
            Button, ChatClient, ChatError, ChatKind, ChatRef, MemberInfo, MemberStatus, OutgoingMessage,
            Restriction,
        },
        CallbackEvent, InboundEvent, IncomingMessage, Sender, SlayerBot,
    },
    stats::BotStatus,
    supervisor::BotRuntime,
};

const SHUTDOWN_RETRY: Duration = Duration::from_millis(100);

/// `ChatClient` respaldado por la Bot API de Telegram
pub struct TelegramClient {
    bot: Bot,
    bot_id: AtomicU64,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot, bot_id: AtomicU64::new(0) }
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }

    fn set_bot_id(&self, id: u64) {
        self.bot_id.store(id, Ordering::Relaxed);
    }
}

fn classify(error: RequestError) -> ChatError {
    let text = error.to_string();
    let lower = text.to_lowercase();
    match error {
        RequestError::Api(_) if lower.contains("forbidden") || lower.contains("chat not found") => {
            ChatError::Forbidden(text)
        }
        _ => ChatError::Api(text),
    }
}

fn keyboard(rows: Vec<Vec<Button>>) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .filter_map(|button| match button {
                    Button::Callback { text, data } => Some(InlineKeyboardButton::callback(text, data)),
                    Button::Url { text, url } => match url::Url::parse(&url) {
                        Ok(url) => Some(InlineKeyboardButton::url(text, url)),
                        Err(e) => {
                            warn!("🔗 URL inválida en botón '{}': {}", url, e);
                            None
                        }
                    },
                })
                .collect()
        })
        .filter(|row: &Vec<InlineKeyboardButton>| !row.is_empty())
        .collect();
    InlineKeyboardMarkup::new(rows)
}

#[async_trait]
impl ChatClient for TelegramClient {
    async fn send_message(&self, chat_id: i64, message: OutgoingMessage) -> Result<(), ChatError> {
        let mut request = self.bot.send_message(ChatId(chat_id), message.text);
        if message.html {
            request = request.parse_mode(ParseMode::Html);
        }
        if !message.buttons.is_empty() {
            request = request.reply_markup(keyboard(message.buttons));
        }
        request.await.map_err(classify)?;
        Ok(())
    }

    async fn ban_member(&self, chat_id: i64, user_id: u64) -> Result<(), ChatError> {
        self.bot
            .ban_chat_member(ChatId(chat_id), UserId(user_id))
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn unban_member(&self, chat_id: i64, user_id: u64) -> Result<(), ChatError> {
        // Sin only_if_banned Telegram expulsa a un miembro no baneado
        self.bot
            .unban_chat_member(ChatId(chat_id), UserId(user_id))
            .only_if_banned(true)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn restrict_member(&self, chat_id: i64, user_id: u64, restriction: Restriction) -> Result<(), ChatError> {
        let permissions = match restriction {
            Restriction::Muted => ChatPermissions::empty(),
            Restriction::Unrestricted => ChatPermissions::all(),
        };
        self.bot
            .restrict_chat_member(ChatId(chat_id), UserId(user_id), permissions)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get_chat_member(&self, chat_id: i64, user_id: u64) -> Result<MemberInfo, ChatError> {
        let member = self
            .bot
            .get_chat_member(ChatId(chat_id), UserId(user_id))
            .await
            .map_err(classify)?;

        let kind = &member.kind;
        let status = if kind.is_owner() {
            MemberStatus::Owner
        } else if kind.is_administrator() {
            MemberStatus::Administrator
        } else if kind.is_restricted() {
            MemberStatus::Restricted
        } else if kind.is_left() {
            MemberStatus::Left
        } else if kind.is_banned() {
            MemberStatus::Banned
        } else {
            MemberStatus::Member
        };

        Ok(MemberInfo { status, can_restrict: kind.can_restrict_members() })
    }

    async fn answer_callback(&self, callback_id: String, text: Option<String>) -> Result<(), ChatError> {
        let mut request = self.bot.answer_callback_query(CallbackQueryId(callback_id));
        if let Some(text) = text {
            request = request.text(text);
        }
        request.await.map_err(classify)?;
        Ok(())
    }

    fn bot_id(&self) -> u64 {
        self.bot_id.load(Ordering::Relaxed)
    }
}

// ===== Conversión de updates =====

fn chat_ref(chat: &Chat) -> ChatRef {
    let kind = if chat.is_private() {
        ChatKind::Private
    } else if chat.is_supergroup() {
        ChatKind::Supergroup
    } else if chat.is_group() {
        ChatKind::Group
    } else {
        ChatKind::Channel
    };
    ChatRef { id: chat.id.0, kind, title: chat.title().map(str::to_string) }
}

fn sender(user: &User) -> Sender {
    Sender {
        id: user.id.0,
        first_name: user.first_name.clone(),
        username: user.username.clone(),
        is_bot: user.is_bot,
    }
}

/// Turns a Telegram message into an event; `None` for anything without text.
pub fn message_event(msg: &Message, bot_username: Option<&str>, bot_id: u64) -> Option<InboundEvent> {
    let chat = chat_ref(&msg.chat);

    if let Some(members) = msg.new_chat_members() {
        return Some(InboundEvent::NewMembers { chat, members: members.iter().map(sender).collect() });
    }

    let text = msg.text()?.to_string();
    let reply = msg.reply_to_message();
    let replied_to_bot = reply
        .and_then(|r| r.from.as_ref())
        .map(|u| u.id.0 == bot_id)
        .unwrap_or(false);
    let mentioned = bot_username
        .map(|u| text.to_lowercase().contains(&format!("@{}", u.to_lowercase())))
        .unwrap_or(false);

    Some(InboundEvent::Message(IncomingMessage {
        addressed_to_bot: chat.kind == ChatKind::Private || mentioned || replied_to_bot,
        chat,
        sender: msg.from.as_ref().map(sender),
        reply_text: reply.and_then(|r| r.text()).map(str::to_string),
        text,
    }))
}

pub fn callback_event(q: &CallbackQuery) -> Option<InboundEvent> {
    let data = q.data.clone()?;
    Some(InboundEvent::Callback(CallbackEvent {
        id: q.id.0.clone(),
        chat: q.message.as_ref().map(|m| chat_ref(m.chat())),
        sender: sender(&q.from),
        data,
    }))
}

fn schema() -> UpdateHandler<anyhow::Error> {
    dptree::entry()
        .branch(Update::filter_message().endpoint(|state: Arc<SlayerBot>, msg: Message| async move {
            let username = state.bot_username();
            if let Some(event) = message_event(&msg, username.as_deref(), state.client.bot_id()) {
                state.handle_event(event).await;
            }
            Ok::<(), anyhow::Error>(())
        }))
        .branch(Update::filter_callback_query().endpoint(|state: Arc<SlayerBot>, q: CallbackQuery| async move {
            if let Some(event) = callback_event(&q) {
                state.handle_event(event).await;
            }
            Ok::<(), anyhow::Error>(())
        }))
}

// ===== Runtime =====

struct RunningDispatcher {
    token: ShutdownToken,
    monitor: JoinHandle<()>,
    stopping: Arc<AtomicBool>,
}

/// Long-polling dispatcher that the supervisor can start and stop repeatedly.
pub struct TelegramRuntime {
    client: Arc<TelegramClient>,
    state: Arc<SlayerBot>,
    status: Arc<BotStatus>,
    running: Mutex<Option<RunningDispatcher>>,
}

impl TelegramRuntime {
    pub fn new(client: Arc<TelegramClient>, state: Arc<SlayerBot>, status: Arc<BotStatus>) -> Self {
        Self { client, state, status, running: Mutex::new(None) }
    }
}

#[async_trait]
impl BotRuntime for TelegramRuntime {
    async fn start(&self) -> Result<()> {
        let bot = self.client.bot().clone();
        let me = bot.get_me().await.context("getMe failed")?;
        self.client.set_bot_id(me.user.id.0);
        self.state.set_bot_username(me.user.username.clone());
        info!("🤖 Conectado como @{}", me.user.username.as_deref().unwrap_or("unknown"));

        let mut dispatcher = Dispatcher::builder(bot, schema())
            .dependencies(dptree::deps![self.state.clone()])
            .default_handler(|update| async move {
                debug!("Update ignorado: {:?}", update.id);
            })
            .error_handler(LoggingErrorHandler::with_custom_text("Dispatcher error"))
            .build();
        let token = dispatcher.shutdown_token();

        let stopping = Arc::new(AtomicBool::new(false));
        let status = self.status.clone();
        let stop_flag = stopping.clone();
        let handle = tokio::spawn(async move { dispatcher.dispatch().await });

        // Si el dispatcher termina sin que nadie lo pidiera es un crash
        let monitor = tokio::spawn(async move {
            match handle.await {
                Ok(()) if stop_flag.load(Ordering::SeqCst) => status.mark_stopped(),
                Ok(()) => {
                    error!("💥 El dispatcher terminó inesperadamente");
                    status.mark_failed("dispatcher exited unexpectedly");
                }
                Err(e) => {
                    error!("💥 El dispatcher falló: {}", e);
                    status.mark_failed(format!("dispatcher panicked: {}", e));
                }
            }
        });

        self.status.mark_running();
        *self.running.lock() = Some(RunningDispatcher { token, monitor, stopping });
        info!("🚀 Dispatcher de Telegram iniciado");
        Ok(())
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.stopping.store(true, Ordering::SeqCst);
        // shutdown() falla si el dispatcher aún no arrancó o ya terminó
        while !running.monitor.is_finished() {
            match running.token.shutdown() {
                Ok(done) => {
                    done.await;
                    break;
                }
                Err(_) => tokio::time::sleep(SHUTDOWN_RETRY).await,
            }
        }
        if let Err(e) = running.monitor.await {
            warn!("⚠️ Monitor del dispatcher terminó con error: {}", e);
        }
        info!("🛑 Dispatcher de Telegram detenido");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn group_message(text: &str, reply_from: Option<u64>) -> Message {
        let mut value = json!({
            "message_id": 10,
            "date": 1_700_000_000,
            "chat": { "id": -100, "type": "supergroup", "title": "Music Lovers" },
            "from": { "id": 5, "is_bot": false, "first_name": "Ana" },
            "text": text,
        });
        if let Some(id) = reply_from {
            value["reply_to_message"] = json!({
                "message_id": 9,
                "date": 1_699_999_990,
                "chat": { "id": -100, "type": "supergroup", "title": "Music Lovers" },
                "from": { "id": id, "is_bot": true, "first_name": "Slayer" },
                "text": "Hello there!",
            });
        }
        serde_json::from_value(value).unwrap()
    }

    fn incoming(event: Option<InboundEvent>) -> IncomingMessage {
        match event {
            Some(InboundEvent::Message(msg)) => msg,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[test]
    fn group_text_is_addressed_only_by_mention_or_reply() {
        let plain = incoming(message_event(&group_message("hello all", None), Some("SlayerBot"), 1000));
        assert!(!plain.addressed_to_bot);
        assert_eq!(plain.chat.kind, ChatKind::Supergroup);
        assert_eq!(plain.chat.title.as_deref(), Some("Music Lovers"));
        assert_eq!(plain.sender.as_ref().map(|s| s.id), Some(5));

        let mention = incoming(message_event(&group_message("hey @slayerbot", None), Some("SlayerBot"), 1000));
        assert!(mention.addressed_to_bot);

        let reply = incoming(message_event(&group_message("and you?", Some(1000)), Some("SlayerBot"), 1000));
        assert!(reply.addressed_to_bot);
        assert_eq!(reply.reply_text.as_deref(), Some("Hello there!"));

        let other_reply = incoming(message_event(&group_message("and you?", Some(77)), Some("SlayerBot"), 1000));
        assert!(!other_reply.addressed_to_bot);
    }

    #[test]
    fn play_callbacks_keep_their_chat() {
        let query: CallbackQuery = serde_json::from_value(json!({
            "id": "4242",
            "from": { "id": 5, "is_bot": false, "first_name": "Ana" },
            "chat_instance": "-77",
            "data": "play:abc123",
            "message": {
                "message_id": 11,
                "date": 1_700_000_000,
                "chat": { "id": -100, "type": "supergroup", "title": "Music Lovers" },
                "text": "Search Results",
            },
        }))
        .unwrap();

        match callback_event(&query) {
            Some(InboundEvent::Callback(cb)) => {
                assert_eq!(cb.id, "4242");
                assert_eq!(cb.data, "play:abc123");
                assert_eq!(cb.chat.map(|c| c.id), Some(-100));
            }
            other => panic!("expected a callback, got {:?}", other),
        }
    }

    #[test]
    fn invalid_button_urls_are_dropped() {
        let markup = keyboard(vec![
            vec![Button::Url { text: "bad".into(), url: "not a url".into() }],
            vec![
                Button::Callback { text: "1. Song".into(), data: "play:a".into() },
                Button::Url { text: "🔗".into(), url: "https://youtu.be/a".into() },
            ],
        ]);
        assert_eq!(markup.inline_keyboard.len(), 1);
        assert_eq!(markup.inline_keyboard[0].len(), 2);
    }
}
