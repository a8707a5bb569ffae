//! # Bot Module
//!
//! Platform-neutral bot logic for Slayer Bot.
//!
//! The Telegram adapter in [`telegram`] turns updates into [`InboundEvent`]s
//! and hands them to [`SlayerBot::handle_event`]. Everything below that
//! point talks to the chat platform only through the [`ChatClient`] trait,
//! which keeps handlers testable without a network.
//!
//! ## Routing
//!
//! - Slash commands go to [`handlers::dispatch`]
//! - New members are checked against the global ban list in [`events`]
//! - `play:<id>` button clicks are handled in [`events`]
//! - Free text goes to the AI when addressed to the bot, otherwise to the
//!   auto-responder, otherwise to the AI by chance

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use regex::RegexBuilder;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub mod client;
pub mod commands;
pub mod events;
pub mod handlers;
pub mod telegram;

use crate::{
    ai::{AutoResponder, ConversationService},
    audio::player::{PlaybackAnnouncer, PlaybackScheduler},
    config::Config,
    moderation::{ModerationStore, SudoRegistry},
    sources::{ResolverHandle, Track},
    stats::{counters, BotStatus},
    storage::{ChatDirectory, TrackLibrary},
    ui::messages,
};

use client::{ChatClient, ChatError, ChatRef, OutgoingMessage};

/// Usuario que envía un mensaje o pulsa un botón
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub id: u64,
    pub first_name: String,
    pub username: Option<String>,
    pub is_bot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub chat: ChatRef,
    pub sender: Option<Sender>,
    pub text: String,
    /// Private chat, @mention or reply to one of the bot's messages.
    pub addressed_to_bot: bool,
    /// Text of the message this one replies to, if any.
    pub reply_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEvent {
    pub id: String,
    pub chat: Option<ChatRef>,
    pub sender: Sender,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(IncomingMessage),
    NewMembers { chat: ChatRef, members: Vec<Sender> },
    Callback(CallbackEvent),
}

impl InboundEvent {
    pub fn chat(&self) -> Option<&ChatRef> {
        match self {
            Self::Message(msg) => Some(&msg.chat),
            Self::NewMembers { chat, .. } => Some(chat),
            Self::Callback(cb) => cb.chat.as_ref(),
        }
    }
}

/// Shared state every handler works with.
pub struct SlayerBot {
    pub config: Arc<Config>,
    pub client: Arc<dyn ChatClient>,
    pub scheduler: Arc<PlaybackScheduler>,
    pub resolver: ResolverHandle,
    pub moderation: Arc<ModerationStore>,
    pub sudo: Arc<SudoRegistry>,
    pub stats: Arc<BotStatus>,
    pub library: Arc<TrackLibrary>,
    pub chats: Arc<ChatDirectory>,
    pub conversation: Arc<ConversationService>,
    pub auto_responder: Arc<AutoResponder>,
    /// Filled by the runtime from `getMe`.
    pub bot_username: RwLock<Option<String>>,
}

impl SlayerBot {
    pub fn set_bot_username(&self, username: Option<String>) {
        *self.bot_username.write() = username;
    }

    pub fn bot_username(&self) -> Option<String> {
        self.bot_username.read().clone()
    }

    /// Entry point for every update. Errors end here as a chat reply.
    pub async fn handle_event(&self, event: InboundEvent) {
        if let Some(chat) = event.chat() {
            if let Err(e) = self.chats.register(chat).await {
                warn!("⚠️ No se pudo registrar el chat {}: {:#}", chat.id, e);
            }
        }

        match event {
            InboundEvent::Message(msg) => {
                let chat_id = msg.chat.id;
                if let Err(e) = self.handle_message(&msg).await {
                    error!("❌ Error manejando mensaje en {}: {:#}", chat_id, e);
                    self.reply(chat_id, format!("❌ Error: {}", e)).await;
                }
            }
            InboundEvent::NewMembers { chat, members } => {
                if let Err(e) = events::handle_new_members(self, &chat, &members).await {
                    error!("❌ Error verificando nuevos miembros en {}: {:#}", chat.id, e);
                }
            }
            InboundEvent::Callback(callback) => {
                let chat_id = callback.chat.as_ref().map(|c| c.id);
                if let Err(e) = events::handle_callback(self, callback).await {
                    error!("❌ Error en callback: {:#}", e);
                    if let Some(chat_id) = chat_id {
                        self.reply(chat_id, format!("❌ Error playing song: {}", e)).await;
                    }
                }
            }
        }
    }

    async fn handle_message(&self, msg: &IncomingMessage) -> Result<()> {
        let Some(sender) = &msg.sender else {
            return Ok(());
        };

        match commands::parse(&msg.text, self.bot_username().as_deref()) {
            Some(invocation) => match invocation.command {
                Some(command) => handlers::dispatch(self, msg, sender, command, &invocation.args).await,
                None => {
                    debug!("❓ Comando desconocido /{} en {}", invocation.name, msg.chat.id);
                    Ok(())
                }
            },
            None if msg.text.trim_start().starts_with('/') => Ok(()),
            None => self.handle_free_text(msg, sender).await,
        }
    }

    async fn handle_free_text(&self, msg: &IncomingMessage, sender: &Sender) -> Result<()> {
        if sender.is_bot || msg.text.trim().is_empty() {
            return Ok(());
        }
        self.stats.increment(counters::MESSAGES_PROCESSED);

        if msg.addressed_to_bot && self.conversation.is_enabled() {
            return self.converse(msg, sender).await;
        }

        if let Some(answer) = self.auto_responder.respond(&msg.text) {
            self.reply(msg.chat.id, answer).await;
            self.stats.increment(counters::AUTO_RESPONSES);
            return Ok(());
        }

        if !msg.addressed_to_bot && self.conversation.should_join() {
            debug!("🎲 Uniéndose a la conversación en {}", msg.chat.id);
            return self.converse(msg, sender).await;
        }

        Ok(())
    }

    async fn converse(&self, msg: &IncomingMessage, sender: &Sender) -> Result<()> {
        let text = self.strip_mention(&msg.text);
        if text.is_empty() {
            return Ok(());
        }

        match self.conversation.reply(msg.chat.id, sender.id, &text).await {
            Ok(answer) => {
                self.reply(msg.chat.id, answer).await;
                self.stats.increment(counters::AI_CONVERSATIONS);
            }
            Err(e) => {
                warn!("🤖 Error de AI en {}: {}", msg.chat.id, e);
                self.reply(msg.chat.id, e.user_message()).await;
            }
        }
        Ok(())
    }

    fn strip_mention(&self, text: &str) -> String {
        let Some(username) = self.bot_username() else {
            return text.trim().to_string();
        };
        match RegexBuilder::new(&format!("@{}", regex::escape(&username)))
            .case_insensitive(true)
            .build()
        {
            Ok(mention) => mention.replace_all(text, "").trim().to_string(),
            Err(_) => text.trim().to_string(),
        }
    }

    /// Sends a message, logging failures; a chat that kicked the bot is forgotten.
    pub async fn reply(&self, chat_id: i64, message: impl Into<OutgoingMessage>) {
        match self.client.send_message(chat_id, message.into()).await {
            Ok(()) => {}
            Err(ChatError::Forbidden(reason)) => {
                warn!("🚫 Sin acceso al chat {}: {}", chat_id, reason);
                if let Err(e) = self.chats.forget(chat_id).await {
                    warn!("⚠️ No se pudo olvidar el chat {}: {:#}", chat_id, e);
                }
            }
            Err(e) => warn!("⚠️ No se pudo enviar mensaje a {}: {}", chat_id, e),
        }
    }

    /// Remembers the track and queues it, replying with the outcome.
    pub async fn enqueue_and_report(&self, chat_id: i64, track: Track) {
        if let Err(e) = self.library.remember(&track).await {
            warn!("💾 No se pudo guardar el track {}: {:#}", track.id, e);
        }

        match self.scheduler.enqueue(chat_id, track.clone()).await {
            Ok(outcome) => {
                info!("🎵 {} encolado en {} ({:?})", track.title, chat_id, outcome);
                self.reply(chat_id, messages::enqueued(outcome, &track)).await;
            }
            Err(e) => {
                warn!("⚠️ No se pudo encolar en {}: {}", chat_id, e);
                self.reply(chat_id, format!("❌ Could not add the song: {}.", e)).await;
            }
        }
    }
}

/// Anuncia eventos de reproducción en el chat
pub struct ChatAnnouncer {
    client: Arc<dyn ChatClient>,
}

impl ChatAnnouncer {
    pub fn new(client: Arc<dyn ChatClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlaybackAnnouncer for ChatAnnouncer {
    async fn now_playing(&self, chat_id: i64, track: &Track) -> Result<()> {
        self.client.send_message(chat_id, messages::now_playing(track)).await?;
        Ok(())
    }

    async fn queue_empty(&self, chat_id: i64) -> Result<()> {
        self.client
            .send_message(chat_id, messages::QUEUE_EMPTY_ANNOUNCEMENT.into())
            .await?;
        Ok(())
    }

    async fn playback_error(&self, chat_id: i64, error: &str) -> Result<()> {
        self.client
            .send_message(chat_id, format!("❌ Error during playback: {}", error).into())
            .await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::bot::client::{ChatKind, MemberStatus};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn every_event_registers_its_chat() {
        let t = test_bot(vec![]).await;
        t.bot.handle_event(message(group(), 5, "just chatting about nothing")).await;

        assert_eq!(t.bot.chats.group_chats(), vec![GROUP]);
    }

    #[tokio::test]
    async fn unaddressed_text_gets_an_auto_response() {
        let t = test_bot(vec![]).await;
        t.bot.handle_event(message(group(), 5, "hello everyone")).await;

        let texts = t.client.texts_to(GROUP);
        assert_eq!(texts.len(), 1);
        assert!(default_greetings().contains(&texts[0]));
        assert_eq!(t.bot.stats.get(counters::AUTO_RESPONSES), 1);
    }

    #[tokio::test]
    async fn commands_for_other_bots_are_ignored() {
        let t = test_bot(vec![]).await;
        t.bot.handle_event(message(group(), 5, "/ping@OtherBot")).await;
        t.bot.handle_event(message(group(), 5, "/ping@SlayerBot")).await;

        assert_eq!(t.client.texts_to(GROUP), vec!["🏓 Pong!".to_string()]);
    }

    #[tokio::test]
    async fn forbidden_chats_are_forgotten() {
        let t = test_bot(vec![]).await;
        t.bot.handle_event(message(group(), 5, "/ping")).await;
        assert_eq!(t.bot.chats.len(), 1);

        t.client.forbid_chat(GROUP);
        t.bot.handle_event(message(group(), 5, "/ping")).await;
        // Se registra y luego se olvida al fallar el envío
        assert_eq!(t.bot.chats.len(), 0);
    }

    #[tokio::test]
    async fn addressed_text_without_ai_falls_back_to_auto_responses() {
        let t = test_bot(vec![]).await;
        let private = ChatRef { id: 5, kind: ChatKind::Private, title: None };
        t.bot.handle_event(message(private.clone(), 5, "thanks!")).await;
        t.bot.handle_event(message(private, 5, "what is the meaning of life")).await;

        assert_eq!(t.client.texts_to(5).len(), 1);
        assert_eq!(t.bot.stats.get(counters::AI_CONVERSATIONS), 0);
    }

    #[tokio::test]
    async fn announcer_failures_surface_as_errors() {
        let t = test_bot(vec![]).await;
        t.client.forbid_chat(GROUP);
        t.client.set_member(GROUP, 5, MemberStatus::Member, false);

        let announcer = ChatAnnouncer::new(t.client.clone());
        assert!(announcer.queue_empty(GROUP).await.is_err());
        assert!(announcer.queue_empty(-1).await.is_ok());
        assert_eq!(t.client.texts_to(-1), vec![messages::QUEUE_EMPTY_ANNOUNCEMENT.to_string()]);
    }

    #[tokio::test]
    async fn mentions_go_to_the_ai_without_the_mention() {
        let mut t = test_bot(vec![]).await;
        let mut ai = crate::ai::MockAiClient::new();
        ai.expect_complete()
            .withf(|turns| turns.last().map(|turn| turn.content.as_str()) == Some("what should I listen to?"))
            .times(1)
            .returning(|_| Ok("Try some Queen.".into()));
        let storage = Arc::new(crate::storage::JsonStorage::new(t._dir.path().to_path_buf()).await.unwrap());
        t.bot.conversation = Arc::new(ConversationService::new(
            Some(Arc::new(ai)),
            crate::ai::ConversationSettings { enabled: true, max_history: 10, presence_probability: 0.0 },
            storage,
        ));

        t.bot
            .handle_event(InboundEvent::Message(IncomingMessage {
                chat: group(),
                sender: Some(user(5)),
                text: "@slayerbot what should I listen to?".into(),
                addressed_to_bot: true,
                reply_text: None,
            }))
            .await;

        assert_eq!(t.client.last_text(GROUP), Some("Try some Queen.".to_string()));
        assert_eq!(t.bot.stats.get(counters::AI_CONVERSATIONS), 1);
        assert_eq!(t.bot.stats.get(counters::MESSAGES_PROCESSED), 1);
    }

    #[tokio::test]
    async fn other_bots_are_ignored() {
        let t = test_bot(vec![]).await;
        let mut robot = user(77);
        robot.is_bot = true;
        t.bot
            .handle_event(InboundEvent::Message(IncomingMessage {
                chat: group(),
                sender: Some(robot),
                text: "hello".into(),
                addressed_to_bot: false,
                reply_text: None,
            }))
            .await;

        assert!(t.client.texts_to(GROUP).is_empty());
        assert_eq!(t.bot.stats.get(counters::MESSAGES_PROCESSED), 0);
    }

    #[tokio::test]
    async fn free_text_is_counted_even_without_a_reply() {
        let t = test_bot(vec![]).await;
        t.bot.handle_event(message(group(), 5, "just chatting about nothing")).await;
        t.bot.handle_event(message(group(), 6, "hello everyone")).await;
        t.bot.handle_event(message(group(), 5, "/ping")).await;

        assert_eq!(t.client.texts_to(GROUP).len(), 2);
        assert_eq!(t.bot.stats.get(counters::MESSAGES_PROCESSED), 2);
        assert_eq!(t.bot.stats.get(counters::AUTO_RESPONSES), 1);
    }

    fn default_greetings() -> Vec<String> {
        crate::ai::auto_response::default_rules()[0].responses.clone()
    }
}
