//! # AI Module
//!
//! Free-text conversation with an OpenAI-compatible model plus the
//! keyword auto-responder used when nobody addressed the bot.

pub mod auto_response;
pub mod openai;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::storage::JsonStorage;

pub use auto_response::AutoResponder;
pub use openai::OpenAiClient;

pub const CONVERSATIONS_FILE: &str = "conversations.jsonl";

const SYSTEM_PROMPT: &str = "You are Slayer, an AI-powered Telegram music bot with advanced conversation capabilities. \
You're helpful, friendly, and knowledgeable. You can discuss music, answer questions, and engage in casual conversation. \
You can play music, manage queues, and perform various music-related tasks, but you're responding in a conversation now, \
not executing commands. If users want to play music, remind them to use commands like /play instead of just asking in conversation. \
Keep responses concise but friendly.";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AiError {
    #[error("AI responses are disabled")]
    Disabled,
    #[error("no AI API key configured")]
    NotConfigured,
    #[error("AI quota exhausted")]
    Quota,
    #[error("AI rate limited")]
    RateLimited,
    #[error("AI request failed: {0}")]
    Other(String),
}

impl AiError {
    /// Lo que ve el usuario en el chat
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Disabled => "AI responses are currently disabled. Please contact the bot administrator.",
            Self::NotConfigured => {
                "Sorry, I'm unable to generate a response at the moment due to configuration issues."
            }
            Self::Quota => "Sorry, I can't use AI responses right now due to API quota limits.",
            Self::RateLimited => "I'm receiving too many requests right now. Please try again in a moment.",
            Self::Other(_) => "Sorry, I encountered an error while processing your message.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

/// Text-generation backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn complete(&self, messages: Vec<ChatTurn>) -> Result<String, AiError>;
}

#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub enabled: bool,
    /// Exchanges kept per (chat, user).
    pub max_history: usize,
    /// Chance of answering a group message nobody addressed to the bot.
    pub presence_probability: f64,
}

#[derive(Debug, Clone)]
struct Exchange {
    user: String,
    assistant: String,
}

#[derive(Debug, Serialize)]
struct ConversationLogEntry<'a> {
    chat_id: i64,
    user_id: u64,
    message: &'a str,
    response: &'a str,
    timestamp: DateTime<Utc>,
}

/// Conversaciones por (chat, usuario) con historial acotado
pub struct ConversationService {
    client: Option<Arc<dyn AiClient>>,
    settings: ConversationSettings,
    histories: DashMap<(i64, u64), VecDeque<Exchange>>,
    storage: Arc<JsonStorage>,
}

impl ConversationService {
    pub fn new(client: Option<Arc<dyn AiClient>>, settings: ConversationSettings, storage: Arc<JsonStorage>) -> Self {
        if settings.enabled && client.is_none() {
            warn!("🤖 AI habilitada pero sin cliente configurado");
        }
        Self {
            client,
            settings,
            histories: DashMap::new(),
            storage,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled && self.client.is_some()
    }

    /// Rolls the dice for joining an unaddressed group conversation.
    pub fn should_join(&self) -> bool {
        self.is_enabled() && fastrand::f64() < self.settings.presence_probability
    }

    pub async fn reply(&self, chat_id: i64, user_id: u64, text: &str) -> Result<String, AiError> {
        if !self.settings.enabled {
            return Err(AiError::Disabled);
        }
        let client = self.client.as_ref().ok_or(AiError::NotConfigured)?;

        let messages = self.build_messages(chat_id, user_id, text);
        let answer = client.complete(messages).await?;

        self.remember(chat_id, user_id, text, &answer);
        self.log_conversation(chat_id, user_id, text, &answer).await;
        info!("🤖 Respuesta AI en {} para {}", chat_id, user_id);
        Ok(answer)
    }

    pub fn history_len(&self, chat_id: i64, user_id: u64) -> usize {
        self.histories.get(&(chat_id, user_id)).map(|h| h.len()).unwrap_or(0)
    }

    fn build_messages(&self, chat_id: i64, user_id: u64, text: &str) -> Vec<ChatTurn> {
        let mut messages = vec![ChatTurn::new(Role::System, SYSTEM_PROMPT)];
        if let Some(history) = self.histories.get(&(chat_id, user_id)) {
            for exchange in history.iter() {
                messages.push(ChatTurn::new(Role::User, exchange.user.clone()));
                messages.push(ChatTurn::new(Role::Assistant, exchange.assistant.clone()));
            }
        }
        messages.push(ChatTurn::new(Role::User, text));
        messages
    }

    fn remember(&self, chat_id: i64, user_id: u64, text: &str, answer: &str) {
        let mut history = self.histories.entry((chat_id, user_id)).or_default();
        history.push_back(Exchange { user: text.to_string(), assistant: answer.to_string() });
        while history.len() > self.settings.max_history {
            history.pop_front();
        }
    }

    async fn log_conversation(&self, chat_id: i64, user_id: u64, message: &str, response: &str) {
        let entry = ConversationLogEntry { chat_id, user_id, message, response, timestamp: Utc::now() };
        if let Err(e) = self.storage.append_line(CONVERSATIONS_FILE, &entry).await {
            warn!("💾 No se pudo guardar la conversación: {:#}", e);
        } else {
            debug!("💾 Conversación registrada ({}, {})", chat_id, user_id);
        }
    }
}
