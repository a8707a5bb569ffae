//! Platform-neutral view of the chat API the handlers talk to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRef {
    pub id: i64,
    pub kind: ChatKind,
    pub title: Option<String>,
}

impl ChatRef {
    pub fn is_group(&self) -> bool {
        matches!(self.kind, ChatKind::Group | ChatKind::Supergroup)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Owner,
    Administrator,
    Member,
    Restricted,
    Left,
    Banned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberInfo {
    pub status: MemberStatus,
    /// Holds the "ban users" admin right.
    pub can_restrict: bool,
}

impl MemberInfo {
    pub fn is_admin(&self) -> bool {
        matches!(self.status, MemberStatus::Owner | MemberStatus::Administrator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restriction {
    /// No send permissions at all.
    Muted,
    Unrestricted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Button {
    Callback { text: String, data: String },
    Url { text: String, url: String },
}

/// Mensaje saliente: texto (opcionalmente HTML) y teclado inline
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutgoingMessage {
    pub text: String,
    pub html: bool,
    pub buttons: Vec<Vec<Button>>,
}

impl OutgoingMessage {
    pub fn plain(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Self::default() }
    }

    pub fn html(text: impl Into<String>) -> Self {
        Self { text: text.into(), html: true, ..Self::default() }
    }

    pub fn with_buttons(mut self, rows: Vec<Vec<Button>>) -> Self {
        self.buttons = rows;
        self
    }
}

impl From<&str> for OutgoingMessage {
    fn from(text: &str) -> Self {
        Self::plain(text)
    }
}

impl From<String> for OutgoingMessage {
    fn from(text: String) -> Self {
        Self::plain(text)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// The bot lacks rights in the chat or was removed from it.
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("chat api error: {0}")]
    Api(String),
}

/// Operaciones del cliente de chat que usan los handlers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send_message(&self, chat_id: i64, message: OutgoingMessage) -> Result<(), ChatError>;

    async fn ban_member(&self, chat_id: i64, user_id: u64) -> Result<(), ChatError>;

    async fn unban_member(&self, chat_id: i64, user_id: u64) -> Result<(), ChatError>;

    async fn restrict_member(
        &self,
        chat_id: i64,
        user_id: u64,
        restriction: Restriction,
    ) -> Result<(), ChatError>;

    async fn get_chat_member(&self, chat_id: i64, user_id: u64) -> Result<MemberInfo, ChatError>;

    async fn answer_callback(&self, callback_id: String, text: Option<String>) -> Result<(), ChatError>;

    /// Id of the bot account itself.
    fn bot_id(&self) -> u64;
}
