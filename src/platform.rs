use super::*;

use teloxide::payloads::setters::*;
use teloxide::requests::Requester;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup};

/// A button click as delivered by the chat platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct RawClickEvent {
    pub(super) identifier: String,
    pub(super) channel_id: ChannelId,
    pub(super) message_id: MessageId,
    pub(super) guild_id: Option<i64>,
    pub(super) user_id: u64,
    pub(super) user_name: String,
    pub(super) content: String,
    pub(super) pinned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum DeleteOutcome {
    Deleted,
    NotFound,
    Forbidden,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct MessageStatus {
    pub(super) message_id: MessageId,
    pub(super) exists: bool,
    pub(super) pinned: bool,
    pub(super) deletable: bool,
    pub(super) created_at: Option<DateTime<Utc>>,
}

impl MessageStatus {
    pub(super) fn present(message_id: MessageId) -> Self {
        Self {
            message_id,
            exists: true,
            pinned: false,
            deletable: true,
            created_at: None,
        }
    }
}

#[derive(Debug, Error)]
pub(super) enum PlatformError {
    #[error("platform request failed: {0}")]
    Transport(String),
    #[error("platform refused the request: {0}")]
    Rejected(String),
}

/// Outbound operations the engine needs from a chat platform.
#[async_trait]
pub(super) trait Platform: Send + Sync {
    async fn render(&self, channel_id: ChannelId, message: &EncodedMessage) -> std::result::Result<MessageId, PlatformError>;
    async fn edit(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        message: &EncodedMessage,
    ) -> std::result::Result<(), PlatformError>;
    async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> std::result::Result<DeleteOutcome, PlatformError>;
    async fn query_message_status(
        &self,
        channel_id: ChannelId,
        message_ids: &[MessageId],
    ) -> std::result::Result<Vec<MessageStatus>, PlatformError>;
}

pub(super) struct TelegramPlatform {
    bot: Bot,
}

impl TelegramPlatform {
    pub(super) fn new(bot: Bot) -> Self {
        Self { bot }
    }

    /// Telegram exposes only the most recent pin of a chat.
    pub(super) async fn pinned_message_id(&self, channel_id: ChannelId) -> Option<MessageId> {
        match self.bot.get_chat(ChatId(channel_id)).await {
            Ok(chat) => chat.pinned_message.map(|message| i64::from(message.id.0)),
            Err(err) => {
                debug!("get_chat {} failed: {}", channel_id, err);
                None
            }
        }
    }
}

fn telegram_message_id(message_id: MessageId) -> std::result::Result<teloxide::types::MessageId, PlatformError> {
    i32::try_from(message_id)
        .map(teloxide::types::MessageId)
        .map_err(|_| PlatformError::Rejected(format!("message id {} out of range", message_id)))
}

fn keyboard(message: &EncodedMessage) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(message.rows.iter().map(|row| {
        row.iter()
            .map(|button| InlineKeyboardButton::callback(button.label.clone(), button.identifier.clone()))
            .collect::<Vec<_>>()
    }))
}

fn is_message_not_modified_error(err: &teloxide::RequestError) -> bool {
    err.to_string()
        .to_ascii_lowercase()
        .contains("message is not modified")
}

fn classify_delete_error(err: &teloxide::RequestError) -> Option<DeleteOutcome> {
    let text = err.to_string().to_ascii_lowercase();
    if text.contains("message to delete not found") || text.contains("message not found") {
        Some(DeleteOutcome::NotFound)
    } else if text.contains("can't be deleted") || text.contains("not enough rights") {
        Some(DeleteOutcome::Forbidden)
    } else {
        None
    }
}

#[async_trait]
impl Platform for TelegramPlatform {
    async fn render(&self, channel_id: ChannelId, message: &EncodedMessage) -> std::result::Result<MessageId, PlatformError> {
        let request = self.bot.send_message(ChatId(channel_id), message.content.clone());
        let result = if message.rows.is_empty() {
            request.await
        } else {
            request.reply_markup(keyboard(message)).await
        };
        let sent = result.map_err(|err| PlatformError::Transport(err.to_string()))?;
        Ok(i64::from(sent.id.0))
    }

    async fn edit(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        message: &EncodedMessage,
    ) -> std::result::Result<(), PlatformError> {
        let request = self.bot.edit_message_text(
            ChatId(channel_id),
            telegram_message_id(message_id)?,
            message.content.clone(),
        );
        let result = if message.rows.is_empty() {
            request.await
        } else {
            request.reply_markup(keyboard(message)).await
        };
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_message_not_modified_error(&err) => Ok(()),
            Err(err) => Err(PlatformError::Transport(err.to_string())),
        }
    }

    async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> std::result::Result<DeleteOutcome, PlatformError> {
        match self
            .bot
            .delete_message(ChatId(channel_id), telegram_message_id(message_id)?)
            .await
        {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(err) => classify_delete_error(&err).ok_or_else(|| PlatformError::Transport(err.to_string())),
        }
    }

    /// Telegram cannot look up arbitrary messages, so every id is reported
    /// as present and deletable. Missing ones surface later as `NotFound`.
    async fn query_message_status(
        &self,
        channel_id: ChannelId,
        message_ids: &[MessageId],
    ) -> std::result::Result<Vec<MessageStatus>, PlatformError> {
        let pinned = self.pinned_message_id(channel_id).await;
        Ok(message_ids
            .iter()
            .map(|id| MessageStatus {
                pinned: Some(*id) == pinned,
                ..MessageStatus::present(*id)
            })
            .collect())
    }
}
