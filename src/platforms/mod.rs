use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::{
    Channel, ChannelId, ChatMessage, ChatUser, LogMessage, Member, MessageId, PlatformEvent, Role,
    RoleId, Server, ServerId, UserId,
};

pub mod memory;

/// Any failure reported by the chat-platform abstraction at runtime.
/// These are logged by callers; they abort the current side effect but
/// never the enclosing rule or state machine.
#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("unknown server {0}")]
    UnknownServer(ServerId),
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    #[error("unknown user {0}")]
    UnknownUser(UserId),
    #[error("unknown message {0} in channel {1}")]
    UnknownMessage(MessageId, ChannelId),
    #[error("missing permission: {0}")]
    PermissionDenied(String),
    #[error("not connected")]
    NotConnected,
    #[error("request failed: {0}")]
    Request(String),
}

/// Trait defining the interface the engine requires from a chat platform.
///
/// The gateway connection itself (reconnects, REST plumbing) lives behind
/// this trait; the engine only sees the capabilities below plus the event
/// stream from [`ChatPlatform::subscribe`].
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Get the platform identifier (e.g., "discord", "memory")
    fn platform_name(&self) -> &str;

    /// The identity this process acts as. Events originating from this
    /// user are suppressed by the router.
    fn bot_user(&self) -> ChatUser;

    /// Connect to the platform and start emitting events
    async fn connect(&self) -> Result<(), PlatformError>;

    /// Gracefully disconnect
    async fn disconnect(&self) -> Result<(), PlatformError>;

    /// Check if the connection is healthy
    async fn is_connected(&self) -> bool;

    /// Get a receiver for platform events
    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent>;

    // Messaging

    async fn send_message(
        &self,
        channel: ChannelId,
        content: &str,
    ) -> Result<ChatMessage, PlatformError>;

    async fn edit_message(
        &self,
        channel: ChannelId,
        message: MessageId,
        content: &str,
    ) -> Result<(), PlatformError>;

    async fn delete_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<(), PlatformError>;

    /// Send a structured record to a moderation log channel.
    async fn send_log(
        &self,
        channel: ChannelId,
        log: &LogMessage,
    ) -> Result<ChatMessage, PlatformError>;

    // Reactions

    async fn add_reaction(
        &self,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), PlatformError>;

    async fn remove_reaction(
        &self,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), PlatformError>;

    // Channels

    async fn rename_channel(&self, channel: ChannelId, name: &str) -> Result<(), PlatformError>;

    async fn move_channel_to_category(
        &self,
        channel: ChannelId,
        category: ChannelId,
    ) -> Result<(), PlatformError>;

    /// Read the `limit` most recent messages from a channel, newest first.
    async fn recent_messages(
        &self,
        channel: ChannelId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, PlatformError>;

    /// Fetch the current copy of a single message. Embed metadata may have
    /// been populated since the original event was delivered.
    async fn fetch_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<ChatMessage, PlatformError>;

    // Members

    async fn fetch_user(&self, user: UserId) -> Result<ChatUser, PlatformError>;

    async fn kick_member(
        &self,
        server: ServerId,
        user: UserId,
        reason: &str,
    ) -> Result<(), PlatformError>;

    async fn add_roles(
        &self,
        server: ServerId,
        user: UserId,
        roles: &[RoleId],
    ) -> Result<(), PlatformError>;

    async fn remove_roles(
        &self,
        server: ServerId,
        user: UserId,
        roles: &[RoleId],
    ) -> Result<(), PlatformError>;

    /// Edit the bot's own profile (display name).
    async fn edit_profile(&self, username: &str) -> Result<(), PlatformError>;

    // Lookups. These read from the platform's cache and return None for
    // unknown identifiers rather than failing.

    async fn get_server(&self, server: ServerId) -> Option<Server>;

    async fn get_channel(&self, channel: ChannelId) -> Option<Channel>;

    async fn get_role(&self, server: ServerId, role: RoleId) -> Option<Role>;

    async fn get_member(&self, server: ServerId, user: UserId) -> Option<Member>;

    /// Servers currently visible to the connection.
    async fn server_ids(&self) -> Vec<ServerId>;
}
