// src/types/mod.rs - Core platform data model shared across the engine

use serde::{Deserialize, Serialize};

/// Stable numeric identifiers handed out by the chat platform.
pub type ServerId = u64;
pub type ChannelId = u64;
pub type UserId = u64;
pub type RoleId = u64;
pub type MessageId = u64;

/// A platform user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatUser {
    pub id: UserId,
    pub name: String,
    pub bot: bool,
    /// Account creation time, if the platform exposes it.
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ChatUser {
    pub fn mention(&self) -> String {
        format!("<@{}>", self.id)
    }
}

/// A user as seen inside one server: account plus membership data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub user: ChatUser,
    pub server_id: ServerId,
    pub joined_at: Option<chrono::DateTime<chrono::Utc>>,
    pub role_ids: Vec<RoleId>,
}

impl Member {
    pub fn mention(&self) -> String {
        self.user.mention()
    }
}

/// A single chat message. Embed and attachment metadata is carried as
/// counts; the platform may populate embeds after the message is first
/// delivered, so consumers that care should re-fetch before counting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub server_id: Option<ServerId>,
    pub channel_id: ChannelId,
    pub author: ChatUser,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub embed_count: u32,
    pub attachment_count: u32,
}

/// A reaction on a message. `count` is the total number of users who have
/// applied this emoji after this addition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub server_id: Option<ServerId>,
    pub user_id: UserId,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub server_id: ServerId,
    pub name: String,
    pub category_id: Option<ChannelId>,
}

impl Channel {
    pub fn mention(&self) -> String {
        format!("<#{}>", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub server_id: ServerId,
    pub name: String,
}

impl Role {
    pub fn mention(&self) -> String {
        format!("<@&{}>", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
}

/// Events delivered by a platform connection.
///
/// `MessageEdited` carries the post-edit message. `MessageDeleted` carries
/// the last known copy of the deleted message so rules can still quote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlatformEvent {
    Ready { server_ids: Vec<ServerId> },
    MessagePosted { message: ChatMessage },
    MessageEdited { message: ChatMessage },
    MessageDeleted { message: ChatMessage },
    ReactionAdded {
        reaction: Reaction,
        message: ChatMessage,
        reactor: ChatUser,
    },
    MemberJoined { member: Member },
    MemberLeft { member: Member },
    MemberBanned { member: Member },
    MemberUnbanned { server_id: ServerId, user: ChatUser },
    MemberUpdated { before: Member, after: Member },
}

impl PlatformEvent {
    /// The server an event belongs to, if any. Direct messages and other
    /// serverless events return `None` and are skipped by the router.
    pub fn server_id(&self) -> Option<ServerId> {
        match self {
            PlatformEvent::Ready { .. } => None,
            PlatformEvent::MessagePosted { message }
            | PlatformEvent::MessageEdited { message }
            | PlatformEvent::MessageDeleted { message } => message.server_id,
            PlatformEvent::ReactionAdded { reaction, .. } => reaction.server_id,
            PlatformEvent::MemberJoined { member }
            | PlatformEvent::MemberLeft { member }
            | PlatformEvent::MemberBanned { member } => Some(member.server_id),
            PlatformEvent::MemberUnbanned { server_id, .. } => Some(*server_id),
            PlatformEvent::MemberUpdated { after, .. } => Some(after.server_id),
        }
    }

    /// The user whose action produced this event, if any.
    pub fn actor_id(&self) -> Option<UserId> {
        match self {
            PlatformEvent::Ready { .. } => None,
            PlatformEvent::MessagePosted { message }
            | PlatformEvent::MessageEdited { message }
            | PlatformEvent::MessageDeleted { message } => Some(message.author.id),
            PlatformEvent::ReactionAdded { reactor, .. } => Some(reactor.id),
            PlatformEvent::MemberJoined { member }
            | PlatformEvent::MemberLeft { member }
            | PlatformEvent::MemberBanned { member } => Some(member.user.id),
            PlatformEvent::MemberUnbanned { user, .. } => Some(user.id),
            PlatformEvent::MemberUpdated { after, .. } => Some(after.user.id),
        }
    }
}

/// A structured record sent to a moderation log channel. Platforms render
/// this however they can; the field list is `(name, value)` pairs such as
/// `("Name", ...)` and `("User ID", ...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub content: String,
    pub title: String,
    pub icon_url: Option<String>,
    pub color: Option<u32>,
    pub fields: Vec<(String, String)>,
    pub quoted: Option<String>,
    pub mention_roles: Vec<RoleId>,
}
