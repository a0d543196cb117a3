// src/platforms/memory.rs - In-memory platform used by tests and dry-run mode

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::{broadcast, RwLock};

use crate::platforms::{ChatPlatform, PlatformError};
use crate::types::{
    Channel, ChannelId, ChatMessage, ChatUser, LogMessage, Member, MessageId, PlatformEvent, Role,
    RoleId, Server, ServerId, UserId,
};

/// Record of a member removal, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct KickRecord {
    pub server_id: ServerId,
    pub user_id: UserId,
    pub reason: String,
}

#[derive(Default)]
struct MemoryState {
    servers: HashMap<ServerId, Server>,
    channels: HashMap<ChannelId, Channel>,
    roles: HashMap<ServerId, HashMap<RoleId, Role>>,
    members: HashMap<ServerId, HashMap<UserId, Member>>,
    /// Per-channel message history, oldest first.
    messages: HashMap<ChannelId, Vec<ChatMessage>>,
    /// Bot-applied reactions as (channel, message, emoji).
    bot_reactions: Vec<(ChannelId, MessageId, String)>,
    deleted: Vec<(ChannelId, MessageId)>,
    kicks: Vec<KickRecord>,
    role_grants: Vec<(ServerId, UserId, Vec<RoleId>)>,
    logs: Vec<(ChannelId, LogMessage)>,
    profile_edits: Vec<String>,
    connected: bool,
}

/// A complete `ChatPlatform` over in-memory state.
///
/// Seeding helpers build servers, channels, and members; `post_as` and
/// `emit` inject events; the `sent_*` accessors expose recorded side
/// effects so tests can assert on exactly what the engine did.
pub struct MemoryPlatform {
    bot: ChatUser,
    state: Arc<RwLock<MemoryState>>,
    events: broadcast::Sender<PlatformEvent>,
    next_id: AtomicU64,
}

impl MemoryPlatform {
    pub fn new(bot_name: &str) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            bot: ChatUser {
                id: 1,
                name: bot_name.to_string(),
                bot: true,
                created_at: Some(Utc::now()),
            },
            state: Arc::new(RwLock::new(MemoryState::default())),
            events,
            next_id: AtomicU64::new(1000),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    // Seeding

    pub async fn add_server(&self, id: ServerId, name: &str) {
        self.state.write().await.servers.insert(
            id,
            Server {
                id,
                name: name.to_string(),
            },
        );
    }

    pub async fn add_channel(&self, id: ChannelId, server_id: ServerId, name: &str) {
        let mut state = self.state.write().await;
        state.channels.insert(
            id,
            Channel {
                id,
                server_id,
                name: name.to_string(),
                category_id: None,
            },
        );
        state.messages.entry(id).or_default();
    }

    pub async fn add_role(&self, server_id: ServerId, id: RoleId, name: &str) {
        self.state.write().await.roles.entry(server_id).or_default().insert(
            id,
            Role {
                id,
                server_id,
                name: name.to_string(),
            },
        );
    }

    pub async fn add_member(&self, server_id: ServerId, user: ChatUser) -> Member {
        let member = Member {
            user,
            server_id,
            joined_at: Some(Utc::now()),
            role_ids: Vec::new(),
        };
        self.state
            .write()
            .await
            .members
            .entry(server_id)
            .or_default()
            .insert(member.user.id, member.clone());
        member
    }

    /// Insert a message directly with an explicit timestamp, without
    /// broadcasting an event. Used to seed channel history.
    pub async fn seed_message(
        &self,
        channel: ChannelId,
        author: ChatUser,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> ChatMessage {
        let server_id = self.state.read().await.channels.get(&channel).map(|c| c.server_id);
        let message = ChatMessage {
            id: self.allocate_id(),
            server_id,
            channel_id: channel,
            author,
            content: content.to_string(),
            timestamp,
            embed_count: 0,
            attachment_count: 0,
        };
        self.state
            .write()
            .await
            .messages
            .entry(channel)
            .or_default()
            .push(message.clone());
        message
    }

    /// Post a message as `author` and broadcast the MessagePosted event,
    /// like a live platform delivering user traffic.
    pub async fn post_as(
        &self,
        author: ChatUser,
        channel: ChannelId,
        content: &str,
    ) -> ChatMessage {
        let message = self.seed_message(channel, author, content, Utc::now()).await;
        self.emit(PlatformEvent::MessagePosted {
            message: message.clone(),
        });
        message
    }

    /// Broadcast an arbitrary event to subscribers.
    pub fn emit(&self, event: PlatformEvent) {
        // No subscribers is fine; tests often call the engine directly.
        let _ = self.events.send(event);
    }

    // Inspection

    pub async fn channel_name(&self, channel: ChannelId) -> Option<String> {
        self.state.read().await.channels.get(&channel).map(|c| c.name.clone())
    }

    pub async fn messages_in(&self, channel: ChannelId) -> Vec<ChatMessage> {
        self.state
            .read()
            .await
            .messages
            .get(&channel)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn sent_logs(&self) -> Vec<(ChannelId, LogMessage)> {
        self.state.read().await.logs.clone()
    }

    pub async fn deleted_messages(&self) -> Vec<(ChannelId, MessageId)> {
        self.state.read().await.deleted.clone()
    }

    pub async fn kicks(&self) -> Vec<KickRecord> {
        self.state.read().await.kicks.clone()
    }

    pub async fn bot_reactions(&self) -> Vec<(ChannelId, MessageId, String)> {
        self.state.read().await.bot_reactions.clone()
    }

    pub async fn role_grants(&self) -> Vec<(ServerId, UserId, Vec<RoleId>)> {
        self.state.read().await.role_grants.clone()
    }

    pub async fn profile_edits(&self) -> Vec<String> {
        self.state.read().await.profile_edits.clone()
    }

    /// Overwrite embed/attachment counts on a stored message, mimicking
    /// the platform resolving embeds after delivery.
    pub async fn set_message_media(
        &self,
        channel: ChannelId,
        message: MessageId,
        embeds: u32,
        attachments: u32,
    ) {
        if let Some(history) = self.state.write().await.messages.get_mut(&channel) {
            if let Some(stored) = history.iter_mut().find(|m| m.id == message) {
                stored.embed_count = embeds;
                stored.attachment_count = attachments;
            }
        }
    }
}

#[async_trait]
impl ChatPlatform for MemoryPlatform {
    fn platform_name(&self) -> &str {
        "memory"
    }

    fn bot_user(&self) -> ChatUser {
        self.bot.clone()
    }

    async fn connect(&self) -> Result<(), PlatformError> {
        let mut state = self.state.write().await;
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PlatformError> {
        let mut state = self.state.write().await;
        state.connected = false;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }

    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.events.subscribe()
    }

    async fn send_message(
        &self,
        channel: ChannelId,
        content: &str,
    ) -> Result<ChatMessage, PlatformError> {
        let server_id = {
            let state = self.state.read().await;
            state
                .channels
                .get(&channel)
                .ok_or(PlatformError::UnknownChannel(channel))?
                .server_id
        };
        let message = ChatMessage {
            id: self.allocate_id(),
            server_id: Some(server_id),
            channel_id: channel,
            author: self.bot.clone(),
            content: content.to_string(),
            timestamp: Utc::now(),
            embed_count: 0,
            attachment_count: 0,
        };
        self.state
            .write()
            .await
            .messages
            .entry(channel)
            .or_default()
            .push(message.clone());
        self.emit(PlatformEvent::MessagePosted {
            message: message.clone(),
        });
        Ok(message)
    }

    async fn edit_message(
        &self,
        channel: ChannelId,
        message: MessageId,
        content: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.write().await;
        let history = state
            .messages
            .get_mut(&channel)
            .ok_or(PlatformError::UnknownChannel(channel))?;
        let stored = history
            .iter_mut()
            .find(|m| m.id == message)
            .ok_or(PlatformError::UnknownMessage(message, channel))?;
        stored.content = content.to_string();
        Ok(())
    }

    async fn delete_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.write().await;
        let history = state
            .messages
            .get_mut(&channel)
            .ok_or(PlatformError::UnknownChannel(channel))?;
        let before = history.len();
        history.retain(|m| m.id != message);
        if history.len() == before {
            return Err(PlatformError::UnknownMessage(message, channel));
        }
        state.deleted.push((channel, message));
        Ok(())
    }

    async fn send_log(
        &self,
        channel: ChannelId,
        log: &LogMessage,
    ) -> Result<ChatMessage, PlatformError> {
        {
            let mut state = self.state.write().await;
            if !state.channels.contains_key(&channel) {
                return Err(PlatformError::UnknownChannel(channel));
            }
            state.logs.push((channel, log.clone()));
        }
        debug!("log to {}: {}", channel, log.content);
        self.send_message(channel, &log.content).await
    }

    async fn add_reaction(
        &self,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.write().await;
        let known = state
            .messages
            .get(&channel)
            .map(|h| h.iter().any(|m| m.id == message))
            .unwrap_or(false);
        if !known {
            return Err(PlatformError::UnknownMessage(message, channel));
        }
        state.bot_reactions.push((channel, message, emoji.to_string()));
        Ok(())
    }

    async fn remove_reaction(
        &self,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.write().await;
        state
            .bot_reactions
            .retain(|(c, m, e)| !(*c == channel && *m == message && e == emoji));
        Ok(())
    }

    async fn rename_channel(&self, channel: ChannelId, name: &str) -> Result<(), PlatformError> {
        let mut state = self.state.write().await;
        let stored = state
            .channels
            .get_mut(&channel)
            .ok_or(PlatformError::UnknownChannel(channel))?;
        stored.name = name.to_string();
        Ok(())
    }

    async fn move_channel_to_category(
        &self,
        channel: ChannelId,
        category: ChannelId,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.write().await;
        let stored = state
            .channels
            .get_mut(&channel)
            .ok_or(PlatformError::UnknownChannel(channel))?;
        stored.category_id = Some(category);
        Ok(())
    }

    async fn recent_messages(
        &self,
        channel: ChannelId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, PlatformError> {
        let state = self.state.read().await;
        let history = state
            .messages
            .get(&channel)
            .ok_or(PlatformError::UnknownChannel(channel))?;
        Ok(history.iter().rev().take(limit).cloned().collect())
    }

    async fn fetch_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<ChatMessage, PlatformError> {
        let state = self.state.read().await;
        state
            .messages
            .get(&channel)
            .and_then(|h| h.iter().find(|m| m.id == message))
            .cloned()
            .ok_or(PlatformError::UnknownMessage(message, channel))
    }

    async fn fetch_user(&self, user: UserId) -> Result<ChatUser, PlatformError> {
        if user == self.bot.id {
            return Ok(self.bot.clone());
        }
        let state = self.state.read().await;
        for members in state.members.values() {
            if let Some(member) = members.get(&user) {
                return Ok(member.user.clone());
            }
        }
        Err(PlatformError::UnknownUser(user))
    }

    async fn kick_member(
        &self,
        server: ServerId,
        user: UserId,
        reason: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.write().await;
        let members = state
            .members
            .get_mut(&server)
            .ok_or(PlatformError::UnknownServer(server))?;
        if members.remove(&user).is_none() {
            return Err(PlatformError::UnknownUser(user));
        }
        state.kicks.push(KickRecord {
            server_id: server,
            user_id: user,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn add_roles(
        &self,
        server: ServerId,
        user: UserId,
        roles: &[RoleId],
    ) -> Result<(), PlatformError> {
        let mut state = self.state.write().await;
        let member = state
            .members
            .get_mut(&server)
            .and_then(|m| m.get_mut(&user))
            .ok_or(PlatformError::UnknownUser(user))?;
        for role in roles {
            if !member.role_ids.contains(role) {
                member.role_ids.push(*role);
            }
        }
        state.role_grants.push((server, user, roles.to_vec()));
        Ok(())
    }

    async fn remove_roles(
        &self,
        server: ServerId,
        user: UserId,
        roles: &[RoleId],
    ) -> Result<(), PlatformError> {
        let mut state = self.state.write().await;
        let member = state
            .members
            .get_mut(&server)
            .and_then(|m| m.get_mut(&user))
            .ok_or(PlatformError::UnknownUser(user))?;
        member.role_ids.retain(|r| !roles.contains(r));
        Ok(())
    }

    async fn edit_profile(&self, username: &str) -> Result<(), PlatformError> {
        self.state.write().await.profile_edits.push(username.to_string());
        Ok(())
    }

    async fn get_server(&self, server: ServerId) -> Option<Server> {
        self.state.read().await.servers.get(&server).cloned()
    }

    async fn get_channel(&self, channel: ChannelId) -> Option<Channel> {
        self.state.read().await.channels.get(&channel).cloned()
    }

    async fn get_role(&self, server: ServerId, role: RoleId) -> Option<Role> {
        self.state
            .read()
            .await
            .roles
            .get(&server)
            .and_then(|r| r.get(&role))
            .cloned()
    }

    async fn get_member(&self, server: ServerId, user: UserId) -> Option<Member> {
        self.state
            .read()
            .await
            .members
            .get(&server)
            .and_then(|m| m.get(&user))
            .cloned()
    }

    async fn server_ids(&self) -> Vec<ServerId> {
        self.state.read().await.servers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn human(id: UserId, name: &str) -> ChatUser {
        ChatUser {
            id,
            name: name.to_string(),
            bot: false,
            created_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_message_lifecycle() {
        let platform = MemoryPlatform::new("warden");
        platform.add_server(1, "testserver").await;
        platform.add_channel(10, 1, "general").await;

        let posted = platform.post_as(human(5, "alice"), 10, "hello").await;
        let fetched = platform.fetch_message(10, posted.id).await.unwrap();
        assert_eq!(fetched.content, "hello");

        platform.delete_message(10, posted.id).await.unwrap();
        assert!(platform.fetch_message(10, posted.id).await.is_err());
        assert_eq!(platform.deleted_messages().await, vec![(10, posted.id)]);
    }

    #[tokio::test]
    async fn test_recent_messages_newest_first() {
        let platform = MemoryPlatform::new("warden");
        platform.add_server(1, "testserver").await;
        platform.add_channel(10, 1, "general").await;

        platform.post_as(human(5, "alice"), 10, "first").await;
        platform.post_as(human(5, "alice"), 10, "second").await;

        let recent = platform.recent_messages(10, 1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content, "second");
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let platform = MemoryPlatform::new("warden");
        platform.add_server(1, "testserver").await;
        platform.add_channel(10, 1, "general").await;

        let mut receiver = platform.subscribe();
        platform.post_as(human(5, "alice"), 10, "ping").await;

        match receiver.recv().await.unwrap() {
            PlatformEvent::MessagePosted { message } => assert_eq!(message.content, "ping"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_kick_removes_member() {
        let platform = MemoryPlatform::new("warden");
        platform.add_server(1, "testserver").await;
        platform.add_member(1, human(5, "alice")).await;

        platform.kick_member(1, 5, "rule: no-links").await.unwrap();
        assert!(platform.get_member(1, 5).await.is_none());
        assert_eq!(platform.kicks().await[0].reason, "rule: no-links");
    }

    #[tokio::test]
    async fn test_edit_message_and_reactions() {
        let platform = MemoryPlatform::new("warden");
        platform.add_server(1, "testserver").await;
        platform.add_channel(10, 1, "general").await;

        let posted = platform.post_as(human(5, "alice"), 10, "tyop").await;
        platform.edit_message(10, posted.id, "typo").await.unwrap();
        assert_eq!(
            platform.fetch_message(10, posted.id).await.unwrap().content,
            "typo"
        );

        platform.add_reaction(10, posted.id, "✅").await.unwrap();
        platform.remove_reaction(10, posted.id, "✅").await.unwrap();
        assert!(platform.bot_reactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_edit_profile_recorded() {
        let platform = MemoryPlatform::new("warden");
        platform.edit_profile("warden-prime").await.unwrap();
        assert_eq!(platform.profile_edits().await, vec!["warden-prime".to_string()]);
    }

    #[tokio::test]
    async fn test_rename_and_move_channel() {
        let platform = MemoryPlatform::new("warden");
        platform.add_server(1, "testserver").await;
        platform.add_channel(10, 1, "✅free-chat-alpha").await;

        platform.rename_channel(10, "💬busy-chat-alpha").await.unwrap();
        platform.move_channel_to_category(10, 900).await.unwrap();

        let channel = platform.get_channel(10).await.unwrap();
        assert_eq!(channel.name, "💬busy-chat-alpha");
        assert_eq!(channel.category_id, Some(900));
    }
}
