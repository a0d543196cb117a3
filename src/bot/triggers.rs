// src/bot/triggers.rs - Trigger types and per-event trigger views

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::types::{
    ChannelId, ChatMessage, ChatUser, Member, PlatformEvent, Reaction, ServerId,
};

/// The closed set of event kinds a rule can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    MessageSent,
    MessageDeleted,
    MessageEdited,
    ReactionAdded,
    MemberJoined,
    MemberLeft,
    MemberBanned,
    MemberUnbanned,
}

impl TriggerType {
    pub const ALL: [TriggerType; 8] = [
        TriggerType::MessageSent,
        TriggerType::MessageDeleted,
        TriggerType::MessageEdited,
        TriggerType::ReactionAdded,
        TriggerType::MemberJoined,
        TriggerType::MemberLeft,
        TriggerType::MemberBanned,
        TriggerType::MemberUnbanned,
    ];

    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name {
            "MESSAGE_SENT" => Ok(TriggerType::MessageSent),
            "MESSAGE_DELETED" => Ok(TriggerType::MessageDeleted),
            "MESSAGE_EDITED" => Ok(TriggerType::MessageEdited),
            "REACTION_ADDED" => Ok(TriggerType::ReactionAdded),
            "MEMBER_JOINED" => Ok(TriggerType::MemberJoined),
            "MEMBER_LEFT" => Ok(TriggerType::MemberLeft),
            "MEMBER_BANNED" => Ok(TriggerType::MemberBanned),
            "MEMBER_UNBANNED" => Ok(TriggerType::MemberUnbanned),
            other => Err(ConfigError::UnknownKind {
                family: "trigger",
                kind: other.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::MessageSent => "MESSAGE_SENT",
            TriggerType::MessageDeleted => "MESSAGE_DELETED",
            TriggerType::MessageEdited => "MESSAGE_EDITED",
            TriggerType::ReactionAdded => "REACTION_ADDED",
            TriggerType::MemberJoined => "MEMBER_JOINED",
            TriggerType::MemberLeft => "MEMBER_LEFT",
            TriggerType::MemberBanned => "MEMBER_BANNED",
            TriggerType::MemberUnbanned => "MEMBER_UNBANNED",
        }
    }

    /// The trigger type, if any, that fires for a given platform event.
    pub fn for_event(event: &PlatformEvent) -> Option<TriggerType> {
        match event {
            PlatformEvent::MessagePosted { .. } => Some(TriggerType::MessageSent),
            PlatformEvent::MessageEdited { .. } => Some(TriggerType::MessageEdited),
            PlatformEvent::MessageDeleted { .. } => Some(TriggerType::MessageDeleted),
            PlatformEvent::ReactionAdded { .. } => Some(TriggerType::ReactionAdded),
            PlatformEvent::MemberJoined { .. } => Some(TriggerType::MemberJoined),
            PlatformEvent::MemberLeft { .. } => Some(TriggerType::MemberLeft),
            PlatformEvent::MemberBanned { .. } => Some(TriggerType::MemberBanned),
            PlatformEvent::MemberUnbanned { .. } => Some(TriggerType::MemberUnbanned),
            PlatformEvent::Ready { .. } | PlatformEvent::MemberUpdated { .. } => None,
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A read-only view over a single event, constructed per rule dispatch
/// and discarded after the rule runs.
///
/// The trigger type determines which fields are populated. Accessing a
/// field the variant does not guarantee yields `None`, never a fabricated
/// value.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub trigger_type: TriggerType,
    pub server_id: ServerId,
    message: Option<ChatMessage>,
    reaction: Option<Reaction>,
    member: Option<Member>,
    actor: Option<ChatUser>,
    author: Option<ChatUser>,
    channel_id: Option<ChannelId>,
}

impl Trigger {
    /// Build the view for `trigger_type` from a platform event. Fails when
    /// the event shape does not match the trigger type, or when the event
    /// carries no server (direct messages are not routed to rules).
    pub fn from_event(trigger_type: TriggerType, event: &PlatformEvent) -> Result<Trigger> {
        match (trigger_type, event) {
            (
                TriggerType::MessageSent,
                PlatformEvent::MessagePosted { message },
            )
            | (
                TriggerType::MessageEdited,
                PlatformEvent::MessageEdited { message },
            )
            | (
                TriggerType::MessageDeleted,
                PlatformEvent::MessageDeleted { message },
            ) => Self::from_message(trigger_type, message),
            (
                TriggerType::ReactionAdded,
                PlatformEvent::ReactionAdded {
                    reaction,
                    message,
                    reactor,
                },
            ) => Self::from_reaction(reaction, message, reactor),
            (TriggerType::MemberJoined, PlatformEvent::MemberJoined { member })
            | (TriggerType::MemberLeft, PlatformEvent::MemberLeft { member })
            | (TriggerType::MemberBanned, PlatformEvent::MemberBanned { member }) => {
                Ok(Self::from_member(trigger_type, member))
            }
            (
                TriggerType::MemberUnbanned,
                PlatformEvent::MemberUnbanned { server_id, user },
            ) => Ok(Self::from_unban(*server_id, user)),
            (trigger_type, event) => {
                bail!("event {:?} does not match trigger type {}", event, trigger_type)
            }
        }
    }

    fn from_message(trigger_type: TriggerType, message: &ChatMessage) -> Result<Trigger> {
        let Some(server_id) = message.server_id else {
            bail!("message {} has no server", message.id);
        };
        Ok(Trigger {
            trigger_type,
            server_id,
            channel_id: Some(message.channel_id),
            author: Some(message.author.clone()),
            actor: Some(message.author.clone()),
            message: Some(message.clone()),
            reaction: None,
            member: None,
        })
    }

    fn from_reaction(
        reaction: &Reaction,
        message: &ChatMessage,
        reactor: &ChatUser,
    ) -> Result<Trigger> {
        let Some(server_id) = reaction.server_id else {
            bail!("reaction on message {} has no server", reaction.message_id);
        };
        Ok(Trigger {
            trigger_type: TriggerType::ReactionAdded,
            server_id,
            channel_id: Some(reaction.channel_id),
            author: Some(message.author.clone()),
            actor: Some(reactor.clone()),
            message: Some(message.clone()),
            reaction: Some(reaction.clone()),
            member: None,
        })
    }

    fn from_member(trigger_type: TriggerType, member: &Member) -> Trigger {
        Trigger {
            trigger_type,
            server_id: member.server_id,
            channel_id: None,
            author: Some(member.user.clone()),
            actor: Some(member.user.clone()),
            message: None,
            reaction: None,
            member: Some(member.clone()),
        }
    }

    fn from_unban(server_id: ServerId, user: &ChatUser) -> Trigger {
        let member = Member {
            user: user.clone(),
            server_id,
            joined_at: None,
            role_ids: Vec::new(),
        };
        Trigger {
            trigger_type: TriggerType::MemberUnbanned,
            server_id,
            channel_id: None,
            author: Some(user.clone()),
            actor: Some(user.clone()),
            message: None,
            reaction: None,
            member: Some(member),
        }
    }

    pub fn message(&self) -> Option<&ChatMessage> {
        self.message.as_ref()
    }

    pub fn reaction(&self) -> Option<&Reaction> {
        self.reaction.as_ref()
    }

    pub fn member(&self) -> Option<&Member> {
        self.member.as_ref()
    }

    pub fn actor(&self) -> Option<&ChatUser> {
        self.actor.as_ref()
    }

    pub fn author(&self) -> Option<&ChatUser> {
        self.author.as_ref()
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.channel_id
    }
}
