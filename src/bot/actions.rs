// src/bot/actions.rs - Rule actions: side effects plus optional audit entries

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::bot::audit::AuditEntry;
use crate::bot::rules::RuleContext;
use crate::bot::triggers::Trigger;
use crate::config::{parse_kind_options, ConfigError, DirectiveConfig};
use crate::types::{ChannelId, RoleId};

/// A side effect applied when a rule fires, configured once at (re)load.
///
/// `apply` runs the platform side effect and returns the audit entry to
/// emit, if any. The `Log*` family has no chat side effect and only
/// produces an entry.
#[derive(Debug, Clone)]
pub enum Action {
    SendReply {
        content: String,
        include_mention: bool,
    },
    DeleteMessage,
    KickAuthor,
    AddRolesToAuthor {
        roles: Vec<RoleId>,
        log_to_channel: Option<ChannelId>,
    },
    AddReactions {
        reactions: Vec<String>,
    },
    LogMemberJoined,
    LogMemberLeft,
    LogMemberUnbanned,
    LogCustom {
        content: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReplyOptions {
    content: String,
    #[serde(default)]
    include_mention: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RolesOptions {
    roles: Vec<RoleId>,
    log_to_channel: Option<ChannelId>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReactionsOptions {
    reactions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CustomLogOptions {
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmptyOptions {}

impl Action {
    pub fn from_config(config: &DirectiveConfig) -> Result<Action, ConfigError> {
        let kind = config.kind.as_str();
        match kind {
            "SEND_REPLY" => {
                let opts: ReplyOptions = parse_kind_options(kind, &config.options)?;
                Ok(Action::SendReply {
                    content: opts.content,
                    include_mention: opts.include_mention,
                })
            }
            "DELETE_MESSAGE" => {
                let _: EmptyOptions = parse_kind_options(kind, &config.options)?;
                Ok(Action::DeleteMessage)
            }
            "KICK_AUTHOR" => {
                let _: EmptyOptions = parse_kind_options(kind, &config.options)?;
                Ok(Action::KickAuthor)
            }
            "ADD_ROLES_TO_AUTHOR" => {
                let opts: RolesOptions = parse_kind_options(kind, &config.options)?;
                if opts.roles.is_empty() {
                    return Err(ConfigError::InvalidOptions {
                        kind: kind.to_string(),
                        message: "roles must not be empty".to_string(),
                    });
                }
                Ok(Action::AddRolesToAuthor {
                    roles: opts.roles,
                    log_to_channel: opts.log_to_channel,
                })
            }
            "ADD_REACTIONS" => {
                let opts: ReactionsOptions = parse_kind_options(kind, &config.options)?;
                if opts.reactions.is_empty() {
                    return Err(ConfigError::InvalidOptions {
                        kind: kind.to_string(),
                        message: "reactions must not be empty".to_string(),
                    });
                }
                Ok(Action::AddReactions {
                    reactions: opts.reactions,
                })
            }
            "LOG_MEMBER_JOINED" => {
                let _: EmptyOptions = parse_kind_options(kind, &config.options)?;
                Ok(Action::LogMemberJoined)
            }
            "LOG_MEMBER_LEFT" => {
                let _: EmptyOptions = parse_kind_options(kind, &config.options)?;
                Ok(Action::LogMemberLeft)
            }
            "LOG_MEMBER_UNBANNED" => {
                let _: EmptyOptions = parse_kind_options(kind, &config.options)?;
                Ok(Action::LogMemberUnbanned)
            }
            "LOG_CUSTOM" => {
                let opts: CustomLogOptions = parse_kind_options(kind, &config.options)?;
                Ok(Action::LogCustom {
                    content: opts.content,
                })
            }
            other => Err(ConfigError::UnknownKind {
                family: "action",
                kind: other.to_string(),
            }),
        }
    }

    /// Run the side effect and produce the audit entry, if any. A failure
    /// here is logged by the rule runner and does not abort later actions.
    pub async fn apply(&self, trigger: &Trigger, ctx: &RuleContext) -> Result<Option<AuditEntry>> {
        match self {
            Action::SendReply {
                content,
                include_mention,
            } => {
                let channel = trigger.channel_id().context("trigger has no channel")?;
                let reply = if *include_mention {
                    let author = trigger.author().context("trigger has no author")?;
                    format!("{} {}", author.mention(), content)
                } else {
                    content.clone()
                };
                ctx.platform.send_message(channel, &reply).await?;
                Ok(None)
            }
            Action::DeleteMessage => {
                let message = trigger.message().context("trigger has no message")?;
                ctx.platform
                    .delete_message(message.channel_id, message.id)
                    .await?;
                Ok(Some(
                    AuditEntry::new(format!("{}'s message was deleted.", message.author.mention()))
                        .with_subject(message.author.clone())
                        .with_quote(message),
                ))
            }
            Action::KickAuthor => {
                let author = trigger.author().context("trigger has no author")?;
                ctx.platform
                    .kick_member(trigger.server_id, author.id, "rule violation")
                    .await?;
                Ok(Some(
                    AuditEntry::new(format!("{} was kicked.", author.mention()))
                        .with_subject(author.clone()),
                ))
            }
            Action::AddRolesToAuthor {
                roles,
                log_to_channel,
            } => {
                let author = trigger.author().context("trigger has no author")?;
                ctx.platform
                    .add_roles(trigger.server_id, author.id, roles)
                    .await?;
                let notice = format!(
                    "Added {} role(s) to {}.",
                    roles.len(),
                    author.mention()
                );
                if let Some(channel) = log_to_channel {
                    ctx.platform.send_message(*channel, &notice).await?;
                }
                Ok(Some(AuditEntry::new(notice).with_subject(author.clone())))
            }
            Action::AddReactions { reactions } => {
                let message = trigger.message().context("trigger has no message")?;
                for emoji in reactions {
                    ctx.platform
                        .add_reaction(message.channel_id, message.id, emoji)
                        .await?;
                }
                Ok(None)
            }
            Action::LogMemberJoined => {
                let member = trigger.member().context("trigger has no member")?;
                Ok(Some(
                    AuditEntry::new(format!("{} joined the server.", member.mention()))
                        .with_subject(member.user.clone()),
                ))
            }
            Action::LogMemberLeft => {
                let member = trigger.member().context("trigger has no member")?;
                Ok(Some(
                    AuditEntry::new(format!("{} left the server.", member.mention()))
                        .with_subject(member.user.clone()),
                ))
            }
            Action::LogMemberUnbanned => {
                let member = trigger.member().context("trigger has no member")?;
                Ok(Some(
                    AuditEntry::new(format!("{} was unbanned.", member.mention()))
                        .with_subject(member.user.clone()),
                ))
            }
            Action::LogCustom { content } => {
                let rendered = render_template(content, trigger);
                let subject = trigger
                    .actor()
                    .or_else(|| trigger.author())
                    .cloned();
                let mut entry = AuditEntry::new(rendered);
                if let Some(subject) = subject {
                    entry = entry.with_subject(subject);
                }
                Ok(Some(entry))
            }
        }
    }
}

/// Fill `{actor}`, `{author}`, `{channel}`, `{member}`, `{message}`, and
/// `{reaction}` slots from the trigger. Slots the trigger cannot supply
/// are left untouched rather than filled with a fabricated value.
pub fn render_template(template: &str, trigger: &Trigger) -> String {
    let mut out = template.to_string();
    if let Some(actor) = trigger.actor() {
        out = out.replace("{actor}", &actor.mention());
    }
    if let Some(author) = trigger.author() {
        out = out.replace("{author}", &author.mention());
    }
    if let Some(channel) = trigger.channel_id() {
        out = out.replace("{channel}", &format!("<#{}>", channel));
    }
    if let Some(member) = trigger.member() {
        out = out.replace("{member}", &member.mention());
    }
    if let Some(message) = trigger.message() {
        out = out.replace("{message}", &message.content);
    }
    if let Some(reaction) = trigger.reaction() {
        out = out.replace("{reaction}", &reaction.emoji);
    }
    out
}
