// src/bot/audit.rs - Structured audit entries for the moderation log

use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bot::rules::RuleContext;
use crate::config::ConfigError;
use crate::types::{ChannelId, ChatMessage, ChatUser, LogMessage, RoleId};

/// Presentation options for audit entries. Missing values fall through
/// entry -> rule -> server options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogStyle {
    pub icon: Option<String>,
    pub color: Option<u32>,
    pub channel: Option<ChannelId>,
    pub notify_roles: Vec<RoleId>,
}

impl LogStyle {
    /// Overlay `self` on top of `fallback`, field by field.
    pub fn or(&self, fallback: &LogStyle) -> LogStyle {
        LogStyle {
            icon: self.icon.clone().or_else(|| fallback.icon.clone()),
            color: self.color.or(fallback.color),
            channel: self.channel.or(fallback.channel),
            notify_roles: if self.notify_roles.is_empty() {
                fallback.notify_roles.clone()
            } else {
                self.notify_roles.clone()
            },
        }
    }
}

/// One record destined for the moderation log channel. The title is the
/// rule name, filled in by the rule runner.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: Uuid,
    pub content: String,
    pub title: String,
    pub style: LogStyle,
    pub subject: Option<ChatUser>,
    pub quoted: Option<String>,
}

impl AuditEntry {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            title: String::new(),
            style: LogStyle::default(),
            subject: None,
            quoted: None,
        }
    }

    pub fn with_subject(mut self, subject: ChatUser) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn with_quote(mut self, message: &ChatMessage) -> Self {
        self.quoted = Some(quote_message(message));
        self
    }
}

/// Render a message as a quoted block for inclusion in an audit entry.
pub fn quote_message(message: &ChatMessage) -> String {
    if message.content.is_empty() {
        return "> (no content)".to_string();
    }
    message
        .content
        .lines()
        .map(|line| format!("> {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse a `#rrggbb` (or bare `rrggbb`) hex string into a color value.
pub fn color_from_hex(input: &str) -> Result<u32, ConfigError> {
    let digits = input.strip_prefix('#').unwrap_or(input);
    if digits.len() != 6 {
        return Err(ConfigError::InvalidColor(input.to_string()));
    }
    u32::from_str_radix(digits, 16).map_err(|_| ConfigError::InvalidColor(input.to_string()))
}

/// Send an entry to its resolved log channel. Resolution order for icon,
/// color, channel, and notify roles: entry -> rule -> server options. With
/// no channel anywhere the entry is dropped with a debug note.
pub async fn dispatch(entry: &AuditEntry, rule_style: &LogStyle, ctx: &RuleContext) -> Result<()> {
    let style = entry.style.or(&rule_style.or(&ctx.log_defaults));
    let Some(channel) = style.channel else {
        debug!("Audit entry '{}' has no log channel, dropping", entry.title);
        return Ok(());
    };

    let mut fields = Vec::new();
    if !ctx.compact_logs {
        if let Some(subject) = &entry.subject {
            fields.push(("Name".to_string(), subject.name.clone()));
            fields.push(("User ID".to_string(), subject.id.to_string()));
        }
    }

    let log = LogMessage {
        content: entry.content.clone(),
        title: entry.title.clone(),
        icon_url: if ctx.compact_logs { None } else { style.icon },
        color: style.color,
        fields,
        quoted: entry.quoted.clone(),
        mention_roles: style.notify_roles,
    };

    ctx.platform.send_log(channel, &log).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_from_hex() {
        assert_eq!(color_from_hex("#ff0000").unwrap(), 0xff0000);
        assert_eq!(color_from_hex("00ff7f").unwrap(), 0x00ff7f);
        assert!(color_from_hex("#f00").is_err());
        assert!(color_from_hex("#zzzzzz").is_err());
    }

    #[test]
    fn test_quote_message_multiline() {
        let message = ChatMessage {
            id: 1,
            server_id: Some(42),
            channel_id: 10,
            author: ChatUser {
                id: 5,
                name: "alice".to_string(),
                bot: false,
                created_at: None,
            },
            content: "first line\nsecond line".to_string(),
            timestamp: chrono::Utc::now(),
            embed_count: 0,
            attachment_count: 0,
        };
        assert_eq!(quote_message(&message), "> first line\n> second line");
    }

    #[test]
    fn test_style_resolution_order() {
        let server = LogStyle {
            icon: Some("server-icon".to_string()),
            color: Some(0x111111),
            channel: Some(1),
            notify_roles: vec![100],
        };
        let rule = LogStyle {
            icon: None,
            color: Some(0x222222),
            channel: None,
            notify_roles: vec![],
        };
        let entry = LogStyle {
            icon: None,
            color: None,
            channel: Some(3),
            notify_roles: vec![],
        };

        let resolved = entry.or(&rule.or(&server));
        // Entry wins where set, then rule, then server.
        assert_eq!(resolved.channel, Some(3));
        assert_eq!(resolved.color, Some(0x222222));
        assert_eq!(resolved.icon.as_deref(), Some("server-icon"));
        assert_eq!(resolved.notify_roles, vec![100]);
    }
}
