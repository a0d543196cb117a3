// src/bot/admin.rs - Administrative surface and user feedback signals

use std::sync::Arc;

use log::{error, info, warn};
use thiserror::Error;

use crate::bot::extension::ExtensionHost;
use crate::bot::helpchat::{ChannelState, HelpChat, HelpChatExtension};
use crate::bot::rules::RulesExtension;
use crate::config::ConfigManager;
use crate::platforms::ChatPlatform;
use crate::types::{ChannelId, MessageId, ServerId};

/// Invalid administrator input, surfaced to the caller as a visible
/// failure signal.
#[derive(Debug, Error)]
pub enum UserInputError {
    #[error("no rules are configured for server {0}")]
    UnknownServer(ServerId),
    #[error("no rule named '{0}'")]
    UnknownRule(String),
    #[error("'{0}' is not a channel state")]
    UnknownState(String),
    #[error("channel {0} is not a managed help channel")]
    UnmanagedChannel(ChannelId),
    #[error("no help channels are configured for server {0}")]
    NoHelpChat(ServerId),
}

/// Outcome signal shown to the administrator, usually as a reaction on
/// the invoking message. The emoji mapping is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    Success,
    NoOp,
    UnknownInput,
    Denied,
    Failed,
    Cooldown,
}

impl Feedback {
    pub fn emoji(&self) -> &'static str {
        match self {
            Feedback::Success => "✅",
            Feedback::NoOp => "🆗",
            Feedback::UnknownInput => "❓",
            Feedback::Denied => "🚫",
            Feedback::Failed => "⚠️",
            Feedback::Cooldown => "⏳",
        }
    }
}

/// The enumerated administrative operations. Permission checking belongs
/// to the command layer invoking this; callers pass already-authorized
/// requests.
pub struct AdminApi {
    platform: Arc<dyn ChatPlatform>,
    config: Arc<ConfigManager>,
    host: Arc<ExtensionHost>,
    rules: Arc<RulesExtension>,
    helpchat: Arc<HelpChatExtension>,
}

impl AdminApi {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        config: Arc<ConfigManager>,
        host: Arc<ExtensionHost>,
        rules: Arc<RulesExtension>,
        helpchat: Arc<HelpChatExtension>,
    ) -> Self {
        Self {
            platform,
            config,
            host,
            rules,
            helpchat,
        }
    }

    /// Re-read the configuration file and rebuild every extension's
    /// server states.
    pub async fn reload(&self) -> Feedback {
        let config = match self.config.load().await {
            Ok(config) => config,
            Err(e) => {
                error!("Reload failed while loading configuration: {:#}", e);
                return Feedback::Failed;
            }
        };
        if let Err(e) = self.host.apply_config(&config).await {
            error!("Reload failed while applying configuration: {:#}", e);
            return Feedback::Failed;
        }
        self.host.load_all().await;
        info!("Configuration reloaded");
        Feedback::Success
    }

    pub async fn list_rules(&self, server_id: ServerId) -> Result<Vec<String>, UserInputError> {
        let state = self
            .rules
            .state_of(server_id)
            .await
            .ok_or(UserInputError::UnknownServer(server_id))?;
        Ok(state.index().names().iter().map(|s| s.to_string()).collect())
    }

    /// Human-readable summary of one rule.
    pub async fn show_rule(
        &self,
        server_id: ServerId,
        name: &str,
    ) -> Result<String, UserInputError> {
        let state = self
            .rules
            .state_of(server_id)
            .await
            .ok_or(UserInputError::UnknownServer(server_id))?;
        let rule = state
            .index()
            .get(name)
            .ok_or_else(|| UserInputError::UnknownRule(name.to_string()))?;
        let mut lines = vec![format!("**{}** on {}", rule.name, rule.trigger_type)];
        if !rule.description.is_empty() {
            lines.push(rule.description.clone());
        }
        lines.push(format!(
            "{} condition(s), {} action(s)",
            rule.conditions.len(),
            rule.actions.len()
        ));
        Ok(lines.join("\n"))
    }

    async fn helpchat_state(&self, server_id: ServerId) -> Result<Arc<HelpChat>, UserInputError> {
        self.helpchat
            .state_of(server_id)
            .await
            .ok_or(UserInputError::NoHelpChat(server_id))
    }

    pub async fn start_poller(&self, server_id: ServerId) -> Result<Feedback, UserInputError> {
        let helpchat = self.helpchat_state(server_id).await?;
        Ok(if helpchat.start_polling().await {
            Feedback::Success
        } else {
            Feedback::NoOp
        })
    }

    pub async fn stop_poller(&self, server_id: ServerId) -> Result<Feedback, UserInputError> {
        let helpchat = self.helpchat_state(server_id).await?;
        Ok(if helpchat.stop_polling().await {
            Feedback::Success
        } else {
            Feedback::NoOp
        })
    }

    pub async fn poll_now(&self, server_id: ServerId) -> Result<Feedback, UserInputError> {
        let helpchat = self.helpchat_state(server_id).await?;
        helpchat.poll_now().await;
        Ok(Feedback::Success)
    }

    /// Force a managed channel into a named state.
    pub async fn force_channel_state(
        &self,
        server_id: ServerId,
        channel: ChannelId,
        state_name: &str,
    ) -> Result<Feedback, UserInputError> {
        let helpchat = self.helpchat_state(server_id).await?;
        let state = ChannelState::parse(state_name)
            .ok_or_else(|| UserInputError::UnknownState(state_name.to_string()))?;
        if !helpchat.is_managed(channel).await {
            return Err(UserInputError::UnmanagedChannel(channel));
        }
        match helpchat.force_state(channel, state).await {
            Ok(()) => Ok(Feedback::Success),
            Err(e) => {
                error!(
                    "Forcing channel {} to {} failed: {:#}",
                    channel,
                    state.as_str(),
                    e
                );
                Ok(Feedback::Failed)
            }
        }
    }

    pub async fn hoist_sync(&self, server_id: ServerId) -> Result<Feedback, UserInputError> {
        let helpchat = self.helpchat_state(server_id).await?;
        helpchat.hoist_sync().await;
        Ok(Feedback::Success)
    }

    /// Signal an outcome by reacting to the invoking message.
    pub async fn acknowledge(&self, channel: ChannelId, message: MessageId, feedback: Feedback) {
        if let Err(e) = self
            .platform
            .add_reaction(channel, message, feedback.emoji())
            .await
        {
            warn!("Failed to acknowledge with {}: {}", feedback.emoji(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::extension::Extension;
    use crate::platforms::memory::MemoryPlatform;
    use tempfile::tempdir;

    const CONFIG: &str = r#"
extensions:
  rules:
    "42":
      rules:
        - name: no-links
          description: drop link spam
          trigger_type: MESSAGE_SENT
          conditions:
            - type: MESSAGE_CONTAINS
              content: "http://"
          actions:
            - type: DELETE_MESSAGE
  helpchat:
    "42":
      channels:
        chat-alpha: 201
        chat-omega: 202
      auto_poll: false
"#;

    async fn fixture() -> (Arc<MemoryPlatform>, AdminApi, tempfile::TempDir) {
        let platform = Arc::new(MemoryPlatform::new("warden"));
        platform.add_server(42, "testserver").await;
        platform.add_channel(201, 42, "✅free-chat-alpha").await;
        platform.add_channel(202, 42, "👋ask-here").await;

        let dir = tempdir().unwrap();
        let path = dir.path().join("wardenbot.yaml");
        std::fs::write(&path, CONFIG).unwrap();

        let config = Arc::new(ConfigManager::new(&path));
        let rules = Arc::new(RulesExtension::new(platform.clone()));
        let helpchat = Arc::new(HelpChatExtension::new(platform.clone()));
        let host = Arc::new(ExtensionHost::new(
            platform.clone(),
            vec![
                rules.clone() as Arc<dyn Extension>,
                helpchat.clone() as Arc<dyn Extension>,
            ],
        ));
        let admin = AdminApi::new(platform.clone(), config, host, rules, helpchat);
        (platform, admin, dir)
    }

    #[test]
    fn test_feedback_emoji_mapping_is_fixed() {
        assert_eq!(Feedback::Success.emoji(), "✅");
        assert_eq!(Feedback::NoOp.emoji(), "🆗");
        assert_eq!(Feedback::UnknownInput.emoji(), "❓");
        assert_eq!(Feedback::Denied.emoji(), "🚫");
        assert_eq!(Feedback::Failed.emoji(), "⚠️");
        assert_eq!(Feedback::Cooldown.emoji(), "⏳");
    }

    #[tokio::test]
    async fn test_reload_then_list_and_show() {
        let (_, admin, _dir) = fixture().await;

        assert_eq!(admin.reload().await, Feedback::Success);

        let names = admin.list_rules(42).await.unwrap();
        assert_eq!(names, vec!["no-links".to_string()]);

        let shown = admin.show_rule(42, "no-links").await.unwrap();
        assert!(shown.contains("no-links"));
        assert!(shown.contains("MESSAGE_SENT"));
        assert!(shown.contains("drop link spam"));

        assert!(matches!(
            admin.show_rule(42, "missing").await,
            Err(UserInputError::UnknownRule(_))
        ));
        assert!(matches!(
            admin.list_rules(77).await,
            Err(UserInputError::UnknownServer(77))
        ));
    }

    #[tokio::test]
    async fn test_poller_controls() {
        let (_, admin, _dir) = fixture().await;
        admin.reload().await;

        assert_eq!(admin.start_poller(42).await.unwrap(), Feedback::Success);
        assert_eq!(admin.start_poller(42).await.unwrap(), Feedback::NoOp);
        assert_eq!(admin.poll_now(42).await.unwrap(), Feedback::Success);
        assert_eq!(admin.stop_poller(42).await.unwrap(), Feedback::Success);
        assert_eq!(admin.stop_poller(42).await.unwrap(), Feedback::NoOp);

        assert!(matches!(
            admin.start_poller(77).await,
            Err(UserInputError::NoHelpChat(77))
        ));
    }

    #[tokio::test]
    async fn test_force_channel_state() {
        let (platform, admin, _dir) = fixture().await;
        admin.reload().await;

        assert_eq!(
            admin
                .force_channel_state(42, 201, "busy")
                .await
                .unwrap(),
            Feedback::Success
        );
        assert_eq!(
            platform.channel_name(201).await.unwrap(),
            "💬busy-chat-alpha"
        );

        assert!(matches!(
            admin.force_channel_state(42, 201, "purple").await,
            Err(UserInputError::UnknownState(_))
        ));
        assert!(matches!(
            admin.force_channel_state(42, 999, "busy").await,
            Err(UserInputError::UnmanagedChannel(999))
        ));
    }

    #[tokio::test]
    async fn test_acknowledge_reacts_on_message() {
        let (platform, admin, _dir) = fixture().await;
        admin.reload().await;

        let invoking = platform
            .post_as(
                crate::types::ChatUser {
                    id: 5,
                    name: "alice".to_string(),
                    bot: false,
                    created_at: None,
                },
                201,
                "!warden reload",
            )
            .await;
        admin.acknowledge(201, invoking.id, Feedback::Success).await;

        assert_eq!(
            platform.bot_reactions().await,
            vec![(201, invoking.id, "✅".to_string())]
        );
    }
}
