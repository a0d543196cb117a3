// src/bot/rules.rs - Per-server rule store and execution

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::RwLock;

use crate::bot::actions::Action;
use crate::bot::audit::{self, color_from_hex, LogStyle};
use crate::bot::conditions::Condition;
use crate::bot::extension::{Extension, ResolveError, ServerExtensionState};
use crate::bot::triggers::{Trigger, TriggerType};
use crate::config::{ConfigError, RuleConfig, RulesOptions};
use crate::platforms::ChatPlatform;
use crate::types::{ChatUser, PlatformEvent, ServerId};

/// Everything a condition or action needs besides the trigger itself.
#[derive(Clone)]
pub struct RuleContext {
    pub platform: Arc<dyn ChatPlatform>,
    pub bot: ChatUser,
    pub server_id: ServerId,
    pub log_defaults: LogStyle,
    pub compact_logs: bool,
}

/// A named binding of one trigger type to ordered conditions and actions.
/// Constructed once per (re)load and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub description: String,
    pub trigger_type: TriggerType,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    pub log: LogStyle,
}

impl Rule {
    pub fn from_config(config: &RuleConfig) -> Result<Rule, ConfigError> {
        let trigger_type = TriggerType::parse(&config.trigger_type)?;
        let conditions = config
            .conditions
            .iter()
            .map(Condition::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        let actions = config
            .actions
            .iter()
            .map(Action::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        let color = config
            .log_color
            .as_deref()
            .map(color_from_hex)
            .transpose()?;
        Ok(Rule {
            name: config.name.clone(),
            description: config.description.clone(),
            trigger_type,
            conditions,
            actions,
            log: LogStyle {
                icon: config.log_icon.clone(),
                color,
                channel: config.log_channel,
                notify_roles: config.notify_roles.clone().unwrap_or_default(),
            },
        })
    }
}

/// Per-server rule store, indexed by name and by trigger type with
/// insertion order preserved.
#[derive(Debug, Default)]
pub struct RuleIndex {
    rules: Vec<Rule>,
    by_name: HashMap<String, usize>,
    by_trigger: HashMap<TriggerType, Vec<usize>>,
}

impl RuleIndex {
    pub fn from_configs(configs: &[RuleConfig]) -> Result<RuleIndex, ConfigError> {
        let mut index = RuleIndex::default();
        for config in configs {
            let rule = Rule::from_config(config)?;
            if index.by_name.contains_key(&rule.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
            let position = index.rules.len();
            index.by_name.insert(rule.name.clone(), position);
            index
                .by_trigger
                .entry(rule.trigger_type)
                .or_default()
                .push(position);
            index.rules.push(rule);
        }
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.by_name.get(name).map(|&i| &self.rules[i])
    }

    pub fn names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    /// Rules bound to a trigger type, in registration order.
    pub fn for_trigger(&self, trigger_type: TriggerType) -> Vec<&Rule> {
        self.by_trigger
            .get(&trigger_type)
            .map(|positions| positions.iter().map(|&i| &self.rules[i]).collect())
            .unwrap_or_default()
    }
}

/// The rules engine for one server.
pub struct RulesState {
    server_id: ServerId,
    index: RuleIndex,
    platform: Arc<dyn ChatPlatform>,
    bot: ChatUser,
    compact_logs: bool,
    log_defaults: RwLock<LogStyle>,
}

impl RulesState {
    pub fn index(&self) -> &RuleIndex {
        &self.index
    }

    async fn context(&self) -> RuleContext {
        RuleContext {
            platform: self.platform.clone(),
            bot: self.bot.clone(),
            server_id: self.server_id,
            log_defaults: self.log_defaults.read().await.clone(),
            compact_logs: self.compact_logs,
        }
    }

    /// Run every rule bound to `trigger_type` against one event, in
    /// registration order. A trigger construction failure skips that rule.
    pub async fn dispatch(&self, trigger_type: TriggerType, event: &PlatformEvent) {
        for rule in self.index.for_trigger(trigger_type) {
            let trigger = match Trigger::from_event(trigger_type, event) {
                Ok(trigger) => trigger,
                Err(e) => {
                    debug!(
                        "Skipping rule '{}': trigger construction failed: {:#}",
                        rule.name, e
                    );
                    continue;
                }
            };
            self.run(rule, &trigger).await;
        }
    }

    /// Evaluate conditions in order, short-circuiting on the first false,
    /// then apply actions in order. Each action and its audit entry
    /// complete before the next action begins; a failed action is logged
    /// and later actions still run.
    pub async fn run(&self, rule: &Rule, trigger: &Trigger) {
        let ctx = self.context().await;
        for condition in &rule.conditions {
            if !condition.evaluate(trigger, &ctx).await {
                return;
            }
        }

        debug!("Rule '{}' matched on server {}", rule.name, self.server_id);
        for action in &rule.actions {
            match action.apply(trigger, &ctx).await {
                Ok(Some(mut entry)) => {
                    entry.title = rule.name.clone();
                    if let Err(e) = audit::dispatch(&entry, &rule.log, &ctx).await {
                        warn!(
                            "Failed to dispatch audit entry for rule '{}': {:#}",
                            rule.name, e
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Action failed in rule '{}': {:#}", rule.name, e);
                }
            }
        }
    }
}

#[async_trait]
impl ServerExtensionState for RulesState {
    /// Resolve the configured log channel; a dangling reference is logged
    /// and treated as "no log channel" from then on.
    async fn setup(&self) -> Result<()> {
        let configured = self.log_defaults.read().await.channel;
        if let Some(channel) = configured {
            if self.platform.get_channel(channel).await.is_none() {
                warn!(
                    "Server {}: log channel unusable: {}",
                    self.server_id,
                    ResolveError::Channel(channel)
                );
                self.log_defaults.write().await.channel = None;
            }
        }
        info!(
            "Rules engine ready on server {} with {} rule(s)",
            self.server_id,
            self.index.len()
        );
        Ok(())
    }

    async fn handle_event(&self, event: &PlatformEvent) {
        if let Some(trigger_type) = TriggerType::for_event(event) {
            self.dispatch(trigger_type, event).await;
        }
    }
}

/// Factory for per-server rules engines, with a typed registry the admin
/// surface reads from.
pub struct RulesExtension {
    platform: Arc<dyn ChatPlatform>,
    states: RwLock<HashMap<ServerId, Arc<RulesState>>>,
}

impl RulesExtension {
    pub fn new(platform: Arc<dyn ChatPlatform>) -> Self {
        Self {
            platform,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub async fn state_of(&self, server_id: ServerId) -> Option<Arc<RulesState>> {
        self.states.read().await.get(&server_id).cloned()
    }
}

#[async_trait]
impl Extension for RulesExtension {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn build(
        &self,
        server_id: ServerId,
        options: serde_json::Value,
    ) -> Result<Arc<dyn ServerExtensionState>> {
        let options: RulesOptions = serde_json::from_value(options)
            .with_context(|| format!("invalid rules options for server {}", server_id))?;

        let index = RuleIndex::from_configs(&options.rules)?;

        let color = options
            .log_color
            .as_deref()
            .map(color_from_hex)
            .transpose()?;
        let log_defaults = LogStyle {
            icon: options.log_icon,
            color,
            channel: options.log_channel,
            notify_roles: options.notify_roles,
        };

        let state = Arc::new(RulesState {
            server_id,
            index,
            platform: self.platform.clone(),
            bot: self.platform.bot_user(),
            compact_logs: options.compact_logs,
            log_defaults: RwLock::new(log_defaults),
        });
        self.states.write().await.insert(server_id, state.clone());
        Ok(state)
    }

    async fn drop_server(&self, server_id: ServerId) {
        self.states.write().await.remove(&server_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::memory::MemoryPlatform;
    use crate::types::ChatUser;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn user(id: u64, name: &str) -> ChatUser {
        ChatUser {
            id,
            name: name.to_string(),
            bot: false,
            created_at: None,
        }
    }

    async fn seeded() -> (Arc<MemoryPlatform>, RulesExtension) {
        let platform = Arc::new(MemoryPlatform::new("warden"));
        platform.add_server(42, "testserver").await;
        platform.add_channel(10, 42, "general").await;
        platform.add_channel(99, 42, "mod-log").await;
        platform.add_member(42, user(5, "alice")).await;
        let extension = RulesExtension::new(platform.clone());
        (platform, extension)
    }

    async fn built(
        extension: &RulesExtension,
        options: serde_json::Value,
    ) -> Arc<dyn ServerExtensionState> {
        let state = extension.build(42, options).await.unwrap();
        state.setup().await.unwrap();
        state
    }

    fn probe(result: bool) -> (Condition, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        (
            Condition::Probe {
                result,
                hits: hits.clone(),
            },
            hits,
        )
    }

    async fn run_probe_rule(conditions: Vec<Condition>) -> usize {
        let (platform, extension) = seeded().await;
        built(&extension, serde_json::json!({ "log_channel": 99 })).await;
        let state = extension.state_of(42).await.unwrap();

        let rule = Rule {
            name: "probe-rule".to_string(),
            description: String::new(),
            trigger_type: TriggerType::MessageSent,
            conditions,
            actions: vec![Action::SendReply {
                content: "matched".to_string(),
                include_mention: false,
            }],
            log: LogStyle::default(),
        };

        let message = platform.post_as(user(5, "alice"), 10, "hello").await;
        let event = PlatformEvent::MessagePosted { message };
        let trigger = Trigger::from_event(TriggerType::MessageSent, &event).unwrap();
        state.run(&rule, &trigger).await;

        platform
            .messages_in(10)
            .await
            .iter()
            .filter(|m| m.content == "matched")
            .count()
    }

    #[tokio::test]
    async fn test_conditions_short_circuit_in_order() {
        let (first, first_hits) = probe(false);
        let (second, second_hits) = probe(true);
        let replies = run_probe_rule(vec![first, second]).await;

        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
        assert_eq!(replies, 0);
    }

    #[tokio::test]
    async fn test_all_conditions_pass_then_actions_run() {
        let (first, first_hits) = probe(true);
        let (second, second_hits) = probe(true);
        let replies = run_probe_rule(vec![first, second]).await;

        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
        assert_eq!(replies, 1);
    }

    #[tokio::test]
    async fn test_zero_conditions_always_fires() {
        assert_eq!(run_probe_rule(vec![]).await, 1);
    }

    #[tokio::test]
    async fn test_rules_run_in_registration_order() {
        let (platform, extension) = seeded().await;
        let state = built(
            &extension,
            serde_json::json!({
                "rules": [
                    {
                        "name": "first",
                        "trigger_type": "MESSAGE_SENT",
                        "actions": [{ "type": "SEND_REPLY", "content": "one" }],
                    },
                    {
                        "name": "second",
                        "trigger_type": "MESSAGE_SENT",
                        "actions": [{ "type": "SEND_REPLY", "content": "two" }],
                    },
                ],
            }),
        )
        .await;

        let message = platform.post_as(user(5, "alice"), 10, "hello").await;
        state
            .handle_event(&PlatformEvent::MessagePosted { message })
            .await;

        let replies: Vec<String> = platform
            .messages_in(10)
            .await
            .iter()
            .skip(1)
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(replies, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_action_does_not_abort_rule() {
        let (platform, extension) = seeded().await;
        let state = built(
            &extension,
            serde_json::json!({
                "rules": [{
                    "name": "kick-then-reply",
                    "trigger_type": "MESSAGE_SENT",
                    "actions": [
                        { "type": "KICK_AUTHOR" },
                        { "type": "SEND_REPLY", "content": "still here" },
                    ],
                }],
            }),
        )
        .await;

        // Author 77 is not a member, so the kick fails.
        let message = platform.post_as(user(77, "ghost"), 10, "hello").await;
        state
            .handle_event(&PlatformEvent::MessagePosted { message })
            .await;

        let contents: Vec<String> = platform
            .messages_in(10)
            .await
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert!(contents.contains(&"still here".to_string()));
    }

    #[tokio::test]
    async fn test_delete_and_quote_scenario() {
        let (platform, extension) = seeded().await;
        let state = built(
            &extension,
            serde_json::json!({
                "log_channel": 99,
                "rules": [{
                    "name": "no-links",
                    "trigger_type": "MESSAGE_SENT",
                    "conditions": [
                        { "type": "MESSAGE_CONTAINS", "content": "http://" },
                    ],
                    "actions": [{ "type": "DELETE_MESSAGE" }],
                }],
            }),
        )
        .await;

        let message = platform
            .post_as(user(5, "alice"), 10, "check http://bad.example/")
            .await;
        let message_id = message.id;
        state
            .handle_event(&PlatformEvent::MessagePosted { message })
            .await;

        assert_eq!(platform.deleted_messages().await, vec![(10, message_id)]);

        let logs = platform.sent_logs().await;
        assert_eq!(logs.len(), 1);
        let (channel, log) = &logs[0];
        assert_eq!(*channel, 99);
        assert_eq!(log.title, "no-links");
        assert!(log
            .fields
            .contains(&("Name".to_string(), "alice".to_string())));
        assert!(log
            .fields
            .contains(&("User ID".to_string(), "5".to_string())));
        assert_eq!(log.quoted.as_deref(), Some("> check http://bad.example/"));
    }

    #[tokio::test]
    async fn test_member_unban_audit_scenario() {
        let (platform, extension) = seeded().await;
        let state = built(
            &extension,
            serde_json::json!({
                "log_channel": 99,
                "rules": [{
                    "name": "unban-log",
                    "trigger_type": "MEMBER_UNBANNED",
                    "actions": [{ "type": "LOG_MEMBER_UNBANNED" }],
                }],
            }),
        )
        .await;

        state
            .handle_event(&PlatformEvent::MemberUnbanned {
                server_id: 42,
                user: user(5, "alice"),
            })
            .await;

        let logs = platform.sent_logs().await;
        assert_eq!(logs.len(), 1);
        let log = &logs[0].1;
        assert_eq!(log.content, "<@5> was unbanned.");
        assert!(log
            .fields
            .contains(&("Name".to_string(), "alice".to_string())));
        assert!(log
            .fields
            .contains(&("User ID".to_string(), "5".to_string())));
        // No chat side effects beyond the log itself.
        assert!(platform.deleted_messages().await.is_empty());
        assert!(platform.kicks().await.is_empty());
    }

    #[tokio::test]
    async fn test_dangling_log_channel_resolved_to_absent() {
        let (platform, extension) = seeded().await;
        let state = built(
            &extension,
            serde_json::json!({
                "log_channel": 12345,
                "rules": [{
                    "name": "no-links",
                    "trigger_type": "MESSAGE_SENT",
                    "actions": [{ "type": "DELETE_MESSAGE" }],
                }],
            }),
        )
        .await;

        let message = platform.post_as(user(5, "alice"), 10, "anything").await;
        state
            .handle_event(&PlatformEvent::MessagePosted { message })
            .await;

        // The delete happened but the entry had nowhere to go.
        assert_eq!(platform.deleted_messages().await.len(), 1);
        assert!(platform.sent_logs().await.is_empty());
    }

    #[tokio::test]
    async fn test_bad_rule_aborts_server_build() {
        let (_, extension) = seeded().await;
        let result = extension
            .build(
                42,
                serde_json::json!({
                    "rules": [{
                        "name": "broken",
                        "trigger_type": "MESSAGE_SENT",
                        "conditions": [{ "type": "NO_SUCH_CONDITION" }],
                        "actions": [],
                    }],
                }),
            )
            .await;
        assert!(result.is_err());
        assert!(extension.state_of(42).await.is_none());
    }

    #[test]
    fn test_index_duplicate_names_rejected() {
        let configs: Vec<RuleConfig> = serde_json::from_value(serde_json::json!([
            { "name": "dup", "trigger_type": "MESSAGE_SENT" },
            { "name": "dup", "trigger_type": "MESSAGE_DELETED" },
        ]))
        .unwrap();
        assert!(RuleIndex::from_configs(&configs).is_err());
    }

    #[test]
    fn test_index_preserves_registration_order() {
        let configs: Vec<RuleConfig> = serde_json::from_value(serde_json::json!([
            { "name": "a", "trigger_type": "MESSAGE_SENT" },
            { "name": "b", "trigger_type": "MESSAGE_DELETED" },
            { "name": "c", "trigger_type": "MESSAGE_SENT" },
        ]))
        .unwrap();
        let index = RuleIndex::from_configs(&configs).unwrap();

        let sent: Vec<&str> = index
            .for_trigger(TriggerType::MessageSent)
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(sent, vec!["a", "c"]);
        assert!(index.get("b").is_some());
        assert!(index.for_trigger(TriggerType::MemberJoined).is_empty());
    }
}
