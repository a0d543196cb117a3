// src/config/mod.rs - Configuration schema, resolution, and hot-reload

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Duration;

use crate::types::{ChannelId, RoleId, ServerId};

/// Malformed options, unknown kinds, or missing required fields. Surfaced
/// to the loader; aborts construction of the offending rule or server
/// state only.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown {family} kind '{kind}'")]
    UnknownKind { family: &'static str, kind: String },
    #[error("invalid options for {kind}: {message}")]
    InvalidOptions { kind: String, message: String },
    #[error("invalid server id '{0}' (expected a numeric identifier)")]
    InvalidServerId(String),
    #[error("invalid color '{0}' (expected hex like '#rrggbb')")]
    InvalidColor(String),
    #[error("invalid config url '{url}': {message}")]
    InvalidUrl { url: String, message: String },
    #[error("failed to fetch config from {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("{0}")]
    Invalid(String),
}

/// Deserialize a per-kind option map, naming the kind in the failure.
pub(crate) fn parse_kind_options<T: DeserializeOwned>(
    kind: &str,
    options: &serde_json::Value,
) -> Result<T, ConfigError> {
    serde_json::from_value(options.clone()).map_err(|e| ConfigError::InvalidOptions {
        kind: kind.to_string(),
        message: e.to_string(),
    })
}

/// Per-server configuration is either an inline mapping or a URL string.
/// A URL value is fetched once per (re)load and parsed as JSON, ignoring
/// the response content-type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigSource {
    Url(String),
    Inline(serde_json::Value),
}

impl ConfigSource {
    pub async fn resolve(&self) -> Result<serde_json::Value, ConfigError> {
        match self {
            ConfigSource::Inline(value) => Ok(value.clone()),
            ConfigSource::Url(raw) => {
                let parsed = url::Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
                    url: raw.clone(),
                    message: e.to_string(),
                })?;
                debug!("Fetching extension config from {}", parsed);
                let body = reqwest::get(parsed.clone())
                    .await
                    .map_err(|e| ConfigError::Fetch {
                        url: raw.clone(),
                        message: e.to_string(),
                    })?
                    .text()
                    .await
                    .map_err(|e| ConfigError::Fetch {
                        url: raw.clone(),
                        message: e.to_string(),
                    })?;
                serde_json::from_str(&body).map_err(|e| ConfigError::Parse(e.to_string()))
            }
        }
    }
}

/// Top-level on-disk configuration: extension name -> server id (string
/// key) -> config source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub extensions: HashMap<String, HashMap<String, ConfigSource>>,
}

impl BotConfig {
    /// Server-id keys arrive as strings in YAML; parse them up front so a
    /// typo fails the whole load rather than silently dropping a server.
    pub fn servers_for(
        &self,
        extension: &str,
    ) -> Result<HashMap<ServerId, ConfigSource>, ConfigError> {
        let mut out = HashMap::new();
        if let Some(servers) = self.extensions.get(extension) {
            for (key, source) in servers {
                let id: ServerId = key
                    .parse()
                    .map_err(|_| ConfigError::InvalidServerId(key.clone()))?;
                out.insert(id, source.clone());
            }
        }
        Ok(out)
    }
}

// =================================================================
// RULES EXTENSION OPTIONS
// =================================================================

/// One condition or action entry: a kind tag plus free-form options
/// consumed by the per-kind factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectiveConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger_type: String,
    #[serde(default)]
    pub conditions: Vec<DirectiveConfig>,
    #[serde(default)]
    pub actions: Vec<DirectiveConfig>,
    pub log_icon: Option<String>,
    pub log_color: Option<String>,
    pub log_channel: Option<ChannelId>,
    pub notify_roles: Option<Vec<RoleId>>,
}

/// Resolved per-server options for the rules extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesOptions {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    pub log_channel: Option<ChannelId>,
    pub log_icon: Option<String>,
    pub log_color: Option<String>,
    #[serde(default)]
    pub notify_roles: Vec<RoleId>,
    #[serde(default)]
    pub compact_logs: bool,
}

// =================================================================
// HELP-CHANNEL EXTENSION OPTIONS
// =================================================================

fn default_message_with_channel() -> String {
    "{author} {reactor} suggests asking this in {to_channel}".to_string()
}

fn default_message_without_channel() -> String {
    "{author} {reactor} suggests asking this in a help channel once one frees up".to_string()
}

fn default_seconds_until_stale() -> u64 {
    3600
}

fn default_seconds_to_poll() -> u64 {
    600
}

fn default_min_hoisted() -> usize {
    1
}

fn default_max_hoisted() -> usize {
    2
}

fn default_relocate_emoji() -> String {
    "🛴".to_string()
}

fn default_resolve_emoji() -> String {
    "✅".to_string()
}

fn default_free_emoji() -> String {
    "✅".to_string()
}

fn default_busy_emoji() -> String {
    "💬".to_string()
}

fn default_stale_emoji() -> String {
    "⏰".to_string()
}

fn default_hoisted_emoji() -> String {
    "👋".to_string()
}

fn default_ducked_emoji() -> String {
    "🦆".to_string()
}

fn default_true() -> bool {
    true
}

/// Resolved per-server options for the help-channel extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpChatOptions {
    /// Managed pool: stable base name -> channel identifier. The base name
    /// survives every rename, so channel state round-trips through it.
    pub channels: HashMap<String, ChannelId>,
    #[serde(default = "default_message_with_channel")]
    pub message_with_channel: String,
    #[serde(default = "default_message_without_channel")]
    pub message_without_channel: String,
    #[serde(default = "default_seconds_until_stale")]
    pub seconds_until_stale: u64,
    #[serde(default = "default_seconds_to_poll")]
    pub seconds_to_poll: u64,
    pub free_category: Option<ChannelId>,
    pub busy_category: Option<ChannelId>,
    pub stale_category: Option<ChannelId>,
    pub hoisted_category: Option<ChannelId>,
    #[serde(default = "default_min_hoisted")]
    pub min_hoisted_channels: usize,
    #[serde(default = "default_max_hoisted")]
    pub max_hoisted_channels: usize,
    #[serde(default = "default_relocate_emoji")]
    pub relocate_emoji: String,
    #[serde(default = "default_resolve_emoji")]
    pub resolve_emoji: String,
    #[serde(default = "default_free_emoji")]
    pub free_emoji: String,
    #[serde(default = "default_busy_emoji")]
    pub busy_emoji: String,
    #[serde(default = "default_stale_emoji")]
    pub stale_emoji: String,
    #[serde(default = "default_hoisted_emoji")]
    pub hoisted_emoji: String,
    #[serde(default = "default_ducked_emoji")]
    pub ducked_emoji: String,
    #[serde(default)]
    pub resolve_with_reaction: bool,
    #[serde(default = "default_true")]
    pub auto_poll: bool,
}

impl HelpChatOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_hoisted_channels < 1 {
            return Err(ConfigError::Invalid(
                "min_hoisted_channels must be at least 1".to_string(),
            ));
        }
        if self.max_hoisted_channels < self.min_hoisted_channels {
            return Err(ConfigError::Invalid(format!(
                "max_hoisted_channels {} is below min_hoisted_channels {}",
                self.max_hoisted_channels, self.min_hoisted_channels
            )));
        }
        if self.seconds_to_poll == 0 {
            return Err(ConfigError::Invalid(
                "seconds_to_poll must be positive".to_string(),
            ));
        }
        let emojis = [
            &self.free_emoji,
            &self.busy_emoji,
            &self.stale_emoji,
            &self.hoisted_emoji,
            &self.ducked_emoji,
        ];
        for (i, a) in emojis.iter().enumerate() {
            for b in emojis.iter().skip(i + 1) {
                if a == b {
                    return Err(ConfigError::Invalid(format!(
                        "state emojis must be distinct, '{}' is reused",
                        a
                    )));
                }
            }
        }
        Ok(())
    }
}

// =================================================================
// CONFIG MANAGER
// =================================================================

/// Events broadcasted when the configuration file changes on disk.
#[derive(Debug, Clone)]
pub enum ConfigChangeEvent {
    FileChanged { path: PathBuf },
}

/// Loads the YAML configuration file and watches it for changes. A change
/// event is debounced and broadcast; the engine funnels it into the same
/// reload path as the admin `reload` command.
pub struct ConfigManager {
    path: PathBuf,
    current: Arc<RwLock<BotConfig>>,
    change_notifier: broadcast::Sender<ConfigChangeEvent>,
    watchers: Arc<RwLock<Vec<RecommendedWatcher>>>,
    last_change: Arc<RwLock<std::time::Instant>>,
}

impl ConfigManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let (change_notifier, _) = broadcast::channel(16);
        Self {
            path: path.as_ref().to_path_buf(),
            current: Arc::new(RwLock::new(BotConfig::default())),
            change_notifier,
            watchers: Arc::new(RwLock::new(Vec::new())),
            last_change: Arc::new(RwLock::new(std::time::Instant::now())),
        }
    }

    /// Read and parse the configuration file, replacing the cached copy.
    pub async fn load(&self) -> Result<BotConfig> {
        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read config: {}", self.path.display()))?;

        let config: BotConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", self.path.display()))?;

        // Fail early on malformed server-id keys.
        for extension in config.extensions.keys() {
            config.servers_for(extension)?;
        }

        *self.current.write().await = config.clone();
        info!(
            "Loaded configuration for {} extension(s) from {}",
            config.extensions.len(),
            self.path.display()
        );
        Ok(config)
    }

    pub async fn current(&self) -> BotConfig {
        self.current.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.change_notifier.subscribe()
    }

    /// Setup a file watcher for hot-reloading. Change events are debounced
    /// to absorb editors that write in several bursts.
    pub async fn watch(&self) -> Result<()> {
        let config_path = self.path.clone();
        let change_notifier = self.change_notifier.clone();
        let last_change = self.last_change.clone();

        let (tx, mut rx) = tokio::sync::mpsc::channel(100);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if let Err(e) = tx.blocking_send(event) {
                    error!("Failed to send file watch event: {}", e);
                }
            }
        })?;

        let watch_root = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        watcher.watch(&watch_root, RecursiveMode::NonRecursive)?;

        // Store watcher to prevent it from being dropped
        self.watchers.write().await.push(watcher);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }
                let relevant = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == config_path.file_name());
                if !relevant {
                    continue;
                }

                // Debounce rapid consecutive changes
                {
                    let now = std::time::Instant::now();
                    let last = *last_change.read().await;
                    if now.duration_since(last) < Duration::from_millis(500) {
                        continue;
                    }
                    *last_change.write().await = now;
                }

                info!("Configuration file changed, scheduling reload");
                if change_notifier
                    .send(ConfigChangeEvent::FileChanged {
                        path: config_path.clone(),
                    })
                    .is_err()
                {
                    warn!("Configuration change had no listeners");
                }
            }
        });

        info!("File watcher setup for {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
extensions:
  rules:
    "42":
      rules:
        - name: no-links
          trigger_type: MESSAGE_SENT
          conditions:
            - type: MESSAGE_CONTAINS
              content: "http://"
          actions:
            - type: DELETE_MESSAGE
      log_channel: 99
  helpchat:
    "42":
      channels:
        chat-alpha: 201
        chat-beta: 202
      min_hoisted_channels: 2
      max_hoisted_channels: 3
"#;

    #[tokio::test]
    async fn test_load_sample_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wardenbot.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let manager = ConfigManager::new(&path);
        let config = manager.load().await.unwrap();

        let rules = config.servers_for("rules").unwrap();
        assert!(rules.contains_key(&42));

        let source = rules.get(&42).unwrap();
        let resolved = source.resolve().await.unwrap();
        let options: RulesOptions = serde_json::from_value(resolved).unwrap();
        assert_eq!(options.rules.len(), 1);
        assert_eq!(options.rules[0].name, "no-links");
        assert_eq!(options.rules[0].conditions[0].kind, "MESSAGE_CONTAINS");
        assert_eq!(options.log_channel, Some(99));
    }

    #[tokio::test]
    async fn test_invalid_server_id_fails_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wardenbot.yaml");
        std::fs::write(
            &path,
            "extensions:\n  rules:\n    not-a-number:\n      rules: []\n",
        )
        .unwrap();

        let manager = ConfigManager::new(&path);
        assert!(manager.load().await.is_err());
    }

    #[tokio::test]
    async fn test_url_source_parses_as_url() {
        let source = ConfigSource::Url("not a url at all".to_string());
        match source.resolve().await {
            Err(ConfigError::InvalidUrl { .. }) => {}
            other => panic!("expected InvalidUrl, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_helpchat_defaults() {
        let options: HelpChatOptions =
            serde_json::from_value(serde_json::json!({ "channels": { "chat-alpha": 201 } }))
                .unwrap();
        assert_eq!(options.seconds_until_stale, 3600);
        assert_eq!(options.seconds_to_poll, 600);
        assert_eq!(options.min_hoisted_channels, 1);
        assert_eq!(options.max_hoisted_channels, 2);
        assert_eq!(options.free_emoji, "✅");
        assert!(options.auto_poll);
        assert!(!options.resolve_with_reaction);
        options.validate().unwrap();
    }

    #[test]
    fn test_helpchat_validation_rejects_bad_bounds() {
        let options: HelpChatOptions = serde_json::from_value(serde_json::json!({
            "channels": { "chat-alpha": 201 },
            "min_hoisted_channels": 3,
            "max_hoisted_channels": 2,
        }))
        .unwrap();
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_helpchat_validation_rejects_reused_emoji() {
        let options: HelpChatOptions = serde_json::from_value(serde_json::json!({
            "channels": { "chat-alpha": 201 },
            "busy_emoji": "✅",
        }))
        .unwrap();
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_directive_options_flatten() {
        let directive: DirectiveConfig = serde_json::from_value(serde_json::json!({
            "type": "MESSAGE_CONTAINS",
            "content": "spam",
            "ignore_case": true,
        }))
        .unwrap();
        assert_eq!(directive.kind, "MESSAGE_CONTAINS");
        assert_eq!(directive.options["content"], "spam");
        assert_eq!(directive.options["ignore_case"], true);
    }
}
