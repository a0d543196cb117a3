// src/bot/extension.rs - Extension lifecycle: loading, routing, reload

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::{BotConfig, ConfigSource};
use crate::platforms::ChatPlatform;
use crate::types::{ChannelId, PlatformEvent, RoleId, ServerId};

/// A referenced platform object does not exist at load time. Logged; the
/// referring state continues with the reference treated as absent.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("channel {0} does not exist")]
    Channel(ChannelId),
    #[error("role {0} does not exist")]
    Role(RoleId),
    #[error("server {0} does not exist")]
    Server(ServerId),
    #[error("emoji '{0}' does not exist")]
    Emoji(String),
}

/// A feature unit with per-server configuration: the rules engine and the
/// help-channel manager are each one extension.
#[async_trait]
pub trait Extension: Send + Sync {
    fn name(&self) -> &'static str;

    /// Construct the per-server state from resolved options. Stores
    /// inputs only; platform references are resolved in
    /// [`ServerExtensionState::setup`].
    async fn build(
        &self,
        server_id: ServerId,
        options: serde_json::Value,
    ) -> Result<Arc<dyn ServerExtensionState>>;

    /// Forget any bookkeeping for a server whose state was torn down.
    async fn drop_server(&self, _server_id: ServerId) {}
}

/// Immutable per-server state with a two-phase lifecycle: `build` stores
/// inputs, `setup` resolves platform references and starts background
/// work, `teardown` is symmetric.
#[async_trait]
pub trait ServerExtensionState: Send + Sync {
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn teardown(&self) {}

    async fn handle_event(&self, event: &PlatformEvent);
}

/// Owns the registered extensions, resolves their per-server config
/// sources, constructs states at ready time, and routes platform events.
pub struct ExtensionHost {
    platform: Arc<dyn ChatPlatform>,
    extensions: Vec<Arc<dyn Extension>>,
    sources: RwLock<HashMap<String, HashMap<ServerId, ConfigSource>>>,
    states: RwLock<HashMap<String, HashMap<ServerId, Arc<dyn ServerExtensionState>>>>,
}

impl ExtensionHost {
    pub fn new(platform: Arc<dyn ChatPlatform>, extensions: Vec<Arc<dyn Extension>>) -> Self {
        Self {
            platform,
            extensions,
            sources: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the stored config sources. Fails on malformed server ids;
    /// nothing is rebuilt until [`ExtensionHost::load_all`] runs.
    pub async fn apply_config(&self, config: &BotConfig) -> Result<()> {
        let mut sources = HashMap::new();
        for extension in &self.extensions {
            sources.insert(
                extension.name().to_string(),
                config.servers_for(extension.name())?,
            );
        }
        for name in config.extensions.keys() {
            if !sources.contains_key(name) {
                warn!("Configuration names unknown extension '{}'", name);
            }
        }
        *self.sources.write().await = sources;
        Ok(())
    }

    /// (Re)build every extension's server states. Reload is atomic per
    /// extension: the new state set replaces the old in one swap, and a
    /// failure for one server leaves the other servers' new states in
    /// place (the failed server is absent until the next reload).
    pub async fn load_all(&self) {
        for extension in &self.extensions {
            self.reload_extension(extension).await;
        }
    }

    async fn reload_extension(&self, extension: &Arc<dyn Extension>) {
        let name = extension.name();

        // Tear down the outgoing states first; their background work must
        // stop before replacements start.
        let outgoing = self.states.write().await.remove(name);
        if let Some(outgoing) = outgoing {
            for (server_id, state) in outgoing {
                state.teardown().await;
                extension.drop_server(server_id).await;
            }
        }

        let sources = self
            .sources
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default();

        let mut fresh: HashMap<ServerId, Arc<dyn ServerExtensionState>> = HashMap::new();
        for (server_id, source) in sources {
            let options = match source.resolve().await {
                Ok(options) => options,
                Err(e) => {
                    warn!(
                        "Skipping {} on server {}: config resolution failed: {}",
                        name, server_id, e
                    );
                    continue;
                }
            };
            let state = match extension.build(server_id, options).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        "Skipping {} on server {}: construction failed: {:#}",
                        name, server_id, e
                    );
                    continue;
                }
            };
            if let Err(e) = state.setup().await {
                warn!(
                    "Skipping {} on server {}: setup failed: {:#}",
                    name, server_id, e
                );
                extension.drop_server(server_id).await;
                continue;
            }
            fresh.insert(server_id, state);
        }

        info!("Extension '{}' loaded for {} server(s)", name, fresh.len());
        self.states.write().await.insert(name.to_string(), fresh);
    }

    /// Dispatch one platform event to every extension with a state for
    /// the event's server. Events from the bot identity and events with
    /// no resolvable server (DMs) are skipped.
    pub async fn route(&self, event: &PlatformEvent) {
        if event.actor_id() == Some(self.platform.bot_user().id) {
            debug!("Suppressing event from bot identity");
            return;
        }
        let Some(server_id) = event.server_id() else {
            return;
        };

        let targets: Vec<Arc<dyn ServerExtensionState>> = {
            let states = self.states.read().await;
            self.extensions
                .iter()
                .filter_map(|ext| states.get(ext.name()))
                .filter_map(|servers| servers.get(&server_id))
                .cloned()
                .collect()
        };
        for state in targets {
            state.handle_event(event).await;
        }
    }

    pub async fn teardown_all(&self) {
        let all = std::mem::take(&mut *self.states.write().await);
        for (name, servers) in all {
            for (server_id, state) in servers {
                state.teardown().await;
                if let Some(extension) = self.extensions.iter().find(|e| e.name() == name) {
                    extension.drop_server(server_id).await;
                }
            }
        }
    }

    /// Servers an extension currently has live state for.
    pub async fn servers_of(&self, extension: &str) -> Vec<ServerId> {
        self.states
            .read()
            .await
            .get(extension)
            .map(|servers| servers.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::memory::MemoryPlatform;
    use crate::types::ChatUser;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingState {
        handled: Arc<AtomicUsize>,
        torn_down: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ServerExtensionState for CountingState {
        async fn teardown(&self) {
            self.torn_down.fetch_add(1, Ordering::SeqCst);
        }

        async fn handle_event(&self, _event: &PlatformEvent) {
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingExtension {
        handled: Arc<AtomicUsize>,
        torn_down: Arc<AtomicUsize>,
        builds: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Extension for CountingExtension {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn build(
            &self,
            _server_id: ServerId,
            options: serde_json::Value,
        ) -> Result<Arc<dyn ServerExtensionState>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if options.get("broken").is_some() {
                anyhow::bail!("intentionally broken server config");
            }
            Ok(Arc::new(CountingState {
                handled: self.handled.clone(),
                torn_down: self.torn_down.clone(),
            }))
        }
    }

    fn config_with(servers: serde_json::Value) -> BotConfig {
        serde_json::from_value(serde_json::json!({
            "extensions": { "counting": servers }
        }))
        .unwrap()
    }

    fn fixture() -> (
        Arc<MemoryPlatform>,
        ExtensionHost,
        Arc<AtomicUsize>,
        Arc<AtomicUsize>,
        Arc<AtomicUsize>,
    ) {
        let platform = Arc::new(MemoryPlatform::new("warden"));
        let handled = Arc::new(AtomicUsize::new(0));
        let torn_down = Arc::new(AtomicUsize::new(0));
        let builds = Arc::new(AtomicUsize::new(0));
        let extension = Arc::new(CountingExtension {
            handled: handled.clone(),
            torn_down: torn_down.clone(),
            builds: builds.clone(),
        });
        let host = ExtensionHost::new(platform.clone(), vec![extension]);
        (platform, host, handled, torn_down, builds)
    }

    fn posted(server_id: Option<ServerId>, author: ChatUser) -> PlatformEvent {
        PlatformEvent::MessagePosted {
            message: crate::types::ChatMessage {
                id: 1,
                server_id,
                channel_id: 10,
                author,
                content: "hi".to_string(),
                timestamp: chrono::Utc::now(),
                embed_count: 0,
                attachment_count: 0,
            },
        }
    }

    fn human() -> ChatUser {
        ChatUser {
            id: 5,
            name: "alice".to_string(),
            bot: false,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_routing_skips_unmanaged_servers_and_bot_events() {
        let (platform, host, handled, _, _) = fixture();
        host.apply_config(&config_with(serde_json::json!({ "42": {} })))
            .await
            .unwrap();
        host.load_all().await;

        host.route(&posted(Some(42), human())).await;
        assert_eq!(handled.load(Ordering::SeqCst), 1);

        // Unmanaged server.
        host.route(&posted(Some(77), human())).await;
        assert_eq!(handled.load(Ordering::SeqCst), 1);

        // Direct message.
        host.route(&posted(None, human())).await;
        assert_eq!(handled.load(Ordering::SeqCst), 1);

        // Bot-origin event.
        host.route(&posted(Some(42), platform.bot_user())).await;
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reload_isolates_failed_servers() {
        let (_, host, handled, _, builds) = fixture();
        host.apply_config(&config_with(serde_json::json!({
            "42": {},
            "77": { "broken": true },
        })))
        .await
        .unwrap();
        host.load_all().await;

        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(host.servers_of("counting").await, vec![42]);

        // The healthy server routes fine; the broken one is just absent.
        host.route(&posted(Some(42), human())).await;
        host.route(&posted(Some(77), human())).await;
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reload_tears_down_old_states() {
        let (_, host, _, torn_down, _) = fixture();
        host.apply_config(&config_with(serde_json::json!({ "42": {} })))
            .await
            .unwrap();
        host.load_all().await;
        assert_eq!(torn_down.load(Ordering::SeqCst), 0);

        host.load_all().await;
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);

        host.teardown_all().await;
        assert_eq!(torn_down.load(Ordering::SeqCst), 2);
    }
}
