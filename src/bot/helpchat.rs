// src/bot/helpchat.rs - Help-channel pool lifecycle
//
// Channel state lives in the channel name itself: an emoji prefix plus a
// rendered name. The name is the only source of truth, so state survives
// restarts without any storage of our own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::bot::extension::{Extension, ResolveError, ServerExtensionState};
use crate::config::HelpChatOptions;
use crate::platforms::ChatPlatform;
use crate::types::{
    ChannelId, ChatMessage, ChatUser, PlatformEvent, Reaction, ServerId,
};

/// Lifecycle state of a managed channel, derived from its name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Free,
    Busy,
    Stale,
    Hoisted,
    Ducked,
}

impl ChannelState {
    pub const ALL: [ChannelState; 5] = [
        ChannelState::Free,
        ChannelState::Busy,
        ChannelState::Stale,
        ChannelState::Hoisted,
        ChannelState::Ducked,
    ];

    pub fn emoji<'a>(&self, options: &'a HelpChatOptions) -> &'a str {
        match self {
            ChannelState::Free => &options.free_emoji,
            ChannelState::Busy => &options.busy_emoji,
            ChannelState::Stale => &options.stale_emoji,
            ChannelState::Hoisted => &options.hoisted_emoji,
            ChannelState::Ducked => &options.ducked_emoji,
        }
    }

    /// The full channel name for this state. Hoisted channels become the
    /// "ask here" signpost; every other state keeps the base name visible.
    pub fn render_name(&self, base: &str, options: &HelpChatOptions) -> String {
        match self {
            ChannelState::Free => format!("{}free-{}", options.free_emoji, base),
            ChannelState::Busy => format!("{}busy-{}", options.busy_emoji, base),
            ChannelState::Stale => format!("{}stale-{}", options.stale_emoji, base),
            ChannelState::Hoisted => format!("{}ask-here", options.hoisted_emoji),
            ChannelState::Ducked => format!("{}ducked-{}", options.ducked_emoji, base),
        }
    }

    /// Derive the state from a channel name's emoji prefix.
    pub fn from_name(name: &str, options: &HelpChatOptions) -> Option<ChannelState> {
        Self::ALL
            .into_iter()
            .find(|state| name.starts_with(state.emoji(options)))
    }

    /// Parse an administrator-supplied state name.
    pub fn parse(name: &str) -> Option<ChannelState> {
        match name.to_lowercase().as_str() {
            "free" => Some(ChannelState::Free),
            "busy" => Some(ChannelState::Busy),
            "stale" => Some(ChannelState::Stale),
            "hoisted" => Some(ChannelState::Hoisted),
            "ducked" => Some(ChannelState::Ducked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Free => "free",
            ChannelState::Busy => "busy",
            ChannelState::Stale => "stale",
            ChannelState::Hoisted => "hoisted",
            ChannelState::Ducked => "ducked",
        }
    }

    fn category(&self, options: &HelpChatOptions) -> Option<ChannelId> {
        match self {
            ChannelState::Free => options.free_category,
            ChannelState::Busy | ChannelState::Ducked => options.busy_category,
            ChannelState::Stale => options.stale_category,
            ChannelState::Hoisted => options.hoisted_category,
        }
    }
}

struct HelpChatInner {
    server_id: ServerId,
    platform: Arc<dyn ChatPlatform>,
    options: HelpChatOptions,
    /// Channel id -> stable base name. Dangling entries are dropped during
    /// setup, so every remaining id resolves.
    base_names: RwLock<HashMap<ChannelId, String>>,
    last_polled: RwLock<DateTime<Utc>>,
    poll_in_flight: AtomicBool,
}

impl HelpChatInner {
    /// Managed channels as (base name, id), ordered by base name so pool
    /// scans are deterministic.
    async fn pool(&self) -> Vec<(String, ChannelId)> {
        let mut pool: Vec<(String, ChannelId)> = self
            .base_names
            .read()
            .await
            .iter()
            .map(|(id, base)| (base.clone(), *id))
            .collect();
        pool.sort();
        pool
    }

    async fn is_managed(&self, channel: ChannelId) -> bool {
        self.base_names.read().await.contains_key(&channel)
    }

    async fn state_of(&self, channel: ChannelId) -> Option<ChannelState> {
        let current = self.platform.get_channel(channel).await?;
        ChannelState::from_name(&current.name, &self.options)
    }

    /// Rename (and move) a channel into a state. Identical transitions are
    /// no-ops: the target name is a pure function of state and base name.
    async fn transition(&self, channel: ChannelId, state: ChannelState) -> Result<()> {
        let base = self
            .base_names
            .read()
            .await
            .get(&channel)
            .cloned()
            .with_context(|| format!("channel {} is not managed", channel))?;
        let target_name = state.render_name(&base, &self.options);

        let current = self
            .platform
            .get_channel(channel)
            .await
            .with_context(|| format!("channel {} vanished", channel))?;

        if current.name != target_name {
            debug!(
                "Server {}: channel {} '{}' -> '{}'",
                self.server_id, channel, current.name, target_name
            );
            self.platform.rename_channel(channel, &target_name).await?;
        }

        if let Some(category) = state.category(&self.options) {
            if current.category_id != Some(category) {
                self.platform
                    .move_channel_to_category(channel, category)
                    .await?;
            }
        }
        Ok(())
    }

    /// Return a busy/stale/ducked channel to the free pool.
    async fn resolve(&self, channel: ChannelId) -> Result<()> {
        info!("Server {}: resolving channel {}", self.server_id, channel);
        self.transition(channel, ChannelState::Free).await?;
        self.hoist_sync().await;
        Ok(())
    }

    async fn duck(&self, channel: ChannelId) -> Result<()> {
        let previous = self.state_of(channel).await;
        self.transition(channel, ChannelState::Ducked).await?;
        if previous == Some(ChannelState::Hoisted) {
            self.hoist_sync().await;
        }
        Ok(())
    }

    /// A human message landed: free, stale, and hoisted channels become
    /// busy. Leaving the hoisted state triggers a refill.
    async fn mark_busy(&self, channel: ChannelId) -> Result<()> {
        let previous = self.state_of(channel).await;
        match previous {
            Some(ChannelState::Free) | Some(ChannelState::Stale) | Some(ChannelState::Hoisted) => {
                self.transition(channel, ChannelState::Busy).await?;
                if previous == Some(ChannelState::Hoisted) {
                    self.hoist_sync().await;
                }
            }
            // Busy stays busy; ducked is busy-equivalent already.
            _ => {}
        }
        Ok(())
    }

    /// Keep the number of hoisted channels at `min_hoisted_channels`,
    /// preferring free channels, then stale ones. Logs and stops when the
    /// pool is exhausted.
    async fn hoist_sync(&self) {
        let pool = self.pool().await;
        let states = futures_util::future::join_all(
            pool.iter().map(|(_, channel)| self.state_of(*channel)),
        )
        .await;

        let mut free = Vec::new();
        let mut stale = Vec::new();
        let mut hoisted = 0usize;
        for ((_, channel), state) in pool.iter().zip(states) {
            match state {
                Some(ChannelState::Free) => free.push(*channel),
                Some(ChannelState::Stale) => stale.push(*channel),
                Some(ChannelState::Hoisted) => hoisted += 1,
                _ => {}
            }
        }

        if hoisted > self.options.max_hoisted_channels {
            warn!(
                "Server {}: {} hoisted channels exceeds the maximum of {}",
                self.server_id, hoisted, self.options.max_hoisted_channels
            );
            return;
        }

        let mut candidates = free.into_iter().chain(stale.into_iter());
        while hoisted < self.options.min_hoisted_channels {
            let Some(channel) = candidates.next() else {
                warn!(
                    "Server {}: help channel pool exhausted, {} of {} hoisted",
                    self.server_id, hoisted, self.options.min_hoisted_channels
                );
                return;
            };
            if let Err(e) = self.transition(channel, ChannelState::Hoisted).await {
                warn!("Server {}: failed to hoist channel {}: {:#}", self.server_id, channel, e);
                continue;
            }
            hoisted += 1;
        }
    }

    /// Scan busy channels for staleness. A busy channel whose latest
    /// message is older than `seconds_until_stale` goes stale; one with no
    /// messages at all goes back to free.
    async fn poll(&self) {
        // Only one poll may be in flight per server.
        if self
            .poll_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Server {}: poll already in flight, skipping", self.server_id);
            return;
        }

        let now = Utc::now();
        for (_, channel) in self.pool().await {
            if self.state_of(channel).await != Some(ChannelState::Busy) {
                continue;
            }
            let latest = match self.platform.recent_messages(channel, 1).await {
                Ok(messages) => messages.into_iter().next(),
                Err(e) => {
                    warn!(
                        "Server {}: failed to read channel {}: {}",
                        self.server_id, channel, e
                    );
                    continue;
                }
            };
            let outcome = match latest {
                None => self.transition(channel, ChannelState::Free).await,
                Some(message)
                    if (now - message.timestamp).num_seconds()
                        > self.options.seconds_until_stale as i64 =>
                {
                    self.transition(channel, ChannelState::Stale).await
                }
                Some(_) => Ok(()),
            };
            if let Err(e) = outcome {
                warn!(
                    "Server {}: poll transition failed for channel {}: {:#}",
                    self.server_id, channel, e
                );
            }
        }

        self.hoist_sync().await;
        *self.last_polled.write().await = now;
        self.poll_in_flight.store(false, Ordering::SeqCst);
    }

    async fn poll_if_due(&self) {
        if !self.options.auto_poll {
            return;
        }
        let due = {
            let last = *self.last_polled.read().await;
            Utc::now() >= last + chrono::Duration::seconds(self.options.seconds_to_poll as i64)
        };
        if due {
            self.poll().await;
        }
    }

    async fn on_message(&self, message: &ChatMessage) {
        if message.author.bot || !self.is_managed(message.channel_id).await {
            return;
        }
        let content = message.content.trim();
        let outcome = if content == self.options.resolve_emoji {
            self.resolve(message.channel_id).await
        } else if content == self.options.ducked_emoji {
            self.duck(message.channel_id).await
        } else {
            self.mark_busy(message.channel_id).await
        };
        if let Err(e) = outcome {
            warn!(
                "Server {}: message handling failed for channel {}: {:#}",
                self.server_id, message.channel_id, e
            );
        }
        self.poll_if_due().await;
    }

    async fn on_reaction(&self, reaction: &Reaction, message: &ChatMessage, reactor: &ChatUser) {
        // First relocate reaction on a human message: point the author at
        // a free help channel. Works from any channel, managed or not.
        if reaction.emoji == self.options.relocate_emoji
            && reaction.count == 1
            && !message.author.bot
        {
            if let Err(e) = self.redirect(reaction, message, reactor).await {
                warn!(
                    "Server {}: relocate redirect failed: {:#}",
                    self.server_id, e
                );
            }
        }

        if reaction.emoji == self.options.resolve_emoji
            && self.options.resolve_with_reaction
            && self.is_managed(reaction.channel_id).await
        {
            let latest = self
                .platform
                .recent_messages(reaction.channel_id, 1)
                .await
                .ok()
                .and_then(|messages| messages.into_iter().next());
            if latest.map(|m| m.id) == Some(message.id) {
                if let Err(e) = self.resolve(reaction.channel_id).await {
                    warn!(
                        "Server {}: reaction resolve failed for channel {}: {:#}",
                        self.server_id, reaction.channel_id, e
                    );
                }
            }
        }
    }

    async fn redirect(
        &self,
        reaction: &Reaction,
        message: &ChatMessage,
        reactor: &ChatUser,
    ) -> Result<()> {
        let mut free_channel = None;
        for (_, channel) in self.pool().await {
            if self.state_of(channel).await == Some(ChannelState::Free) {
                free_channel = Some(channel);
                break;
            }
        }

        let template = if free_channel.is_some() {
            &self.options.message_with_channel
        } else {
            &self.options.message_without_channel
        };
        let mut text = template
            .replace("{author}", &message.author.mention())
            .replace("{reactor}", &reactor.mention())
            .replace("{from_channel}", &format!("<#{}>", reaction.channel_id));
        if let Some(target) = free_channel {
            text = text.replace("{to_channel}", &format!("<#{}>", target));
        }

        self.platform
            .send_message(reaction.channel_id, &text)
            .await?;
        self.platform
            .add_reaction(
                reaction.channel_id,
                message.id,
                &self.options.relocate_emoji,
            )
            .await?;
        Ok(())
    }
}

/// The help-channel manager for one server.
pub struct HelpChat {
    inner: Arc<HelpChatInner>,
    poll_task: RwLock<Option<JoinHandle<()>>>,
}

impl HelpChat {
    fn new(
        server_id: ServerId,
        platform: Arc<dyn ChatPlatform>,
        options: HelpChatOptions,
    ) -> Self {
        let base_names = options
            .channels
            .iter()
            .map(|(base, id)| (*id, base.clone()))
            .collect();
        Self {
            inner: Arc::new(HelpChatInner {
                server_id,
                platform,
                options,
                base_names: RwLock::new(base_names),
                last_polled: RwLock::new(Utc::now()),
                poll_in_flight: AtomicBool::new(false),
            }),
            poll_task: RwLock::new(None),
        }
    }

    pub fn options(&self) -> &HelpChatOptions {
        &self.inner.options
    }

    pub async fn state_of(&self, channel: ChannelId) -> Option<ChannelState> {
        self.inner.state_of(channel).await
    }

    pub async fn is_managed(&self, channel: ChannelId) -> bool {
        self.inner.is_managed(channel).await
    }

    pub async fn force_state(&self, channel: ChannelId, state: ChannelState) -> Result<()> {
        self.inner.transition(channel, state).await?;
        self.inner.hoist_sync().await;
        Ok(())
    }

    pub async fn hoist_sync(&self) {
        self.inner.hoist_sync().await;
    }

    pub async fn poll_now(&self) {
        self.inner.poll().await;
    }

    pub async fn polling(&self) -> bool {
        self.poll_task
            .read()
            .await
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Start the recurring staleness poller. No-op if already running.
    pub async fn start_polling(&self) -> bool {
        let mut slot = self.poll_task.write().await;
        if slot.as_ref().map(|task| !task.is_finished()).unwrap_or(false) {
            return false;
        }
        let inner = self.inner.clone();
        info!(
            "Server {}: starting stale poller every {}s",
            inner.server_id, inner.options.seconds_to_poll
        );
        *slot = Some(tokio::spawn(async move {
            let interval = Duration::from_secs(inner.options.seconds_to_poll);
            loop {
                tokio::time::sleep(interval).await;
                inner.poll().await;
            }
        }));
        true
    }

    pub async fn stop_polling(&self) -> bool {
        let mut slot = self.poll_task.write().await;
        match slot.take() {
            Some(task) => {
                task.abort();
                info!("Server {}: stale poller stopped", self.inner.server_id);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ServerExtensionState for HelpChat {
    /// Resolve the configured pool, normalize channel names so every
    /// managed channel carries exactly one state prefix, and start the
    /// poller. State is inferred from names; nothing else is persisted.
    async fn setup(&self) -> Result<()> {
        let inner = &self.inner;
        let mut dangling = Vec::new();
        for (base, channel) in inner.pool().await {
            match inner.platform.get_channel(channel).await {
                None => {
                    warn!(
                        "Server {}: help channel '{}' unusable: {}",
                        inner.server_id,
                        base,
                        ResolveError::Channel(channel)
                    );
                    dangling.push(channel);
                }
                Some(current) => {
                    if ChannelState::from_name(&current.name, &inner.options).is_none() {
                        // Newly enrolled channel; fold it into the pool.
                        inner.transition(channel, ChannelState::Free).await?;
                    }
                }
            }
        }
        if !dangling.is_empty() {
            let mut base_names = inner.base_names.write().await;
            for channel in dangling {
                base_names.remove(&channel);
            }
        }

        inner.hoist_sync().await;
        info!(
            "Server {}: help-channel pool ready with {} channel(s)",
            inner.server_id,
            inner.base_names.read().await.len()
        );

        if inner.options.auto_poll {
            self.start_polling().await;
        }
        Ok(())
    }

    async fn teardown(&self) {
        self.stop_polling().await;
    }

    async fn handle_event(&self, event: &PlatformEvent) {
        match event {
            PlatformEvent::MessagePosted { message } => {
                self.inner.on_message(message).await;
            }
            PlatformEvent::ReactionAdded {
                reaction,
                message,
                reactor,
            } => {
                self.inner.on_reaction(reaction, message, reactor).await;
            }
            _ => {}
        }
    }
}

/// Factory for per-server help-channel managers, with a typed registry
/// for the admin surface.
pub struct HelpChatExtension {
    platform: Arc<dyn ChatPlatform>,
    states: RwLock<HashMap<ServerId, Arc<HelpChat>>>,
}

impl HelpChatExtension {
    pub fn new(platform: Arc<dyn ChatPlatform>) -> Self {
        Self {
            platform,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub async fn state_of(&self, server_id: ServerId) -> Option<Arc<HelpChat>> {
        self.states.read().await.get(&server_id).cloned()
    }
}

#[async_trait]
impl Extension for HelpChatExtension {
    fn name(&self) -> &'static str {
        "helpchat"
    }

    async fn build(
        &self,
        server_id: ServerId,
        options: serde_json::Value,
    ) -> Result<Arc<dyn ServerExtensionState>> {
        let options: HelpChatOptions = serde_json::from_value(options)
            .with_context(|| format!("invalid helpchat options for server {}", server_id))?;
        options.validate()?;

        let state = Arc::new(HelpChat::new(server_id, self.platform.clone(), options));
        self.states.write().await.insert(server_id, state.clone());
        Ok(state)
    }

    async fn drop_server(&self, server_id: ServerId) {
        self.states.write().await.remove(&server_id);
    }
}
