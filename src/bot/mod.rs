// src/bot/mod.rs - Engine core: wires the platform stream to extensions

use anyhow::Result;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::config::{ConfigChangeEvent, ConfigManager};
use crate::platforms::ChatPlatform;
use crate::types::PlatformEvent;

pub mod actions;
pub mod admin;
pub mod audit;
pub mod conditions;
pub mod extension;
pub mod helpchat;
pub mod rules;
pub mod triggers;

use admin::AdminApi;
use extension::{Extension, ExtensionHost};
use helpchat::HelpChatExtension;
use rules::RulesExtension;

/// The moderation engine. Owns the platform handle, the configuration
/// manager, and the extension host, and pumps platform events through
/// them.
///
/// Events are routed one at a time on a single task: within one event,
/// conditions and actions run in configured order, and two events only
/// interleave at the suspension points of the handlers themselves.
pub struct WardenBot {
    platform: Arc<dyn ChatPlatform>,
    config: Arc<ConfigManager>,
    host: Arc<ExtensionHost>,
    rules: Arc<RulesExtension>,
    helpchat: Arc<HelpChatExtension>,
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl WardenBot {
    pub fn new(platform: Arc<dyn ChatPlatform>, config: Arc<ConfigManager>) -> Self {
        let rules = Arc::new(RulesExtension::new(platform.clone()));
        let helpchat = Arc::new(HelpChatExtension::new(platform.clone()));
        let host = Arc::new(ExtensionHost::new(
            platform.clone(),
            vec![
                rules.clone() as Arc<dyn Extension>,
                helpchat.clone() as Arc<dyn Extension>,
            ],
        ));
        Self {
            platform,
            config,
            host,
            rules,
            helpchat,
            tasks: RwLock::new(Vec::new()),
        }
    }

    /// The administrative surface over this engine.
    pub fn admin(&self) -> AdminApi {
        AdminApi::new(
            self.platform.clone(),
            self.config.clone(),
            self.host.clone(),
            self.rules.clone(),
            self.helpchat.clone(),
        )
    }

    /// Connect, load configuration, and start the event pump. Per-server
    /// states are constructed when the platform reports readiness.
    pub async fn start(&self) -> Result<()> {
        info!("Starting wardenbot...");

        self.platform.connect().await?;

        let config = self.config.load().await?;
        self.host.apply_config(&config).await?;

        // Event pump: one event fully routed at a time.
        let receiver = self.platform.subscribe();
        let host = self.host.clone();
        let pump = tokio::spawn(async move {
            Self::pump_events(receiver, host).await;
        });
        self.tasks.write().await.push(pump);

        // Funnel config-file changes into the same reload path as the
        // admin command.
        self.config.watch().await?;
        let mut changes = self.config.subscribe();
        let config = self.config.clone();
        let host = self.host.clone();
        let reloader = tokio::spawn(async move {
            while let Ok(ConfigChangeEvent::FileChanged { .. }) = changes.recv().await {
                match config.load().await {
                    Ok(fresh) => {
                        if let Err(e) = host.apply_config(&fresh).await {
                            error!("Hot reload failed while applying config: {:#}", e);
                            continue;
                        }
                        host.load_all().await;
                        info!("Hot reload complete");
                    }
                    Err(e) => error!("Hot reload failed while loading config: {:#}", e),
                }
            }
        });
        self.tasks.write().await.push(reloader);

        info!("wardenbot started");
        Ok(())
    }

    async fn pump_events(
        mut receiver: broadcast::Receiver<PlatformEvent>,
        host: Arc<ExtensionHost>,
    ) {
        loop {
            match receiver.recv().await {
                Ok(PlatformEvent::Ready { server_ids }) => {
                    info!("Platform ready with {} server(s)", server_ids.len());
                    host.load_all().await;
                }
                Ok(event) => {
                    host.route(&event).await;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event receiver lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event receiver closed");
                    break;
                }
            }
        }
    }

    /// Stop background tasks and tear down all per-server state. Channel
    /// names are the persistent store; nothing needs durable cleanup.
    pub async fn shutdown(&self) {
        info!("Shutting down wardenbot...");
        for task in self.tasks.write().await.drain(..) {
            task.abort();
        }
        self.host.teardown_all().await;
        if let Err(e) = self.platform.disconnect().await {
            warn!("Error disconnecting platform: {}", e);
        }
        info!("wardenbot shutdown complete");
    }
}
