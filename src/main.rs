use anyhow::Result;
use log::{info, warn};
use std::env;
use std::sync::Arc;

use wardenbot::prelude::*;

/// Without a gateway connector this binary runs against the in-memory
/// platform: configuration is loaded and validated, per-server states are
/// constructed, and the hot-reload watcher stays live. Useful for
/// exercising a configuration before deploying it behind a real
/// connector.
#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables and initialize logging
    dotenv::dotenv().ok();
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Starting wardenbot v{}", wardenbot::VERSION);

    let config_path =
        env::var("WARDENBOT_CONFIG").unwrap_or_else(|_| "wardenbot.yaml".to_string());
    let config = Arc::new(ConfigManager::new(&config_path));

    let platform = Arc::new(MemoryPlatform::new("wardenbot"));
    warn!("No gateway connector configured; running in dry-run mode on the in-memory platform");

    // Seed one server per configured extension entry so states construct.
    let loaded = config.load().await?;
    let mut server_ids: Vec<u64> = Vec::new();
    for extension in loaded.extensions.keys() {
        for server_id in loaded.servers_for(extension)?.keys() {
            if !server_ids.contains(server_id) {
                server_ids.push(*server_id);
                platform
                    .add_server(*server_id, &format!("server-{}", server_id))
                    .await;
            }
        }
    }

    let bot = WardenBot::new(platform.clone(), config);
    bot.start().await?;
    platform.emit(PlatformEvent::Ready { server_ids });

    info!("Running; edit {} to hot-reload, ctrl-c to exit", config_path);
    tokio::signal::ctrl_c().await?;

    bot.shutdown().await;
    Ok(())
}
