//! # wardenbot
//!
//! A multi-tenant chat moderation and automation engine. Rules composed of
//! typed triggers, ordered conditions, and ordered actions run against the
//! event stream of one or more servers, with structured audit logging; a
//! pool of managed help channels cycles through free, busy, stale,
//! hoisted, and ducked states driven by user activity and elapsed time.
//!
//! ## Features
//!
//! - **Per-server rules engine**: conditions short-circuit in order,
//!   actions apply in order, each with its own audit entry
//! - **Help-channel lifecycle**: channel state lives in the channel name
//!   itself, so it survives restarts without a database
//! - **Hot-reload configuration**: inline or URL-fetched per-server
//!   config, rebuilt atomically per extension on reload or file change
//! - **Platform-agnostic**: the engine depends on a small chat-platform
//!   trait; an in-memory implementation drives tests and dry runs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wardenbot::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let platform = Arc::new(MemoryPlatform::new("warden"));
//!     let config = Arc::new(ConfigManager::new("wardenbot.yaml"));
//!
//!     let bot = WardenBot::new(platform, config);
//!     bot.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     bot.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bot;
pub mod config;
pub mod platforms;
pub mod types;

// Re-export commonly used items
pub mod prelude {
    pub use crate::bot::admin::{AdminApi, Feedback};
    pub use crate::bot::helpchat::ChannelState;
    pub use crate::bot::triggers::TriggerType;
    pub use crate::bot::WardenBot;
    pub use crate::config::{BotConfig, ConfigManager, ConfigSource};
    pub use crate::platforms::{memory::MemoryPlatform, ChatPlatform, PlatformError};
    pub use crate::types::{ChatMessage, ChatUser, Member, PlatformEvent, Reaction};
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
