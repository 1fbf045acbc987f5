//! The conversational surface of the application: parsing incoming text, batching
//! forwarded timer messages, confirmation prompts and periodic progress notifications.
//! [dispatch::Dispatcher] ties the pieces together, everything else here is a building
//! block it drives.

use std::time::Duration;

pub mod aggregator;
pub mod dispatch;
pub mod event;
pub mod format;
pub mod notify;
pub mod parse;
pub mod session;
pub mod transport;

pub use dispatch::Dispatcher;
pub use event::{BotHandle, Decision};

#[derive(Debug, Clone)]
pub struct BotConfig {
    /// How long to wait after a forwarded timer message before assuming the batch is
    /// complete.
    pub debounce_window: Duration,
    /// Lifetime of short status messages before they are deleted.
    pub ephemeral_ttl: Duration,
    /// Lifetime of re-entry hints after unparsable input.
    pub retry_hint_ttl: Duration,
    /// Records shown on the history screen.
    pub history_limit: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(2),
            ephemeral_ttl: Duration::from_secs(5),
            retry_hint_ttl: Duration::from_secs(10),
            history_limit: 10,
        }
    }
}
