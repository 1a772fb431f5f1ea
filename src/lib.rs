//! Resilient chat-room relay.
//!
//! A [`SessionClient`] holds one upstream Socket.IO connection to a chat room,
//! reconnecting with capped exponential backoff. The [`ConnectionRegistry`]
//! keeps at most one session per room, and the relay server streams each
//! session's events to browser viewers over server-sent events.

pub mod common;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod plays;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod transport;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::info;

pub use config::{AppConfig, SessionConfig, SessionDefaults, SessionTimings, UpstreamConfig};
pub use error::{ErrorCategory, RelayError, RelayResult};
pub use event_bus::{EventBus, EventBusStats};
pub use plays::{JsonFilePlayStore, MemoryPlayStore, Play, PlayPattern, PlayStore};
pub use protocol::Message;
pub use registry::{ConnectionKey, ConnectionRegistry};
pub use relay::{LogBook, PlaySink, RelayBridge, RelayFrame, RelayState};
pub use session::{ConnectionInfo, SessionClient, SessionEvent, SessionState};
pub use transport::{Connector, MemoryConnector, WsConnector};

/// Build the relay state from configuration, using the given connector for
/// upstream sessions
pub async fn build_state(config: &AppConfig, connector: Arc<dyn Connector>) -> RelayResult<RelayState> {
    let registry = Arc::new(ConnectionRegistry::new(
        connector,
        config.session.clone(),
        config.upstream.clone(),
    ));

    let plays = if config.plays.enabled {
        let pattern = PlayPattern::new(&config.plays.pattern)?;
        let store: Arc<dyn PlayStore> = match &config.plays.store_path {
            Some(path) => Arc::new(JsonFilePlayStore::open(path).await?),
            None => Arc::new(MemoryPlayStore::new()),
        };
        info!(
            pattern = %config.plays.pattern,
            persistent = config.plays.store_path.is_some(),
            "Play extraction enabled"
        );
        Some(PlaySink::new(pattern, store))
    } else {
        None
    };

    let log_book = Arc::new(LogBook::new(config.server.log_book_size));
    Ok(RelayState::new(registry, plays, log_book))
}
