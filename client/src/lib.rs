//! # Cardsync Client
//!
//! Async runtime around [`cardsync_engine`]: transports, durable queue
//! storage and the [`SyncFacade`] the UI talks to.
//!
//! ```rust,no_run
//! use cardsync_client::{SyncConfig, SyncFacade};
//! use cardsync_engine::Mutation;
//!
//! # async fn run() -> cardsync_client::Result<()> {
//! let facade = SyncFacade::from_config(&SyncConfig::from_env()?)?;
//! let mut events = facade.subscribe();
//! facade.start().await?;
//!
//! // Visible in the view at once, delivered when the connection allows.
//! facade.submit(Mutation::move_to("card-1", "done")).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod facade;
pub mod store;
pub mod transport;

pub use config::{ConfigError, SyncConfig};
pub use error::{ClientError, Result};
pub use facade::{SyncEvent, SyncFacade, SyncPhase};
pub use store::FileQueueStore;
pub use transport::{
    EventSender, HttpApi, PollingTransport, PushTransport, SendResult, Transport, TransportEvent,
};

use cardsync_engine::Timestamp;

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
