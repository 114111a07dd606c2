//! ---
//! atelier_section: "02-realtime-messaging"
//! atelier_subsection: "module"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Pub/sub bus shared by collaboration, presence and notifications."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
//! Realtime pub/sub bus for the Atelier platform.
//!
//! Producers and consumers talk to a [`PubSubAdapter`] and never learn whether
//! the process runs alone ([`LocalAdapter`]) or as one of many instances
//! sharing a broker ([`DistributedAdapter`]). Channel names are built only via
//! the helpers in [`channels`].
#![warn(missing_docs)]

pub mod adapter;
pub mod broker;
pub mod channels;
pub mod distributed;
pub mod envelope;
pub mod factory;
pub mod local;
pub mod logging;
pub mod pattern;
mod registry;

/// Shared result type for bus operations.
pub type Result<T> = std::result::Result<T, PubSubError>;

/// Errors surfaced by adapters and broker transports.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// The adapter has not finished connecting, lost its transport, or was closed.
    #[error("{adapter} adapter is not ready (state: {state})")]
    NotReady {
        /// Adapter kind reporting the condition.
        adapter: &'static str,
        /// Lifecycle state at the time of the call.
        state: adapter::AdapterState,
    },
    /// Channel or pattern names must not be empty.
    #[error("channel and pattern names must not be empty")]
    InvalidChannel,
    /// A received payload could not be decoded into an envelope.
    #[error("malformed message on channel {channel}: {source}")]
    MalformedMessage {
        /// Channel the payload arrived on.
        channel: String,
        /// Decoder failure.
        #[source]
        source: serde_json::Error,
    },
    /// The broker transport rejected or could not carry out a request.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Error raised by the Redis client.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// Envelope encoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub use adapter::{handler, AdapterState, HandlerResult, MessageHandler, PubSubAdapter};
pub use broker::memory::InMemoryBroker;
pub use broker::redis::RedisBroker;
pub use broker::{Broker, BrokerEvent, BrokerLink, BrokerPublisher, BrokerSubscriber};
pub use distributed::DistributedAdapter;
pub use envelope::Envelope;
pub use factory::{connect_adapter, connect_adapter_with_broker, SharedAdapter};
pub use local::LocalAdapter;
pub use logging::{log_envelope, MessageDirection, PubSubMetrics};
pub use pattern::ChannelPattern;
