//! ---
//! atelier_section: "02-realtime-messaging"
//! atelier_subsection: "module"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Broker transport abstraction used by the distributed adapter."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::Result;

pub mod memory;
pub mod redis;

/// Event produced by a broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Raw payload delivered on a transport-level (namespaced) channel.
    Message {
        /// Transport channel the payload was published on.
        channel: String,
        /// Transport pattern that matched, for pattern subscriptions.
        pattern: Option<String>,
        /// Undecoded payload bytes.
        payload: Vec<u8>,
    },
    /// A connection dropped; the transport is trying to recover it.
    Disconnected {
        /// Which connection was lost.
        link: BrokerLink,
        /// Human readable cause.
        reason: String,
    },
    /// The connection is usable again. For the subscriber this means every
    /// subscription was re-established.
    Reconnected {
        /// Which connection recovered.
        link: BrokerLink,
    },
}

/// The two independent connections a broker session holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerLink {
    /// Connection used for publishing.
    Publisher,
    /// Dedicated subscription connection.
    Subscriber,
}

impl BrokerLink {
    /// Short label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerLink::Publisher => "publisher",
            BrokerLink::Subscriber => "subscriber",
        }
    }
}

/// Sender half handed to broker connections.
pub type BrokerEventSender = UnboundedSender<BrokerEvent>;

/// External pub/sub broker reachable over independent connections.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Broker family, reported as the adapter name.
    fn name(&self) -> &'static str;

    /// Open the connection used for publishing. Its loss and recovery are
    /// reported into `events`.
    async fn connect_publisher(
        &self,
        events: BrokerEventSender,
    ) -> Result<Arc<dyn BrokerPublisher>>;

    /// Open a dedicated subscription connection that reports into `events`.
    async fn connect_subscriber(
        &self,
        events: BrokerEventSender,
    ) -> Result<Arc<dyn BrokerSubscriber>>;
}

/// Publishing half of a broker session.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Hand `payload` to the broker; resolves once the broker accepted it.
    /// Losing the connection is reported as `Disconnected`; publishes fail
    /// until the matching `Reconnected`.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    /// Release the connection. Idempotent.
    async fn close(&self);
}

/// Subscription half of a broker session. Names are transport-level.
#[async_trait]
pub trait BrokerSubscriber: Send + Sync {
    /// Start receiving `channel`.
    async fn subscribe(&self, channel: &str) -> Result<()>;

    /// Stop receiving `channel`.
    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Start receiving every channel matching the broker glob `pattern`.
    async fn psubscribe(&self, pattern: &str) -> Result<()>;

    /// Stop receiving `pattern`.
    async fn punsubscribe(&self, pattern: &str) -> Result<()>;

    /// Release the connection; no events are sent afterwards. Idempotent.
    async fn close(&self);
}
