//! ---
//! atelier_section: "02-realtime-messaging"
//! atelier_subsection: "module"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Bus activity logging and prometheus counters."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
use prometheus::{IntCounter, Opts, Registry};
use tracing::{debug, trace};

use crate::Envelope;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Published by this adapter.
    Outbound,
    /// Delivered to a local handler.
    Inbound,
    /// Received but dropped because this adapter sent it.
    Suppressed,
}

/// Emit a structured log entry for bus activity.
pub fn log_envelope(adapter: &str, direction: MessageDirection, envelope: &Envelope) {
    match direction {
        MessageDirection::Suppressed => trace!(
            adapter,
            channel = %envelope.channel,
            sender_id = %envelope.sender_id,
            "self-echo suppressed"
        ),
        _ => debug!(
            adapter,
            channel = %envelope.channel,
            sender_id = %envelope.sender_id,
            timestamp = envelope.timestamp,
            direction = ?direction,
            "pubsub activity"
        ),
    }
}

/// Prometheus counters for bus activity.
#[derive(Clone)]
pub struct PubSubMetrics {
    published: IntCounter,
    delivered: IntCounter,
    echo_suppressed: IntCounter,
    malformed: IntCounter,
    handler_failures: IntCounter,
}

impl PubSubMetrics {
    /// Register bus metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let published = IntCounter::with_opts(Opts::new(
            "pubsub_published_total",
            "Envelopes published through an adapter",
        ))?;
        let delivered = IntCounter::with_opts(Opts::new(
            "pubsub_delivered_total",
            "Envelopes handed to application handlers",
        ))?;
        let echo_suppressed = IntCounter::with_opts(Opts::new(
            "pubsub_echo_suppressed_total",
            "Envelopes dropped because the receiving adapter published them",
        ))?;
        let malformed = IntCounter::with_opts(Opts::new(
            "pubsub_malformed_total",
            "Broker payloads that failed to decode",
        ))?;
        let handler_failures = IntCounter::with_opts(Opts::new(
            "pubsub_handler_failures_total",
            "Handler invocations that returned an error or panicked",
        ))?;

        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(delivered.clone()))?;
        registry.register(Box::new(echo_suppressed.clone()))?;
        registry.register(Box::new(malformed.clone()))?;
        registry.register(Box::new(handler_failures.clone()))?;

        Ok(Self {
            published,
            delivered,
            echo_suppressed,
            malformed,
            handler_failures,
        })
    }

    pub(crate) fn observe_published(&self) {
        self.published.inc();
    }

    pub(crate) fn observe_delivered(&self) {
        self.delivered.inc();
    }

    pub(crate) fn observe_echo_suppressed(&self) {
        self.echo_suppressed.inc();
    }

    pub(crate) fn observe_malformed(&self) {
        self.malformed.inc();
    }

    pub(crate) fn observe_handler_failure(&self) {
        self.handler_failures.inc();
    }

    /// Current `(published, delivered, echo_suppressed, malformed, handler_failures)` counts.
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.published.get(),
            self.delivered.get(),
            self.echo_suppressed.get(),
            self.malformed.get(),
            self.handler_failures.get(),
        )
    }
}
