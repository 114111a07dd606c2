//! ---
//! atelier_section: "02-realtime-messaging"
//! atelier_subsection: "module"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Single-process adapter with synchronous dispatch."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

use crate::logging::{log_envelope, MessageDirection, PubSubMetrics};
use crate::registry::{invoke, HandlerRegistry};
use crate::{AdapterState, Envelope, MessageHandler, PubSubAdapter, PubSubError, Result};

const NAME: &str = "local";

/// In-process adapter.
///
/// `publish` invokes every matching handler before it returns. Pattern
/// subscriptions match every channel later published through this instance.
/// There is no network round trip, so no self-echo to suppress.
pub struct LocalAdapter {
    instance_id: String,
    state: RwLock<AdapterState>,
    registry: HandlerRegistry,
    metrics: Option<PubSubMetrics>,
}

impl LocalAdapter {
    /// Create an adapter that is ready immediately.
    pub fn new() -> Self {
        let adapter = Self {
            instance_id: Uuid::new_v4().to_string(),
            state: RwLock::new(AdapterState::Ready),
            registry: HandlerRegistry::default(),
            metrics: None,
        };
        info!(adapter = NAME, instance_id = %adapter.instance_id, "pubsub adapter ready");
        adapter
    }

    /// Attach prometheus counters.
    pub fn with_metrics(mut self, metrics: PubSubMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AdapterState {
        *self.state.read()
    }

    /// Number of registered channel and pattern handlers.
    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    fn ensure_ready(&self) -> Result<()> {
        let state = self.state();
        if state == AdapterState::Ready {
            Ok(())
        } else {
            Err(PubSubError::NotReady {
                adapter: NAME,
                state,
            })
        }
    }
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubAdapter for LocalAdapter {
    async fn publish(
        &self,
        channel: &str,
        payload: JsonValue,
        sender_id: Option<&str>,
    ) -> Result<()> {
        self.ensure_ready()?;
        ensure_named(channel)?;
        let envelope = Envelope::new(channel, payload, sender_id.unwrap_or(&self.instance_id));
        log_envelope(NAME, MessageDirection::Outbound, &envelope);
        if let Some(metrics) = &self.metrics {
            metrics.observe_published();
        }

        for (subscription, handler) in self.registry.matching(channel) {
            invoke(
                NAME,
                &subscription,
                &handler,
                envelope.clone(),
                self.metrics.as_ref(),
            );
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<()> {
        self.ensure_ready()?;
        ensure_named(channel)?;
        self.registry.insert_channel(channel, handler);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.ensure_ready()?;
        self.registry.remove_channel(channel);
        Ok(())
    }

    async fn pattern_subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<()> {
        self.ensure_ready()?;
        ensure_named(pattern)?;
        self.registry.insert_pattern(pattern, handler);
        Ok(())
    }

    async fn pattern_unsubscribe(&self, pattern: &str) -> Result<()> {
        self.ensure_ready()?;
        self.registry.remove_pattern(pattern);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.state() == AdapterState::Ready
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state == AdapterState::Closed {
                return Ok(());
            }
            *state = AdapterState::Closed;
        }
        self.registry.clear();
        info!(adapter = NAME, instance_id = %self.instance_id, "pubsub adapter closed");
        Ok(())
    }
}

pub(crate) fn ensure_named(name: &str) -> Result<()> {
    if name.is_empty() {
        Err(PubSubError::InvalidChannel)
    } else {
        Ok(())
    }
}
