//! ---
//! atelier_section: "02-realtime-messaging"
//! atelier_subsection: "module"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Broker-backed adapter shared by horizontally scaled instances."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerEvent, BrokerLink, BrokerPublisher, BrokerSubscriber};
use crate::local::ensure_named;
use crate::logging::{log_envelope, MessageDirection, PubSubMetrics};
use crate::pattern::escape_glob;
use crate::registry::{invoke, HandlerRegistry};
use crate::{
    AdapterState, ChannelPattern, Envelope, MessageHandler, PubSubAdapter, PubSubError, Result,
};

/// Adapter that shares channels with every other instance on the same broker.
///
/// Channels and patterns are prefixed with `namespace` on the wire and handed
/// back unprefixed. Envelopes this instance published come back through the
/// broker and are dropped before reaching handlers. Handlers run on the
/// adapter's dispatch task, concurrently with the rest of the application.
pub struct DistributedAdapter {
    broker: Arc<dyn Broker>,
    shared: Arc<Shared>,
    metrics: Option<PubSubMetrics>,
    session: RwLock<Option<Arc<Session>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

struct Session {
    publisher: Arc<dyn BrokerPublisher>,
    subscriber: Arc<dyn BrokerSubscriber>,
}

impl Session {
    async fn close(&self) {
        self.subscriber.close().await;
        self.publisher.close().await;
    }
}

/// State reachable from both the adapter and its dispatch task.
struct Shared {
    instance_id: String,
    namespace: String,
    broker_name: &'static str,
    state: RwLock<AdapterState>,
    registry: HandlerRegistry,
    /// Broker glob → application pattern.
    pattern_keys: RwLock<HashMap<String, String>>,
    /// Broker connections currently lost. Locked after `state`.
    links_down: Mutex<HashSet<BrokerLink>>,
}

impl DistributedAdapter {
    /// Construct an unconnected adapter; call [`Self::connect`] before use.
    pub fn new(broker: Arc<dyn Broker>, namespace: impl Into<String>) -> Self {
        let shared = Arc::new(Shared {
            instance_id: Uuid::new_v4().to_string(),
            namespace: namespace.into(),
            broker_name: broker.name(),
            state: RwLock::new(AdapterState::Constructed),
            registry: HandlerRegistry::default(),
            pattern_keys: RwLock::new(HashMap::new()),
            links_down: Mutex::new(HashSet::new()),
        });
        Self {
            broker,
            shared,
            metrics: None,
            session: RwLock::new(None),
            dispatcher: Mutex::new(None),
        }
    }

    /// Attach prometheus counters.
    pub fn with_metrics(mut self, metrics: PubSubMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AdapterState {
        *self.shared.state.read()
    }

    /// Prefix applied to every transport-level channel and pattern.
    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    /// Number of registered channel and pattern handlers.
    pub fn subscription_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Open the publish and subscribe connections. Readiness is reported only
    /// once both are up. A failed attempt leaves the adapter `Constructed`.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write();
            match *state {
                AdapterState::Constructed => *state = AdapterState::Connecting,
                AdapterState::Ready | AdapterState::Reconnecting => return Ok(()),
                other => return Err(self.not_ready(other)),
            }
        }
        info!(
            adapter = self.shared.broker_name,
            instance_id = %self.shared.instance_id,
            namespace = %self.shared.namespace,
            "connecting pubsub adapter"
        );

        let (session, events) = match self.open_session().await {
            Ok(opened) => opened,
            Err(err) => {
                error!(adapter = self.shared.broker_name, error = %err, "pubsub connect failed");
                let mut state = self.shared.state.write();
                if *state == AdapterState::Connecting {
                    *state = AdapterState::Constructed;
                }
                return Err(err);
            }
        };

        let session = Arc::new(session);
        let raced = {
            let mut state = self.shared.state.write();
            if *state == AdapterState::Connecting {
                *self.session.write() = Some(session.clone());
                *self.dispatcher.lock() = Some(tokio::spawn(dispatch_loop(
                    self.shared.clone(),
                    events,
                    self.metrics.clone(),
                )));
                *state = AdapterState::Ready;
                None
            } else {
                Some(*state)
            }
        };
        if let Some(state) = raced {
            session.close().await;
            return Err(self.not_ready(state));
        }

        info!(
            adapter = self.shared.broker_name,
            instance_id = %self.shared.instance_id,
            "pubsub adapter ready"
        );
        Ok(())
    }

    async fn open_session(&self) -> Result<(Session, UnboundedReceiver<BrokerEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let publisher = self.broker.connect_publisher(events_tx.clone()).await?;
        let subscriber = match self.broker.connect_subscriber(events_tx).await {
            Ok(subscriber) => subscriber,
            Err(err) => {
                publisher.close().await;
                return Err(err);
            }
        };
        Ok((
            Session {
                publisher,
                subscriber,
            },
            events_rx,
        ))
    }

    fn not_ready(&self, state: AdapterState) -> PubSubError {
        PubSubError::NotReady {
            adapter: self.shared.broker_name,
            state,
        }
    }

    fn ready_session(&self) -> Result<Arc<Session>> {
        let state = self.state();
        if state != AdapterState::Ready {
            return Err(self.not_ready(state));
        }
        self.session
            .read()
            .clone()
            .ok_or_else(|| self.not_ready(state))
    }

    fn transport_channel(&self, channel: &str) -> String {
        format!("{}{}", self.shared.namespace, channel)
    }

    fn transport_pattern(&self, pattern: &str) -> String {
        format!(
            "{}{}",
            escape_glob(&self.shared.namespace),
            ChannelPattern::new(pattern).to_glob()
        )
    }
}

#[async_trait]
impl PubSubAdapter for DistributedAdapter {
    async fn publish(
        &self,
        channel: &str,
        payload: JsonValue,
        sender_id: Option<&str>,
    ) -> Result<()> {
        let session = self.ready_session()?;
        ensure_named(channel)?;
        let envelope = Envelope::new(
            channel,
            payload,
            sender_id.unwrap_or(&self.shared.instance_id),
        );
        let wire = envelope.to_wire()?;
        session
            .publisher
            .publish(&self.transport_channel(channel), wire)
            .await
            .map_err(|err| {
                warn!(adapter = self.shared.broker_name, channel, error = %err, "publish failed");
                err
            })?;
        log_envelope(self.shared.broker_name, MessageDirection::Outbound, &envelope);
        if let Some(metrics) = &self.metrics {
            metrics.observe_published();
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<()> {
        let session = self.ready_session()?;
        ensure_named(channel)?;
        if self.shared.registry.insert_channel(channel, handler) {
            if let Err(err) = session
                .subscriber
                .subscribe(&self.transport_channel(channel))
                .await
            {
                self.shared.registry.remove_channel(channel);
                return Err(err);
            }
            debug!(adapter = self.shared.broker_name, channel, "subscribed");
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let session = self.ready_session()?;
        if self.shared.registry.remove_channel(channel) {
            session
                .subscriber
                .unsubscribe(&self.transport_channel(channel))
                .await?;
            debug!(adapter = self.shared.broker_name, channel, "unsubscribed");
        }
        Ok(())
    }

    async fn pattern_subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<()> {
        let session = self.ready_session()?;
        ensure_named(pattern)?;
        let glob = self.transport_pattern(pattern);
        if self.shared.registry.insert_pattern(pattern, handler) {
            self.shared
                .pattern_keys
                .write()
                .insert(glob.clone(), pattern.to_owned());
            if let Err(err) = session.subscriber.psubscribe(&glob).await {
                self.shared.registry.remove_pattern(pattern);
                self.shared.pattern_keys.write().remove(&glob);
                return Err(err);
            }
            debug!(adapter = self.shared.broker_name, pattern, "pattern subscribed");
        }
        Ok(())
    }

    async fn pattern_unsubscribe(&self, pattern: &str) -> Result<()> {
        let session = self.ready_session()?;
        if self.shared.registry.remove_pattern(pattern) {
            let glob = self.transport_pattern(pattern);
            self.shared.pattern_keys.write().remove(&glob);
            session.subscriber.punsubscribe(&glob).await?;
            debug!(adapter = self.shared.broker_name, pattern, "pattern unsubscribed");
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.state() == AdapterState::Ready
    }

    fn name(&self) -> &'static str {
        self.shared.broker_name
    }

    fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write();
            match *state {
                AdapterState::Closing | AdapterState::Closed => return Ok(()),
                _ => *state = AdapterState::Closing,
            }
        }

        // Once the dispatcher has been joined no handler can run again.
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
            let _ = dispatcher.await;
        }
        let session = self.session.write().take();
        if let Some(session) = session {
            session.close().await;
        }
        self.shared.registry.clear();
        self.shared.pattern_keys.write().clear();
        *self.shared.state.write() = AdapterState::Closed;
        info!(
            adapter = self.shared.broker_name,
            instance_id = %self.shared.instance_id,
            "pubsub adapter closed"
        );
        Ok(())
    }
}

impl Drop for DistributedAdapter {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.get_mut().take() {
            dispatcher.abort();
        }
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut events: UnboundedReceiver<BrokerEvent>,
    metrics: Option<PubSubMetrics>,
) {
    while let Some(event) = events.recv().await {
        match event {
            BrokerEvent::Message {
                channel,
                pattern,
                payload,
            } => shared.deliver(&channel, pattern.as_deref(), &payload, metrics.as_ref()),
            BrokerEvent::Disconnected { link, reason } => {
                shared.link_lost(link);
                warn!(
                    adapter = shared.broker_name,
                    instance_id = %shared.instance_id,
                    link = link.as_str(),
                    reason = %reason,
                    "pubsub transport lost; adapter not ready"
                );
            }
            BrokerEvent::Reconnected { link } => {
                let pending = shared.link_restored(link);
                info!(
                    adapter = shared.broker_name,
                    instance_id = %shared.instance_id,
                    link = link.as_str(),
                    pending,
                    "pubsub transport reconnected"
                );
            }
        }
    }
    shared.transition(AdapterState::Ready, AdapterState::Reconnecting);
    warn!(
        adapter = shared.broker_name,
        instance_id = %shared.instance_id,
        "pubsub event stream ended"
    );
}

impl Shared {
    fn transition(&self, from: AdapterState, to: AdapterState) {
        let mut state = self.state.write();
        if *state == from {
            *state = to;
        }
    }

    fn link_lost(&self, link: BrokerLink) {
        let mut state = self.state.write();
        self.links_down.lock().insert(link);
        if *state == AdapterState::Ready {
            *state = AdapterState::Reconnecting;
        }
    }

    /// Returns how many links are still down.
    fn link_restored(&self, link: BrokerLink) -> usize {
        let mut state = self.state.write();
        let mut down = self.links_down.lock();
        down.remove(&link);
        if down.is_empty() && *state == AdapterState::Reconnecting {
            *state = AdapterState::Ready;
        }
        down.len()
    }

    fn deliver(
        &self,
        transport_channel: &str,
        transport_pattern: Option<&str>,
        payload: &[u8],
        metrics: Option<&PubSubMetrics>,
    ) {
        if matches!(
            *self.state.read(),
            AdapterState::Closing | AdapterState::Closed
        ) {
            return;
        }
        let Some(channel) = transport_channel.strip_prefix(self.namespace.as_str()) else {
            debug!(
                adapter = self.broker_name,
                channel = transport_channel,
                "ignoring message outside namespace"
            );
            return;
        };

        let mut envelope = match Envelope::from_wire(channel, payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(adapter = self.broker_name, error = %err, "dropping malformed message");
                if let Some(metrics) = metrics {
                    metrics.observe_malformed();
                }
                return;
            }
        };
        if envelope.sender_id == self.instance_id {
            log_envelope(self.broker_name, MessageDirection::Suppressed, &envelope);
            if let Some(metrics) = metrics {
                metrics.observe_echo_suppressed();
            }
            return;
        }
        envelope.channel = channel.to_owned();

        let target = match transport_pattern {
            Some(glob) => {
                let key = self.pattern_keys.read().get(glob).cloned();
                key.and_then(|key| self.registry.pattern_handler(&key).map(|h| (key, h)))
            }
            None => self
                .registry
                .channel_handler(channel)
                .map(|h| (channel.to_owned(), h)),
        };
        if let Some((subscription, handler)) = target {
            invoke(self.broker_name, &subscription, &handler, envelope, metrics);
        }
    }
}
