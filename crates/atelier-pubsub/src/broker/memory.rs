//! ---
//! atelier_section: "02-realtime-messaging"
//! atelier_subsection: "module"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Process-local broker with pub/sub broker semantics."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    Broker, BrokerEvent, BrokerEventSender, BrokerLink, BrokerPublisher, BrokerSubscriber,
};
use crate::{ChannelPattern, PubSubError, Result};

/// Broker living inside the current process.
///
/// Behaves like an external broker from the adapter's point of view: each
/// subscriber connection has its own subscription set, delivery is
/// asynchronous through the connection's event queue, and patterns use the
/// broker glob dialect. Clones share the same broker, which lets several
/// adapters in one test talk to each other. The extra controls simulate the
/// failure modes of a networked broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    next_connection: u64,
    connections: HashMap<u64, Connection>,
    publishers: HashMap<u64, BrokerEventSender>,
    available: bool,
    severed: bool,
    publishers_severed: bool,
}

struct Connection {
    channels: HashSet<String>,
    patterns: HashMap<String, ChannelPattern>,
    events: BrokerEventSender,
}

impl InMemoryBroker {
    /// Create an empty broker that accepts connections.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                next_connection: 0,
                connections: HashMap::new(),
                publishers: HashMap::new(),
                available: true,
                severed: false,
                publishers_severed: false,
            })),
        }
    }

    /// Refuse (`false`) or accept (`true`) new connections.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Publish raw bytes as any broker client could, bypassing envelope encoding.
    pub fn inject_raw(&self, channel: &str, payload: impl Into<Vec<u8>>) {
        self.route(channel, payload.into());
    }

    /// Drop every live connection: both sides receive `Disconnected`, traffic
    /// is lost and publishes fail until [`Self::restore_connections`].
    pub fn sever_connections(&self) {
        let mut state = self.state.lock();
        state.severed = true;
        state.publishers_severed = true;
        for connection in state.connections.values() {
            let _ = connection.events.send(disconnected(BrokerLink::Subscriber));
        }
        for events in state.publishers.values() {
            let _ = events.send(disconnected(BrokerLink::Publisher));
        }
    }

    /// Bring severed connections back with their subscriptions intact.
    pub fn restore_connections(&self) {
        let mut state = self.state.lock();
        state.severed = false;
        state.publishers_severed = false;
        for connection in state.connections.values() {
            let _ = connection.events.send(BrokerEvent::Reconnected {
                link: BrokerLink::Subscriber,
            });
        }
        for events in state.publishers.values() {
            let _ = events.send(BrokerEvent::Reconnected {
                link: BrokerLink::Publisher,
            });
        }
    }

    /// Drop only the publish connections; subscriptions keep receiving.
    pub fn sever_publishers(&self) {
        let mut state = self.state.lock();
        state.publishers_severed = true;
        for events in state.publishers.values() {
            let _ = events.send(disconnected(BrokerLink::Publisher));
        }
    }

    /// Bring severed publish connections back.
    pub fn restore_publishers(&self) {
        let mut state = self.state.lock();
        state.publishers_severed = false;
        for events in state.publishers.values() {
            let _ = events.send(BrokerEvent::Reconnected {
                link: BrokerLink::Publisher,
            });
        }
    }

    /// Number of open subscriber connections.
    pub fn subscriber_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Number of subscriber connections whose consumer still listens.
    pub fn listening_connections(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .filter(|connection| !connection.events.is_closed())
            .count()
    }

    fn route(&self, channel: &str, payload: Vec<u8>) {
        let state = self.state.lock();
        if state.severed {
            debug!(channel, "in-memory broker severed; dropping message");
            return;
        }
        for connection in state.connections.values() {
            if connection.channels.contains(channel) {
                let _ = connection.events.send(BrokerEvent::Message {
                    channel: channel.to_owned(),
                    pattern: None,
                    payload: payload.clone(),
                });
            }
            for (glob, compiled) in &connection.patterns {
                if compiled.matches(channel) {
                    let _ = connection.events.send(BrokerEvent::Message {
                        channel: channel.to_owned(),
                        pattern: Some(glob.clone()),
                        payload: payload.clone(),
                    });
                }
            }
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.state.lock().available {
            Ok(())
        } else {
            Err(PubSubError::Transport("in-memory broker unavailable".to_owned()))
        }
    }

    fn register(&self, state: &mut BrokerState) -> u64 {
        state.next_connection += 1;
        state.next_connection
    }

    fn with_connection<T>(&self, id: u64, f: impl FnOnce(&mut Connection) -> T) -> Result<T> {
        let mut state = self.state.lock();
        if state.severed {
            return Err(PubSubError::Transport("connection severed".to_owned()));
        }
        state
            .connections
            .get_mut(&id)
            .map(f)
            .ok_or_else(|| PubSubError::Transport("subscriber connection closed".to_owned()))
    }
}

fn disconnected(link: BrokerLink) -> BrokerEvent {
    BrokerEvent::Disconnected {
        link,
        reason: "connection severed".to_owned(),
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect_publisher(
        &self,
        events: BrokerEventSender,
    ) -> Result<Arc<dyn BrokerPublisher>> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        let id = self.register(&mut state);
        state.publishers.insert(id, events);
        Ok(Arc::new(MemoryPublisher {
            broker: self.clone(),
            id,
            closed: AtomicBool::new(false),
        }))
    }

    async fn connect_subscriber(
        &self,
        events: BrokerEventSender,
    ) -> Result<Arc<dyn BrokerSubscriber>> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        let id = self.register(&mut state);
        state.connections.insert(
            id,
            Connection {
                channels: HashSet::new(),
                patterns: HashMap::new(),
                events,
            },
        );
        Ok(Arc::new(MemorySubscriber {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryPublisher {
    broker: InMemoryBroker,
    id: u64,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerPublisher for MemoryPublisher {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PubSubError::Transport("publisher connection closed".to_owned()));
        }
        if self.broker.state.lock().publishers_severed {
            return Err(PubSubError::Transport("connection severed".to_owned()));
        }
        self.broker.route(channel, payload);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.broker.state.lock().publishers.remove(&self.id);
    }
}

struct MemorySubscriber {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerSubscriber for MemorySubscriber {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        self.broker.with_connection(self.id, |connection| {
            connection.channels.insert(channel.to_owned());
        })
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.broker.with_connection(self.id, |connection| {
            connection.channels.remove(channel);
        })
    }

    async fn psubscribe(&self, pattern: &str) -> Result<()> {
        self.broker.with_connection(self.id, |connection| {
            connection
                .patterns
                .insert(pattern.to_owned(), ChannelPattern::from_glob(pattern));
        })
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<()> {
        self.broker.with_connection(self.id, |connection| {
            connection.patterns.remove(pattern);
        })
    }

    async fn close(&self) {
        self.broker.state.lock().connections.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn routes_exact_and_pattern_subscriptions_per_connection() {
        let broker = InMemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = broker.connect_subscriber(tx.clone()).await.unwrap();
        let publisher = broker.connect_publisher(tx).await.unwrap();

        subscriber.subscribe("ns:canvas:a").await.unwrap();
        subscriber.psubscribe("ns:canvas:*").await.unwrap();
        publisher.publish("ns:canvas:a", b"x".to_vec()).await.unwrap();
        publisher.publish("ns:user:1", b"y".to_vec()).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, BrokerEvent::Message { pattern: None, .. }));
        assert!(matches!(
            second,
            BrokerEvent::Message { pattern: Some(ref p), .. } if p == "ns:canvas:*"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn severing_notifies_both_links_and_drops_traffic() {
        let broker = InMemoryBroker::new();
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
        let (pub_tx, mut pub_rx) = mpsc::unbounded_channel();
        let subscriber = broker.connect_subscriber(sub_tx).await.unwrap();
        let publisher = broker.connect_publisher(pub_tx).await.unwrap();
        subscriber.subscribe("c").await.unwrap();

        broker.sever_connections();
        assert!(matches!(
            sub_rx.recv().await,
            Some(BrokerEvent::Disconnected { link: BrokerLink::Subscriber, .. })
        ));
        assert!(matches!(
            pub_rx.recv().await,
            Some(BrokerEvent::Disconnected { link: BrokerLink::Publisher, .. })
        ));
        assert!(publisher.publish("c", b"lost".to_vec()).await.is_err());

        broker.restore_connections();
        assert_eq!(
            sub_rx.recv().await,
            Some(BrokerEvent::Reconnected { link: BrokerLink::Subscriber })
        );
        assert_eq!(
            pub_rx.recv().await,
            Some(BrokerEvent::Reconnected { link: BrokerLink::Publisher })
        );
        publisher.publish("c", b"ok".to_vec()).await.unwrap();
        assert!(matches!(sub_rx.recv().await, Some(BrokerEvent::Message { .. })));
    }

    #[tokio::test]
    async fn severing_publishers_leaves_subscriptions_alone() {
        let broker = InMemoryBroker::new();
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
        let (pub_tx, mut pub_rx) = mpsc::unbounded_channel();
        let subscriber = broker.connect_subscriber(sub_tx).await.unwrap();
        let publisher = broker.connect_publisher(pub_tx).await.unwrap();
        subscriber.subscribe("c").await.unwrap();

        broker.sever_publishers();
        assert!(matches!(
            pub_rx.recv().await,
            Some(BrokerEvent::Disconnected { link: BrokerLink::Publisher, .. })
        ));
        assert!(publisher.publish("c", b"lost".to_vec()).await.is_err());
        broker.inject_raw("c", b"still routed".to_vec());
        assert!(matches!(sub_rx.recv().await, Some(BrokerEvent::Message { .. })));

        broker.restore_publishers();
        assert_eq!(
            pub_rx.recv().await,
            Some(BrokerEvent::Reconnected { link: BrokerLink::Publisher })
        );
        publisher.publish("c", b"ok".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(broker.connect_publisher(tx.clone()).await.is_err());
        assert!(broker.connect_subscriber(tx).await.is_err());
    }

    #[tokio::test]
    async fn closed_subscriber_leaves_the_broker() {
        let broker = InMemoryBroker::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = broker.connect_subscriber(tx).await.unwrap();
        assert_eq!(broker.subscriber_connections(), 1);
        assert_eq!(broker.listening_connections(), 1);
        drop(rx);
        assert_eq!(broker.listening_connections(), 0);

        subscriber.close().await;
        subscriber.close().await;
        assert_eq!(broker.subscriber_connections(), 0);
        assert!(subscriber.subscribe("c").await.is_err());
    }
}
