//! ---
//! atelier_section: "02-realtime-messaging"
//! atelier_subsection: "module"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Redis pub/sub transport with reconnection on both connections."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::{MultiplexedConnection, PubSubSink, PubSubStream};
use ::redis::{AsyncCommands, Client, Msg};
use async_trait::async_trait;
use atelier_common::config::PubSubConfig;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    Broker, BrokerEvent, BrokerEventSender, BrokerLink, BrokerPublisher, BrokerSubscriber,
};
use crate::{PubSubError, Result};

const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Redis-backed broker.
///
/// Publishing goes through a multiplexed connection; subscriptions use a
/// dedicated pub/sub connection because Redis forbids regular commands on a
/// connection with active subscriptions. Either connection is re-established
/// with exponential backoff when it drops, and each reports its own
/// `Disconnected`/`Reconnected` pair. The pub/sub side re-issues every
/// subscription before reporting `Reconnected`.
#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    backoff: Backoff,
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    initial: Duration,
    max: Duration,
}

impl RedisBroker {
    /// Build a broker for `url` (e.g. `redis://127.0.0.1:6379`). Nothing is
    /// connected until the adapter asks for connections.
    pub fn open(url: &str) -> Result<Self> {
        Ok(Self {
            client: Client::open(url)?,
            backoff: Backoff {
                initial: DEFAULT_INITIAL_DELAY,
                max: DEFAULT_MAX_DELAY,
            },
        })
    }

    /// Build from the `[pubsub]` configuration section.
    pub fn from_config(config: &PubSubConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| PubSubError::Transport("redis url is not configured".to_owned()))?;
        Ok(Self::open(url)?.with_backoff(
            config.reconnect_initial_delay,
            config.reconnect_max_delay,
        ))
    }

    /// Override the reconnect backoff window.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff = Backoff {
            initial,
            max: max.max(initial),
        };
        self
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect_publisher(
        &self,
        events: BrokerEventSender,
    ) -> Result<Arc<dyn BrokerPublisher>> {
        let connection = self.client.get_multiplexed_async_connection().await?;
        debug!("redis publish connection established");
        Ok(Arc::new(RedisPublisher {
            shared: Arc::new(PublisherShared {
                client: self.client.clone(),
                connection: Mutex::new(Some((0, connection))),
                events,
                backoff: self.backoff,
                closed: AtomicBool::new(false),
            }),
            redial: Mutex::new(None),
        }))
    }

    async fn connect_subscriber(
        &self,
        events: BrokerEventSender,
    ) -> Result<Arc<dyn BrokerSubscriber>> {
        let (sink, stream) = self.client.get_async_pubsub().await?.split();
        debug!("redis pub/sub connection established");
        let shared = Arc::new(SubscriberShared {
            sink: tokio::sync::Mutex::new(Some(sink)),
            channels: Mutex::new(HashSet::new()),
            patterns: Mutex::new(HashSet::new()),
        });
        let pump = tokio::spawn(pump_messages(
            self.client.clone(),
            shared.clone(),
            stream,
            events,
            self.backoff,
        ));
        Ok(Arc::new(RedisSubscriber {
            shared,
            pump: Mutex::new(Some(pump)),
        }))
    }
}

/// Publish side. A connection-level failure discards the connection, reports
/// `Disconnected` and redials in the background until `Reconnected`.
struct RedisPublisher {
    shared: Arc<PublisherShared>,
    redial: Mutex<Option<JoinHandle<()>>>,
}

struct PublisherShared {
    client: Client,
    /// Generation-tagged connection; `None` while redialing or closed.
    connection: Mutex<Option<(u64, MultiplexedConnection)>>,
    events: BrokerEventSender,
    backoff: Backoff,
    closed: AtomicBool,
}

impl RedisPublisher {
    fn connection_lost(&self, generation: u64, err: &::redis::RedisError) {
        {
            let mut slot = self.shared.connection.lock();
            let current = slot.as_ref().map(|(current, _)| *current);
            // Another publish already noticed.
            if current != Some(generation) {
                return;
            }
            slot.take();
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        warn!(error = %err, "redis publish connection lost");
        let lost = BrokerEvent::Disconnected {
            link: BrokerLink::Publisher,
            reason: err.to_string(),
        };
        if self.shared.events.send(lost).is_err() {
            return;
        }
        let task = tokio::spawn(redial(self.shared.clone(), generation + 1));
        if let Some(previous) = self.redial.lock().replace(task) {
            previous.abort();
        }
    }
}

#[async_trait]
impl BrokerPublisher for RedisPublisher {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let (generation, mut connection) = self
            .shared
            .connection
            .lock()
            .clone()
            .ok_or_else(|| PubSubError::Transport("redis publish connection unavailable".to_owned()))?;
        let receivers: i64 = match connection.publish(channel, payload).await {
            Ok(receivers) => receivers,
            Err(err) => {
                if breaks_connection(&err) {
                    self.connection_lost(generation, &err);
                }
                return Err(err.into());
            }
        };
        debug!(channel, receivers, "redis publish accepted");
        Ok(())
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(redial) = self.redial.lock().take() {
            redial.abort();
        }
        self.shared.connection.lock().take();
    }
}

impl Drop for RedisPublisher {
    fn drop(&mut self) {
        if let Some(redial) = self.redial.get_mut().take() {
            redial.abort();
        }
    }
}

fn breaks_connection(err: &::redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
        || err.is_unrecoverable_error()
}

async fn redial(shared: Arc<PublisherShared>, generation: u64) {
    let mut delay = shared.backoff.initial;
    loop {
        if shared.events.is_closed() || shared.closed.load(Ordering::Acquire) {
            return;
        }
        tokio::time::sleep(delay).await;
        match shared.client.get_multiplexed_async_connection().await {
            Ok(connection) => {
                {
                    let mut slot = shared.connection.lock();
                    if shared.closed.load(Ordering::Acquire) {
                        return;
                    }
                    *slot = Some((generation, connection));
                }
                info!("redis publish connection restored");
                let _ = shared.events.send(BrokerEvent::Reconnected {
                    link: BrokerLink::Publisher,
                });
                return;
            }
            Err(err) => {
                warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "redis publish redial failed")
            }
        }
        delay = (delay * 2).min(shared.backoff.max);
    }
}

struct SubscriberShared {
    sink: tokio::sync::Mutex<Option<PubSubSink>>,
    channels: Mutex<HashSet<String>>,
    patterns: Mutex<HashSet<String>>,
}

struct RedisSubscriber {
    shared: Arc<SubscriberShared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

fn unavailable() -> PubSubError {
    PubSubError::Transport("redis pub/sub connection unavailable".to_owned())
}

#[async_trait]
impl BrokerSubscriber for RedisSubscriber {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        let mut sink = self.shared.sink.lock().await;
        sink.as_mut().ok_or_else(unavailable)?.subscribe(channel).await?;
        self.shared.channels.lock().insert(channel.to_owned());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let mut sink = self.shared.sink.lock().await;
        sink.as_mut().ok_or_else(unavailable)?.unsubscribe(channel).await?;
        self.shared.channels.lock().remove(channel);
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<()> {
        let mut sink = self.shared.sink.lock().await;
        sink.as_mut().ok_or_else(unavailable)?.psubscribe(pattern).await?;
        self.shared.patterns.lock().insert(pattern.to_owned());
        Ok(())
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<()> {
        let mut sink = self.shared.sink.lock().await;
        sink.as_mut().ok_or_else(unavailable)?.punsubscribe(pattern).await?;
        self.shared.patterns.lock().remove(pattern);
        Ok(())
    }

    async fn close(&self) {
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }
        self.shared.sink.lock().await.take();
        self.shared.channels.lock().clear();
        self.shared.patterns.lock().clear();
    }
}

impl Drop for RedisSubscriber {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

fn message_event(message: &Msg) -> BrokerEvent {
    let pattern = if message.from_pattern() {
        message.get_pattern::<String>().ok()
    } else {
        None
    };
    BrokerEvent::Message {
        channel: message.get_channel_name().to_owned(),
        pattern,
        payload: message.get_payload_bytes().to_vec(),
    }
}

async fn pump_messages(
    client: Client,
    shared: Arc<SubscriberShared>,
    mut stream: PubSubStream,
    events: BrokerEventSender,
    backoff: Backoff,
) {
    loop {
        while let Some(message) = stream.next().await {
            if events.send(message_event(&message)).is_err() {
                return;
            }
        }

        shared.sink.lock().await.take();
        warn!("redis pub/sub connection lost");
        let lost = BrokerEvent::Disconnected {
            link: BrokerLink::Subscriber,
            reason: "redis pub/sub stream ended".to_owned(),
        };
        if events.send(lost).is_err() {
            return;
        }

        match reconnect(&client, &shared, &events, backoff).await {
            Some(next) => stream = next,
            None => return,
        }
        info!("redis pub/sub connection restored");
        let restored = BrokerEvent::Reconnected {
            link: BrokerLink::Subscriber,
        };
        if events.send(restored).is_err() {
            return;
        }
    }
}

async fn reconnect(
    client: &Client,
    shared: &SubscriberShared,
    events: &BrokerEventSender,
    backoff: Backoff,
) -> Option<PubSubStream> {
    let mut delay = backoff.initial;
    loop {
        if events.is_closed() {
            return None;
        }
        tokio::time::sleep(delay).await;
        match client.get_async_pubsub().await {
            Ok(pubsub) => {
                let (mut sink, stream) = pubsub.split();
                let mut slot = shared.sink.lock().await;
                match resubscribe(&mut sink, shared).await {
                    Ok(()) => {
                        *slot = Some(sink);
                        return Some(stream);
                    }
                    Err(err) => warn!(error = %err, "redis resubscribe failed"),
                }
            }
            Err(err) => {
                warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "redis reconnect failed")
            }
        }
        delay = (delay * 2).min(backoff.max);
    }
}

async fn resubscribe(sink: &mut PubSubSink, shared: &SubscriberShared) -> ::redis::RedisResult<()> {
    let channels: Vec<String> = shared.channels.lock().iter().cloned().collect();
    let patterns: Vec<String> = shared.patterns.lock().iter().cloned().collect();
    for channel in &channels {
        sink.subscribe(channel).await?;
    }
    for pattern in &patterns {
        sink.psubscribe(pattern).await?;
    }
    debug!(
        channels = channels.len(),
        patterns = patterns.len(),
        "redis subscriptions re-established"
    );
    Ok(())
}
