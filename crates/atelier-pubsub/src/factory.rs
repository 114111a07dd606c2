//! ---
//! atelier_section: "02-realtime-messaging"
//! atelier_subsection: "module"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Adapter selection from runtime configuration."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
use std::sync::Arc;

use atelier_common::config::{AdapterMode, PubSubConfig};
use tracing::info;

use crate::{Broker, DistributedAdapter, LocalAdapter, PubSubAdapter, RedisBroker, Result};

/// Adapter handle shared across the application.
pub type SharedAdapter = Arc<dyn PubSubAdapter>;

/// Build and connect the adapter selected by `config`.
///
/// `local` needs nothing else; `distributed` talks to Redis at `config.url`.
pub async fn connect_adapter(config: &PubSubConfig) -> Result<SharedAdapter> {
    match config.mode {
        AdapterMode::Local => Ok(local()),
        AdapterMode::Distributed => {
            let broker = RedisBroker::from_config(config)?;
            connect_distributed(config, Arc::new(broker)).await
        }
    }
}

/// Like [`connect_adapter`] but distributed mode uses the supplied broker.
pub async fn connect_adapter_with_broker(
    config: &PubSubConfig,
    broker: Arc<dyn Broker>,
) -> Result<SharedAdapter> {
    match config.mode {
        AdapterMode::Local => Ok(local()),
        AdapterMode::Distributed => connect_distributed(config, broker).await,
    }
}

fn local() -> SharedAdapter {
    info!(mode = "local", "selected pubsub adapter");
    Arc::new(LocalAdapter::new())
}

async fn connect_distributed(
    config: &PubSubConfig,
    broker: Arc<dyn Broker>,
) -> Result<SharedAdapter> {
    info!(
        mode = "distributed",
        broker = broker.name(),
        namespace = %config.namespace,
        "selected pubsub adapter"
    );
    let adapter = DistributedAdapter::new(broker, config.namespace.clone());
    adapter.connect().await?;
    Ok(Arc::new(adapter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBroker;

    #[tokio::test]
    async fn default_config_selects_local() {
        let adapter = connect_adapter(&PubSubConfig::default()).await.unwrap();
        assert_eq!(adapter.name(), "local");
        assert!(adapter.is_ready());
    }

    #[tokio::test]
    async fn distributed_without_url_fails() {
        let config = PubSubConfig {
            mode: AdapterMode::Distributed,
            url: None,
            ..PubSubConfig::default()
        };
        assert!(connect_adapter(&config).await.is_err());
    }

    #[tokio::test]
    async fn distributed_uses_supplied_broker() {
        let config = PubSubConfig {
            mode: AdapterMode::Distributed,
            ..PubSubConfig::default()
        };
        let broker = InMemoryBroker::new();
        let adapter = connect_adapter_with_broker(&config, Arc::new(broker.clone()))
            .await
            .unwrap();
        assert_eq!(adapter.name(), "memory");
        assert!(adapter.is_ready());
        assert_eq!(broker.subscriber_connections(), 1);
        adapter.close().await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_broker_surfaces_connect_error() {
        let config = PubSubConfig {
            mode: AdapterMode::Distributed,
            ..PubSubConfig::default()
        };
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        assert!(connect_adapter_with_broker(&config, Arc::new(broker))
            .await
            .is_err());
    }
}
