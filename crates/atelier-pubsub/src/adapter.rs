//! ---
//! atelier_section: "02-realtime-messaging"
//! atelier_subsection: "module"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Adapter contract shared by every bus transport."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::{Envelope, Result};

/// Outcome returned by application handlers.
pub type HandlerResult = anyhow::Result<()>;

/// Callback invoked for every delivered envelope.
///
/// Distributed delivery runs handlers on the adapter's dispatch task, so they
/// must not assume exclusive access to shared state.
pub type MessageHandler = Arc<dyn Fn(Envelope) -> HandlerResult + Send + Sync>;

/// Wrap a closure as a [`MessageHandler`].
pub fn handler<F>(f: F) -> MessageHandler
where
    F: Fn(Envelope) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Adapter lifecycle.
///
/// `Constructed → Connecting → Ready → Closing → Closed`; the local adapter
/// starts in `Ready`. `Reconnecting` is entered from `Ready` when the broker
/// transport drops and left again when it recovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Built but not connected.
    Constructed,
    /// Connection handshake in progress.
    Connecting,
    /// Accepting operations.
    Ready,
    /// Transport lost after startup; waiting on the transport to recover.
    Reconnecting,
    /// Shutdown in progress.
    Closing,
    /// Terminal.
    Closed,
}

impl AdapterState {
    /// Short label used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterState::Constructed => "constructed",
            AdapterState::Connecting => "connecting",
            AdapterState::Ready => "ready",
            AdapterState::Reconnecting => "reconnecting",
            AdapterState::Closing => "closing",
            AdapterState::Closed => "closed",
        }
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations every bus transport offers.
///
/// Consumers depend on this trait only; which implementation backs it is
/// decided once at startup (see [`crate::factory`]).
#[async_trait]
pub trait PubSubAdapter: Send + Sync {
    /// Publish `payload` on `channel`. The envelope's sender is `sender_id`
    /// when given, otherwise this adapter's instance id.
    async fn publish(
        &self,
        channel: &str,
        payload: JsonValue,
        sender_id: Option<&str>,
    ) -> Result<()>;

    /// Register `handler` as the sole handler for `channel`, replacing any previous one.
    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<()>;

    /// Drop the handler for `channel`; a no-op when none is registered.
    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Register `handler` for every channel matching `pattern`.
    async fn pattern_subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<()>;

    /// Drop the handler for `pattern`; a no-op when none is registered.
    async fn pattern_unsubscribe(&self, pattern: &str) -> Result<()>;

    /// Whether the adapter currently accepts operations. Never blocks.
    fn is_ready(&self) -> bool;

    /// Adapter kind, e.g. `local` or the broker family.
    fn name(&self) -> &'static str;

    /// Identifier generated at construction; default sender id and echo filter key.
    fn instance_id(&self) -> &str;

    /// Release transport resources and clear subscriptions. Idempotent.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_helper_wraps_closures() {
        let h = handler(|envelope| {
            anyhow::ensure!(envelope.channel == "user:1", "unexpected channel");
            Ok(())
        });
        assert!(h(Envelope::new("user:1", JsonValue::Null, "a")).is_ok());
        assert!(h(Envelope::new("user:2", JsonValue::Null, "a")).is_err());
    }

    #[test]
    fn state_labels() {
        assert_eq!(AdapterState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(AdapterState::Closed.as_str(), "closed");
    }
}
