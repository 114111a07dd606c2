//! ---
//! atelier_section: "02-realtime-messaging"
//! atelier_subsection: "module"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Per-adapter handler bookkeeping and guarded dispatch."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::RwLock;
use tracing::{error, warn};

use crate::logging::{log_envelope, MessageDirection, PubSubMetrics};
use crate::{ChannelPattern, Envelope, MessageHandler};

/// One handler per exact channel and one per pattern string.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    channels: RwLock<HashMap<String, MessageHandler>>,
    patterns: RwLock<HashMap<String, (ChannelPattern, MessageHandler)>>,
}

impl HandlerRegistry {
    /// Returns `true` when `channel` had no handler before.
    pub(crate) fn insert_channel(&self, channel: &str, handler: MessageHandler) -> bool {
        self.channels
            .write()
            .insert(channel.to_owned(), handler)
            .is_none()
    }

    /// Returns `true` when a handler was removed.
    pub(crate) fn remove_channel(&self, channel: &str) -> bool {
        self.channels.write().remove(channel).is_some()
    }

    pub(crate) fn insert_pattern(&self, pattern: &str, handler: MessageHandler) -> bool {
        self.patterns
            .write()
            .insert(pattern.to_owned(), (ChannelPattern::new(pattern), handler))
            .is_none()
    }

    pub(crate) fn remove_pattern(&self, pattern: &str) -> bool {
        self.patterns.write().remove(pattern).is_some()
    }

    pub(crate) fn channel_handler(&self, channel: &str) -> Option<MessageHandler> {
        self.channels.read().get(channel).cloned()
    }

    pub(crate) fn pattern_handler(&self, pattern: &str) -> Option<MessageHandler> {
        self.patterns
            .read()
            .get(pattern)
            .map(|(_, handler)| handler.clone())
    }

    /// Snapshot of the exact handler plus every matching pattern handler, so
    /// handlers may (un)subscribe while being invoked.
    pub(crate) fn matching(&self, channel: &str) -> Vec<(String, MessageHandler)> {
        let mut matched = Vec::new();
        if let Some(handler) = self.channel_handler(channel) {
            matched.push((channel.to_owned(), handler));
        }
        let patterns = self.patterns.read();
        matched.extend(
            patterns
                .iter()
                .filter(|(_, (compiled, _))| compiled.matches(channel))
                .map(|(key, (_, handler))| (key.clone(), handler.clone())),
        );
        matched
    }

    pub(crate) fn len(&self) -> usize {
        self.channels.read().len() + self.patterns.read().len()
    }

    pub(crate) fn clear(&self) {
        self.channels.write().clear();
        self.patterns.write().clear();
    }
}

/// Run `handler`, containing errors and panics so one failing consumer never
/// stops delivery to the others.
pub(crate) fn invoke(
    adapter: &str,
    subscription: &str,
    handler: &MessageHandler,
    envelope: Envelope,
    metrics: Option<&PubSubMetrics>,
) {
    log_envelope(adapter, MessageDirection::Inbound, &envelope);
    let channel = envelope.channel.clone();
    match catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
        Ok(Ok(())) => {
            if let Some(metrics) = metrics {
                metrics.observe_delivered();
            }
        }
        Ok(Err(err)) => {
            warn!(adapter, subscription, channel = %channel, error = %err, "handler failed");
            if let Some(metrics) = metrics {
                metrics.observe_handler_failure();
            }
        }
        Err(_) => {
            error!(adapter, subscription, channel = %channel, "handler panicked");
            if let Some(metrics) = metrics {
                metrics.observe_handler_failure();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::Value as JsonValue;

    use super::*;
    use crate::handler;

    fn counting(counter: &Arc<AtomicUsize>) -> MessageHandler {
        let counter = counter.clone();
        handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn replacing_a_channel_handler_keeps_one_entry() {
        let registry = HandlerRegistry::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        assert!(registry.insert_channel("user:1", counting(&first)));
        assert!(!registry.insert_channel("user:1", counting(&second)));
        assert_eq!(registry.len(), 1);

        for (_, h) in registry.matching("user:1") {
            h(Envelope::new("user:1", JsonValue::Null, "x")).unwrap();
        }
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn matching_collects_exact_and_patterns() {
        let registry = HandlerRegistry::default();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.insert_channel("canvas:a", counting(&counter));
        registry.insert_pattern("canvas:*", counting(&counter));
        registry.insert_pattern("user:*", counting(&counter));

        let keys: Vec<String> = registry.matching("canvas:a").into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"canvas:a".to_owned()));
        assert!(keys.contains(&"canvas:*".to_owned()));

        assert!(registry.remove_pattern("canvas:*"));
        assert!(!registry.remove_pattern("canvas:*"));
        registry.clear();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn invoke_contains_errors_and_panics() {
        let registry = prometheus::Registry::new();
        let metrics = PubSubMetrics::register(&registry).unwrap();
        let failing = handler(|_| anyhow::bail!("boom"));
        let panicking = handler(|_| panic!("handler exploded"));

        invoke("local", "c", &failing, Envelope::new("c", JsonValue::Null, "x"), Some(&metrics));
        invoke("local", "c", &panicking, Envelope::new("c", JsonValue::Null, "x"), Some(&metrics));

        let (_, delivered, _, _, failures) = metrics.snapshot();
        assert_eq!(delivered, 0);
        assert_eq!(failures, 2);
    }
}
