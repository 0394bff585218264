//! In-process broker.
//!
//! [`LocalBroker`] implements [`Transport`] without touching the network. It
//! routes published messages to every session whose filters match, and can
//! simulate outages and dropped connections.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;

use super::IngestError;
use super::transport::{
    Endpoint, EventSender, InboundMessage, Transport, TransportEvent, TransportSession,
    topic_matches,
};

#[derive(Default)]
struct SessionSlot {
    filters: BTreeSet<String>,
    events: Option<EventSender>,
}

struct BrokerInner {
    available: AtomicBool,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, SessionSlot>>,
}

impl BrokerInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, SessionSlot>> {
        // A panic while holding the lock leaves the map intact.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Broker living inside the process.
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<BrokerInner>,
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                available: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Deliver a message to all matching sessions. Returns the number of
    /// sessions that accepted it.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let payload = payload.into();
        let sessions = self.inner.sessions();

        let mut delivered = 0;
        for (id, slot) in sessions.iter() {
            let Some(events) = &slot.events else { continue };
            if !slot.filters.iter().any(|f| topic_matches(f, topic)) {
                continue;
            }
            let event = TransportEvent::Message(InboundMessage {
                topic: topic.to_owned(),
                payload: payload.clone(),
            });
            match events.try_send(event) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(session = id, topic, "Session queue full, message dropped");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Drop every open session as if the network went away.
    pub fn drop_connections(&self, reason: &str) {
        let dropped: Vec<_> = self.inner.sessions().drain().collect();
        for (id, slot) in dropped {
            if let Some(events) = slot.events {
                tracing::debug!(session = id, reason, "Dropping local session");
                let _ = events.try_send(TransportEvent::Closed {
                    reason: reason.to_owned(),
                });
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions().len()
    }

    /// Filters currently held by all sessions.
    pub fn active_filters(&self) -> BTreeSet<String> {
        self.inner
            .sessions()
            .values()
            .flat_map(|slot| slot.filters.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl Transport for LocalBroker {
    async fn probe(&self, endpoint: &Endpoint, _within: Duration) -> Result<(), IngestError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(IngestError::Connectivity {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            })
        }
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        events: EventSender,
    ) -> Result<Box<dyn TransportSession>, IngestError> {
        if !self.is_available() {
            return Err(IngestError::Connectivity {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.sessions().insert(
            id,
            SessionSlot {
                filters: BTreeSet::new(),
                events: Some(events),
            },
        );

        Ok(Box::new(LocalSession {
            id,
            broker: self.inner.clone(),
        }))
    }
}

struct LocalSession {
    id: u64,
    broker: Arc<BrokerInner>,
}

impl LocalSession {
    fn with_slot<R>(&self, f: impl FnOnce(&mut SessionSlot) -> R) -> Result<R, IngestError> {
        let mut sessions = self.broker.sessions();
        sessions
            .get_mut(&self.id)
            .map(f)
            .ok_or(IngestError::NotConnected)
    }
}

#[async_trait]
impl TransportSession for LocalSession {
    async fn subscribe(&self, topic: &str) -> Result<(), IngestError> {
        self.with_slot(|slot| {
            slot.filters.insert(topic.to_owned());
        })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), IngestError> {
        self.with_slot(|slot| {
            slot.filters.remove(topic);
        })
    }

    async fn close(&self) {
        self.broker.sessions().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_publish_routes_by_filter() {
        let broker = LocalBroker::new();
        let ep = Endpoint::new("local", 1883);
        let (tx, mut rx) = mpsc::channel(8);

        let session = broker.open(&ep, tx).await.unwrap();
        assert_eq!(broker.publish("x/temp", "{}"), 0);

        session.subscribe("x/+").await.unwrap();
        assert_eq!(broker.publish("x/temp", "{}"), 1);
        assert_eq!(broker.publish("y/temp", "{}"), 0);

        match rx.recv().await.unwrap() {
            TransportEvent::Message(msg) => assert_eq!(msg.topic, "x/temp"),
            other => panic!("unexpected event: {other:?}"),
        }

        session.unsubscribe("x/+").await.unwrap();
        assert_eq!(broker.publish("x/temp", "{}"), 0);

        session.close().await;
        assert_eq!(broker.session_count(), 0);
        assert!(matches!(
            session.subscribe("x/+").await,
            Err(IngestError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unavailable_and_dropped() {
        let broker = LocalBroker::new();
        let ep = Endpoint::new("local", 1883);

        broker.set_available(false);
        assert!(broker.probe(&ep, Duration::from_secs(1)).await.is_err());
        let (tx, _rx) = mpsc::channel(8);
        assert!(broker.open(&ep, tx).await.is_err());

        broker.set_available(true);
        let (tx, mut rx) = mpsc::channel(8);
        let _session = broker.open(&ep, tx).await.unwrap();
        broker.drop_connections("network down");

        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Closed { .. })
        ));
        assert_eq!(broker.session_count(), 0);
    }
}
