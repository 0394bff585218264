//! Ingestion pipeline: connection lifecycle, subscriptions and fan-out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::IngestError;
use super::reading::decode_message;
use super::transport::{Endpoint, Transport, TransportEvent, TransportSession};
use crate::connection::{ConnectionState, StateCell};
use crate::live::{LiveChannel, LiveHub};
use crate::storage::StorageWriter;

/// Default budget for probe plus handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default depth of the session-to-pipeline event queue.
pub const DEFAULT_DELIVERY_CAPACITY: usize = 1024;

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub connect_timeout: Duration,
    pub delivery_capacity: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            delivery_capacity: DEFAULT_DELIVERY_CAPACITY,
        }
    }
}

/// Outcome of a subscribe or unsubscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionChange {
    /// The active set changed.
    Applied,
    /// The topic was already in the requested state.
    Unchanged,
}

impl SubscriptionChange {
    pub fn is_changed(self) -> bool {
        self == Self::Applied
    }
}

#[derive(Default)]
struct Counters {
    messages: AtomicU64,
    readings: AtomicU64,
    decode_failures: AtomicU64,
    store_rejected: AtomicU64,
    transport_drops: AtomicU64,
}

/// Point-in-time pipeline counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStatsSnapshot {
    pub messages: u64,
    pub readings: u64,
    pub decode_failures: u64,
    pub store_rejected: u64,
    pub transport_drops: u64,
}

/// Connection state as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub state: ConnectionState,
    pub endpoint: Option<String>,
    pub subscriptions: Vec<String>,
    pub stats: PipelineStatsSnapshot,
}

/// Everything guarded by the subscription lock.
#[derive(Default)]
struct Link {
    session: Option<Box<dyn TransportSession>>,
    endpoint: Option<Endpoint>,
    /// Active topics in insertion order.
    topics: Vec<String>,
    delivery: Option<JoinHandle<()>>,
    /// Bumped on every connect and disconnect so stale close notices are ignored.
    generation: u64,
}

struct PipelineInner {
    transport: Arc<dyn Transport>,
    writer: StorageWriter,
    hub: LiveHub,
    options: PipelineOptions,
    state: StateCell,
    link: Mutex<Link>,
    counters: Counters,
}

/// Turns transport messages into readings, then into stored points and live
/// updates.
#[derive(Clone)]
pub struct IngestionPipeline {
    inner: Arc<PipelineInner>,
}

impl IngestionPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        writer: StorageWriter,
        hub: LiveHub,
        options: PipelineOptions,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                transport,
                writer,
                hub,
                options,
                state: StateCell::default(),
                link: Mutex::new(Link::default()),
                counters: Counters::default(),
            }),
        }
    }

    /// Probe the endpoint, open a session and start delivering messages.
    ///
    /// Topics retained from a session that dropped are subscribed again.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<ConnectionHandle, IngestError> {
        let mut link = self.inner.link.lock().await;

        match self.inner.state.get() {
            ConnectionState::Closed => return Err(IngestError::ShutDown),
            ConnectionState::Connected if link.session.is_some() => {
                let current = link.endpoint.as_ref().unwrap_or(endpoint);
                return Err(IngestError::AlreadyConnected(current.to_string()));
            }
            _ => {}
        }

        let budget = self.inner.options.connect_timeout;
        self.inner.transport.probe(endpoint, budget).await?;

        let (events_tx, events_rx) = mpsc::channel(self.inner.options.delivery_capacity.max(1));
        let session = match timeout(budget, self.inner.transport.open(endpoint, events_tx)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(IngestError::Connectivity {
                    endpoint: endpoint.to_string(),
                    reason: format!("handshake exceeded {}", humantime::format_duration(budget)),
                });
            }
        };

        for topic in &link.topics {
            if let Err(e) = session.subscribe(topic).await {
                tracing::warn!(%endpoint, topic, error = %e, "Failed to restore subscription");
            }
        }

        link.generation += 1;
        let generation = link.generation;
        if let Some(stale) = link.delivery.take() {
            stale.abort();
        }
        link.delivery = Some(tokio::spawn(deliver(
            Arc::downgrade(&self.inner),
            events_rx,
            generation,
        )));
        link.session = Some(session);
        link.endpoint = Some(endpoint.clone());
        self.inner.state.set(ConnectionState::Connected);

        tracing::info!(
            %endpoint,
            restored = link.topics.len(),
            "Ingestion pipeline connected"
        );

        Ok(ConnectionHandle {
            pipeline: self.clone(),
            endpoint: endpoint.clone(),
        })
    }

    /// Add a topic to the active set.
    pub async fn subscribe(&self, topic: &str) -> Result<SubscriptionChange, IngestError> {
        let topic = normalize_topic(topic)?;
        let mut link = self.inner.link.lock().await;

        let session = match &link.session {
            Some(session) if self.inner.state.is_connected() => session,
            _ => return Err(IngestError::NotConnected),
        };

        if link.topics.iter().any(|t| t == topic) {
            tracing::debug!(topic, "Already subscribed");
            return Ok(SubscriptionChange::Unchanged);
        }

        session.subscribe(topic).await?;
        link.topics.push(topic.to_owned());
        tracing::info!(topic, "Subscribed");
        Ok(SubscriptionChange::Applied)
    }

    /// Remove a topic from the active set.
    pub async fn unsubscribe(&self, topic: &str) -> Result<SubscriptionChange, IngestError> {
        let topic = normalize_topic(topic)?;
        let mut link = self.inner.link.lock().await;

        let Some(position) = link.topics.iter().position(|t| t == topic) else {
            tracing::debug!(topic, "Not subscribed");
            return Ok(SubscriptionChange::Unchanged);
        };

        if let Some(session) = &link.session
            && self.inner.state.is_connected()
        {
            session.unsubscribe(topic).await?;
        }
        link.topics.remove(position);
        tracing::info!(topic, "Unsubscribed");
        Ok(SubscriptionChange::Applied)
    }

    /// Unsubscribe everything, close the session and clear the active set.
    pub async fn disconnect(&self) {
        let mut link = self.inner.link.lock().await;
        let topics = std::mem::take(&mut link.topics);

        if let Some(session) = link.session.take() {
            for topic in &topics {
                if let Err(e) = session.unsubscribe(topic).await {
                    tracing::debug!(topic, error = %e, "Unsubscribe during disconnect failed");
                }
            }
            session.close().await;
        }
        if let Some(delivery) = link.delivery.take() {
            delivery.abort();
        }

        link.generation += 1;
        let endpoint = link.endpoint.take();
        if self
            .inner
            .state
            .transition(ConnectionState::Connected, ConnectionState::Disconnected)
        {
            tracing::info!(
                endpoint = ?endpoint.map(|e| e.to_string()),
                dropped_topics = topics.len(),
                "Ingestion pipeline disconnected"
            );
        }
    }

    /// Disconnect and refuse further connects.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.inner.state.set(ConnectionState::Closed);
    }

    /// Handle one inbound message. Returns the number of readings emitted.
    ///
    /// Never blocks: stores go through the writer queue and the live hub
    /// drops on lag.
    pub fn on_message(&self, topic: &str, payload: &[u8]) -> usize {
        self.inner.on_message(topic, payload)
    }

    /// Active topics in insertion order.
    pub async fn list_subscriptions(&self) -> Vec<String> {
        self.inner.link.lock().await.topics.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.inner.link.lock().await.endpoint.clone()
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        let c = &self.inner.counters;
        PipelineStatsSnapshot {
            messages: c.messages.load(Ordering::Relaxed),
            readings: c.readings.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            store_rejected: c.store_rejected.load(Ordering::Relaxed),
            transport_drops: c.transport_drops.load(Ordering::Relaxed),
        }
    }

    pub async fn status(&self) -> PipelineStatus {
        let link = self.inner.link.lock().await;
        PipelineStatus {
            state: self.inner.state.get(),
            endpoint: link.endpoint.as_ref().map(Endpoint::to_string),
            subscriptions: link.topics.clone(),
            stats: self.stats(),
        }
    }
}

impl PipelineInner {
    fn on_message(&self, topic: &str, payload: &[u8]) -> usize {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);

        let readings = match decode_message(topic, payload, Utc::now()) {
            Ok(readings) => readings,
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(topic, error = %e, bytes = payload.len(), "Dropping undecodable message");
                return 0;
            }
        };

        for reading in &readings {
            if let Err(e) = self.writer.submit(reading.to_point()) {
                self.counters.store_rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(topic, error = %e, "Reading not queued for storage");
            }

            match serde_json::to_value(reading) {
                Ok(value) => {
                    self.hub.publish(LiveChannel::Topic(topic.to_owned()), value);
                }
                Err(e) => tracing::warn!(topic, error = %e, "Reading not serializable for live update"),
            }
        }

        self.counters
            .readings
            .fetch_add(readings.len() as u64, Ordering::Relaxed);
        readings.len()
    }

    async fn on_transport_closed(&self, generation: u64, reason: &str) {
        let mut link = self.link.lock().await;
        if link.generation != generation {
            return;
        }

        link.session = None;
        link.delivery = None;
        self.counters.transport_drops.fetch_add(1, Ordering::Relaxed);
        self.state
            .transition(ConnectionState::Connected, ConnectionState::Disconnected);

        tracing::warn!(
            endpoint = ?link.endpoint.as_ref().map(Endpoint::to_string),
            reason,
            retained_topics = link.topics.len(),
            "Transport connection lost"
        );
    }
}

/// Drain a session's events into the pipeline.
///
/// Holds only a weak reference so a dropped pipeline ends the task.
async fn deliver(
    pipeline: Weak<PipelineInner>,
    mut events: mpsc::Receiver<TransportEvent>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = pipeline.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Message(message) => {
                inner.on_message(&message.topic, &message.payload);
            }
            TransportEvent::Closed { reason } => {
                inner.on_transport_closed(generation, &reason).await;
                break;
            }
        }
    }
}

fn normalize_topic(topic: &str) -> Result<&str, IngestError> {
    let topic = topic.trim();
    if topic.is_empty() {
        return Err(IngestError::InvalidTopic("topic must not be empty".into()));
    }
    Ok(topic)
}

/// Handle returned by a successful connect.
#[derive(Clone)]
pub struct ConnectionHandle {
    pipeline: IngestionPipeline,
    endpoint: Endpoint,
}

impl ConnectionHandle {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn subscribe(&self, topic: &str) -> Result<SubscriptionChange, IngestError> {
        self.pipeline.subscribe(topic).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<SubscriptionChange, IngestError> {
        self.pipeline.unsubscribe(topic).await
    }

    pub async fn disconnect(&self) {
        self.pipeline.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.pipeline.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::LocalBroker;
    use crate::live::LiveFilter;
    use crate::storage::StorageBuilder;

    async fn pipeline() -> (IngestionPipeline, LocalBroker, crate::storage::StorageHandles) {
        let handles = StorageBuilder::new("sqlite::memory:")
            .channel_capacity(64)
            .build()
            .await
            .unwrap();
        let broker = LocalBroker::new();
        let pipeline = IngestionPipeline::new(
            Arc::new(broker.clone()),
            handles.writer.clone(),
            LiveHub::new(16),
            PipelineOptions::default(),
        );
        (pipeline, broker, handles)
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let (pipeline, _broker, _handles) = pipeline().await;
        assert!(matches!(
            pipeline.subscribe("a/b").await,
            Err(IngestError::NotConnected)
        ));
        assert_eq!(
            pipeline.unsubscribe("a/b").await.unwrap(),
            SubscriptionChange::Unchanged
        );
    }

    #[tokio::test]
    async fn test_subscription_idempotence() {
        let (pipeline, broker, _handles) = pipeline().await;
        let handle = pipeline.connect(&Endpoint::new("local", 1883)).await.unwrap();

        assert!(handle.subscribe("a/b").await.unwrap().is_changed());
        assert_eq!(
            handle.subscribe("a/b").await.unwrap(),
            SubscriptionChange::Unchanged
        );
        handle.subscribe("c/d").await.unwrap();
        assert_eq!(pipeline.list_subscriptions().await, vec!["a/b", "c/d"]);
        assert_eq!(broker.active_filters().len(), 2);

        assert!(handle.unsubscribe("a/b").await.unwrap().is_changed());
        assert!(!handle.unsubscribe("a/b").await.unwrap().is_changed());
        assert_eq!(pipeline.list_subscriptions().await, vec!["c/d"]);
    }

    #[tokio::test]
    async fn test_empty_topic_rejected() {
        let (pipeline, _broker, _handles) = pipeline().await;
        pipeline.connect(&Endpoint::new("local", 1883)).await.unwrap();
        assert!(matches!(
            pipeline.subscribe("  ").await,
            Err(IngestError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_twice_and_after_shutdown() {
        let (pipeline, _broker, _handles) = pipeline().await;
        let ep = Endpoint::new("local", 1883);
        pipeline.connect(&ep).await.unwrap();
        assert!(matches!(
            pipeline.connect(&ep).await,
            Err(IngestError::AlreadyConnected(_))
        ));

        pipeline.shutdown().await;
        assert_eq!(pipeline.state(), ConnectionState::Closed);
        assert!(matches!(
            pipeline.connect(&ep).await,
            Err(IngestError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_on_message_fans_out_to_hub() {
        let (pipeline, _broker, _handles) = pipeline().await;
        let mut rx = pipeline.inner.hub.subscribe(LiveFilter::topic("home/weather"));

        let emitted = pipeline.on_message(
            "home/weather",
            br#"{"fields": {"temperature": 21.5, "humidity": 40}, "tags": {"home_id": "h1"}}"#,
        );
        assert_eq!(emitted, 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.channel, LiveChannel::Topic("home/weather".into()));
        assert_eq!(first.payload["tags"]["home_id"], "h1");

        let stats = pipeline.stats();
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.readings, 2);
    }

    #[tokio::test]
    async fn test_malformed_message_is_counted() {
        let (pipeline, _broker, _handles) = pipeline().await;
        assert_eq!(pipeline.on_message("t", b"not json"), 0);
        assert_eq!(pipeline.stats().decode_failures, 1);
    }
}
