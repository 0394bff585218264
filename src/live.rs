//! Live broadcast hub.
//!
//! Fire-and-forget fan-out of JSON payloads to any number of subscribers,
//! keyed by topic (raw ingestion) and by section (query results). Producers
//! never block and get no delivery acknowledgment; slow receivers skip ahead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::ingest::topic_matches;

/// Default number of messages buffered per receiver.
pub const DEFAULT_LIVE_CAPACITY: usize = 1024;

/// Where a live message belongs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "key", rename_all = "lowercase")]
pub enum LiveChannel {
    /// Readings ingested from one transport topic.
    Topic(String),
    /// Result sets of one dashboard section.
    Section(String),
}

impl LiveChannel {
    /// Event name used on the wire.
    pub fn event_name(&self) -> String {
        match self {
            Self::Topic(_) => "reading".to_string(),
            Self::Section(id) => format!("dataUpdate_{id}"),
        }
    }
}

/// A payload published on a channel.
#[derive(Debug, Clone, Serialize)]
pub struct LiveMessage {
    pub channel: LiveChannel,
    pub payload: Value,
}

impl LiveMessage {
    /// Wire frame: `{"event": ..., "data": ...}`.
    pub fn to_frame(&self) -> Value {
        json!({ "event": self.channel.event_name(), "data": self.payload })
    }
}

/// Subscription filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveFilter {
    /// Every channel.
    All,
    /// Any of these topic filters (`+` and `#` wildcards allowed).
    Topics(Vec<String>),
    /// Any of these sections.
    Sections(Vec<String>),
    /// Matches if any inner filter matches.
    Any(Vec<LiveFilter>),
}

impl LiveFilter {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self::Topics(vec![topic.into()])
    }

    pub fn section(section_id: impl Into<String>) -> Self {
        Self::Sections(vec![section_id.into()])
    }

    pub fn matches(&self, channel: &LiveChannel) -> bool {
        match (self, channel) {
            (Self::All, _) => true,
            (Self::Topics(filters), LiveChannel::Topic(topic)) => {
                filters.iter().any(|f| topic_matches(f, topic))
            }
            (Self::Sections(sections), LiveChannel::Section(id)) => sections.contains(id),
            (Self::Any(filters), channel) => filters.iter().any(|f| f.matches(channel)),
            _ => false,
        }
    }
}

/// Broadcast hub shared by producers and subscribers.
#[derive(Clone)]
pub struct LiveHub {
    sender: broadcast::Sender<Arc<LiveMessage>>,
    published: Arc<AtomicU64>,
}

impl std::fmt::Debug for LiveHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveHub")
            .field("receivers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Default for LiveHub {
    fn default() -> Self {
        Self::new(DEFAULT_LIVE_CAPACITY)
    }
}

impl LiveHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish a payload. Returns how many receivers were handed the message.
    pub fn publish(&self, channel: LiveChannel, payload: Value) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        // An error only means nobody is listening
        self.sender
            .send(Arc::new(LiveMessage { channel, payload }))
            .unwrap_or(0)
    }

    pub fn subscribe(&self, filter: LiveFilter) -> LiveReceiver {
        LiveReceiver {
            rx: self.sender.subscribe(),
            filter,
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Total messages published since creation.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Receiver that only yields messages matching its filter.
pub struct LiveReceiver {
    rx: broadcast::Receiver<Arc<LiveMessage>>,
    filter: LiveFilter,
}

impl LiveReceiver {
    /// Next matching message, or `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<Arc<LiveMessage>> {
        loop {
            match self.rx.recv().await {
                Ok(message) if self.filter.matches(&message.channel) => return Some(message),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Live receiver lagged, skipping messages");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn filter(&self) -> &LiveFilter {
        &self.filter
    }
}
