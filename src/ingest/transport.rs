//! Transport abstraction.
//!
//! A [`Transport`] opens sessions against a broker [`Endpoint`]. Each session
//! pushes inbound messages, and finally a close notice, into an event channel
//! owned by the pipeline.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;

use super::IngestError;

/// Default MQTT port.
pub const DEFAULT_PORT: u16 = 1883;

/// Broker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = IngestError;

    /// Accepts `mqtt://host[:port]`, `tcp://host[:port]` or bare `host[:port]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IngestError::InvalidEndpoint(s.to_owned()));
        }

        let with_scheme = if s.contains("://") {
            s.to_owned()
        } else {
            format!("mqtt://{s}")
        };
        let url = Url::parse(&with_scheme).map_err(|_| IngestError::InvalidEndpoint(s.to_owned()))?;

        if !matches!(url.scheme(), "mqtt" | "tcp") {
            return Err(IngestError::InvalidEndpoint(s.to_owned()));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| IngestError::InvalidEndpoint(s.to_owned()))?;

        Ok(Self::new(
            host.trim_start_matches('[').trim_end_matches(']'),
            url.port().unwrap_or(DEFAULT_PORT),
        ))
    }
}

/// A message delivered by the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Events a session pushes to the pipeline.
#[derive(Debug)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// The session ended without a local `close`.
    Closed { reason: String },
}

/// Channel a session delivers its events on.
pub type EventSender = mpsc::Sender<TransportEvent>;

/// An open broker session.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), IngestError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), IngestError>;

    /// Close the session. No further events are delivered afterwards.
    async fn close(&self);
}

/// Factory for broker sessions.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Check that the endpoint accepts connections at all.
    async fn probe(&self, endpoint: &Endpoint, within: Duration) -> Result<(), IngestError> {
        probe_tcp(endpoint, within).await
    }

    /// Open a session and complete the protocol handshake.
    async fn open(
        &self,
        endpoint: &Endpoint,
        events: EventSender,
    ) -> Result<Box<dyn TransportSession>, IngestError>;
}

/// Plain TCP reachability check.
pub async fn probe_tcp(endpoint: &Endpoint, within: Duration) -> Result<(), IngestError> {
    let addr = (endpoint.host.as_str(), endpoint.port);
    match timeout(within, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(IngestError::Connectivity {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(IngestError::Connectivity {
            endpoint: endpoint.to_string(),
            reason: format!("no answer within {}", humantime::format_duration(within)),
        }),
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
