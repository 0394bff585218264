//! Ingestion pipeline.
//!
//! Owns the transport connection and the active subscription set, decodes
//! inbound topic messages into [`Reading`]s and fans each one out to the
//! storage writer and the live hub.

mod error;
pub mod local;
pub mod mqtt;
mod pipeline;
mod reading;
pub mod transport;

pub use error::IngestError;
pub use local::LocalBroker;
pub use mqtt::MqttTransport;
pub use pipeline::{
    ConnectionHandle, DEFAULT_CONNECT_TIMEOUT, DEFAULT_DELIVERY_CAPACITY, IngestionPipeline,
    PipelineOptions, PipelineStatsSnapshot, PipelineStatus, SubscriptionChange,
};
pub use reading::{DecodeError, Reading, decode_message};
pub use transport::{
    Endpoint, EventSender, InboundMessage, Transport, TransportEvent, TransportSession, probe_tcp,
    topic_matches,
};
