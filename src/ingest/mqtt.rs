//! MQTT transport backed by `rumqttc`.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::IngestError;
use super::transport::{
    Endpoint, EventSender, InboundMessage, Transport, TransportEvent, TransportSession,
};

/// Default MQTT keep-alive.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Default handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Smallest keep-alive the client accepts.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// Grace period for the event loop to flush a DISCONNECT.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Transport speaking MQTT 3.1.1 over TCP.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    client_id: String,
    keep_alive: Duration,
    handshake_timeout: Duration,
}

impl MqttTransport {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        if keep_alive < MIN_KEEP_ALIVE {
            tracing::warn!(
                requested = ?keep_alive,
                min = ?MIN_KEEP_ALIVE,
                "Keep-alive below minimum, clamping"
            );
            self.keep_alive = MIN_KEEP_ALIVE;
        } else {
            self.keep_alive = keep_alive;
        }
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    fn options(&self, endpoint: &Endpoint) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn open(
        &self,
        endpoint: &Endpoint,
        events: EventSender,
    ) -> Result<Box<dyn TransportSession>, IngestError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(endpoint), REQUEST_CAPACITY);

        let connectivity = |reason: String| IngestError::Connectivity {
            endpoint: endpoint.to_string(),
            reason,
        };

        match timeout(self.handshake_timeout, await_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(connectivity(reason)),
            Err(_) => {
                return Err(connectivity(format!(
                    "no CONNACK within {}",
                    humantime::format_duration(self.handshake_timeout)
                )));
            }
        }

        tracing::info!(%endpoint, client_id = %self.client_id, "MQTT session established");

        let pump = tokio::spawn(pump_events(eventloop, events));
        Ok(Box::new(MqttSession {
            client,
            pump: Mutex::new(Some(pump)),
        }))
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(format!("broker refused connection: {:?}", ack.code))
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// Forward inbound publishes until the connection ends.
async fn pump_events(mut eventloop: EventLoop, events: EventSender) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if events.send(TransportEvent::Message(message)).await.is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("MQTT DISCONNECT sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "MQTT connection lost");
                let _ = events
                    .send(TransportEvent::Closed {
                        reason: e.to_string(),
                    })
                    .await;
                break;
            }
        }
    }
}

struct MqttSession {
    client: AsyncClient,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl TransportSession for MqttSession {
    async fn subscribe(&self, topic: &str) -> Result<(), IngestError> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| IngestError::Transport(e.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), IngestError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| IngestError::Transport(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "MQTT disconnect request failed");
        }
        let Some(mut pump) = self.pump.lock().await.take() else {
            return;
        };
        if timeout(CLOSE_GRACE, &mut pump).await.is_err() {
            pump.abort();
        }
    }
}
