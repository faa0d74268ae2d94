//! MQTT front-end built on rumqttc.
//!
//! The bridge subscribes to the request topic (`modbus/request` by default).
//! Every message carries the same JSON document as `POST /modbus`.  The raw
//! reply ADU is published to the response topic (`modbus/response`).
//!
//! Failed requests are logged and produce no response message.
//!
//! When `[uplink]` is enabled the bridge also subscribes to the LoRaWAN
//! uplink filter (`application/+/device/+/event/up` by default).  Uplink
//! payloads use the same JSON document; they are routed to the device and
//! the outcome is only logged.
//!
//! # Event loop (for beginners)
//!
//! rumqttc splits a connection into an [`AsyncClient`] (cheap to clone, used
//! to publish) and an [`EventLoop`] that must be polled continuously to keep
//! the connection alive.  The loop runs on its own task.  Each incoming
//! request is handled on a separate task so a slow device never stalls the
//! broker connection.  On a connection error the loop sleeps for
//! `reconnect_delay_secs` and polls again, which makes rumqttc reconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::payload::{log_device_exception, ModbusPayload};
use super::storage::config::{MqttConfig, UplinkConfig};
use crate::application::route_request::RequestRouter;

/// Capacity of rumqttc's outgoing request channel.
const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// Where replies are published.
///
/// Infrastructure implementation wraps an [`AsyncClient`]; tests record calls.
#[async_trait]
pub trait ResponsePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), String>;
}

/// [`ResponsePublisher`] backed by a live broker connection.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

#[async_trait]
impl ResponsePublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), String> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Which subscription an incoming publish belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Request,
    Uplink,
}

/// The filters the bridge subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriptions {
    pub request: String,
    pub uplink: Option<String>,
}

impl Subscriptions {
    pub fn new(mqtt: &MqttConfig, uplink: &UplinkConfig) -> Self {
        Self {
            request: mqtt.request_topic.clone(),
            uplink: uplink.enabled.then(|| uplink.topic.clone()),
        }
    }

    /// Matches a publish topic against the subscribed filters, wildcards
    /// included.  The request filter wins if both match.
    pub fn classify(&self, topic: &str) -> Option<Inbound> {
        if rumqttc::matches(topic, &self.request) {
            return Some(Inbound::Request);
        }
        match &self.uplink {
            Some(filter) if rumqttc::matches(topic, filter) => Some(Inbound::Uplink),
            _ => None,
        }
    }

    fn filters(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.request.as_str()).chain(self.uplink.as_deref())
    }
}

/// Handles one request message end to end.
///
/// Returns `true` if a reply was published.
pub async fn handle_message(
    router: &RequestRouter,
    publisher: &dyn ResponsePublisher,
    response_topic: &str,
    payload: &[u8],
) -> bool {
    let call = match ModbusPayload::from_json(payload) {
        Ok(p) => p.into_call(),
        Err(e) => {
            warn!("discarding MQTT request: {e}");
            return false;
        }
    };

    let reply = match router.submit_default(&call).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(device_id = call.device_id, "MQTT request failed: {e}");
            return false;
        }
    };
    log_device_exception(call.device_id, &reply);

    match publisher.publish(response_topic, reply).await {
        Ok(()) => true,
        Err(e) => {
            warn!(topic = response_topic, "failed to publish reply: {e}");
            false
        }
    }
}

/// Routes one uplink message to its device.
///
/// Returns `true` if the device answered.
pub async fn handle_uplink(router: &RequestRouter, topic: &str, payload: &[u8]) -> bool {
    let call = match ModbusPayload::from_json(payload) {
        Ok(p) => p.into_call(),
        Err(e) => {
            warn!(topic, "could not decode uplink: {e}");
            return false;
        }
    };

    match router.submit_default(&call).await {
        Ok(reply) => {
            log_device_exception(call.device_id, &reply);
            info!(topic, device_id = call.device_id, "uplink forwarded");
            true
        }
        Err(e) => {
            warn!(topic, device_id = call.device_id, "uplink forward failed: {e}");
            false
        }
    }
}

// ── Bridge lifecycle ──────────────────────────────────────────────────────────

/// A running bridge.  Dropping it leaves the event loop running; call
/// [`MqttBridge::shutdown`] to stop it.
pub struct MqttBridge {
    client: AsyncClient,
    task: JoinHandle<()>,
}

impl MqttBridge {
    /// Connects to the broker described by `config` and starts serving
    /// requests (and uplinks, if enabled) through `router`.  Must be called
    /// from within a Tokio runtime.
    pub fn start(config: &MqttConfig, uplink: &UplinkConfig, router: Arc<RequestRouter>) -> Self {
        let mut options = MqttOptions::new(
            config.client_id.clone(),
            config.broker_host.clone(),
            config.broker_port,
        );
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);
        let subscriptions = Subscriptions::new(config, uplink);
        info!(
            broker = %format!("{}:{}", config.broker_host, config.broker_port),
            topic = %config.request_topic,
            uplink = ?subscriptions.uplink,
            "starting MQTT bridge"
        );

        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            router,
            subscriptions,
            config.response_topic.clone(),
            config.reconnect_delay(),
        ));

        Self { client, task }
    }

    /// Sends DISCONNECT and stops the event loop.
    pub async fn shutdown(self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect: {e}");
        }
        self.task.abort();
        info!("MQTT bridge stopped");
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    router: Arc<RequestRouter>,
    subscriptions: Subscriptions,
    response_topic: String,
    reconnect_delay: Duration,
) {
    let publisher: Arc<dyn ResponsePublisher> = Arc::new(MqttPublisher {
        client: client.clone(),
    });
    let response_topic: Arc<str> = response_topic.into();

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // Clean sessions forget subscriptions; renew on every connect.
                for filter in subscriptions.filters() {
                    match client.try_subscribe(filter, QoS::AtMostOnce) {
                        Ok(()) => info!(topic = filter, "connected to broker, subscribed"),
                        Err(e) => warn!(topic = filter, "subscribe failed: {e}"),
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(message))) => {
                let Some(kind) = subscriptions.classify(&message.topic) else {
                    continue;
                };
                debug!(topic = %message.topic, bytes = message.payload.len(), "MQTT message received");
                let router = Arc::clone(&router);
                match kind {
                    Inbound::Request => {
                        let publisher = Arc::clone(&publisher);
                        let response_topic = Arc::clone(&response_topic);
                        tokio::spawn(async move {
                            handle_message(
                                &router,
                                publisher.as_ref(),
                                &response_topic,
                                &message.payload,
                            )
                            .await;
                        });
                    }
                    Inbound::Uplink => {
                        tokio::spawn(async move {
                            handle_uplink(&router, &message.topic, &message.payload).await;
                        });
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {e}; retrying in {reconnect_delay:?}");
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}
