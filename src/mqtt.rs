//! MQTT transport the gateway publishes and subscribes through.
//!
//! The RAMSES ESP relays received telegrams on `{base}/{gateway}/rx` and
//! transmits whatever is published on `{base}/{gateway}/tx`. The gateway
//! only consumes the [`Transport`] capability, so tests substitute an
//! in-memory fake; [`MqttTransport`] is the rumqttc-backed implementation
//! with a background task driving the event loop.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use crate::frame::DeviceId;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not subscribe to `{1}`")]
    Subscribe(#[source] rumqttc::v5::ClientError, String),
    #[error("could not unsubscribe from `{1}`")]
    Unsubscribe(#[source] rumqttc::v5::ClientError, String),
    #[error("could not publish to `{1}`")]
    Publish(#[source] rumqttc::v5::ClientError, String),
}

/// The publish/subscribe capability the gateway consumes.
pub trait Transport {
    type Error: std::error::Error + Send + Sync + 'static;
    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), Self::Error>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    type Error = T::Error;

    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error> {
        (**self).subscribe(topic).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), Self::Error> {
        (**self).unsubscribe(topic).await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error> {
        (**self).publish(topic, payload).await
    }
}

/// Inbound and outbound topic pair for one RAMSES ESP gateway.
#[derive(Clone, Debug)]
pub struct Topics {
    pub rx: String,
    pub tx: String,
}

impl Topics {
    pub fn new(base: &str, gateway: DeviceId) -> Self {
        Self { rx: format!("{base}/{gateway}/rx"), tx: format!("{base}/{gateway}/tx") }
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "mqtt::Args")]
pub struct Args {
    /// Host name of the MQTT broker the RAMSES ESP is connected to.
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    /// Port of the MQTT broker.
    #[arg(long, default_value_t = 1883)]
    mqtt_port: u16,

    /// Client identifier presented to the broker.
    #[arg(long, default_value = "orcon-mvs-tools")]
    mqtt_client_id: String,

    /// Username for broker authentication.
    #[arg(long, requires = "mqtt_password")]
    mqtt_username: Option<String>,

    /// Password for broker authentication.
    #[arg(long, requires = "mqtt_username")]
    mqtt_password: Option<String>,

    /// MQTT keep-alive interval.
    #[arg(long, default_value = "30s")]
    mqtt_keep_alive: humantime::Duration,
}

/// A raw message delivered on a subscribed topic.
#[derive(Debug)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub struct MqttTransport {
    client: AsyncClient,
    #[allow(unused)] // exists for its drop handler
    event_loop_task: AbortOnDropHandle<()>,
}

/// rumqttc surfaces connection loss as a `poll` error and reconnects on the
/// next `poll`; backing off here keeps a dead broker from spinning the task.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

impl MqttTransport {
    /// Connect and spawn the event loop driver.
    ///
    /// The returned receiver yields every message arriving on subscribed
    /// topics; the composition root pumps it into the gateway.
    pub fn connect(args: &Args) -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let mut options =
            MqttOptions::new(args.mqtt_client_id.clone(), args.mqtt_host.clone(), args.mqtt_port);
        options.set_keep_alive(*args.mqtt_keep_alive);
        if let (Some(username), Some(password)) = (&args.mqtt_username, &args.mqtt_password) {
            options.set_credentials(username.clone(), password.clone());
        }
        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let (sender, receiver) = mpsc::unbounded_channel();
        let event_loop_task = AbortOnDropHandle::new(tokio::task::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to the broker");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                        debug!(topic = topic.as_str(), bytes = publish.payload.len(), "message received");
                        let message =
                            InboundMessage { topic, payload: publish.payload.to_vec() };
                        if sender.send(message).is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(
                            message = "broker connection failed, will retry",
                            error = (&e as &dyn std::error::Error)
                        );
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }));
        (Self { client, event_loop_task }, receiver)
    }
}

impl Transport for MqttTransport {
    type Error = Error;

    async fn subscribe(&self, topic: &str) -> Result<(), Error> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| Error::Subscribe(e, topic.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| Error::Unsubscribe(e, topic.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Error> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| Error::Publish(e, topic.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_naming_convention() {
        let topics = Topics::new("RAMSES/GATEWAY", "18:013393".parse().unwrap());
        assert_eq!(topics.rx, "RAMSES/GATEWAY/18:013393/rx");
        assert_eq!(topics.tx, "RAMSES/GATEWAY/18:013393/tx");
    }
}
