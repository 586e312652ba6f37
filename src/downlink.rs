//! Downlink dispatch over the network server's MQTT integration
//!
//! Each dispatch opens its own MQTT connection, publishes one command to
//! `application/{app}/device/{eui}/command/down` at QoS 1 and waits a bounded
//! time for the broker's PUBACK. The PUBACK only says the broker took the
//! message; the device may still never receive it.
//!
//! The rumqttc event loop runs on a listener task owned by the dispatch call.
//! The listener reports the first decisive event through a oneshot channel,
//! and the connection is torn down before `dispatch` returns.

use crate::config::MqttConfig;
use base64::Engine;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a delivered dispatch waits for the DISCONNECT to go out
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Broker acknowledged the publish
    Delivered,
    /// No acknowledgment within the dispatch timeout
    TimedOut,
    /// Connect refused, network error, or publish rejected
    ConnectionFailed(String),
    /// No device matched the meter, nothing was sent
    NotFound,
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchOutcome::Delivered => write!(f, "delivered"),
            DispatchOutcome::TimedOut => write!(f, "timed out"),
            DispatchOutcome::ConnectionFailed(reason) => write!(f, "connection failed: {}", reason),
            DispatchOutcome::NotFound => write!(f, "device not found"),
        }
    }
}

/// The fixed command sent to every device, pre-rendered as JSON
#[derive(Debug, Clone)]
pub struct DownlinkCommand {
    body: Vec<u8>,
}

impl DownlinkCommand {
    pub fn new(f_port: u8, data: &[u8]) -> Self {
        let body = json!({
            "confirmed": false,
            "fPort": f_port,
            "data": base64::engine::general_purpose::STANDARD.encode(data),
        })
        .to_string()
        .into_bytes();

        Self { body }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

pub fn downlink_topic(application_id: &str, device_eui: &str) -> String {
    format!(
        "application/{}/device/{}/command/down",
        application_id,
        device_eui.to_lowercase()
    )
}

pub struct Dispatcher {
    mqtt: MqttConfig,
    command: DownlinkCommand,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(mqtt: MqttConfig, command: DownlinkCommand, timeout: Duration) -> Self {
        Self {
            mqtt,
            command,
            timeout,
        }
    }

    /// Send the command to one device and wait for the broker's PUBACK
    ///
    /// Never fails: every problem is folded into the returned outcome.
    pub async fn dispatch(&self, device_eui: &str, application_id: &str) -> DispatchOutcome {
        let topic = downlink_topic(application_id, device_eui);

        // Per-device client id so concurrent sessions never collide on the broker
        let mut options = MqttOptions::new(
            format!("cs-downlink-{}", device_eui),
            self.mqtt.host.as_str(),
            self.mqtt.port,
        );
        options.set_keep_alive(Duration::from_secs(self.mqtt.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if let Some(username) = &self.mqtt.username {
            options.set_credentials(
                username.as_str(),
                self.mqtt.password.as_deref().unwrap_or_default(),
            );
        }

        let (client, eventloop) = AsyncClient::new(options, 10);
        let (done_tx, done_rx) = oneshot::channel();

        debug!("Connecting to MQTT broker for {} ({})", device_eui, topic);
        let listener = tokio::spawn(run_listener(
            client.clone(),
            eventloop,
            (topic, self.command.body().to_vec()),
            done_tx,
        ));
        let connection = Connection { client, listener };

        let outcome = match tokio::time::timeout(self.timeout, done_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => DispatchOutcome::ConnectionFailed("MQTT listener stopped".to_string()),
            Err(_) => DispatchOutcome::TimedOut,
        };

        connection.close(outcome == DispatchOutcome::Delivered).await;

        match &outcome {
            DispatchOutcome::Delivered => {
                info!("Downlink to {} (application {}) accepted by broker", device_eui, application_id)
            }
            other => {
                warn!("Downlink to {} (application {}) {}", device_eui, application_id, other)
            }
        }
        outcome
    }
}

/// One live MQTT connection; the listener never outlives it
struct Connection {
    client: AsyncClient,
    listener: JoinHandle<()>,
}

impl Connection {
    async fn close(mut self, graceful: bool) {
        if graceful && self.client.disconnect().await.is_ok() {
            let _ = tokio::time::timeout(DISCONNECT_GRACE, &mut self.listener).await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Drive the event loop: publish on CONNACK, report PUBACK or failure,
/// then keep polling until the disconnect request has gone out
async fn run_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    message: (String, Vec<u8>),
    done: oneshot::Sender<DispatchOutcome>,
) {
    let mut message = Some(message);
    let mut done = Some(done);
    let mut report = |outcome: DispatchOutcome| {
        if let Some(tx) = done.take() {
            let _ = tx.send(outcome);
        }
    };

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let Some((topic, payload)) = message.take() else {
                    continue;
                };
                debug!("Connected, publishing downlink to {}", topic);
                if let Err(e) = client
                    .publish(topic, QoS::AtLeastOnce, false, payload)
                    .await
                {
                    report(DispatchOutcome::ConnectionFailed(format!(
                        "publish rejected: {}",
                        e
                    )));
                    return;
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                debug!("PUBACK received (pkid {})", ack.pkid);
                report(DispatchOutcome::Delivered);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => return,
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                report(DispatchOutcome::ConnectionFailed(format!(
                    "broker refused connection: {:?}",
                    code
                )));
                return;
            }
            Err(e) => {
                report(DispatchOutcome::ConnectionFailed(e.to_string()));
                return;
            }
        }
    }
}
