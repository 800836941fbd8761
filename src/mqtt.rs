//! MQTT broker channel.
//!
//! Every call opens its own short-lived session with a fresh client id and
//! tears it down before returning (publish) or when cancelled (subscribe).

use crate::config::ConnParams;
use crate::error::{ControlError, Result};
use log::{debug, info, warn};
use rand::RngCore;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;

const CLIENT_ID_PREFIX: &str = "smartcontrol";
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 10;
const QUEUE_CAPACITY: usize = 32;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Topic suffixes defined by the plug firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// Commands to the plug
    Set,
    /// Outlet on/off telemetry
    State,
    /// Power and uptime telemetry
    Sensor,
}

impl Topic {
    pub fn suffix(self) -> &'static str {
        match self {
            Topic::Set => "set",
            Topic::State => "state",
            Topic::Sensor => "sensor",
        }
    }

    /// `device/<device-type>/<mac>/<suffix>`
    pub fn path(self, device_type: &str, mac: &str) -> String {
        format!("device/{}/{}/{}", device_type, mac, self.suffix())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Broker transport used for steady-state commands and telemetry.
pub trait MqttTransport: Send + Sync {
    /// Publish one message at QoS 1 and wait for the broker's acknowledgment.
    fn publish(&self, topic: &str, payload: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Subscribe at QoS 1. Returns once the broker acknowledged the
    /// subscription; payloads then flow into the returned queue until `cancel`
    /// fires or the receiver is dropped. The subscription is renewed after
    /// every reconnect; the queue closes if that fails.
    fn subscribe(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<mpsc::Receiver<Vec<u8>>>> + Send;
}

/// Network implementation of [`MqttTransport`].
#[derive(Debug, Clone)]
pub struct MqttChannel {
    conn: ConnParams,
    handshake_timeout: Duration,
    disconnect_grace: Duration,
}

impl MqttChannel {
    pub fn new(conn: ConnParams) -> Self {
        Self {
            conn,
            handshake_timeout: Duration::from_secs(10),
            disconnect_grace: Duration::from_millis(250),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    pub fn conn(&self) -> &ConnParams {
        &self.conn
    }

    fn session(&self) -> (AsyncClient, EventLoop) {
        let client_id = format!("{}-{:08x}", CLIENT_ID_PREFIX, rand::rng().next_u32());
        debug!("Opening MQTT session {} to {}", client_id, self.conn.broker_uri());

        let mut options = MqttOptions::new(client_id, self.conn.host.clone(), self.conn.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if self.conn.username.is_some() || self.conn.password.is_some() {
            options.set_credentials(
                self.conn.username.clone().unwrap_or_default(),
                self.conn.password.clone().unwrap_or_default(),
            );
        }

        AsyncClient::new(options, REQUEST_CAPACITY)
    }

    /// Drive the event loop until `done` accepts an incoming packet, bounded
    /// by the handshake timeout.
    async fn handshake<F>(&self, eventloop: &mut EventLoop, done: F) -> Result<()>
    where
        F: FnMut(&Packet) -> Option<Result<()>>,
    {
        match timeout(self.handshake_timeout, exchange(eventloop, done)).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::Transport(format!(
                "no answer from {} within {:?}",
                self.conn.broker_uri(),
                self.handshake_timeout
            ))),
        }
    }
}

async fn exchange<F>(eventloop: &mut EventLoop, mut done: F) -> Result<()>
where
    F: FnMut(&Packet) -> Option<Result<()>>,
{
    loop {
        let Event::Incoming(packet) = eventloop.poll().await? else {
            continue;
        };
        if let Packet::ConnAck(ack) = &packet {
            if ack.code != ConnectReturnCode::Success {
                return Err(ControlError::Transport(format!(
                    "broker refused connection: {:?}",
                    ack.code
                )));
            }
        }
        if let Some(result) = done(&packet) {
            return result;
        }
    }
}

/// Disconnect and give the event loop a bounded window to flush it.
async fn close(client: AsyncClient, mut eventloop: EventLoop, grace: Duration) {
    if client.disconnect().await.is_err() {
        return;
    }
    let _ = timeout(grace, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    debug!("MQTT session closed");
}

impl MqttTransport for MqttChannel {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let (client, mut eventloop) = self.session();

        let result = match client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
        {
            Ok(()) => {
                self.handshake(&mut eventloop, |packet| {
                    matches!(packet, Packet::PubAck(_)).then_some(Ok(()))
                })
                .await
            }
            Err(e) => Err(e.into()),
        };

        close(client, eventloop, self.disconnect_grace).await;

        match &result {
            Ok(()) => info!("Published {} bytes to {}", payload.len(), topic),
            Err(e) => warn!("Publish to {} failed: {}", topic, e),
        }
        result
    }

    async fn subscribe(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (client, mut eventloop) = self.session();

        let subscribed = match client.subscribe(topic, QoS::AtLeastOnce).await {
            Ok(()) => {
                self.handshake(&mut eventloop, |packet| match packet {
                    Packet::SubAck(ack) => Some(
                        if ack
                            .return_codes
                            .iter()
                            .any(|c| matches!(c, SubscribeReasonCode::Failure))
                        {
                            Err(ControlError::Transport("subscription rejected".into()))
                        } else {
                            Ok(())
                        },
                    ),
                    _ => None,
                })
                .await
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = subscribed {
            warn!("Subscribe to {} failed: {}", topic, e);
            close(client, eventloop, self.disconnect_grace).await;
            return Err(e);
        }
        info!("Subscribed to {}", topic);

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let grace = self.disconnect_grace;
        let topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    event = eventloop.poll() => {
                        match event {
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                debug!("Message on {}: {} bytes", publish.topic, publish.payload.len());
                                // One task per message so a slow consumer does not stall the loop.
                                let tx = tx.clone();
                                tokio::spawn(async move {
                                    let _ = tx.send(publish.payload.to_vec()).await;
                                });
                            }
                            // The handshake consumed the first ConnAck, so any later one
                            // is a reconnect on a clean session with no subscriptions.
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                info!("Reconnected, subscribing to {} again", topic);
                                if let Err(e) =
                                    client.subscribe(topic.as_str(), QoS::AtLeastOnce).await
                                {
                                    warn!("Resubscribe to {} failed: {}", topic, e);
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!("MQTT connection error on {}: {}. Reconnecting...", topic, e);
                                tokio::select! {
                                    _ = cancel.cancelled() => break,
                                    _ = sleep(RECONNECT_DELAY) => {}
                                }
                            }
                        }
                    }
                }
            }
            close(client, eventloop, grace).await;
            debug!("Subscription to {} ended", topic);
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_layout() {
        assert_eq!(
            Topic::Set.path("ztc1", "11111111e10d"),
            "device/ztc1/11111111e10d/set"
        );
        assert_eq!(Topic::State.path("ztc1", "m"), "device/ztc1/m/state");
        assert_eq!(Topic::Sensor.path("tc1", "m"), "device/tc1/m/sensor");
    }

    fn closed_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .unwrap()
    }

    #[tokio::test]
    async fn publish_to_unreachable_broker_fails() {
        let channel = MqttChannel::new(ConnParams::new("127.0.0.1", closed_port()))
            .with_handshake_timeout(Duration::from_secs(5));
        let err = channel
            .publish("device/ztc1/m/set", b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Transport(_)));
    }

    #[tokio::test]
    async fn subscribe_to_unreachable_broker_returns_without_blocking() {
        let channel = MqttChannel::new(ConnParams::new("127.0.0.1", closed_port()))
            .with_handshake_timeout(Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let res = channel.subscribe("device/ztc1/m/state", cancel).await;
        assert!(matches!(res, Err(ControlError::Transport(_))));
    }
}
