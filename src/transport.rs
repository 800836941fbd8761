//! Transport selection for commands that tolerate either channel.
//! MQTT is tried first; a failure there triggers exactly one UDP broadcast
//! of the identical payload.

use crate::error::{ControlError, Result};
use crate::mqtt::MqttTransport;
use crate::udp::UdpTransport;
use log::{info, warn};
use std::fmt;

/// How a command reached the plug.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Acknowledged by the broker
    Mqtt,
    /// Broadcast on the local network after MQTT failed
    UdpFallback {
        /// Why MQTT was abandoned
        mqtt_error: ControlError,
    },
}

impl Delivery {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Delivery::UdpFallback { .. })
    }
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Mqtt => f.write_str("delivered over MQTT"),
            Delivery::UdpFallback { mqtt_error } => write!(
                f,
                "MQTT unavailable ({}), delivered by UDP broadcast",
                mqtt_error
            ),
        }
    }
}

/// Publish `payload` on `topic`, falling back to one UDP broadcast.
///
/// The fallback outcome is final: if the broadcast also fails the error
/// carries both failures.
pub async fn deliver<M, U>(mqtt: &M, udp: &U, topic: &str, payload: &[u8]) -> Result<Delivery>
where
    M: MqttTransport,
    U: UdpTransport,
{
    let mqtt_error = match mqtt.publish(topic, payload).await {
        Ok(()) => return Ok(Delivery::Mqtt),
        Err(e) => e,
    };

    warn!("MQTT server is not available ({}), using UDP broadcast", mqtt_error);
    match udp.broadcast(payload).await {
        Ok(()) => {
            info!("Command for {} delivered by UDP broadcast", topic);
            Ok(Delivery::UdpFallback { mqtt_error })
        }
        Err(fallback) => Err(ControlError::Fallback {
            primary: Box::new(mqtt_error),
            fallback: Box::new(fallback),
        }),
    }
}
