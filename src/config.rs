//! Connection parameters and operation timing.
//!
//! Everything here is immutable input: broker credentials are never retried
//! with different values and the timing knobs are fixed for the lifetime of
//! a [`Controller`](crate::Controller).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Default broker port when none is given.
pub const DEFAULT_MQTT_PORT: u16 = 1883;
/// Port the plugs listen on; the controller sends here.
pub const REMOTE_RECEIVE_PORT: u16 = 10182;
/// Port the plugs reply on; the controller listens here.
pub const REMOTE_SEND_PORT: u16 = 10181;
/// Device type segment used in topics unless overridden.
pub const DEFAULT_DEVICE_TYPE: &str = "ztc1";

/// Broker address and optional credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnParams {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConnParams {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    /// Set credentials. Empty strings are treated as absent.
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username.filter(|u| !u.is_empty());
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    /// Broker address in `tcp://host:port` form.
    pub fn broker_uri(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// Local UDP endpoints used for broadcast and listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpConfig {
    /// Address the receive socket binds to
    pub bind_addr: Ipv4Addr,
    /// Destination of outgoing datagrams (limited broadcast by default)
    pub send_addr: SocketAddr,
    /// Port the receive socket binds to
    pub recv_port: u16,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            send_addr: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::BROADCAST,
                REMOTE_RECEIVE_PORT,
            )),
            recv_port: REMOTE_SEND_PORT,
        }
    }
}

impl UdpConfig {
    pub fn with_send_addr(mut self, addr: SocketAddr) -> Self {
        self.send_addr = addr;
        self
    }

    pub fn with_recv_port(mut self, port: u16) -> Self {
        self.recv_port = port;
        self
    }

    pub fn with_bind_addr(mut self, addr: Ipv4Addr) -> Self {
        self.bind_addr = addr;
        self
    }
}

/// Per-operation timing and topic settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// `<device-type>` segment of every topic
    pub device_type: String,
    /// Overall deadline of a discover run
    pub discover_timeout: Duration,
    /// Interval of the discover progress tick
    pub tick_interval: Duration,
    /// Pause between a switch command and the state read-back
    pub settle_delay: Duration,
    /// Upper bound on the upgrade progress wait. `None` waits forever.
    pub upgrade_timeout: Option<Duration>,
    /// Upper bound on waiting for a state report. `None` waits forever.
    pub state_timeout: Option<Duration>,
    /// Bound on MQTT connect/publish/subscribe handshakes
    pub mqtt_handshake_timeout: Duration,
    /// Time allowed for a clean MQTT disconnect
    pub disconnect_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            discover_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            settle_delay: Duration::from_secs(2),
            upgrade_timeout: None,
            state_timeout: None,
            mqtt_handshake_timeout: Duration::from_secs(10),
            disconnect_grace: Duration::from_millis(250),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_uri_uses_tcp_scheme() {
        let conn = ConnParams::new("10.0.0.2", DEFAULT_MQTT_PORT);
        assert_eq!(conn.broker_uri(), "tcp://10.0.0.2:1883");
    }

    #[test]
    fn empty_credentials_are_dropped() {
        let conn = ConnParams::new("broker", 1884)
            .with_credentials(Some(String::new()), Some("secret".into()));
        assert_eq!(conn.username, None);
        assert_eq!(conn.password.as_deref(), Some("secret"));
    }

    #[test]
    fn udp_defaults_use_fixed_ports() {
        let udp = UdpConfig::default();
        assert_eq!(udp.send_addr.port(), 10182);
        assert_eq!(udp.recv_port, 10181);
        assert_eq!(udp.send_addr.ip().to_string(), "255.255.255.255");
    }

    #[test]
    fn waits_are_unbounded_unless_configured() {
        let settings = Settings::default();
        assert_eq!(settings.upgrade_timeout, None);
        assert_eq!(settings.state_timeout, None);
        assert_eq!(settings.discover_timeout, Duration::from_secs(30));
    }
}
