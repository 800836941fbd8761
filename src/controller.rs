//! Device operations: discover, adopt, activate, monitor, switch, upgrade.
//!
//! Each operation builds a fresh envelope, hands it to a channel and, when a
//! reply is expected, owns the listener or subscription it starts. Listeners
//! are tied to a [`CancellationToken`] guarded for the lifetime of the
//! operation, so no socket or broker session outlives the call that opened it.

use crate::config::{ConnParams, Settings, UdpConfig};
use crate::envelope::{
    self, ActivateRequest, AdoptRequest, DeviceReport, OtaProgress, PlugIndex, PlugState,
    PowerReading, ReportRequest, SwitchRequest, UpgradeRequest,
};
use crate::error::{ControlError, Result};
use crate::mqtt::{MqttChannel, MqttTransport, Topic};
use crate::transport::{self, Delivery};
use crate::udp::{UdpChannel, UdpTransport};
use futures_core::stream::Stream;
use log::{debug, info, warn};
use std::fmt;
use tokio::time::{Duration, Instant, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Result of a switch command.
#[derive(Debug, Clone)]
pub struct SwitchOutcome {
    pub plug: PlugIndex,
    pub on: bool,
    pub delivery: Delivery,
    /// State read back after the settle delay. Absent after a UDP fallback
    /// or when the read-back failed.
    pub state: Option<PlugState>,
}

impl fmt::Display for SwitchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Plug {} switched {}, {}",
            self.plug,
            if self.on { "on" } else { "off" },
            self.delivery
        )?;
        if let Some(state) = &self.state {
            write!(f, "{}", state)?;
        }
        Ok(())
    }
}

/// Builder for a [`Controller`] talking to real sockets and brokers.
#[derive(Debug, Clone)]
pub struct ControllerBuilder {
    conn: ConnParams,
    udp: UdpConfig,
    settings: Settings,
}

impl ControllerBuilder {
    pub fn new(conn: ConnParams) -> Self {
        Self {
            conn,
            udp: UdpConfig::default(),
            settings: Settings::default(),
        }
    }

    /// Device type segment of the topics (default `ztc1`).
    pub fn device_type<S: Into<String>>(mut self, device_type: S) -> Self {
        self.settings.device_type = device_type.into();
        self
    }

    pub fn discover_timeout(mut self, timeout: Duration) -> Self {
        self.settings.discover_timeout = timeout;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.settings.tick_interval = interval;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settings.settle_delay = delay;
        self
    }

    /// Bound the upgrade progress wait. Unbounded by default.
    pub fn upgrade_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settings.upgrade_timeout = timeout;
        self
    }

    /// Bound the wait for a state report, including the read-back after a
    /// switch. Unbounded by default.
    pub fn state_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settings.state_timeout = timeout;
        self
    }

    pub fn udp(mut self, udp: UdpConfig) -> Self {
        self.udp = udp;
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Controller {
        let mqtt = MqttChannel::new(self.conn.clone())
            .with_handshake_timeout(self.settings.mqtt_handshake_timeout)
            .with_disconnect_grace(self.settings.disconnect_grace);
        let udp = UdpChannel::new(self.udp);
        Controller::with_transports(mqtt, udp, self.conn, self.settings)
    }
}

/// Runs device operations over an MQTT and a UDP transport.
pub struct Controller<M = MqttChannel, U = UdpChannel> {
    mqtt: M,
    udp: U,
    conn: ConnParams,
    settings: Settings,
}

impl<M, U> Controller<M, U>
where
    M: MqttTransport,
    U: UdpTransport,
{
    pub fn with_transports(mqtt: M, udp: U, conn: ConnParams, settings: Settings) -> Self {
        Self {
            mqtt,
            udp,
            conn,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn conn(&self) -> &ConnParams {
        &self.conn
    }

    fn topic(&self, mac: &str, kind: Topic) -> String {
        kind.path(&self.settings.device_type, mac)
    }

    // -------------------------------------------------------------------------
    // Discovery & provisioning (UDP only)
    // -------------------------------------------------------------------------

    /// Broadcast a report request and return the first well-formed reply.
    ///
    /// Fails with [`ControlError::Timeout`] once the discover deadline passes
    /// without a reply. Only the first reply is consulted.
    pub async fn discover(&self) -> Result<DeviceReport> {
        self.discover_with_progress(|| {}).await
    }

    /// Like [`discover`](Self::discover), calling `on_tick` once per tick
    /// interval while waiting.
    pub async fn discover_with_progress<F>(&self, mut on_tick: F) -> Result<DeviceReport>
    where
        F: FnMut() + Send,
    {
        let request = envelope::encode(&ReportRequest::default())?;

        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let mut replies = self.udp.listen(cancel.clone())?;

        info!("Broadcast to the local area network, wait for device to report");
        self.udp.broadcast(&request).await?;

        let limit = self.settings.discover_timeout;
        let tick_every = self.settings.tick_interval;
        let deadline = sleep(limit);
        tokio::pin!(deadline);
        let mut tick = interval_at(Instant::now() + tick_every, tick_every);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("Timeout finding device after {:?}", limit);
                    return Err(ControlError::Timeout(limit));
                }
                _ = tick.tick() => on_tick(),
                reply = replies.recv() => {
                    let Some(payload) = reply else {
                        return Err(ControlError::Transport("UDP listener stopped".into()));
                    };
                    match envelope::decode::<DeviceReport>(&payload) {
                        Ok(report) => {
                            info!("Device found: {}", report);
                            return Ok(report);
                        }
                        Err(e) => debug!("Ignoring discovery reply: {}", e),
                    }
                }
            }
        }
    }

    /// Broadcast broker settings to the plug. No acknowledgment is awaited.
    pub async fn adopt(&self, mac: &str) -> Result<()> {
        let payload = envelope::encode(&AdoptRequest::new(mac, &self.conn))?;
        info!("Adopt {}: sending MQTT server {}", mac, self.conn.broker_uri());
        self.udp.broadcast(&payload).await
    }

    // -------------------------------------------------------------------------
    // Commands (MQTT with UDP fallback)
    // -------------------------------------------------------------------------

    /// Send the activation code.
    pub async fn activate(&self, mac: &str, code: &str) -> Result<Delivery> {
        let request = ActivateRequest {
            mac: mac.to_string(),
            lock: code.to_string(),
        };
        let payload = envelope::encode(&request)?;
        transport::deliver(&self.mqtt, &self.udp, &self.topic(mac, Topic::Set), &payload).await
    }

    /// Switch one outlet, then read back the plug state.
    ///
    /// `plug` is validated before any network activity. The read-back only
    /// happens when the command went over MQTT.
    pub async fn switch(&self, mac: &str, plug: i64, on: bool) -> Result<SwitchOutcome> {
        let plug = PlugIndex::new(plug)?;
        let request = SwitchRequest {
            mac: mac.to_string(),
            plug,
            on,
        };
        let payload = envelope::encode(&request)?;
        let delivery =
            transport::deliver(&self.mqtt, &self.udp, &self.topic(mac, Topic::Set), &payload)
                .await?;

        let state = if delivery.is_fallback() {
            None
        } else {
            sleep(self.settings.settle_delay).await;
            match self.plug_state(mac).await {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!("Switched plug {} but could not read state back: {}", plug, e);
                    None
                }
            }
        };

        Ok(SwitchOutcome {
            plug,
            on,
            delivery,
            state,
        })
    }

    // -------------------------------------------------------------------------
    // Monitoring (MQTT only)
    // -------------------------------------------------------------------------

    /// Wait for the next state report and return it. Single-shot: the
    /// subscription is cancelled as soon as one report decodes.
    ///
    /// With a state timeout in the settings, fails with
    /// [`ControlError::Timeout`] when no report decodes in time.
    pub async fn plug_state(&self, mac: &str) -> Result<PlugState> {
        let topic = self.topic(mac, Topic::State);
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let mut rx = self.mqtt.subscribe(&topic, cancel.clone()).await?;

        let next_report = async {
            while let Some(payload) = rx.recv().await {
                match envelope::decode::<PlugState>(&payload) {
                    Ok(state) => {
                        cancel.cancel();
                        return Ok(state);
                    }
                    Err(e) => debug!("Ignoring state payload on {}: {}", topic, e),
                }
            }
            Err(ControlError::Transport(format!(
                "subscription to {} ended without a state report",
                topic
            )))
        };

        match self.settings.state_timeout {
            Some(limit) => timeout(limit, next_report)
                .await
                .map_err(|_| ControlError::Timeout(limit))?,
            None => next_report.await,
        }
    }

    /// Stream power telemetry until the stream is dropped.
    ///
    /// Connect and subscribe failures are returned before any reading;
    /// undecodable payloads are skipped.
    pub async fn power_readings(
        &self,
        mac: &str,
    ) -> Result<impl Stream<Item = PowerReading> + Send> {
        let topic = self.topic(mac, Topic::Sensor);
        let cancel = CancellationToken::new();
        let mut rx = self.mqtt.subscribe(&topic, cancel.clone()).await?;
        let guard = cancel.drop_guard();

        Ok(async_stream::stream! {
            let _guard = guard;
            while let Some(payload) = rx.recv().await {
                match envelope::decode::<PowerReading>(&payload) {
                    Ok(reading) => yield reading,
                    Err(e) => debug!("Ignoring sensor payload on {}: {}", topic, e),
                }
            }
        })
    }

    // -------------------------------------------------------------------------
    // Firmware upgrade (MQTT command, UDP progress)
    // -------------------------------------------------------------------------

    /// Point the plug at a firmware image and follow its progress.
    ///
    /// The command is published over MQTT only. Progress arrives by UDP;
    /// every value is passed to `on_progress` and the call returns once it
    /// reaches 100. Without an upgrade timeout in the settings this waits as
    /// long as the plug stays silent.
    pub async fn upgrade<F>(&self, mac: &str, ota_url: &str, mut on_progress: F) -> Result<()>
    where
        F: FnMut(f64) + Send,
    {
        let payload = envelope::encode(&UpgradeRequest::new(mac, ota_url))?;
        self.mqtt
            .publish(&self.topic(mac, Topic::Set), &payload)
            .await?;
        info!("Upgrade of {} requested from {}", mac, ota_url);

        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let mut rx = self.udp.listen(cancel.clone())?;

        let follow = async {
            while let Some(payload) = rx.recv().await {
                match envelope::decode::<OtaProgress>(&payload) {
                    Ok(progress) => {
                        on_progress(progress.ota_progress);
                        if progress.is_complete() {
                            cancel.cancel();
                            return Ok(());
                        }
                    }
                    Err(e) => debug!("Ignoring progress payload: {}", e),
                }
            }
            Err(ControlError::Transport("UDP listener stopped".into()))
        };

        match self.settings.upgrade_timeout {
            Some(limit) => timeout(limit, follow)
                .await
                .map_err(|_| ControlError::Timeout(limit))?,
            None => follow.await,
        }
    }
}
