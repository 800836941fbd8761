//! In-memory transports that record every call.

use crate::error::{ControlError, Result};
use crate::mqtt::MqttTransport;
use crate::udp::UdpTransport;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct UdpLog {
    pub broadcasts: Vec<Vec<u8>>,
    pub listens: usize,
    pub cancels: Vec<CancellationToken>,
    pub fail_broadcast: bool,
    /// Sent into the open listener whenever a broadcast goes out
    pub replies: Vec<Vec<u8>>,
    /// Already waiting in the queue when `listen` returns
    pub queued: Vec<Vec<u8>>,
    listener: Option<mpsc::Sender<Vec<u8>>>,
}

#[derive(Clone, Default)]
pub struct FakeUdp(pub Arc<Mutex<UdpLog>>);

impl FakeUdp {
    pub fn responding(replies: Vec<Vec<u8>>) -> Self {
        let fake = Self::default();
        fake.0.lock().replies = replies;
        fake
    }

    pub fn queued(queued: Vec<Vec<u8>>) -> Self {
        let fake = Self::default();
        fake.0.lock().queued = queued;
        fake
    }

    pub fn failing() -> Self {
        let fake = Self::default();
        fake.0.lock().fail_broadcast = true;
        fake
    }
}

impl UdpTransport for FakeUdp {
    async fn broadcast(&self, payload: &[u8]) -> Result<()> {
        let mut log = self.0.lock();
        log.broadcasts.push(payload.to_vec());
        if log.fail_broadcast {
            return Err(ControlError::Transport("network unreachable".into()));
        }
        if let Some(tx) = &log.listener {
            for reply in &log.replies {
                let _ = tx.try_send(reply.clone());
            }
        }
        Ok(())
    }

    fn listen(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<Vec<u8>>> {
        let mut log = self.0.lock();
        log.listens += 1;
        log.cancels.push(cancel);
        let (tx, rx) = mpsc::channel(32);
        for payload in &log.queued {
            let _ = tx.try_send(payload.clone());
        }
        log.listener = Some(tx);
        Ok(rx)
    }
}

#[derive(Default)]
pub struct MqttLog {
    /// Every attempted publish, failed ones included
    pub publishes: Vec<(String, Vec<u8>)>,
    pub subscriptions: Vec<String>,
    pub cancels: Vec<CancellationToken>,
    pub fail_publish: bool,
    pub fail_subscribe: bool,
    /// Waiting in the queue of every new subscription
    pub queued: Vec<Vec<u8>>,
    senders: Vec<mpsc::Sender<Vec<u8>>>,
}

#[derive(Clone, Default)]
pub struct FakeMqtt(pub Arc<Mutex<MqttLog>>);

impl FakeMqtt {
    pub fn failing() -> Self {
        let fake = Self::default();
        fake.0.lock().fail_publish = true;
        fake
    }

    pub fn with_messages(queued: Vec<Vec<u8>>) -> Self {
        let fake = Self::default();
        fake.0.lock().queued = queued;
        fake
    }
}

impl MqttTransport for FakeMqtt {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let mut log = self.0.lock();
        log.publishes.push((topic.to_string(), payload.to_vec()));
        if log.fail_publish {
            return Err(ControlError::Transport("connection refused".into()));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        let mut log = self.0.lock();
        log.subscriptions.push(topic.to_string());
        if log.fail_subscribe {
            return Err(ControlError::Transport("connection refused".into()));
        }
        log.cancels.push(cancel);
        let (tx, rx) = mpsc::channel(32);
        for payload in &log.queued {
            let _ = tx.try_send(payload.clone());
        }
        log.senders.push(tx);
        Ok(rx)
    }
}
