use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::frame::route_inbound;
use super::{
    AckRegistry, AckWaiter, LinkInfo, OutboundFrame, TelemetrySink, Transport, TransportError,
    TransportKind,
};

/// GATT-level link to a mower, supplied by the host's Bluetooth stack.
#[async_trait]
pub trait BleLink: Send {
    async fn open(&mut self, address: &str) -> Result<(), TransportError>;
    async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError>;
    /// Notification stream for the current connection. Yields `None` once taken.
    fn take_notifications(&mut self) -> Option<mpsc::Receiver<Vec<u8>>>;
    async fn rssi(&mut self) -> Result<i16, TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
    fn is_open(&self) -> bool;
}

pub struct BleTransport<L: BleLink> {
    link: L,
    address: String,
    acks: AckRegistry,
    sink: Option<TelemetrySink>,
    reader: Option<JoinHandle<()>>,
}

impl<L: BleLink> BleTransport<L> {
    pub fn new(link: L, address: impl Into<String>) -> Self {
        Self {
            link,
            address: address.into(),
            acks: AckRegistry::new(),
            sink: None,
            reader: None,
        }
    }

    fn spawn_reader(&mut self, mut notifications: mpsc::Receiver<Vec<u8>>) {
        let acks = self.acks.clone();
        let sink = self.sink.clone();
        let address = self.address.clone();

        self.reader = Some(tokio::spawn(async move {
            while let Some(payload) = notifications.recv().await {
                if let Err(err) = route_inbound(&payload, &acks, sink.as_ref()) {
                    warn!(%address, error=%err, "discarding malformed ble notification");
                }
            }
            debug!(%address, "ble notification stream ended");
            acks.fail_all();
        }));
    }

    fn stop_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.acks.fail_all();
    }
}

#[async_trait]
impl<L: BleLink> Transport for BleTransport<L> {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    async fn connect(&mut self) -> Result<LinkInfo, TransportError> {
        self.stop_reader();
        if self.address.is_empty() {
            return Err(TransportError::Unavailable("no ble address configured".to_string()));
        }

        self.link.open(&self.address).await?;
        let notifications = self.link.take_notifications().ok_or_else(|| {
            TransportError::Protocol("ble link exposed no notification stream".to_string())
        })?;
        self.spawn_reader(notifications);
        info!(address=%self.address, "BLE connected");

        Ok(LinkInfo {
            kind: TransportKind::Ble,
            endpoint: self.address.clone(),
            connected_at: Utc::now(),
        })
    }

    async fn send(&mut self, frame: &OutboundFrame) -> Result<AckWaiter, TransportError> {
        if !self.link.is_open() {
            return Err(TransportError::Unavailable("ble link closed".to_string()));
        }
        let payload = frame.encode()?;
        let waiter = self.acks.register(frame.id);
        self.link.write(&payload).await?;
        Ok(waiter)
    }

    fn subscribe(&mut self, sink: TelemetrySink) {
        self.sink = Some(sink.for_source(TransportKind::Ble));
    }

    async fn heartbeat(&mut self) -> Result<(), TransportError> {
        if !self.link.is_open() {
            return Err(TransportError::Unavailable("ble link closed".to_string()));
        }
        let rssi = self.link.rssi().await?;
        if let Some(sink) = self.sink.as_ref() {
            let mut values = std::collections::BTreeMap::new();
            values.insert("ble_rssi".to_string(), serde_json::Value::from(rssi));
            sink.push(values);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.stop_reader();
        self.link.close().await
    }

    fn is_connected(&self) -> bool {
        self.link.is_open()
    }
}

impl<L: BleLink> Drop for BleTransport<L> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandEnvelope};
    use std::sync::{Arc, Mutex};

    struct LoopbackLink {
        open: bool,
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        notify_tx: Option<mpsc::Sender<Vec<u8>>>,
        notify_rx: Option<mpsc::Receiver<Vec<u8>>>,
    }

    impl LoopbackLink {
        fn new() -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            let link = Self {
                open: false,
                written: written.clone(),
                notify_tx: None,
                notify_rx: None,
            };
            (link, written)
        }
    }

    #[async_trait]
    impl BleLink for LoopbackLink {
        async fn open(&mut self, _address: &str) -> Result<(), TransportError> {
            let (tx, rx) = mpsc::channel(8);
            self.notify_tx = Some(tx);
            self.notify_rx = Some(rx);
            self.open = true;
            Ok(())
        }

        async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
            self.written.lock().expect("lock").push(frame.to_vec());
            let frame: serde_json::Value = serde_json::from_slice(frame).expect("json");
            let ack = format!(r#"{{"type":"ack","id":"{}","code":0}}"#, frame["id"].as_str().expect("id"));
            if let Some(tx) = self.notify_tx.as_ref() {
                tx.send(ack.into_bytes()).await.expect("notify");
            }
            Ok(())
        }

        fn take_notifications(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
            self.notify_rx.take()
        }

        async fn rssi(&mut self) -> Result<i16, TransportError> {
            Ok(-61)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.open = false;
            self.notify_tx = None;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    #[tokio::test]
    async fn command_written_to_link_is_acked_from_notification() {
        let (link, written) = LoopbackLink::new();
        let mut transport = BleTransport::new(link, "AA:BB:CC:DD:EE:FF");
        transport.connect().await.expect("connect");
        let envelope = CommandEnvelope::new(Command::LeaveDock);

        let waiter = transport.send(&OutboundFrame::from(&envelope)).await.expect("send");
        let ack = waiter.wait().await.expect("ack");

        assert_eq!(ack.id, envelope.id);
        assert_eq!(written.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_reports_rssi_as_telemetry() {
        let (link, _) = LoopbackLink::new();
        let (tx, mut rx) = mpsc::channel(4);
        let mut transport = BleTransport::new(link, "AA:BB:CC:DD:EE:FF");
        transport.subscribe(TelemetrySink::new(TransportKind::Ble, tx));
        transport.connect().await.expect("connect");

        transport.heartbeat().await.expect("heartbeat");

        let frame = rx.recv().await.expect("frame");
        assert_eq!(frame.values["ble_rssi"], -61);
    }

    #[tokio::test]
    async fn closed_link_refuses_send() {
        let (link, _) = LoopbackLink::new();
        let mut transport = BleTransport::new(link, "AA:BB:CC:DD:EE:FF");
        let envelope = CommandEnvelope::new(Command::LeaveDock);

        let result = transport.send(&OutboundFrame::from(&envelope)).await;

        assert!(matches!(result, Err(TransportError::Unavailable(_))));
    }
}
