use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::command::Ack;

pub mod ble;
pub mod cloud;
pub mod frame;
pub mod mqtt;

pub use frame::{InboundFrame, OutboundFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Ble,
    Mqtt,
    CloudRest,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportKind::Ble => "ble",
            TransportKind::Mqtt => "mqtt",
            TransportKind::CloudRest => "cloud_rest",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    pub kind: TransportKind,
    pub endpoint: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),
    #[error("timeout")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;
    async fn connect(&mut self) -> Result<LinkInfo, TransportError>;
    /// Hands the frame to the link. An error here means nothing left the host.
    async fn send(&mut self, frame: &OutboundFrame) -> Result<AckWaiter, TransportError>;
    fn subscribe(&mut self, sink: TelemetrySink);
    async fn heartbeat(&mut self) -> Result<(), TransportError>;
    async fn disconnect(&mut self) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct TelemetryFrame {
    pub source: TransportKind,
    pub values: BTreeMap<String, serde_json::Value>,
    pub received_at: DateTime<Utc>,
}

/// Frames that arrived while the ingestion queue was full, merged oldest first.
pub type Backlog = Arc<Mutex<Option<TelemetryFrame>>>;

/// Pushing never waits. A full queue parks the delta in the shared backlog,
/// and later deltas merge into it until the ingestion task drains it.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    source: TransportKind,
    tx: mpsc::Sender<TelemetryFrame>,
    backlog: Backlog,
}

impl TelemetrySink {
    pub fn new(source: TransportKind, tx: mpsc::Sender<TelemetryFrame>) -> Self {
        Self {
            source,
            tx,
            backlog: Backlog::default(),
        }
    }

    pub fn for_source(&self, source: TransportKind) -> Self {
        Self {
            source,
            tx: self.tx.clone(),
            backlog: self.backlog.clone(),
        }
    }

    pub fn backlog(&self) -> Backlog {
        self.backlog.clone()
    }

    pub fn push(&self, values: BTreeMap<String, serde_json::Value>) {
        let frame = TelemetryFrame {
            source: self.source,
            values,
            received_at: Utc::now(),
        };

        let mut backlog = self.backlog.lock().unwrap_or_else(|p| p.into_inner());
        let next = match backlog.take() {
            Some(mut parked) => {
                parked.values.extend(frame.values);
                parked.source = frame.source;
                parked.received_at = frame.received_at;
                parked
            }
            None => frame,
        };
        match self.tx.try_send(next) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(parked)) => {
                debug!(source=%self.source, keys=%parked.values.len(), "telemetry queue full, coalescing");
                *backlog = Some(parked);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(source=%self.source, "telemetry ingestion closed")
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AckRegistry {
    pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<Ack>>>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid) -> AckWaiter {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
        AckWaiter {
            id,
            inner: WaiterInner::Pending {
                rx,
                registry: Some(self.clone()),
            },
        }
    }

    pub fn resolve(&self, ack: Ack) -> bool {
        let sender = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&ack.id));
        match sender {
            Some(tx) => tx.send(ack).is_ok(),
            None => {
                debug!(id=%ack.id, "ack for unknown or abandoned command");
                false
            }
        }
    }

    /// Drops every outstanding waiter; their `wait` calls fail as unavailable.
    pub fn fail_all(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, id: &Uuid) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(id);
        }
    }
}

#[derive(Debug)]
enum WaiterInner {
    Ready(Option<Ack>),
    Pending {
        rx: oneshot::Receiver<Ack>,
        registry: Option<AckRegistry>,
    },
}

/// Future side of a delivered command. Dropping it withdraws the registration.
#[derive(Debug)]
pub struct AckWaiter {
    id: Uuid,
    inner: WaiterInner,
}

impl AckWaiter {
    pub fn ready(ack: Ack) -> Self {
        Self {
            id: ack.id,
            inner: WaiterInner::Ready(Some(ack)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn wait(mut self) -> Result<Ack, TransportError> {
        match &mut self.inner {
            WaiterInner::Ready(ack) => ack
                .take()
                .ok_or_else(|| TransportError::Protocol("ack already consumed".to_string())),
            WaiterInner::Pending { rx, .. } => rx
                .await
                .map_err(|_| TransportError::Unavailable("link closed before ack".to_string())),
        }
    }
}

impl Drop for AckWaiter {
    fn drop(&mut self) {
        if let WaiterInner::Pending { registry, .. } = &mut self.inner {
            if let Some(registry) = registry.take() {
                registry.forget(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(id: Uuid, code: i32) -> Ack {
        Ack {
            id,
            code,
            message: None,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn registered_waiter_receives_matching_ack() {
        let registry = AckRegistry::new();
        let id = Uuid::new_v4();
        let waiter = registry.register(id);

        assert!(registry.resolve(ack(id, 0)));
        let got = waiter.wait().await.expect("ack");

        assert_eq!(got.id, id);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn dropped_waiter_is_forgotten() {
        let registry = AckRegistry::new();
        let id = Uuid::new_v4();
        let waiter = registry.register(id);
        assert_eq!(registry.len(), 1);

        drop(waiter);

        assert!(registry.is_empty());
        assert!(!registry.resolve(ack(id, 0)));
    }

    #[tokio::test]
    async fn fail_all_unblocks_waiters() {
        let registry = AckRegistry::new();
        let waiter = registry.register(Uuid::new_v4());

        registry.fail_all();

        assert!(matches!(waiter.wait().await, Err(TransportError::Unavailable(_))));
    }

    #[test]
    fn full_sink_parks_deltas_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = TelemetrySink::new(TransportKind::Mqtt, tx);
        let values = |key: &str, v: i64| BTreeMap::from([(key.to_string(), serde_json::Value::from(v))]);

        sink.push(values("sys_status", 11));
        sink.push(values("sys_status", 13));
        sink.push(values("battery_percent", 50));

        let first = rx.try_recv().expect("queued frame");
        assert_eq!(first.values["sys_status"], 11);
        assert!(rx.try_recv().is_err());
        let parked = sink.backlog().lock().expect("backlog").take().expect("parked");
        assert_eq!(parked.values["sys_status"], 13);
        assert_eq!(parked.values["battery_percent"], 50);
    }

    #[test]
    fn parked_backlog_flushes_once_queue_has_room() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = TelemetrySink::new(TransportKind::Mqtt, tx);
        let values = |key: &str, v: i64| BTreeMap::from([(key.to_string(), serde_json::Value::from(v))]);
        sink.push(values("progress", 10));
        sink.push(values("progress", 20));

        rx.try_recv().expect("first frame");
        sink.push(values("battery_percent", 70));

        let merged = rx.try_recv().expect("merged frame");
        assert_eq!(merged.values["progress"], 20);
        assert_eq!(merged.values["battery_percent"], 70);
        assert!(sink.backlog().lock().expect("backlog").is_none());
    }
}
