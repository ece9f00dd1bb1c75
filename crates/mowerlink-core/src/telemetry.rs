use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::transport::{Backlog, TelemetryFrame, TransportKind};

pub const SYS_STATUS: &str = "sys_status";
pub const CHARGE_STATE: &str = "charge_state";
pub const ACTIVITY_MODE: &str = "activity_mode";
pub const BATTERY_PERCENT: &str = "battery_percent";
pub const PROGRESS: &str = "progress";
pub const DEVICE_VERSION: &str = "device_version";

/// Device work mode as reported in `sys_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkMode {
    NotActive,
    Online,
    Offline,
    Initialization,
    Ready,
    Working,
    Returning,
    Charging,
    Updating,
    Lock,
    Pause,
    ManualMowing,
    LocationError,
    ChargingPause,
    Other(u8),
}

impl From<u8> for WorkMode {
    fn from(code: u8) -> Self {
        match code {
            0 => WorkMode::NotActive,
            1 => WorkMode::Online,
            2 => WorkMode::Offline,
            10 => WorkMode::Initialization,
            11 => WorkMode::Ready,
            13 => WorkMode::Working,
            14 => WorkMode::Returning,
            15 => WorkMode::Charging,
            16 => WorkMode::Updating,
            17 => WorkMode::Lock,
            19 => WorkMode::Pause,
            20 => WorkMode::ManualMowing,
            37 => WorkMode::LocationError,
            39 => WorkMode::ChargingPause,
            other => WorkMode::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Mowing,
    Docked,
    Paused,
    Error,
}

impl Activity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activity::Mowing => "mowing",
            Activity::Docked => "docked",
            Activity::Paused => "paused",
            Activity::Error => "error",
        }
    }

    pub fn derive(mode: WorkMode, charge_state: i64) -> Option<Self> {
        match mode {
            WorkMode::Pause => Some(Activity::Paused),
            WorkMode::Ready if charge_state == 0 => Some(Activity::Paused),
            WorkMode::Ready => Some(Activity::Docked),
            WorkMode::Working | WorkMode::Returning => Some(Activity::Mowing),
            WorkMode::Lock => Some(Activity::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable point-in-time view of device state. Replaced whole on every update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub seq: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub source: Option<TransportKind>,
    pub values: BTreeMap<String, serde_json::Value>,
}

impl TelemetrySnapshot {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(|v| v.as_f64())
    }

    pub fn i64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(|v| v.as_i64())
    }

    pub fn battery_percent(&self) -> Option<f64> {
        self.f64(BATTERY_PERCENT)
    }

    pub fn progress_percent(&self) -> Option<f64> {
        self.f64(PROGRESS)
    }

    pub fn device_version(&self) -> Option<String> {
        self.get(DEVICE_VERSION)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    pub fn work_mode(&self) -> Option<WorkMode> {
        self.i64(SYS_STATUS)
            .and_then(|v| u8::try_from(v).ok())
            .map(WorkMode::from)
    }

    pub fn charge_state(&self) -> Option<i64> {
        self.i64(CHARGE_STATE)
    }

    pub fn activity(&self) -> Option<Activity> {
        let mode = self.work_mode()?;
        Activity::derive(mode, self.charge_state().unwrap_or_default())
    }

    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_updated
            .map(|ts| (now - ts).to_std().unwrap_or_default())
    }

    /// A snapshot that was never written is always stale.
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.age(now).map(|age| age > threshold).unwrap_or(true)
    }

    fn successor(&self, frame: TelemetryFrame) -> Self {
        let mut values = self.values.clone();
        values.extend(frame.values);

        let mut next = Self {
            seq: self.seq + 1,
            last_updated: Some(frame.received_at),
            source: Some(frame.source),
            values,
        };
        match next.activity() {
            Some(activity) => {
                next.values.insert(
                    ACTIVITY_MODE.to_string(),
                    serde_json::Value::String(activity.as_str().to_string()),
                );
            }
            None => {
                next.values.remove(ACTIVITY_MODE);
            }
        }
        next
    }
}

pub fn cache() -> (TelemetryWriter, TelemetryReader) {
    let (tx, rx) = watch::channel(Arc::new(TelemetrySnapshot::default()));
    (TelemetryWriter { tx }, TelemetryReader { rx })
}

#[derive(Debug)]
pub struct TelemetryWriter {
    tx: watch::Sender<Arc<TelemetrySnapshot>>,
}

impl TelemetryWriter {
    pub fn apply(&self, frame: TelemetryFrame) -> Arc<TelemetrySnapshot> {
        let next = Arc::new(self.tx.borrow().successor(frame));
        self.tx.send_replace(next.clone());
        next
    }

    pub fn reader(&self) -> TelemetryReader {
        TelemetryReader {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryReader {
    rx: watch::Receiver<Arc<TelemetrySnapshot>>,
}

impl TelemetryReader {
    pub fn latest(&self) -> Arc<TelemetrySnapshot> {
        self.rx.borrow().clone()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.rx.borrow().last_updated
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.latest().is_stale(threshold, Utc::now())
    }

    /// Waits for the next snapshot; `None` once the writer is gone.
    pub async fn changed(&mut self) -> Option<Arc<TelemetrySnapshot>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

pub fn spawn_ingestion(
    writer: TelemetryWriter,
    mut frames: mpsc::Receiver<TelemetryFrame>,
    backlog: Backlog,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let snapshot = writer.apply(frame);
            debug!(seq=%snapshot.seq, source=?snapshot.source, "telemetry updated");

            let parked = {
                let mut parked = backlog.lock().unwrap_or_else(|p| p.into_inner());
                if frames.is_empty() {
                    parked.take()
                } else {
                    None
                }
            };
            if let Some(frame) = parked {
                let snapshot = writer.apply(frame);
                debug!(seq=%snapshot.seq, "coalesced telemetry applied");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(values: serde_json::Value) -> TelemetryFrame {
        let values = values
            .as_object()
            .expect("object")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        TelemetryFrame {
            source: TransportKind::Mqtt,
            values,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn update_replaces_snapshot_and_keeps_previous_values() {
        let (writer, reader) = cache();
        writer.apply(frame(json!({"battery_percent": 80, "progress": 10})));
        let before = reader.latest();

        writer.apply(frame(json!({"progress": 20})));
        let after = reader.latest();

        assert_eq!(before.progress_percent(), Some(10.0));
        assert_eq!(after.progress_percent(), Some(20.0));
        assert_eq!(after.battery_percent(), Some(80.0));
        assert_eq!(after.seq, before.seq + 1);
    }

    #[test]
    fn activity_mode_follows_work_mode_and_charge_state() {
        let (writer, reader) = cache();

        writer.apply(frame(json!({"sys_status": 13, "charge_state": 0})));
        assert_eq!(reader.latest().values[ACTIVITY_MODE], "mowing");

        writer.apply(frame(json!({"sys_status": 11, "charge_state": 1})));
        assert_eq!(reader.latest().activity(), Some(Activity::Docked));

        writer.apply(frame(json!({"sys_status": 11, "charge_state": 0})));
        assert_eq!(reader.latest().activity(), Some(Activity::Paused));

        writer.apply(frame(json!({"sys_status": 17})));
        assert_eq!(reader.latest().activity(), Some(Activity::Error));

        writer.apply(frame(json!({"sys_status": 15})));
        assert!(reader.latest().get(ACTIVITY_MODE).is_none());
    }

    #[test]
    fn empty_cache_is_stale() {
        let (_writer, reader) = cache();

        assert!(reader.is_stale(Duration::from_secs(60)));
        assert!(reader.last_updated().is_none());
    }

    #[test]
    fn old_snapshot_is_flagged_stale() {
        let (writer, reader) = cache();
        let mut old = frame(json!({"battery_percent": 50}));
        old.received_at = Utc::now() - chrono::Duration::seconds(300);
        writer.apply(old);

        assert!(reader.is_stale(Duration::from_secs(120)));
        assert!(!reader.latest().is_stale(Duration::from_secs(600), Utc::now()));
    }

    #[test]
    fn concurrent_readers_only_see_whole_snapshots() {
        let (writer, reader) = cache();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reader = reader.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let snap = reader.latest();
                        let a = snap.i64("a").unwrap_or_default();
                        let b = snap.i64("b").unwrap_or_default();
                        assert_eq!(a, b, "reader observed a partial update");
                    }
                })
            })
            .collect();

        for n in 0..500 {
            writer.apply(frame(json!({"a": n, "b": n})));
        }

        for handle in readers {
            handle.join().expect("reader thread");
        }
    }

    #[tokio::test]
    async fn ingestion_task_feeds_readers() {
        let (writer, mut reader) = cache();
        let (tx, rx) = mpsc::channel(4);
        let task = spawn_ingestion(writer, rx, Backlog::default());

        tx.send(frame(json!({"battery_percent": 64}))).await.expect("send");
        let snap = reader.changed().await.expect("snapshot");

        assert_eq!(snap.battery_percent(), Some(64.0));
        drop(tx);
        task.await.expect("ingestion ends");
    }

    #[tokio::test]
    async fn deltas_parked_on_a_full_queue_are_not_lost() {
        // Arrange
        let (writer, mut reader) = cache();
        let (tx, rx) = mpsc::channel(1);
        let sink = crate::transport::TelemetrySink::new(TransportKind::Mqtt, tx);
        let values = |v: serde_json::Value| frame(v).values;

        // Act
        sink.push(values(json!({"sys_status": 11, "charge_state": 1})));
        sink.push(values(json!({"sys_status": 13, "charge_state": 0})));
        sink.push(values(json!({"battery_percent": 50})));
        let task = spawn_ingestion(writer, rx, sink.backlog());
        while reader.latest().battery_percent().is_none() {
            reader.changed().await.expect("snapshot");
        }

        // Assert
        let snap = reader.latest();
        assert_eq!(snap.work_mode(), Some(WorkMode::Working));
        assert_eq!(snap.activity(), Some(Activity::Mowing));
        assert_eq!(snap.seq, 2);
        drop(sink);
        task.await.expect("ingestion ends");
    }
}
