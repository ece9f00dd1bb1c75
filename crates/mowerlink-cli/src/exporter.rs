use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use chrono::{DateTime, Days, NaiveDate, Utc};
use mowerlink_core::{ConnectionState, Session, TelemetrySnapshot};
use tracing::{debug, info};

pub(crate) const FILE_PREFIX: &str = "mowerlink-";
const PRUNE_EVERY: Duration = Duration::from_secs(1800);

/// Appends every new telemetry snapshot to a daily JSONL file until ctrl-c.
pub async fn run_exporter(session: &Session, output_dir: &str, retention_days: u64) -> Result<()> {
    let out_dir = PathBuf::from(output_dir);
    fs::create_dir_all(&out_dir)?;
    prune_old_log_files(&out_dir, retention_days, SystemTime::now())?;

    let mut exporter = Exporter::new(out_dir, retention_days)?;
    let mut reader = session.telemetry();
    info!(dir=%exporter.out_dir.display(), "exporting telemetry");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            snapshot = reader.changed() => {
                let Some(snapshot) = snapshot else { break };
                let record = export_record(session.device().id.as_str(), session.state(), &snapshot);
                exporter.write(&record, snapshot.last_updated.unwrap_or_else(Utc::now))?;
                exporter.maybe_prune()?;
            }
        }
    }

    exporter.writer.flush()?;
    Ok(())
}

pub(crate) fn export_record(
    device_id: &str,
    state: ConnectionState,
    snapshot: &TelemetrySnapshot,
) -> serde_json::Value {
    serde_json::json!({
        "ts": snapshot.last_updated,
        "unix_ms": snapshot.last_updated.map(|ts| ts.timestamp_millis()),
        "device_id": device_id,
        "seq": snapshot.seq,
        "source": snapshot.source,
        "connection": state,
        "activity": snapshot.activity(),
        "battery_percent": snapshot.battery_percent(),
        "progress": snapshot.progress_percent(),
        "values": snapshot.values,
    })
}

pub(crate) struct Exporter {
    out_dir: PathBuf,
    retention_days: u64,
    current_day: String,
    writer: BufWriter<File>,
    last_prune: Instant,
}

impl Exporter {
    pub(crate) fn new(out_dir: PathBuf, retention_days: u64) -> Result<Self> {
        let day = day_of(Utc::now());
        let writer = open_writer(&out_dir, &day)?;

        Ok(Self {
            out_dir,
            retention_days,
            current_day: day,
            writer,
            last_prune: Instant::now(),
        })
    }

    pub(crate) fn write(&mut self, record: &serde_json::Value, ts: DateTime<Utc>) -> Result<()> {
        let day = day_of(ts);
        if day != self.current_day {
            self.writer.flush()?;
            self.writer = open_writer(&self.out_dir, &day)?;
            debug!(%day, "rotated export file");
            self.current_day = day;
        }

        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        fs::write(self.out_dir.join("latest.json"), serde_json::to_vec_pretty(record)?)?;
        Ok(())
    }

    fn maybe_prune(&mut self) -> Result<()> {
        if self.last_prune.elapsed() < PRUNE_EVERY {
            return Ok(());
        }
        self.last_prune = Instant::now();
        prune_old_log_files(&self.out_dir, self.retention_days, SystemTime::now())
    }
}

fn day_of(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

pub(crate) fn log_path(out_dir: &Path, day: &str) -> PathBuf {
    out_dir.join(format!("{FILE_PREFIX}{day}.jsonl"))
}

fn open_writer(out_dir: &Path, day: &str) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(out_dir, day))?;
    Ok(BufWriter::new(file))
}

/// Deletes export files dated more than `retention_days` before `now`.
pub(crate) fn prune_old_log_files(out_dir: &Path, retention_days: u64, now: SystemTime) -> Result<()> {
    let today = DateTime::<Utc>::from(now).date_naive();
    let cutoff = today
        .checked_sub_days(Days::new(retention_days))
        .unwrap_or(today);

    for entry in fs::read_dir(out_dir)? {
        let path = entry?.path();
        let file_date = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(FILE_PREFIX))
            .and_then(|n| n.strip_suffix(".jsonl"))
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());

        if file_date.is_some_and(|d| d < cutoff) {
            debug!(path=%path.display(), "pruning export file");
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}
