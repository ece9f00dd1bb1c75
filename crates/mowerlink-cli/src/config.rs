use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mowerlink_core::schedule::ScheduledTask;
use mowerlink_core::{CommandLimits, Device, Schedule, SessionConfig, StreamConfig, TransportKind, Zone, ZoneRegistry};
use serde::Deserialize;

/// Host configuration file. Durations are in milliseconds.
#[derive(Debug, Deserialize)]
pub struct HostConfig {
    pub device: Device,
    #[serde(default)]
    pub mqtt: Option<MqttSection>,
    #[serde(default)]
    pub cloud: Option<CloudSection>,
    #[serde(default)]
    pub session: SessionOverrides,
    #[serde(default)]
    pub stream: StreamOverrides,
    #[serde(default)]
    pub limits: CommandLimits,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub schedules: Vec<ScheduleWindow>,
}

#[derive(Debug, Deserialize)]
pub struct MqttSection {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct CloudSection {
    pub base_url: String,
    pub token: String,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionOverrides {
    pub connect_timeout_ms: Option<u64>,
    pub command_timeout_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub heartbeat_timeout_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub max_queue_depth: Option<usize>,
    pub reconnect_attempts: Option<u32>,
    pub stale_after_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamOverrides {
    pub fetch_timeout_ms: Option<u64>,
    pub join_timeout_ms: Option<u64>,
    pub max_rejoin_attempts: Option<u32>,
    pub rejoin_backoff_ms: Option<u64>,
    pub default_ttl_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(flatten)]
    pub task: ScheduledTask,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./data/state")
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_true() -> bool {
    true
}

fn ms(value: Option<u64>, fallback: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(fallback)
}

impl HostConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn session_config(&self) -> SessionConfig {
        let d = SessionConfig::default();
        let o = &self.session;
        SessionConfig {
            connect_timeout: ms(o.connect_timeout_ms, d.connect_timeout),
            command_timeout: ms(o.command_timeout_ms, d.command_timeout),
            heartbeat_interval: ms(o.heartbeat_interval_ms, d.heartbeat_interval),
            heartbeat_timeout: ms(o.heartbeat_timeout_ms, d.heartbeat_timeout),
            failure_threshold: o.failure_threshold.unwrap_or(d.failure_threshold),
            backoff_base: ms(o.backoff_base_ms, d.backoff_base),
            backoff_max: ms(o.backoff_max_ms, d.backoff_max),
            max_queue_depth: o.max_queue_depth.unwrap_or(d.max_queue_depth),
            reconnect_attempts: o.reconnect_attempts.unwrap_or(d.reconnect_attempts),
            stale_after: ms(o.stale_after_ms, d.stale_after),
            ..d
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        let d = StreamConfig::default();
        let o = &self.stream;
        StreamConfig {
            fetch_timeout: ms(o.fetch_timeout_ms, d.fetch_timeout),
            join_timeout: ms(o.join_timeout_ms, d.join_timeout),
            max_rejoin_attempts: o.max_rejoin_attempts.unwrap_or(d.max_rejoin_attempts),
            rejoin_backoff: ms(o.rejoin_backoff_ms, d.rejoin_backoff),
            default_ttl: ms(o.default_ttl_ms, d.default_ttl),
            ..d
        }
    }

    pub fn zone_registry(&self) -> Result<ZoneRegistry> {
        let mut registry = ZoneRegistry::new();
        for zone in &self.zones {
            registry.create(zone.clone())?;
        }
        Ok(registry)
    }

    pub fn schedule(&self) -> Result<Schedule> {
        let mut schedule = Schedule::new();
        for window in &self.schedules {
            schedule.add(window.start, window.end, window.task.clone())?;
        }
        Ok(schedule)
    }

    pub fn transports_configured(&self) -> Vec<TransportKind> {
        let mut kinds = Vec::new();
        if self.mqtt.is_some() {
            kinds.push(TransportKind::Mqtt);
        }
        if self.cloud.is_some() {
            kinds.push(TransportKind::CloudRest);
        }
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "device": {
            "id": "Luba-VS0001",
            "name": "back lawn",
            "product_key": "a1pvCnb3PPu",
            "ble_address": null,
            "preference": "mqtt"
        },
        "cloud": { "base_url": "https://api.example.test", "token": "t" },
        "session": { "command_timeout_ms": 2500, "failure_threshold": 4 },
        "stream": { "max_rejoin_attempts": 5 },
        "zones": [ { "id": "front", "name": "front", "area_hash": 11 } ],
        "schedules": [
            { "start": "2026-05-02T09:00:00Z", "end": "2026-05-02T11:00:00Z", "task": "start_mowing" }
        ]
    }"#;

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let config = HostConfig::parse(SAMPLE.as_bytes()).expect("parse");

        let session = config.session_config();
        let stream = config.stream_config();

        assert_eq!(session.command_timeout, Duration::from_millis(2500));
        assert_eq!(session.failure_threshold, 4);
        assert_eq!(session.heartbeat_interval, SessionConfig::default().heartbeat_interval);
        assert_eq!(stream.max_rejoin_attempts, 5);
        assert_eq!(config.state_dir, PathBuf::from("./data/state"));
    }

    #[test]
    fn zones_and_schedules_are_loaded() {
        let config = HostConfig::parse(SAMPLE.as_bytes()).expect("parse");

        let zones = config.zone_registry().expect("zones");
        let schedule = config.schedule().expect("schedule");

        assert_eq!(zones.area_hashes(["front"]).expect("hash"), vec![11]);
        assert_eq!(schedule.list().len(), 1);
        assert_eq!(config.transports_configured(), vec![TransportKind::CloudRest]);
    }
}
