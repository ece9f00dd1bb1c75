use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub failure_threshold: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_queue_depth: usize,
    pub reconnect_attempts: u32,
    pub idempotent_retries: u32,
    pub stale_after: Duration,
    pub telemetry_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(3),
            failure_threshold: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            max_queue_depth: 16,
            reconnect_attempts: 5,
            idempotent_retries: 1,
            stale_after: Duration::from_secs(120),
            telemetry_buffer: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub fetch_timeout: Duration,
    pub join_timeout: Duration,
    pub max_rejoin_attempts: u32,
    pub rejoin_backoff: Duration,
    /// Credentials are treated as expired this long before their stated expiry.
    pub expiry_skew: Duration,
    /// Lifetime assumed when the credential response carries no expiry.
    pub default_ttl: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(15),
            max_rejoin_attempts: 3,
            rejoin_backoff: Duration::from_secs(2),
            expiry_skew: Duration::from_secs(30),
            default_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Inclusive numeric bound used for command parameter validation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub min: f64,
    pub max: f64,
}

impl Bound {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandLimits {
    pub speed: Bound,
    pub nudge_speed: Bound,
    pub blade_height_mm: Bound,
    pub path_spacing_cm: Bound,
    pub laps: Bound,
    pub angle_deg: Bound,
    pub start_progress: Bound,
    pub channel_mode: Bound,
    pub job_mode: Bound,
}

impl Default for CommandLimits {
    fn default() -> Self {
        Self {
            speed: Bound::new(0.2, 1.2),
            nudge_speed: Bound::new(0.1, 1.0),
            blade_height_mm: Bound::new(25.0, 70.0),
            path_spacing_cm: Bound::new(20.0, 35.0),
            laps: Bound::new(0.0, 4.0),
            angle_deg: Bound::new(-180.0, 180.0),
            start_progress: Bound::new(0.0, 100.0),
            channel_mode: Bound::new(0.0, 3.0),
            job_mode: Bound::new(0.0, 1.0),
        }
    }
}
