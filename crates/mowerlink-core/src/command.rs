use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{Bound, CommandLimits};
use crate::transport::TransportError;

pub const DEFAULT_NUDGE_SPEED: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NudgeDirection {
    Forward,
    Back,
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nudge {
    pub direction: NudgeDirection,
    pub speed: f64,
}

impl Nudge {
    pub fn new(direction: NudgeDirection) -> Self {
        Self {
            direction,
            speed: DEFAULT_NUDGE_SPEED,
        }
    }
}

/// Parameters of a mowing job. Channel mode 0 is single, 1 double, 2 segment, 3 none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MowJob {
    pub areas: Vec<u64>,
    pub speed: f64,
    pub channel_mode: u8,
    pub path_spacing_cm: u8,
    pub blade_height_mm: u8,
    pub border_laps: u8,
    pub obstacle_laps: u8,
    pub toward_deg: i16,
    pub toward_included_angle_deg: i16,
    pub job_mode: u8,
    pub rain_tactics: bool,
    pub start_progress: u8,
}

impl Default for MowJob {
    fn default() -> Self {
        Self {
            areas: Vec::new(),
            speed: 0.3,
            channel_mode: 0,
            path_spacing_cm: 25,
            blade_height_mm: 60,
            border_laps: 1,
            obstacle_laps: 1,
            toward_deg: 0,
            toward_included_angle_deg: 0,
            job_mode: 0,
            rain_tactics: true,
            start_progress: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "args", rename_all = "snake_case")]
pub enum Command {
    /// Plans the route and starts the job in a single request.
    StartMow(MowJob),
    /// Uploads the route plan; the job begins on `StartJob`.
    GenerateRoute(MowJob),
    StartJob,
    PauseTask,
    ResumeTask,
    CancelJob,
    ReturnToDock,
    CancelReturnToDock,
    LeaveDock,
    Nudge(Nudge),
    SetBladeHeight { height_mm: u8 },
    BladeControl { on: bool },
    SetSidelight { on: bool },
    RequestIotSync { stop: bool },
    ResyncRtkDock,
    JoinWebrtc,
    LeaveWebrtc,
    StartMapSync,
    GetDeviceVersion,
    CheckFirmwareUpdate,
    DownloadFirmwareUpdate,
    InstallFirmwareUpdate,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartMow(_) => "start_mow",
            Command::GenerateRoute(_) => "generate_route",
            Command::StartJob => "start_job",
            Command::PauseTask => "pause_task",
            Command::ResumeTask => "resume_task",
            Command::CancelJob => "cancel_job",
            Command::ReturnToDock => "return_to_dock",
            Command::CancelReturnToDock => "cancel_return_to_dock",
            Command::LeaveDock => "leave_dock",
            Command::Nudge(_) => "nudge",
            Command::SetBladeHeight { .. } => "set_blade_height",
            Command::BladeControl { .. } => "blade_control",
            Command::SetSidelight { .. } => "set_sidelight",
            Command::RequestIotSync { .. } => "request_iot_sync",
            Command::ResyncRtkDock => "resync_rtk_dock",
            Command::JoinWebrtc => "join_webrtc",
            Command::LeaveWebrtc => "leave_webrtc",
            Command::StartMapSync => "start_map_sync",
            Command::GetDeviceVersion => "get_device_version",
            Command::CheckFirmwareUpdate => "check_firmware_update",
            Command::DownloadFirmwareUpdate => "download_firmware_update",
            Command::InstallFirmwareUpdate => "install_firmware_update",
        }
    }

    /// Mutating commands cause a physical action and are never resent automatically.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Command::RequestIotSync { .. }
                | Command::StartMapSync
                | Command::GetDeviceVersion
                | Command::CheckFirmwareUpdate
        )
    }

    pub fn validate(&self, limits: &CommandLimits) -> Result<(), CommandError> {
        match self {
            Command::StartMow(job) | Command::GenerateRoute(job) => job.validate(limits),
            Command::Nudge(nudge) => check("speed", nudge.speed, limits.nudge_speed),
            Command::SetBladeHeight { height_mm } => {
                check("blade_height_mm", f64::from(*height_mm), limits.blade_height_mm)
            }
            _ => Ok(()),
        }
    }

    /// Applies wire-level normalisation before encoding.
    pub fn normalized(mut self) -> Self {
        if let Command::StartMow(job) | Command::GenerateRoute(job) = &mut self {
            if job.channel_mode != 1 {
                job.toward_included_angle_deg = 0;
            }
        }
        self
    }
}

impl MowJob {
    pub fn validate(&self, limits: &CommandLimits) -> Result<(), CommandError> {
        check("speed", self.speed, limits.speed)?;
        check("channel_mode", f64::from(self.channel_mode), limits.channel_mode)?;
        check("path_spacing_cm", f64::from(self.path_spacing_cm), limits.path_spacing_cm)?;
        check("blade_height_mm", f64::from(self.blade_height_mm), limits.blade_height_mm)?;
        check("border_laps", f64::from(self.border_laps), limits.laps)?;
        check("obstacle_laps", f64::from(self.obstacle_laps), limits.laps)?;
        check("toward_deg", f64::from(self.toward_deg), limits.angle_deg)?;
        check(
            "toward_included_angle_deg",
            f64::from(self.toward_included_angle_deg),
            limits.angle_deg,
        )?;
        check("job_mode", f64::from(self.job_mode), limits.job_mode)?;
        check("start_progress", f64::from(self.start_progress), limits.start_progress)?;
        Ok(())
    }
}

fn check(field: &'static str, value: f64, bound: Bound) -> Result<(), CommandError> {
    if bound.contains(value) {
        return Ok(());
    }
    Err(CommandError::InvalidParameter {
        field,
        value,
        min: bound.min,
        max: bound.max,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub command: Command,
}

impl CommandEnvelope {
    pub fn new(command: Command) -> Self {
        Self {
            id: Uuid::new_v4(),
            issued_at: Utc::now(),
            command: command.normalized(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acked,
    Failed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub id: Uuid,
    pub code: i32,
    pub message: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Ack {
    pub fn accepted(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("invalid parameter {field}={value} (allowed {min}..={max})")]
    InvalidParameter {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("no transport available")]
    TransportUnavailable,
    #[error("authentication rejected")]
    AuthenticationRejected,
    #[error("command {0} timed out waiting for acknowledgment")]
    CommandTimeout(Uuid),
    #[error("command {0} dropped: queue overflow")]
    Overflow(Uuid),
    #[error("command {0} cancelled before dispatch")]
    Cancelled(Uuid),
    #[error("command rejected by device: code {code}")]
    Rejected { code: i32, message: Option<String> },
    #[error("device not ready")]
    DeviceNotReady,
    #[error("session closed")]
    SessionClosed,
}

impl From<TransportError> for CommandError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::AuthenticationRejected(_) => CommandError::AuthenticationRejected,
            _ => CommandError::TransportUnavailable,
        }
    }
}
