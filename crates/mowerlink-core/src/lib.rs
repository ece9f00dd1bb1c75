pub mod command;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod link;
pub mod schedule;
pub mod session;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod transport;
pub mod zones;

#[cfg(test)]
mod testing;

pub use command::{Ack, Command, CommandError, CommandStatus, MowJob, Nudge, NudgeDirection};
pub use config::{CommandLimits, SessionConfig, StreamConfig};
pub use control::MowerController;
pub use link::ConnectionState;
pub use schedule::{DueAction, Schedule, ScheduleEntry, ScheduledTask};
pub use session::{CancelOutcome, CommandTicket, Device, Session, SessionStats};
pub use store::{DeviceRecord, JsonFileStore, StateStore};
pub use stream::{
    CameraIndex, CloudCredentialSource, CredentialCache, RelayChannel, RelayEvent, StreamError,
    StreamSession, StreamStatus, TokenBundle,
};
pub use telemetry::{Activity, TelemetryReader, TelemetrySnapshot, WorkMode};
pub use transport::{Transport, TransportError, TransportKind};
pub use zones::{Zone, ZoneRegistry};
