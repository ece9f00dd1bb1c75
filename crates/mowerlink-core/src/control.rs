use tracing::{debug, info, warn};

use crate::command::{Command, CommandError, MowJob, Nudge, NudgeDirection, DEFAULT_NUDGE_SPEED};
use crate::session::Session;
use crate::telemetry::WorkMode;

pub struct MowerController {
    session: Session,
    default_job: MowJob,
}

impl MowerController {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            default_job: MowJob::default(),
        }
    }

    pub fn with_default_job(mut self, job: MowJob) -> Self {
        self.default_job = job;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn work_mode(&self) -> Result<WorkMode, CommandError> {
        self.session
            .telemetry()
            .latest()
            .work_mode()
            .ok_or(CommandError::DeviceNotReady)
    }

    fn charge_state(&self) -> i64 {
        self.session
            .telemetry()
            .latest()
            .charge_state()
            .unwrap_or_default()
    }

    async fn run(&self, issued: &mut Vec<Command>, command: Command) -> Result<(), CommandError> {
        debug!(cmd=%command.name(), "issuing");
        self.session.execute(command.clone()).await?;
        issued.push(command);
        Ok(())
    }

    async fn sync(&self, issued: &mut Vec<Command>) -> Result<(), CommandError> {
        self.run(issued, Command::RequestIotSync { stop: false }).await
    }

    /// Starts or resumes mowing. Returns the commands issued, empty when already mowing.
    pub async fn start_mowing(&self, job: Option<MowJob>) -> Result<Vec<Command>, CommandError> {
        let mut mode = self.work_mode()?;
        let mut issued = Vec::new();

        if mode == WorkMode::Returning {
            self.run(&mut issued, Command::CancelReturnToDock).await?;
            self.sync(&mut issued).await?;
            mode = self.work_mode()?;
        }

        match mode {
            WorkMode::Pause => {
                self.run(&mut issued, Command::ResumeTask).await?;
                self.sync(&mut issued).await?;
            }
            WorkMode::Ready => {
                let job = job.unwrap_or_else(|| self.default_job.clone());
                self.run(&mut issued, Command::GenerateRoute(job)).await?;
                self.run(&mut issued, Command::StartJob).await?;
                self.sync(&mut issued).await?;
            }
            _ => {}
        }
        info!(device=%self.session.device().id, ?mode, commands=%issued.len(), "start mowing");
        Ok(issued)
    }

    /// Sends the mower home. Does nothing while it is charging.
    pub async fn dock(&self) -> Result<Vec<Command>, CommandError> {
        let mode = self.work_mode()?;
        let mut issued = Vec::new();
        if self.charge_state() != 0 {
            return Ok(issued);
        }

        match mode {
            WorkMode::Returning => {
                self.run(&mut issued, Command::CancelReturnToDock).await?;
                self.sync(&mut issued).await?;
            }
            WorkMode::Working | WorkMode::Pause | WorkMode::Ready => {
                if mode == WorkMode::Working {
                    self.run(&mut issued, Command::PauseTask).await?;
                }
                self.run(&mut issued, Command::ReturnToDock).await?;
                self.sync(&mut issued).await?;
            }
            _ => {}
        }
        info!(device=%self.session.device().id, ?mode, commands=%issued.len(), "dock");
        Ok(issued)
    }

    pub async fn pause(&self) -> Result<Vec<Command>, CommandError> {
        let mode = self.work_mode()?;
        let mut issued = Vec::new();

        match mode {
            WorkMode::Returning => {
                self.run(&mut issued, Command::CancelReturnToDock).await?;
                self.sync(&mut issued).await?;
            }
            WorkMode::Working => {
                self.run(&mut issued, Command::PauseTask).await?;
                self.sync(&mut issued).await?;
            }
            _ => {}
        }
        Ok(issued)
    }

    pub async fn cancel_job(&self) -> Result<Vec<Command>, CommandError> {
        let mut issued = Vec::new();
        self.run(&mut issued, Command::CancelJob).await?;
        self.sync(&mut issued).await?;
        Ok(issued)
    }

    pub async fn nudge(
        &self,
        direction: NudgeDirection,
        speed: Option<f64>,
    ) -> Result<Vec<Command>, CommandError> {
        let nudge = Nudge {
            direction,
            speed: speed.unwrap_or(DEFAULT_NUDGE_SPEED),
        };
        let mut issued = Vec::new();
        self.run(&mut issued, Command::Nudge(nudge)).await?;
        Ok(issued)
    }

    pub async fn sync_maps(&self) -> Result<Vec<Command>, CommandError> {
        let mut issued = Vec::new();
        self.run(&mut issued, Command::StartMapSync).await?;
        Ok(issued)
    }

    /// Asks for the device version; the answer lands in telemetry as `device_version`.
    pub async fn check_firmware_version(&self) -> Result<Vec<Command>, CommandError> {
        let mut issued = Vec::new();
        self.run(&mut issued, Command::GetDeviceVersion).await?;
        self.sync(&mut issued).await?;
        Ok(issued)
    }

    /// Check, download, install. Stops at the first step that fails.
    pub async fn update_firmware(&self) -> Result<Vec<Command>, CommandError> {
        let mut issued = Vec::new();
        for step in [
            Command::CheckFirmwareUpdate,
            Command::DownloadFirmwareUpdate,
            Command::InstallFirmwareUpdate,
        ] {
            if let Err(err) = self.run(&mut issued, step).await {
                warn!(device=%self.session.device().id, done=%issued.len(), error=%err, "firmware update aborted");
                return Err(err);
            }
        }
        info!(device=%self.session.device().id, "firmware update requested");
        Ok(issued)
    }

    pub async fn set_blade_height(&self, height_mm: u8) -> Result<Vec<Command>, CommandError> {
        let mut issued = Vec::new();
        self.run(&mut issued, Command::SetBladeHeight { height_mm })
            .await?;
        Ok(issued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandLimits, SessionConfig};
    use crate::session::Device;
    use crate::testing::{ScriptHandle, ScriptedTransport, SendScript};
    use crate::transport::TransportKind;
    use serde_json::json;

    async fn controller_in(state: serde_json::Value) -> (MowerController, ScriptHandle) {
        let (transport, script) = ScriptedTransport::new();
        let device = Device {
            id: "Luba-VS0001".into(),
            name: "front".into(),
            product_key: None,
            ble_address: None,
            preference: TransportKind::Mqtt,
        };
        let session = Session::spawn(
            device,
            vec![Box::new(transport)],
            SessionConfig::default(),
            CommandLimits::default(),
        );
        session.connect().await.expect("connect");
        let mut telemetry = session.telemetry();
        script.emit(state);
        telemetry.changed().await.expect("snapshot");
        (MowerController::new(session), script)
    }

    fn names(commands: &[Command]) -> Vec<&'static str> {
        commands.iter().map(Command::name).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn start_from_ready_plans_route_then_starts_job() {
        let (controller, script) = controller_in(json!({"sys_status": 11, "charge_state": 1})).await;

        let issued = controller.start_mowing(None).await.expect("start");

        assert_eq!(names(&issued), vec!["generate_route", "start_job", "request_iot_sync"]);
        assert_eq!(script.sent_commands(), issued);
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_paused_resumes() {
        let (controller, _script) = controller_in(json!({"sys_status": 19})).await;

        let issued = controller.start_mowing(None).await.expect("start");

        assert_eq!(names(&issued), vec!["resume_task", "request_iot_sync"]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_returning_stops_after_cancel_if_still_returning() {
        let (controller, _script) = controller_in(json!({"sys_status": 14})).await;

        let issued = controller.start_mowing(None).await.expect("start");

        assert_eq!(names(&issued), vec!["cancel_return_to_dock", "request_iot_sync"]);
        assert_eq!(
            controller.session().telemetry().latest().work_mode(),
            Some(WorkMode::Returning)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_working_is_a_no_op() {
        let (controller, script) = controller_in(json!({"sys_status": 13})).await;

        let issued = controller.start_mowing(None).await.expect("start");

        assert!(issued.is_empty());
        assert!(script.sent_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_mode_is_not_ready() {
        let (controller, _script) = controller_in(json!({"battery_percent": 90})).await;

        assert_eq!(controller.pause().await, Err(CommandError::DeviceNotReady));
    }

    #[tokio::test(start_paused = true)]
    async fn dock_while_working_pauses_then_returns() {
        let (controller, _script) = controller_in(json!({"sys_status": 13, "charge_state": 0})).await;

        let issued = controller.dock().await.expect("dock");

        assert_eq!(names(&issued), vec!["pause_task", "return_to_dock", "request_iot_sync"]);
    }

    #[tokio::test(start_paused = true)]
    async fn dock_while_charging_does_nothing() {
        let (controller, _script) = controller_in(json!({"sys_status": 11, "charge_state": 1})).await;

        assert!(controller.dock().await.expect("dock").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn nudge_defaults_speed() {
        let (controller, script) = controller_in(json!({"sys_status": 11})).await;

        controller
            .nudge(NudgeDirection::Left, None)
            .await
            .expect("nudge");

        assert_eq!(
            script.sent_commands(),
            vec![Command::Nudge(Nudge::new(NudgeDirection::Left))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn firmware_update_runs_steps_in_order() {
        let (controller, script) = controller_in(json!({"sys_status": 15})).await;

        let issued = controller.update_firmware().await.expect("update");

        assert_eq!(
            names(&issued),
            vec!["check_firmware_update", "download_firmware_update", "install_firmware_update"]
        );
        assert_eq!(script.sent_commands(), issued);
    }

    #[tokio::test(start_paused = true)]
    async fn firmware_update_stops_at_first_failed_step() {
        // Arrange
        let (controller, script) = controller_in(json!({"sys_status": 15})).await;
        script.push(SendScript::Ack);
        script.push(SendScript::AckCode(5));

        // Act
        let result = controller.update_firmware().await;

        // Assert
        assert_eq!(result, Err(CommandError::Rejected { code: 5, message: None }));
        assert_eq!(
            names(&script.sent_commands()),
            vec!["check_firmware_update", "download_firmware_update"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn map_sync_and_version_check_issue_queries() {
        let (controller, script) = controller_in(json!({"sys_status": 11})).await;

        let maps = controller.sync_maps().await.expect("maps");
        let version = controller.check_firmware_version().await.expect("version");

        assert_eq!(names(&maps), vec!["start_map_sync"]);
        assert_eq!(names(&version), vec!["get_device_version", "request_iot_sync"]);
        assert_eq!(script.sent_commands().len(), 3);
    }
}
