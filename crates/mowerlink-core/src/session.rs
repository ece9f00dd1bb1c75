use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::{Ack, Command, CommandEnvelope, CommandError, CommandStatus};
use crate::config::{CommandLimits, SessionConfig};
use crate::dispatch::{dispatch, may_resend, DispatchError};
use crate::link::{Backoff, ConnectionState, LinkAction, LinkEvent, LinkMachine, Transition};
use crate::telemetry::{self, TelemetryReader};
use crate::transport::{LinkInfo, TelemetrySink, Transport, TransportError, TransportKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub product_key: Option<String>,
    pub ble_address: Option<String>,
    pub preference: TransportKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub sent: u64,
    pub acked: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub overflowed: u64,
    pub reconnects: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// Already on the wire; issue a compensating command instead.
    AlreadySent,
    Unknown,
}

#[derive(Debug)]
pub struct CommandTicket {
    id: Uuid,
    rx: oneshot::Receiver<Result<Ack, CommandError>>,
}

impl CommandTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn outcome(self) -> Result<Ack, CommandError> {
        self.rx.await.unwrap_or(Err(CommandError::SessionClosed))
    }
}

const RECENT_OUTCOMES: usize = 64;

struct Queued {
    envelope: CommandEnvelope,
    reply: oneshot::Sender<Result<Ack, CommandError>>,
    attempts: u32,
}

impl Queued {
    fn finish(self, result: Result<Ack, CommandError>) {
        let _ = self.reply.send(result);
    }
}

struct Core {
    link: LinkMachine,
    queue: VecDeque<Queued>,
    in_flight: Option<Uuid>,
    retry_at: Option<Instant>,
    reconnect_pending: bool,
    reconnects_used: u32,
    active: Option<usize>,
    link_info: Option<LinkInfo>,
    stats: SessionStats,
    recent: VecDeque<(Uuid, CommandStatus)>,
}

impl Core {
    fn settle(&mut self, queued: Queued, result: Result<Ack, CommandError>) {
        let status = match &result {
            Ok(_) => CommandStatus::Acked,
            Err(CommandError::CommandTimeout(_)) => CommandStatus::TimedOut,
            Err(CommandError::Cancelled(_)) => CommandStatus::Cancelled,
            Err(_) => CommandStatus::Failed,
        };
        if self.recent.len() >= RECENT_OUTCOMES {
            self.recent.pop_front();
        }
        self.recent.push_back((queued.envelope.id, status));
        queued.finish(result);
    }
}

struct Shared {
    core: Mutex<Core>,
    wake: Notify,
    state_tx: watch::Sender<ConnectionState>,
    config: SessionConfig,
    limits: CommandLimits,
    device: Device,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies a link event and carries out its action. Caller holds the lock.
    fn apply(&self, core: &mut Core, event: LinkEvent) -> Transition {
        let transition = core.link.apply(event);
        if transition.changed() {
            info!(
                device=%self.device.id,
                from=%transition.from,
                to=%transition.to,
                ?event,
                failures=%core.link.consecutive_failures(),
                "connection state changed"
            );
            self.state_tx.send_replace(transition.to);
        }

        match transition.action {
            LinkAction::None => {}
            LinkAction::ScheduleRetry(delay) => {
                debug!(device=%self.device.id, delay_ms=%delay.as_millis(), "retry scheduled");
                core.retry_at = Some(Instant::now() + delay);
            }
            LinkAction::ResumeQueue => {
                core.retry_at = None;
                self.wake.notify_one();
            }
            LinkAction::FailQueued => {
                core.retry_at = None;
                let err = if core.link.auth_rejected() {
                    CommandError::AuthenticationRejected
                } else {
                    CommandError::TransportUnavailable
                };
                let drained: Vec<Queued> = core.queue.drain(..).collect();
                let dropped = drained.len();
                for queued in drained {
                    core.settle(queued, Err(err.clone()));
                }
                core.stats.failed += dropped as u64;
                if dropped > 0 {
                    warn!(device=%self.device.id, dropped, error=%err, "failed queued commands");
                }
            }
        }
        transition
    }

    fn schedule_reconnect(&self, core: &mut Core) {
        if core.link.auth_rejected() || core.reconnects_used >= self.config.reconnect_attempts {
            core.reconnect_pending = false;
            return;
        }
        let delay = core.link.backoff().delay(core.reconnects_used + 1);
        core.reconnect_pending = true;
        core.retry_at = Some(Instant::now() + delay);
        info!(
            device=%self.device.id,
            attempt=%(core.reconnects_used + 1),
            delay_ms=%delay.as_millis(),
            "reconnect scheduled"
        );
    }
}

enum Control {
    Connect(oneshot::Sender<Result<LinkInfo, CommandError>>),
    Disconnect(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// One logical connection to one mower.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    control: mpsc::Sender<Control>,
    telemetry: TelemetryReader,
}

impl Session {
    pub fn spawn(
        device: Device,
        mut transports: Vec<Box<dyn Transport>>,
        config: SessionConfig,
        limits: CommandLimits,
    ) -> Self {
        transports.sort_by_key(|t| t.kind() != device.preference);

        let (writer, reader) = telemetry::cache();
        let (frames_tx, frames_rx) = mpsc::channel(config.telemetry_buffer.max(1));
        let sink = TelemetrySink::new(device.preference, frames_tx);
        for transport in transports.iter_mut() {
            transport.subscribe(sink.for_source(transport.kind()));
        }
        telemetry::spawn_ingestion(writer, frames_rx, sink.backlog());
        drop(sink);

        let link = LinkMachine::new(
            config.failure_threshold,
            Backoff {
                base: config.backoff_base,
                max: config.backoff_max,
            },
        );
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                link,
                queue: VecDeque::new(),
                in_flight: None,
                retry_at: None,
                reconnect_pending: false,
                reconnects_used: 0,
                active: None,
                link_info: None,
                stats: SessionStats::default(),
                recent: VecDeque::new(),
            }),
            wake: Notify::new(),
            state_tx,
            config,
            limits,
            device,
        });

        let (control_tx, control_rx) = mpsc::channel(8);
        let driver = Driver {
            shared: shared.clone(),
            transports,
            control: control_rx,
        };
        tokio::spawn(driver.run());

        Self {
            shared,
            control: control_tx,
            telemetry: reader,
        }
    }

    pub fn device(&self) -> &Device {
        &self.shared.device
    }

    pub fn limits(&self) -> &CommandLimits {
        &self.shared.limits
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn telemetry(&self) -> TelemetryReader {
        self.telemetry.clone()
    }

    pub fn link_info(&self) -> Option<LinkInfo> {
        self.shared.core().link_info.clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.core().stats
    }

    pub fn is_stale(&self) -> bool {
        self.telemetry.is_stale(self.shared.config.stale_after)
    }

    pub fn stale_after(&self) -> Duration {
        self.shared.config.stale_after
    }

    pub fn queued(&self) -> usize {
        self.shared.core().queue.len()
    }

    pub fn status_of(&self, id: Uuid) -> Option<CommandStatus> {
        let core = self.shared.core();
        if core.in_flight == Some(id) {
            return Some(CommandStatus::Sent);
        }
        if core.queue.iter().any(|q| q.envelope.id == id) {
            return Some(CommandStatus::Pending);
        }
        core.recent
            .iter()
            .rev()
            .find(|(recent, _)| *recent == id)
            .map(|(_, status)| *status)
    }

    pub async fn connect(&self) -> Result<LinkInfo, CommandError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Connect(tx))
            .await
            .map_err(|_| CommandError::SessionClosed)?;
        rx.await.unwrap_or(Err(CommandError::SessionClosed))
    }

    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.control.send(Control::Disconnect(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.control.send(Control::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Validates and queues a command. Invalid parameters never reach the queue.
    pub fn submit(&self, command: Command) -> Result<CommandTicket, CommandError> {
        command.validate(&self.shared.limits)?;

        let envelope = CommandEnvelope::new(command);
        let id = envelope.id;
        let (reply, rx) = oneshot::channel();

        let mut core = self.shared.core();
        if core.link.state() == ConnectionState::Disconnected {
            return Err(if core.link.auth_rejected() {
                CommandError::AuthenticationRejected
            } else {
                CommandError::TransportUnavailable
            });
        }

        if core.queue.len() >= self.shared.config.max_queue_depth.max(1) {
            if let Some(oldest) = core.queue.pop_front() {
                warn!(
                    device=%self.shared.device.id,
                    id=%oldest.envelope.id,
                    cmd=%oldest.envelope.command.name(),
                    "queue full, dropping oldest pending command"
                );
                let oldest_id = oldest.envelope.id;
                core.settle(oldest, Err(CommandError::Overflow(oldest_id)));
                core.stats.overflowed += 1;
            }
        }

        debug!(device=%self.shared.device.id, %id, cmd=%envelope.command.name(), "command queued");
        core.queue.push_back(Queued {
            envelope,
            reply,
            attempts: 0,
        });
        drop(core);
        self.shared.wake.notify_one();

        Ok(CommandTicket { id, rx })
    }

    pub async fn execute(&self, command: Command) -> Result<Ack, CommandError> {
        self.submit(command)?.outcome().await
    }

    pub fn cancel(&self, id: Uuid) -> CancelOutcome {
        let mut core = self.shared.core();
        if core.in_flight == Some(id) {
            return CancelOutcome::AlreadySent;
        }
        let Some(pos) = core.queue.iter().position(|q| q.envelope.id == id) else {
            return CancelOutcome::Unknown;
        };
        if let Some(queued) = core.queue.remove(pos) {
            core.settle(queued, Err(CommandError::Cancelled(id)));
        }
        info!(device=%self.shared.device.id, %id, "pending command cancelled");
        CancelOutcome::Cancelled
    }
}

struct Driver {
    shared: Arc<Shared>,
    transports: Vec<Box<dyn Transport>>,
    control: mpsc::Receiver<Control>,
}

impl Driver {
    async fn run(mut self) {
        let mut heartbeat = interval(self.shared.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            let retry_at = self.shared.core().retry_at;
            tokio::select! {
                biased;
                ctrl = self.control.recv() => match ctrl {
                    Some(Control::Connect(reply)) => {
                        let result = self.connect().await;
                        let _ = reply.send(result);
                    }
                    Some(Control::Disconnect(reply)) => {
                        self.disconnect().await;
                        let _ = reply.send(());
                    }
                    Some(Control::Shutdown(reply)) => {
                        self.disconnect().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.disconnect().await;
                        break;
                    }
                },
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry().await;
                }
                _ = heartbeat.tick() => {
                    if self.shared.core().link.state() == ConnectionState::Connected {
                        self.heartbeat().await;
                    }
                }
                _ = self.shared.wake.notified() => {
                    self.drain().await;
                }
            }
        }
        debug!(device=%self.shared.device.id, "session driver stopped");
    }

    async fn connect(&mut self) -> Result<LinkInfo, CommandError> {
        {
            let mut core = self.shared.core();
            match core.link.state() {
                ConnectionState::Connected | ConnectionState::Degraded => {
                    if let Some(info) = core.link_info.clone() {
                        return Ok(info);
                    }
                }
                _ => {}
            }
            core.reconnect_pending = false;
            self.shared.apply(&mut core, LinkEvent::ConnectRequested);
        }

        let connect_timeout = self.shared.config.connect_timeout;
        for idx in 0..self.transports.len() {
            let kind = self.transports[idx].kind();
            let attempt = timeout(connect_timeout, self.transports[idx].connect()).await;
            match attempt {
                Ok(Ok(info)) => {
                    info!(device=%self.shared.device.id, transport=%kind, endpoint=%info.endpoint, "handshake complete");
                    let mut core = self.shared.core();
                    core.active = Some(idx);
                    core.link_info = Some(info.clone());
                    core.reconnects_used = 0;
                    self.shared.apply(&mut core, LinkEvent::HandshakeSucceeded);
                    return Ok(info);
                }
                Ok(Err(TransportError::AuthenticationRejected(reason))) => {
                    warn!(device=%self.shared.device.id, transport=%kind, %reason, "authentication rejected");
                    let mut core = self.shared.core();
                    core.reconnect_pending = false;
                    self.shared.apply(&mut core, LinkEvent::AuthenticationRejected);
                    return Err(CommandError::AuthenticationRejected);
                }
                Ok(Err(err)) => {
                    warn!(device=%self.shared.device.id, transport=%kind, error=%err, "transport unavailable, falling back");
                }
                Err(_) => {
                    warn!(device=%self.shared.device.id, transport=%kind, timeout_ms=%connect_timeout.as_millis(), "handshake timed out, falling back");
                }
            }
        }

        let mut core = self.shared.core();
        core.active = None;
        core.link_info = None;
        self.shared.apply(&mut core, LinkEvent::HandshakeFailed);
        Err(CommandError::TransportUnavailable)
    }

    async fn disconnect(&mut self) {
        let active = {
            let mut core = self.shared.core();
            core.reconnect_pending = false;
            core.reconnects_used = 0;
            core.link_info = None;
            self.shared.apply(&mut core, LinkEvent::DisconnectRequested);
            core.active.take()
        };
        self.close_transport(active).await;
    }

    async fn close_transport(&mut self, active: Option<usize>) {
        let Some(idx) = active else {
            return;
        };
        if let Some(transport) = self.transports.get_mut(idx) {
            if let Err(err) = transport.disconnect().await {
                debug!(device=%self.shared.device.id, error=%err, "transport close failed");
            }
        }
    }

    async fn after_event(&mut self) {
        let dropped = {
            let mut core = self.shared.core();
            if core.link.state() != ConnectionState::Disconnected || core.active.is_none() {
                return;
            }
            core.link_info = None;
            let active = core.active.take();
            self.shared.schedule_reconnect(&mut core);
            active
        };
        self.close_transport(dropped).await;
    }

    async fn drain(&mut self) {
        let next = {
            let mut core = self.shared.core();
            if core.link.state() != ConnectionState::Connected {
                return;
            }
            match core.queue.pop_front() {
                Some(queued) => {
                    core.in_flight = Some(queued.envelope.id);
                    queued
                }
                None => return,
            }
        };
        self.send_one(next).await;

        let more = {
            let core = self.shared.core();
            core.link.state() == ConnectionState::Connected && !core.queue.is_empty()
        };
        if more {
            self.shared.wake.notify_one();
        }
    }

    async fn send_one(&mut self, mut queued: Queued) {
        let active = self.shared.core().active;
        let Some(idx) = active else {
            {
                let mut core = self.shared.core();
                core.in_flight = None;
                core.queue.push_front(queued);
                self.shared.apply(&mut core, LinkEvent::SendFailed);
            }
            self.after_event().await;
            return;
        };

        let command_timeout = self.shared.config.command_timeout;
        queued.attempts += 1;
        let result = dispatch(
            self.transports[idx].as_mut(),
            &queued.envelope,
            command_timeout,
            command_timeout,
        )
        .await;

        {
            let mut core = self.shared.core();
            core.in_flight = None;
            match result {
                Ok(ack) => {
                    core.stats.sent += 1;
                    core.stats.acked += 1;
                    self.shared.apply(&mut core, LinkEvent::SendSucceeded);
                    debug!(id=%ack.id, "command acked");
                    core.settle(queued, Ok(ack));
                }
                Err(DispatchError::NotDelivered(TransportError::AuthenticationRejected(_))) => {
                    core.queue.push_front(queued);
                    self.shared.apply(&mut core, LinkEvent::AuthenticationRejected);
                }
                Err(DispatchError::NotDelivered(err)) => {
                    warn!(id=%queued.envelope.id, error=%err, "command not delivered, holding");
                    queued.attempts -= 1;
                    core.queue.push_front(queued);
                    self.shared.apply(&mut core, LinkEvent::SendFailed);
                }
                Err(err @ DispatchError::AckTimeout(_)) => {
                    core.stats.sent += 1;
                    core.stats.timed_out += 1;
                    self.shared.apply(&mut core, LinkEvent::SendFailed);
                    let retries = self.shared.config.idempotent_retries;
                    if may_resend(&queued.envelope.command, queued.attempts, retries)
                        && core.link.state() != ConnectionState::Disconnected
                    {
                        debug!(id=%queued.envelope.id, attempt=%queued.attempts, "resending idempotent command");
                        core.queue.push_front(queued);
                    } else {
                        warn!(id=%queued.envelope.id, cmd=%queued.envelope.command.name(), "command timed out");
                        let error = err.into_command_error(&queued.envelope);
                        core.settle(queued, Err(error));
                    }
                }
                Err(err @ DispatchError::LinkLost(_)) => {
                    core.stats.sent += 1;
                    core.stats.failed += 1;
                    let error = err.into_command_error(&queued.envelope);
                    core.settle(queued, Err(error));
                    self.shared.apply(&mut core, LinkEvent::HeartbeatMissed);
                }
                Err(err @ DispatchError::Rejected { .. }) => {
                    core.stats.sent += 1;
                    core.stats.failed += 1;
                    self.shared.apply(&mut core, LinkEvent::SendSucceeded);
                    let error = err.into_command_error(&queued.envelope);
                    core.settle(queued, Err(error));
                }
            }
        }
        self.after_event().await;
    }

    async fn heartbeat(&mut self) {
        let Some(idx) = self.shared.core().active else {
            return;
        };
        let result = timeout(
            self.shared.config.heartbeat_timeout,
            self.transports[idx].heartbeat(),
        )
        .await;

        let event = match result {
            Ok(Ok(())) => LinkEvent::HeartbeatSucceeded,
            Ok(Err(TransportError::AuthenticationRejected(_))) => LinkEvent::AuthenticationRejected,
            Ok(Err(err)) => {
                warn!(device=%self.shared.device.id, error=%err, "heartbeat failed");
                LinkEvent::HeartbeatMissed
            }
            Err(_) => {
                warn!(device=%self.shared.device.id, "heartbeat timed out");
                LinkEvent::HeartbeatMissed
            }
        };
        {
            let mut core = self.shared.core();
            self.shared.apply(&mut core, event);
        }
        self.after_event().await;
    }

    async fn retry(&mut self) {
        let (state, head, reconnect) = {
            let mut core = self.shared.core();
            core.retry_at = None;
            let state = core.link.state();
            let head = if state == ConnectionState::Degraded {
                core.queue.pop_front().map(|queued| {
                    core.in_flight = Some(queued.envelope.id);
                    queued
                })
            } else {
                None
            };
            (state, head, core.reconnect_pending)
        };

        match state {
            ConnectionState::Degraded => match head {
                Some(queued) => {
                    debug!(device=%self.shared.device.id, id=%queued.envelope.id, "retrying held command");
                    self.send_one(queued).await;
                }
                None => self.heartbeat().await,
            },
            ConnectionState::Disconnected if reconnect => {
                {
                    let mut core = self.shared.core();
                    core.reconnects_used += 1;
                    core.stats.reconnects += 1;
                }
                if let Err(err) = self.connect().await {
                    let mut core = self.shared.core();
                    if err != CommandError::AuthenticationRejected {
                        self.shared.schedule_reconnect(&mut core);
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod session_tests;
