use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::command::{Ack, Command};
use crate::stream::{CameraIndex, CredentialSource, RelayChannel, StreamCredentials, StreamError};
use crate::transport::{
    AckRegistry, AckWaiter, LinkInfo, OutboundFrame, TelemetrySink, Transport, TransportError,
    TransportKind,
};

#[derive(Debug, Clone)]
pub enum SendScript {
    Ack,
    AckCode(i32),
    AckAfter(Duration),
    NoAck,
    Fail(TransportError),
}

#[derive(Default)]
struct ScriptState {
    connects: VecDeque<Result<(), TransportError>>,
    sends: VecDeque<SendScript>,
    heartbeats: VecDeque<Result<(), TransportError>>,
    sent: Vec<(Uuid, Command)>,
    connect_calls: u32,
    max_pending_at_send: usize,
    connected: bool,
    sink: Option<TelemetrySink>,
}

pub struct ScriptedTransport {
    kind: TransportKind,
    state: Arc<Mutex<ScriptState>>,
    acks: AckRegistry,
}

#[derive(Clone)]
pub struct ScriptHandle {
    state: Arc<Mutex<ScriptState>>,
    acks: AckRegistry,
}

impl ScriptedTransport {
    pub fn new() -> (Self, ScriptHandle) {
        Self::with_kind(TransportKind::Mqtt)
    }

    pub fn with_kind(kind: TransportKind) -> (Self, ScriptHandle) {
        let state = Arc::new(Mutex::new(ScriptState::default()));
        let acks = AckRegistry::new();
        let handle = ScriptHandle {
            state: state.clone(),
            acks: acks.clone(),
        };
        (Self { kind, state, acks }, handle)
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().expect("script state")
    }
}

impl ScriptHandle {
    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().expect("script state")
    }

    pub fn push(&self, step: SendScript) {
        self.state().sends.push_back(step);
    }

    pub fn push_connect(&self, result: Result<(), TransportError>) {
        self.state().connects.push_back(result);
    }

    pub fn push_heartbeat(&self, result: Result<(), TransportError>) {
        self.state().heartbeats.push_back(result);
    }

    pub fn sent_ids(&self) -> Vec<Uuid> {
        self.state().sent.iter().map(|(id, _)| *id).collect()
    }

    pub fn sent_commands(&self) -> Vec<Command> {
        self.state().sent.iter().map(|(_, cmd)| cmd.clone()).collect()
    }

    pub fn connect_calls(&self) -> u32 {
        self.state().connect_calls
    }

    /// Largest number of unacknowledged commands seen when a new one went out.
    pub fn max_pending_at_send(&self) -> usize {
        self.state().max_pending_at_send
    }

    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    pub fn emit(&self, values: serde_json::Value) {
        let values: BTreeMap<String, serde_json::Value> = values
            .as_object()
            .expect("telemetry object")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let sink = self.state().sink.clone();
        sink.expect("subscribed").push(values);
    }
}

fn ack(id: Uuid, code: i32) -> Ack {
    Ack {
        id,
        code,
        message: None,
        received_at: Utc::now(),
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn connect(&mut self) -> Result<LinkInfo, TransportError> {
        let mut state = self.state();
        state.connect_calls += 1;
        state.connects.pop_front().unwrap_or(Ok(()))?;
        state.connected = true;
        Ok(LinkInfo {
            kind: self.kind,
            endpoint: format!("scripted-{}", self.kind),
            connected_at: Utc::now(),
        })
    }

    async fn send(&mut self, frame: &OutboundFrame) -> Result<AckWaiter, TransportError> {
        let step = {
            let mut state = self.state();
            let step = state.sends.pop_front().unwrap_or(SendScript::Ack);
            if let SendScript::Fail(err) = step {
                return Err(err);
            }
            let pending = self.acks.len();
            state.max_pending_at_send = state.max_pending_at_send.max(pending);
            state.sent.push((frame.id, frame.command.clone()));
            step
        };

        let waiter = match step {
            SendScript::Ack => AckWaiter::ready(ack(frame.id, 0)),
            SendScript::AckCode(code) => AckWaiter::ready(ack(frame.id, code)),
            SendScript::AckAfter(delay) => {
                let waiter = self.acks.register(frame.id);
                let acks = self.acks.clone();
                let id = frame.id;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    acks.resolve(ack(id, 0));
                });
                waiter
            }
            SendScript::NoAck | SendScript::Fail(_) => self.acks.register(frame.id),
        };
        Ok(waiter)
    }

    fn subscribe(&mut self, sink: TelemetrySink) {
        self.state().sink = Some(sink);
    }

    async fn heartbeat(&mut self) -> Result<(), TransportError> {
        self.state().heartbeats.pop_front().unwrap_or(Ok(()))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.state().connected = false;
        self.acks.fail_all();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }
}

#[derive(Clone)]
pub struct ScriptedCredentials {
    state: Arc<Mutex<CredentialState>>,
}

struct CredentialState {
    fetches: u32,
    ttl: chrono::Duration,
    failures: VecDeque<TransportError>,
}

impl ScriptedCredentials {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CredentialState {
                fetches: 0,
                ttl,
                failures: VecDeque::new(),
            })),
        }
    }

    pub fn fail_next(&self, err: TransportError) {
        self.state.lock().expect("credential state").failures.push_back(err);
    }

    pub fn fetches(&self) -> u32 {
        self.state.lock().expect("credential state").fetches
    }
}

#[async_trait]
impl CredentialSource for ScriptedCredentials {
    async fn fetch(&self, _device_id: &str) -> Result<StreamCredentials, TransportError> {
        let mut state = self.state.lock().expect("credential state");
        state.fetches += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        Ok(StreamCredentials {
            app_id: "app".to_string(),
            channel_name: "luba-channel".to_string(),
            token: format!("token-{}", state.fetches),
            uid: 1001,
            expires_at: Utc::now() + state.ttl,
        })
    }
}

#[derive(Default)]
struct RelayState {
    published: Vec<CameraIndex>,
    join_failures: u32,
    joins: u32,
    renewed: Vec<String>,
    subscribed: Vec<CameraIndex>,
    subscribe_failures: u32,
    hang_subscribes: bool,
    leaves: u32,
    left: bool,
}

pub struct ScriptedRelay {
    state: Arc<Mutex<RelayState>>,
}

#[derive(Clone)]
pub struct RelayHandle {
    state: Arc<Mutex<RelayState>>,
}

impl ScriptedRelay {
    pub fn new(published: Vec<CameraIndex>) -> (Self, RelayHandle) {
        let state = Arc::new(Mutex::new(RelayState {
            published,
            ..RelayState::default()
        }));
        (
            Self {
                state: state.clone(),
            },
            RelayHandle { state },
        )
    }
}

impl RelayHandle {
    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().expect("relay state")
    }

    pub fn fail_joins(&self, count: u32) {
        self.state().join_failures = count;
    }

    pub fn joins(&self) -> u32 {
        self.state().joins
    }

    pub fn renewed(&self) -> Vec<String> {
        self.state().renewed.clone()
    }

    pub fn subscribed(&self) -> Vec<CameraIndex> {
        self.state().subscribed.clone()
    }

    pub fn left(&self) -> bool {
        self.state().left
    }

    pub fn fail_subscribes(&self, count: u32) {
        self.state().subscribe_failures = count;
    }

    pub fn hang_subscribes(&self) {
        self.state().hang_subscribes = true;
    }

    pub fn leaves(&self) -> u32 {
        self.state().leaves
    }
}

#[async_trait]
impl RelayChannel for ScriptedRelay {
    async fn join(&mut self, _credentials: &StreamCredentials) -> Result<Vec<CameraIndex>, StreamError> {
        let mut state = self.state.lock().expect("relay state");
        state.joins += 1;
        if state.join_failures > 0 {
            state.join_failures -= 1;
            return Err(StreamError::Join("relay refused".to_string()));
        }
        state.left = false;
        Ok(state.published.clone())
    }

    async fn subscribe(&mut self, camera: CameraIndex) -> Result<(), StreamError> {
        let hang = {
            let mut state = self.state.lock().expect("relay state");
            if state.subscribe_failures > 0 {
                state.subscribe_failures -= 1;
                return Err(StreamError::Join("track refused".to_string()));
            }
            state.hang_subscribes
        };
        if hang {
            std::future::pending::<()>().await;
        }
        self.state.lock().expect("relay state").subscribed.push(camera);
        Ok(())
    }

    async fn renew_token(&mut self, token: &str) -> Result<(), StreamError> {
        self.state.lock().expect("relay state").renewed.push(token.to_string());
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), StreamError> {
        let mut state = self.state.lock().expect("relay state");
        state.left = true;
        state.leaves += 1;
        Ok(())
    }
}
