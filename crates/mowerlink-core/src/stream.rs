use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::transport::cloud::CloudClient;
use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("credential request failed: {0}")]
    Credentials(TransportError),
    #[error("relay join failed: {0}")]
    Join(String),
    #[error("relay operation timed out")]
    Timeout,
    #[error("stream degraded, rejoin attempt {attempt} in progress")]
    Degraded { attempt: u32 },
    #[error("stream unavailable")]
    Unavailable,
    #[error("camera {0} is not published")]
    CameraNotPublished(CameraIndex),
    #[error("video not started")]
    NotStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraIndex {
    Rear = 0,
    Left = 1,
    Right = 2,
}

impl CameraIndex {
    pub fn index(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CameraIndex {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CameraIndex::Rear),
            1 => Ok(CameraIndex::Left),
            2 => Ok(CameraIndex::Right),
            other => Err(other),
        }
    }
}

impl fmt::Display for CameraIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CameraIndex::Rear => "rear",
            CameraIndex::Left => "left",
            CameraIndex::Right => "right",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCredentials {
    pub app_id: String,
    pub channel_name: String,
    pub token: String,
    pub uid: u32,
    pub expires_at: DateTime<Utc>,
}

impl StreamCredentials {
    pub fn is_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        let skew = chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::zero());
        now + skew >= self.expires_at
    }

    pub fn bundle(&self) -> TokenBundle {
        TokenBundle {
            app_id: self.app_id.clone(),
            channel_name: self.channel_name.clone(),
            token: self.token.clone(),
            uid: self.uid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBundle {
    #[serde(rename = "appid")]
    pub app_id: String,
    #[serde(rename = "channelName")]
    pub channel_name: String,
    pub token: String,
    pub uid: u32,
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, device_id: &str) -> Result<StreamCredentials, TransportError>;
}

#[derive(Debug, Deserialize)]
struct SubscriptionBody {
    appid: String,
    #[serde(rename = "channelName")]
    channel_name: String,
    token: String,
    uid: u32,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionRequest<'a> {
    device_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct CloudCredentialSource {
    api: CloudClient,
    default_ttl: Duration,
}

impl CloudCredentialSource {
    pub fn new(api: CloudClient, default_ttl: Duration) -> Self {
        Self { api, default_ttl }
    }
}

#[async_trait]
impl CredentialSource for CloudCredentialSource {
    async fn fetch(&self, device_id: &str) -> Result<StreamCredentials, TransportError> {
        let body: SubscriptionBody = self
            .api
            .post(
                "/device-server/v1/stream/subscription",
                &SubscriptionRequest { device_id },
            )
            .await?;
        Ok(subscription_to_credentials(body, self.default_ttl, Utc::now()))
    }
}

fn subscription_to_credentials(
    body: SubscriptionBody,
    default_ttl: Duration,
    now: DateTime<Utc>,
) -> StreamCredentials {
    let ttl = body
        .expires_in
        .map(Duration::from_secs)
        .unwrap_or(default_ttl);
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
    StreamCredentials {
        app_id: body.appid,
        channel_name: body.channel_name,
        token: body.token,
        uid: body.uid,
        expires_at: now + ttl,
    }
}

/// Caches relay credentials for one device and never hands out expired ones.
pub struct CredentialCache<S> {
    source: S,
    device_id: String,
    fetch_timeout: Duration,
    expiry_skew: Duration,
    cached: Option<StreamCredentials>,
}

impl<S: CredentialSource> CredentialCache<S> {
    pub fn new(source: S, device_id: impl Into<String>, config: &StreamConfig) -> Self {
        Self {
            source,
            device_id: device_id.into(),
            fetch_timeout: config.fetch_timeout,
            expiry_skew: config.expiry_skew,
            cached: None,
        }
    }

    pub fn seed(&mut self, credentials: StreamCredentials) {
        self.cached = Some(credentials);
    }

    pub fn cached(&self) -> Option<&StreamCredentials> {
        self.cached.as_ref()
    }

    pub fn clear(&mut self) {
        self.cached = None;
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.cached
            .as_ref()
            .map(|c| c.is_expired(now, self.expiry_skew))
            .unwrap_or(true)
    }

    pub async fn refresh(&mut self) -> Result<StreamCredentials, StreamError> {
        let fetched = timeout(self.fetch_timeout, self.source.fetch(&self.device_id))
            .await
            .map_err(|_| StreamError::Timeout)?
            .map_err(StreamError::Credentials)?;
        info!(device=%self.device_id, channel=%fetched.channel_name, expires_at=%fetched.expires_at, "stream credentials refreshed");
        self.cached = Some(fetched.clone());
        Ok(fetched)
    }

    pub async fn current(&mut self) -> Result<StreamCredentials, StreamError> {
        match self.cached.as_ref() {
            Some(creds) if !creds.is_expired(Utc::now(), self.expiry_skew) => Ok(creds.clone()),
            _ => self.refresh().await,
        }
    }
}

/// Media relay SDK seam, supplied by the host.
#[async_trait]
pub trait RelayChannel: Send {
    /// Joins the channel and returns the camera tracks currently published.
    async fn join(&mut self, credentials: &StreamCredentials) -> Result<Vec<CameraIndex>, StreamError>;
    async fn subscribe(&mut self, camera: CameraIndex) -> Result<(), StreamError>;
    async fn renew_token(&mut self, token: &str) -> Result<(), StreamError>;
    async fn leave(&mut self) -> Result<(), StreamError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    TokenWillExpire,
    TokenExpired,
    Disconnected { reason: String },
    TrackPublished(CameraIndex),
    TrackUnpublished(CameraIndex),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StreamStatus {
    Idle,
    Starting,
    Live { camera: Option<CameraIndex> },
    Degraded { attempt: u32 },
    Unavailable,
    Stopped,
}

pub struct StreamSession<S, R> {
    credentials: CredentialCache<S>,
    relay: R,
    config: StreamConfig,
    subscribed: BTreeSet<CameraIndex>,
    active: Option<CameraIndex>,
    joined: bool,
    status_tx: watch::Sender<StreamStatus>,
}

impl<S: CredentialSource, R: RelayChannel> StreamSession<S, R> {
    pub fn new(credentials: CredentialCache<S>, relay: R, config: StreamConfig) -> Self {
        let (status_tx, _) = watch::channel(StreamStatus::Idle);
        Self {
            credentials,
            relay,
            config,
            subscribed: BTreeSet::new(),
            active: None,
            joined: false,
            status_tx,
        }
    }

    pub fn status(&self) -> StreamStatus {
        *self.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<StreamStatus> {
        self.status_tx.subscribe()
    }

    pub fn active_camera(&self) -> Option<CameraIndex> {
        self.active
    }

    pub fn subscribed(&self) -> Vec<CameraIndex> {
        self.subscribed.iter().copied().collect()
    }

    pub fn credentials(&self) -> &CredentialCache<S> {
        &self.credentials
    }

    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        self.credentials.cached().map(|c| c.expires_at)
    }

    fn set_status(&self, status: StreamStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            debug!(?previous, ?status, "stream status changed");
        }
    }

    fn set_live(&self) {
        self.set_status(StreamStatus::Live {
            camera: self.active,
        });
    }

    pub async fn start_video(&mut self) -> Result<TokenBundle, StreamError> {
        self.set_status(StreamStatus::Starting);
        let credentials = match self.credentials.current().await {
            Ok(credentials) => credentials,
            Err(err) => {
                self.set_status(StreamStatus::Stopped);
                return Err(err);
            }
        };
        if let Err(err) = self.join(&credentials, None).await {
            warn!(error=%err, "video start failed");
            self.set_status(StreamStatus::Stopped);
            return Err(err);
        }
        info!(channel=%credentials.channel_name, cameras=?self.subscribed, "video started");
        self.set_live();
        Ok(credentials.bundle())
    }

    pub async fn refresh_stream(&mut self) -> Result<TokenBundle, StreamError> {
        let credentials = self.credentials.refresh().await?;
        if self.joined {
            bounded(self.config.join_timeout, self.relay.renew_token(&credentials.token)).await?;
        }
        Ok(credentials.bundle())
    }

    pub async fn get_tokens(&mut self) -> Result<TokenBundle, StreamError> {
        Ok(self.credentials.current().await?.bundle())
    }

    pub async fn stop_video(&mut self) -> Result<(), StreamError> {
        if self.joined {
            self.leave_relay().await;
        }
        self.joined = false;
        self.subscribed.clear();
        self.active = None;
        self.set_status(StreamStatus::Stopped);
        info!("video stopped");
        Ok(())
    }

    /// Switches between already-subscribed tracks without touching credentials.
    pub fn switch_camera(&mut self, camera: CameraIndex) -> Result<(), StreamError> {
        if !self.joined {
            return Err(StreamError::NotStarted);
        }
        if !self.subscribed.contains(&camera) {
            return Err(StreamError::CameraNotPublished(camera));
        }
        self.active = Some(camera);
        self.set_live();
        Ok(())
    }

    pub async fn handle_event(&mut self, event: RelayEvent) -> Result<(), StreamError> {
        match event {
            RelayEvent::TokenWillExpire => {
                self.refresh_stream().await?;
                Ok(())
            }
            RelayEvent::TokenExpired => {
                info!("stream token expired");
                self.rejoin().await
            }
            RelayEvent::Disconnected { reason } => {
                warn!(%reason, "relay disconnected");
                self.rejoin().await
            }
            RelayEvent::TrackPublished(camera) => {
                if !self.joined {
                    return Ok(());
                }
                bounded(self.config.join_timeout, self.relay.subscribe(camera)).await?;
                self.subscribed.insert(camera);
                if self.active.is_none() {
                    self.active = Some(camera);
                }
                self.set_live();
                Ok(())
            }
            RelayEvent::TrackUnpublished(camera) => {
                self.subscribed.remove(&camera);
                if self.active == Some(camera) {
                    self.active = self.subscribed.iter().next().copied();
                    debug!(lost=%camera, fallback=?self.active, "active camera unpublished");
                }
                if self.joined {
                    self.set_live();
                }
                Ok(())
            }
        }
    }

    async fn join(
        &mut self,
        credentials: &StreamCredentials,
        keep: Option<CameraIndex>,
    ) -> Result<(), StreamError> {
        let limit = self.config.join_timeout;
        let published = bounded(limit, self.relay.join(credentials)).await?;

        self.subscribed.clear();
        for camera in published {
            if let Err(err) = bounded(limit, self.relay.subscribe(camera)).await {
                warn!(%camera, error=%err, "track subscribe failed, leaving channel");
                self.subscribed.clear();
                self.leave_relay().await;
                return Err(err);
            }
            self.subscribed.insert(camera);
        }
        self.active = keep
            .filter(|camera| self.subscribed.contains(camera))
            .or_else(|| self.subscribed.iter().next().copied());
        self.joined = true;
        Ok(())
    }

    async fn leave_relay(&mut self) {
        if let Err(err) = bounded(self.config.join_timeout, self.relay.leave()).await {
            warn!(error=%err, "relay leave failed");
        }
    }

    async fn rejoin(&mut self) -> Result<(), StreamError> {
        match self.status() {
            StreamStatus::Idle | StreamStatus::Stopped => return Err(StreamError::NotStarted),
            StreamStatus::Unavailable => return Err(StreamError::Unavailable),
            _ => {}
        }

        let keep = self.active;
        self.joined = false;
        for attempt in 1..=self.config.max_rejoin_attempts {
            self.set_status(StreamStatus::Degraded { attempt });
            if attempt > 1 {
                sleep(self.config.rejoin_backoff.saturating_mul(attempt - 1)).await;
            }

            let result = match self.credentials.refresh().await {
                Ok(credentials) => self.join(&credentials, keep).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    info!(attempt, camera=?self.active, "relay rejoined");
                    self.set_live();
                    return Ok(());
                }
                Err(err) => warn!(attempt, error=%err, "relay rejoin failed"),
            }
        }

        self.subscribed.clear();
        self.active = None;
        self.set_status(StreamStatus::Unavailable);
        warn!(attempts=%self.config.max_rejoin_attempts, "stream unavailable, giving up");
        Err(StreamError::Unavailable)
    }
}

async fn bounded<T, F>(limit: Duration, op: F) -> Result<T, StreamError>
where
    F: std::future::Future<Output = Result<T, StreamError>>,
{
    timeout(limit, op).await.map_err(|_| StreamError::Timeout)?
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod stream_tests;
