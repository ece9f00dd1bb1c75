use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::command::Ack;

use super::{
    AckWaiter, LinkInfo, OutboundFrame, TelemetrySink, Transport, TransportError, TransportKind,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    #[serde(default)]
    pub msg: Option<String>,
    pub data: Option<T>,
}

/// HTTP client for the vendor cloud API
#[derive(Debug, Clone)]
pub struct CloudClient {
    client: Client,
    base_url: String,
    token: String,
}

impl CloudClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(map_reqwest)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(map_reqwest)?;

        Self::unwrap_response(response).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, TransportError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .json(body)
            .send()
            .await
            .map_err(map_reqwest)?;

        Self::unwrap_response(response).await
    }

    async fn unwrap_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("HTTP request failed: {} - {}", status, body);
            return Err(map_status(status, body));
        }

        let envelope: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        if envelope.code != 0 {
            return Err(TransportError::Unavailable(format!(
                "api code {}: {}",
                envelope.code,
                envelope.msg.unwrap_or_default()
            )));
        }
        envelope
            .data
            .ok_or_else(|| TransportError::Protocol("response without data".to_string()))
    }
}

fn map_status(status: StatusCode, body: String) -> TransportError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TransportError::AuthenticationRejected(format!("{status}: {body}"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => TransportError::Timeout,
        _ => TransportError::Unavailable(format!("{status}: {body}")),
    }
}

fn map_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if let Some(status) = err.status() {
        map_status(status, err.to_string())
    } else {
        TransportError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct DeviceStatusBody {
    online: bool,
}

#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

pub struct CloudRestTransport {
    api: CloudClient,
    device_id: String,
    poll_interval: Duration,
    connected: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
    sink: Option<TelemetrySink>,
}

impl CloudRestTransport {
    pub fn new(api: CloudClient, device_id: &str) -> Self {
        Self {
            api,
            device_id: device_id.to_string(),
            poll_interval: Duration::from_secs(30),
            connected: Arc::new(AtomicBool::new(false)),
            poller: None,
            sink: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn status_path(&self) -> String {
        format!("/device-server/v1/device/{}/status", self.device_id)
    }

    fn command_path(&self) -> String {
        format!("/device-server/v1/device/{}/command", self.device_id)
    }

    fn properties_path(device_id: &str) -> String {
        format!("/device-server/v1/device/{device_id}/properties")
    }

    fn spawn_poller(&mut self) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let api = self.api.clone();
        let connected = self.connected.clone();
        let device_id = self.device_id.clone();
        let every = self.poll_interval;

        self.poller = Some(tokio::spawn(async move {
            let path = Self::properties_path(&device_id);
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match api.get::<BTreeMap<String, serde_json::Value>>(&path).await {
                    Ok(values) => sink.push(values),
                    Err(TransportError::AuthenticationRejected(reason)) => {
                        warn!(%device_id, %reason, "cloud session rejected, stopping poll");
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                    Err(err) => warn!(%device_id, error=%err, "telemetry poll failed"),
                }
            }
        }));
    }
}

#[async_trait]
impl Transport for CloudRestTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::CloudRest
    }

    async fn connect(&mut self) -> Result<LinkInfo, TransportError> {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }

        let status: DeviceStatusBody = self.api.get(&self.status_path()).await?;
        if !status.online {
            self.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::Unavailable(format!(
                "device {} is offline",
                self.device_id
            )));
        }

        self.connected.store(true, Ordering::SeqCst);
        self.spawn_poller();

        Ok(LinkInfo {
            kind: TransportKind::CloudRest,
            endpoint: self.api.base_url().to_string(),
            connected_at: Utc::now(),
        })
    }

    async fn send(&mut self, frame: &OutboundFrame) -> Result<AckWaiter, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("cloud session not established".to_string()));
        }

        let reply: CommandReply = self.api.post(&self.command_path(), frame).await?;
        Ok(AckWaiter::ready(Ack {
            id: frame.id,
            code: reply.code,
            message: reply.message,
            received_at: Utc::now(),
        }))
    }

    fn subscribe(&mut self, sink: TelemetrySink) {
        self.sink = Some(sink.for_source(TransportKind::CloudRest));
    }

    async fn heartbeat(&mut self) -> Result<(), TransportError> {
        let status: DeviceStatusBody = self.api.get(&self.status_path()).await?;
        if status.online {
            Ok(())
        } else {
            Err(TransportError::Unavailable("device offline".to_string()))
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for CloudRestTransport {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_are_fatal() {
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, String::new()),
            TransportError::AuthenticationRejected(_)
        ));
        assert!(matches!(
            map_status(StatusCode::FORBIDDEN, String::new()),
            TransportError::AuthenticationRejected(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, String::new()),
            TransportError::Unavailable(_)
        ));
        assert_eq!(
            map_status(StatusCode::GATEWAY_TIMEOUT, String::new()),
            TransportError::Timeout
        );
    }

    #[test]
    fn api_envelope_parses_data() {
        let body = r#"{"code":0,"msg":"ok","data":{"online":true}}"#;

        let parsed: ApiResponse<DeviceStatusBody> = serde_json::from_str(body).expect("parse");

        assert_eq!(parsed.code, 0);
        assert!(parsed.data.expect("data").online);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let api = CloudClient::new("https://api.example.test/", "t", Duration::from_secs(5))
            .expect("client");

        assert_eq!(api.base_url(), "https://api.example.test");
    }

    #[tokio::test]
    async fn send_without_session_is_unavailable() {
        let api = CloudClient::new("http://127.0.0.1:9", "t", Duration::from_secs(1))
            .expect("client");
        let mut transport = CloudRestTransport::new(api, "Luba-1");
        let frame = OutboundFrame::from(&crate::command::CommandEnvelope::new(
            crate::command::Command::CancelJob,
        ));

        assert!(matches!(
            transport.send(&frame).await,
            Err(TransportError::Unavailable(_))
        ));
    }
}
