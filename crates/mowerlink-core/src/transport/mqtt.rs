use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::frame::route_inbound;
use super::{
    AckRegistry, AckWaiter, LinkInfo, OutboundFrame, TelemetrySink, Transport, TransportError,
    TransportKind,
};

/// MQTT broker address
#[derive(Debug, Clone)]
pub struct MqttAddress {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl Default for MqttAddress {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8883,
            use_tls: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttIdentity {
    pub product_key: String,
    pub device_name: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

/// Per-device topic scheme
pub struct Topics;

impl Topics {
    pub fn command(product_key: &str, device_name: &str) -> String {
        format!("/sys/{product_key}/{device_name}/app/down/thing/command")
    }

    pub fn command_reply(product_key: &str, device_name: &str) -> String {
        format!("/sys/{product_key}/{device_name}/app/up/thing/command_reply")
    }

    pub fn properties(product_key: &str, device_name: &str) -> String {
        format!("/sys/{product_key}/{device_name}/app/up/thing/properties")
    }

    pub fn status(product_key: &str, device_name: &str) -> String {
        format!("/sys/{product_key}/{device_name}/app/up/thing/status")
    }

    pub fn is_inbound(topic: &str) -> bool {
        topic.ends_with("/command_reply") || topic.ends_with("/properties") || topic.ends_with("/status")
    }
}

pub struct MqttTransport {
    address: MqttAddress,
    identity: MqttIdentity,
    keep_alive: Duration,
    client: Option<AsyncClient>,
    reader: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    acks: AckRegistry,
    sink: Option<TelemetrySink>,
}

impl MqttTransport {
    pub fn new(address: MqttAddress, identity: MqttIdentity) -> Self {
        Self {
            address,
            identity,
            keep_alive: Duration::from_secs(30),
            client: None,
            reader: None,
            connected: Arc::new(AtomicBool::new(false)),
            acks: AckRegistry::new(),
            sink: None,
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    fn options(&self) -> Result<MqttOptions, TransportError> {
        if self.address.host.is_empty() {
            return Err(TransportError::Unavailable(
                "MQTT host is not configured".to_string(),
            ));
        }

        let mut options = MqttOptions::new(
            &self.identity.client_id,
            &self.address.host,
            self.address.port,
        );
        options.set_keep_alive(self.keep_alive);
        options.set_credentials(&self.identity.username, &self.identity.password);

        if self.address.use_tls {
            use rumqttc::{TlsConfiguration, Transport as MqttWire};
            use rustls::ClientConfig;

            let mut root_cert_store = rustls::RootCertStore::empty();
            for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
                let _ = root_cert_store.add(cert);
            }

            let client_config = ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();

            options.set_transport(MqttWire::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(client_config),
            )));
        }

        Ok(options)
    }

    async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return match ack.code {
                        ConnectReturnCode::Success => Ok(()),
                        code => Err(refused(code)),
                    };
                }
                Ok(_) => continue,
                Err(ConnectionError::ConnectionRefused(code)) => return Err(refused(code)),
                Err(err) => return Err(TransportError::Unavailable(err.to_string())),
            }
        }
    }

    fn spawn_reader(&mut self, mut eventloop: EventLoop) {
        let connected = self.connected.clone();
        let acks = self.acks.clone();
        let sink = self.sink.clone();
        let device = self.identity.device_name.clone();

        self.reader = Some(tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if !Topics::is_inbound(&publish.topic) {
                            continue;
                        }
                        debug!(%device, topic=%publish.topic, "mqtt frame");
                        if let Err(err) = route_inbound(&publish.payload, &acks, sink.as_ref()) {
                            warn!(%device, error=%err, "discarding malformed mqtt frame");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%device, error=%err, "mqtt link lost");
                        connected.store(false, Ordering::SeqCst);
                        acks.fail_all();
                        break;
                    }
                }
            }
        }));
    }

    fn teardown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.client = None;
        self.connected.store(false, Ordering::SeqCst);
        self.acks.fail_all();
    }
}

fn refused(code: ConnectReturnCode) -> TransportError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            TransportError::AuthenticationRejected(format!("broker refused: {code:?}"))
        }
        other => TransportError::Unavailable(format!("broker refused: {other:?}")),
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mqtt
    }

    async fn connect(&mut self) -> Result<LinkInfo, TransportError> {
        self.teardown();
        let options = self.options()?;
        let (client, mut eventloop) = AsyncClient::new(options, 32);

        Self::await_connack(&mut eventloop).await?;

        let pk = &self.identity.product_key;
        let dn = &self.identity.device_name;
        for topic in [
            Topics::command_reply(pk, dn),
            Topics::properties(pk, dn),
            Topics::status(pk, dn),
        ] {
            client
                .subscribe(&topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| TransportError::Unavailable(e.to_string()))?;
            debug!("Subscribed to: {}", topic);
        }

        self.client = Some(client);
        self.connected.store(true, Ordering::SeqCst);
        self.spawn_reader(eventloop);
        info!(device=%self.identity.device_name, host=%self.address.host, "MQTT connected");

        Ok(LinkInfo {
            kind: TransportKind::Mqtt,
            endpoint: format!("{}:{}", self.address.host, self.address.port),
            connected_at: Utc::now(),
        })
    }

    async fn send(&mut self, frame: &OutboundFrame) -> Result<AckWaiter, TransportError> {
        let Some(client) = self.client.as_ref() else {
            return Err(TransportError::Unavailable("mqtt not connected".to_string()));
        };
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("mqtt link down".to_string()));
        }

        let payload = frame.encode()?;
        let waiter = self.acks.register(frame.id);
        let topic = Topics::command(&self.identity.product_key, &self.identity.device_name);
        client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        debug!(id=%frame.id, %topic, "published command");
        Ok(waiter)
    }

    fn subscribe(&mut self, sink: TelemetrySink) {
        self.sink = Some(sink.for_source(TransportKind::Mqtt));
    }

    async fn heartbeat(&mut self) -> Result<(), TransportError> {
        if self.client.is_some() && self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unavailable("mqtt link down".to_string()))
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(client) = self.client.as_ref() {
            if let Err(err) = client.disconnect().await {
                debug!(error=%err, "mqtt disconnect request failed");
            }
        }
        self.teardown();
        info!(device=%self.identity.device_name, "MQTT disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
