use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::command::{Ack, Command, CommandEnvelope};

use super::{AckRegistry, TelemetrySink, TransportError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub command: Command,
}

impl OutboundFrame {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|err| TransportError::Protocol(err.to_string()))
    }
}

impl From<&CommandEnvelope> for OutboundFrame {
    fn from(envelope: &CommandEnvelope) -> Self {
        Self {
            id: envelope.id,
            ts: envelope.issued_at,
            command: envelope.command.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Ack {
        id: Uuid,
        #[serde(default)]
        code: i32,
        #[serde(default)]
        message: Option<String>,
    },
    Telemetry {
        values: BTreeMap<String, serde_json::Value>,
    },
    Heartbeat,
}

impl InboundFrame {
    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(bytes).map_err(|err| TransportError::Protocol(err.to_string()))
    }
}

/// Routes one inbound payload to the ack registry or the telemetry sink.
pub fn route_inbound(
    bytes: &[u8],
    acks: &AckRegistry,
    sink: Option<&TelemetrySink>,
) -> Result<(), TransportError> {
    match InboundFrame::decode(bytes)? {
        InboundFrame::Ack { id, code, message } => {
            acks.resolve(Ack {
                id,
                code,
                message,
                received_at: Utc::now(),
            });
        }
        InboundFrame::Telemetry { values } => match sink {
            Some(sink) => sink.push(values),
            None => debug!("telemetry frame without subscriber"),
        },
        InboundFrame::Heartbeat => {}
    }
    Ok(())
}
