use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::command::{Ack, Command, CommandEnvelope, CommandError};
use crate::transport::{OutboundFrame, Transport, TransportError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// Nothing reached the device; the command is still pending.
    #[error("not delivered: {0}")]
    NotDelivered(TransportError),
    #[error("no acknowledgment within {0:?}")]
    AckTimeout(Duration),
    #[error("link lost while awaiting acknowledgment: {0}")]
    LinkLost(TransportError),
    #[error("rejected by device: code {code}")]
    Rejected { code: i32, message: Option<String> },
}

impl DispatchError {
    pub fn was_delivered(&self) -> bool {
        !matches!(self, DispatchError::NotDelivered(_))
    }

    pub fn into_command_error(self, envelope: &CommandEnvelope) -> CommandError {
        match self {
            DispatchError::NotDelivered(err) | DispatchError::LinkLost(err) => err.into(),
            DispatchError::AckTimeout(_) => CommandError::CommandTimeout(envelope.id),
            DispatchError::Rejected { code, message } => CommandError::Rejected { code, message },
        }
    }
}

/// Sends one envelope and waits for its acknowledgment.
///
/// Delivery and ack wait are bounded separately by `deliver_timeout` and `ack_timeout`.
pub async fn dispatch(
    transport: &mut dyn Transport,
    envelope: &CommandEnvelope,
    deliver_timeout: Duration,
    ack_timeout: Duration,
) -> Result<Ack, DispatchError> {
    let frame = OutboundFrame::from(envelope);
    let kind = transport.kind();

    let waiter = match timeout(deliver_timeout, transport.send(&frame)).await {
        Ok(Ok(waiter)) => waiter,
        Ok(Err(err)) => return Err(DispatchError::NotDelivered(err)),
        Err(_) => return Err(DispatchError::NotDelivered(TransportError::Timeout)),
    };
    debug!(id=%envelope.id, cmd=%envelope.command.name(), transport=%kind, "command sent");

    match timeout(ack_timeout, waiter.wait()).await {
        Ok(Ok(ack)) if ack.accepted() => Ok(ack),
        Ok(Ok(ack)) => {
            warn!(id=%envelope.id, code=%ack.code, "command rejected by device");
            Err(DispatchError::Rejected {
                code: ack.code,
                message: ack.message,
            })
        }
        Ok(Err(err)) => Err(DispatchError::LinkLost(err)),
        Err(_) => Err(DispatchError::AckTimeout(ack_timeout)),
    }
}

/// Only non-mutating commands may be resent after an unanswered delivery.
pub fn may_resend(command: &Command, attempts: u32, idempotent_retries: u32) -> bool {
    !command.is_mutating() && attempts <= idempotent_retries
}
