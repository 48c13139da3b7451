//! Payloads of the liveness signals carried by the bus.

use flock_bus::{Audience, Bus, BusError, subjects};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LivenessResult;

/// Reachability info broadcast by a managing process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub peer: String,
    pub node: String,
    /// Endpoint the peer listens on.
    pub endpoint: String,
}

/// `isolate-ready`, `isolate-stopping` and `isolate-lost` all carry this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolateSignal {
    pub uid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

impl IsolateSignal {
    pub fn new(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            name: None,
            node: None,
        }
    }
}

fn publish(bus: &dyn Bus, subject: &str, signal: &IsolateSignal) -> LivenessResult<usize> {
    let payload = serde_json::to_value(signal).unwrap_or_default();
    match bus.publish(subject, payload, Audience::Monitors) {
        Ok(delivered) => Ok(delivered),
        Err(BusError::Unreachable { .. }) => {
            debug!(subject, uid = %signal.uid, "no monitor listening");
            Ok(0)
        }
        Err(e) => Err(e.into()),
    }
}

/// Sent by an isolate once fully initialized.
pub fn send_ready(bus: &dyn Bus, signal: &IsolateSignal) -> LivenessResult<usize> {
    publish(bus, subjects::ISOLATE_READY, signal)
}

/// Sent by an isolate right before a graceful shutdown.
pub fn send_stopping(bus: &dyn Bus, signal: &IsolateSignal) -> LivenessResult<usize> {
    publish(bus, subjects::ISOLATE_STOPPING, signal)
}

/// Sent by the liveness authority once an isolate is confirmed lost.
pub fn send_lost(bus: &dyn Bus, signal: &IsolateSignal) -> LivenessResult<usize> {
    publish(bus, subjects::ISOLATE_LOST, signal)
}
