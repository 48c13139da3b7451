//! Wire-level types of the forker control surface.
//!
//! The forker is the process that actually spawns, stops and pings isolate
//! processes. Codes are part of the remote contract and must not change.

use serde::{Deserialize, Serialize};

use crate::types::{Bundle, IsolateUid};

/// Tri-state answer to a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PingResult {
    /// The process exists and answered the liveness check in time.
    Alive,
    /// The process does not exist (or the uid is unknown).
    Dead,
    /// The process exists but the check timed out.
    Stuck,
}

impl PingResult {
    pub fn code(self) -> i32 {
        match self {
            PingResult::Alive => 0,
            PingResult::Dead => 1,
            PingResult::Stuck => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(PingResult::Alive),
            1 => Some(PingResult::Dead),
            2 => Some(PingResult::Stuck),
            _ => None,
        }
    }
}

/// Result code of a `start_isolate` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartCode {
    Success,
    AlreadyRunning,
    NoProcessRef,
    NoWatcher,
    RunnerException,
    UnknownKind,
    Timeout,
    NoResult,
    Error,
    NoMatchingForker,
}

impl StartCode {
    pub fn code(self) -> i32 {
        match self {
            StartCode::Success => 0,
            StartCode::AlreadyRunning => 1,
            StartCode::NoProcessRef => 2,
            StartCode::NoWatcher => 3,
            StartCode::RunnerException => 4,
            StartCode::UnknownKind => 5,
            StartCode::Timeout => -1,
            StartCode::NoResult => -2,
            StartCode::Error => -3,
            StartCode::NoMatchingForker => -20,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let all = [
            StartCode::Success,
            StartCode::AlreadyRunning,
            StartCode::NoProcessRef,
            StartCode::NoWatcher,
            StartCode::RunnerException,
            StartCode::UnknownKind,
            StartCode::Timeout,
            StartCode::NoResult,
            StartCode::Error,
            StartCode::NoMatchingForker,
        ];
        all.into_iter().find(|c| c.code() == code)
    }

    /// Codes after which the isolate is considered on its way up.
    pub fn is_success(self) -> bool {
        matches!(self, StartCode::Success | StartCode::AlreadyRunning)
    }
}

/// Everything a forker needs to boot an isolate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolateDescriptor {
    pub uid: IsolateUid,
    pub name: String,
    /// Runtime kind ("pelix", "osgi", "boot").
    pub kind: String,
    pub language: Option<String>,
    pub node: String,
    /// Program and arguments to run.
    #[serde(default)]
    pub command: Vec<String>,
    /// Address (`host:port`) answering liveness checks.
    #[serde(default)]
    pub liveness_endpoint: Option<String>,
    #[serde(default)]
    pub bundles: Vec<Bundle>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_codes_round_trip() {
        for code in [0, 1, 2, 3, 4, 5, -1, -2, -3, -20] {
            assert_eq!(StartCode::from_code(code).map(StartCode::code), Some(code));
        }
        assert_eq!(StartCode::from_code(42), None);
    }

    #[test]
    fn ping_codes() {
        assert_eq!(PingResult::Alive.code(), 0);
        assert_eq!(PingResult::Dead.code(), 1);
        assert_eq!(PingResult::Stuck.code(), 2);
        assert_eq!(PingResult::from_code(3), None);
    }

    #[test]
    fn already_running_counts_as_success() {
        assert!(StartCode::AlreadyRunning.is_success());
        assert!(!StartCode::UnknownKind.is_success());
    }
}
