//! Forker control surface and the local, process-spawning forker.

use std::collections::HashMap;
use std::process::Stdio;

use flock_core::{IsolateDescriptor, PingResult, StartCode};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{LivenessError, LivenessResult};
use crate::ping::{BoxFuture, Pinger};

/// Starts, stops and pings isolate processes.
pub trait Forker: Send + Sync {
    fn ping<'a>(&'a self, uid: &'a str) -> BoxFuture<'a, PingResult>;

    fn start_isolate<'a>(&'a self, descriptor: &'a IsolateDescriptor) -> BoxFuture<'a, StartCode>;

    fn stop_isolate<'a>(&'a self, uid: &'a str) -> BoxFuture<'a, LivenessResult<()>>;
}

const KNOWN_KINDS: [&str; 3] = ["boot", "osgi", "pelix"];

struct Running {
    child: Child,
    endpoint: Option<String>,
}

/// Forker spawning isolate commands on the local node.
pub struct LocalForker {
    node: String,
    pinger: Pinger,
    running: Mutex<HashMap<String, Running>>,
}

impl LocalForker {
    pub fn new(node: &str, pinger: Pinger) -> Self {
        Self {
            node: node.to_string(),
            pinger,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub async fn running_uids(&self) -> Vec<String> {
        let mut uids: Vec<String> = self.running.lock().await.keys().cloned().collect();
        uids.sort();
        uids
    }

    async fn start(&self, descriptor: &IsolateDescriptor) -> StartCode {
        let uid = &descriptor.uid;
        if descriptor.node != self.node {
            warn!(
                %uid,
                node = %descriptor.node,
                local = %self.node,
                "isolate meant for another node"
            );
            return StartCode::NoMatchingForker;
        }
        if !KNOWN_KINDS.contains(&descriptor.kind.as_str()) {
            warn!(%uid, kind = %descriptor.kind, "unknown isolate kind");
            return StartCode::UnknownKind;
        }

        let mut running = self.running.lock().await;
        if let Some(existing) = running.get_mut(uid) {
            if matches!(existing.child.try_wait(), Ok(None)) {
                debug!(%uid, "isolate already running");
                return StartCode::AlreadyRunning;
            }
            running.remove(uid);
        }

        let Some((program, args)) = descriptor.command.split_first() else {
            warn!(%uid, "isolate descriptor has no command");
            return StartCode::NoProcessRef;
        };
        let spawned = Command::new(program)
            .args(args)
            .env("FLOCK_ISOLATE_UID", uid)
            .env("FLOCK_ISOLATE_NAME", &descriptor.name)
            .env("FLOCK_NODE", &descriptor.node)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Ok(child) => {
                info!(
                    %uid,
                    name = %descriptor.name,
                    pid = ?child.id(),
                    %program,
                    "isolate spawned"
                );
                running.insert(
                    uid.clone(),
                    Running {
                        child,
                        endpoint: descriptor.liveness_endpoint.clone(),
                    },
                );
                StartCode::Success
            }
            Err(e) => {
                let error = LivenessError::Spawn {
                    uid: uid.clone(),
                    reason: e.to_string(),
                };
                warn!(error = %error, "isolate spawn failed");
                StartCode::RunnerException
            }
        }
    }

    async fn ping_uid(&self, uid: &str) -> PingResult {
        let (pid, endpoint) = {
            let mut running = self.running.lock().await;
            let Some(entry) = running.get_mut(uid) else {
                return PingResult::Dead;
            };
            match entry.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%uid, %status, "isolate process exited");
                    return PingResult::Dead;
                }
                Ok(None) => {}
                Err(e) => warn!(%uid, error = %e, "cannot poll isolate process"),
            }
            (entry.child.id(), entry.endpoint.clone())
        };
        self.pinger.ping(pid, endpoint.as_deref()).await
    }

    async fn stop(&self, uid: &str) -> LivenessResult<()> {
        let entry = self.running.lock().await.remove(uid);
        let Some(mut entry) = entry else {
            return Err(LivenessError::UnknownIsolate(uid.to_string()));
        };
        if let Err(e) = entry.child.kill().await {
            debug!(%uid, error = %e, "isolate already exited");
        }
        info!(%uid, "isolate stopped");
        Ok(())
    }
}

impl Forker for LocalForker {
    fn ping<'a>(&'a self, uid: &'a str) -> BoxFuture<'a, PingResult> {
        Box::pin(self.ping_uid(uid))
    }

    fn start_isolate<'a>(&'a self, descriptor: &'a IsolateDescriptor) -> BoxFuture<'a, StartCode> {
        Box::pin(self.start(descriptor))
    }

    fn stop_isolate<'a>(&'a self, uid: &'a str) -> BoxFuture<'a, LivenessResult<()>> {
        Box::pin(self.stop(uid))
    }
}
