//! Heartbeat sender and the directory of peers heard from.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use flock_bus::{Audience, Bus, BusError, Member, Message, listen, subjects};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::signals::HeartbeatPayload;

/// Broadcast `payload` to the monitors every `interval` until shutdown.
pub fn spawn_heartbeat(
    bus: Arc<dyn Bus>,
    payload: HeartbeatPayload,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(peer = %payload.peer, endpoint = %payload.endpoint, ?interval, "heartbeat started");
        let value = serde_json::to_value(&payload).unwrap_or_default();
        loop {
            match bus.publish(subjects::HEARTBEAT, value.clone(), Audience::Monitors) {
                Ok(delivered) => debug!(delivered, "heartbeat sent"),
                Err(BusError::Unreachable { .. }) => debug!("heartbeat sent, nobody listening"),
                Err(e) => warn!(error = %e, "heartbeat failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    debug!(peer = %payload.peer, "heartbeat stopping");
                    break;
                }
            }
        }
    })
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub payload: HeartbeatPayload,
    pub last_seen: Instant,
}

/// Last heartbeat of every peer. Staleness is judged by the reader.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: Mutex<HashMap<String, PeerRecord>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, payload: HeartbeatPayload) {
        let mut peers = self.lock();
        if !peers.contains_key(&payload.peer) {
            info!(peer = %payload.peer, node = %payload.node, "new peer");
        }
        peers.insert(
            payload.peer.clone(),
            PeerRecord {
                payload,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn get(&self, peer: &str) -> Option<PeerRecord> {
        self.lock().get(peer).cloned()
    }

    /// Peers heard from within `max_age`, sorted by name.
    pub fn alive(&self, max_age: Duration) -> Vec<HeartbeatPayload> {
        let mut alive: Vec<HeartbeatPayload> = self
            .lock()
            .values()
            .filter(|r| r.last_seen.elapsed() <= max_age)
            .map(|r| r.payload.clone())
            .collect();
        alive.sort_by(|a, b| a.peer.cmp(&b.peer));
        alive
    }

    /// Feed the directory from heartbeats received as `member`.
    pub fn spawn_listener(
        self: Arc<Self>,
        bus: &dyn Bus,
        member: Member,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let subscription = bus.subscribe(subjects::HEARTBEAT, member);
        listen(subscription, shutdown, move |message: Message| {
            match serde_json::from_value::<HeartbeatPayload>(message.payload) {
                Ok(payload) => self.record(payload),
                Err(e) => warn!(sender = %message.sender, error = %e, "malformed heartbeat"),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PeerRecord>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_bus::LocalBus;

    fn payload(peer: &str) -> HeartbeatPayload {
        HeartbeatPayload {
            peer: peer.to_string(),
            node: "n1".to_string(),
            endpoint: "127.0.0.1:9000".to_string(),
        }
    }

    #[tokio::test]
    async fn heartbeats_reach_monitors() {
        let bus = LocalBus::new("forker-1", 16);
        let directory = Arc::new(PeerDirectory::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listener = Arc::clone(&directory).spawn_listener(
            &bus.as_peer("monitor"),
            Member::new("monitor", &[Audience::Monitors]),
            shutdown_rx.clone(),
        );
        let sender = spawn_heartbeat(
            Arc::new(bus.clone()),
            payload("forker-1"),
            Duration::from_millis(10),
            shutdown_rx,
        );

        for _ in 0..100 {
            if directory.get("forker-1").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(directory.alive(Duration::from_secs(5)), vec![payload("forker-1")]);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), sender).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(1), listener).await.unwrap().unwrap();
    }

    #[test]
    fn latest_heartbeat_wins() {
        let directory = PeerDirectory::new();
        directory.record(payload("b"));
        directory.record(payload("a"));
        let mut moved = payload("a");
        moved.endpoint = "127.0.0.1:9001".to_string();
        directory.record(moved.clone());

        let alive = directory.alive(Duration::from_secs(60));
        assert_eq!(alive.len(), 2);
        assert_eq!(alive[0], moved);
        assert_eq!(alive[1].peer, "b");
    }
}
