//! In-process message bus.
//!
//! [`LocalBus`] wraps a [`tokio::sync::broadcast`] channel. Every message
//! carries a subject, a JSON payload, the audience it is addressed to and
//! the name of the sending peer. Subscriptions filter on a subject pattern
//! and on the audience groups their member belongs to.
//!
//! ```text
//!   publish(subject, payload, audience)
//!          │
//!          ▼
//!   broadcast::Sender<Message> ──► Subscription (pattern + Member) ──► recv()
//!                              ──► Subscription ...
//! ```
//!
//! Delivery is at-least-once-ish: receivers that lag skip the oldest
//! messages and log how many were lost. There is no ordering guarantee
//! across subjects.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{BusError, BusResult};

/// Subjects of the signals exchanged by Flock processes.
pub mod subjects {
    /// Periodic reachability broadcast of a managing process.
    pub const HEARTBEAT: &str = "flock/heartbeat";
    /// An isolate finished initializing.
    pub const ISOLATE_READY: &str = "flock/isolate/ready";
    /// An isolate is about to shut down gracefully.
    pub const ISOLATE_STOPPING: &str = "flock/isolate/stopping";
    /// The liveness authority confirmed an isolate is dead or stuck.
    pub const ISOLATE_LOST: &str = "flock/isolate/lost";
    /// The platform is going down; no new isolate may start.
    pub const PLATFORM_STOPPING: &str = "flock/platform/stopping";
    /// Components handed to a ready isolate.
    pub const ISOLATE_INSTANTIATE: &str = "flock/isolate/instantiate";
    pub const FACTORY_REGISTERED: &str = "flock/factory/registered";
    pub const FACTORY_UNREGISTERED: &str = "flock/factory/unregistered";
}

/// Who a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    All,
    Monitors,
    Forkers,
    Isolates,
    Neighbours,
    /// Only the sending peer itself.
    Current,
    /// Everybody except the sending peer.
    Others,
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Audience::All => "all",
            Audience::Monitors => "monitors",
            Audience::Forkers => "forkers",
            Audience::Isolates => "isolates",
            Audience::Neighbours => "neighbours",
            Audience::Current => "current",
            Audience::Others => "others",
        };
        f.write_str(name)
    }
}

/// A signal travelling on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub subject: String,
    pub payload: serde_json::Value,
    pub audience: Audience,
    /// Peer that published the message.
    pub sender: String,
}

/// Identity of a subscriber: its peer name and the groups it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub peer: String,
    pub groups: BTreeSet<Audience>,
}

impl Member {
    pub fn new(peer: &str, groups: &[Audience]) -> Self {
        Self {
            peer: peer.to_string(),
            groups: groups.iter().copied().collect(),
        }
    }

    /// Whether a message sent by `sender` to `audience` reaches this member.
    pub fn accepts(&self, audience: Audience, sender: &str) -> bool {
        match audience {
            Audience::All => true,
            Audience::Current => self.peer == sender,
            Audience::Others => self.peer != sender,
            group => self.groups.contains(&group),
        }
    }
}

/// Match a subject against a pattern. A trailing `*` matches any suffix.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => subject.starts_with(prefix),
        None => pattern == subject,
    }
}

/// Publish/subscribe contract used by every Flock service.
pub trait Bus: Send + Sync {
    /// Name of the local peer; used as the sender of published messages.
    fn peer(&self) -> &str;

    /// Publish a message. Returns the number of subscriptions it was handed to.
    fn publish(
        &self,
        subject: &str,
        payload: serde_json::Value,
        audience: Audience,
    ) -> BusResult<usize>;

    /// Subscribe to subjects matching `pattern`, as `member`.
    fn subscribe(&self, pattern: &str, member: Member) -> Subscription;
}

/// Broadcast-channel bus shared by all services of one process.
#[derive(Clone, Debug)]
pub struct LocalBus {
    peer: Arc<str>,
    tx: broadcast::Sender<Message>,
}

impl LocalBus {
    pub fn new(peer: &str, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            peer: Arc::from(peer),
            tx,
        }
    }

    /// A handle publishing under another peer name, sharing the same channel.
    pub fn as_peer(&self, peer: &str) -> Self {
        Self {
            peer: Arc::from(peer),
            tx: self.tx.clone(),
        }
    }
}

impl Bus for LocalBus {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn publish(
        &self,
        subject: &str,
        payload: serde_json::Value,
        audience: Audience,
    ) -> BusResult<usize> {
        let message = Message {
            subject: subject.to_string(),
            payload,
            audience,
            sender: self.peer.to_string(),
        };
        self.tx.send(message).map_err(|_| BusError::Unreachable {
            subject: subject.to_string(),
            audience: audience.to_string(),
        })
    }

    fn subscribe(&self, pattern: &str, member: Member) -> Subscription {
        Subscription {
            pattern: pattern.to_string(),
            member,
            rx: self.tx.subscribe(),
        }
    }
}

/// Filtered receiving end of a bus.
pub struct Subscription {
    pattern: String,
    member: Member,
    rx: broadcast::Receiver<Message>,
}

impl Subscription {
    /// Next message matching this subscription, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(message) => {
                    if self.wants(&message) {
                        return Some(message);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(pattern = %self.pattern, skipped, "bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn wants(&self, message: &Message) -> bool {
        subject_matches(&self.pattern, &message.subject)
            && self.member.accepts(message.audience, &message.sender)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// Drive `handler` with every message of `subscription` until shutdown.
pub fn listen<F>(
    mut subscription: Subscription,
    mut shutdown: watch::Receiver<bool>,
    handler: F,
) -> JoinHandle<()>
where
    F: Fn(Message) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = subscription.recv() => match message {
                    Some(message) => handler(message),
                    None => break,
                },
                _ = shutdown.changed() => {
                    debug!(pattern = %subscription.pattern, "bus listener shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pattern_matching() {
        assert!(subject_matches("flock/isolate/*", subjects::ISOLATE_READY));
        assert!(subject_matches(subjects::HEARTBEAT, subjects::HEARTBEAT));
        assert!(!subject_matches("flock/isolate/*", subjects::HEARTBEAT));
    }

    #[test]
    fn audience_routing() {
        let monitor = Member::new("node-a", &[Audience::Monitors]);
        assert!(monitor.accepts(Audience::All, "node-b"));
        assert!(monitor.accepts(Audience::Monitors, "node-b"));
        assert!(!monitor.accepts(Audience::Forkers, "node-b"));
        assert!(monitor.accepts(Audience::Current, "node-a"));
        assert!(!monitor.accepts(Audience::Current, "node-b"));
        assert!(!monitor.accepts(Audience::Others, "node-a"));
    }

    #[tokio::test]
    async fn subscription_filters_subject_and_audience() {
        let bus = LocalBus::new("node-a", 16);
        let mut sub = bus.subscribe(
            "flock/isolate/*",
            Member::new("node-a", &[Audience::Monitors]),
        );

        bus.publish(subjects::HEARTBEAT, serde_json::json!({}), Audience::Monitors)
            .unwrap();
        bus.publish(subjects::ISOLATE_READY, serde_json::json!({"uid": "x"}), Audience::Forkers)
            .unwrap();
        bus.publish(subjects::ISOLATE_LOST, serde_json::json!({"uid": "y"}), Audience::Monitors)
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.subject, subjects::ISOLATE_LOST);
        assert_eq!(message.payload["uid"], "y");
        assert_eq!(message.sender, "node-a");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_unreachable() {
        let bus = LocalBus::new("node-a", 4);
        let err = bus
            .publish(subjects::HEARTBEAT, serde_json::Value::Null, Audience::Monitors)
            .unwrap_err();
        assert!(matches!(err, BusError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn listener_stops_on_shutdown() {
        let bus = LocalBus::new("node-a", 16);
        let (tx, rx) = watch::channel(false);
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = listen(
            bus.subscribe("*", Member::new("node-a", &[])),
            rx,
            move |message| {
                let _ = seen_tx.send(message.subject);
            },
        );

        bus.as_peer("node-b")
            .publish("flock/test", serde_json::Value::Null, Audience::All)
            .unwrap();
        assert_eq!(seen_rx.recv().await.unwrap(), "flock/test");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
