//! Lost-isolate detection.
//!
//! Every poll pings the isolates the tracker knows as STARTING or READY.
//! An isolate is declared lost after `confirm_threshold` consecutive
//! DEAD/STUCK verdicts; a STUCK one is killed first so that it can be
//! respawned cleanly. The verdict goes out as an `isolate-lost` signal.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use flock_bus::Bus;
use flock_core::PingResult;
use flock_lifecycle::{IsolateState, LifecycleTracker};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::forker::Forker;
use crate::signals::{IsolateSignal, send_lost};

#[derive(Debug, Clone, Copy)]
pub struct WatchConfig {
    pub poll_interval: Duration,
    /// Upper bound on one forker ping; exceeding it counts as STUCK.
    pub ping_timeout: Duration,
    pub confirm_threshold: u32,
}

#[derive(Default)]
struct Strikes {
    counts: HashMap<String, u32>,
    reported: HashSet<String>,
}

pub struct LostIsolateWatch {
    forker: Arc<dyn Forker>,
    tracker: Arc<LifecycleTracker>,
    bus: Arc<dyn Bus>,
    config: WatchConfig,
    strikes: Mutex<Strikes>,
}

impl LostIsolateWatch {
    pub fn new(
        forker: Arc<dyn Forker>,
        tracker: Arc<LifecycleTracker>,
        bus: Arc<dyn Bus>,
        config: WatchConfig,
    ) -> Self {
        Self {
            forker,
            tracker,
            bus,
            config: WatchConfig {
                confirm_threshold: config.confirm_threshold.max(1),
                ..config
            },
            strikes: Mutex::new(Strikes::default()),
        }
    }

    /// One pass over the watched isolates. Returns the uids declared lost.
    pub async fn poll_once(&self) -> Vec<String> {
        let watched: Vec<String> = self
            .tracker
            .live()
            .into_iter()
            .filter(|(_, state)| matches!(state, IsolateState::Starting | IsolateState::Ready))
            .map(|(uid, _)| uid)
            .collect();
        self.forget_untracked(&watched);

        let mut lost = Vec::new();
        for uid in watched {
            if self.lock().reported.contains(&uid) {
                continue;
            }
            let ping = tokio::time::timeout(self.config.ping_timeout, self.forker.ping(&uid));
            let verdict = match ping.await {
                Ok(verdict) => verdict,
                Err(_) => {
                    debug!(%uid, "ping timed out");
                    PingResult::Stuck
                }
            };
            if verdict == PingResult::Alive {
                self.lock().counts.remove(&uid);
                continue;
            }

            let strikes = {
                let mut state = self.lock();
                let count = state.counts.entry(uid.clone()).or_insert(0);
                *count += 1;
                *count
            };
            debug!(
                %uid,
                ?verdict,
                strikes,
                threshold = self.config.confirm_threshold,
                "isolate not alive"
            );
            if strikes < self.config.confirm_threshold {
                continue;
            }

            if verdict == PingResult::Stuck {
                info!(%uid, "killing stuck isolate");
                if let Err(e) = self.forker.stop_isolate(&uid).await {
                    warn!(%uid, error = %e, "failed to kill stuck isolate");
                }
            }
            {
                let mut state = self.lock();
                state.counts.remove(&uid);
                state.reported.insert(uid.clone());
            }
            match send_lost(self.bus.as_ref(), &IsolateSignal::new(&uid)) {
                Ok(_) => warn!(%uid, ?verdict, "isolate declared lost"),
                Err(e) => error!(%uid, error = %e, "failed to publish isolate loss"),
            }
            lost.push(uid);
        }
        lost
    }

    /// Poll every `poll_interval` until shutdown. A poll in progress is
    /// abandoned as soon as shutdown is signalled.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?self.config.poll_interval, "lost-isolate watch started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
                tokio::select! {
                    _ = self.poll_once() => {}
                    _ = shutdown.changed() => {
                        debug!("poll abandoned");
                        break;
                    }
                }
            }
            debug!("lost-isolate watch shutting down");
        })
    }

    fn forget_untracked(&self, watched: &[String]) {
        let mut state = self.lock();
        state.counts.retain(|uid, _| watched.contains(uid));
        state.reported.retain(|uid| watched.contains(uid));
    }

    fn lock(&self) -> MutexGuard<'_, Strikes> {
        self.strikes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LivenessResult;
    use crate::ping::BoxFuture;
    use flock_bus::{Audience, LocalBus, Member, subjects};
    use flock_core::{IsolateDescriptor, StartCode};
    use flock_lifecycle::IsolateEvent;

    #[derive(Default)]
    struct ScriptedForker {
        verdicts: Mutex<HashMap<String, PingResult>>,
        stopped: Mutex<Vec<String>>,
    }

    impl ScriptedForker {
        fn set(&self, uid: &str, verdict: PingResult) {
            self.verdicts.lock().unwrap().insert(uid.to_string(), verdict);
        }
    }

    impl Forker for ScriptedForker {
        fn ping<'a>(&'a self, uid: &'a str) -> BoxFuture<'a, PingResult> {
            let verdict = self
                .verdicts
                .lock()
                .unwrap()
                .get(uid)
                .copied()
                .unwrap_or(PingResult::Dead);
            Box::pin(async move { verdict })
        }

        fn start_isolate<'a>(&'a self, _: &'a IsolateDescriptor) -> BoxFuture<'a, StartCode> {
            Box::pin(async { StartCode::Success })
        }

        fn stop_isolate<'a>(&'a self, uid: &'a str) -> BoxFuture<'a, LivenessResult<()>> {
            self.stopped.lock().unwrap().push(uid.to_string());
            Box::pin(async { Ok(()) })
        }
    }

    fn setup(
        threshold: u32,
    ) -> (Arc<ScriptedForker>, Arc<LifecycleTracker>, LocalBus, LostIsolateWatch) {
        let forker = Arc::new(ScriptedForker::default());
        let tracker = Arc::new(LifecycleTracker::new().unwrap());
        let bus = LocalBus::new("watch", 16);
        let watch = LostIsolateWatch::new(
            Arc::clone(&forker) as Arc<dyn Forker>,
            Arc::clone(&tracker),
            Arc::new(bus.clone()),
            WatchConfig {
                poll_interval: Duration::from_millis(10),
                ping_timeout: Duration::from_millis(100),
                confirm_threshold: threshold,
            },
        );
        (forker, tracker, bus, watch)
    }

    fn ready(tracker: &LifecycleTracker, uid: &str) {
        for event in [IsolateEvent::Requested, IsolateEvent::Starting, IsolateEvent::Ready] {
            tracker.handle(uid, event);
        }
    }

    #[tokio::test]
    async fn loss_needs_confirmation() {
        let (forker, tracker, bus, watch) = setup(2);
        let mut signals =
            bus.subscribe(subjects::ISOLATE_LOST, Member::new("m", &[Audience::Monitors]));
        ready(&tracker, "alive");
        ready(&tracker, "dead");
        forker.set("alive", PingResult::Alive);

        assert!(watch.poll_once().await.is_empty());
        assert_eq!(watch.poll_once().await, vec!["dead".to_string()]);
        // Reported once until the tracker drops it.
        assert!(watch.poll_once().await.is_empty());

        let message = signals.recv().await.unwrap();
        assert_eq!(message.payload["uid"], "dead");
        assert!(forker.stopped.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stuck_isolate_is_killed_first() {
        let (forker, tracker, _bus, watch) = setup(1);
        ready(&tracker, "hung");
        forker.set("hung", PingResult::Stuck);
        assert_eq!(watch.poll_once().await, vec!["hung".to_string()]);
        assert_eq!(*forker.stopped.lock().unwrap(), vec!["hung".to_string()]);
    }

    #[tokio::test]
    async fn recovery_resets_strikes() {
        let (forker, tracker, _bus, watch) = setup(2);
        ready(&tracker, "flaky");
        forker.set("flaky", PingResult::Dead);
        assert!(watch.poll_once().await.is_empty());
        forker.set("flaky", PingResult::Alive);
        assert!(watch.poll_once().await.is_empty());
        forker.set("flaky", PingResult::Dead);
        assert!(watch.poll_once().await.is_empty());
    }

    struct SlowForker;

    impl Forker for SlowForker {
        fn ping<'a>(&'a self, _: &'a str) -> BoxFuture<'a, PingResult> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                PingResult::Alive
            })
        }

        fn start_isolate<'a>(&'a self, _: &'a IsolateDescriptor) -> BoxFuture<'a, StartCode> {
            Box::pin(async { StartCode::Success })
        }

        fn stop_isolate<'a>(&'a self, _: &'a str) -> BoxFuture<'a, LivenessResult<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_running_poll() {
        let tracker = Arc::new(LifecycleTracker::new().unwrap());
        for uid in ["a", "b", "c", "d"] {
            ready(&tracker, uid);
        }
        let lost_watch = Arc::new(LostIsolateWatch::new(
            Arc::new(SlowForker),
            Arc::clone(&tracker),
            Arc::new(LocalBus::new("watch", 16)),
            WatchConfig {
                poll_interval: Duration::from_millis(5),
                ping_timeout: Duration::from_secs(5),
                confirm_threshold: 1,
            },
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Arc::clone(&lost_watch).spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("watch kept polling after shutdown")
            .unwrap();
    }
}
