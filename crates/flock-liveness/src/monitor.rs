//! Isolate monitor: starts and stops isolates through a forker and feeds
//! lifecycle signals into the lifecycle tracker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use flock_bus::{Bus, Member, Message, listen, subjects};
use flock_core::{IsolateDescriptor, StartCode};
use flock_lifecycle::{IsolateEvent, IsolateState, LifecycleTracker};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{LivenessError, LivenessResult};
use crate::forker::Forker;
use crate::signals::IsolateSignal;

/// What the monitor reports to the rest of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Ready(IsolateSignal),
    /// Gone without announcing it.
    Lost(IsolateSignal),
    /// Gone after a stop request or a stopping signal.
    Stopped(IsolateSignal),
}

pub type MonitorCallback = Arc<dyn Fn(MonitorEvent) + Send + Sync>;

pub struct IsolateMonitor {
    forker: Arc<dyn Forker>,
    tracker: Arc<LifecycleTracker>,
    accepting: AtomicBool,
    callback: Option<MonitorCallback>,
}

impl IsolateMonitor {
    pub fn new(forker: Arc<dyn Forker>, tracker: Arc<LifecycleTracker>) -> Self {
        Self {
            forker,
            tracker,
            accepting: AtomicBool::new(true),
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: MonitorCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn tracker(&self) -> &Arc<LifecycleTracker> {
        &self.tracker
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Refuse every further start request.
    pub fn platform_stopping(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("platform stopping, no more isolates will be started");
        }
    }

    /// Ask the forker for an isolate, tracking the request.
    pub async fn start_isolate(&self, descriptor: &IsolateDescriptor) -> LivenessResult<StartCode> {
        let uid = &descriptor.uid;
        if !self.is_accepting() {
            return Err(LivenessError::PlatformStopping(uid.clone()));
        }
        self.tracker.handle(uid, IsolateEvent::Requested);
        let code = self.forker.start_isolate(descriptor).await;
        if code.is_success() {
            self.tracker.handle(uid, IsolateEvent::Starting);
            info!(%uid, name = %descriptor.name, ?code, "isolate starting");
        } else {
            self.tracker.handle(uid, IsolateEvent::Gone);
            warn!(
                %uid,
                name = %descriptor.name,
                ?code,
                code_value = code.code(),
                "isolate start failed"
            );
        }
        Ok(code)
    }

    /// Stop an isolate. The record ends GONE even when the forker fails;
    /// the forker error is still returned.
    pub async fn stop_isolate(&self, uid: &str) -> LivenessResult<()> {
        self.tracker.handle(uid, IsolateEvent::Stopping);
        let stopped = self.forker.stop_isolate(uid).await;
        if let Err(e) = &stopped {
            warn!(%uid, error = %e, "forker failed to stop isolate, record closed anyway");
        }
        self.tracker.handle(uid, IsolateEvent::Gone);
        self.notify(MonitorEvent::Stopped(IsolateSignal::new(uid)));
        stopped
    }

    /// Apply one bus signal.
    pub fn handle_message(&self, message: &Message) {
        if message.subject == subjects::PLATFORM_STOPPING {
            self.platform_stopping();
            return;
        }
        let event = match message.subject.as_str() {
            subjects::ISOLATE_READY => IsolateEvent::Ready,
            subjects::ISOLATE_STOPPING => IsolateEvent::Stopping,
            subjects::ISOLATE_LOST => IsolateEvent::Gone,
            _ => return,
        };
        let signal = match serde_json::from_value::<IsolateSignal>(message.payload.clone()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(
                    subject = %message.subject,
                    sender = %message.sender,
                    error = %e,
                    "malformed isolate signal"
                );
                return;
            }
        };

        let previous = self.tracker.state(&signal.uid);
        let Some(step) = self.tracker.handle(&signal.uid, event) else {
            debug!(uid = %signal.uid, %event, "signal for untracked isolate");
            return;
        };
        match event {
            IsolateEvent::Ready if !step.is_undefined() => self.notify(MonitorEvent::Ready(signal)),
            IsolateEvent::Gone if previous == Some(IsolateState::Stopping) => {
                info!(uid = %signal.uid, "isolate stopped cleanly");
                self.notify(MonitorEvent::Stopped(signal));
            }
            IsolateEvent::Gone if previous.is_some_and(|s| s != IsolateState::Gone) => {
                warn!(uid = %signal.uid, ?previous, "isolate lost");
                self.notify(MonitorEvent::Lost(signal));
            }
            _ => {}
        }
    }

    /// Consume lifecycle and platform signals addressed to `member`.
    pub fn spawn_listener(
        self: Arc<Self>,
        bus: &dyn Bus,
        member: Member,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let subscription = bus.subscribe("flock/*", member);
        listen(subscription, shutdown, move |message| self.handle_message(&message))
    }

    fn notify(&self, event: MonitorEvent) {
        if let Some(callback) = &self.callback {
            callback(event);
        }
    }
}
