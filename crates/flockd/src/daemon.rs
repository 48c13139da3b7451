//! Process wiring: builds every Flock subsystem of one node and registers
//! the long-running ones with the service registry.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flock_actions::{ANY_ISOLATE, ActionExecutor, ActionQueue, DomainEvent, RuleEngine};
use flock_bus::{Audience, Bus, LocalBus, Member, Message, listen, subjects};
use flock_core::{Action, Composition, FlockConfig, NodeDistribution};
use flock_lifecycle::LifecycleTracker;
use flock_liveness::{
    Forker, HeartbeatPayload, IsolateMonitor, LocalForker, LostIsolateWatch, MonitorCallback,
    MonitorEvent, PeerDirectory, Pinger, WatchConfig, spawn_heartbeat,
};
use flock_placement::{
    ConfiguredNodeCriterion, FactoryRepository, FactoryResolver, GroupingCriterion,
    HistoryNodeCriterion, NodeComposer, NodeDistributor, PlacementStores, TopComposer,
};
use flock_state::{HistoryStore, StateStore};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::catalog::{FactoryAnnouncement, FactoryCatalog};
use crate::node::{LaunchConfig, NodeAgent, TIMER_ACTION};
use crate::services::{FnService, Service, ServiceRegistry};

/// Feeds domain events through the rules into the action queue.
#[derive(Clone)]
pub struct EventSink {
    rules: Arc<RuleEngine>,
    queue: Arc<ActionQueue>,
}

impl EventSink {
    pub fn new(rules: Arc<RuleEngine>, queue: Arc<ActionQueue>) -> Self {
        Self { rules, queue }
    }

    /// Returns the number of actions queued.
    pub fn submit(&self, event: &DomainEvent) -> usize {
        let actions = self.rules.evaluate(event);
        let count = actions.len();
        match self.queue.push_all(actions) {
            Ok(()) => count,
            Err(e) => {
                warn!(event = event.name(), error = %e, "actions dropped");
                0
            }
        }
    }
}

/// Default rules plus the periodic tick.
pub fn node_rules() -> RuleEngine {
    let mut rules = RuleEngine::with_default_rules();
    rules.register(
        "timer",
        Arc::new(|event: &DomainEvent| match event {
            DomainEvent::Timer { tick } => {
                let payload = serde_json::json!({ "tick": tick });
                vec![Action::new(ANY_ISOLATE, TIMER_ACTION, payload)]
            }
            _ => Vec::new(),
        }),
    );
    rules
}

/// Consumer of the action queue; stopping wakes it through the sentinel.
struct ActionService {
    queue: Arc<ActionQueue>,
    executor: Arc<ActionExecutor>,
}

impl Service for ActionService {
    fn name(&self) -> &str {
        "actions"
    }

    fn start(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let handle = Arc::clone(&self.queue).spawn(Arc::clone(&self.executor), shutdown)?;
        Ok(vec![handle])
    }

    fn stopping(&self) {
        self.queue.stop();
    }
}

pub struct Daemon {
    config: FlockConfig,
    bus: LocalBus,
    tracker: Arc<LifecycleTracker>,
    catalog: Arc<FactoryCatalog>,
    monitor: Arc<IsolateMonitor>,
    agent: Arc<NodeAgent>,
    sink: EventSink,
    queue: Arc<ActionQueue>,
    peers: Arc<PeerDirectory>,
    registry: ServiceRegistry,
}

impl Daemon {
    /// Daemon with an on-disk store under the configured data directory
    /// and a forker spawning local processes.
    pub fn open(config: FlockConfig) -> anyhow::Result<Self> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)?;
        let db_path = data_dir.join("flock.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");

        let pinger = Pinger::system(config.ping_timeout());
        let forker = Arc::new(LocalForker::new(&config.node_name(), pinger));
        Self::build(config, store, forker)
    }

    pub fn build(
        config: FlockConfig,
        store: StateStore,
        forker: Arc<dyn Forker>,
    ) -> anyhow::Result<Self> {
        let node = config.node_name();
        let bus = LocalBus::new(&node, 1024);
        let tracker = Arc::new(LifecycleTracker::new()?);

        let top_history: Arc<HistoryStore<NodeDistribution>> = Arc::new(HistoryStore::new());
        let criteria: Vec<Arc<dyn GroupingCriterion>> = vec![
            Arc::new(ConfiguredNodeCriterion),
            Arc::new(HistoryNodeCriterion::new(Arc::clone(&top_history))),
        ];
        let top = Arc::new(TopComposer::new(
            store.clone(),
            NodeDistributor::new(criteria, &config.default_node()),
            top_history,
        ));

        let catalog = Arc::new(FactoryCatalog::new());
        let composer = Arc::new(NodeComposer::new(
            &node,
            store.clone(),
            FactoryResolver::new(vec![Arc::clone(&catalog) as Arc<dyn FactoryRepository>]),
            PlacementStores::new(config.default_rating()),
            &config.placement(),
            config.history_retention(),
        ));

        let rules = Arc::new(node_rules());
        let queue = Arc::new(ActionQueue::new(config.action_poll_timeout()));
        let sink = EventSink::new(rules, Arc::clone(&queue));

        let monitor = Arc::new(
            IsolateMonitor::new(Arc::clone(&forker), Arc::clone(&tracker))
                .with_callback(monitor_callback(&node, sink.clone())),
        );

        let launch = LaunchConfig {
            commands: ["boot", "osgi", "pelix"]
                .into_iter()
                .map(|kind| (kind.to_string(), config.isolate_command(kind)))
                .filter(|(_, command)| !command.is_empty())
                .collect(),
            liveness_base_port: config.liveness_base_port(),
        };
        let agent = Arc::new(NodeAgent::new(
            top,
            composer,
            Arc::clone(&monitor),
            store,
            Arc::new(bus.clone()),
            launch,
        ));

        let peers = Arc::new(PeerDirectory::new());
        let mut daemon = Self {
            config,
            bus,
            tracker,
            catalog,
            monitor,
            agent,
            sink,
            queue,
            peers,
            registry: ServiceRegistry::default(),
        };
        daemon.register_services(forker);
        Ok(daemon)
    }

    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    pub fn tracker(&self) -> &Arc<LifecycleTracker> {
        &self.tracker
    }

    pub fn agent(&self) -> &Arc<NodeAgent> {
        &self.agent
    }

    pub fn catalog(&self) -> &Arc<FactoryCatalog> {
        &self.catalog
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.queue
    }

    pub fn peers(&self) -> &Arc<PeerDirectory> {
        &self.peers
    }

    pub fn services(&self) -> Vec<&str> {
        self.registry.names()
    }

    pub fn submit(&self, event: &DomainEvent) -> usize {
        self.sink.submit(event)
    }

    /// Start every service, then deploy the boot composition if configured.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        info!(
            node = %self.config.node_name(),
            services = ?self.registry.names(),
            "flock daemon starting"
        );
        self.registry.start_all().await?;
        if let Some(path) = self.config.composition_file() {
            let composition = load_composition(&path)?;
            let uid = self.agent.deploy(&composition).await?;
            info!(%uid, composition = composition.name(), "boot composition deployed");
        }
        Ok(())
    }

    /// Refuse new isolates, stop the services in reverse, then the isolates.
    pub async fn stop(&mut self) {
        info!("flock daemon stopping");
        if let Err(e) = self.bus.publish(subjects::PLATFORM_STOPPING, Value::Null, Audience::All) {
            debug!(error = %e, "nobody heard the platform stop");
        }
        self.monitor.platform_stopping();
        self.registry.stop_all().await;

        for (uid, _) in self.tracker.live() {
            if let Err(e) = self.monitor.stop_isolate(&uid).await {
                debug!(%uid, error = %e, "isolate not stopped");
            }
        }
        info!(pending = self.queue.pending(), "flock daemon stopped");
    }

    fn register_services(&mut self, forker: Arc<dyn Forker>) {
        let node = self.config.node_name();
        let bus: Arc<dyn Bus> = Arc::new(self.bus.clone());

        let monitor = Arc::clone(&self.monitor);
        let monitor_bus = Arc::clone(&bus);
        let monitor_member = Member::new(&format!("{node}-monitor"), &[Audience::Monitors]);
        self.registry.register(Arc::new(FnService::new("monitor", move |shutdown| {
            Ok(vec![Arc::clone(&monitor).spawn_listener(
                monitor_bus.as_ref(),
                monitor_member.clone(),
                shutdown,
            )])
        })));

        let catalog = Arc::clone(&self.catalog);
        let sink = self.sink.clone();
        let factory_bus = Arc::clone(&bus);
        let factory_member = Member::new(&format!("{node}-factories"), &[Audience::Monitors]);
        self.registry.register(Arc::new(FnService::new("factories", move |shutdown| {
            let subscription = factory_bus.subscribe("flock/factory/*", factory_member.clone());
            let catalog = Arc::clone(&catalog);
            let sink = sink.clone();
            Ok(vec![listen(subscription, shutdown, move |message| {
                on_factory_message(&catalog, &sink, &message)
            })])
        })));

        self.registry.register(Arc::new(ActionService {
            queue: Arc::clone(&self.queue),
            executor: Arc::new(self.agent.executor()),
        }));

        let peers = Arc::clone(&self.peers);
        let heartbeat_bus = Arc::clone(&bus);
        let payload = HeartbeatPayload {
            peer: node.clone(),
            node: node.clone(),
            endpoint: self.config.heartbeat_endpoint(),
        };
        let interval = self.config.heartbeat_interval();
        let peers_member = Member::new(&format!("{node}-peers"), &[Audience::Monitors]);
        self.registry.register(Arc::new(FnService::new("heartbeat", move |shutdown| {
            Ok(vec![
                Arc::clone(&peers).spawn_listener(
                    heartbeat_bus.as_ref(),
                    peers_member.clone(),
                    shutdown.clone(),
                ),
                spawn_heartbeat(Arc::clone(&heartbeat_bus), payload.clone(), interval, shutdown),
            ])
        })));

        let watch = Arc::new(LostIsolateWatch::new(
            forker,
            Arc::clone(&self.tracker),
            Arc::clone(&bus),
            WatchConfig {
                poll_interval: self.config.poll_interval(),
                ping_timeout: self.config.ping_timeout(),
                confirm_threshold: self.config.confirm_threshold(),
            },
        ));
        self.registry.register(Arc::new(FnService::new("watch", move |shutdown| {
            Ok(vec![Arc::clone(&watch).spawn(shutdown)])
        })));

        let sink = self.sink.clone();
        let period = self.config.poll_interval();
        self.registry.register(Arc::new(FnService::new("timer", move |shutdown| {
            Ok(vec![spawn_timer(sink.clone(), period, shutdown)])
        })));
    }
}

fn monitor_callback(node: &str, sink: EventSink) -> MonitorCallback {
    let node = node.to_string();
    Arc::new(move |event| {
        let event = match event {
            MonitorEvent::Ready(signal) => DomainEvent::AgentReady {
                isolate: signal.uid,
                node: signal.node.unwrap_or_else(|| node.clone()),
            },
            MonitorEvent::Lost(signal) => DomainEvent::AgentLost {
                isolate: signal.uid,
                node: signal.node.unwrap_or_else(|| node.clone()),
            },
            MonitorEvent::Stopped(signal) => {
                debug!(uid = %signal.uid, "isolate stopped");
                return;
            }
        };
        sink.submit(&event);
    })
}

fn on_factory_message(catalog: &FactoryCatalog, sink: &EventSink, message: &Message) {
    let parsed = serde_json::from_value::<FactoryAnnouncement>(message.payload.clone());
    let announcement = match parsed {
        Ok(announcement) => announcement,
        Err(e) => {
            warn!(
                subject = %message.subject,
                sender = %message.sender,
                error = %e,
                "malformed factory signal"
            );
            return;
        }
    };
    let event = match message.subject.as_str() {
        subjects::FACTORY_REGISTERED => {
            catalog.register(&announcement);
            DomainEvent::FactoryRegistered {
                factory: announcement.factory,
                language: announcement.language,
            }
        }
        subjects::FACTORY_UNREGISTERED => {
            catalog.unregister(&announcement.factory, &announcement.language);
            DomainEvent::FactoryUnregistered {
                factory: announcement.factory,
                language: announcement.language,
            }
        }
        _ => return,
    };
    sink.submit(&event);
}

fn spawn_timer(
    sink: EventSink,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = 0u64;
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tick += 1;
                    sink.submit(&DomainEvent::Timer { tick });
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Read a JSON composition file.
pub fn load_composition(path: &Path) -> anyhow::Result<Composition> {
    let content = std::fs::read_to_string(path)?;
    let parsed: Composition = serde_json::from_str(&content)?;
    Ok(Composition::new(parsed.name(), parsed.components().to_vec())?)
}
