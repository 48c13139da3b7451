//! Node agent: turns placement decisions into isolate starts, stops and
//! component hand-overs, and registers the action handlers doing so.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use flock_actions::{ActionError, ActionExecutor, kinds};
use flock_bus::{Audience, Bus, subjects};
use flock_core::{Action, Component, Composition, Isolate, IsolateDescriptor, StartCode};
use flock_lifecycle::IsolateState;
use flock_liveness::IsolateMonitor;
use flock_placement::{NodeComposer, NodePlacement, TopComposer};
use flock_state::StateStore;
use serde_json::json;
use tracing::{debug, error, info, warn};

/// How isolates of this node are booted.
#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    /// Isolate kind → program and arguments.
    pub commands: BTreeMap<String, Vec<String>>,
    pub liveness_base_port: Option<u16>,
}

pub struct NodeAgent {
    node: String,
    top: Arc<TopComposer>,
    composer: Arc<NodeComposer>,
    monitor: Arc<IsolateMonitor>,
    store: StateStore,
    bus: Arc<dyn Bus>,
    launch: LaunchConfig,
    waiting: Mutex<Vec<Component>>,
    boots: AtomicU64,
    next_port: AtomicU16,
}

impl NodeAgent {
    pub fn new(
        top: Arc<TopComposer>,
        composer: Arc<NodeComposer>,
        monitor: Arc<IsolateMonitor>,
        store: StateStore,
        bus: Arc<dyn Bus>,
        launch: LaunchConfig,
    ) -> Self {
        let next_port = launch.liveness_base_port.unwrap_or(0);
        Self {
            node: composer.node().to_string(),
            top,
            composer,
            monitor,
            store,
            bus,
            launch,
            waiting: Mutex::new(Vec::new()),
            boots: AtomicU64::new(0),
            next_port: AtomicU16::new(next_port),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn composer(&self) -> &Arc<NodeComposer> {
        &self.composer
    }

    /// Components waiting for their factory.
    pub fn waiting(&self) -> Vec<String> {
        self.lock_waiting().iter().map(|c| c.name.clone()).collect()
    }

    /// Distribute a composition and place the part meant for this node.
    pub async fn deploy(&self, composition: &Composition) -> anyhow::Result<String> {
        let (uid, distribution) = self.top.instantiate(composition)?;
        for (node, components) in &distribution.nodes {
            if node != &self.node {
                info!(
                    %uid,
                    %node,
                    components = components.len(),
                    "components assigned to another node"
                );
            }
        }
        let local: Vec<Component> = distribution
            .nodes
            .get(&self.node)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        if !local.is_empty() {
            self.place(&local).await?;
        }
        Ok(uid)
    }

    /// Place components on this node, booting new isolates as needed.
    pub async fn place(&self, components: &[Component]) -> anyhow::Result<NodePlacement> {
        let placement = self.composer.instantiate(components)?;
        if !placement.missing.is_empty() {
            let mut waiting = self.lock_waiting();
            for component in components.iter().filter(|c| placement.missing.contains(&c.name)) {
                if !waiting.contains(component) {
                    waiting.push(component.clone());
                }
            }
            info!(
                node = %self.node,
                waiting = waiting.len(),
                "components waiting for their factory"
            );
        }
        for isolate in &placement.updated {
            if self.is_ready(isolate) {
                self.hand_over(isolate);
            }
        }
        for isolate in placement.new.clone() {
            self.boot(isolate).await?;
        }
        Ok(placement)
    }

    /// An isolate announced itself ready: send it its components.
    pub fn on_ready(&self, uid: &str) -> anyhow::Result<()> {
        match self.find(uid)? {
            Some(isolate) => self.hand_over(&isolate),
            None => debug!(%uid, "ready isolate not placed on this node"),
        }
        Ok(())
    }

    /// An isolate crashed or hung: place its components again.
    pub async fn on_lost(&self, uid: &str) -> anyhow::Result<()> {
        let Some(isolate) = self.find(uid)? else {
            debug!(%uid, "lost isolate not placed on this node");
            return Ok(());
        };
        let placement = self.composer.handle_lost(&isolate.name)?;
        for updated in &placement.updated {
            if self.is_ready(updated) {
                self.hand_over(updated);
            }
        }
        for new in placement.new {
            self.boot(new).await?;
        }
        Ok(())
    }

    /// Retry the components whose factory was missing.
    pub async fn instantiate_waiting(&self) -> anyhow::Result<()> {
        let waiting = std::mem::take(&mut *self.lock_waiting());
        if waiting.is_empty() {
            return Ok(());
        }
        debug!(node = %self.node, count = waiting.len(), "retrying waiting components");
        self.place(&waiting).await?;
        Ok(())
    }

    /// A factory went away: remove its components and stop emptied isolates.
    pub async fn components_gone(&self, factory: &str) -> anyhow::Result<()> {
        let isolates = self.composer.isolates()?;
        let names: Vec<String> = isolates
            .iter()
            .flat_map(|i| i.components.iter())
            .filter(|c| c.factory == factory)
            .map(|c| c.name.clone())
            .collect();
        if names.is_empty() {
            return Ok(());
        }
        let emptied = self.composer.kill(&names)?;
        for isolate in isolates.iter().filter(|i| emptied.contains(&i.name)) {
            if let Some(uid) = &isolate.uid {
                if let Err(e) = self.monitor.stop_isolate(uid).await {
                    warn!(
                        %uid,
                        isolate = %isolate.name,
                        error = %e,
                        "failed to stop emptied isolate"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn tick(&self) -> anyhow::Result<()> {
        Ok(self.composer.on_timer()?)
    }

    /// Executor with one handler per action kind the rules produce.
    pub fn executor(self: &Arc<Self>) -> ActionExecutor {
        let mut executor = ActionExecutor::default();

        let agent = Arc::clone(self);
        executor.register(
            kinds::INSTANTIATE,
            flock_actions::handler(move |action: Action| {
                let agent = Arc::clone(&agent);
                async move {
                    agent
                        .on_ready(&action.isolate)
                        .map_err(|e| ActionError::execution(&action, format!("{e:#}")))
                }
            }),
        );

        let agent = Arc::clone(self);
        executor.register(
            kinds::REDISTRIBUTE,
            flock_actions::handler(move |action: Action| {
                let agent = Arc::clone(&agent);
                async move {
                    agent
                        .on_lost(&action.isolate)
                        .await
                        .map_err(|e| ActionError::execution(&action, format!("{e:#}")))
                }
            }),
        );

        let agent = Arc::clone(self);
        executor.register(
            kinds::INSTANTIATE_WAITING,
            flock_actions::handler(move |action: Action| {
                let agent = Arc::clone(&agent);
                async move {
                    agent
                        .instantiate_waiting()
                        .await
                        .map_err(|e| ActionError::execution(&action, format!("{e:#}")))
                }
            }),
        );

        let agent = Arc::clone(self);
        executor.register(
            kinds::COMPONENTS_GONE,
            flock_actions::handler(move |action: Action| {
                let agent = Arc::clone(&agent);
                async move {
                    let factory = action.payload["factory"].as_str().map(str::to_string);
                    let Some(factory) = factory else {
                        return Err(ActionError::execution(&action, "payload has no factory"));
                    };
                    agent
                        .components_gone(&factory)
                        .await
                        .map_err(|e| ActionError::execution(&action, format!("{e:#}")))
                }
            }),
        );

        let agent = Arc::clone(self);
        executor.register(
            TIMER_ACTION,
            flock_actions::handler(move |action: Action| {
                let agent = Arc::clone(&agent);
                async move {
                    agent
                        .tick()
                        .map_err(|e| ActionError::execution(&action, format!("{e:#}")))
                }
            }),
        );

        executor
    }

    async fn boot(&self, mut isolate: Isolate) -> anyhow::Result<()> {
        let boot = self.boots.fetch_add(1, Ordering::SeqCst);
        let uid = isolate
            .uid
            .clone()
            .unwrap_or_else(|| format!("{}-{}-{boot}", self.node, isolate.name));
        isolate.uid = Some(uid.clone());
        self.store.put_isolate(&isolate)?;

        let kind = isolate.kind();
        let descriptor = IsolateDescriptor {
            uid: uid.clone(),
            name: isolate.name.clone(),
            kind: kind.to_string(),
            language: isolate.language.clone(),
            node: self.node.clone(),
            command: self.launch.commands.get(kind).cloned().unwrap_or_default(),
            liveness_endpoint: self
                .launch
                .liveness_base_port
                .map(|_| format!("127.0.0.1:{}", self.next_port.fetch_add(1, Ordering::SeqCst))),
            bundles: self.composer.bundles(&isolate),
        };

        let code = self.monitor.start_isolate(&descriptor).await?;
        if code.is_success() {
            return Ok(());
        }
        error!(
            %uid,
            isolate = %isolate.name,
            ?code,
            "isolate could not be started, its components wait"
        );
        self.park(&isolate, code)
    }

    /// Take the components of an isolate that failed to start off the node.
    fn park(&self, isolate: &Isolate, code: StartCode) -> anyhow::Result<()> {
        let names: Vec<String> = isolate.components.iter().map(|c| c.name.clone()).collect();
        self.composer.kill(&names)?;
        let mut waiting = self.lock_waiting();
        for component in &isolate.components {
            if !waiting.contains(component) {
                waiting.push(component.clone());
            }
        }
        debug!(
            isolate = %isolate.name,
            code = code.code(),
            parked = names.len(),
            "components parked"
        );
        Ok(())
    }

    fn hand_over(&self, isolate: &Isolate) {
        let Some(uid) = &isolate.uid else {
            return;
        };
        let components: Vec<&Component> = isolate.components.iter().collect();
        let payload = json!({ "uid": uid, "name": isolate.name, "components": components });
        match self.bus.publish(subjects::ISOLATE_INSTANTIATE, payload, Audience::Isolates) {
            Ok(delivered) => info!(
                %uid,
                isolate = %isolate.name,
                components = components.len(),
                delivered,
                "components handed over"
            ),
            Err(e) => warn!(
                %uid,
                isolate = %isolate.name,
                error = %e,
                "isolate unreachable, hand-over abandoned"
            ),
        }
    }

    fn is_ready(&self, isolate: &Isolate) -> bool {
        isolate
            .uid
            .as_deref()
            .is_some_and(|uid| self.monitor.tracker().state(uid) == Some(IsolateState::Ready))
    }

    fn find(&self, uid: &str) -> anyhow::Result<Option<Isolate>> {
        Ok(self
            .composer
            .isolates()?
            .into_iter()
            .find(|i| i.uid.as_deref() == Some(uid)))
    }

    fn lock_waiting(&self) -> MutexGuard<'_, Vec<Component>> {
        self.waiting.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Action kind of the periodic tick.
pub const TIMER_ACTION: &str = "timer";
