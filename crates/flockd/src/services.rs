//! Explicit service registry.
//!
//! Services start in registration order and stop in reverse. Each one gets
//! its own shutdown channel, so a service is only told to stop once every
//! service registered after it has finished.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A long-running part of the daemon.
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Spawn the service's tasks. They must exit once `shutdown` flips.
    fn start(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<Vec<JoinHandle<()>>>;

    /// Hook run right before the shutdown signal is sent.
    fn stopping(&self) {}
}

type StartFn = dyn Fn(watch::Receiver<bool>) -> anyhow::Result<Vec<JoinHandle<()>>> + Send + Sync;

/// Service made of a start closure.
pub struct FnService {
    name: String,
    start: Box<StartFn>,
}

impl FnService {
    pub fn new<F>(name: &str, start: F) -> Self
    where
        F: Fn(watch::Receiver<bool>) -> anyhow::Result<Vec<JoinHandle<()>>> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            start: Box::new(start),
        }
    }
}

impl Service for FnService {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        (self.start)(shutdown)
    }
}

struct Running {
    service: Arc<dyn Service>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct ServiceRegistry {
    services: Vec<Arc<dyn Service>>,
    running: Vec<Running>,
    stop_timeout: Duration,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl ServiceRegistry {
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            services: Vec::new(),
            running: Vec::new(),
            stop_timeout,
        }
    }

    pub fn register(&mut self, service: Arc<dyn Service>) -> &mut Self {
        self.services.push(service);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    pub fn is_running(&self) -> bool {
        !self.running.is_empty()
    }

    /// Start every registered service. If one fails, those already started
    /// are stopped again and the error is returned.
    pub async fn start_all(&mut self) -> anyhow::Result<()> {
        for service in self.services.clone() {
            let (shutdown, shutdown_rx) = watch::channel(false);
            match service.start(shutdown_rx) {
                Ok(handles) => {
                    info!(service = service.name(), tasks = handles.len(), "service started");
                    self.running.push(Running {
                        service,
                        shutdown,
                        handles,
                    });
                }
                Err(e) => {
                    warn!(service = service.name(), error = %e, "service failed to start");
                    self.stop_all().await;
                    return Err(e.context(format!("starting service {}", service.name())));
                }
            }
        }
        Ok(())
    }

    /// Stop the running services, last started first.
    pub async fn stop_all(&mut self) {
        while let Some(running) = self.running.pop() {
            let name = running.service.name().to_string();
            running.service.stopping();
            let _ = running.shutdown.send(true);
            for handle in running.handles {
                match tokio::time::timeout(self.stop_timeout, handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(service = %name, error = %e, "service task failed"),
                    Err(_) => warn!(
                        service = %name,
                        timeout = ?self.stop_timeout,
                        "service task did not stop in time"
                    ),
                }
            }
            debug!(service = %name, "service stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl Service for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn start(
            &self,
            mut shutdown: watch::Receiver<bool>,
        ) -> anyhow::Result<Vec<JoinHandle<()>>> {
            if self.fail {
                anyhow::bail!("{} refused to start", self.name);
            }
            self.log.lock().unwrap().push(format!("start {}", self.name));
            let log = Arc::clone(&self.log);
            let name = self.name.clone();
            Ok(vec![tokio::spawn(async move {
                let _ = shutdown.changed().await;
                log.lock().unwrap().push(format!("exit {name}"));
            })])
        }

        fn stopping(&self) {
            self.log.lock().unwrap().push(format!("stopping {}", self.name));
        }
    }

    fn recorder(name: &str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> Arc<dyn Service> {
        Arc::new(Recorder {
            name: name.to_string(),
            log: Arc::clone(log),
            fail,
        })
    }

    #[tokio::test]
    async fn starts_in_order_and_stops_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ServiceRegistry::default();
        registry
            .register(recorder("store", &log, false))
            .register(recorder("queue", &log, false));
        registry.start_all().await.unwrap();
        assert!(registry.is_running());
        registry.stop_all().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "start store",
                "start queue",
                "stopping queue",
                "exit queue",
                "stopping store",
                "exit store",
            ]
        );
        assert!(!registry.is_running());
    }

    #[tokio::test]
    async fn failed_start_rolls_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ServiceRegistry::default();
        registry
            .register(recorder("first", &log, false))
            .register(recorder("broken", &log, true))
            .register(recorder("never", &log, false));

        let err = registry.start_all().await.unwrap_err();
        assert!(format!("{err:#}").contains("broken"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start first", "stopping first", "exit first"]
        );
        assert_eq!(registry.names(), vec!["first", "broken", "never"]);
    }

    #[tokio::test]
    async fn fn_service() {
        let mut registry = ServiceRegistry::new(Duration::from_secs(1));
        registry.register(Arc::new(FnService::new("noop", |_| Ok(Vec::new()))));
        registry.start_all().await.unwrap();
        registry.stop_all().await;
    }
}
