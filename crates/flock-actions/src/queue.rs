//! FIFO action queue with a single consumer.
//!
//! Producers push from any thread; one consumer task pops with a timed wait
//! and runs each action to completion before taking the next. `stop()`
//! sends a sentinel so an idle consumer exits without waiting out the
//! timeout. Actions still queued at that point are counted and logged, not
//! executed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flock_core::Action;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ActionError, ActionResult};
use crate::executor::ActionExecutor;

enum Item {
    Action(Action),
    Stop,
}

#[derive(Debug, Default)]
pub struct QueueStats {
    pending: AtomicUsize,
    executed: AtomicU64,
    failed: AtomicU64,
}

impl QueueStats {
    /// Actions pushed and not yet taken by the consumer.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Actions run to completion, failed ones included.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}

pub struct ActionQueue {
    tx: mpsc::UnboundedSender<Item>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Item>>>,
    stopped: AtomicBool,
    stats: QueueStats,
    poll_timeout: Duration,
}

impl ActionQueue {
    pub fn new(poll_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            stopped: AtomicBool::new(false),
            stats: QueueStats::default(),
            poll_timeout,
        }
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub fn pending(&self) -> usize {
        self.stats.pending()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn push(&self, action: Action) -> ActionResult<()> {
        if self.is_stopped() {
            return Err(ActionError::QueueClosed);
        }
        self.stats.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Item::Action(action)).is_err() {
            self.stats.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ActionError::QueueClosed);
        }
        Ok(())
    }

    pub fn push_all(&self, actions: impl IntoIterator<Item = Action>) -> ActionResult<()> {
        actions.into_iter().try_for_each(|action| self.push(action))
    }

    /// Refuse further pushes and wake the consumer.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Item::Stop);
            debug!("action queue stop requested");
        }
    }

    /// Start the consumer. Only one consumer may ever run per queue.
    pub fn spawn(
        self: Arc<Self>,
        executor: Arc<ActionExecutor>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ActionResult<JoinHandle<()>> {
        let mut rx = self
            .rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(ActionError::ConsumerTaken)?;

        Ok(tokio::spawn(async move {
            info!(poll_timeout = ?self.poll_timeout, "action queue consumer started");
            while !self.is_stopped() {
                tokio::select! {
                    _ = shutdown.changed() => {
                        self.stopped.store(true, Ordering::SeqCst);
                    }
                    item = tokio::time::timeout(self.poll_timeout, rx.recv()) => match item {
                        Err(_) => continue,
                        Ok(None) | Ok(Some(Item::Stop)) => break,
                        Ok(Some(Item::Action(action))) => {
                            self.stats.pending.fetch_sub(1, Ordering::SeqCst);
                            let outcome = executor.execute(action).await;
                            self.stats.executed.fetch_add(1, Ordering::SeqCst);
                            if outcome.is_err() {
                                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                }
            }

            let mut left = 0usize;
            while let Ok(item) = rx.try_recv() {
                if matches!(item, Item::Action(_)) {
                    left += 1;
                }
            }
            if left > 0 {
                warn!(pending = left, "action queue stopped with pending actions");
            }
            info!(
                executed = self.stats.executed(),
                failed = self.stats.failed(),
                "action queue consumer stopped"
            );
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::handler;

    fn action(kind: &str, producer: usize, seq: usize) -> Action {
        Action::new(
            &format!("iso{producer}"),
            kind,
            serde_json::json!({ "producer": producer, "seq": seq }),
        )
    }

    async fn wait_for(queue: &ActionQueue, executed: u64) {
        for _ in 0..500 {
            if queue.stats().executed() >= executed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("only {} actions executed", queue.stats().executed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_at_a_time_in_producer_order() {
        let running = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));
        let order = Arc::new(Mutex::new(Vec::new()));

        let (r, o, seen) = (Arc::clone(&running), Arc::clone(&overlap), Arc::clone(&order));
        let executor = ActionExecutor::new(handler(move |a: Action| {
            let (running, overlap, seen) = (Arc::clone(&r), Arc::clone(&o), Arc::clone(&seen));
            async move {
                if running.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlap.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                let producer = a.payload["producer"].as_u64().unwrap();
                let seq = a.payload["seq"].as_u64().unwrap();
                seen.lock().unwrap().push((producer, seq, a.kind));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        let queue = Arc::new(ActionQueue::new(Duration::from_millis(50)));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = Arc::clone(&queue).spawn(Arc::new(executor), shutdown_rx).unwrap();

        let producers: Vec<_> = (0..3)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for (seq, kind) in ["A", "B", "C"].into_iter().enumerate() {
                        queue.push(action(kind, producer, seq)).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        wait_for(&queue, 9).await;
        queue.stop();
        consumer.await.unwrap();

        assert!(!overlap.load(Ordering::SeqCst));
        let order = order.lock().unwrap();
        assert_eq!(order.len(), 9);
        for producer in 0..3u64 {
            let kinds: Vec<&str> = order
                .iter()
                .filter(|(p, _, _)| *p == producer)
                .map(|(_, _, kind)| kind.as_str())
                .collect();
            assert_eq!(kinds, vec!["A", "B", "C"]);
        }
        assert_eq!(queue.stats().failed(), 0);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn failure_does_not_stop_the_loop() {
        let mut executor = ActionExecutor::default();
        executor.register(
            "fail",
            handler(|a: Action| async move { Err(ActionError::execution(&a, "nope")) }),
        );
        executor.register(
            "panic",
            handler(|_: Action| async move {
                let outcome: ActionResult<()> = panic!("bug");
                outcome
            }),
        );
        executor.register("ok", handler(|_: Action| async { Ok(()) }));

        let queue = Arc::new(ActionQueue::new(Duration::from_millis(20)));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = Arc::clone(&queue).spawn(Arc::new(executor), shutdown_rx).unwrap();
        queue
            .push_all([action("fail", 0, 0), action("panic", 0, 1), action("ok", 0, 2)])
            .unwrap();

        wait_for(&queue, 3).await;
        assert_eq!(queue.stats().failed(), 2);
        queue.stop();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn stop_wakes_an_idle_consumer() {
        let queue = Arc::new(ActionQueue::new(Duration::from_secs(60)));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = Arc::clone(&queue)
            .spawn(Arc::new(ActionExecutor::default()), shutdown_rx)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.stop();
        tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .expect("consumer did not exit")
            .unwrap();
        assert!(matches!(
            queue.push(action("late", 0, 0)),
            Err(ActionError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn pending_actions_survive_stop_unexecuted() {
        let queue = Arc::new(ActionQueue::new(Duration::from_millis(20)));
        queue
            .push_all((0..3).map(|seq| action("x", 0, seq)))
            .unwrap();
        assert_eq!(queue.pending(), 3);
        queue.stop();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = Arc::clone(&queue)
            .spawn(Arc::new(ActionExecutor::default()), shutdown_rx)
            .unwrap();
        consumer.await.unwrap();
        assert_eq!(queue.stats().executed(), 0);
        assert_eq!(queue.pending(), 3);
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_consumer() {
        let queue = Arc::new(ActionQueue::new(Duration::from_secs(60)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = Arc::clone(&queue)
            .spawn(Arc::new(ActionExecutor::default()), shutdown_rx.clone())
            .unwrap();
        assert!(matches!(
            Arc::clone(&queue).spawn(Arc::new(ActionExecutor::default()), shutdown_rx),
            Err(ActionError::ConsumerTaken)
        ));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .expect("consumer did not exit")
            .unwrap();
        assert!(queue.is_stopped());
    }
}
