//! Action executor: dispatches an action to the handler registered for its
//! kind, or to the fallback.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use flock_core::Action;
use tracing::{debug, error, warn};

use crate::error::{ActionError, ActionResult};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type Handler = Arc<dyn Fn(Action) -> BoxFuture<'static, ActionResult<()>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Action) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult<()>> + Send + 'static,
{
    Arc::new(move |action| Box::pin(f(action)))
}

pub struct ActionExecutor {
    handlers: HashMap<String, Handler>,
    fallback: Handler,
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new(handler(|action: Action| async move {
            warn!(kind = %action.kind, isolate = %action.isolate, "no handler for action, dropped");
            Ok(())
        }))
    }
}

impl ActionExecutor {
    pub fn new(fallback: Handler) -> Self {
        Self {
            handlers: HashMap::new(),
            fallback,
        }
    }

    pub fn register(&mut self, kind: &str, handler: Handler) {
        self.handlers.insert(kind.to_string(), handler);
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Run one action to completion. Errors and panics of the handler are
    /// logged and returned; they never escape as a panic.
    pub async fn execute(&self, action: Action) -> ActionResult<()> {
        let handler = Arc::clone(self.handlers.get(&action.kind).unwrap_or(&self.fallback));
        let kind = action.kind.clone();
        let isolate = action.isolate.clone();
        debug!(%kind, %isolate, "executing action");

        match tokio::spawn(async move { handler(action).await }).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(%kind, %isolate, error = %e, "action failed");
                Err(e)
            }
            Err(join) => {
                error!(%kind, %isolate, error = %join, "action handler panicked");
                Err(ActionError::ActionExecution {
                    kind,
                    isolate,
                    reason: join.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn action(kind: &str) -> Action {
        Action::new("iso1", kind, serde_json::Value::Null)
    }

    #[tokio::test]
    async fn dispatch_by_kind_with_fallback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fallback_seen = Arc::clone(&seen);
        let mut executor = ActionExecutor::new(handler(move |a: Action| {
            let seen = Arc::clone(&fallback_seen);
            async move {
                seen.lock().unwrap().push(format!("fallback:{}", a.kind));
                Ok(())
            }
        }));
        let specific_seen = Arc::clone(&seen);
        executor.register(
            "instantiate",
            handler(move |a: Action| {
                let seen = Arc::clone(&specific_seen);
                async move {
                    seen.lock().unwrap().push(format!("instantiate:{}", a.isolate));
                    Ok(())
                }
            }),
        );

        executor.execute(action("instantiate")).await.unwrap();
        executor.execute(action("other")).await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["instantiate:iso1".to_string(), "fallback:other".to_string()]
        );
        assert_eq!(executor.kinds(), vec!["instantiate"]);
    }

    #[tokio::test]
    async fn failures_and_panics_are_contained() {
        let mut executor = ActionExecutor::default();
        executor.register(
            "fail",
            handler(|a: Action| async move { Err(ActionError::execution(&a, "boom")) }),
        );
        executor.register(
            "panic",
            handler(|_: Action| async move {
                let outcome: ActionResult<()> = panic!("handler bug");
                outcome
            }),
        );

        assert!(matches!(
            executor.execute(action("fail")).await,
            Err(ActionError::ActionExecution { reason, .. }) if reason == "boom"
        ));
        assert!(matches!(
            executor.execute(action("panic")).await,
            Err(ActionError::ActionExecution { kind, .. }) if kind == "panic"
        ));
        assert!(executor.execute(action("unknown")).await.is_ok());
    }
}
