// Ordered, run-once shutdown actions
//
// Actions are registered during startup and executed in registration order by
// whichever of the signal path or the normal exit path gets there first.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

type DisposeFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type DisposeAction = Box<dyn FnOnce() -> DisposeFuture + Send>;

#[derive(Default)]
pub struct Disposer {
    disposed: AtomicBool,
    actions: Mutex<Vec<(String, DisposeAction)>>,
    action_timeout: Option<Duration>,
}

impl Disposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abandon any single action that runs longer than `timeout`
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = Some(timeout);
        self
    }

    /// Append an action; ignored once disposal has started
    pub fn register<F, Fut>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        if self.is_disposed() {
            warn!(action = %name, "Disposer already ran, action ignored");
            return;
        }
        self.actions
            .lock()
            .push((name, Box::new(move || Box::pin(action()) as DisposeFuture)));
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Run every action once, in order
    ///
    /// Returns `false` when another caller already disposed. Failing or timed
    /// out actions are logged and do not stop the rest.
    pub async fn dispose(&self) -> bool {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let actions = std::mem::take(&mut *self.actions.lock());
        for (name, action) in actions {
            debug!(action = %name, "Disposing");
            let result = match self.action_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, action()).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(action = %name, ?timeout, "Dispose action timed out");
                        continue;
                    }
                },
                None => action().await,
            };
            if let Err(e) = result {
                error!(action = %name, "Dispose action failed: {:#}", e);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_actions_run_once_in_order() {
        let disposer = Disposer::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["deregister", "close listener", "clean tmp"] {
            let log = Arc::clone(&log);
            disposer.register(name, move || async move {
                log.lock().push(name);
                Ok(())
            });
        }

        assert!(disposer.dispose().await);
        assert!(!disposer.dispose().await);
        assert_eq!(*log.lock(), vec!["deregister", "close listener", "clean tmp"]);
    }

    #[tokio::test]
    async fn test_failing_action_does_not_block_the_rest() {
        let disposer = Disposer::new();
        let ran = Arc::new(AtomicBool::new(false));

        disposer.register("broken", || async { Err(anyhow::anyhow!("registry unreachable")) });
        disposer.register("after", {
            let ran = Arc::clone(&ran);
            move || async move {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        disposer.dispose().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_concurrent_dispose_runs_once() {
        let disposer = Arc::new(Disposer::new());
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        disposer.register("count", {
            let count = Arc::clone(&count);
            move || async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let (a, b) = tokio::join!(disposer.dispose(), disposer.dispose());
        assert!(a ^ b);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_register_after_dispose_is_ignored() {
        let disposer = Disposer::new();
        disposer.dispose().await;

        let ran = Arc::new(AtomicBool::new(false));
        disposer.register("late", {
            let ran = Arc::clone(&ran);
            move || async move {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
        assert!(!disposer.dispose().await);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_action_is_abandoned_after_timeout() {
        let disposer = Disposer::new().with_action_timeout(Duration::from_secs(5));
        let ran = Arc::new(AtomicBool::new(false));

        disposer.register("hung registry", || async {
            std::future::pending::<()>().await;
            Ok(())
        });
        disposer.register("after", {
            let ran = Arc::clone(&ran);
            move || async move {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        let started = tokio::time::Instant::now();
        assert!(disposer.dispose().await);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert!(ran.load(Ordering::SeqCst));
    }
}
