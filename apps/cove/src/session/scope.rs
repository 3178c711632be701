//! The cancellable lifetime of one supervisor iteration. Every background
//! task is spawned through the scope so that a single `cancel` call brings
//! the whole tree down and `wait` drains it.

use std::future::Future;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct Scope {
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scope {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// A receiver that flips to `true` when the scope is cancelled. Cheap to
    /// clone into background tasks; holding one does not extend the scope's
    /// lifetime.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Spawns a background task under this scope and registers it with the
    /// wait group. The task is expected to observe `subscribe()` and exit on
    /// cancellation.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.lock().unwrap().push(handle);
    }

    /// Waits for every spawned task to finish. Tasks registered after the
    /// drain started are picked up by the next call.
    pub async fn wait(&self) {
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once `rx` observes cancellation. Also resolves if the scope was
/// dropped, which only happens when the session is being torn down anyway.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn cancel_reaches_every_spawned_task() {
        let scope = Scope::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let observed = stopped.clone();
        let mut rx = scope.subscribe();
        scope.spawn(async move {
            cancelled(&mut rx).await;
            observed.store(true, Ordering::SeqCst);
        });

        scope.cancel();
        timeout(Duration::from_secs(1), scope.wait())
            .await
            .expect("wait drains after cancel");
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn wait_returns_immediately_with_no_tasks() {
        let scope = Scope::new();
        timeout(Duration::from_millis(50), scope.wait())
            .await
            .expect("nothing to drain");
    }
}
