//! Debounced documentation trigger.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{DocumentationSink, RegistrySnapshot};

/// Revision counter for the capability set plus the wake-up for the
/// publisher task.
#[derive(Debug, Default)]
pub struct DocsTrigger {
    revision: AtomicU64,
    published: AtomicU64,
    stopped: AtomicBool,
    notify: Notify,
}

impl DocsTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a material change. Returns the new revision.
    pub fn bump(&self) -> u64 {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        self.notify.notify_one();
        revision
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Last revision handed to the sink.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Spawn the publisher. After a bump it waits until no further bump
    /// arrives for `debounce`, then publishes one snapshot.
    pub fn spawn_publisher<F>(
        self: &Arc<Self>,
        sink: Arc<dyn DocumentationSink>,
        debounce: Duration,
        snapshot: F,
    ) -> JoinHandle<()>
    where
        F: Fn() -> RegistrySnapshot + Send + Sync + 'static,
    {
        let trigger = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                trigger.notify.notified().await;
                if trigger.is_stopped() {
                    break;
                }

                loop {
                    let seen = trigger.revision();
                    tokio::time::sleep(debounce).await;
                    if trigger.is_stopped() || trigger.revision() == seen {
                        break;
                    }
                }
                if trigger.is_stopped() {
                    break;
                }

                let snapshot = snapshot();
                if snapshot.revision <= trigger.published() {
                    continue;
                }
                let revision = snapshot.revision;
                match sink.publish(snapshot).await {
                    Ok(()) => trigger.published.store(revision, Ordering::SeqCst),
                    Err(e) => log::warn!("Documentation sink failed for revision {}: {}", revision, e),
                }
            }
            log::debug!("Documentation publisher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::errors::CuratorResult;

    #[derive(Default)]
    struct Recorder {
        revisions: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl DocumentationSink for Recorder {
        async fn publish(&self, snapshot: RegistrySnapshot) -> CuratorResult<()> {
            self.revisions.lock().push(snapshot.revision);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_burst_publishes_once() {
        let trigger = Arc::new(DocsTrigger::new());
        let sink = Arc::new(Recorder::default());
        let source = Arc::clone(&trigger);
        let handle = trigger.spawn_publisher(sink.clone(), Duration::from_millis(50), move || RegistrySnapshot::empty(source.revision()));

        for _ in 0..10 {
            trigger.bump();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*sink.revisions.lock(), vec![10]);
        assert_eq!(trigger.published(), 10);

        trigger.bump();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*sink.revisions.lock(), vec![10, 11]);

        trigger.stop();
        handle.await.unwrap();
    }
}
