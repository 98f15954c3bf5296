//! Background mirror of local instances to a discovery backend.
//!
//! Registration paths make one inline attempt per [`MirrorCommand`] through
//! [`MirrorHandle::apply_now`], bounded by the attempt timeout, and hand
//! failures to a single worker task. Other paths enqueue with
//! [`MirrorHandle::submit`]. The worker keeps failed commands in a retry map
//! keyed by `(service_name, instance_id)` (latest command per instance wins)
//! and replays them on the retry tick once a reachability check sees the backend
//! again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::{DiscoveryBackend, DiscoveryError, DiscoveryInstance};
use crate::services::ServiceRecord;

/// A unit of mirror work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorCommand {
    Announce(DiscoveryInstance),
    Withdraw { service_name: String, instance_id: String },
}

/// Retry-map key: `(service_name, instance_id)`.
type InstanceKey = (String, String);

impl MirrorCommand {
    pub fn announce(record: &ServiceRecord) -> Self {
        MirrorCommand::Announce(DiscoveryInstance::from(record))
    }

    pub fn withdraw(service_name: &str, instance_id: &str) -> Self {
        MirrorCommand::Withdraw {
            service_name: service_name.to_string(),
            instance_id: instance_id.to_string(),
        }
    }

    fn key(&self) -> InstanceKey {
        match self {
            MirrorCommand::Announce(instance) => (instance.service_name.clone(), instance.instance_id.clone()),
            MirrorCommand::Withdraw {
                service_name,
                instance_id,
            } => (service_name.clone(), instance_id.clone()),
        }
    }

    async fn apply(&self, backend: &dyn DiscoveryBackend) -> Result<(), DiscoveryError> {
        match self {
            MirrorCommand::Announce(instance) => backend.announce(instance).await,
            MirrorCommand::Withdraw {
                service_name,
                instance_id,
            } => backend.withdraw(service_name, instance_id).await,
        }
    }
}

enum Message {
    /// Attempt now, keep for retry on failure.
    Command(MirrorCommand),
    /// Already attempted inline and failed; keep for retry.
    Retry(MirrorCommand),
    /// Applied inline; drop any older retry for the instance.
    Settled(InstanceKey),
    Stop,
}

/// Mirror bookkeeping shared between the worker and the facade.
#[derive(Debug)]
pub struct MirrorState {
    reachable: AtomicBool,
    queued: AtomicUsize,
    retrying: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_checked_at: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time view of [`MirrorState`].
#[derive(Debug, Clone, Serialize)]
pub struct MirrorStatus {
    pub reachable: bool,
    pub pending_operations: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub last_error: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl MirrorState {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            queued: AtomicUsize::new(0),
            retrying: AtomicUsize::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_checked_at: Mutex::new(None),
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Commands not yet applied, queued or awaiting retry.
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::SeqCst) + self.retrying.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> MirrorStatus {
        MirrorStatus {
            reachable: self.is_reachable(),
            pending_operations: self.pending(),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            last_error: self.last_error.lock().clone(),
            last_checked_at: *self.last_checked_at.lock(),
        }
    }

    fn mark_reachable(&self, backend: &str) {
        if !self.reachable.swap(true, Ordering::SeqCst) {
            log::info!("Discovery backend '{}' is reachable again", backend);
        }
    }

    fn mark_unreachable(&self, backend: &str, error: String) {
        if self.reachable.swap(false, Ordering::SeqCst) {
            log::warn!("Discovery backend '{}' unreachable, continuing with local state: {}", backend, error);
        }
        *self.last_error.lock() = Some(error);
    }
}

/// Check the backend within `timeout` and record the outcome on `state`.
pub async fn check_reachability(backend: &dyn DiscoveryBackend, state: &MirrorState, timeout: Duration) -> bool {
    let outcome = match tokio::time::timeout(timeout, backend.health_check()).await {
        Ok(Ok(health)) if health.reachable => Ok(()),
        Ok(Ok(health)) => Err(health.message),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(DiscoveryError::Timeout(timeout.as_millis() as u64).to_string()),
    };
    *state.last_checked_at.lock() = Some(Utc::now());

    match outcome {
        Ok(()) => {
            state.mark_reachable(backend.name());
            true
        }
        Err(message) => {
            state.mark_unreachable(backend.name(), message);
            false
        }
    }
}

/// Handle to a running mirror worker.
pub struct MirrorHandle {
    sender: mpsc::UnboundedSender<Message>,
    state: Arc<MirrorState>,
    backend: Arc<dyn DiscoveryBackend>,
    attempt_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MirrorHandle {
    /// Spawn the worker on the current runtime.
    pub fn spawn(
        backend: Arc<dyn DiscoveryBackend>,
        state: Arc<MirrorState>,
        attempt_timeout: Duration,
        retry_interval: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker_state = Arc::clone(&state);
        let worker_backend = Arc::clone(&backend);
        let task = tokio::spawn(async move {
            mirror_worker(worker_backend, receiver, worker_state, attempt_timeout, retry_interval).await;
        });

        Self {
            sender,
            state,
            backend,
            attempt_timeout,
            task: Mutex::new(Some(task)),
        }
    }

    /// Enqueue without waiting. Never blocks the caller.
    pub fn submit(&self, command: MirrorCommand) {
        self.send(Message::Command(command));
    }

    /// Attempt `command` on the caller's task, bounded by the attempt
    /// timeout. A failed command is handed to the worker for retry. Returns
    /// whether the backend applied it.
    pub async fn apply_now(&self, command: MirrorCommand) -> bool {
        if attempt(self.backend.as_ref(), &command, &self.state, self.attempt_timeout).await {
            self.send(Message::Settled(command.key()));
            true
        } else {
            self.send(Message::Retry(command));
            false
        }
    }

    fn send(&self, message: Message) {
        let counted = matches!(message, Message::Command(_) | Message::Retry(_));
        if counted {
            self.state.queued.fetch_add(1, Ordering::SeqCst);
        }
        if self.sender.send(message).is_err() {
            if counted {
                self.state.queued.fetch_sub(1, Ordering::SeqCst);
            }
            log::debug!("Mirror worker stopped, dropping command");
        }
    }

    pub fn state(&self) -> &Arc<MirrorState> {
        &self.state
    }

    pub fn status(&self) -> MirrorStatus {
        self.state.status()
    }

    /// Stop the worker after every command already queued has been
    /// attempted once. Waits at most `wait`.
    pub async fn shutdown(&self, wait: Duration) {
        let _ = self.sender.send(Message::Stop);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(wait, task).await.is_err() {
                log::warn!("Mirror worker did not stop within {}ms", wait.as_millis());
            }
        }
    }
}

async fn mirror_worker(
    backend: Arc<dyn DiscoveryBackend>,
    mut receiver: mpsc::UnboundedReceiver<Message>,
    state: Arc<MirrorState>,
    attempt_timeout: Duration,
    retry_interval: Duration,
) {
    let mut retry: BTreeMap<InstanceKey, MirrorCommand> = BTreeMap::new();
    let mut ticker = interval_at(Instant::now() + retry_interval, retry_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = receiver.recv() => {
                match message {
                    Some(Message::Command(command)) => {
                        state.queued.fetch_sub(1, Ordering::SeqCst);
                        let key = command.key();
                        retry.remove(&key);
                        if !attempt(backend.as_ref(), &command, &state, attempt_timeout).await {
                            retry.insert(key, command);
                        }
                    }
                    Some(Message::Retry(command)) => {
                        state.queued.fetch_sub(1, Ordering::SeqCst);
                        retry.insert(command.key(), command);
                    }
                    Some(Message::Settled(key)) => {
                        retry.remove(&key);
                    }
                    Some(Message::Stop) | None => break,
                }
                state.retrying.store(retry.len(), Ordering::SeqCst);
            }

            _ = ticker.tick() => {
                if !check_reachability(backend.as_ref(), &state, attempt_timeout).await || retry.is_empty() {
                    continue;
                }
                log::debug!("Retrying {} mirror operations", retry.len());
                let due = std::mem::take(&mut retry);
                for (key, command) in due {
                    if !attempt(backend.as_ref(), &command, &state, attempt_timeout).await {
                        retry.insert(key, command);
                    }
                }
                state.retrying.store(retry.len(), Ordering::SeqCst);
            }
        }
    }

    if !retry.is_empty() {
        log::warn!("Mirror worker stopping with {} operations not applied", retry.len());
    }
}

async fn attempt(
    backend: &dyn DiscoveryBackend,
    command: &MirrorCommand,
    state: &MirrorState,
    timeout: Duration,
) -> bool {
    let result = match tokio::time::timeout(timeout, command.apply(backend)).await {
        Ok(result) => result,
        Err(_) => Err(DiscoveryError::Timeout(timeout.as_millis() as u64)),
    };

    match result {
        Ok(()) => {
            state.succeeded.fetch_add(1, Ordering::SeqCst);
            state.mark_reachable(backend.name());
            true
        }
        Err(e) => {
            state.failed.fetch_add(1, Ordering::SeqCst);
            log::debug!("Mirror {:?} failed: {}", command.key(), e);
            match e {
                // The backend answered; keep it marked reachable.
                DiscoveryError::Rejected { .. } => *state.last_error.lock() = Some(e.to_string()),
                _ => state.mark_unreachable(backend.name(), e.to_string()),
            }
            false
        }
    }
}
