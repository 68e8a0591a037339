//! Cluster-State Store
//!
//! The host-side store contract: a single-writer queue that applies
//! update transformations serially against the latest accepted snapshot.
//! Discovery updates always enter at URGENT priority through the
//! [`SubmitUpdate`] adapter. Version monotonicity is enforced here, which
//! is what makes a brief master overlap safe: a stale publish simply
//! fails to apply.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::state::ClusterState;

/// Queue priority for state updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Urgent,
    Normal,
}

/// Update transformation: old snapshot in, new snapshot out
pub type UpdateFn = Box<dyn FnOnce(&ClusterState) -> Result<ClusterState> + Send + 'static>;

/// An accepted state update
#[derive(Debug, Clone)]
pub struct Transition {
    pub source: String,
    pub old_state: Arc<ClusterState>,
    pub new_state: Arc<ClusterState>,
}

/// Contract of the host's cluster-state store.
///
/// Update functions execute serially, observe the latest accepted state,
/// and never race.
#[async_trait]
pub trait ClusterStateStore: Send + Sync + 'static {
    async fn submit(&self, source: &str, priority: Priority, update: UpdateFn)
        -> Result<Transition>;

    /// Latest accepted snapshot
    fn current(&self) -> Arc<ClusterState>;
}

struct Job {
    source: String,
    priority: Priority,
    update: UpdateFn,
    reply: oneshot::Sender<Result<Transition>>,
}

/// Default store: one worker task, two-priority FIFO
pub struct QueuedStateStore {
    tx: mpsc::UnboundedSender<Job>,
    current: Arc<RwLock<Arc<ClusterState>>>,
}

impl QueuedStateStore {
    /// Spawn the worker; must be called inside a tokio runtime
    pub fn new() -> Arc<Self> {
        Self::with_initial(ClusterState::initial())
    }

    pub fn with_initial(state: ClusterState) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let current = Arc::new(RwLock::new(Arc::new(state)));
        let store = Arc::new(Self {
            tx,
            current: Arc::clone(&current),
        });
        tokio::spawn(Self::run(rx, current));
        store
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<Job>, current: Arc<RwLock<Arc<ClusterState>>>) {
        let mut urgent: VecDeque<Job> = VecDeque::new();
        let mut normal: VecDeque<Job> = VecDeque::new();

        loop {
            while let Ok(job) = rx.try_recv() {
                match job.priority {
                    Priority::Urgent => urgent.push_back(job),
                    Priority::Normal => normal.push_back(job),
                }
            }

            if let Some(job) = urgent.pop_front().or_else(|| normal.pop_front()) {
                Self::apply(job, &current);
                continue;
            }

            match rx.recv().await {
                Some(job) => match job.priority {
                    Priority::Urgent => urgent.push_back(job),
                    Priority::Normal => normal.push_back(job),
                },
                None => break,
            }
        }
    }

    fn apply(job: Job, current: &Arc<RwLock<Arc<ClusterState>>>) {
        let old_state = current.read().expect("state lock poisoned").clone();

        let result = (job.update)(&old_state).and_then(|new_state| {
            if new_state.version < old_state.version {
                return Err(Error::StaleState {
                    proposed: new_state.version,
                    current: old_state.version,
                });
            }
            let new_state = Arc::new(new_state);
            *current.write().expect("state lock poisoned") = Arc::clone(&new_state);
            tracing::debug!(
                source = %job.source,
                old_version = old_state.version,
                new_version = new_state.version,
                "cluster state updated"
            );
            Ok(Transition {
                source: job.source,
                old_state,
                new_state,
            })
        });

        if let Err(e) = &result {
            tracing::debug!(error = %e, "state update rejected");
        }
        let _ = job.reply.send(result);
    }
}

#[async_trait]
impl ClusterStateStore for QueuedStateStore {
    async fn submit(
        &self,
        source: &str,
        priority: Priority,
        update: UpdateFn,
    ) -> Result<Transition> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job {
                source: source.to_string(),
                priority,
                update,
                reply,
            })
            .map_err(|_| Error::StoreClosed)?;
        rx.await.map_err(|_| Error::StoreClosed)?
    }

    fn current(&self) -> Arc<ClusterState> {
        self.current.read().expect("state lock poisoned").clone()
    }
}

/// Thin adapter the discovery components mutate state through: binds a
/// store, a source label, and URGENT priority.
#[derive(Clone)]
pub struct SubmitUpdate {
    store: Arc<dyn ClusterStateStore>,
}

impl SubmitUpdate {
    pub fn new(store: Arc<dyn ClusterStateStore>) -> Self {
        Self { store }
    }

    pub async fn submit(&self, source: &str, update: UpdateFn) -> Result<Transition> {
        self.store.submit(source, Priority::Urgent, update).await
    }

    pub fn current(&self) -> Arc<ClusterState> {
        self.store.current()
    }
}
