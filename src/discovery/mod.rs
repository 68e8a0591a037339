//! Discovery Module
//!
//! The host-facing facade over the discovery components. `Discovery` owns
//! a supervisor loop that builds a node instance from the factory, keeps
//! it running, and rebuilds it from scratch - with a fresh node identity
//! and bounded backoff - whenever the abdicator pulls the plug. This
//! restart loop is the restart hook of the subsystem: persistent quorum
//! loss has no other recovery.

pub mod protocol;

mod abdicator;
mod follower;
mod lifecycle;
mod master;
mod monitor;
mod pinger;

pub use follower::FollowerHandle;
pub use lifecycle::{NodeFactory, NodeRuntime, RestartPolicy};
pub use master::{AckListener, MasterHandle};

use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::EskkaConfig;
use crate::error::{Error, Result};
use crate::state::{ClusterState, ClusterStateStore, StateCodec};
use lifecycle::NodeInstance;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

struct SharedHandles {
    master_rx: watch::Receiver<Option<MasterHandle>>,
}

/// One-shot callbacks fired on the first successful state application
type InitialStateListener = Box<dyn FnOnce() + Send>;

/// The discovery subsystem as the host sees it
pub struct Discovery {
    config: EskkaConfig,
    factory: Arc<dyn NodeFactory>,
    store: Arc<dyn ClusterStateStore>,
    codec: Arc<dyn StateCodec>,
    restart_policy: RestartPolicy,
    phase: Mutex<Phase>,
    live_tx: watch::Sender<bool>,
    stop_tx: watch::Sender<bool>,
    shared: Arc<RwLock<Option<SharedHandles>>>,
    initial_listeners: Arc<Mutex<Vec<InitialStateListener>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    pub fn new(
        config: EskkaConfig,
        factory: Arc<dyn NodeFactory>,
        store: Arc<dyn ClusterStateStore>,
        codec: Arc<dyn StateCodec>,
    ) -> Arc<Self> {
        Self::with_restart_policy(config, factory, store, codec, RestartPolicy::default())
    }

    pub fn with_restart_policy(
        config: EskkaConfig,
        factory: Arc<dyn NodeFactory>,
        store: Arc<dyn ClusterStateStore>,
        codec: Arc<dyn StateCodec>,
        restart_policy: RestartPolicy,
    ) -> Arc<Self> {
        let (live_tx, _) = watch::channel(false);
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            factory,
            store,
            codec,
            restart_policy,
            phase: Mutex::new(Phase::Idle),
            live_tx,
            stop_tx,
            shared: Arc::new(RwLock::new(None)),
            initial_listeners: Arc::new(Mutex::new(Vec::new())),
            supervisor: Mutex::new(None),
        })
    }

    /// Register a callback for the first successful state application.
    /// Must be called before `start`.
    pub fn on_initial_state(&self, listener: impl FnOnce() + Send + 'static) -> Result<()> {
        if *self.phase.lock().expect("phase lock poisoned") != Phase::Idle {
            return Err(Error::Internal(
                "initial-state listeners must be registered before start".into(),
            ));
        }
        self.initial_listeners
            .lock()
            .expect("listener lock poisoned")
            .push(Box::new(listener));
        Ok(())
    }

    /// Start the subsystem. The returned flag turns true once this node
    /// has joined the cluster (and false again while it restarts).
    pub async fn start(self: &Arc<Self>) -> Result<watch::Receiver<bool>> {
        self.config.validate()?;
        {
            let mut phase = self.phase.lock().expect("phase lock poisoned");
            match *phase {
                Phase::Running => return Ok(self.live_tx.subscribe()),
                Phase::Stopped => return Err(Error::ShuttingDown),
                Phase::Idle => *phase = Phase::Running,
            }
        }

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.supervise().await });
        *self.supervisor.lock().expect("supervisor lock poisoned") = Some(task);
        Ok(self.live_tx.subscribe())
    }

    /// Forward a publish request to the local master
    pub fn publish(&self, state: ClusterState, ack: AckListener) -> Result<()> {
        if *self.phase.lock().expect("phase lock poisoned") != Phase::Running {
            return Err(Error::NotStarted);
        }
        let shared = self.shared.read().expect("shared lock poisoned");
        let Some(handles) = shared.as_ref() else {
            return Err(Error::NotStarted);
        };
        let master = handles.master_rx.borrow().clone();
        match master {
            Some(master) => master.publish(state, ack),
            None => Err(Error::NoLocalMaster),
        }
    }

    /// Whether the master singleton currently runs on this node
    pub fn is_local_master(&self) -> bool {
        self.shared
            .read()
            .expect("shared lock poisoned")
            .as_ref()
            .map(|h| h.master_rx.borrow().is_some())
            .unwrap_or(false)
    }

    /// Live flag as handed out by `start`
    pub fn live(&self) -> watch::Receiver<bool> {
        self.live_tx.subscribe()
    }

    /// Graceful leave, then teardown. Idempotent.
    pub async fn stop(&self) {
        {
            let mut phase = self.phase.lock().expect("phase lock poisoned");
            if *phase == Phase::Stopped {
                return;
            }
            *phase = Phase::Stopped;
        }
        let _ = self.stop_tx.send(true);
        let task = self
            .supervisor
            .lock()
            .expect("supervisor lock poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Alias for `stop`
    pub async fn close(&self) {
        self.stop().await;
    }

    /// Build-run-restart loop; exits only on an external stop
    async fn supervise(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut failures: u32 = 0;

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let started_at = tokio::time::Instant::now();
            let instance = match self.factory.build().await {
                Ok(runtime) => {
                    NodeInstance::start(
                        &self.config,
                        runtime,
                        Arc::clone(&self.store),
                        Arc::clone(&self.codec),
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            match instance {
                Ok(mut instance) => {
                    *self.shared.write().expect("shared lock poisoned") = Some(SharedHandles {
                        master_rx: instance.master_rx.clone(),
                    });
                    self.live_tx.send_replace(true);

                    // initial-state listeners fire on the node's first
                    // applied update, whichever instance delivers it
                    let follower = instance.follower.clone();
                    let listeners = Arc::clone(&self.initial_listeners);
                    tokio::spawn(async move {
                        follower.wait_first_submit().await;
                        let fired: Vec<_> = listeners
                            .lock()
                            .expect("listener lock poisoned")
                            .drain(..)
                            .collect();
                        for listener in fired {
                            listener();
                        }
                    });

                    let abdicated = tokio::select! {
                        signal = instance.abdicate_rx.recv() => signal.is_some(),
                        res = stop_rx.changed() => {
                            let _ = res;
                            false
                        }
                    };

                    self.live_tx.send_replace(false);
                    *self.shared.write().expect("shared lock poisoned") = None;

                    if !abdicated || *stop_rx.borrow() {
                        instance.stop(true).await;
                        break;
                    }

                    // quorum loss outlived the observation window: tear
                    // down without a goodbye and come back as a new node
                    instance.stop(false).await;
                    if started_at.elapsed() >= self.restart_policy.stable_after {
                        failures = 0;
                    }
                    failures += 1;
                }
                Err(e) => {
                    self.live_tx.send_replace(false);
                    failures += 1;
                    tracing::error!("failed to start discovery instance: {e}");
                }
            }

            let delay = self.restart_policy.delay_for(failures);
            tracing::warn!(?delay, failures, "restarting discovery");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_rx.changed() => break,
            }
        }
    }
}
