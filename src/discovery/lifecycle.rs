//! Lifecycle
//!
//! Builds a node instance on top of a freshly joined substrate: waits out
//! the randomized join timeout, spawns the discovery components, runs the
//! master singleton exactly while this node is the oldest master-eligible
//! member, and tears everything down again on departure or abdication.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::EskkaConfig;
use crate::discovery::abdicator::Abdicator;
use crate::discovery::follower::{Follower, FollowerHandle};
use crate::discovery::master::{Master, MasterHandle};
use crate::discovery::monitor::PartitionMonitor;
use crate::discovery::pinger::Pinger;
use crate::error::{Error, Result};
use crate::membership::{MemberEvent, MembershipSubstrate, VotingMembers};
use crate::state::{ClusterStateStore, StateCodec, SubmitUpdate};
use crate::transport::{NodeBus, Transport};

/// Graceful departure deadline
pub(crate) const LEAVE_TIMEOUT: Duration = Duration::from_secs(4);

/// Component teardown deadline
pub(crate) const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything one node instance runs on. Rebuilt from scratch (with a
/// fresh node identity) on every restart.
pub struct NodeRuntime {
    pub substrate: Arc<dyn MembershipSubstrate>,
    pub transport: Arc<dyn Transport>,
    pub bus: NodeBus,
}

/// Joins the substrate and wires up the runtime for one instance
#[async_trait]
pub trait NodeFactory: Send + Sync + 'static {
    async fn build(&self) -> Result<NodeRuntime>;
}

/// Bounded exponential backoff with jitter for the restart loop
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    pub jitter: f64,
    /// A run longer than this resets the failure counter
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: 0.2,
            stable_after: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures.saturating_sub(1).min(16);
        let raw = self.base.as_secs_f64() * self.factor.powi(exp as i32);
        let capped = raw.min(self.max.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64(capped * (1.0 + jitter))
    }
}

/// A running set of discovery components on one joined substrate
pub(crate) struct NodeInstance {
    pub(crate) substrate: Arc<dyn MembershipSubstrate>,
    pub(crate) follower: FollowerHandle,
    pub(crate) master_rx: watch::Receiver<Option<MasterHandle>>,
    pub(crate) abdicate_rx: mpsc::UnboundedReceiver<()>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeInstance {
    /// Start all components once the node has joined the cluster
    pub(crate) async fn start(
        config: &EskkaConfig,
        runtime: NodeRuntime,
        store: Arc<dyn ClusterStateStore>,
        codec: Arc<dyn StateCodec>,
    ) -> Result<Self> {
        let NodeRuntime {
            substrate,
            transport,
            bus,
        } = runtime;

        let voting = Arc::new(VotingMembers::new(config.seed_addresses()?));
        if voting.len() < 3 {
            tracing::warn!(
                seeds = voting.len(),
                "fewer than 3 seed nodes configured; partition decisions will be fragile"
            );
        }

        wait_for_self_up(substrate.as_ref(), config.startup_timeout_range()).await?;

        let roles = substrate.self_roles();
        let self_address = substrate.self_address();
        tracing::info!(node = %self_address, ?roles, "joined the cluster");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let submit = SubmitUpdate::new(store);
        let mut tasks = Vec::new();

        tasks.push(Pinger::spawn(
            self_address.clone(),
            Arc::clone(&transport),
            &bus,
            shutdown_rx.clone(),
        ));

        let (follower, follower_task) = Follower::spawn(
            Arc::clone(&substrate),
            Arc::clone(&voting),
            Arc::clone(&transport),
            submit.clone(),
            Arc::clone(&codec),
            &bus,
            shutdown_rx.clone(),
        );
        tasks.push(follower_task);

        if roles.voter {
            tasks.push(
                PartitionMonitor::spawn(
                    Arc::clone(&substrate),
                    Arc::clone(&voting),
                    Arc::clone(&transport),
                    &bus,
                    config.eval_delay(),
                    config.ping_timeout(),
                    shutdown_rx.clone(),
                )
                .await,
            );
        }

        let (abdicate_tx, abdicate_rx) = mpsc::unbounded_channel();
        tasks.push(
            Abdicator::spawn(
                Arc::clone(&substrate),
                Arc::clone(&voting),
                config.abdication_window(),
                abdicate_tx,
                shutdown_rx.clone(),
            )
            .await,
        );

        let (master_tx, master_rx) = watch::channel(None);
        tasks.push(tokio::spawn(run_leader_watch(
            Arc::clone(&substrate),
            Arc::clone(&transport),
            submit,
            codec,
            follower.clone(),
            bus,
            config.publish_timeout(),
            shutdown_rx,
            master_tx,
        )));

        Ok(Self {
            substrate,
            follower,
            master_rx,
            abdicate_rx,
            shutdown_tx,
            tasks,
        })
    }

    /// Tear the instance down. A graceful stop announces the departure
    /// first; an abdication stop skips it (the cluster is unreachable
    /// anyway). Timeouts are logged and swallowed.
    pub(crate) async fn stop(mut self, graceful: bool) {
        if graceful {
            let mut events = self.substrate.subscribe().await;
            let self_address = self.substrate.self_address();
            match self.substrate.leave().await {
                Ok(()) => {
                    let removed = timeout(LEAVE_TIMEOUT, async {
                        while let Some(event) = events.recv().await {
                            if let MemberEvent::MemberRemoved(m) = event {
                                if m.address == self_address {
                                    return;
                                }
                            }
                        }
                    })
                    .await;
                    if removed.is_err() {
                        tracing::warn!("timed out waiting for departure confirmation");
                    }
                }
                Err(e) => tracing::warn!("leave failed: {e}"),
            }
        }

        let _ = self.shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
        for task in self.tasks.iter_mut() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if timeout(remaining, &mut *task).await.is_err() {
                tracing::warn!("component did not stop in time, aborting it");
                task.abort();
            }
        }
    }
}

/// Wait for this node's own MemberUp under a randomized startup timeout
async fn wait_for_self_up(
    substrate: &dyn MembershipSubstrate,
    (min, max): (Duration, Duration),
) -> Result<()> {
    let startup_timeout = if max > min {
        min + Duration::from_millis(rand::thread_rng().gen_range(0..=(max - min).as_millis() as u64))
    } else {
        min
    };

    let mut events = substrate.subscribe().await;
    let self_address = substrate.self_address();
    let joined = timeout(startup_timeout, async {
        while let Some(event) = events.recv().await {
            if let MemberEvent::MemberUp(m) = event {
                if m.address == self_address {
                    return true;
                }
            }
        }
        false
    })
    .await;

    match joined {
        Ok(true) => Ok(()),
        _ => Err(Error::StartupTimeout),
    }
}

/// Runs the master singleton exactly while this node is the oldest
/// master-eligible member. Exclusion across nodes is best-effort; the
/// version check in the state store arbitrates brief overlaps.
#[allow(clippy::too_many_arguments)]
async fn run_leader_watch(
    substrate: Arc<dyn MembershipSubstrate>,
    transport: Arc<dyn Transport>,
    submit: SubmitUpdate,
    codec: Arc<dyn StateCodec>,
    follower: FollowerHandle,
    bus: NodeBus,
    publish_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
    master_tx: watch::Sender<Option<MasterHandle>>,
) {
    let mut events = substrate.subscribe().await;
    let mut running: Option<(watch::Sender<bool>, JoinHandle<()>)> = None;
    let self_id = substrate.self_node_id();
    let master_eligible = substrate.self_roles().master_eligible;

    loop {
        let view = substrate.view().await;
        let is_leader = master_eligible
            && view
                .oldest_master_eligible()
                .map(|m| m.node_id == self_id)
                .unwrap_or(false);

        match (running.is_some(), is_leader) {
            (false, true) => {
                let (master_shutdown_tx, master_shutdown_rx) = watch::channel(false);
                let (handle, task) = Master::spawn(
                    Arc::clone(&substrate),
                    Arc::clone(&transport),
                    submit.clone(),
                    Arc::clone(&codec),
                    follower.clone(),
                    &bus,
                    publish_timeout,
                    master_shutdown_rx,
                );
                running = Some((master_shutdown_tx, task));
                let _ = master_tx.send(Some(handle));
            }
            (true, false) => {
                tracing::info!("no longer the oldest master-eligible member");
                let _ = master_tx.send(None);
                if let Some((stop, task)) = running.take() {
                    let _ = stop.send(true);
                    let _ = timeout(SHUTDOWN_TIMEOUT, task).await;
                }
            }
            _ => {}
        }

        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = events.recv() => {
                if event.is_none() {
                    break;
                }
            }
        }
    }

    let _ = master_tx.send(None);
    if let Some((stop, task)) = running.take() {
        let _ = stop.send(true);
        let _ = timeout(SHUTDOWN_TIMEOUT, task).await;
    }
}
