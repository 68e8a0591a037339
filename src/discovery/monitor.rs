//! Partition Monitor
//!
//! Runs on voter (seed) members only and decides when an unreachable node
//! is forcibly downed. Every downing requires affirmative evidence: a
//! quorum of registered voters must each report that their own probe of
//! the target timed out. Silence, probe failures, and successful pings
//! never count, so plain message loss cannot satisfy the quorum. The
//! unlucky side of a partition reaches the same verdict about itself by
//! symmetry and is downed by its peers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::discovery::protocol::WireMessage;
use crate::membership::{
    Address, MemberEvent, MemberStatus, MembershipSubstrate, VotingMembers,
};
use crate::transport::{Endpoint, Envelope, NodeBus, Transport};

#[derive(Debug)]
enum MonitorInternal {
    EnrollVoter(Address),
    RegistrationTimeout { probe_id: u64 },
    Evaluate(Address),
    EvaluateTimeout { target: Address, req_id: u64 },
}

/// One in-flight downing evaluation
struct PendingEval {
    req_id: u64,
    /// Vote slot per registered voter: None until the voter answered,
    /// then whether it affirmed a timeout
    votes: HashMap<Address, Option<bool>>,
}

pub struct PartitionMonitor {
    substrate: Arc<dyn MembershipSubstrate>,
    voting: Arc<VotingMembers>,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedReceiver<MemberEvent>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    self_tx: mpsc::UnboundedSender<MonitorInternal>,
    self_rx: mpsc::UnboundedReceiver<MonitorInternal>,
    shutdown: watch::Receiver<bool>,
    eval_delay: Duration,
    ping_timeout: Duration,
    franchised: BTreeSet<Address>,
    registered: BTreeSet<Address>,
    unreachable: BTreeSet<Address>,
    pending_eval: HashMap<Address, PendingEval>,
    pending_registration: HashMap<u64, Address>,
    next_id: u64,
}

impl PartitionMonitor {
    pub async fn spawn(
        substrate: Arc<dyn MembershipSubstrate>,
        voting: Arc<VotingMembers>,
        transport: Arc<dyn Transport>,
        bus: &NodeBus,
        eval_delay: Duration,
        ping_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let events = substrate.subscribe().await;
        let inbox = bus.register(Endpoint::Monitor);
        let (self_tx, self_rx) = mpsc::unbounded_channel();
        let monitor = Self {
            substrate,
            voting,
            transport,
            events,
            inbox,
            self_tx,
            self_rx,
            shutdown,
            eval_delay,
            ping_timeout,
            franchised: BTreeSet::new(),
            registered: BTreeSet::new(),
            unreachable: BTreeSet::new(),
            pending_eval: HashMap::new(),
            pending_registration: HashMap::new(),
            next_id: 0,
        };
        tokio::spawn(monitor.run())
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.on_event(event).await,
                        None => break,
                    }
                }
                env = self.inbox.recv() => {
                    match env {
                        Some(env) => self.on_message(env),
                        None => break,
                    }
                }
                msg = self.self_rx.recv() => {
                    if let Some(msg) = msg {
                        self.on_internal(msg).await;
                    }
                }
            }
        }
    }

    fn schedule(&self, delay: Duration, msg: MonitorInternal) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg);
        });
    }

    async fn on_event(&mut self, event: MemberEvent) {
        match event {
            MemberEvent::MemberUp(m) => {
                if self.voting.contains(&m.address) {
                    tracing::debug!(voter = %m.address, "seed member up, enrolling its pinger");
                    self.franchised.insert(m.address.clone());
                    let _ = self.self_tx.send(MonitorInternal::EnrollVoter(m.address));
                }
            }
            MemberEvent::MemberExited(m) | MemberEvent::MemberRemoved(m) => {
                self.forget(&m.address);
            }
            MemberEvent::Unreachable(m) => {
                if !matches!(m.status, MemberStatus::Down | MemberStatus::Exiting) {
                    tracing::debug!(node = %m.address, "member unreachable, scheduling evaluation");
                    self.unreachable.insert(m.address.clone());
                    self.schedule(self.eval_delay, MonitorInternal::Evaluate(m.address));
                }
            }
            MemberEvent::Reachable(m) => {
                self.unreachable.remove(&m.address);
                if self.pending_eval.remove(&m.address).is_some() {
                    tracing::debug!(node = %m.address, "member reachable again, evaluation cancelled");
                }
            }
        }
    }

    fn forget(&mut self, address: &Address) {
        self.franchised.remove(address);
        self.registered.remove(address);
        self.unreachable.remove(address);
        self.pending_eval.remove(address);
        self.pending_registration.retain(|_, a| a != address);
    }

    fn on_message(&mut self, env: Envelope) {
        match env.msg {
            WireMessage::ProbeReply { probe_id } => {
                if let Some(addr) = self.pending_registration.remove(&probe_id) {
                    if self.franchised.contains(&addr) {
                        tracing::debug!(voter = %addr, "voter pinger registered");
                        self.registered.insert(addr);
                    }
                }
            }
            WireMessage::PingOk { req_id, voter } => self.on_ping_response(req_id, voter, false),
            WireMessage::PingTimeout { req_id, voter } => {
                self.on_ping_response(req_id, voter, true)
            }
            other => {
                tracing::trace!(msg = other.type_name(), "monitor ignoring message");
            }
        }
    }

    fn on_ping_response(&mut self, req_id: u64, voter: Address, timed_out: bool) {
        for eval in self.pending_eval.values_mut() {
            if eval.req_id == req_id {
                if let Some(slot) = eval.votes.get_mut(&voter) {
                    if slot.is_none() {
                        *slot = Some(timed_out);
                    }
                }
                return;
            }
        }
        tracing::trace!(req_id, "ping response for a finished evaluation");
    }

    async fn on_internal(&mut self, msg: MonitorInternal) {
        match msg {
            MonitorInternal::EnrollVoter(addr) => self.on_enroll(addr).await,
            MonitorInternal::RegistrationTimeout { probe_id } => {
                if let Some(addr) = self.pending_registration.remove(&probe_id) {
                    tracing::debug!(voter = %addr, "voter pinger resolution timed out, will retry");
                    self.schedule(self.eval_delay, MonitorInternal::EnrollVoter(addr));
                }
            }
            MonitorInternal::Evaluate(target) => self.on_evaluate(target).await,
            MonitorInternal::EvaluateTimeout { target, req_id } => {
                self.on_evaluate_timeout(target, req_id).await;
            }
        }
    }

    async fn on_enroll(&mut self, addr: Address) {
        if !self.franchised.contains(&addr) || self.registered.contains(&addr) {
            return;
        }
        if self.pending_registration.values().any(|a| a == &addr) {
            return;
        }
        self.next_id += 1;
        let probe_id = self.next_id;
        self.pending_registration.insert(probe_id, addr.clone());
        let _ = self
            .transport
            .send(
                &addr,
                Endpoint::Pinger,
                WireMessage::Probe {
                    probe_id,
                    origin: self.substrate.self_address(),
                    reply_to: Endpoint::Monitor,
                },
            )
            .await;
        self.schedule(
            self.ping_timeout,
            MonitorInternal::RegistrationTimeout { probe_id },
        );
    }

    async fn on_evaluate(&mut self, target: Address) {
        let view = self.substrate.view().await;
        if !view.unreachable.contains(&target) || view.member_at(&target).is_none() {
            self.unreachable.remove(&target);
            return;
        }
        if self.pending_eval.contains_key(&target) {
            return;
        }
        self.unreachable.insert(target.clone());

        self.next_id += 1;
        let req_id = self.next_id;
        let votes: HashMap<Address, Option<bool>> = self
            .registered
            .iter()
            .cloned()
            .map(|voter| (voter, None))
            .collect();

        tracing::info!(%target, voters = votes.len(), "evaluating unreachable node");
        for voter in self.registered.clone() {
            let _ = self
                .transport
                .send(
                    &voter,
                    Endpoint::Pinger,
                    WireMessage::PingRequest {
                        req_id,
                        origin: self.substrate.self_address(),
                        target: target.clone(),
                        timeout_ms: self.ping_timeout.as_millis() as u64,
                    },
                )
                .await;
        }

        self.pending_eval
            .insert(target.clone(), PendingEval { req_id, votes });
        // receipt fudge: a quarter on top of the voters' own timers
        self.schedule(
            self.ping_timeout + self.ping_timeout / 4,
            MonitorInternal::EvaluateTimeout { target, req_id },
        );
    }

    async fn on_evaluate_timeout(&mut self, target: Address, req_id: u64) {
        match self.pending_eval.get(&target) {
            Some(eval) if eval.req_id == req_id => {}
            _ => return,
        }
        let eval = self
            .pending_eval
            .remove(&target)
            .expect("pending evaluation checked above");
        // forget; the failure detector re-adds it if still unreachable
        self.unreachable.remove(&target);

        let affirmed: Vec<Address> = eval
            .votes
            .iter()
            .filter(|(_, vote)| **vote == Some(true))
            .map(|(voter, _)| voter.clone())
            .collect();

        if affirmed.len() >= self.voting.quorum_size() {
            tracing::warn!(
                %target,
                voters = ?affirmed.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
                "downing node: unreachable affirmed by a quorum of voters"
            );
            if let Err(e) = self.substrate.down(&target).await {
                tracing::warn!(%target, "downing failed: {e}");
            }
        } else {
            tracing::debug!(
                %target,
                affirmed = affirmed.len(),
                required = self.voting.quorum_size(),
                "no downing quorum, re-evaluating"
            );
            self.schedule(self.eval_delay, MonitorInternal::Evaluate(target));
        }
    }
}
