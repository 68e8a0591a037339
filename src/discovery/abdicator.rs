//! Abdicator
//!
//! Watches the quorum flag over membership events. A loss that persists
//! for the observation window means this node is on the wrong side of a
//! partition (or the cluster collapsed); the only recovery is to tear the
//! local instance down and rebuild it from scratch through the restart
//! hook, picking up a fresh node identity on the way.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::membership::{MembershipSubstrate, VotingMembers};

pub struct Abdicator {
    substrate: Arc<dyn MembershipSubstrate>,
    voting: Arc<VotingMembers>,
    events: mpsc::UnboundedReceiver<crate::membership::MemberEvent>,
    window_tx: mpsc::UnboundedSender<u64>,
    window_rx: mpsc::UnboundedReceiver<u64>,
    shutdown: watch::Receiver<bool>,
    window: Duration,
    /// Signals the lifecycle supervisor to restart the whole instance
    abdicate_tx: mpsc::UnboundedSender<()>,
    quorum_last: bool,
    pending_window: Option<u64>,
    generation: u64,
}

impl Abdicator {
    pub async fn spawn(
        substrate: Arc<dyn MembershipSubstrate>,
        voting: Arc<VotingMembers>,
        window: Duration,
        abdicate_tx: mpsc::UnboundedSender<()>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let events = substrate.subscribe().await;
        let (window_tx, window_rx) = mpsc::unbounded_channel();
        let abdicator = Self {
            substrate,
            voting,
            events,
            window_tx,
            window_rx,
            shutdown,
            window,
            abdicate_tx,
            quorum_last: true,
            pending_window: None,
            generation: 0,
        };
        tokio::spawn(abdicator.run())
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
                        Some(_) => self.on_membership_change().await,
                        None => break,
                    }
                }
                generation = self.window_rx.recv() => {
                    if let Some(generation) = generation {
                        self.on_window_expired(generation).await;
                    }
                }
            }
        }
    }

    async fn on_membership_change(&mut self) {
        let view = self.substrate.view().await;
        let cur = self.voting.quorum_available(&view);

        if !cur && self.quorum_last {
            self.generation += 1;
            let generation = self.generation;
            self.pending_window = Some(generation);
            tracing::warn!(
                window = ?self.window,
                "seed quorum lost, starting abdication window"
            );
            let tx = self.window_tx.clone();
            let window = self.window;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let _ = tx.send(generation);
            });
        } else if cur && !self.quorum_last {
            if self.pending_window.take().is_some() {
                tracing::info!("seed quorum recovered within the abdication window");
            }
        }

        self.quorum_last = cur;
    }

    async fn on_window_expired(&mut self, generation: u64) {
        if self.pending_window != Some(generation) {
            return;
        }
        self.pending_window = None;

        let view = self.substrate.view().await;
        if self.voting.quorum_available(&view) {
            return;
        }

        tracing::error!("seed quorum lost beyond the observation window, abdicating");
        let _ = self.abdicate_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::sim::SimNet;
    use crate::membership::{Address, Roles};
    use tokio::time::timeout as tokio_timeout;

    fn addr(n: u16) -> Address {
        Address::new(format!("seed-{n}"), 9400)
    }

    fn voting() -> Arc<VotingMembers> {
        Arc::new(VotingMembers::new([addr(1), addr(2), addr(3)]))
    }

    fn roles() -> Roles {
        Roles {
            master_eligible: true,
            voter: true,
        }
    }

    #[tokio::test]
    async fn test_sustained_quorum_loss_triggers_abdication() {
        let net = SimNet::new();
        let s1 = net.join(addr(1), roles()).await;
        let _s2 = net.join(addr(2), roles()).await;
        let _s3 = net.join(addr(3), roles()).await;

        let (abdicate_tx, mut abdicate_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        Abdicator::spawn(
            s1.clone(),
            voting(),
            Duration::from_millis(100),
            abdicate_tx,
            shutdown_rx,
        )
        .await;

        net.cut_link(&addr(1), &addr(2)).await;
        net.cut_link(&addr(1), &addr(3)).await;

        tokio_timeout(Duration::from_secs(5), abdicate_rx.recv())
            .await
            .expect("no abdication signal")
            .unwrap();
    }

    #[tokio::test]
    async fn test_quorum_recovery_within_window_cancels_abdication() {
        let net = SimNet::new();
        let s1 = net.join(addr(1), roles()).await;
        let _s2 = net.join(addr(2), roles()).await;
        let _s3 = net.join(addr(3), roles()).await;

        let (abdicate_tx, mut abdicate_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        Abdicator::spawn(
            s1.clone(),
            voting(),
            Duration::from_millis(300),
            abdicate_tx,
            shutdown_rx,
        )
        .await;

        net.cut_link(&addr(1), &addr(2)).await;
        net.cut_link(&addr(1), &addr(3)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        net.heal_link(&addr(1), &addr(2)).await;
        net.heal_link(&addr(1), &addr(3)).await;

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(abdicate_rx.try_recv().is_err(), "abdicated despite recovery");
    }
}
