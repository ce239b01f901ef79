//! Ties oracle upcalls (§ oracle) and inbound `ROUTE_INVALIDATE` requests
//! (§ request) to the kernel/firewall effectors and the peer-set manager.
//! Not a separate task: the main loop drives [`Reconciler::poll_due`] and
//! drains [`Reconciler::take_invalidation_requests`] itself.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::firewall::IptablesOps;
use crate::kernel::NetworkTableOps;
use crate::oracle::{OracleClient, PeriodicUpdater};
use crate::peerset::PeerSetManager;
use crate::request::InvalidationHandler;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Oracle(#[from] crate::oracle::Error),
}

/// Forwards `ROUTE_INVALIDATE` notices from the (synchronous) request
/// processor into the reconciler's queue without blocking the caller.
pub struct InvalidationSender(mpsc::UnboundedSender<String>);

impl InvalidationHandler for InvalidationSender {
    fn invalidate(&self, cluster: &str) {
        // A full receiver (the daemon has shut down) just drops the notice.
        let _ = self.0.send(cluster.to_string());
    }
}

pub struct Reconciler {
    updaters: HashMap<String, PeriodicUpdater>,
    invalidations: mpsc::UnboundedReceiver<String>,
}

impl Reconciler {
    pub fn new() -> (Self, InvalidationSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Reconciler { updaters: HashMap::new(), invalidations: rx }, InvalidationSender(tx))
    }

    pub fn register_cluster(&mut self, cluster: String, updater: PeriodicUpdater) {
        self.updaters.insert(cluster, updater);
    }

    pub fn known_clusters(&self) -> Vec<String> {
        self.updaters.keys().cloned().collect()
    }

    /// Earliest deadline across every registered cluster's timers.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.updaters.values().map(|u| u.next_wakeup()).min()
    }

    /// Runs every timer that is due, across every cluster.
    pub async fn poll_due(
        &mut self,
        now: Instant,
        oracle: &dyn OracleClient,
        kernel: &dyn NetworkTableOps,
        peerset: &mut PeerSetManager,
        firewall: &dyn IptablesOps,
    ) -> Result<(), Error> {
        for updater in self.updaters.values_mut() {
            updater.poll_due(now, oracle, kernel, peerset, firewall).await?;
        }
        Ok(())
    }

    /// Drains pending `ROUTE_INVALIDATE` notices. A notice for any single
    /// cluster forces an immediate instance-table refresh for *every*
    /// registered cluster, not just the one named in the notice, matching
    /// the original's `_RouteInvalidate` looping over every updater.
    pub async fn drain_invalidations(
        &mut self,
        oracle: &dyn OracleClient,
        kernel: &dyn NetworkTableOps,
    ) -> Result<(), Error> {
        let mut drained = false;
        while self.invalidations.try_recv().is_ok() {
            drained = true;
        }
        if !drained {
            return Ok(());
        }
        for updater in self.updaters.values_mut() {
            updater.force_refresh_instances(oracle, kernel).await?;
        }
        Ok(())
    }

    /// Resolves once at least one invalidation notice is queued, so the
    /// main loop can `select!` on it alongside the timer deadlines.
    pub async fn wait_for_invalidation(&mut self) -> String {
        self.invalidations.recv().await.unwrap_or_default()
    }
}
