//! Drift reconciliation over all tracked resources
//!
//! A pass walks the manifest, overlay and chart stores in that order. In
//! incremental mode each record's current fingerprint is recomputed (file
//! contents, fresh overlay build, fresh chart rendering) and the resource is
//! re-applied only when it differs from the stored one. A forced pass
//! re-applies everything.
//!
//! Passes are fail-fast: the first error aborts the pass and is returned.
//! Resources re-applied earlier in the same pass stay applied. Only one pass
//! runs at a time; a second caller gets [`Error::ReconcileInProgress`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::hasher::Fingerprint;
use crate::store::{Mechanism, ResourceRecord};
use crate::{Error, Result};

/// What the reconciler needs from one deployment mechanism
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TrackedMechanism: Send + Sync {
    /// Which mechanism this is
    fn mechanism(&self) -> Mechanism;

    /// Records currently tracked, read fresh from the store
    async fn tracked(&self) -> Result<Vec<ResourceRecord>>;

    /// Fingerprint of the resource's source as it is now
    async fn current_fingerprint(&self, record: &ResourceRecord) -> Result<Fingerprint>;

    /// Apply the resource again and update its stored fingerprint
    async fn reapply(&self, record: &ResourceRecord) -> Result<()>;
}

/// Reconciliation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Re-apply only resources whose fingerprint changed
    Incremental,
    /// Re-apply every tracked resource
    Forced,
}

impl Mode {
    /// Mode from the `forced` flag of an update request
    pub fn from_forced(forced: bool) -> Self {
        if forced {
            Mode::Forced
        } else {
            Mode::Incremental
        }
    }
}

/// Outcome of a completed pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Resources that were re-applied
    pub applied: Vec<(Mechanism, String)>,
    /// Resources whose fingerprint matched
    pub unchanged: Vec<(Mechanism, String)>,
}

impl ReconcileReport {
    /// One-line summary for the update reply
    pub fn summary(&self) -> String {
        if self.applied.is_empty() {
            return format!("{} resources unchanged", self.unchanged.len());
        }
        let applied: Vec<&str> = self.applied.iter().map(|(_, id)| id.as_str()).collect();
        format!(
            "updated {}; {} unchanged",
            applied.join(", "),
            self.unchanged.len()
        )
    }
}

/// Runs reconciliation passes over a fixed set of mechanisms
pub struct Reconciler {
    mechanisms: Vec<Arc<dyn TrackedMechanism>>,
    in_flight: Mutex<()>,
}

impl Reconciler {
    /// Reconciler over `mechanisms`, processed in the given order
    pub fn new(mechanisms: Vec<Arc<dyn TrackedMechanism>>) -> Self {
        Self {
            mechanisms,
            in_flight: Mutex::new(()),
        }
    }

    /// Run one pass
    #[instrument(skip(self))]
    pub async fn run(&self, mode: Mode) -> Result<ReconcileReport> {
        let _guard = self
            .in_flight
            .try_lock()
            .map_err(|_| Error::ReconcileInProgress)?;

        let mut report = ReconcileReport::default();
        for mechanism in &self.mechanisms {
            self.reconcile_mechanism(mechanism.as_ref(), mode, &mut report)
                .await?;
        }

        info!(
            applied = report.applied.len(),
            unchanged = report.unchanged.len(),
            "update pass complete"
        );
        Ok(report)
    }

    /// Run an incremental pass every `interval` until `shutdown` fires
    ///
    /// A tick that finds another pass in flight is skipped. Failures are
    /// logged and the schedule continues.
    pub async fn run_every(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; start one interval from now.
        ticker.tick().await;

        info!(interval_secs = interval.as_secs(), "scheduled updates enabled");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.run(Mode::Incremental).await {
                    Ok(report) => debug!(summary = %report.summary(), "scheduled update finished"),
                    Err(Error::ReconcileInProgress) => debug!("update pass already running, skipping tick"),
                    Err(e) => warn!(error = %e, "scheduled update failed"),
                },
            }
        }
        info!("scheduled updates stopped");
    }

    async fn reconcile_mechanism(
        &self,
        mechanism: &dyn TrackedMechanism,
        mode: Mode,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let kind = mechanism.mechanism();
        for record in mechanism.tracked().await? {
            let changed = match mode {
                Mode::Forced => true,
                Mode::Incremental => {
                    mechanism.current_fingerprint(&record).await? != record.fingerprint
                }
            };

            if changed {
                info!(mechanism = %kind, identity = %record.identity, ?mode, "updating");
                mechanism.reapply(&record).await?;
                report.applied.push((kind, record.identity));
            } else {
                info!(mechanism = %kind, identity = %record.identity, "has not changed, ignoring");
                report.unchanged.push((kind, record.identity));
            }
        }
        Ok(())
    }
}
