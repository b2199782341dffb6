//! Enforcement loop: a single consumer draining the coalesced policy-change
//! signal, walking each in-progress revision's plan against the cluster
//! drivers and persisting per-action progress as it goes.

use std::collections::BTreeMap;
use std::sync::Arc;

use ballast_apply::{apply_plan, collect_endpoints, DriverRegistry, EnforcerConfig};
use ballast_core::{BallastError, BallastResult, Generation};
use ballast_diff::Action;
use ballast_resolve::{DesiredState, InstanceKey};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::objects::{ActionProgress, RevisionStatus};
use crate::registry::Registry;

pub struct Enforcer {
    registry: Arc<Registry>,
    drivers: Arc<DriverRegistry>,
    cfg: EnforcerConfig,
}

impl Enforcer {
    pub fn new(registry: Arc<Registry>, drivers: Arc<DriverRegistry>, cfg: EnforcerConfig) -> Enforcer {
        Enforcer { registry, drivers, cfg }
    }

    /// Run until every sender of the signal channel is gone. Signals are
    /// coalesced upstream, so one wakeup may cover several policy changes;
    /// the loop always applies the latest in-progress revision.
    pub fn spawn(self, mut rx: mpsc::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("enforcement loop started");
            while rx.recv().await.is_some() {
                match self.enforce_once().await {
                    Ok(true) => counter!("enforce_runs_total", 1u64),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "enforcement pass failed"),
                }
            }
            info!("enforcement loop stopped");
        })
    }

    /// Apply the latest revision if it is still in progress. Returns whether
    /// any work was done.
    pub async fn enforce_once(&self) -> BallastResult<bool> {
        let Some(mut revision) = self.registry.get_revision(Generation::EMPTY)? else {
            return Ok(false);
        };
        if revision.status != RevisionStatus::InProgress {
            return Ok(false);
        }
        let desired = self.registry.get_desired_state(&revision)?.ok_or_else(|| {
            BallastError::Malformed(format!(
                "revision {} has no desired state blob",
                revision.generation()
            ))
        })?;
        let prev = match revision.generation() {
            Generation(g) if g > 1 => match self.registry.get_revision(Generation(g - 1))? {
                Some(prev_rev) => {
                    self.registry.get_desired_state(&prev_rev)?.unwrap_or_default()
                }
                None => DesiredState::default(),
            },
            _ => DesiredState::default(),
        };

        let (policy, _) = self.registry.get_policy(revision.policy_gen)?;
        let clusters = Registry::cluster_map(&policy);

        info!(
            rev = %revision.generation(),
            policy_gen = %revision.policy_gen,
            actions = revision.plan.len(),
            "applying revision"
        );

        let plan = revision.plan.clone();
        let mut progress = revision.progress.clone();
        let registry = Arc::clone(&self.registry);
        let revision_meta = revision.clone();
        let outcome = apply_plan(
            &plan,
            &desired,
            &prev,
            &clusters,
            &self.drivers,
            &self.cfg,
            |idx, status| {
                progress[idx] = ActionProgress::from(status);
                // time bookkeeping rides on successful time actions
                if let (Action::UpdateComponentTimes { key }, ActionProgress::Success) =
                    (&plan.actions[idx], &progress[idx])
                {
                    if let Err(e) = registry.record_component_times(key) {
                        warn!(instance = %key, error = %e, "recording component times failed");
                    }
                }
                // persist progress after every outcome
                let mut snapshot = revision_meta.clone();
                snapshot.progress = progress.clone();
                if let Err(e) = registry.update_revision(&mut snapshot) {
                    warn!(error = %e, "persisting revision progress failed");
                }
            },
        )
        .await;

        revision.progress = progress;
        revision.status = if outcome.failed() == 0 {
            RevisionStatus::Completed
        } else {
            RevisionStatus::Error
        };
        self.registry.update_revision(&mut revision)?;
        info!(
            rev = %revision.generation(),
            status = ?revision.status,
            failed = outcome.failed(),
            skipped = outcome.skipped(),
            "revision applied"
        );
        Ok(true)
    }

    /// Externally visible endpoints of the latest applied desired state.
    pub async fn endpoints(&self) -> BallastResult<BTreeMap<InstanceKey, Vec<String>>> {
        let Some(revision) = self.registry.get_revision(Generation::EMPTY)? else {
            return Ok(BTreeMap::new());
        };
        let Some(desired) = self.registry.get_desired_state(&revision)? else {
            return Ok(BTreeMap::new());
        };
        let (policy, _) = self.registry.get_policy(revision.policy_gen)?;
        let clusters = Registry::cluster_map(&policy);
        collect_endpoints(&desired, &clusters, &self.drivers).await
    }
}
