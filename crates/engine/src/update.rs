//! The policy update flow: compose, validate, resolve, diff, persist,
//! signal. The whole sequence runs under one mutex so writers serialize;
//! readers never touch it.

use std::sync::{Arc, Mutex};

use ballast_core::{BallastResult, Generation};
use ballast_diff::diff;
use ballast_policy::{PolicyObject, User};
use ballast_resolve::{
    DesiredState, EventEntry, EventLevel, EventLog, ExternalData, Resolver,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::registry::Registry;

/// Options for one update/delete request.
#[derive(Debug, Clone, Copy)]
pub struct UpdateOpts {
    /// Compute and return the plan without persisting anything.
    pub noop: bool,
    pub log_level: EventLevel,
}

impl Default for UpdateOpts {
    fn default() -> UpdateOpts {
        UpdateOpts { noop: false, log_level: EventLevel::Info }
    }
}

/// What an update request reports back: the new policy generation, whether
/// anything changed, which revision to wait for, the plan preview, and the
/// resolution event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyUpdateResult {
    pub policy_generation: Generation,
    pub policy_changed: bool,
    pub wait_for_revision: Option<Generation>,
    pub plan_as_text: String,
    pub event_log: Vec<EventEntry>,
}

/// Serializes policy/revision mutation and owns the enforcement signal.
pub struct PolicyUpdater {
    registry: Arc<Registry>,
    external: Arc<dyn ExternalData>,
    update_mutex: Mutex<()>,
    enforcement_tx: mpsc::Sender<()>,
}

impl PolicyUpdater {
    /// Returns the updater plus the receiving end of the enforcement signal
    /// channel (unit capacity; senders coalesce).
    pub fn new(
        registry: Arc<Registry>,
        external: Arc<dyn ExternalData>,
    ) -> (PolicyUpdater, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (
            PolicyUpdater { registry, external, update_mutex: Mutex::new(()), enforcement_tx: tx },
            rx,
        )
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Submit objects into the policy.
    pub fn apply_changes(
        &self,
        objects: Vec<PolicyObject>,
        user: &User,
        opts: UpdateOpts,
    ) -> BallastResult<PolicyUpdateResult> {
        self.change_policy(objects, user, opts, false)
    }

    /// Remove objects from the policy.
    pub fn delete_objects(
        &self,
        objects: Vec<PolicyObject>,
        user: &User,
        opts: UpdateOpts,
    ) -> BallastResult<PolicyUpdateResult> {
        self.change_policy(objects, user, opts, true)
    }

    fn change_policy(
        &self,
        mut objects: Vec<PolicyObject>,
        user: &User,
        opts: UpdateOpts,
        delete: bool,
    ) -> BallastResult<PolicyUpdateResult> {
        // the entire compose-validate-resolve-diff-persist-publish sequence
        // holds this mutex
        let _guard = self.update_mutex.lock().unwrap();

        let (policy, policy_gen) = self.registry.get_policy(Generation::EMPTY)?;
        let prev_desired = match self.registry.get_last_revision(policy_gen)? {
            Some(revision) => {
                self.registry.get_desired_state(&revision)?.unwrap_or_default()
            }
            None => DesiredState::default(),
        };

        // ACL rules first on update so later objects are checked against
        // them; last on delete so revoking them comes after everything they
        // still guard
        objects.sort_by_key(|o| acl_weight(o));
        if delete {
            objects.reverse();
        }

        let mut updated = policy.clone();
        for obj in &objects {
            updated.view(user).manage_object(obj)?;
            if delete {
                updated.remove_object(obj.kind(), obj.name(), obj.namespace());
            } else {
                updated.add_object(obj.clone())?;
            }
        }
        updated.validate()?;

        let mut log = EventLog::new(opts.log_level);
        let mut desired =
            Resolver::new(&updated, self.external.as_ref()).resolve_all(policy_gen, &mut log);
        desired.validate(&updated, self.external.as_ref())?;

        let plan = diff(&desired, &prev_desired);
        debug!(actions = plan.len(), noop = opts.noop, "plan computed");

        if opts.noop {
            return Ok(PolicyUpdateResult {
                policy_generation: policy_gen,
                policy_changed: false,
                wait_for_revision: None,
                plan_as_text: plan.as_text(),
                event_log: log.entries().to_vec(),
            });
        }

        let (changed, policy_data) = if delete {
            self.registry.delete_from_policy(&objects)?
        } else {
            self.registry.update_policy(&objects)?
        };

        let mut wait_for_revision = None;
        if changed {
            desired.policy_gen = policy_data.generation();
            let revision =
                self.registry.new_revision(policy_data.generation(), &desired, plan.clone())?;
            wait_for_revision = Some(revision.generation());
            // coalesced: a queued signal already covers this change
            let _ = self.enforcement_tx.try_send(());
            info!(
                policy_gen = %policy_data.generation(),
                rev = %revision.generation(),
                "policy changed; enforcement signalled"
            );
        }

        Ok(PolicyUpdateResult {
            policy_generation: policy_data.generation(),
            policy_changed: changed,
            wait_for_revision,
            plan_as_text: plan.as_text(),
            event_log: log.entries().to_vec(),
        })
    }
}

fn acl_weight(obj: &PolicyObject) -> u8 {
    match obj {
        PolicyObject::AclRule(_) => 0,
        _ => 1,
    }
}
