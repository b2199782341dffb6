//! Ballast apply: cluster driver contract and the action-plan executor.
//!
//! Create/Update/Delete dispatch to the driver selected by the target
//! cluster's type, with a per-call deadline and bounded exponential backoff.
//! Attach/Detach and time bookkeeping are graph-side actions recorded without
//! a driver call. A failed create poisons its dependents, which are skipped
//! rather than attempted against a half-built subtree.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use ballast_core::{BallastError, BallastResult};
use ballast_diff::{Action, ActionPlan};
use ballast_policy::Cluster;
use ballast_resolve::{ComponentInstance, DesiredState, InstanceKey};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Observed state of one instance on a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    Ready,
    Progressing,
    Absent,
}

/// Cluster driver plugin contract. Implementations talk to a real
/// orchestrator; the core only relies on this surface.
#[async_trait::async_trait]
pub trait ClusterDriver: Send + Sync {
    /// Cheap connectivity/config check, used when a cluster object is
    /// submitted.
    async fn validate(&self) -> BallastResult<()>;

    /// Apply one lifecycle action for an instance.
    async fn apply(&self, action: &Action, instance: &ComponentInstance) -> BallastResult<()>;

    /// Current status of an instance.
    async fn status(&self, instance: &ComponentInstance) -> BallastResult<InstanceStatus>;

    /// Externally visible endpoints of an instance.
    async fn endpoints(&self, instance: &ComponentInstance) -> BallastResult<Vec<String>>;
}

/// Driver selection by `cluster.type`.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn ClusterDriver>>,
}

impl DriverRegistry {
    pub fn new() -> DriverRegistry {
        DriverRegistry::default()
    }

    pub fn register(&mut self, cluster_type: &str, driver: Arc<dyn ClusterDriver>) {
        self.drivers.insert(cluster_type.to_string(), driver);
    }

    pub fn for_cluster(&self, cluster: &Cluster) -> BallastResult<Arc<dyn ClusterDriver>> {
        self.drivers.get(&cluster.cluster_type).cloned().ok_or_else(|| {
            BallastError::FatalDriver(format!(
                "no driver registered for cluster type {}",
                cluster.cluster_type
            ))
        })
    }
}

/// In-memory driver that records what it was asked to do. Failure injection
/// by instance key makes retry/skip behavior testable.
#[derive(Default)]
pub struct NoopDriver {
    pub applied: Mutex<Vec<(String, String)>>,
    /// Instance keys that fail terminally.
    pub fatal_instances: Mutex<BTreeSet<String>>,
    /// Instance keys that fail `n` times before succeeding.
    pub flaky_instances: Mutex<BTreeMap<String, u32>>,
    pub endpoints_by_component: Mutex<BTreeMap<String, Vec<String>>>,
}

impl NoopDriver {
    pub fn new() -> NoopDriver {
        NoopDriver::default()
    }

    pub fn applied_actions(&self) -> Vec<(String, String)> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ClusterDriver for NoopDriver {
    async fn validate(&self) -> BallastResult<()> {
        Ok(())
    }

    async fn apply(&self, action: &Action, instance: &ComponentInstance) -> BallastResult<()> {
        let key = instance.key.0.clone();
        if self.fatal_instances.lock().unwrap().contains(&key) {
            return Err(BallastError::FatalDriver(format!("injected fatal failure for {}", key)));
        }
        {
            let mut flaky = self.flaky_instances.lock().unwrap();
            if let Some(left) = flaky.get_mut(&key) {
                if *left > 0 {
                    *left -= 1;
                    return Err(BallastError::Cancelled);
                }
            }
        }
        let verb = match action {
            Action::Create { .. } => "create",
            Action::Update { .. } => "update",
            Action::Delete { .. } => "delete",
            _ => "other",
        };
        self.applied.lock().unwrap().push((verb.to_string(), key));
        Ok(())
    }

    async fn status(&self, _instance: &ComponentInstance) -> BallastResult<InstanceStatus> {
        Ok(InstanceStatus::Ready)
    }

    async fn endpoints(&self, instance: &ComponentInstance) -> BallastResult<Vec<String>> {
        Ok(self
            .endpoints_by_component
            .lock()
            .unwrap()
            .get(&instance.component)
            .cloned()
            .unwrap_or_default())
    }
}

/// Executor tuning. Defaults: 30s per driver call, backoff capped at 30s,
/// five attempts per action.
#[derive(Debug, Clone)]
pub struct EnforcerConfig {
    pub driver_timeout_secs: u64,
    pub backoff_max_secs: u64,
    pub max_attempts: u32,
}

impl Default for EnforcerConfig {
    fn default() -> EnforcerConfig {
        EnforcerConfig { driver_timeout_secs: 30, backoff_max_secs: 30, max_attempts: 5 }
    }
}

impl EnforcerConfig {
    pub fn from_env() -> EnforcerConfig {
        let mut cfg = EnforcerConfig::default();
        if let Some(v) =
            std::env::var("BALLAST_DRIVER_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok())
        {
            cfg.driver_timeout_secs = v;
        }
        if let Some(v) =
            std::env::var("BALLAST_ACTION_BACKOFF_MAX_SECS").ok().and_then(|s| s.parse().ok())
        {
            cfg.backoff_max_secs = v;
        }
        if let Some(v) = std::env::var("BALLAST_ACTION_ATTEMPTS").ok().and_then(|s| s.parse().ok())
        {
            cfg.max_attempts = v;
        }
        cfg
    }
}

/// Terminal state of one plan action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ActionStatus {
    Success,
    Failed { message: String },
    Skipped,
}

/// Per-action outcomes, aligned with the plan's action order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanOutcome {
    pub statuses: Vec<ActionStatus>,
}

impl PlanOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.statuses.iter().all(|s| *s == ActionStatus::Success)
    }

    pub fn failed(&self) -> usize {
        self.statuses.iter().filter(|s| matches!(s, ActionStatus::Failed { .. })).count()
    }

    pub fn skipped(&self) -> usize {
        self.statuses.iter().filter(|s| matches!(s, ActionStatus::Skipped)).count()
    }
}

/// Walk a plan in order, dispatching driver actions and reporting every
/// outcome through `on_status` (the caller persists progress after each).
/// Individual failures do not abort the plan; dependents of a failed create
/// are skipped.
pub async fn apply_plan(
    plan: &ActionPlan,
    new: &DesiredState,
    prev: &DesiredState,
    clusters: &BTreeMap<String, Cluster>,
    drivers: &DriverRegistry,
    cfg: &EnforcerConfig,
    mut on_status: impl FnMut(usize, &ActionStatus),
) -> PlanOutcome {
    let mut outcome = PlanOutcome::default();
    let mut poisoned: BTreeSet<InstanceKey> = BTreeSet::new();

    for (idx, action) in plan.actions.iter().enumerate() {
        let status = run_action(action, new, prev, clusters, drivers, cfg, &mut poisoned).await;
        if let ActionStatus::Failed { .. } = &status {
            counter!("apply_action_failures_total", 1u64);
            if matches!(action, Action::Create { .. }) {
                poisoned.insert(action.key().clone());
            }
        }
        counter!("apply_actions_total", 1u64);
        on_status(idx, &status);
        outcome.statuses.push(status);
    }

    info!(
        actions = plan.len(),
        failed = outcome.failed(),
        skipped = outcome.skipped(),
        "plan walk finished"
    );
    outcome
}

async fn run_action(
    action: &Action,
    new: &DesiredState,
    prev: &DesiredState,
    clusters: &BTreeMap<String, Cluster>,
    drivers: &DriverRegistry,
    cfg: &EnforcerConfig,
    poisoned: &mut BTreeSet<InstanceKey>,
) -> ActionStatus {
    // skip anything touching the subtree of a failed create
    let skip = match action {
        Action::Create { key } | Action::Update { key } | Action::UpdateComponentTimes { key } => {
            depends_on_poisoned(key, new, poisoned)
        }
        Action::AttachDependency { source, target } => {
            poisoned.contains(source)
                || poisoned.contains(target)
                || depends_on_poisoned(source, new, poisoned)
        }
        Action::Delete { .. } | Action::DetachDependency { .. } => false,
    };
    if skip {
        if let Action::Create { key } = action {
            // skipped creates poison their own dependents too
            poisoned.insert(key.clone());
        }
        debug!(action = %action.key(), "action skipped");
        return ActionStatus::Skipped;
    }

    let instance = match action {
        Action::Delete { key } | Action::DetachDependency { source: key, .. } => {
            prev.instances.get(key).or_else(|| new.instances.get(key))
        }
        other => new.instances.get(other.key()).or_else(|| prev.instances.get(other.key())),
    };

    match action {
        Action::Create { .. } | Action::Update { .. } | Action::Delete { .. } => {
            let Some(instance) = instance else {
                return ActionStatus::Failed {
                    message: format!("instance {} not present in either state", action.key()),
                };
            };
            dispatch_with_retry(action, instance, clusters, drivers, cfg).await
        }
        // graph-side bookkeeping, no driver involved
        _ => ActionStatus::Success,
    }
}

fn depends_on_poisoned(
    key: &InstanceKey,
    state: &DesiredState,
    poisoned: &BTreeSet<InstanceKey>,
) -> bool {
    if poisoned.contains(key) {
        return true;
    }
    let Some(instance) = state.instances.get(key) else {
        return false;
    };
    instance.edges_out.iter().any(|dep| depends_on_poisoned(dep, state, poisoned))
}

async fn dispatch_with_retry(
    action: &Action,
    instance: &ComponentInstance,
    clusters: &BTreeMap<String, Cluster>,
    drivers: &DriverRegistry,
    cfg: &EnforcerConfig,
) -> ActionStatus {
    let Some(cluster) = clusters.get(&instance.cluster) else {
        return ActionStatus::Failed {
            message: format!("cluster {} not found in policy", instance.cluster),
        };
    };
    let driver = match drivers.for_cluster(cluster) {
        Ok(d) => d,
        Err(e) => return ActionStatus::Failed { message: e.to_string() },
    };

    let started = std::time::Instant::now();
    let mut backoff: u64 = 1;
    let mut last_error = String::new();
    for attempt in 1..=cfg.max_attempts.max(1) {
        let call = driver.apply(action, instance);
        let result =
            match tokio::time::timeout(std::time::Duration::from_secs(cfg.driver_timeout_secs), call)
                .await
            {
                Ok(r) => r,
                Err(_) => Err(BallastError::Cancelled),
            };
        match result {
            Ok(()) => {
                histogram!("apply_action_ms", started.elapsed().as_secs_f64() * 1000.0);
                return ActionStatus::Success;
            }
            Err(BallastError::FatalDriver(message)) => {
                warn!(instance = %instance.key, error = %message, "fatal driver error");
                return ActionStatus::Failed { message };
            }
            Err(e) => {
                last_error = e.to_string();
                warn!(
                    instance = %instance.key,
                    attempt,
                    error = %last_error,
                    "driver call failed; backing off"
                );
                if attempt < cfg.max_attempts {
                    let dur = std::time::Duration::from_secs(backoff.min(cfg.backoff_max_secs));
                    histogram!("apply_backoff_ms", dur.as_millis() as f64);
                    tokio::time::sleep(dur).await;
                    backoff = (backoff * 2).min(cfg.backoff_max_secs).max(1);
                }
            }
        }
    }
    ActionStatus::Failed { message: last_error }
}

/// Ask each instance's driver for endpoints; keys without endpoints are
/// omitted. Used for the externally-visible endpoints query.
pub async fn collect_endpoints(
    state: &DesiredState,
    clusters: &BTreeMap<String, Cluster>,
    drivers: &DriverRegistry,
) -> BallastResult<BTreeMap<InstanceKey, Vec<String>>> {
    let mut out = BTreeMap::new();
    for (key, instance) in &state.instances {
        let Some(cluster) = clusters.get(&instance.cluster) else {
            continue;
        };
        let driver = drivers.for_cluster(cluster)?;
        let endpoints = driver.endpoints(instance).await?;
        if !endpoints.is_empty() {
            out.insert(key.clone(), endpoints);
        }
    }
    Ok(out)
}
