//! Ballast diff: compares two desired states and emits a dependency-ordered
//! action plan.
//!
//! Ordering guarantees: creates come out in topological order of the union
//! graph (prerequisites first), deletes in reverse topological order of the
//! previous state (dependents first), ties broken lexicographically on
//! instance key so the same pair of states always yields the same plan.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use ballast_resolve::{ComponentInstance, DesiredState, InstanceKey};
use serde::{Deserialize, Serialize};

/// One lifecycle action over an instance key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Action {
    Create { key: InstanceKey },
    Update { key: InstanceKey },
    Delete { key: InstanceKey },
    AttachDependency { source: InstanceKey, target: InstanceKey },
    DetachDependency { source: InstanceKey, target: InstanceKey },
    UpdateComponentTimes { key: InstanceKey },
}

impl Action {
    /// The instance this action applies to (the source, for edge actions).
    pub fn key(&self) -> &InstanceKey {
        match self {
            Action::Create { key }
            | Action::Update { key }
            | Action::Delete { key }
            | Action::UpdateComponentTimes { key } => key,
            Action::AttachDependency { source, .. } | Action::DetachDependency { source, .. } => {
                source
            }
        }
    }

    fn render(&self) -> String {
        match self {
            Action::Create { key } => format!("create  {}", key),
            Action::Update { key } => format!("update  {}", key),
            Action::Delete { key } => format!("delete  {}", key),
            Action::AttachDependency { source, target } => {
                format!("attach  {} -> {}", source, target)
            }
            Action::DetachDependency { source, target } => {
                format!("detach  {} -> {}", source, target)
            }
            Action::UpdateComponentTimes { key } => format!("times   {}", key),
        }
    }
}

/// Ordered action sequence produced by one diff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub actions: Vec<Action>,
}

impl ActionPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// True when nothing structural changes (time bookkeeping aside).
    pub fn is_noop(&self) -> bool {
        self.actions
            .iter()
            .all(|a| matches!(a, Action::UpdateComponentTimes { .. }))
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Stable, deterministic rendering used for noop previews.
    pub fn as_text(&self) -> String {
        let mut out = String::new();
        if self.is_empty() {
            out.push_str("(no changes)\n");
            return out;
        }
        for action in &self.actions {
            out.push_str(&action.render());
            out.push('\n');
        }
        out
    }
}

/// Compare two desired states. Equal states produce a completely empty plan;
/// any structural change additionally emits `UpdateComponentTimes` for every
/// instance surviving in the new state.
pub fn diff(new: &DesiredState, prev: &DesiredState) -> ActionPlan {
    let new_keys: BTreeSet<&InstanceKey> = new.instances.keys().collect();
    let prev_keys: BTreeSet<&InstanceKey> = prev.instances.keys().collect();

    let created: BTreeSet<&InstanceKey> = new_keys.difference(&prev_keys).copied().collect();
    let deleted: BTreeSet<&InstanceKey> = prev_keys.difference(&new_keys).copied().collect();

    let new_inbound = inbound_edges(new);
    let prev_inbound = inbound_edges(prev);
    let mut updated: BTreeSet<&InstanceKey> = BTreeSet::new();
    for key in new_keys.intersection(&prev_keys) {
        let a = &new.instances[*key];
        let b = &prev.instances[*key];
        let inbound_changed = new_inbound.get(*key) != prev_inbound.get(*key);
        if a.params != b.params
            || a.code != b.code
            || a.cluster != b.cluster
            || a.edges_out != b.edges_out
            || inbound_changed
        {
            updated.insert(*key);
        }
    }

    if created.is_empty() && deleted.is_empty() && updated.is_empty() {
        return ActionPlan::default();
    }

    let mut actions = Vec::new();

    // creates in topological order of the union graph, prerequisites first
    for key in topo_order(new, prev) {
        if created.contains(&key) {
            actions.push(Action::Create { key: key.clone() });
            for target in &new.instances[&key].edges_out {
                actions.push(Action::AttachDependency {
                    source: key.clone(),
                    target: target.clone(),
                });
            }
        }
    }

    // updates in key order; structural edge changes produce attach/detach
    for key in &updated {
        actions.push(Action::Update { key: (*key).clone() });
        let new_edges = &new.instances[*key].edges_out;
        let prev_edges = &prev.instances[*key].edges_out;
        for target in new_edges.difference(prev_edges) {
            actions.push(Action::AttachDependency {
                source: (*key).clone(),
                target: target.clone(),
            });
        }
        for target in prev_edges.difference(new_edges) {
            actions.push(Action::DetachDependency {
                source: (*key).clone(),
                target: target.clone(),
            });
        }
    }

    // deletes in reverse topological order of prev: dependents first
    let prev_order = topo_order(prev, prev);
    for key in prev_order.into_iter().rev() {
        if deleted.contains(&key) {
            for target in &prev.instances[&key].edges_out {
                actions.push(Action::DetachDependency {
                    source: key.clone(),
                    target: target.clone(),
                });
            }
            actions.push(Action::Delete { key });
        }
    }

    // time bookkeeping for every surviving instance
    for key in new.instances.keys() {
        actions.push(Action::UpdateComponentTimes { key: key.clone() });
    }

    ActionPlan { actions }
}

fn inbound_edges(state: &DesiredState) -> BTreeMap<InstanceKey, BTreeSet<InstanceKey>> {
    let mut inbound: BTreeMap<InstanceKey, BTreeSet<InstanceKey>> = BTreeMap::new();
    for instance in state.instances.values() {
        for target in &instance.edges_out {
            inbound.entry(target.clone()).or_default().insert(instance.key.clone());
        }
    }
    inbound
}

/// Kahn's algorithm over the union of both instance graphs. The ready
/// frontier is a BTreeSet, so ties break lexicographically.
fn topo_order(a: &DesiredState, b: &DesiredState) -> Vec<InstanceKey> {
    let mut edges: BTreeMap<&InstanceKey, BTreeSet<&InstanceKey>> = BTreeMap::new();
    for state in [a, b] {
        for instance in state.instances.values() {
            let entry = edges.entry(&instance.key).or_default();
            for target in &instance.edges_out {
                entry.insert(target);
            }
        }
    }
    // only count prerequisites that exist in the union
    let nodes: BTreeSet<&InstanceKey> = edges.keys().copied().collect();
    let mut pending: BTreeMap<&InstanceKey, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&InstanceKey, Vec<&InstanceKey>> = BTreeMap::new();
    for (key, targets) in &edges {
        let live: Vec<&InstanceKey> =
            targets.iter().copied().filter(|t| nodes.contains(*t)).collect();
        pending.insert(*key, live.len());
        for target in live {
            dependents.entry(target).or_default().push(*key);
        }
    }

    let mut ready: BTreeSet<&InstanceKey> = pending
        .iter()
        .filter_map(|(k, n)| if *n == 0 { Some(*k) } else { None })
        .collect();
    let mut out = Vec::with_capacity(nodes.len());
    while let Some(key) = ready.iter().next().copied() {
        ready.remove(key);
        out.push(key.clone());
        if let Some(deps) = dependents.get(key) {
            for dep in deps {
                let n = pending.get_mut(*dep).expect("dependent is a node");
                *n -= 1;
                if *n == 0 {
                    ready.insert(*dep);
                }
            }
        }
    }
    // cycles cannot occur in validated states; leftovers are appended in key
    // order so the plan stays total
    if out.len() < nodes.len() {
        for key in nodes {
            if !out.contains(key) {
                out.push(key.clone());
            }
        }
    }
    out
}

/// Interpret a plan over the instance graph: the model used to check that
/// applying `diff(new, prev)` on top of `prev` reproduces `new`.
pub fn apply_model(plan: &ActionPlan, prev: &DesiredState, new: &DesiredState) -> DesiredState {
    let mut out = prev.clone();
    out.policy_gen = new.policy_gen;
    out.claim_results = new.claim_results.clone();
    for action in &plan.actions {
        match action {
            Action::Create { key } | Action::Update { key } => {
                let mut instance: ComponentInstance = new.instances[key].clone();
                // edges arrive through attach actions
                if matches!(action, Action::Create { .. }) {
                    instance.edges_out = BTreeSet::new();
                }
                out.instances.insert(key.clone(), instance);
            }
            Action::Delete { key } => {
                out.instances.remove(key);
            }
            Action::AttachDependency { source, target } => {
                if let Some(instance) = out.instances.get_mut(source) {
                    instance.edges_out.insert(target.clone());
                }
            }
            Action::DetachDependency { source, target } => {
                if let Some(instance) = out.instances.get_mut(source) {
                    instance.edges_out.remove(target);
                }
            }
            Action::UpdateComponentTimes { .. } => {}
        }
    }
    out
}
