//! Runtime objects: policy snapshots, revisions, component times.

use std::collections::BTreeMap;

use ballast_apply::ActionStatus;
use ballast_core::{
    decode_as, impl_storable, Generation, Metadata, TypeInfo, Types, SYSTEM_NS,
};
use ballast_diff::ActionPlan;
use ballast_policy::POLICY_TYPES;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Snapshot of which object generations make up one policy generation.
/// The snapshot's own generation *is* the policy generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyData {
    #[serde(flatten)]
    pub metadata: Metadata,
    /// namespace -> kind -> name -> generation
    pub objects: BTreeMap<String, BTreeMap<String, BTreeMap<String, Generation>>>,
    pub created_at: DateTime<Utc>,
}

impl PolicyData {
    pub fn empty() -> PolicyData {
        PolicyData {
            metadata: Metadata::new(POLICY_DATA_TYPE.kind, SYSTEM_NS, "policy"),
            objects: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn generation(&self) -> Generation {
        self.metadata.generation
    }

    pub fn record(&mut self, namespace: &str, kind: &str, name: &str, gen: Generation) {
        self.objects
            .entry(namespace.to_string())
            .or_default()
            .entry(kind.to_string())
            .or_default()
            .insert(name.to_string(), gen);
    }

    pub fn remove(&mut self, namespace: &str, kind: &str, name: &str) -> bool {
        self.objects
            .get_mut(namespace)
            .and_then(|by_kind| by_kind.get_mut(kind))
            .map(|by_name| by_name.remove(name).is_some())
            .unwrap_or(false)
    }
}

pub static POLICY_DATA_TYPE: TypeInfo = TypeInfo {
    kind: "policy",
    versioned: true,
    indexed_fields: &[],
    decode: decode_as::<PolicyData>,
};

impl_storable!(PolicyData, POLICY_DATA_TYPE);

/// Per-action enforcement progress recorded on a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ActionProgress {
    Pending,
    Success,
    Failed { message: String },
    Skipped,
}

impl From<&ActionStatus> for ActionProgress {
    fn from(status: &ActionStatus) -> ActionProgress {
        match status {
            ActionStatus::Success => ActionProgress::Success,
            ActionStatus::Failed { message } => {
                ActionProgress::Failed { message: message.clone() }
            }
            ActionStatus::Skipped => ActionProgress::Skipped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevisionStatus {
    InProgress,
    Completed,
    Error,
}

/// One enforcement unit: the plan computed for a policy generation plus its
/// per-action progress. All revisions share one key; the revision generation
/// is globally monotonic, and a listgen index on `policy_gen` answers "last
/// revision for this policy".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    #[serde(flatten)]
    pub metadata: Metadata,
    pub policy_gen: Generation,
    pub status: RevisionStatus,
    pub plan: ActionPlan,
    pub progress: Vec<ActionProgress>,
    pub created_at: DateTime<Utc>,
}

impl Revision {
    pub fn new(policy_gen: Generation, plan: ActionPlan) -> Revision {
        let progress = vec![ActionProgress::Pending; plan.len()];
        Revision {
            metadata: Metadata::new(REVISION_TYPE.kind, SYSTEM_NS, "revision"),
            policy_gen,
            status: RevisionStatus::InProgress,
            plan,
            progress,
            created_at: Utc::now(),
        }
    }

    pub fn generation(&self) -> Generation {
        self.metadata.generation
    }
}

pub static REVISION_TYPE: TypeInfo = TypeInfo {
    kind: "revision",
    versioned: true,
    indexed_fields: &["policy_gen"],
    decode: decode_as::<Revision>,
};

impl_storable!(Revision, REVISION_TYPE, {
    "policy_gen" => |o: &Revision| Some(serde_json::json!(o.policy_gen.as_u64())),
});

/// First/last-seen bookkeeping for a component instance, maintained by the
/// enforcement loop so the registry can report uptime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentTimes {
    #[serde(flatten)]
    pub metadata: Metadata,
    pub instance: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ComponentTimes {
    /// Instance keys contain '/'; flatten them so they stay a single path
    /// segment of the storage key.
    pub fn name_for(instance: &str) -> String {
        instance.replace('/', ".")
    }
}

pub static COMPONENT_TIMES_TYPE: TypeInfo = TypeInfo {
    kind: "component-times",
    versioned: false,
    indexed_fields: &[],
    decode: decode_as::<ComponentTimes>,
};

impl_storable!(ComponentTimes, COMPONENT_TIMES_TYPE);

static RUNTIME_TYPES: &[&TypeInfo] =
    &[&POLICY_DATA_TYPE, &REVISION_TYPE, &COMPONENT_TIMES_TYPE];

static ALL_TYPES: Lazy<Types> = Lazy::new(|| {
    let mut infos: Vec<&'static TypeInfo> = POLICY_TYPES.to_vec();
    infos.extend_from_slice(RUNTIME_TYPES);
    Types::new(&infos)
});

/// The full kind catalog: policy kinds plus runtime kinds.
pub fn all_types() -> &'static Types {
    &ALL_TYPES
}
