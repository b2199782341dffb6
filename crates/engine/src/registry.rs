//! Registry: persistence façade over the object store for policies,
//! revisions and desired states.
//!
//! Layouts beyond `/object` + `/index`:
//!   /policy/<gen>                       marshaled PolicyData snapshot
//!   /revision/<policy_gen>/<rev_gen>    marshaled DesiredState
//! The snapshot under `/policy/<gen>` mirrors the PolicyData object kept in
//! the generational store; the object is the transactional source of truth,
//! the mirror is the stable read layout.

use std::collections::BTreeMap;

use ballast_core::{object_key, BallastError, BallastResult, Generation, SYSTEM_NS};
use ballast_diff::ActionPlan;
use ballast_policy::{Cluster, Policy, PolicyObject};
use ballast_resolve::{DesiredState, InstanceKey};
use ballast_store::{FindOpts, ObjectStore, SaveOpts};
use chrono::Utc;
use tracing::{debug, info};

use crate::objects::{
    ComponentTimes, PolicyData, Revision, COMPONENT_TIMES_TYPE, POLICY_DATA_TYPE, REVISION_TYPE,
};

const POLICY_KEY: &str = "system/policy/policy";
const REVISION_KEY: &str = "system/revision/revision";

pub struct Registry {
    store: ObjectStore,
}

impl Registry {
    pub fn new(store: ObjectStore) -> Registry {
        Registry { store }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Policy snapshot at a generation (0 = latest). None when no policy has
    /// ever been saved.
    pub fn get_policy_data(&self, gen: Generation) -> BallastResult<Option<PolicyData>> {
        self.store
            .find_one_as(POLICY_DATA_TYPE.kind, FindOpts::by_key(POLICY_KEY).gen(gen))
    }

    /// Materialize the policy container for a snapshot generation.
    pub fn get_policy(&self, gen: Generation) -> BallastResult<(Policy, Generation)> {
        let Some(data) = self.get_policy_data(gen)? else {
            return Ok((Policy::new(), Generation::EMPTY));
        };
        let mut policy = Policy::new();
        for (ns, by_kind) in &data.objects {
            for (kind, by_name) in by_kind {
                for (name, obj_gen) in by_name {
                    let key = object_key(ns, kind, name);
                    let obj = self
                        .store
                        .find_one(kind, FindOpts::by_key(&key).gen(*obj_gen))?
                        .ok_or_else(|| {
                            BallastError::Malformed(format!(
                                "policy snapshot {} references missing object {}@{}",
                                data.generation(),
                                key,
                                obj_gen
                            ))
                        })?;
                    let obj = PolicyObject::from_storable(obj.as_ref()).ok_or_else(|| {
                        BallastError::ShapeMismatch(format!(
                            "object {} is not a policy kind",
                            key
                        ))
                    })?;
                    policy.add_object(obj)?;
                }
            }
        }
        Ok((policy, data.generation()))
    }

    /// Persist submitted objects and, if anything actually changed, write a
    /// new policy snapshot. Returns (changed, snapshot).
    pub fn update_policy(&self, objects: &[PolicyObject]) -> BallastResult<(bool, PolicyData)> {
        let mut data = self
            .get_policy_data(Generation::EMPTY)?
            .unwrap_or_else(PolicyData::empty);
        let mut changed = false;
        for obj in objects {
            let mut storable = obj.clone().into_storable();
            let object_changed = self.store.save(storable.as_mut(), SaveOpts::default())?;
            changed = changed || object_changed;
            let md = storable.metadata().clone();
            let recorded = data
                .objects
                .get(&md.namespace)
                .and_then(|k| k.get(&md.kind))
                .and_then(|n| n.get(&md.name))
                .copied();
            if recorded != Some(md.generation) {
                changed = true;
            }
            data.record(&md.namespace, &md.kind, &md.name, md.generation);
        }
        if changed {
            data = self.save_policy_data(data)?;
        }
        Ok((changed, data))
    }

    /// Drop objects from the snapshot. History stays in the store; only the
    /// new snapshot forgets them.
    pub fn delete_from_policy(
        &self,
        objects: &[PolicyObject],
    ) -> BallastResult<(bool, PolicyData)> {
        let mut data = self
            .get_policy_data(Generation::EMPTY)?
            .unwrap_or_else(PolicyData::empty);
        let mut changed = false;
        for obj in objects {
            let storable = obj.as_storable();
            let md = storable.metadata();
            if data.remove(&md.namespace, &md.kind, &md.name) {
                changed = true;
            }
        }
        if changed {
            data = self.save_policy_data(data)?;
        }
        Ok((changed, data))
    }

    fn save_policy_data(&self, mut data: PolicyData) -> BallastResult<PolicyData> {
        data.metadata.generation = Generation::EMPTY;
        data.created_at = Utc::now();
        self.store.save(&mut data, SaveOpts::default())?;
        // mirror the snapshot at its stable read path
        let bytes = self.store.codec().marshal(&data)?;
        self.store.put_raw(&format!("/policy/{}", data.generation()), &bytes)?;
        info!(gen = %data.generation(), "policy snapshot saved");
        Ok(data)
    }

    /// Create the next revision for a policy generation, persisting the
    /// desired state blob alongside it.
    pub fn new_revision(
        &self,
        policy_gen: Generation,
        desired: &DesiredState,
        plan: ActionPlan,
    ) -> BallastResult<Revision> {
        let mut revision = Revision::new(policy_gen, plan);
        self.store.save(&mut revision, SaveOpts::default())?;
        let path = format!("/revision/{}/{}", policy_gen, revision.generation());
        self.store.put_raw(&path, &marshal_desired(desired)?)?;
        info!(policy_gen = %policy_gen, rev = %revision.generation(), "revision created");
        Ok(revision)
    }

    /// Overwrite a revision in place (progress/status updates).
    pub fn update_revision(&self, revision: &mut Revision) -> BallastResult<()> {
        self.store.save(revision, SaveOpts::replace())?;
        Ok(())
    }

    pub fn get_revision(&self, gen: Generation) -> BallastResult<Option<Revision>> {
        self.store.find_one_as(REVISION_TYPE.kind, FindOpts::by_key(REVISION_KEY).gen(gen))
    }

    /// Highest-generation revision created for a policy generation.
    pub fn get_last_revision(&self, policy_gen: Generation) -> BallastResult<Option<Revision>> {
        self.store.find_one_as(
            REVISION_TYPE.kind,
            FindOpts::by_field(
                REVISION_KEY,
                "policy_gen",
                serde_json::json!(policy_gen.as_u64()),
            )
            .last(),
        )
    }

    pub fn get_desired_state(&self, revision: &Revision) -> BallastResult<Option<DesiredState>> {
        let path = format!("/revision/{}/{}", revision.policy_gen, revision.generation());
        match self.store.get_raw(&path)? {
            Some(bytes) => unmarshal_desired(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Update first/last-seen for an instance (first write pins first_seen).
    pub fn record_component_times(&self, instance: &InstanceKey) -> BallastResult<()> {
        let name = ComponentTimes::name_for(&instance.0);
        let key = object_key(SYSTEM_NS, COMPONENT_TIMES_TYPE.kind, &name);
        let now = Utc::now();
        let mut times: ComponentTimes = match self
            .store
            .find_one_as(COMPONENT_TIMES_TYPE.kind, FindOpts::by_key(&key))?
        {
            Some(existing) => existing,
            None => ComponentTimes {
                metadata: ballast_core::Metadata::new(COMPONENT_TIMES_TYPE.kind, SYSTEM_NS, &name),
                instance: instance.0.clone(),
                first_seen: now,
                last_seen: now,
            },
        };
        times.last_seen = now;
        self.store.save(&mut times, SaveOpts::default())?;
        debug!(instance = %instance, "component times recorded");
        Ok(())
    }

    pub fn component_times(&self, instance: &InstanceKey) -> BallastResult<Option<ComponentTimes>> {
        let name = ComponentTimes::name_for(&instance.0);
        let key = object_key(SYSTEM_NS, COMPONENT_TIMES_TYPE.kind, &name);
        self.store.find_one_as(COMPONENT_TIMES_TYPE.kind, FindOpts::by_key(&key))
    }

    /// Cluster objects of a policy keyed the way instances reference them.
    pub fn cluster_map(policy: &Policy) -> BTreeMap<String, Cluster> {
        policy
            .clusters()
            .into_iter()
            .map(|c| {
                (object_key(&c.metadata.namespace, "cluster", &c.metadata.name), c.clone())
            })
            .collect()
    }
}

fn marshal_desired(desired: &DesiredState) -> BallastResult<Vec<u8>> {
    let value = serde_json::to_value(desired)
        .map_err(|e| BallastError::Malformed(format!("encoding desired state: {}", e)))?;
    serde_yaml::to_string(&value)
        .map(String::into_bytes)
        .map_err(|e| BallastError::Malformed(format!("rendering desired state: {}", e)))
}

fn unmarshal_desired(bytes: &[u8]) -> BallastResult<DesiredState> {
    let value: serde_yaml::Value = serde_yaml::from_slice(bytes)
        .map_err(|e| BallastError::Malformed(format!("parsing desired state: {}", e)))?;
    let json = serde_json::to_value(value)
        .map_err(|e| BallastError::Malformed(format!("normalizing desired state: {}", e)))?;
    serde_json::from_value(json)
        .map_err(|e| BallastError::Malformed(format!("decoding desired state: {}", e)))
}
