//! Desired state: the resolved component instance graph for one policy
//! generation. Immutable once written; persisted through the codec, so every
//! collection is BTree-backed for deterministic serialization.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ballast_core::{BallastError, BallastResult, Generation, ValidationError};
use ballast_policy::{LabelSet, Policy};
use serde::{Deserialize, Serialize};

use crate::template;
use crate::ExternalData;

/// Deterministic identity of a resolved component instance: a readable
/// contract/context[/component] path plus a hash of the full ancestor chain
/// and cluster assignment.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct InstanceKey(pub String);

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute an instance key from the (contract key, context name) ancestor
/// chain, the component within the tail service (None for the root), and the
/// target cluster. Structurally identical chains collapse to the same key.
pub fn instance_key(
    chain: &[(String, String)],
    component: Option<&str>,
    cluster: &str,
) -> InstanceKey {
    let mut text = String::new();
    for (contract, context) in chain {
        text.push_str(contract);
        text.push(':');
        text.push_str(context);
        text.push('|');
    }
    if let Some(component) = component {
        text.push_str(component);
    }
    text.push('@');
    text.push_str(cluster);

    let hash = blake3::hash(text.as_bytes()).to_hex();
    let (tail_contract, tail_context) = chain.last().expect("instance chain is never empty");
    let readable = match component {
        Some(component) => format!("{}/{}/{}", tail_contract, tail_context, component),
        None => format!("{}/{}", tail_contract, tail_context),
    };
    InstanceKey(format!("{}#{}", readable, &hash[..12]))
}

/// Resolved code descriptor handed to a cluster driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeDescriptor {
    #[serde(rename = "type")]
    pub code_type: String,
    pub params: serde_json::Value,
}

/// One node of the instance graph. `edges_out` lists prerequisites: targets
/// must exist (and be created) before this instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentInstance {
    pub key: InstanceKey,
    /// Contract key "ns/name" this instance was resolved through.
    pub contract: String,
    pub context: String,
    /// Service key "ns/name" the allocation landed on.
    pub service: String,
    /// Component name within the service; empty for the root instance.
    pub component: String,
    /// Cluster key "ns/name".
    pub cluster: String,
    pub labels: LabelSet,
    pub params: serde_json::Value,
    pub code: Option<CodeDescriptor>,
    pub edges_out: BTreeSet<InstanceKey>,
    /// Claims whose resolution landed on this instance.
    pub claim_owners: BTreeSet<String>,
}

/// Outcome of resolving one claim. A claim maps to exactly zero or one
/// instance; the zero cases are explicit, never silent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ClaimResolution {
    Resolved { instance: InstanceKey },
    Denied { rule: String },
    NoMatchingContext { contract: String },
    Cycle { chain: String },
    Error { message: String },
}

/// The resolved desired state for one policy generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    pub policy_gen: Generation,
    pub instances: BTreeMap<InstanceKey, ComponentInstance>,
    pub claim_results: BTreeMap<String, ClaimResolution>,
}

impl DesiredState {
    pub fn new(policy_gen: Generation) -> DesiredState {
        DesiredState { policy_gen, ..DesiredState::default() }
    }

    pub fn instance(&self, key: &InstanceKey) -> Option<&ComponentInstance> {
        self.instances.get(key)
    }

    /// Check the resolved graph against the policy: cycles surface first,
    /// then cluster existence, ACL legality of every placement, full
    /// template substitution, and edge-target integrity.
    pub fn validate(&self, policy: &Policy, external: &dyn ExternalData) -> BallastResult<()> {
        for result in self.claim_results.values() {
            if let ClaimResolution::Cycle { chain } = result {
                return Err(BallastError::ResolutionCycle { chain: chain.clone() });
            }
        }

        let mut v = ValidationError::new();
        for (claim_key, result) in &self.claim_results {
            if let ClaimResolution::Error { message } = result {
                let (ns, rest) = claim_key.split_once('/').unwrap_or(("", claim_key));
                let name = rest.rsplit('/').next().unwrap_or(rest);
                v.push(ns, "claim", name, message.clone());
            }
        }

        for instance in self.instances.values() {
            // cluster keys are "ns/cluster/name"
            let Some((cluster_ns, cluster_name)) = split_object_key(&instance.cluster) else {
                v.push(
                    "",
                    "cluster",
                    &instance.cluster,
                    format!("instance {} carries a malformed cluster key", instance.key),
                );
                continue;
            };
            if policy.get_object("cluster", cluster_name, cluster_ns).is_none() {
                v.push(
                    cluster_ns,
                    "cluster",
                    cluster_name,
                    format!("instance {} targets an unknown cluster", instance.key),
                );
                continue;
            }
            for claim_key in &instance.claim_owners {
                if let Some(ClaimResolution::Resolved { .. }) = self.claim_results.get(claim_key) {
                    if let Some(user) = claim_user(policy, external, claim_key) {
                        if !policy.view(&user).can_use_cluster(cluster_ns) {
                            v.push(
                                cluster_ns,
                                "cluster",
                                cluster_name,
                                format!(
                                    "cluster is outside the acl scope of user {} (claim {})",
                                    user.metadata.name, claim_key
                                ),
                            );
                        }
                    }
                }
            }
            if template::has_unexpanded(&instance.params)
                || instance
                    .code
                    .as_ref()
                    .map(|c| template::has_unexpanded(&c.params))
                    .unwrap_or(false)
            {
                let (ns, _) = instance.service.split_once('/').unwrap_or(("", ""));
                v.push(
                    ns,
                    "service",
                    &instance.component,
                    format!("instance {} still carries unresolved templates", instance.key),
                );
            }
            for target in &instance.edges_out {
                if !self.instances.contains_key(target) {
                    v.push(
                        "",
                        "instance",
                        &instance.key.0,
                        format!("dependency edge targets missing instance {}", target),
                    );
                }
            }
        }
        v.into_result()
    }
}

/// Split an object key "ns/kind/name" into (ns, name).
fn split_object_key(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.splitn(3, '/');
    let ns = parts.next()?;
    let _kind = parts.next()?;
    let name = parts.next()?;
    Some((ns, name))
}

fn claim_user(
    policy: &Policy,
    external: &dyn ExternalData,
    claim_key: &str,
) -> Option<ballast_policy::User> {
    // claim_key is "ns/claim/name"
    let mut parts = claim_key.split('/');
    let ns = parts.next()?;
    let _kind = parts.next()?;
    let name = parts.next()?;
    match policy.get_object("claim", name, ns)? {
        ballast_policy::PolicyObject::Claim(c) => {
            external.user(&c.user).or_else(|| policy.user(&c.user).cloned())
        }
        _ => None,
    }
}
