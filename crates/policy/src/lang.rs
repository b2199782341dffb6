//! Policy entities: the typed objects operators submit.
//!
//! Every field is always serialized (no skip_serializing_if): round-trip
//! stability is what makes the store's generation density check reliable.

use std::collections::BTreeMap;

use ballast_core::{decode_as, impl_storable, Metadata, TypeInfo};
use serde::{Deserialize, Serialize};

use crate::expression::Criteria;

/// Label set attached to users, claims, clusters and carried through
/// resolution. BTreeMap keeps iteration deterministic.
pub type LabelSet = BTreeMap<String, String>;

/// Label mutations applied by rules and contexts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelOperations {
    #[serde(default)]
    pub set: LabelSet,
    #[serde(default)]
    pub remove: Vec<String>,
}

impl LabelOperations {
    pub fn apply(&self, labels: &mut LabelSet) {
        for (k, v) in &self.set {
            labels.insert(k.clone(), v.clone());
        }
        for k in &self.remove {
            labels.remove(k);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

/// Service: a set of components with dependencies among them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub components: Vec<Component>,
}

/// One node inside a service: either hosts code or composes another
/// contract (service-to-service edge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    #[serde(default)]
    pub code: Option<Code>,
    #[serde(default)]
    pub contract: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Values published to sibling components under `.Discovery.<name>`,
    /// template-expanded during resolution.
    #[serde(default)]
    pub discovery: serde_json::Value,
}

/// Opaque code descriptor handed to a cluster driver (e.g. a chart ref).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    #[serde(rename = "type")]
    pub code_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Contract: a named choice among contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub contexts: Vec<Context>,
}

/// One branch of a contract: predicate, allocation, parameter overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub name: String,
    #[serde(default)]
    pub criteria: Option<Criteria>,
    #[serde(rename = "change-labels", default)]
    pub change_labels: LabelOperations,
    pub allocation: Allocation,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub service: String,
}

/// Deployment target with a driver type and opaque driver config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(rename = "type")]
    pub cluster_type: String,
    #[serde(default)]
    pub labels: LabelSet,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Routing/claim rule, evaluated in weight order; first match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(flatten)]
    pub metadata: Metadata,
    pub weight: i64,
    #[serde(default)]
    pub criteria: Option<Criteria>,
    #[serde(default)]
    pub actions: RuleActions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleActions {
    /// Allow or deny the claim subtree being resolved.
    #[serde(default)]
    pub claim: Option<ClaimAction>,
    #[serde(rename = "change-labels", default)]
    pub change_labels: LabelOperations,
    /// Route the subtree to a specific cluster.
    #[serde(default)]
    pub cluster: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimAction {
    Allow,
    Deny,
}

/// ACL rule: grants roles over namespace lists to matching users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclRule {
    #[serde(flatten)]
    pub metadata: Metadata,
    pub weight: i64,
    #[serde(default)]
    pub criteria: Option<Criteria>,
    #[serde(default)]
    pub actions: AclActions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AclActions {
    /// Role -> namespaces it applies to ("*" grants every namespace).
    #[serde(rename = "add-role", default)]
    pub add_role: BTreeMap<Role, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    DomainAdmin,
    Operator,
    Consumer,
}

/// Claim: a consumer's demand for a contract instantiation.
/// (Historically also called a dependency.)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    #[serde(flatten)]
    pub metadata: Metadata,
    pub user: String,
    pub contract: String,
    #[serde(default)]
    pub labels: LabelSet,
}

/// Identity with labels; domain admins bypass namespace ACL checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(default)]
    pub labels: LabelSet,
    #[serde(rename = "domain-admin", default)]
    pub domain_admin: bool,
}

impl User {
    pub fn named(ns: &str, name: &str) -> User {
        User {
            metadata: Metadata::new(USER_TYPE.kind, ns, name),
            labels: LabelSet::new(),
            domain_admin: false,
        }
    }
}

pub static SERVICE_TYPE: TypeInfo = TypeInfo {
    kind: "service",
    versioned: true,
    indexed_fields: &[],
    decode: decode_as::<Service>,
};

pub static CONTRACT_TYPE: TypeInfo = TypeInfo {
    kind: "contract",
    versioned: true,
    indexed_fields: &[],
    decode: decode_as::<Contract>,
};

pub static CLUSTER_TYPE: TypeInfo = TypeInfo {
    kind: "cluster",
    versioned: true,
    indexed_fields: &[],
    decode: decode_as::<Cluster>,
};

pub static RULE_TYPE: TypeInfo = TypeInfo {
    kind: "rule",
    versioned: true,
    indexed_fields: &[],
    decode: decode_as::<Rule>,
};

pub static ACLRULE_TYPE: TypeInfo = TypeInfo {
    kind: "aclrule",
    versioned: true,
    indexed_fields: &[],
    decode: decode_as::<AclRule>,
};

pub static CLAIM_TYPE: TypeInfo = TypeInfo {
    kind: "claim",
    versioned: true,
    indexed_fields: &[],
    decode: decode_as::<Claim>,
};

pub static USER_TYPE: TypeInfo = TypeInfo {
    kind: "user",
    versioned: true,
    indexed_fields: &[],
    decode: decode_as::<User>,
};

impl_storable!(Service, SERVICE_TYPE);
impl_storable!(Contract, CONTRACT_TYPE);
impl_storable!(Cluster, CLUSTER_TYPE);
impl_storable!(Rule, RULE_TYPE);
impl_storable!(AclRule, ACLRULE_TYPE);
impl_storable!(Claim, CLAIM_TYPE);
impl_storable!(User, USER_TYPE);

/// Every policy-facing kind, in codec-registration order.
pub static POLICY_TYPES: &[&TypeInfo] = &[
    &SERVICE_TYPE,
    &CONTRACT_TYPE,
    &CLUSTER_TYPE,
    &RULE_TYPE,
    &ACLRULE_TYPE,
    &CLAIM_TYPE,
    &USER_TYPE,
];
