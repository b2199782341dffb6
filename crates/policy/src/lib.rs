//! Ballast policy: the in-memory typed object collection with validation
//! and ACL-scoped views.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use ballast_core::{BallastError, BallastResult, Generation, Storable};

pub mod acl;
pub mod expression;
pub mod lang;
mod validate;

pub use acl::PolicyView;
pub use expression::Criteria;
pub use lang::{
    AclActions, AclRule, Allocation, Claim, ClaimAction, Cluster, Code, Component, Context,
    Contract, LabelOperations, LabelSet, Role, Rule, RuleActions, Service, User, POLICY_TYPES,
};

/// Tagged union over the recognized policy kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyObject {
    Service(Service),
    Contract(Contract),
    Cluster(Cluster),
    Rule(Rule),
    AclRule(AclRule),
    Claim(Claim),
    User(User),
}

impl PolicyObject {
    /// Downcast a storable into the policy union; None for runtime kinds.
    pub fn from_storable(obj: &dyn Storable) -> Option<PolicyObject> {
        if let Some(o) = obj.downcast_ref::<Service>() {
            return Some(PolicyObject::Service(o.clone()));
        }
        if let Some(o) = obj.downcast_ref::<Contract>() {
            return Some(PolicyObject::Contract(o.clone()));
        }
        if let Some(o) = obj.downcast_ref::<Cluster>() {
            return Some(PolicyObject::Cluster(o.clone()));
        }
        if let Some(o) = obj.downcast_ref::<Rule>() {
            return Some(PolicyObject::Rule(o.clone()));
        }
        if let Some(o) = obj.downcast_ref::<AclRule>() {
            return Some(PolicyObject::AclRule(o.clone()));
        }
        if let Some(o) = obj.downcast_ref::<Claim>() {
            return Some(PolicyObject::Claim(o.clone()));
        }
        if let Some(o) = obj.downcast_ref::<User>() {
            return Some(PolicyObject::User(o.clone()));
        }
        None
    }

    pub fn as_storable(&self) -> &dyn Storable {
        match self {
            PolicyObject::Service(o) => o,
            PolicyObject::Contract(o) => o,
            PolicyObject::Cluster(o) => o,
            PolicyObject::Rule(o) => o,
            PolicyObject::AclRule(o) => o,
            PolicyObject::Claim(o) => o,
            PolicyObject::User(o) => o,
        }
    }

    pub fn into_storable(self) -> Box<dyn Storable> {
        match self {
            PolicyObject::Service(o) => Box::new(o),
            PolicyObject::Contract(o) => Box::new(o),
            PolicyObject::Cluster(o) => Box::new(o),
            PolicyObject::Rule(o) => Box::new(o),
            PolicyObject::AclRule(o) => Box::new(o),
            PolicyObject::Claim(o) => Box::new(o),
            PolicyObject::User(o) => Box::new(o),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.as_storable().type_info().kind
    }

    pub fn namespace(&self) -> &str {
        &self.as_storable().metadata().namespace
    }

    pub fn name(&self) -> &str {
        &self.as_storable().metadata().name
    }

    pub fn generation(&self) -> Generation {
        self.as_storable().metadata().generation
    }

    pub fn key(&self) -> String {
        self.as_storable().key()
    }
}

/// Resolve a possibly namespace-qualified reference ("name" or "ns/name").
pub fn split_ref<'a>(default_ns: &'a str, reference: &'a str) -> (&'a str, &'a str) {
    match reference.split_once('/') {
        Some((ns, name)) => (ns, name),
        None => (default_ns, reference),
    }
}

/// The policy container: namespace -> kind -> name -> object. Cloneable;
/// update handlers mutate a copy and swap it through the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Policy {
    objects: BTreeMap<String, BTreeMap<&'static str, BTreeMap<String, PolicyObject>>>,
}

impl Policy {
    pub fn new() -> Policy {
        Policy::default()
    }

    /// Insert an object. Re-adding the current generation is allowed
    /// (update replay); a conflicting generation is rejected.
    pub fn add_object(&mut self, obj: PolicyObject) -> BallastResult<()> {
        let ns = obj.namespace().to_string();
        let kind = obj.kind();
        let name = obj.name().to_string();
        let by_name = self.objects.entry(ns).or_default().entry(kind).or_default();
        if let Some(existing) = by_name.get(&name) {
            if existing.generation() != obj.generation() {
                return Err(BallastError::Malformed(format!(
                    "object {} already present at generation {}, refusing generation {}",
                    obj.key(),
                    existing.generation(),
                    obj.generation()
                )));
            }
        }
        by_name.insert(name, obj);
        Ok(())
    }

    /// Remove by identity; absent objects are ignored.
    pub fn remove_object(&mut self, kind: &str, name: &str, namespace: &str) {
        if let Some(by_kind) = self.objects.get_mut(namespace) {
            if let Some(by_name) = by_kind.get_mut(kind) {
                by_name.remove(name);
            }
        }
    }

    pub fn get_object(&self, kind: &str, name: &str, namespace: &str) -> Option<&PolicyObject> {
        self.objects.get(namespace)?.get(kind)?.get(name)
    }

    /// All objects in deterministic (namespace, kind, name) order.
    pub fn objects(&self) -> impl Iterator<Item = &PolicyObject> {
        self.objects
            .values()
            .flat_map(|by_kind| by_kind.values())
            .flat_map(|by_name| by_name.values())
    }

    pub fn len(&self) -> usize {
        self.objects().count()
    }

    pub fn is_empty(&self) -> bool {
        self.objects().next().is_none()
    }

    pub fn service(&self, default_ns: &str, reference: &str) -> Option<&Service> {
        let (ns, name) = split_ref(default_ns, reference);
        match self.get_object(lang::SERVICE_TYPE.kind, name, ns)? {
            PolicyObject::Service(s) => Some(s),
            _ => None,
        }
    }

    pub fn contract(&self, default_ns: &str, reference: &str) -> Option<&Contract> {
        let (ns, name) = split_ref(default_ns, reference);
        match self.get_object(lang::CONTRACT_TYPE.kind, name, ns)? {
            PolicyObject::Contract(c) => Some(c),
            _ => None,
        }
    }

    /// Cluster lookup: the object's namespace first, then the system one.
    pub fn cluster(&self, default_ns: &str, reference: &str) -> Option<&Cluster> {
        let (ns, name) = split_ref(default_ns, reference);
        let local = match self.get_object(lang::CLUSTER_TYPE.kind, name, ns) {
            Some(PolicyObject::Cluster(c)) => Some(c),
            _ => None,
        };
        local.or_else(|| match self.get_object(lang::CLUSTER_TYPE.kind, name, ballast_core::SYSTEM_NS)
        {
            Some(PolicyObject::Cluster(c)) => Some(c),
            _ => None,
        })
    }

    pub fn user(&self, name: &str) -> Option<&User> {
        self.objects().find_map(|o| match o {
            PolicyObject::User(u) if u.metadata.name == name => Some(u),
            _ => None,
        })
    }

    /// Claims in stable (namespace, name) order.
    pub fn claims(&self) -> Vec<&Claim> {
        self.objects
            .values()
            .filter_map(|by_kind| by_kind.get(lang::CLAIM_TYPE.kind))
            .flat_map(|by_name| by_name.values())
            .filter_map(|o| match o {
                PolicyObject::Claim(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn clusters(&self) -> Vec<&Cluster> {
        self.objects
            .values()
            .filter_map(|by_kind| by_kind.get(lang::CLUSTER_TYPE.kind))
            .flat_map(|by_name| by_name.values())
            .filter_map(|o| match o {
                PolicyObject::Cluster(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Global rules, weight order; ties broken by (namespace, name).
    pub fn rules_sorted(&self) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self
            .objects()
            .filter_map(|o| match o {
                PolicyObject::Rule(r) => Some(r),
                _ => None,
            })
            .collect();
        rules.sort_by(|a, b| {
            a.weight
                .cmp(&b.weight)
                .then_with(|| a.metadata.namespace.cmp(&b.metadata.namespace))
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        rules
    }

    /// ACL rules, weight order; ties broken by (namespace, name).
    pub fn acl_rules_sorted(&self) -> Vec<&AclRule> {
        let mut rules: Vec<&AclRule> = self
            .objects()
            .filter_map(|o| match o {
                PolicyObject::AclRule(r) => Some(r),
                _ => None,
            })
            .collect();
        rules.sort_by(|a, b| {
            a.weight
                .cmp(&b.weight)
                .then_with(|| a.metadata.namespace.cmp(&b.metadata.namespace))
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        rules
    }

    /// ACL-scoped view for a user; `manage_object` checks are read-only.
    pub fn view<'a>(&'a self, user: &'a User) -> PolicyView<'a> {
        PolicyView::new(self, user)
    }

    /// Referential integrity, rule-weight uniqueness, intra-service
    /// dependency cycles. Collects every offender before failing.
    pub fn validate(&self) -> BallastResult<()> {
        validate::validate(self)
    }
}
