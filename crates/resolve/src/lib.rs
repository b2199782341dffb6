//! Ballast resolver: expands claims into a component instance graph by
//! walking contracts, matching contexts, applying rules and expanding
//! parameter templates.
//!
//! The resolver is deterministic: claims are processed in (namespace, name)
//! order, contexts and components in declared order, rules in weight order,
//! and every collection in the output is BTree-backed.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use ballast_core::{object_key, BallastError, BallastResult, Generation};
use ballast_policy::{
    Claim, ClaimAction, Cluster, LabelSet, Policy, User,
};
use serde_json::json;
use tracing::debug;

pub mod event;
pub mod state;
pub mod template;

pub use event::{EventEntry, EventLevel, EventLog};
pub use state::{
    instance_key, ClaimResolution, CodeDescriptor, ComponentInstance, DesiredState, InstanceKey,
};

/// External facts the policy does not carry: user identities/labels and
/// cluster health.
pub trait ExternalData: Send + Sync {
    fn user(&self, name: &str) -> Option<User>;

    fn cluster_healthy(&self, _cluster: &Cluster) -> bool {
        true
    }
}

/// Fixed snapshot of external data, the common case for tests and for
/// resolution over a consistent view.
#[derive(Debug, Clone, Default)]
pub struct StaticExternalData {
    pub users: BTreeMap<String, User>,
    pub unhealthy_clusters: BTreeSet<String>,
}

impl StaticExternalData {
    pub fn with_users(users: impl IntoIterator<Item = User>) -> StaticExternalData {
        StaticExternalData {
            users: users.into_iter().map(|u| (u.metadata.name.clone(), u)).collect(),
            unhealthy_clusters: BTreeSet::new(),
        }
    }
}

impl ExternalData for StaticExternalData {
    fn user(&self, name: &str) -> Option<User> {
        self.users.get(name).cloned()
    }

    fn cluster_healthy(&self, cluster: &Cluster) -> bool {
        !self.unhealthy_clusters.contains(&cluster.metadata.name)
    }
}

/// Per-claim resolution context carried down the contract descent.
struct ClaimCtx<'a> {
    claim_key: String,
    user: &'a User,
    chain: Vec<(String, String)>,
    buffer: BTreeMap<InstanceKey, ComponentInstance>,
}

/// One-shot resolver over a validated policy plus an external snapshot.
pub struct Resolver<'a> {
    policy: &'a Policy,
    external: &'a dyn ExternalData,
}

impl<'a> Resolver<'a> {
    pub fn new(policy: &'a Policy, external: &'a dyn ExternalData) -> Resolver<'a> {
        Resolver { policy, external }
    }

    /// Resolve every claim, in stable order, recording one result per claim.
    /// Individual claim failures never abort the whole resolution.
    pub fn resolve_all(&self, policy_gen: Generation, log: &mut EventLog) -> DesiredState {
        let mut state = DesiredState::new(policy_gen);
        for claim in self.policy.claims() {
            let claim_key =
                object_key(&claim.metadata.namespace, "claim", &claim.metadata.name);
            log.debug(&claim_key, "resolving claim");
            let result = match self.resolve_claim(claim, &claim_key, &mut state, log) {
                Ok(instance) => ClaimResolution::Resolved { instance },
                Err(BallastError::Denied { rule, .. }) => {
                    log.warn(&claim_key, format!("denied by rule {}", rule));
                    ClaimResolution::Denied { rule }
                }
                Err(BallastError::NoMatchingContext { contract, .. }) => {
                    log.warn(&claim_key, format!("no matching context in {}", contract));
                    ClaimResolution::NoMatchingContext { contract }
                }
                Err(BallastError::ResolutionCycle { chain }) => {
                    log.error(&claim_key, format!("resolution cycle: {}", chain));
                    ClaimResolution::Cycle { chain }
                }
                Err(other) => {
                    log.error(&claim_key, other.to_string());
                    ClaimResolution::Error { message: other.to_string() }
                }
            };
            state.claim_results.insert(claim_key, result);
        }
        debug!(
            instances = state.instances.len(),
            claims = state.claim_results.len(),
            "resolution finished"
        );
        state
    }

    fn resolve_claim(
        &self,
        claim: &Claim,
        claim_key: &str,
        state: &mut DesiredState,
        log: &mut EventLog,
    ) -> BallastResult<InstanceKey> {
        let user = self
            .external
            .user(&claim.user)
            .or_else(|| self.policy.user(&claim.user).cloned())
            .ok_or_else(|| BallastError::NotFound(format!("user {}", claim.user)))?;

        // merged label set: user labels, overridden by claim labels
        let mut labels = user.labels.clone();
        for (k, v) in &claim.labels {
            labels.insert(k.clone(), v.clone());
        }

        let mut ctx = ClaimCtx {
            claim_key: claim_key.to_string(),
            user: &user,
            chain: Vec::new(),
            buffer: BTreeMap::new(),
        };
        let root =
            self.resolve_contract(&claim.metadata.namespace, &claim.contract, labels, &mut ctx, log)?;

        // merge the claim's buffer into the shared state
        use std::collections::btree_map::Entry;
        for (key, instance) in ctx.buffer {
            match state.instances.entry(key) {
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    if existing.params != instance.params || existing.code != instance.code {
                        return Err(BallastError::Malformed(format!(
                            "conflicting parameters for shared instance {}",
                            instance.key
                        )));
                    }
                    existing.claim_owners.extend(instance.claim_owners);
                    existing.edges_out.extend(instance.edges_out);
                }
                Entry::Vacant(slot) => {
                    slot.insert(instance);
                }
            }
        }
        Ok(root)
    }

    fn resolve_contract(
        &self,
        default_ns: &str,
        contract_ref: &str,
        mut labels: LabelSet,
        ctx: &mut ClaimCtx<'_>,
        log: &mut EventLog,
    ) -> BallastResult<InstanceKey> {
        let contract = self
            .policy
            .contract(default_ns, contract_ref)
            .ok_or_else(|| BallastError::NotFound(format!("contract {}", contract_ref)))?;
        let contract_ns = contract.metadata.namespace.clone();
        let contract_key = object_key(&contract_ns, "contract", &contract.metadata.name);

        // context matching: declared order, first predicate match wins
        let mut chosen = None;
        for context in &contract.contexts {
            let matches = match &context.criteria {
                Some(criteria) => criteria.matches(&labels)?,
                None => true,
            };
            if matches {
                chosen = Some(context);
                break;
            }
        }
        let context = chosen.ok_or_else(|| BallastError::NoMatchingContext {
            contract: contract_key.clone(),
            claim: ctx.claim_key.clone(),
        })?;
        log.info(&contract_key, format!("context-chosen: {}", context.name));

        // cycle protection: re-entering a (contract, context) pair on the
        // same descent chain aborts
        if ctx.chain.iter().any(|(c, x)| *c == contract_key && *x == context.name) {
            let mut parts: Vec<String> =
                ctx.chain.iter().map(|(c, x)| format!("{}:{}", c, x)).collect();
            parts.push(format!("{}:{}", contract_key, context.name));
            return Err(BallastError::ResolutionCycle { chain: parts.join(" -> ") });
        }

        // global rules, weight order; first matching rule per namespace wins
        let mut cluster_override: Option<String> = None;
        let mut seen_ns: BTreeSet<&str> = BTreeSet::new();
        for rule in self.policy.rules_sorted() {
            let rule_ns = rule.metadata.namespace.as_str();
            if seen_ns.contains(rule_ns) {
                continue;
            }
            let matches = match &rule.criteria {
                Some(criteria) => criteria.matches(&labels)?,
                None => true,
            };
            if !matches {
                continue;
            }
            seen_ns.insert(rule_ns);
            let rule_key = object_key(rule_ns, "rule", &rule.metadata.name);
            log.debug(&rule_key, format!("rule matched while resolving {}", contract_key));
            if rule.actions.claim == Some(ClaimAction::Deny) {
                return Err(BallastError::Denied {
                    rule: rule_key,
                    subject: contract_key.clone(),
                });
            }
            rule.actions.change_labels.apply(&mut labels);
            if let Some(cluster) = &rule.actions.cluster {
                cluster_override = Some(cluster.clone());
            }
        }

        context.change_labels.apply(&mut labels);

        // cluster assignment: rule override first, then the cluster label
        let cluster_ref = cluster_override
            .or_else(|| labels.get("cluster").cloned())
            .ok_or_else(|| {
                BallastError::Malformed(format!(
                    "no cluster assigned while resolving {}",
                    contract_key
                ))
            })?;
        let cluster = self
            .policy
            .cluster(&contract_ns, &cluster_ref)
            .ok_or_else(|| BallastError::NotFound(format!("cluster {}", cluster_ref)))?;
        if !self.external.cluster_healthy(cluster) {
            return Err(BallastError::Malformed(format!(
                "cluster {} reported unhealthy",
                cluster.metadata.name
            )));
        }
        let cluster_key =
            object_key(&cluster.metadata.namespace, "cluster", &cluster.metadata.name);

        let service = self
            .policy
            .service(&contract_ns, &context.allocation.service)
            .ok_or_else(|| {
                BallastError::NotFound(format!("service {}", context.allocation.service))
            })?;
        let service_ns = service.metadata.namespace.clone();
        let service_key = object_key(&service_ns, "service", &service.metadata.name);

        ctx.chain.push((contract_key.clone(), context.name.clone()));
        let result = self.instantiate_service(
            contract_key.clone(),
            context,
            service,
            &service_key,
            &service_ns,
            &cluster_key,
            labels,
            ctx,
            log,
        );
        ctx.chain.pop();
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn instantiate_service(
        &self,
        contract_key: String,
        context: &ballast_policy::Context,
        service: &ballast_policy::Service,
        service_key: &str,
        service_ns: &str,
        cluster_key: &str,
        labels: LabelSet,
        ctx: &mut ClaimCtx<'_>,
        log: &mut EventLog,
    ) -> BallastResult<InstanceKey> {
        let root_key = instance_key(&ctx.chain, None, cluster_key);
        if ctx.buffer.contains_key(&root_key) {
            log.debug(&root_key.0, "instance shared");
            return Ok(root_key);
        }

        let base_scope = json!({
            "User": {
                "Name": ctx.user.metadata.name.clone(),
                "Labels": ctx.user.labels.clone(),
            },
            "Labels": labels.clone(),
            "Target": { "Namespace": service_ns, "Cluster": cluster_key },
        });
        let scope_with = |discovery: &serde_json::Map<String, serde_json::Value>| {
            let mut s = base_scope.clone();
            s.as_object_mut()
                .unwrap()
                .insert("Discovery".into(), serde_json::Value::Object(discovery.clone()));
            s
        };

        let mut discovery = serde_json::Map::new();
        let params =
            template::expand_value(&context.params, &scope_with(&discovery), &contract_key)?;
        if !context.params.is_null() {
            log.debug(&contract_key, format!("params expanded for context {}", context.name));
        }

        let mut name_to_key: BTreeMap<&str, InstanceKey> = BTreeMap::new();
        for component in &service.components {
            let comp_key = instance_key(&ctx.chain, Some(&component.name), cluster_key);
            let site = format!("{}/{}", service_key, component.name);
            let mut edges: BTreeSet<InstanceKey> = component
                .dependencies
                .iter()
                .filter_map(|dep| name_to_key.get(dep.as_str()).cloned())
                .collect();

            let code = match (&component.code, &component.contract) {
                (Some(code), _) => {
                    let scope = scope_with(&discovery);
                    Some(CodeDescriptor {
                        code_type: code.code_type.clone(),
                        params: template::expand_value(&code.params, &scope, &site)?,
                    })
                }
                (None, Some(sub_contract)) => {
                    let sub_root =
                        self.resolve_contract(service_ns, sub_contract, labels.clone(), ctx, log)?;
                    edges.insert(sub_root);
                    None
                }
                (None, None) => None,
            };

            // publish this component's discovery values to later siblings
            if !component.discovery.is_null() {
                let mut scope = scope_with(&discovery);
                scope
                    .as_object_mut()
                    .unwrap()
                    .insert("Instance".into(), json!(comp_key.0.clone()));
                let expanded = template::expand_value(&component.discovery, &scope, &site)?;
                discovery.insert(component.name.clone(), expanded);
            }

            ctx.buffer.insert(
                comp_key.clone(),
                ComponentInstance {
                    key: comp_key.clone(),
                    contract: contract_key.clone(),
                    context: context.name.clone(),
                    service: service_key.to_string(),
                    component: component.name.clone(),
                    cluster: cluster_key.to_string(),
                    labels: labels.clone(),
                    params: serde_json::Value::Null,
                    code,
                    edges_out: edges,
                    claim_owners: [ctx.claim_key.clone()].into(),
                },
            );
            log.debug(&comp_key.0, "instance created");
            name_to_key.insert(component.name.as_str(), comp_key);
        }

        let root = ComponentInstance {
            key: root_key.clone(),
            contract: contract_key,
            context: context.name.clone(),
            service: service_key.to_string(),
            component: String::new(),
            cluster: cluster_key.to_string(),
            labels,
            params,
            code: None,
            edges_out: name_to_key.into_values().collect(),
            claim_owners: [ctx.claim_key.clone()].into(),
        };
        log.debug(&root.key.0, "instance created");
        ctx.buffer.insert(root_key.clone(), root);
        Ok(root_key)
    }
}
