//! Whole-policy validation: referential integrity, rule-weight uniqueness
//! within a namespace, and intra-service dependency cycles. Every offender
//! is collected before the policy is rejected.

use std::collections::{BTreeMap, HashMap, HashSet};

use ballast_core::{BallastResult, ValidationError};

use crate::lang::{Component, Service};
use crate::{Policy, PolicyObject};

pub fn validate(policy: &Policy) -> BallastResult<()> {
    let mut v = ValidationError::new();

    for obj in policy.objects() {
        match obj {
            PolicyObject::Claim(claim) => {
                let md = &claim.metadata;
                if claim.user.is_empty() {
                    v.push(&md.namespace, &md.kind, &md.name, "claim has no user");
                }
                if policy.contract(&md.namespace, &claim.contract).is_none() {
                    v.push(
                        &md.namespace,
                        &md.kind,
                        &md.name,
                        format!("referenced contract {} does not exist", claim.contract),
                    );
                }
            }
            PolicyObject::Contract(contract) => {
                let md = &contract.metadata;
                let mut seen = HashSet::new();
                for ctx in &contract.contexts {
                    if !seen.insert(ctx.name.as_str()) {
                        v.push(
                            &md.namespace,
                            &md.kind,
                            &md.name,
                            format!("duplicate context {}", ctx.name),
                        );
                    }
                    if let Some(criteria) = &ctx.criteria {
                        if let Err(e) = criteria.check() {
                            v.push(
                                &md.namespace,
                                &md.kind,
                                &md.name,
                                format!("context {}: {}", ctx.name, e),
                            );
                        }
                    }
                    if policy.service(&md.namespace, &ctx.allocation.service).is_none() {
                        v.push(
                            &md.namespace,
                            &md.kind,
                            &md.name,
                            format!(
                                "context {} allocates unknown service {}",
                                ctx.name, ctx.allocation.service
                            ),
                        );
                    }
                }
            }
            PolicyObject::Service(service) => validate_service(policy, service, &mut v),
            PolicyObject::Rule(rule) => {
                let md = &rule.metadata;
                if let Some(criteria) = &rule.criteria {
                    if let Err(e) = criteria.check() {
                        v.push(&md.namespace, &md.kind, &md.name, e.to_string());
                    }
                }
                if let Some(cluster) = &rule.actions.cluster {
                    if policy.cluster(&md.namespace, cluster).is_none() {
                        v.push(
                            &md.namespace,
                            &md.kind,
                            &md.name,
                            format!("routes to unknown cluster {}", cluster),
                        );
                    }
                }
            }
            PolicyObject::AclRule(rule) => {
                let md = &rule.metadata;
                if let Some(criteria) = &rule.criteria {
                    if let Err(e) = criteria.check() {
                        v.push(&md.namespace, &md.kind, &md.name, e.to_string());
                    }
                }
            }
            PolicyObject::Cluster(cluster) => {
                let md = &cluster.metadata;
                if cluster.cluster_type.is_empty() {
                    v.push(&md.namespace, &md.kind, &md.name, "cluster has no driver type");
                }
            }
            PolicyObject::User(_) => {}
        }
    }

    check_weight_uniqueness(policy, &mut v);

    v.into_result()
}

fn validate_service(policy: &Policy, service: &Service, v: &mut ValidationError) {
    let md = &service.metadata;
    let mut names = HashSet::new();
    for component in &service.components {
        if !names.insert(component.name.as_str()) {
            v.push(
                &md.namespace,
                &md.kind,
                &md.name,
                format!("duplicate component {}", component.name),
            );
        }
        match (&component.code, &component.contract) {
            (Some(_), Some(_)) => v.push(
                &md.namespace,
                &md.kind,
                &md.name,
                format!("component {} has both code and a contract reference", component.name),
            ),
            (None, None) => v.push(
                &md.namespace,
                &md.kind,
                &md.name,
                format!("component {} has neither code nor a contract reference", component.name),
            ),
            (None, Some(contract)) => {
                if policy.contract(&md.namespace, contract).is_none() {
                    v.push(
                        &md.namespace,
                        &md.kind,
                        &md.name,
                        format!(
                            "component {} references unknown contract {}",
                            component.name, contract
                        ),
                    );
                }
            }
            (Some(_), None) => {}
        }
    }
    let by_name: HashMap<&str, &Component> =
        service.components.iter().map(|c| (c.name.as_str(), c)).collect();
    for component in &service.components {
        for dep in &component.dependencies {
            if !by_name.contains_key(dep.as_str()) {
                v.push(
                    &md.namespace,
                    &md.kind,
                    &md.name,
                    format!("component {} depends on unknown component {}", component.name, dep),
                );
            }
        }
    }
    if let Some(cycle) = find_component_cycle(&by_name) {
        v.push(
            &md.namespace,
            &md.kind,
            &md.name,
            format!("component dependency cycle: {}", cycle.join(" -> ")),
        );
    }
}

/// DFS cycle detection over a service's component dependency graph.
fn find_component_cycle(by_name: &HashMap<&str, &Component>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a Component>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(name) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(name.to_string());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(name, Mark::Visiting);
        stack.push(name);
        if let Some(component) = by_name.get(name) {
            for dep in &component.dependencies {
                if by_name.contains_key(dep.as_str()) {
                    if let Some(cycle) = visit(dep.as_str(), by_name, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
        stack.pop();
        marks.insert(name, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut names: Vec<&str> = by_name.keys().copied().collect();
    names.sort_unstable();
    for name in names {
        let mut stack = Vec::new();
        if let Some(cycle) = visit(name, by_name, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn check_weight_uniqueness(policy: &Policy, v: &mut ValidationError) {
    let mut rule_weights: BTreeMap<(&str, i64), Vec<&str>> = BTreeMap::new();
    let mut acl_weights: BTreeMap<(&str, i64), Vec<&str>> = BTreeMap::new();
    for obj in policy.objects() {
        match obj {
            PolicyObject::Rule(r) => rule_weights
                .entry((r.metadata.namespace.as_str(), r.weight))
                .or_default()
                .push(&r.metadata.name),
            PolicyObject::AclRule(r) => acl_weights
                .entry((r.metadata.namespace.as_str(), r.weight))
                .or_default()
                .push(&r.metadata.name),
            _ => {}
        }
    }
    for (kind, weights) in [("rule", rule_weights), ("aclrule", acl_weights)] {
        for ((ns, weight), names) in weights {
            if names.len() > 1 {
                for name in names {
                    v.push(ns, kind, name, format!("duplicate {} weight {}", kind, weight));
                }
            }
        }
    }
}
